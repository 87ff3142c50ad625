//! Request handler modules.
//!
//! A module binds numeric command ids to async handlers when it is built and
//! may claim unbound commands through [`Module::filter_request`]. Each worker
//! keeps its active modules in a [`ModuleRegistry`], which routes requests and
//! swaps in fresh module instances on reload.

pub mod registry;
pub mod test_module;

pub use registry::{CatalogueLoader, ModuleFactory, ModuleInstance, ModuleLoader, ModuleRegistry};

use crate::backend::Multiplexer;
use crate::error::{KimError, Result, code};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cmd: u32,
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub body: Value,
}

impl Request {
    pub fn new(cmd: u32, body: Value) -> Self {
        Self { cmd, seq: 0, body }
    }
}

/// Reply to a [`Request`]. The response command id is the request's plus one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub cmd: u32,
    pub seq: u32,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl Response {
    pub fn ok(req: &Request, body: Value) -> Self {
        Self {
            cmd: req.cmd.wrapping_add(1),
            seq: req.seq,
            code: code::OK,
            body,
        }
    }

    pub fn error(req: &Request, err: &KimError) -> Self {
        Self {
            cmd: req.cmd.wrapping_add(1),
            seq: req.seq,
            code: err.code(),
            body: serde_json::json!({ "error": err.to_string() }),
        }
    }

    /// Reply to input that could not be decoded as a [`Request`].
    pub fn rejected(err: &KimError) -> Self {
        Self {
            cmd: 0,
            seq: 0,
            code: err.code(),
            body: serde_json::json!({ "error": err.to_string() }),
        }
    }

    pub fn from_result(req: &Request, result: Result<Value>) -> Self {
        match result {
            Ok(body) => Self::ok(req, body),
            Err(e) => Self::error(req, &e),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }
}

/// The worker a request is being served in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub index: usize,
    pub name: String,
}

/// Collaborators handed to every handler invocation.
#[derive(Clone)]
pub struct RequestContext {
    pub worker: Rc<WorkerIdentity>,
    /// Name of the module serving the request.
    pub module: String,
    /// Version of the serving module instance.
    pub module_seq: u64,
    pub mux: Multiplexer,
}

/// Future returned by handlers. Handlers run on the worker's local task set,
/// so it need not be `Send`.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>>>>;

/// A bound command handler.
pub type Handler = Rc<dyn Fn(RequestContext, Request) -> HandlerFuture>;

/// Command id to handler bindings of one module instance.
#[derive(Default)]
pub struct CommandTable {
    handlers: HashMap<u32, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `cmd` to `handler`. Binding the same id again replaces the earlier handler.
    pub fn register<F, Fut>(&mut self, cmd: u32, handler: F)
    where
        F: Fn(RequestContext, Request) -> Fut + 'static,
        Fut: Future<Output = Result<Value>> + 'static,
    {
        self.handlers
            .insert(cmd, Rc::new(move |ctx, req| Box::pin(handler(ctx, req))));
    }

    /// Bind `cmd` to a method of `module`.
    pub fn bind<M, Fut>(
        &mut self,
        cmd: u32,
        module: &Rc<M>,
        method: fn(Rc<M>, RequestContext, Request) -> Fut,
    ) where
        M: 'static,
        Fut: Future<Output = Result<Value>> + 'static,
    {
        let module = module.clone();
        self.register(cmd, move |ctx, req| method(module.clone(), ctx, req));
    }

    pub fn get(&self, cmd: u32) -> Option<Handler> {
        self.handlers.get(&cmd).cloned()
    }

    pub fn contains(&self, cmd: u32) -> bool {
        self.handlers.contains_key(&cmd)
    }

    /// Bound command ids in ascending order.
    pub fn commands(&self) -> Vec<u32> {
        let mut cmds: Vec<u32> = self.handlers.keys().copied().collect();
        cmds.sort_unstable();
        cmds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A unit of request handlers that can be replaced while the worker runs.
pub trait Module {
    /// Bind this module's commands.
    fn register_handlers(self: Rc<Self>, table: &mut CommandTable);

    /// Called for commands no active module has bound.
    ///
    /// Return [`KimError::UnknownCommand`] to pass the request on.
    fn filter_request(self: Rc<Self>, ctx: RequestContext, req: Request) -> HandlerFuture {
        let _ = ctx;
        Box::pin(async move { Err(KimError::UnknownCommand(req.cmd)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_codes() {
        let req = Request {
            cmd: 1001,
            seq: 7,
            body: Value::Null,
        };
        let ok = Response::ok(&req, json!({ "message": "hi" }));
        assert_eq!(ok.cmd, 1002);
        assert_eq!(ok.seq, 7);
        assert!(ok.is_ok());

        let err = Response::error(&req, &KimError::UnknownCommand(1001));
        assert_eq!(err.code, code::UNKNOWN_CMD);
        assert!(!err.is_ok());
        assert!(err.body["error"].as_str().unwrap().contains("1001"));
    }

    #[test]
    fn test_request_wire_defaults() {
        let req: Request = serde_json::from_str(r#"{ "cmd": 1005 }"#).unwrap();
        assert_eq!(req.seq, 0);
        assert!(req.body.is_null());

        let line = serde_json::to_string(&Response::ok(&req, Value::Null)).unwrap();
        assert!(!line.contains("body"));
    }

    #[tokio::test]
    async fn test_command_table_last_registration_wins() {
        let mut table = CommandTable::new();
        table.register(1, |_, _| async { Ok(json!("first")) });
        table.register(2, |_, _| async { Ok(json!("other")) });
        table.register(1, |_, _| async { Ok(json!("second")) });
        assert_eq!(table.len(), 2);
        assert_eq!(table.commands(), vec![1, 2]);
        assert!(!table.contains(3));

        let ctx = RequestContext {
            worker: Rc::new(WorkerIdentity {
                index: 1,
                name: "kim_w_1".into(),
            }),
            module: "m".into(),
            module_seq: 1,
            mux: Multiplexer::with_resp(Vec::new(), Default::default()),
        };
        let handler = table.get(1).unwrap();
        let out = handler(ctx, Request::new(1, Value::Null)).await.unwrap();
        assert_eq!(out, json!("second"));
    }
}
