//! Built-in `test` module: a greeting and a backend round trip.

use super::{CommandTable, Module, Request, RequestContext};
use crate::backend::{Command, Reply};
use crate::config::ModuleConfig;
use crate::error::{KimError, Result};
use serde_json::{Value, json};
use std::rc::Rc;

pub const NAME: &str = "test";

pub const CMD_HELLO: u32 = 1001;
pub const CMD_BACKEND: u32 = 1005;

const DEFAULT_BACKEND: &str = "cache";
const DEFAULT_GREETING: &str = "hello";

pub struct TestModule {
    backend: String,
    greeting: String,
}

/// Catalogue constructor.
pub fn build(config: &ModuleConfig) -> Result<Rc<dyn Module>> {
    let setting = |key: &str, default: &str| -> Result<String> {
        match config.settings.get(key) {
            None => Ok(default.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(KimError::ModuleLoad {
                name: NAME.to_string(),
                message: format!("'{}' must be a string, got {}", key, other),
            }),
        }
    };
    Ok(Rc::new(TestModule {
        backend: setting("backend", DEFAULT_BACKEND)?,
        greeting: setting("greeting", DEFAULT_GREETING)?,
    }))
}

impl Module for TestModule {
    fn register_handlers(self: Rc<Self>, table: &mut CommandTable) {
        table.bind(CMD_HELLO, &self, TestModule::hello);
        table.bind(CMD_BACKEND, &self, TestModule::backend_round_trip);
    }
}

impl TestModule {
    async fn hello(self: Rc<Self>, ctx: RequestContext, req: Request) -> Result<Value> {
        Ok(json!({
            "message": format!("{} from {}", self.greeting, ctx.worker.name),
            "worker_index": ctx.worker.index,
            "module_seq": ctx.module_seq,
            "echo": req.body,
        }))
    }

    /// `SET key value` then `GET key` on the configured backend.
    async fn backend_round_trip(self: Rc<Self>, ctx: RequestContext, req: Request) -> Result<Value> {
        let key = req
            .body
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| KimError::InvalidParams("missing string field 'key'".into()))?;
        let value = req
            .body
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or("hello");

        let set = ctx
            .mux
            .submit(&self.backend, Command::new("SET").arg(key).arg(value))
            .await?;
        if let Reply::Error(e) = &set {
            return Err(KimError::Protocol(format!("backend rejected SET: {}", e)));
        }
        let got = ctx
            .mux
            .submit(&self.backend, Command::new("GET").arg(key))
            .await?;

        Ok(json!({ "key": key, "value": got.to_json() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendTarget, Connector, Multiplexer, MuxSettings, Transport};
    use crate::module::{ModuleLoader, ModuleRegistry, WorkerIdentity};
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use tokio::task::LocalSet;

    /// In-memory key-value backend.
    #[derive(Default)]
    struct MemoryStore(Rc<RefCell<HashMap<Vec<u8>, Vec<u8>>>>);

    struct MemoryTransport(Rc<RefCell<HashMap<Vec<u8>, Vec<u8>>>>);

    #[async_trait(?Send)]
    impl Connector for MemoryStore {
        async fn connect(&self, _target: &BackendTarget) -> Result<Box<dyn Transport>> {
            Ok(Box::new(MemoryTransport(self.0.clone())))
        }
    }

    #[async_trait(?Send)]
    impl Transport for MemoryTransport {
        async fn execute(&mut self, command: &Command) -> Result<Reply> {
            let args = command.args();
            match (command.name().as_str(), args.len()) {
                ("SET", 3) => {
                    self.0.borrow_mut().insert(args[1].clone(), args[2].clone());
                    Ok(Reply::Status("OK".into()))
                }
                ("GET", 2) => Ok(Reply::Bulk(self.0.borrow().get(&args[1]).cloned())),
                _ => Ok(Reply::Error("ERR unknown command".into())),
            }
        }
    }

    struct Fixed(ModuleConfig);

    impl ModuleLoader for Fixed {
        fn configured(&self) -> Result<Vec<String>> {
            Ok(vec![self.0.name.clone()])
        }

        fn load(&self, _name: &str) -> Result<Rc<dyn Module>> {
            build(&self.0)
        }
    }

    fn module_config(settings: Value) -> ModuleConfig {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), json!(NAME));
        if let Value::Object(extra) = settings {
            map.extend(extra);
        }
        serde_json::from_value(Value::Object(map)).unwrap()
    }

    fn registry(settings: Value) -> ModuleRegistry {
        let target = BackendTarget {
            name: "cache".into(),
            host: "127.0.0.1".into(),
            port: 6379,
            max_conn_cnt: 2,
        };
        let mux = Multiplexer::new(
            vec![target],
            MuxSettings::default(),
            Rc::new(MemoryStore::default()),
        );
        let worker = WorkerIdentity {
            index: 2,
            name: "kim_w_2".into(),
        };
        let reg = ModuleRegistry::new(worker, mux, Box::new(Fixed(module_config(settings))));
        reg.load_all().unwrap();
        reg
    }

    #[tokio::test]
    async fn test_hello() {
        let reg = registry(json!({ "greeting": "hi" }));
        let rsp = reg
            .handle(Request::new(CMD_HELLO, json!({ "n": 1 })))
            .await;
        assert!(rsp.is_ok());
        assert_eq!(rsp.cmd, CMD_HELLO + 1);
        assert_eq!(rsp.body["message"], "hi from kim_w_2");
        assert_eq!(rsp.body["worker_index"], 2);
        assert_eq!(rsp.body["echo"], json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_backend_round_trip() {
        LocalSet::new()
            .run_until(async {
                let reg = registry(json!({}));
                let out = reg
                    .dispatch(Request::new(
                        CMD_BACKEND,
                        json!({ "key": "greeting", "value": "world" }),
                    ))
                    .await
                    .unwrap();
                assert_eq!(out, json!({ "key": "greeting", "value": "world" }));
            })
            .await;
    }

    #[tokio::test]
    async fn test_backend_requires_key() {
        let reg = registry(json!({}));
        let err = reg
            .dispatch(Request::new(CMD_BACKEND, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, KimError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_backend_target() {
        LocalSet::new()
            .run_until(async {
                let reg = registry(json!({ "backend": "sessions" }));
                let rsp = reg
                    .handle(Request::new(CMD_BACKEND, json!({ "key": "k" })))
                    .await;
                assert_eq!(rsp.code, crate::error::code::CAN_NOT_FIND_NODE);
            })
            .await;
    }

    #[test]
    fn test_build_rejects_non_string_setting() {
        let err = build(&module_config(json!({ "backend": 5 }))).err().unwrap();
        assert!(matches!(err, KimError::ModuleLoad { .. }));
    }
}
