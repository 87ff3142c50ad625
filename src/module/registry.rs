//! Per-worker module registry and request dispatch.
//!
//! The registry owns the route table (command id to module instance). Loading
//! or reloading a module builds a complete new instance first and only then
//! replaces the old one's routes in a single step, so a request is always
//! served entirely by one version. Dispatches already running keep their
//! instance alive until they finish.

use super::{CommandTable, Module, Request, RequestContext, Response, WorkerIdentity, test_module};
use crate::backend::Multiplexer;
use crate::config::{Config, ModuleConfig};
use crate::error::{KimError, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Builds a module from its configuration entry.
pub type ModuleFactory = fn(&ModuleConfig) -> Result<Rc<dyn Module>>;

/// Modules this binary can construct, by name.
const CATALOGUE: &[(&str, ModuleFactory)] = &[(test_module::NAME, test_module::build)];

/// Look up a module constructor by name.
pub fn factory(name: &str) -> Option<ModuleFactory> {
    CATALOGUE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, f)| *f)
}

/// Names every constructible module.
pub fn catalogue_names() -> Vec<&'static str> {
    CATALOGUE.iter().map(|(n, _)| *n).collect()
}

/// Source of fresh module instances.
pub trait ModuleLoader {
    /// Modules to load at startup, in fallback order.
    fn configured(&self) -> Result<Vec<String>>;

    /// Construct a new instance of `name`.
    fn load(&self, name: &str) -> Result<Rc<dyn Module>>;
}

/// Loads modules from the static catalogue, re-reading the configuration
/// file each time so reloaded modules see their current settings.
pub struct CatalogueLoader {
    config_path: PathBuf,
}

impl CatalogueLoader {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }
}

impl ModuleLoader for CatalogueLoader {
    fn configured(&self) -> Result<Vec<String>> {
        let config = Config::load(&self.config_path)?;
        Ok(config.modules.into_iter().map(|m| m.name).collect())
    }

    fn load(&self, name: &str) -> Result<Rc<dyn Module>> {
        let config = Config::load(&self.config_path)?;
        let entry = config
            .module(name)
            .ok_or_else(|| KimError::ModuleNotFound(name.to_string()))?;
        let build = factory(name).ok_or_else(|| KimError::ModuleLoad {
            name: name.to_string(),
            message: "no such module in this build".into(),
        })?;
        build(entry)
    }
}

/// One loaded version of a module.
pub struct ModuleInstance {
    /// Stable for the module's name across reloads.
    pub id: u64,
    pub name: String,
    /// Registry-wide version counter, new on every load.
    pub seq: u64,
    module: Rc<dyn Module>,
    table: CommandTable,
}

impl ModuleInstance {
    pub fn commands(&self) -> Vec<u32> {
        self.table.commands()
    }
}

/// Active modules of one worker.
pub struct ModuleRegistry {
    worker: Rc<WorkerIdentity>,
    mux: Multiplexer,
    loader: Box<dyn ModuleLoader>,
    /// In load order; fallback filters run in this order.
    modules: RefCell<Vec<Rc<ModuleInstance>>>,
    routes: RefCell<HashMap<u32, Rc<ModuleInstance>>>,
    ids: RefCell<HashMap<String, u64>>,
    seq: Cell<u64>,
}

impl ModuleRegistry {
    pub fn new(worker: WorkerIdentity, mux: Multiplexer, loader: Box<dyn ModuleLoader>) -> Self {
        Self {
            worker: Rc::new(worker),
            mux,
            loader,
            modules: RefCell::new(Vec::new()),
            routes: RefCell::new(HashMap::new()),
            ids: RefCell::new(HashMap::new()),
            seq: Cell::new(0),
        }
    }

    pub fn worker(&self) -> &WorkerIdentity {
        &self.worker
    }

    /// Backend multiplexer shared by every module of this worker.
    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    /// Load every configured module. Stops at the first failure.
    pub fn load_all(&self) -> Result<usize> {
        let names = self.loader.configured()?;
        for name in &names {
            self.load(name)?;
        }
        Ok(names.len())
    }

    /// Load a module that is not active yet.
    pub fn load(&self, name: &str) -> Result<Rc<ModuleInstance>> {
        if self.get(name).is_some() {
            return Err(KimError::ModuleCollision {
                name: name.to_string(),
                existing: name.to_string(),
            });
        }
        self.install(name)
    }

    /// Replace an active module with a freshly constructed instance.
    ///
    /// On failure the previous instance stays active with all its routes.
    pub fn reload(&self, name: &str) -> Result<Rc<ModuleInstance>> {
        let Some(previous) = self.get(name) else {
            return Err(KimError::ModuleNotFound(name.to_string()));
        };
        match self.install(name) {
            Ok(instance) => {
                info!(
                    module = %name,
                    old_seq = previous.seq,
                    seq = instance.seq,
                    "module reloaded"
                );
                Ok(instance)
            }
            Err(e) => {
                warn!(module = %name, seq = previous.seq, error = %e, "reload failed, keeping active version");
                Err(e)
            }
        }
    }

    /// Reload every active module, reporting each outcome.
    pub fn reload_all(&self) -> Vec<(String, Result<Rc<ModuleInstance>>)> {
        self.names()
            .into_iter()
            .map(|name| {
                let result = self.reload(&name);
                (name, result)
            })
            .collect()
    }

    fn install(&self, name: &str) -> Result<Rc<ModuleInstance>> {
        let module = self.loader.load(name).map_err(|e| match e {
            KimError::ModuleLoad { .. } | KimError::ModuleNotFound(_) => e,
            other => KimError::ModuleLoad {
                name: name.to_string(),
                message: other.to_string(),
            },
        })?;

        let mut table = CommandTable::new();
        module.clone().register_handlers(&mut table);

        {
            let routes = self.routes.borrow();
            for cmd in table.commands() {
                if let Some(owner) = routes.get(&cmd)
                    && owner.name != name
                {
                    return Err(KimError::CommandConflict {
                        cmd,
                        name: name.to_string(),
                        owner: owner.name.clone(),
                    });
                }
            }
        }

        let instance = Rc::new(ModuleInstance {
            id: self.module_id(name),
            name: name.to_string(),
            seq: self.next_seq(),
            module,
            table,
        });

        // Swap: no await between here and the end, so no request observes a mix.
        {
            let mut modules = self.modules.borrow_mut();
            match modules.iter().position(|m| m.name == name) {
                Some(i) => modules[i] = instance.clone(),
                None => modules.push(instance.clone()),
            }
        }
        {
            let mut routes = self.routes.borrow_mut();
            routes.retain(|_, m| m.name != name);
            for cmd in instance.table.commands() {
                routes.insert(cmd, instance.clone());
            }
        }

        info!(
            worker_index = self.worker.index,
            module = %name,
            id = instance.id,
            seq = instance.seq,
            commands = instance.table.len(),
            "module loaded"
        );
        Ok(instance)
    }

    fn module_id(&self, name: &str) -> u64 {
        let mut ids = self.ids.borrow_mut();
        let next = ids.len() as u64 + 1;
        *ids.entry(name.to_string()).or_insert(next)
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get() + 1;
        self.seq.set(seq);
        seq
    }

    /// Active instance of `name`.
    pub fn get(&self, name: &str) -> Option<Rc<ModuleInstance>> {
        self.modules.borrow().iter().find(|m| m.name == name).cloned()
    }

    /// Active module names in load order.
    pub fn names(&self) -> Vec<String> {
        self.modules.borrow().iter().map(|m| m.name.clone()).collect()
    }

    /// Module instance currently routing `cmd`.
    pub fn route(&self, cmd: u32) -> Option<Rc<ModuleInstance>> {
        self.routes.borrow().get(&cmd).cloned()
    }

    fn context(&self, instance: &ModuleInstance) -> RequestContext {
        RequestContext {
            worker: self.worker.clone(),
            module: instance.name.clone(),
            module_seq: instance.seq,
            mux: self.mux.clone(),
        }
    }

    /// Run `req` through its bound handler, or through each module's filter
    /// in load order until one claims it.
    pub async fn dispatch(&self, req: Request) -> Result<serde_json::Value> {
        if let Some(instance) = self.route(req.cmd)
            && let Some(handler) = instance.table.get(req.cmd)
        {
            let ctx = self.context(&instance);
            return handler(ctx, req).await;
        }

        let modules: Vec<Rc<ModuleInstance>> = self.modules.borrow().clone();
        for instance in modules {
            let ctx = self.context(&instance);
            match instance.module.clone().filter_request(ctx, req.clone()).await {
                Err(KimError::UnknownCommand(_)) => continue,
                other => return other,
            }
        }
        Err(KimError::UnknownCommand(req.cmd))
    }

    /// Dispatch and wrap the outcome in a [`Response`].
    pub async fn handle(&self, req: Request) -> Response {
        let cmd = req.cmd;
        let seq = req.seq;
        let echo = Request {
            cmd,
            seq,
            body: serde_json::Value::Null,
        };
        let result = self.dispatch(req).await;
        if let Err(e) = &result {
            debug!(cmd, seq, error = %e, "request failed");
        }
        Response::from_result(&echo, result)
    }
}
