//! Worker process main entry point.
//!
//! This module runs when `kim worker --init <json>` is invoked by the manager.
//! The worker loads its modules, reports ready on the control channel and then
//! serves requests from the data channel until the manager asks it to stop or
//! goes away.

use super::channel::{Endpoints, LineReader, LineWriter};
use super::protocol::{ControlMessage, WorkerEvent};
use super::signals::ignore_sigpipe;
use super::spawn::{EXIT_CHILD, EXIT_CHILD_ERROR, EXIT_CHILD_INIT_FAIL, WorkerInit};
use crate::backend::Multiplexer;
use crate::config::Config;
use crate::error::{KimError, Result};
use crate::logging::{self, LogConfig};
use crate::module::{CatalogueLoader, ModuleRegistry, Request, Response, WorkerIdentity};
use nix::errno::Errno;
use nix::sys::socket::{SockType, getsockopt, sockopt};
use std::os::fd::BorrowedFd;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

/// How long a stopping worker waits for in-flight responses to be written.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Run the worker process main function.
///
/// Never returns: exits with [`EXIT_CHILD`] after a requested shutdown,
/// [`EXIT_CHILD_INIT_FAIL`] if initialisation failed and [`EXIT_CHILD_ERROR`]
/// if serving failed.
pub fn run_worker_main(config_path: &Path, init: WorkerInit) -> ! {
    ignore_sigpipe();

    // Adopted before the runtime opens descriptors of its own.
    let channels = match adopt_channels(&init) {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("{}: initialisation failed: {}", init.name, e);
            std::process::exit(EXIT_CHILD_INIT_FAIL);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{}: cannot start runtime: {}", init.name, e);
            std::process::exit(EXIT_CHILD_INIT_FAIL);
        }
    };

    let local = LocalSet::new();
    let code = local.block_on(&runtime, async move {
        let (registry, control, data) = match start(config_path, &init, channels) {
            Ok(parts) => parts,
            Err(e) => {
                error!(worker_index = init.index, error = %e, "worker initialisation failed");
                eprintln!("{}: initialisation failed: {}", init.name, e);
                return EXIT_CHILD_INIT_FAIL;
            }
        };
        match serve(control, data, registry).await {
            Ok(()) => EXIT_CHILD,
            Err(e) => {
                error!(worker_index = init.index, error = %e, "worker stopped on error");
                EXIT_CHILD_ERROR
            }
        }
    });
    std::process::exit(code)
}

/// Load configuration, set up logging, register the channels and load modules.
fn start(
    config_path: &Path,
    init: &WorkerInit,
    channels: Endpoints,
) -> Result<(Rc<ModuleRegistry>, UnixStream, UnixStream)> {
    let config = Config::load(config_path)?;

    let mut log = LogConfig::for_worker(&config, &init.work_dir, init.index).with_env_overrides();
    if let Ok(path) = std::env::var("KIM_LOG_FILE") {
        log = log.with_file(logging::worker_log_file(Path::new(&path), init.index));
    }
    logging::init(log);

    let (control, data) = channels.into_async()?;

    let mux = Multiplexer::with_resp(config.backend_targets(), config.mux_settings());
    let identity = WorkerIdentity {
        index: init.index,
        name: init.name.clone(),
    };
    let registry = ModuleRegistry::new(identity, mux, Box::new(CatalogueLoader::new(config_path)));
    let loaded = registry.load_all()?;

    info!(
        worker_index = init.index,
        name = %init.name,
        manager_pid = init.manager_pid,
        modules = loaded,
        backends = config.backends.len(),
        "worker initialised"
    );
    Ok((Rc::new(registry), control, data))
}

/// Take ownership of both inherited channel descriptors.
fn adopt_channels(init: &WorkerInit) -> Result<Endpoints> {
    if init.ctrl_fd == init.data_fd {
        return Err(KimError::Channel(format!(
            "control and data channels share descriptor {}",
            init.ctrl_fd
        )));
    }
    let control = adopt_fd(init.ctrl_fd)?;
    let data = adopt_fd(init.data_fd)?;
    Ok(Endpoints { control, data })
}

/// Take ownership of an inherited channel descriptor.
///
/// The descriptor must be an open stream socket. It is left untouched when
/// it is not.
fn adopt_fd(fd: RawFd) -> Result<StdUnixStream> {
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(KimError::Channel(format!(
            "inherited descriptor {} is not open",
            fd
        )));
    }
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    match getsockopt(&borrowed, sockopt::SockType) {
        Ok(SockType::Stream) => {}
        Ok(other) => {
            return Err(KimError::Channel(format!(
                "inherited descriptor {} is a {:?} socket, not a stream",
                fd, other
            )));
        }
        Err(Errno::ENOTSOCK) => {
            return Err(KimError::Channel(format!(
                "inherited descriptor {} is not a socket",
                fd
            )));
        }
        Err(e) => return Err(e.into()),
    }
    // Not inherited by anything this worker starts.
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(unsafe { StdUnixStream::from_raw_fd(fd) })
}

/// Serve until shutdown is requested or the control channel closes.
///
/// Every request runs in its own task on the current [`LocalSet`]; responses
/// are written in completion order. Must be called within a `LocalSet`.
pub async fn serve(control: UnixStream, data: UnixStream, registry: Rc<ModuleRegistry>) -> Result<()> {
    let worker = registry.worker().clone();
    let (control_rd, control_wr) = control.into_split();
    let (data_rd, data_wr) = data.into_split();
    let mut commands = LineReader::new(control_rd);
    let mut events = LineWriter::new(control_wr);
    let mut requests = LineReader::new(data_rd);

    let (responses, response_rx) = mpsc::unbounded_channel();
    let writer = tokio::task::spawn_local(write_responses(LineWriter::new(data_wr), response_rx));

    events
        .send(&WorkerEvent::Ready {
            index: worker.index,
            pid: std::process::id() as i32,
        })
        .await?;
    info!(worker_index = worker.index, name = %worker.name, "worker serving");

    let mut data_open = true;
    let result = loop {
        tokio::select! {
            message = commands.read::<ControlMessage>() => match message {
                Ok(Some(ControlMessage::Shutdown)) => {
                    info!(worker_index = worker.index, "shutdown requested");
                    break Ok(());
                }
                Ok(Some(ControlMessage::Reload { module })) => {
                    if let Err(e) = reload(&registry, &mut events, module).await {
                        break Err(e);
                    }
                }
                Ok(None) => {
                    info!(worker_index = worker.index, "manager closed the control channel");
                    break Ok(());
                }
                Err(KimError::Json(e)) => {
                    warn!(worker_index = worker.index, error = %e, "ignoring undecodable control message");
                }
                Err(e) => break Err(e),
            },
            request = requests.read::<Request>(), if data_open => match request {
                Ok(Some(req)) => {
                    let registry = registry.clone();
                    let responses = responses.clone();
                    tokio::task::spawn_local(async move {
                        let _ = responses.send(registry.handle(req).await);
                    });
                }
                Ok(None) => {
                    debug!(worker_index = worker.index, "data channel closed");
                    data_open = false;
                }
                Err(KimError::Json(e)) => {
                    warn!(worker_index = worker.index, error = %e, "rejecting undecodable request");
                    let _ = responses.send(Response::rejected(&KimError::InvalidRequest(e.to_string())));
                }
                Err(e) => {
                    warn!(worker_index = worker.index, error = %e, "data channel failed");
                    data_open = false;
                }
            },
        }
    };

    registry.mux().shutdown();
    drop(responses);
    if tokio::time::timeout(FLUSH_GRACE, writer).await.is_err() {
        warn!(worker_index = worker.index, "in-flight requests abandoned at shutdown");
    }
    result
}

async fn reload(
    registry: &ModuleRegistry,
    events: &mut LineWriter<OwnedWriteHalf>,
    module: Option<String>,
) -> Result<()> {
    let outcomes = match module {
        Some(name) => {
            let outcome = registry.reload(&name);
            vec![(name, outcome)]
        }
        None => registry.reload_all(),
    };
    for (module, outcome) in outcomes {
        let event = match outcome {
            Ok(instance) => WorkerEvent::Reloaded {
                module,
                seq: instance.seq,
            },
            Err(e) => WorkerEvent::ReloadFailed {
                module,
                message: e.to_string(),
            },
        };
        events.send(&event).await?;
    }
    Ok(())
}

async fn write_responses(
    mut writer: LineWriter<OwnedWriteHalf>,
    mut rx: mpsc::UnboundedReceiver<Response>,
) {
    while let Some(response) = rx.recv().await {
        if let Err(e) = writer.send(&response).await {
            warn!(error = %e, "cannot write response, dropping the rest");
            break;
        }
    }
}
