//! Signal handling and termination analysis.
//!
//! The manager calls [`install`] once per process. Child death, stop and
//! reload requests arrive through tokio's signal driver as [`SignalEvents`].
//! Fatal signals (`SIGILL`, `SIGBUS`, `SIGFPE`) bypass the event loop: their
//! handler writes one line to stderr and exits with the signal number.

use super::spawn::{EXIT_CHILD, EXIT_CHILD_INIT_FAIL};
use crate::error::{KimError, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::WaitStatus;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, warn};

/// Signals that end the manager.
pub const FATAL: [Signal; 3] = [Signal::SIGILL, Signal::SIGBUS, Signal::SIGFPE];

/// Size of the stack buffer the fatal handler formats into.
const FATAL_LINE_LEN: usize = 256;

/// Longest server name kept for the fatal line.
const MAX_PREFIX_LEN: usize = 200;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Server name written by the fatal handler. Set before the handler is installed.
static FATAL_PREFIX: OnceLock<Box<[u8]>> = OnceLock::new();

extern "C" fn on_fatal(signum: libc::c_int) {
    let prefix = FATAL_PREFIX.get().map_or(&b"kim"[..], |p| &p[..]);
    let mut line = [0u8; FATAL_LINE_LEN];
    let len = fatal_line(&mut line, prefix, signum);
    unsafe {
        libc::write(libc::STDERR_FILENO, line.as_ptr().cast(), len);
        libc::_exit(signum);
    }
}

/// Write `<prefix> terminated by signal <signum>` and a newline into `buf`.
///
/// Never allocates; output that does not fit is cut off.
fn fatal_line(buf: &mut [u8; FATAL_LINE_LEN], prefix: &[u8], signum: libc::c_int) -> usize {
    let mut digits = [0u8; 10];
    let mut start = digits.len();
    let mut n = signum.unsigned_abs();
    loop {
        start -= 1;
        digits[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }

    let mut len = 0;
    for part in [prefix, &b" terminated by signal "[..], &digits[start..], &b"\n"[..]] {
        let take = part.len().min(buf.len() - len);
        buf[len..len + take].copy_from_slice(&part[..take]);
        len += take;
    }
    len
}

/// Install the process-wide signal handlers and return the event stream.
///
/// `server_name` prefixes the line written when a fatal signal ends the
/// process. Must be called from within a tokio runtime, at most once per
/// process.
pub fn install(server_name: &str) -> Result<SignalEvents> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(KimError::Channel(
            "signal handlers are already installed".into(),
        ));
    }

    let prefix: Vec<u8> = server_name.bytes().take(MAX_PREFIX_LEN).collect();
    let _ = FATAL_PREFIX.set(prefix.into_boxed_slice());

    let fatal = SigAction::new(
        SigHandler::Handler(on_fatal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in FATAL {
        unsafe { sigaction(sig, &fatal) }?;
    }
    if let Err(e) = unsafe { sigaction(Signal::SIGKILL, &fatal) } {
        warn!(error = %e, "cannot install SIGKILL handler, continuing without it");
    }

    let events = SignalEvents {
        child: signal(SignalKind::child())?,
        terminate: signal(SignalKind::terminate())?,
        interrupt: signal(SignalKind::interrupt())?,
        hangup: signal(SignalKind::hangup())?,
    };
    debug!(fatal = ?FATAL, "signal handlers installed");
    Ok(events)
}

/// Signals delivered to the manager.
///
/// Repeated deliveries of one signal between two reads are coalesced.
pub struct SignalEvents {
    child: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl SignalEvents {
    /// Wait for the next signal. Cancel safe.
    pub async fn recv(&mut self) -> Result<Signal> {
        let (sig, delivered) = tokio::select! {
            d = self.child.recv() => (Signal::SIGCHLD, d),
            d = self.terminate.recv() => (Signal::SIGTERM, d),
            d = self.interrupt.recv() => (Signal::SIGINT, d),
            d = self.hangup.recv() => (Signal::SIGHUP, d),
        };
        delivered
            .map(|()| sig)
            .ok_or_else(|| KimError::Channel(format!("{:?} stream closed", sig)))
    }
}

/// Ignore `SIGPIPE` so writes to a closed channel fail with `EPIPE` instead.
pub fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// Why a worker process changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Stopped by a job-control signal; still alive.
    Stopped(Signal),
    Continued,
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// True when the process is gone and its slot can be reused.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }

    /// The worker exited before it finished initialising.
    pub fn is_init_failure(&self) -> bool {
        matches!(self, Self::Exited(EXIT_CHILD_INIT_FAIL))
    }

    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Exited(EXIT_CHILD))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(EXIT_CHILD_INIT_FAIL) => {
                format!("failed to initialise (exit code {})", EXIT_CHILD_INIT_FAIL)
            }
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Stopped(sig) => format!("stopped by signal {:?}", sig),
            Self::Continued => "continued".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::Stopped(_, signal) => TerminationReason::Stopped(signal),
        WaitStatus::Continued(_) => TerminationReason::Continued,
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        #[allow(unreachable_patterns)]
        _ => TerminationReason::Unknown,
    }
}
