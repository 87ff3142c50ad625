//! Worker process creation.
//!
//! Workers are fresh processes: the manager re-executes its own binary in
//! `worker` mode. The child inherits exactly two descriptors, its control and
//! data channel ends, installed at [`CONTROL_FD`] and [`DATA_FD`], and learns
//! who it is from a [`WorkerInit`] passed on the command line.

use super::channel::Endpoints;
use crate::error::{KimError, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::net::UnixStream;
use tracing::debug;

/// Worker exit status after a normal shutdown.
pub const EXIT_CHILD: i32 = 0;
/// Worker exit status when initialisation failed (`EX_SOFTWARE`).
pub const EXIT_CHILD_INIT_FAIL: i32 = 70;
/// Worker exit status when serving failed after a successful start.
pub const EXIT_CHILD_ERROR: i32 = 1;

/// Descriptor of the control channel in a worker.
pub const CONTROL_FD: RawFd = 3;
/// Descriptor of the data channel in a worker.
pub const DATA_FD: RawFd = 4;

/// Everything a worker needs to know about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Slot in the manager's worker table, starting at 1.
    pub index: usize,
    pub name: String,
    pub work_dir: PathBuf,
    pub ctrl_fd: RawFd,
    pub data_fd: RawFd,
    pub manager_pid: i32,
}

impl WorkerInit {
    pub fn new(index: usize, name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            index,
            name: name.into(),
            work_dir: work_dir.into(),
            ctrl_fd: CONTROL_FD,
            data_fd: DATA_FD,
            manager_pid: std::process::id() as i32,
        }
    }

    /// Encode for the worker command line.
    pub fn to_arg(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_arg(arg: &str) -> Result<Self> {
        let init: Self = serde_json::from_str(arg)?;
        if init.index == 0 {
            return Err(KimError::InvalidWorkerIndex(0));
        }
        Ok(init)
    }
}

/// Starts worker processes.
pub trait Launcher {
    /// Start the worker described by `init`, handing it `ends`.
    ///
    /// The caller closes its copies of `ends` afterwards.
    fn launch(&self, init: &WorkerInit, ends: &Endpoints) -> Result<Pid>;

    /// Register the manager's ends of a launched worker's channels with the
    /// current runtime.
    fn register(&self, ends: Endpoints) -> Result<(UnixStream, UnixStream)> {
        ends.into_async()
    }
}

/// Re-executes the server binary in worker mode.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            config_path: config_path.into(),
        }
    }

    /// Launcher for the running binary.
    pub fn current(config_path: &Path) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe, config_path))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, init: &WorkerInit, ends: &Endpoints) -> Result<Pid> {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--init")
            .arg(init.to_arg()?)
            .current_dir(&init.work_dir)
            .stdin(Stdio::null());

        let control = ends.control.as_raw_fd();
        let data = ends.data.as_raw_fd();
        let (ctrl_fd, data_fd) = (init.ctrl_fd, init.data_fd);
        // Only async-signal-safe calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || install_fds(control, data, ctrl_fd, data_fd));
        }

        let child = cmd.spawn().map_err(|e| KimError::Spawn {
            index: init.index,
            message: format!("{}: {}", self.exe.display(), e),
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!(worker_index = init.index, pid = pid.as_raw(), exe = %self.exe.display(), "worker process started");
        Ok(pid)
    }
}

/// Place `control` and `data` at `ctrl_fd` and `data_fd` without close-on-exec.
fn install_fds(control: RawFd, data: RawFd, ctrl_fd: RawFd, data_fd: RawFd) -> io::Result<()> {
    // Move both above the target range first so neither dup2 clobbers the other.
    let floor = ctrl_fd.max(data_fd) + 1;
    let control = cvt(unsafe { libc::fcntl(control, libc::F_DUPFD_CLOEXEC, floor) })?;
    let data = cvt(unsafe { libc::fcntl(data, libc::F_DUPFD_CLOEXEC, floor) })?;
    cvt(unsafe { libc::dup2(control, ctrl_fd) })?;
    cvt(unsafe { libc::dup2(data, data_fd) })?;
    unsafe {
        libc::close(control);
        libc::close(data);
    }
    Ok(())
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::channel::ChannelPair;
    use nix::sys::wait::{WaitStatus, waitpid};
    use std::io::{BufRead, BufReader, Write};

    #[test]
    fn test_worker_init_arg_roundtrip() {
        let init = WorkerInit::new(2, "kim_w_2", "/srv/kim");
        assert_eq!(init.ctrl_fd, CONTROL_FD);
        assert_eq!(init.data_fd, DATA_FD);
        let parsed = WorkerInit::from_arg(&init.to_arg().unwrap()).unwrap();
        assert_eq!(parsed, init);
    }

    #[test]
    fn test_worker_init_rejects_index_zero() {
        let mut init = WorkerInit::new(1, "kim_w_1", "/");
        init.index = 0;
        let err = WorkerInit::from_arg(&init.to_arg().unwrap()).unwrap_err();
        assert!(matches!(err, KimError::InvalidWorkerIndex(0)));
    }

    #[test]
    fn test_child_inherits_channels_at_fixed_fds() {
        // The shell stands in for the worker: it echoes a line from the
        // control fd onto the data fd.
        let pair = ChannelPair::new().unwrap();
        let init = WorkerInit::new(1, "kim_w_1", std::env::temp_dir());

        let control = pair.worker.control.as_raw_fd();
        let data = pair.worker.data.as_raw_fd();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("read line <&3; echo \"got $line\" >&4");
        unsafe {
            cmd.pre_exec(move || install_fds(control, data, init.ctrl_fd, init.data_fd));
        }
        let child = cmd.spawn().unwrap();
        drop(pair.worker);

        let mut manager_control = pair.manager.control;
        manager_control.write_all(b"hello\n").unwrap();
        let mut line = String::new();
        BufReader::new(pair.manager.data).read_line(&mut line).unwrap();
        assert_eq!(line, "got hello\n");

        let status = waitpid(Pid::from_raw(child.id() as i32), None).unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn test_launch_missing_binary_fails() {
        let pair = ChannelPair::new().unwrap();
        let launcher = ProcessLauncher::new("/nonexistent/kim", "/nonexistent/config.json");
        let init = WorkerInit::new(1, "kim_w_1", std::env::temp_dir());
        let err = launcher.launch(&init, &pair.worker).unwrap_err();
        assert!(matches!(err, KimError::Spawn { index: 1, .. }));
    }
}
