//! Manager/worker channels.
//!
//! Every worker is connected to the manager by two socket pairs: a control
//! channel for lifecycle messages and a data channel for requests. Both carry
//! newline-delimited JSON.

use crate::error::{KimError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;

/// Default buffer size for channel reads (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// One side's ends of the control and data channels.
#[derive(Debug)]
pub struct Endpoints {
    pub control: StdUnixStream,
    pub data: StdUnixStream,
}

impl Endpoints {
    /// Convert both ends for use on the current tokio runtime.
    pub fn into_async(self) -> Result<(UnixStream, UnixStream)> {
        Ok((to_async(self.control)?, to_async(self.data)?))
    }
}

/// Both channels of one worker, before they are split between the processes.
///
/// Descriptors are created close-on-exec; the launcher installs the worker
/// ends explicitly in the child.
#[derive(Debug)]
pub struct ChannelPair {
    pub manager: Endpoints,
    pub worker: Endpoints,
}

impl ChannelPair {
    pub fn new() -> Result<Self> {
        let (manager_control, worker_control) =
            StdUnixStream::pair().map_err(KimError::ChannelCreate)?;
        let (manager_data, worker_data) = StdUnixStream::pair().map_err(KimError::ChannelCreate)?;
        Ok(Self {
            manager: Endpoints {
                control: manager_control,
                data: manager_data,
            },
            worker: Endpoints {
                control: worker_control,
                data: worker_data,
            },
        })
    }
}

/// Register a blocking socket with the current tokio runtime.
pub fn to_async(stream: StdUnixStream) -> Result<UnixStream> {
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

/// Reads newline-delimited JSON messages.
pub struct LineReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, reader).lines(),
        }
    }

    /// Next message, or `None` at end of stream. Blank lines are skipped.
    ///
    /// A line that fails to decode is reported as [`KimError::Json`]; the
    /// stream stays usable. Cancel safe.
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(line.trim())?)),
            }
        }
    }
}

/// Writes newline-delimited JSON messages.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message and flush.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn test_line_reader_writer_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut writer = LineWriter::new(a);
        let mut reader = LineReader::new(b);

        writer.send(&Ping { n: 1 }).await.unwrap();
        writer.send(&Ping { n: 2 }).await.unwrap();
        drop(writer);

        assert_eq!(reader.read::<Ping>().await.unwrap(), Some(Ping { n: 1 }));
        assert_eq!(reader.read::<Ping>().await.unwrap(), Some(Ping { n: 2 }));
        assert_eq!(reader.read::<Ping>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bad_line_does_not_end_stream() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut reader = LineReader::new(b);

        a.write_all(b"not json\n\n{\"n\":3}\r\n").await.unwrap();
        drop(a);

        assert!(matches!(
            reader.read::<Ping>().await,
            Err(KimError::Json(_))
        ));
        assert_eq!(reader.read::<Ping>().await.unwrap(), Some(Ping { n: 3 }));
        assert_eq!(reader.read::<Ping>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_pair_connects_both_sides() {
        let pair = ChannelPair::new().unwrap();
        let (manager_ctrl, _manager_data) = pair.manager.into_async().unwrap();
        let (worker_ctrl, _worker_data) = pair.worker.into_async().unwrap();

        let mut writer = LineWriter::new(manager_ctrl);
        let mut reader = LineReader::new(worker_ctrl);
        writer.send(&Ping { n: 9 }).await.unwrap();
        assert_eq!(reader.read::<Ping>().await.unwrap(), Some(Ping { n: 9 }));
    }

    #[test]
    fn test_channel_ends_are_cloexec() {
        use std::os::unix::io::AsRawFd;
        let pair = ChannelPair::new().unwrap();
        let flags = unsafe { libc::fcntl(pair.worker.control.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
