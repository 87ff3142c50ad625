//! RESP (Redis serialization protocol) transport.
//!
//! Commands are encoded as arrays of bulk strings. Replies are parsed
//! incrementally from a read buffer: [`parse_reply`] returns `Ok(None)` until
//! a complete frame is buffered.

use super::{BackendTarget, Command, Connector, Reply, Transport};
use crate::error::{KimError, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Initial read buffer capacity.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Nesting limit for array replies.
const MAX_DEPTH: usize = 32;

/// Connects to RESP backends over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespConnector;

#[async_trait(?Send)]
impl Connector for RespConnector {
    async fn connect(&self, target: &BackendTarget) -> Result<Box<dyn Transport>> {
        let stream =
            TcpStream::connect(target.addr())
                .await
                .map_err(|e| KimError::BackendConnect {
                    target: target.name.clone(),
                    message: e.to_string(),
                })?;
        // Commands are small and latency bound.
        let _ = stream.set_nodelay(true);
        Ok(Box::new(RespConnection::new(target.name.clone(), stream)))
    }
}

/// A RESP connection over TCP.
pub struct RespConnection {
    target: String,
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RespConnection {
    pub fn new(target: String, stream: TcpStream) -> Self {
        Self {
            target,
            stream,
            buf: Vec::with_capacity(READ_BUFFER_SIZE),
        }
    }

    fn disconnected(&self, message: impl Into<String>) -> KimError {
        KimError::BackendDisconnected {
            target: self.target.clone(),
            message: message.into(),
        }
    }
}

#[async_trait(?Send)]
impl Transport for RespConnection {
    async fn execute(&mut self, command: &Command) -> Result<Reply> {
        let frame = encode_command(command);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| self.disconnected(e.to_string()))?;

        loop {
            if let Some((reply, used)) = parse_reply(&self.buf)? {
                self.buf.drain(..used);
                return Ok(reply);
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| self.disconnected(e.to_string()))?;
            if n == 0 {
                return Err(self.disconnected("connection closed by peer"));
            }
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let args = command.args();
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Parse one reply from the front of `buf`.
///
/// Returns the reply and the number of bytes it occupied, `Ok(None)` if the
/// frame is incomplete, or a protocol error for malformed input.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    parse_at(buf, 0, 0)
}

fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Reply, usize)>> {
    if depth > MAX_DEPTH {
        return Err(KimError::Protocol("reply nested too deeply".into()));
    }
    let Some(line_end) = find_crlf(buf, pos) else {
        return Ok(None);
    };
    if line_end == pos {
        return Err(KimError::Protocol("empty reply header".into()));
    }
    let tag = buf[pos];
    let line = std::str::from_utf8(&buf[pos + 1..line_end])
        .map_err(|_| KimError::Protocol("reply header is not UTF-8".into()))?;
    let next = line_end + 2;

    match tag {
        b'+' => Ok(Some((Reply::Status(line.to_string()), next))),
        b'-' => Ok(Some((Reply::Error(line.to_string()), next))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), next)));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(KimError::Protocol("bulk string not terminated".into()));
            }
            Ok(Some((Reply::Bulk(Some(buf[next..end].to_vec())), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Array(None), next)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(Some(items)), cursor)))
        }
        other => Err(KimError::Protocol(format!(
            "unexpected reply type byte 0x{:02x}",
            other
        ))),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_int(s: &str) -> Result<i64> {
    s.parse()
        .map_err(|_| KimError::Protocol(format!("invalid integer '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_encode_command() {
        let cmd = Command::new("SET").arg("key").arg("hello world");
        assert_eq!(
            encode_command(&cmd),
            b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$11\r\nhello world\r\n".to_vec()
        );
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(
            parse_reply(b"+OK\r\n").unwrap(),
            Some((Reply::Status("OK".into()), 5))
        );
        assert_eq!(
            parse_reply(b"-ERR wrong type\r\n").unwrap(),
            Some((Reply::Error("ERR wrong type".into()), 17))
        );
        assert_eq!(
            parse_reply(b":-42\r\n").unwrap(),
            Some((Reply::Integer(-42), 6))
        );
        assert_eq!(
            parse_reply(b"$-1\r\n").unwrap(),
            Some((Reply::Bulk(None), 5))
        );
    }

    #[test]
    fn test_parse_bulk_with_crlf_inside() {
        let (reply, used) = parse_reply(b"$4\r\na\r\nb\r\n+NEXT\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(Some(b"a\r\nb".to_vec())));
        assert_eq!(used, 10);
    }

    #[test]
    fn test_parse_nested_array() {
        let input = b"*2\r\n$1\r\na\r\n*1\r\n:1\r\n";
        let (reply, used) = parse_reply(input).unwrap().unwrap();
        assert_eq!(used, input.len());
        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Bulk(Some(b"a".to_vec())),
                Reply::Array(Some(vec![Reply::Integer(1)])),
            ]))
        );
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(parse_reply(b"").unwrap(), None);
        assert_eq!(parse_reply(b"+OK").unwrap(), None);
        assert_eq!(parse_reply(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse_reply(b"*2\r\n:1\r\n").unwrap(), None);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_reply(b"?what\r\n").is_err());
        assert!(parse_reply(b":abc\r\n").is_err());
        assert!(parse_reply(b"$2\r\nabcd\r\n").is_err());
    }

    #[tokio::test]
    async fn test_round_trip_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(socket);
            let mut line = String::new();
            // *1, $4, PING
            for _ in 0..3 {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
            }
            assert_eq!(line.trim_end(), "PING");
            // Split the reply across two writes to exercise buffering.
            reader.get_mut().write_all(b"+PO").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            reader.get_mut().write_all(b"NG\r\n").await.unwrap();
        });

        let target = BackendTarget {
            name: "cache".into(),
            host: "127.0.0.1".into(),
            port,
            max_conn_cnt: 1,
        };
        let mut conn = RespConnector.connect(&target).await.unwrap();
        let reply = conn.execute(&Command::new("PING")).await.unwrap();
        assert_eq!(reply, Reply::Status("PONG".into()));

        server.await.unwrap();
        let err = conn.execute(&Command::new("PING")).await.unwrap_err();
        assert!(matches!(err, KimError::BackendDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = BackendTarget {
            name: "cache".into(),
            host: "127.0.0.1".into(),
            port,
            max_conn_cnt: 1,
        };
        let err = RespConnector.connect(&target).await.err().unwrap();
        assert!(matches!(err, KimError::BackendConnect { .. }));
    }
}
