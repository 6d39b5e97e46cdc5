//! Hand-written client for the RESP-style binary wire protocol.
//!
//! # Responsibilities
//! - Encode a command as an array of bulk strings
//! - Decode one typed reply from its single leading type byte
//! - Own the buffered stream to the key-value server
//!
//! The protocol is symmetric enough that the codec is independent of the
//! transport: the client works over anything `AsyncRead + AsyncWrite`,
//! which is also how the tests drive it.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

/// Error type for wire-protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer sent something the protocol does not allow at this point.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// An `-ERR ...` reply from the server.
    #[error("server error reply: {0}")]
    Server(String),
}

/// One decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+...` simple string.
    Simple(String),
    /// `-...` error string.
    Error(String),
    /// `:...` integer, optionally signed.
    Integer(i64),
    /// `$<len>` bulk string; length -1 decodes to `None` (null, not empty).
    Bulk(Option<Bytes>),
    /// `*<count>` array, elements decoded recursively; count -1 is `None`.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Promote an error reply into `RespError::Server`, pass others through.
    pub fn into_result(self) -> Result<Reply, RespError> {
        match self {
            Reply::Error(message) => Err(RespError::Server(message)),
            other => Ok(other),
        }
    }
}

/// Encode one command as `*<argc>` followed by each argument as a bulk
/// string: `$<len>\r\n<bytes>\r\n`.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Buffered wire-protocol client.
pub struct WireClient<S> {
    stream: BufStream<S>,
}

impl WireClient<TcpStream> {
    /// Connect to the key-value server.
    pub async fn connect(host: &str, port: u16) -> Result<Self, RespError> {
        let stream = TcpStream::connect((host, port)).await?;
        tracing::debug!(host, port, "wire client connected");
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> WireClient<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    /// Send one command and decode its reply.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply, RespError> {
        self.stream.write_all(&encode_command(args)).await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    /// Decode one reply from the stream.
    pub async fn read_reply(&mut self) -> Result<Reply, RespError> {
        self.read_reply_boxed().await
    }

    // Array replies decode recursively; boxing breaks the async cycle.
    fn read_reply_boxed(&mut self) -> BoxFuture<'_, Result<Reply, RespError>> {
        Box::pin(async move {
            let prefix = self.read_byte().await?;
            match prefix {
                b'+' => Ok(Reply::Simple(self.read_line().await?)),
                b'-' => Ok(Reply::Error(self.read_line().await?)),
                b':' => Ok(Reply::Integer(self.read_integer_line().await?)),
                b'$' => {
                    let len = self.read_integer_line().await?;
                    if len < 0 {
                        return Ok(Reply::Bulk(None));
                    }
                    let mut buf = vec![0u8; len as usize];
                    self.stream.read_exact(&mut buf).await?;
                    self.expect_crlf().await?;
                    Ok(Reply::Bulk(Some(Bytes::from(buf))))
                }
                b'*' => {
                    let count = self.read_integer_line().await?;
                    if count < 0 {
                        return Ok(Reply::Array(None));
                    }
                    let mut items = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        items.push(self.read_reply_boxed().await?);
                    }
                    Ok(Reply::Array(Some(items)))
                }
                other => Err(RespError::Protocol(format!(
                    "invalid reply type byte: 0x{other:02x}"
                ))),
            }
        })
    }

    /// Shut down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), RespError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, RespError> {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    /// Read up to CRLF, returning the line without the terminator.
    async fn read_line(&mut self) -> Result<String, RespError> {
        let mut buf = Vec::new();
        self.stream.read_until(b'\n', &mut buf).await?;
        if !buf.ends_with(b"\r\n") {
            return Err(RespError::Protocol("reply line not CRLF-terminated".into()));
        }
        buf.truncate(buf.len() - 2);
        String::from_utf8(buf)
            .map_err(|_| RespError::Protocol("reply line is not UTF-8".into()))
    }

    /// Read a CRLF-terminated, optionally signed decimal integer.
    async fn read_integer_line(&mut self) -> Result<i64, RespError> {
        let line = self.read_line().await?;
        line.parse::<i64>()
            .map_err(|_| RespError::Protocol(format!("invalid integer reply: {line:?}")))
    }

    async fn expect_crlf(&mut self) -> Result<(), RespError> {
        let mut crlf = [0u8; 2];
        self.stream.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(RespError::Protocol("bulk payload not CRLF-terminated".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn client_with_input(input: &[u8]) -> WireClient<tokio::io::DuplexStream> {
        let (client, mut server) = duplex(4096);
        server.write_all(input).await.unwrap();
        WireClient::new(client)
    }

    #[test]
    fn encodes_two_argument_command() {
        let encoded = encode_command(&[b"SET", b"a", b"1"]);
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
    }

    #[test]
    fn encodes_empty_argument() {
        let encoded = encode_command(&[b"SET", b""]);
        assert_eq!(encoded, b"*2\r\n$3\r\nSET\r\n$0\r\n\r\n");
    }

    #[tokio::test]
    async fn decodes_simple_string() {
        let mut wire = client_with_input(b"+OK\r\n").await;
        assert_eq!(wire.read_reply().await.unwrap(), Reply::Simple("OK".into()));
    }

    #[tokio::test]
    async fn set_then_ok_round_trip() {
        let (client, mut server) = duplex(4096);
        let mut wire = WireClient::new(client);
        server.write_all(b"+OK\r\n").await.unwrap();
        let reply = wire.command(&[b"SET", b"a", b"1"]).await.unwrap();
        assert_eq!(reply, Reply::Simple("OK".into()));

        let mut sent = vec![0u8; 64];
        let n = server.read(&mut sent).await.unwrap();
        assert_eq!(&sent[..n], b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
    }

    #[tokio::test]
    async fn decodes_error_reply() {
        let mut wire = client_with_input(b"-ERR wrong type\r\n").await;
        let reply = wire.read_reply().await.unwrap();
        assert_eq!(reply, Reply::Error("ERR wrong type".into()));
        assert!(matches!(reply.into_result(), Err(RespError::Server(_))));
    }

    #[tokio::test]
    async fn decodes_signed_integer() {
        let mut wire = client_with_input(b":-42\r\n").await;
        assert_eq!(wire.read_reply().await.unwrap(), Reply::Integer(-42));
    }

    #[tokio::test]
    async fn decodes_null_bulk_as_none_not_empty() {
        let mut wire = client_with_input(b"$-1\r\n$0\r\n\r\n").await;
        assert_eq!(wire.read_reply().await.unwrap(), Reply::Bulk(None));
        assert_eq!(
            wire.read_reply().await.unwrap(),
            Reply::Bulk(Some(Bytes::new()))
        );
    }

    #[tokio::test]
    async fn decodes_nested_array() {
        let input = b"*3\r\n$1\r\na\r\n:7\r\n*1\r\n+x\r\n";
        let mut wire = client_with_input(input).await;
        assert_eq!(
            wire.read_reply().await.unwrap(),
            Reply::Array(Some(vec![
                Reply::Bulk(Some(Bytes::from_static(b"a"))),
                Reply::Integer(7),
                Reply::Array(Some(vec![Reply::Simple("x".into())])),
            ]))
        );
    }

    #[tokio::test]
    async fn decodes_null_array() {
        let mut wire = client_with_input(b"*-1\r\n").await;
        assert_eq!(wire.read_reply().await.unwrap(), Reply::Array(None));
    }

    #[tokio::test]
    async fn rejects_unknown_type_byte() {
        let mut wire = client_with_input(b"?\r\n").await;
        assert!(matches!(
            wire.read_reply().await,
            Err(RespError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bare_lf_terminator() {
        let mut wire = client_with_input(b"+OK\n").await;
        assert!(matches!(
            wire.read_reply().await,
            Err(RespError::Protocol(_))
        ));
    }
}
