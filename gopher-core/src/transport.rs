use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::gopher::ParseError;

pub const DEFAULT_PORT: u16 = 70;

/// Streaming chunk size; memory per transfer is bounded by this.
const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum GopherError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to send request: {0}")]
    Write(#[source] io::Error),
    #[error("failed to read response: {0}")]
    Read(#[source] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
    #[error("transfer failed after {written} byte(s): {source}")]
    Transport {
        written: u64,
        #[source]
        source: io::Error,
    },
}

/// Dial and I/O settings shared by every session. Deadlines are off unless
/// configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub default_port: u16,
    pub connect_timeout: Option<Duration>,
    pub io_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            default_port: DEFAULT_PORT,
            connect_timeout: None,
            io_timeout: None,
        }
    }
}

async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed"))?,
        None => fut.await,
    }
}

/// Split `host[:port]` into its name and port, falling back to
/// `default_port`. Bracketed IPv6 literals are accepted; a bare IPv6 literal
/// is taken as a host without port.
pub fn split_host_port(host: &str, default_port: u16) -> io::Result<(String, u16)> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", msg, host));

    if let Some(rest) = host.strip_prefix('[') {
        let (name, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated address literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid("invalid port"))?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid("unexpected characters after address")),
        };
        return Ok((name.to_string(), port));
    }

    match host.split_once(':') {
        Some((name, port)) if !port.contains(':') => {
            let port = port.parse().map_err(|_| invalid("invalid port"))?;
            Ok((name.to_string(), port))
        }
        _ => Ok((host.to_string(), default_port)),
    }
}

fn strip_line_ending(mut buf: Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// The host part of `host[:port]`, used for comparing item owners.
pub fn host_name(host: &str) -> String {
    split_host_port(host, DEFAULT_PORT)
        .map(|(name, _)| name)
        .unwrap_or_else(|_| host.to_string())
}

/// One gopher exchange over a stream: a selector goes out, a response comes
/// back.
pub struct Session<S = TcpStream> {
    stream: BufReader<S>,
    io_timeout: Option<Duration>,
}

impl Session<TcpStream> {
    /// Dial `host`, appending the configured default port when none is given.
    pub async fn open(host: &str, config: &TransportConfig) -> Result<Self, GopherError> {
        let connect_err = |source: io::Error| GopherError::Connect {
            addr: host.to_string(),
            source,
        };

        let (name, port) = split_host_port(host, config.default_port).map_err(connect_err)?;
        if port == 0 {
            return Err(connect_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "port 0 marks an informational item",
            )));
        }

        let addr = if name.contains(':') {
            format!("[{}]:{}", name, port)
        } else {
            format!("{}:{}", name, port)
        };

        let stream = with_deadline(config.connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|source| GopherError::Connect {
                addr: addr.clone(),
                source,
            })?;

        Ok(Session::accept(stream, config))
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already established stream, e.g. one returned by `accept`.
    pub fn accept(stream: S, config: &TransportConfig) -> Self {
        Session {
            stream: BufReader::new(stream),
            io_timeout: config.io_timeout,
        }
    }

    pub async fn send_selector(&mut self, selector: &str) -> Result<(), GopherError> {
        self.write_all(format!("{}\r\n", selector).as_bytes()).await
    }

    /// Type 7 request: the query travels after a tab.
    pub async fn send_search(&mut self, selector: &str, query: &str) -> Result<(), GopherError> {
        self.write_all(format!("{}\t{}\r\n", selector, query).as_bytes())
            .await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), GopherError> {
        let stream = self.stream.get_mut();
        with_deadline(self.io_timeout, async {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await
        .map_err(GopherError::Write)
    }

    /// Next line without its line ending, or `None` at end of stream. Lines
    /// have no length limit.
    pub async fn read_line(&mut self) -> Result<Option<String>, GopherError> {
        let mut buf = Vec::new();
        let n = with_deadline(self.io_timeout, self.stream.read_until(b'\n', &mut buf))
            .await
            .map_err(GopherError::Read)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(strip_line_ending(buf)))
    }

    /// The request line a client sends. A client that goes quiet mid-line is
    /// answered with what it managed to send; one that sent nothing at all
    /// before the deadline or end of stream gets the empty selector.
    pub async fn read_request(&mut self) -> Result<String, GopherError> {
        let mut buf = Vec::new();
        // read_until keeps whatever it appended when the deadline drops it
        match with_deadline(self.io_timeout, self.stream.read_until(b'\n', &mut buf)).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(GopherError::Read(e)),
        }
        Ok(strip_line_ending(buf))
    }

    pub async fn read_all(&mut self) -> Result<Vec<u8>, GopherError> {
        let mut body = Vec::new();
        self.copy_to(&mut body).await?;
        Ok(body)
    }

    /// Copy everything up to end of stream into `sink`. On failure the error
    /// carries how many bytes already reached the sink.
    pub async fn copy_to<W>(&mut self, sink: &mut W) -> Result<u64, GopherError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;

        loop {
            let n = match with_deadline(self.io_timeout, self.stream.read(&mut buf)).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => return Err(GopherError::Transport { written, source }),
            };
            if let Err(source) = sink.write_all(&buf[..n]).await {
                return Err(GopherError::Transport { written, source });
            }
            written += n as u64;
        }

        sink.flush()
            .await
            .map_err(|source| GopherError::Transport { written, source })?;
        Ok(written)
    }

    /// Stream `reader` out to the peer in bounded chunks.
    pub async fn send_from<R>(&mut self, reader: &mut R) -> Result<u64, GopherError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let io_timeout = self.io_timeout;
        let stream = self.stream.get_mut();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => return Err(GopherError::Transport { written: sent, source }),
            };
            if let Err(source) = with_deadline(io_timeout, stream.write_all(&buf[..n])).await {
                return Err(GopherError::Transport { written: sent, source });
            }
            sent += n as u64;
        }

        stream
            .flush()
            .await
            .map_err(|source| GopherError::Transport { written: sent, source })?;
        Ok(sent)
    }

    pub async fn shutdown(&mut self) -> Result<(), GopherError> {
        self.stream
            .get_mut()
            .shutdown()
            .await
            .map_err(GopherError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[test]
    fn host_port_splitting() {
        assert_eq!(
            split_host_port("gopher.example.org", 70).unwrap(),
            ("gopher.example.org".to_string(), 70)
        );
        assert_eq!(
            split_host_port("localhost:7070", 70).unwrap(),
            ("localhost".to_string(), 7070)
        );
        assert_eq!(
            split_host_port("[::1]:7070", 70).unwrap(),
            ("::1".to_string(), 7070)
        );
        assert_eq!(split_host_port("[::1]", 70).unwrap(), ("::1".to_string(), 70));
        assert_eq!(split_host_port("::1", 70).unwrap(), ("::1".to_string(), 70));
        assert!(split_host_port("host:port", 70).is_err());
        assert!(split_host_port("host:70000", 70).is_err());
    }

    #[test]
    fn host_name_drops_port() {
        assert_eq!(host_name("example.org:70"), "example.org");
        assert_eq!(host_name("(none)"), "(none)");
    }

    #[tokio::test]
    async fn reads_lines_of_any_length() {
        let (client, mut server) = duplex(1024);
        let long = "x".repeat(100_000);
        let payload = format!("{}\r\nshort\nlast-without-newline", long);

        let writer = tokio::spawn(async move {
            server.write_all(payload.as_bytes()).await.unwrap();
        });

        let mut session = Session::accept(client, &TransportConfig::default());
        assert_eq!(session.read_line().await.unwrap(), Some(long));
        assert_eq!(session.read_line().await.unwrap().as_deref(), Some("short"));
        writer.await.unwrap();
        assert_eq!(
            session.read_line().await.unwrap().as_deref(),
            Some("last-without-newline")
        );
        assert_eq!(session.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_all_keeps_bytes_verbatim() {
        let (client, mut server) = duplex(64);
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let expected = payload.clone();

        tokio::spawn(async move {
            server.write_all(&payload).await.unwrap();
        });

        let mut session = Session::accept(client, &TransportConfig::default());
        assert_eq!(session.read_all().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn selector_is_crlf_framed() {
        let (client, mut server) = duplex(64);
        let mut session = Session::accept(client, &TransportConfig::default());
        session.send_selector("/docs").await.unwrap();
        session.send_search("/find", "rust").await.unwrap();
        drop(session);

        let mut sent = String::new();
        server.read_to_string(&mut sent).await.unwrap();
        assert_eq!(sent, "/docs\r\n/find\trust\r\n");
    }

    #[tokio::test]
    async fn read_deadline_surfaces_as_read_error() {
        let (client, _server) = duplex(64);
        let config = TransportConfig {
            io_timeout: Some(Duration::from_millis(20)),
            ..TransportConfig::default()
        };
        let mut session = Session::accept(client, &config);
        match session.read_line().await {
            Err(GopherError::Read(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected read timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn stalled_request_keeps_partial_selector() {
        let (client, mut peer) = duplex(64);
        let config = TransportConfig {
            io_timeout: Some(Duration::from_millis(50)),
            ..TransportConfig::default()
        };
        peer.write_all(b"/about.txt").await.unwrap();

        let mut session = Session::accept(client, &config);
        assert_eq!(session.read_request().await.unwrap(), "/about.txt");
        drop(peer);
    }

    #[tokio::test]
    async fn silent_request_is_empty_selector() {
        let (client, peer) = duplex(64);
        let config = TransportConfig {
            io_timeout: Some(Duration::from_millis(20)),
            ..TransportConfig::default()
        };
        let mut session = Session::accept(client, &config);
        assert_eq!(session.read_request().await.unwrap(), "");
        drop(peer);

        let (client, mut peer) = duplex(64);
        peer.write_all(b"/docs\r\n").await.unwrap();
        let mut session = Session::accept(client, &TransportConfig::default());
        assert_eq!(session.read_request().await.unwrap(), "/docs");
    }

    /// Takes the first write whole and refuses everything after it.
    #[derive(Default)]
    struct OneShotSink {
        received: Vec<u8>,
    }

    impl AsyncWrite for OneShotSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            if this.received.is_empty() {
                this.received.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            } else {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")))
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn failing_sink_reports_bytes_already_written() {
        // A small pipe forces the payload through in several reads.
        let (client, mut server) = duplex(16);
        let writer = tokio::spawn(async move {
            let _ = server.write_all(&[7u8; 64]).await;
        });

        let mut session = Session::accept(client, &TransportConfig::default());
        let mut sink = OneShotSink::default();
        match session.copy_to(&mut sink).await {
            Err(GopherError::Transport { written, source }) => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
                assert!(written > 0 && written < 64, "written {}", written);
                assert_eq!(written, sink.received.len() as u64);
            }
            other => panic!("expected transport error, got {:?}", other),
        }
        drop(session);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Session::open(&addr.to_string(), &TransportConfig::default()).await;
        assert!(matches!(result, Err(GopherError::Connect { .. })));
    }

    #[tokio::test]
    async fn port_zero_is_never_dialed() {
        let result = Session::open("localhost:0", &TransportConfig::default()).await;
        assert!(matches!(result, Err(GopherError::Connect { .. })));
    }
}
