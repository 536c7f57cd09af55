use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::gopher::{serialize_listing, Item};
use crate::observe::Observer;
use crate::transport::{GopherError, Session, TransportConfig};

/// Listing file looked up inside a requested directory.
pub const GOPHERMAP: &str = "gophermap";

/// Pause after a failed accept so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Reasons a selector cannot be served. Messages name the selector only,
/// never the local path it mapped to.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("'{0}' forbidden")]
    PathTraversal(String),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("'{0}' permission denied")]
    PermissionDenied(String),
    #[error("'{selector}' could not be read")]
    Io {
        selector: String,
        #[source]
        source: io::Error,
    },
}

impl ServeError {
    fn from_io(selector: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ServeError::NotFound(selector.to_string()),
            io::ErrorKind::PermissionDenied => ServeError::PermissionDenied(selector.to_string()),
            _ => ServeError::Io {
                selector: selector.to_string(),
                source: err,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::PathTraversal(_) => "forbidden",
            ServeError::NotFound(_) => "not found",
            ServeError::PermissionDenied(_) => "permission denied",
            ServeError::Io { .. } => "io",
        }
    }
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Root path does not exist: {0}")]
    MissingRoot(String),
    #[error("Root path is not a directory: {0}")]
    NotADirectory(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    ServedFile,
    ServedListing,
    /// An error record was sent; carries the error kind.
    Failed(&'static str),
    /// The connection broke before the response was complete.
    Aborted,
}

/// Everything known about one accepted connection. Lives as long as the
/// connection and is never shared.
#[derive(Debug, Clone)]
pub struct DirectorySession {
    pub id: Uuid,
    pub peer: Option<SocketAddr>,
    pub selector: String,
    pub resolved: Option<PathBuf>,
    pub outcome: Outcome,
    pub bytes_sent: u64,
}

impl DirectorySession {
    fn new(peer: Option<SocketAddr>) -> Self {
        DirectorySession {
            id: Uuid::new_v4(),
            peer,
            selector: String::new(),
            resolved: None,
            outcome: Outcome::Pending,
            bytes_sent: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Content {
    File,
    Listing,
}

/// Map a selector onto a path below `root`. Any `..` segment is rejected
/// before the filesystem is touched; the result is canonicalized and must
/// still sit below `root`, which catches symlinks pointing out of the tree.
/// `root` must already be canonical.
pub async fn resolve_selector(root: &Path, selector: &str) -> Result<PathBuf, ServeError> {
    let forbidden = || ServeError::PathTraversal(selector.to_string());

    let mut relative = PathBuf::new();
    for segment in selector.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(forbidden()),
            s if s.contains('\0') => return Err(forbidden()),
            s => {
                let mut components = Path::new(s).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(_)), None) => relative.push(s),
                    _ => return Err(forbidden()),
                }
            }
        }
    }

    contain(root, &root.join(relative), selector).await
}

async fn contain(root: &Path, path: &Path, selector: &str) -> Result<PathBuf, ServeError> {
    let canonical = fs::canonicalize(path)
        .await
        .map_err(|e| ServeError::from_io(selector, e))?;
    if !canonical.starts_with(root) {
        return Err(ServeError::PathTraversal(selector.to_string()));
    }
    Ok(canonical)
}

pub struct RequestHandler {
    root: PathBuf,
    transport: TransportConfig,
    observer: Arc<dyn Observer>,
}

impl RequestHandler {
    /// `root` must exist and be a directory; it is canonicalized once here.
    pub fn new(
        root: impl Into<PathBuf>,
        transport: TransportConfig,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, HandlerError> {
        let root = root.into();
        if !root.exists() {
            return Err(HandlerError::MissingRoot(root.display().to_string()));
        }
        if !root.is_dir() {
            return Err(HandlerError::NotADirectory(root.display().to_string()));
        }

        Ok(RequestHandler {
            root: root.canonicalize()?,
            transport,
            observer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run one connection to completion: read the selector, answer it, close.
    pub async fn handle<S>(&self, stream: S, peer: Option<SocketAddr>) -> DirectorySession
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session::accept(stream, &self.transport);
        let mut state = DirectorySession::new(peer);

        // Clients that send nothing get the root.
        let line = match session.read_request().await {
            Ok(line) => line,
            Err(e) => {
                state.outcome = Outcome::Aborted;
                self.record(&state, Some(&e.to_string()));
                return state;
            }
        };
        // Search queries and Gopher+ markers follow a tab.
        state.selector = line.split('\t').next().unwrap_or_default().to_string();

        match self.open_content(&state.selector).await {
            Ok((path, kind, mut file)) => {
                state.resolved = Some(path);
                match session.send_from(&mut file).await {
                    Ok(sent) => {
                        state.bytes_sent = sent;
                        state.outcome = match kind {
                            Content::File => Outcome::ServedFile,
                            Content::Listing => Outcome::ServedListing,
                        };
                    }
                    Err(e) => {
                        if let GopherError::Transport { written, .. } = &e {
                            state.bytes_sent = *written;
                        }
                        state.outcome = Outcome::Aborted;
                        self.record(&state, Some(&e.to_string()));
                        return state;
                    }
                }
            }
            Err(err) => {
                let record = serialize_listing(&[Item::error(err.to_string())]);
                state.outcome = Outcome::Failed(err.kind());
                if let Err(e) = session.write_all(record.as_bytes()).await {
                    state.outcome = Outcome::Aborted;
                    self.record(&state, Some(&e.to_string()));
                    return state;
                }
                state.bytes_sent = record.len() as u64;
            }
        }

        if let Err(e) = session.shutdown().await {
            self.observer.record(
                "connection.close_failed",
                &[("id", state.id.to_string()), ("error", e.to_string())],
            );
        }
        self.record(&state, None);
        state
    }

    async fn open_content(&self, selector: &str) -> Result<(PathBuf, Content, File), ServeError> {
        let path = resolve_selector(&self.root, selector).await?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| ServeError::from_io(selector, e))?;

        let (path, kind) = if meta.is_dir() {
            let map = contain(&self.root, &path.join(GOPHERMAP), selector).await?;
            (map, Content::Listing)
        } else {
            (path, Content::File)
        };

        let meta = fs::metadata(&path)
            .await
            .map_err(|e| ServeError::from_io(selector, e))?;
        if !meta.is_file() {
            return Err(ServeError::NotFound(selector.to_string()));
        }

        let file = File::open(&path)
            .await
            .map_err(|e| ServeError::from_io(selector, e))?;
        Ok((path, kind, file))
    }

    fn record(&self, state: &DirectorySession, error: Option<&str>) {
        let mut fields = vec![
            ("id", state.id.to_string()),
            ("selector", format!("{:?}", state.selector)),
            ("outcome", format!("{:?}", state.outcome)),
            ("bytes", state.bytes_sent.to_string()),
        ];
        if let Some(peer) = state.peer {
            fields.push(("peer", peer.to_string()));
        }
        if let Some(error) = error {
            fields.push(("error", error.to_string()));
        }
        self.observer.record("request.finished", &fields);
    }
}

/// Source of incoming connections for the accept loop.
#[async_trait]
trait Listener: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept connections until `shutdown` resolves. Each connection runs in its
/// own task that owns the stream; on shutdown no new connections are taken
/// and in-flight ones are awaited.
pub async fn serve<F>(listener: TcpListener, handler: Arc<RequestHandler>, shutdown: F)
where
    F: Future<Output = ()>,
{
    accept_loop(listener, handler, shutdown).await
}

async fn accept_loop<L, F>(listener: L, handler: Arc<RequestHandler>, shutdown: F)
where
    L: Listener,
    F: Future<Output = ()>,
{
    let mut tasks = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tasks.spawn(async move {
                        handler.handle(stream, Some(peer)).await;
                    });
                }
                Err(e) => {
                    handler.observer.record("accept.failed", &[("error", e.to_string())]);
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    handler.observer.record("connection.panicked", &[("error", e.to_string())]);
                }
            }
        }
    }

    handler
        .observer
        .record("server.draining", &[("connections", tasks.len().to_string())]);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            handler.observer.record("connection.panicked", &[("error", e.to_string())]);
        }
    }
}
