use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::AsyncWrite;
use url::form_urlencoded;

use crate::client::Retriever;
use crate::gopher::ItemType;
use crate::observe::Observer;
use crate::render::{ListingRenderer, RenderError};
use crate::transport::GopherError;

/// Attachment name used when the selector has no last segment.
pub const FALLBACK_FILENAME: &str = "unknown.bin";

/// Largest payload relayed unless configured otherwise.
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("No gopher host in request path")]
    NotFound,
    #[error("Unsupported item type: {0:?}")]
    UnsupportedType(String),
    #[error("Gopher request failed: {0}")]
    Upstream(#[from] GopherError),
    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("Render failed: {0}")]
    Render(#[from] RenderError),
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::NotFound => 404,
            GatewayError::UnsupportedType(_) => 400,
            GatewayError::Upstream(_) => 503,
            GatewayError::PayloadTooLarge { .. } => 502,
            GatewayError::Render(_) => 500,
        }
    }
}

/// An HTTP request translated into gopher terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    pub requested_type: ItemType,
    pub host: String,
    pub selector: String,
}

impl GatewayRequest {
    /// `path` is `/{host}/{selector...}`; the optional `type` query parameter
    /// names the item type and defaults to directory.
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, GatewayError> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let (host, selector) = match path.split_once('/') {
            Some((host, rest)) => (host, format!("/{}", rest)),
            None => (path, "/".to_string()),
        };
        if host.is_empty() {
            return Err(GatewayError::NotFound);
        }

        let tag = query.and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "type")
                .map(|(_, value)| value.into_owned())
        });
        let requested_type = match tag.as_deref() {
            None | Some("") => ItemType::Directory,
            Some(tag) => {
                let mut chars = tag.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => ItemType::from(c),
                    _ => return Err(GatewayError::UnsupportedType(tag.to_string())),
                }
            }
        };

        Ok(GatewayRequest {
            requested_type,
            host: host.to_string(),
            selector,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Listing,
    Stream {
        content_type: &'static str,
        attachment: bool,
    },
}

/// Which shape of response to expect for a type. The wire gives no hint, so
/// the requested type decides.
fn mode_for(itype: ItemType) -> Result<Mode, GatewayError> {
    let unsupported = || GatewayError::UnsupportedType(itype.to_char().to_string());
    match itype {
        // A search needs a query the gateway has no way to collect.
        ItemType::Search => Err(unsupported()),
        t if t.is_listing() => Ok(Mode::Listing),
        ItemType::File | ItemType::Uuencoded | ItemType::Gif => Ok(Mode::Stream {
            content_type: itype.mime(),
            attachment: false,
        }),
        ItemType::Binary | ItemType::BinHex | ItemType::DosBinary => Ok(Mode::Stream {
            content_type: itype.mime(),
            attachment: true,
        }),
        _ => Err(unsupported()),
    }
}

/// In-memory sink that refuses to grow past `limit` bytes.
struct CappedBuffer {
    body: Vec<u8>,
    limit: u64,
    exceeded: bool,
}

impl CappedBuffer {
    fn new(limit: u64) -> Self {
        CappedBuffer {
            body: Vec::new(),
            limit,
            exceeded: false,
        }
    }
}

impl AsyncWrite for CappedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.body.len() as u64 + buf.len() as u64 > this.limit {
            this.exceeded = true;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("payload exceeds {} bytes", this.limit),
            )));
        }
        this.body.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Last selector segment, fit for a `Content-Disposition` filename.
pub fn attachment_name(selector: &str) -> String {
    let name: String = selector
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    if name.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub content_type: String,
    pub content_disposition: Option<String>,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    fn ok(content_type: &str, body: Vec<u8>) -> Self {
        GatewayResponse {
            status: 200,
            content_type: content_type.to_string(),
            content_disposition: None,
            body,
        }
    }

    fn failure(err: &GatewayError) -> Self {
        GatewayResponse {
            status: err.status(),
            content_type: "text/plain; charset=utf-8".to_string(),
            content_disposition: None,
            body: format!("{}\n", err).into_bytes(),
        }
    }
}

/// Stateless HTTP-to-gopher translation. Payloads are buffered whole, up to
/// `max_payload` bytes, so a transfer that breaks halfway is answered with an
/// error status rather than a truncated body.
pub struct Gateway {
    retriever: Arc<dyn Retriever>,
    renderer: Arc<dyn ListingRenderer>,
    observer: Arc<dyn Observer>,
    max_payload: u64,
}

impl Gateway {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        renderer: Arc<dyn ListingRenderer>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Gateway {
            retriever,
            renderer,
            observer,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(mut self, bytes: u64) -> Self {
        self.max_payload = bytes;
        self
    }

    pub async fn handle(&self, path: &str, query: Option<&str>) -> GatewayResponse {
        match self.dispatch(path, query).await {
            Ok(response) => response,
            Err(e) => {
                self.observer.record(
                    "gateway.failed",
                    &[
                        ("path", path.to_string()),
                        ("status", e.status().to_string()),
                        ("error", e.to_string()),
                    ],
                );
                GatewayResponse::failure(&e)
            }
        }
    }

    pub async fn dispatch(&self, path: &str, query: Option<&str>) -> Result<GatewayResponse, GatewayError> {
        let request = GatewayRequest::parse(path, query)?;
        let mode = mode_for(request.requested_type)?;

        self.observer.record(
            "gateway.request",
            &[
                ("host", request.host.clone()),
                ("selector", request.selector.clone()),
                ("type", request.requested_type.to_char().to_string()),
            ],
        );

        match mode {
            Mode::Listing => {
                let items = self
                    .retriever
                    .fetch_listing(&request.host, &request.selector)
                    .await?;
                let body = self.renderer.render(&items)?;
                Ok(GatewayResponse::ok(self.renderer.content_type(), body))
            }
            Mode::Stream {
                content_type,
                attachment,
            } => {
                let mut sink = CappedBuffer::new(self.max_payload);
                let fetched = self
                    .retriever
                    .fetch_stream(&request.host, &request.selector, &mut sink)
                    .await;
                if let Err(e) = fetched {
                    if sink.exceeded {
                        return Err(GatewayError::PayloadTooLarge {
                            limit: self.max_payload,
                        });
                    }
                    return Err(e.into());
                }

                let mut response = GatewayResponse::ok(content_type, sink.body);
                if attachment {
                    response.content_disposition = Some(format!(
                        "attachment; filename=\"{}\"",
                        attachment_name(&request.selector)
                    ));
                }
                Ok(response)
            }
        }
    }
}
