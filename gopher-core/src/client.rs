use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::gopher::{is_terminator, parse_line, Item};
use crate::observe::Observer;
use crate::transport::{host_name, GopherError, Session, TransportConfig};

/// What an empty line in the middle of a listing means. Servers disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyLine {
    #[default]
    Terminate,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListingPolicy {
    pub empty_line: EmptyLine,
}

/// Fetches gopher resources. The caller picks listing or stream mode from the
/// item type it already knows; the wire format does not say which it is.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn fetch_listing(&self, host: &str, selector: &str) -> Result<Vec<Item>, GopherError>;

    async fn fetch_stream(
        &self,
        host: &str,
        selector: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, GopherError>;
}

pub struct GopherClient {
    transport: TransportConfig,
    policy: ListingPolicy,
    observer: Arc<dyn Observer>,
}

impl GopherClient {
    pub fn new(transport: TransportConfig, policy: ListingPolicy, observer: Arc<dyn Observer>) -> Self {
        GopherClient {
            transport,
            policy,
            observer,
        }
    }

    /// Fetch a text document and drop the trailing dot line some servers send.
    pub async fn fetch_text(&self, host: &str, selector: &str) -> Result<String, GopherError> {
        let mut session = Session::open(host, &self.transport).await?;
        session.send_selector(selector).await?;
        let body = session.read_all().await?;

        let content = String::from_utf8_lossy(&body);
        let mut lines: Vec<&str> = content.lines().collect();
        if let Some(last) = lines.last() {
            if *last == "." {
                lines.pop();
            }
        }

        self.observer.record(
            "text.fetched",
            &[
                ("host", host.to_string()),
                ("selector", selector.to_string()),
                ("bytes", body.len().to_string()),
            ],
        );
        Ok(lines.join("\n"))
    }

    /// Query a full-text search server (type 7); the answer is a listing.
    pub async fn search(&self, host: &str, selector: &str, query: &str) -> Result<Vec<Item>, GopherError> {
        let mut session = Session::open(host, &self.transport).await?;
        session.send_search(selector, query).await?;
        let result = read_listing(&mut session, host, self.policy).await;
        self.record_listing("search", host, selector, &result);
        result
    }

    async fn listing(&self, host: &str, selector: &str) -> Result<Vec<Item>, GopherError> {
        let mut session = Session::open(host, &self.transport).await?;
        session.send_selector(selector).await?;
        read_listing(&mut session, host, self.policy).await
    }

    async fn stream(
        &self,
        host: &str,
        selector: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, GopherError> {
        let mut session = Session::open(host, &self.transport).await?;
        session.send_selector(selector).await?;
        session.copy_to(sink).await
    }

    fn record_listing(&self, kind: &str, host: &str, selector: &str, result: &Result<Vec<Item>, GopherError>) {
        match result {
            Ok(items) => self.observer.record(
                &format!("{}.fetched", kind),
                &[
                    ("host", host.to_string()),
                    ("selector", selector.to_string()),
                    ("items", items.len().to_string()),
                ],
            ),
            Err(e) => self.observer.record(
                &format!("{}.failed", kind),
                &[
                    ("host", host.to_string()),
                    ("selector", selector.to_string()),
                    ("error", e.to_string()),
                ],
            ),
        }
    }
}

#[async_trait]
impl Retriever for GopherClient {
    async fn fetch_listing(&self, host: &str, selector: &str) -> Result<Vec<Item>, GopherError> {
        let result = self.listing(host, selector).await;
        self.record_listing("listing", host, selector, &result);
        result
    }

    async fn fetch_stream(
        &self,
        host: &str,
        selector: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, GopherError> {
        let result = self.stream(host, selector, sink).await;

        match &result {
            Ok(n) => self.observer.record(
                "stream.fetched",
                &[
                    ("host", host.to_string()),
                    ("selector", selector.to_string()),
                    ("bytes", n.to_string()),
                ],
            ),
            Err(e) => self.observer.record(
                "stream.failed",
                &[
                    ("host", host.to_string()),
                    ("selector", selector.to_string()),
                    ("error", e.to_string()),
                ],
            ),
        }
        result
    }
}

/// Read menu lines until a terminator or end of stream. A bad line fails the
/// whole listing; nothing parsed before it is returned.
pub async fn read_listing<S>(
    session: &mut Session<S>,
    host: &str,
    policy: ListingPolicy,
) -> Result<Vec<Item>, GopherError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let origin = host_name(host);
    let mut items = Vec::new();

    while let Some(line) = session.read_line().await? {
        if line.is_empty() && policy.empty_line == EmptyLine::Skip {
            continue;
        }
        if is_terminator(&line) {
            break;
        }

        let mut item = parse_line(&line)?;
        item.is_external = !item.host.eq_ignore_ascii_case(&origin);
        items.push(item);
    }

    Ok(items)
}
