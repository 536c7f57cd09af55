pub mod gopher;
pub mod transport;
pub mod client;
pub mod server;
pub mod gateway;
pub mod render;
pub mod observe;

pub use gopher::{is_terminator, parse_line, serialize_item, serialize_listing, Item, ItemType, ParseError};
pub use transport::{GopherError, Session, TransportConfig, DEFAULT_PORT};
pub use client::{EmptyLine, GopherClient, ListingPolicy, Retriever};
pub use server::{resolve_selector, serve, DirectorySession, HandlerError, Outcome, RequestHandler, ServeError};
pub use gateway::{Gateway, GatewayError, GatewayRequest, GatewayResponse, DEFAULT_MAX_PAYLOAD};
pub use render::{render_text, HtmlRenderer, ListingRenderer, RenderError};
pub use observe::{NullObserver, Observer, TracingObserver};
