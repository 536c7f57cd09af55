use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use axum::body::{boxed, Full};
use axum::extract::{Path, RawQuery, State};
use axum::http::{self, header, StatusCode};
use axum::response::Response;
use axum::{routing::get, Router as AxumRouter};
use tracing::{error, info};

use gopher_core::{Gateway, GatewayResponse};

pub fn app(gateway: Arc<Gateway>) -> AxumRouter {
    AxumRouter::new()
        .route("/", get(handle_root))
        .route("/*path", get(handle_gateway))
        .with_state(gateway)
}

/// Serve the gateway on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, gateway: Arc<Gateway>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    info!(listener = %listener.local_addr()?, "Starting gopher proxy");
    axum::Server::from_tcp(listener)?
        .serve(app(gateway).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn handle_root(State(gateway): State<Arc<Gateway>>, RawQuery(query): RawQuery) -> Response {
    into_response(gateway.handle("/", query.as_deref()).await)
}

async fn handle_gateway(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    into_response(gateway.handle(&path, query.as_deref()).await)
}

fn into_response(resp: GatewayResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, resp.content_type);
    if let Some(disposition) = resp.content_disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    builder.body(boxed(Full::from(resp.body))).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build gateway response");
        let mut fallback = Response::new(boxed(Full::from("invalid response headers\n")));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}
