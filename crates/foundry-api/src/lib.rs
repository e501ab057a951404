//! foundry-api — HTTP surfaces of the build agent and the router.

pub mod error;
pub mod handlers;

use std::future::Future;

use axum::routing::{any, delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use error::ApiError;
pub use handlers::{BuilderState, RouterState};

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Routes served by a build agent.
pub fn builder_app(state: BuilderState) -> Router {
    Router::new()
        .route("/v1/build", post(handlers::build::handle_build))
        .route("/v1/upload", post(handlers::build::handle_build))
        .route("/v1/build/{id}", delete(handlers::build::handle_cleanup))
        .route(
            "/v1/download/{id}/{*path}",
            get(handlers::download::handle_download),
        )
        .route("/health-check", get(handlers::health::handle_health))
        .with_state(state)
        .layer(cors())
}

/// Routes served by the router. Every path other than the health check
/// answers with the best build agent.
pub fn router_app(state: RouterState) -> Router {
    Router::new()
        .route("/health-check", get(handlers::health::handle_health))
        .route("/", any(handlers::route::handle_route))
        .route("/find-build-agent", any(handlers::route::handle_route))
        .fallback(handlers::route::handle_route)
        .with_state(state)
        .layer(cors())
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!(%addr, "HTTP server stopped");
    Ok(())
}
