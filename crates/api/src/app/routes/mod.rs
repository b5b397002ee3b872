use axum::{Router, routing::post};

pub mod rpc;
pub mod stream;
pub mod system;

/// Router for the RPC endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/rpc", post(rpc::call))
        .route("/rpc/stream", post(stream::call))
}
