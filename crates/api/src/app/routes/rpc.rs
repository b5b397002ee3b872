//! `POST /rpc`: request/response methods.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use specscout_core::NewJob;

use crate::app::dto::{ControlResult, JobIdParams, ListResult, RpcRequest, RpcResponse, SetWorkersParams};
use crate::app::errors::RpcError;
use crate::app::services::AppServices;

/// Methods only served by `/rpc/stream`.
pub const STREAMING_METHODS: [&str; 3] = ["search", "scrape", "bulk.subscribe"];

pub async fn call(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<RpcRequest>, JsonRejection>,
) -> axum::response::Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return error_response(JsonValue::Null, RpcError::invalid_params(rejection.body_text())),
    };
    debug!(method = %req.method, "rpc call");

    match dispatch(&services, &req).await {
        Ok(result) => Json(RpcResponse::Result { id: req.id, result }).into_response(),
        Err(error) => error_response(req.id, error),
    }
}

pub fn error_response(id: JsonValue, error: RpcError) -> axum::response::Response {
    (error.status(), Json(RpcResponse::Error { id, error })).into_response()
}

async fn dispatch(services: &AppServices, req: &RpcRequest) -> Result<JsonValue, RpcError> {
    let bulk = &services.bulk;
    match req.method.as_str() {
        "bulk.start" => {
            let params: NewJob = req.params()?;
            to_json(&bulk.start(params).await?)
        }
        "bulk.pause" => {
            let params: JobIdParams = req.params()?;
            to_json(&ControlResult::ok(bulk.pause(params.job_id).await?))
        }
        "bulk.resume" => {
            let params: JobIdParams = req.params()?;
            to_json(&ControlResult::ok(bulk.resume(params.job_id).await?))
        }
        "bulk.setWorkers" => {
            let params: SetWorkersParams = req.params()?;
            to_json(&ControlResult::ok(bulk.set_workers(params.job_id, params.worker_count).await?))
        }
        "bulk.list" => to_json(&ListResult { jobs: bulk.list()? }),
        "bulk.get" => {
            let params: JobIdParams = req.params()?;
            to_json(&bulk.get(params.job_id)?)
        }
        method if STREAMING_METHODS.contains(&method) => Err(RpcError::invalid_params(format!(
            "{method} streams its result; call it through /rpc/stream"
        ))),
        method => Err(RpcError::method_not_found(method)),
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<JsonValue, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(format!("failed to encode result: {e}")))
}
