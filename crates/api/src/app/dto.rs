use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use specscout_core::{Job, JobId};
use specscout_infra::jobs::JobSnapshot;

use crate::app::errors::RpcError;

// -------------------------
// Envelopes
// -------------------------

/// `{id, method, params}` request envelope shared by `/rpc` and `/rpc/stream`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: JsonValue,
    pub method: String,
    #[serde(default)]
    pub params: JsonValue,
}

impl RpcRequest {
    /// Decode `params` into the method's parameter type. Missing params decode
    /// as an empty object.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcError> {
        let params = match &self.params {
            JsonValue::Null => JsonValue::Object(Default::default()),
            other => other.clone(),
        };
        Ok(serde_json::from_value(params)?)
    }
}

/// `{id, result}` or `{id, error}`.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Result { id: JsonValue, result: JsonValue },
    Error { id: JsonValue, error: RpcError },
}

/// One SSE frame of a streamed call.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StreamFrame<E: Serialize> {
    Event { id: JsonValue, event: E },
    Result { id: JsonValue, result: JsonValue },
    Error { id: JsonValue, error: RpcError },
}

// -------------------------
// Params
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeParams {
    pub slug: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdParams {
    pub job_id: JobId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetWorkersParams {
    pub job_id: JobId,
    pub worker_count: u32,
}

// -------------------------
// Results
// -------------------------

/// Result of `bulk.pause` / `bulk.resume` / `bulk.setWorkers`.
#[derive(Debug, Serialize)]
pub struct ControlResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
}

impl ControlResult {
    pub fn ok(job: Job) -> Self {
        Self {
            success: true,
            job: Some(job),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResult {
    pub jobs: Vec<JobSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_params_decode_as_an_empty_object() {
        #[derive(Debug, Deserialize)]
        struct Empty {}

        let req: RpcRequest = serde_json::from_value(json!({ "id": 1, "method": "bulk.list" })).unwrap();
        assert!(req.params::<Empty>().is_ok());
    }

    #[test]
    fn bad_params_are_invalid_params() {
        let req: RpcRequest = serde_json::from_value(json!({
            "id": "a",
            "method": "bulk.pause",
            "params": { "jobId": "not-a-uuid" },
        }))
        .unwrap();
        let err = req.params::<JobIdParams>().unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn responses_render_as_id_plus_result_or_error() {
        let ok = serde_json::to_value(RpcResponse::Result {
            id: json!(7),
            result: json!({ "success": true }),
        })
        .unwrap();
        assert_eq!(ok, json!({ "id": 7, "result": { "success": true } }));

        let err = serde_json::to_value(RpcResponse::Error {
            id: json!(7),
            error: RpcError::not_found("job not found"),
        })
        .unwrap();
        assert_eq!(err["error"]["code"], "not_found");
        assert!(err["error"].get("details").is_none());
    }
}
