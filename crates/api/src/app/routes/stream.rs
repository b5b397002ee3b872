//! `POST /rpc/stream`: streamed methods over SSE.
//!
//! Setup failures (bad params, unknown source or job) are answered like `/rpc`
//! errors. Once the stream is open every frame is `{id, event}`, `{id, result}`
//! or `{id, error}`; the stream ends after the final result or `bulk.done`.
//! Closing the connection cancels a running search/scrape.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use specscout_events::{StreamEvent, Subscription};
use specscout_infra::jobs::{JobSnapshot, JobSubscription};
use specscout_infra::{CallStream, ServiceItem};

use crate::app::dto::{JobIdParams, RpcRequest, ScrapeParams, SearchParams, StreamFrame};
use crate::app::errors::RpcError;
use crate::app::routes::rpc::{error_response, to_json};
use crate::app::services::AppServices;

type SseStream = BoxStream<'static, Result<SseEvent, Infallible>>;

pub async fn call(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<RpcRequest>, JsonRejection>,
) -> axum::response::Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return error_response(JsonValue::Null, RpcError::invalid_params(rejection.body_text())),
    };
    debug!(method = %req.method, "rpc stream opened");

    match open(&services, &req) {
        Ok(frames) => Sse::new(frames)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response(),
        Err(error) => error_response(req.id, error),
    }
}

fn open(services: &AppServices, req: &RpcRequest) -> Result<SseStream, RpcError> {
    let id = req.id.clone();
    match req.method.as_str() {
        "search" => {
            let params: SearchParams = req.params()?;
            Ok(call_frames(id, services.scrape.search(&params.query, params.source.as_deref())?))
        }
        "scrape" => {
            let params: ScrapeParams = req.params()?;
            Ok(call_frames(id, services.scrape.scrape(&params.slug, params.source.as_deref())?))
        }
        "bulk.subscribe" => {
            let params: JobIdParams = req.params()?;
            match services.bulk.subscribe(params.job_id)? {
                JobSubscription::Live { snapshot, events } => Ok(job_frames(id, snapshot, events)),
                JobSubscription::Finished(snapshot) => Ok(stream::iter([snapshot_frame(&id, &snapshot)]).boxed()),
            }
        }
        method => Err(RpcError::method_not_found(method)),
    }
}

/// Frames of one facade call: its events, then its data or error.
fn call_frames<T>(id: JsonValue, call: CallStream<T>) -> SseStream
where
    T: Serialize + Send + 'static,
{
    call.map(move |item| -> Result<SseEvent, Infallible> {
        let frame = match item {
            ServiceItem::Event(event) => return Ok(event_frame(&id, event)),
            ServiceItem::Data(data) => match to_json(&data) {
                Ok(result) => StreamFrame::<()>::Result { id: id.clone(), result },
                Err(error) => StreamFrame::Error { id: id.clone(), error },
            },
            ServiceItem::Error(err) => StreamFrame::Error {
                id: id.clone(),
                error: err.into(),
            },
        };
        Ok(sse(frame_name(&frame), &frame))
    })
    .boxed()
}

/// Frames of a live job: the current snapshot, then its events up to `bulk.done`.
fn job_frames(id: JsonValue, snapshot: JobSnapshot, events: Subscription) -> SseStream {
    let head = snapshot_frame(&id, &snapshot);
    let events = stream::unfold((events, false), |(mut events, finished)| async move {
        if finished {
            return None;
        }
        let event = events.recv().await?;
        let finished = event.event().is_terminal();
        Some((event, (events, finished)))
    });
    stream::iter([head])
        .chain(events.map(move |event| Ok(event_frame(&id, event))))
        .boxed()
}

fn snapshot_frame(id: &JsonValue, snapshot: &JobSnapshot) -> Result<SseEvent, Infallible> {
    let frame = match to_json(snapshot) {
        Ok(result) => StreamFrame::<()>::Result { id: id.clone(), result },
        Err(error) => StreamFrame::Error { id: id.clone(), error },
    };
    Ok(sse(frame_name(&frame), &frame))
}

fn event_frame(id: &JsonValue, event: StreamEvent) -> SseEvent {
    let name = event.event().event_type();
    sse(name, &StreamFrame::Event { id: id.clone(), event })
}

fn frame_name<E: Serialize>(frame: &StreamFrame<E>) -> &'static str {
    match frame {
        StreamFrame::Event { .. } => "event",
        StreamFrame::Result { .. } => "result",
        StreamFrame::Error { .. } => "error",
    }
}

fn sse<E: Serialize>(name: &'static str, frame: &StreamFrame<E>) -> SseEvent {
    let data = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(name).data(data)
}
