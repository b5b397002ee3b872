//! Task execution with timeout, retry and backoff.
//!
//! One execution drives an adapter call to a definitive outcome:
//!
//! ```text
//! attempt ──▶ data ─────────────────────────────▶ Done(Some)
//!    │    ──▶ end of stream (events only) ──────▶ Done(None), a miss
//!    │    ──▶ terminal error ───────────────────▶ Failed
//!    │    ──▶ retryable error / timeout
//!    │            └─ attempts left? ─ no ───────▶ Failed
//!    │                     yes: emit `retry`, wait, attempt again
//! ```
//!
//! An attempt that times out is dropped: a success arriving afterwards is never
//! observed, so each execution yields exactly one outcome.
//!
//! A `retry` event emitted by the adapter is held back until the attempt ends.
//! If the attempt then fails retryably, its delay replaces the policy backoff
//! and exactly one `retry` event is emitted for that attempt.

use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use specscout_events::{EventPayload, LogLevel};

use super::types::RetryPolicy;
use crate::emit::EventSink;
use crate::source::{AdapterEvent, AdapterFailure, AdapterItem, AdapterStream};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for one attempt, from the call to its terminal item.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Definitive outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome<T> {
    /// `data` is `None` when the adapter ended without producing any.
    Done { data: Option<T>, retries: u32 },
    Failed {
        error: String,
        retries: u32,
        /// Every attempt ran out of time.
        timed_out: bool,
    },
    Cancelled { retries: u32 },
}

impl<T> ExecutionOutcome<T> {
    pub fn retries(&self) -> u32 {
        match self {
            Self::Done { retries, .. } | Self::Failed { retries, .. } | Self::Cancelled { retries } => *retries,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionOutcome<U> {
        match self {
            Self::Done { data, retries } => ExecutionOutcome::Done {
                data: data.map(f),
                retries,
            },
            Self::Failed {
                error,
                retries,
                timed_out,
            } => ExecutionOutcome::Failed {
                error,
                retries,
                timed_out,
            },
            Self::Cancelled { retries } => ExecutionOutcome::Cancelled { retries },
        }
    }
}

#[derive(Debug)]
struct HeldRetry {
    delay: Duration,
    reason: String,
}

enum AttemptEnd<T, E> {
    Data(T),
    Error(E),
    Exhausted,
}

/// Converts an adapter event into its stream form. `retry` is handled separately.
pub(crate) fn event_payload(event: AdapterEvent) -> EventPayload {
    match event {
        AdapterEvent::Log { level, message } => EventPayload::Log { level, message },
        AdapterEvent::Progress {
            stage,
            current,
            total,
            message,
        } => EventPayload::Progress {
            stage,
            current,
            total,
            message,
        },
        AdapterEvent::Retry { delay, reason } => EventPayload::log(
            LogLevel::Info,
            format!("source requested a retry in {}ms: {reason}", delay.as_millis()),
        ),
    }
}

/// Runs adapter calls under a [`RetryPolicy`] and a per-attempt timeout.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor {
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `call` until a definitive outcome.
    ///
    /// `call` starts one attempt. Events flow to `sink` in adapter order.
    /// `cancel` aborts at the next suspension point (attempt or backoff).
    pub async fn execute<T, E, F>(
        &self,
        mut call: F,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome<T>
    where
        F: FnMut() -> AdapterStream<T, E>,
        E: AdapterFailure,
    {
        let max_attempts = self.config.retry.attempts();
        let mut only_timeouts = true;
        let mut attempt = 1;

        loop {
            let mut held: Option<HeldRetry> = None;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ExecutionOutcome::Cancelled { retries: attempt - 1 },
                r = tokio::time::timeout(self.config.timeout, drive(call(), sink, &mut held)) => r,
            };

            let (error, retryable, hinted) = match result {
                Ok(AttemptEnd::Data(data)) => {
                    if let Some(hint) = held {
                        sink.emit(retry_event(attempt, max_attempts, hint.delay, hint.reason));
                    }
                    return ExecutionOutcome::Done {
                        data: Some(data),
                        retries: attempt - 1,
                    };
                }
                Ok(AttemptEnd::Exhausted) => {
                    sink.emit(EventPayload::log(LogLevel::Warn, "source finished without data"));
                    return ExecutionOutcome::Done {
                        data: None,
                        retries: attempt - 1,
                    };
                }
                Ok(AttemptEnd::Error(err)) => {
                    only_timeouts = false;
                    (err.to_string(), err.is_retryable(), err.retry_after())
                }
                Err(_) => (
                    format!("attempt timed out after {}ms", self.config.timeout.as_millis()),
                    true,
                    None,
                ),
            };

            if !retryable || attempt >= max_attempts {
                debug!(attempt, max_attempts, error = %error, "execution failed");
                sink.emit(EventPayload::log(LogLevel::Error, error.clone()));
                return ExecutionOutcome::Failed {
                    error,
                    retries: attempt - 1,
                    timed_out: only_timeouts,
                };
            }

            let delay = held
                .as_ref()
                .map(|h| h.delay)
                .or(hinted)
                .unwrap_or_else(|| self.config.retry.delay_for_attempt(attempt));
            sink.emit(retry_event(attempt, max_attempts, delay, error));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ExecutionOutcome::Cancelled { retries: attempt },
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn retry_event(attempt: u32, max_attempts: u32, delay: Duration, reason: String) -> EventPayload {
    EventPayload::Retry {
        attempt,
        max_attempts,
        delay_ms: delay.as_millis() as u64,
        reason,
    }
}

async fn drive<T, E>(
    mut stream: AdapterStream<T, E>,
    sink: &dyn EventSink,
    held: &mut Option<HeldRetry>,
) -> AttemptEnd<T, E> {
    while let Some(item) = stream.next().await {
        match item {
            Ok(AdapterItem::Data(data)) => return AttemptEnd::Data(data),
            Ok(AdapterItem::Event(AdapterEvent::Retry { delay, reason })) => {
                *held = Some(HeldRetry { delay, reason });
            }
            Ok(AdapterItem::Event(event)) => sink.emit(event_payload(event)),
            Err(err) => return AttemptEnd::Error(err),
        }
    }
    AttemptEnd::Exhausted
}
