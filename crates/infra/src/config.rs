//! Configuration loading and representation.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::jobs::{BackoffStrategy, CompletionPolicy, ExecutorConfig, ManagerConfig, RetryPolicy};
use crate::transport::TransportConfig;

/// Which broker backs the message transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Memory,
    Redis,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("unknown transport: {other} (expected memory or redis)"),
        }
    }
}

/// Where device data is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    /// External adapter service at `url`.
    Http { name: String, url: String },
    /// Canned in-process data, for development and tests only.
    Scripted,
}

impl SourceConfig {
    /// `SOURCE_ADAPTER` selects the kind (`http` unless set); `http` requires a URL.
    fn resolve(kind: Option<String>, url: Option<String>) -> Result<Self> {
        match kind.as_deref().map(|k| k.trim().to_ascii_lowercase()).as_deref() {
            None | Some("http") => {
                let url = url
                    .filter(|u| !u.trim().is_empty())
                    .context("SOURCE_ADAPTER_URL must be set (or SOURCE_ADAPTER=scripted for development)")?;
                Ok(Self::Http {
                    name: "gsmarena".to_string(),
                    url,
                })
            }
            Some("scripted") => Ok(Self::Scripted),
            Some(other) => anyhow::bail!("unknown source adapter: {other} (expected http or scripted)"),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub transport: TransportKind,
    pub redis_url: String,
    pub queue_prefix: String,
    pub message_retries: u32,
    pub error_queue: String,
    pub default_workers: u32,
    pub task_timeout: Duration,
    pub task_max_attempts: u32,
    pub task_backoff: Duration,
    pub task_backoff_strategy: BackoffStrategy,
    pub timeout_retry_delay: Duration,
    pub timeout_retry_rounds: u32,
    pub completion: CompletionPolicy,
    pub event_buffer: usize,
    pub source: SourceConfig,
    pub log_format: String,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            transport: TransportKind::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            queue_prefix: "specscout".to_string(),
            message_retries: 3,
            error_queue: "errors".to_string(),
            default_workers: 4,
            task_timeout: Duration::from_secs(30),
            task_max_attempts: 3,
            task_backoff: Duration::from_millis(1000),
            task_backoff_strategy: BackoffStrategy::Exponential,
            timeout_retry_delay: Duration::from_secs(60),
            timeout_retry_rounds: 1,
            completion: CompletionPolicy::default(),
            event_buffer: 256,
            source: SourceConfig::Scripted,
            log_format: "json".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        let defaults = Self::default();

        Ok(Self {
            bind_addr: parsed("BIND_ADDR", defaults.bind_addr)?,
            transport: parsed("TRANSPORT", defaults.transport)?,
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_prefix: env::var("QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            message_retries: parsed("MESSAGE_RETRIES", defaults.message_retries)?,
            error_queue: env::var("ERROR_QUEUE").unwrap_or(defaults.error_queue),
            default_workers: parsed("DEFAULT_WORKERS", defaults.default_workers)?,
            task_timeout: millis("TASK_TIMEOUT_MS", defaults.task_timeout)?,
            task_max_attempts: parsed("TASK_MAX_ATTEMPTS", defaults.task_max_attempts)?,
            task_backoff: millis("TASK_BACKOFF_MS", defaults.task_backoff)?,
            task_backoff_strategy: parsed("TASK_BACKOFF_STRATEGY", defaults.task_backoff_strategy)?,
            timeout_retry_delay: millis("TIMEOUT_RETRY_DELAY_MS", defaults.timeout_retry_delay)?,
            timeout_retry_rounds: parsed("TIMEOUT_RETRY_ROUNDS", defaults.timeout_retry_rounds)?,
            completion: CompletionPolicy {
                max_failed_tasks: parsed("JOB_MAX_FAILED_TASKS", defaults.completion.max_failed_tasks)?,
                max_failed_ratio: optional("JOB_MAX_FAILED_RATIO")?,
            },
            event_buffer: parsed("EVENT_BUFFER", defaults.event_buffer)?,
            source: SourceConfig::resolve(env::var("SOURCE_ADAPTER").ok(), env::var("SOURCE_ADAPTER_URL").ok())?,
            log_format: env::var("LOG_FORMAT").unwrap_or(defaults.log_format),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::default()
            .with_message_retries(self.message_retries)
            .with_error_queue(self.error_queue.clone())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: self.task_timeout,
            retry: RetryPolicy::with_strategy(
                self.task_backoff_strategy,
                self.task_max_attempts,
                self.task_backoff,
                self.task_backoff.saturating_mul(30),
            ),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            default_workers: self.default_workers,
            completion: self.completion.clone(),
            timeout_retry_delay: self.timeout_retry_delay,
            timeout_retry_rounds: self.timeout_retry_rounds,
            ..ManagerConfig::default()
        }
    }
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} must be valid (got {raw:?})")),
        Err(_) => Ok(default),
    }
}

fn optional<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} must be valid (got {raw:?})")),
        _ => Ok(None),
    }
}

fn millis(key: &str, default: Duration) -> Result<Duration> {
    let ms: u64 = parsed(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
