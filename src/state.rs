//! # Application State Management
//!
//! Shared state for all HTTP request handlers and the WebSocket actors.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Every HTTP request and every connected socket needs the same registry
//! - **Thread safety**: Safe to share between threads
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers can hold a reference)
//! - **RwLock**: Multiple readers OR one writer at a time
//! - **T**: The actual data being protected
//!
//! The registry and correlation layers carry their own interior locking, so
//! they are shared as plain `Arc`s; only the config and metrics sit behind
//! an `RwLock` here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::auth::{build_validator, TokenValidator};
use crate::comms::correlation::CorrelationBus;
use crate::comms::proxy::ToolProxy;
use crate::config::AppConfig;
use crate::runner::{EchoRunnerFactory, RunnerFactory};
use crate::session::registry::ConnectionRegistry;

/// The main application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be read at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,

    /// All connected clients and their per-client resources
    pub registry: Arc<ConnectionRegistry>,

    /// Correlated command requests awaiting client responses
    pub correlation: Arc<CorrelationBus>,

    /// Tool-proxy requests awaiting client responses
    pub proxy: Arc<ToolProxy>,

    /// Resolves admission tokens into user contexts
    pub token_validator: Arc<dyn TokenValidator>,

    /// Creates one conversation runner per admitted client
    pub runner_factory: Arc<dyn RunnerFactory>,

    /// Shared HTTP client for upstream calls (identity, weather)
    pub http: reqwest::Client,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Detailed metrics for each API endpoint
    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Wire up the full application from configuration.
    ///
    /// The correlation bus and tool proxy are shared between the registry
    /// (which cancels pending calls on disconnect) and the HTTP surface
    /// (which issues tool-proxy calls), so they are built once here.
    pub fn new(config: AppConfig) -> Self {
        let http = reqwest::Client::new();
        let correlation = Arc::new(CorrelationBus::new(config.sessions.command_timeout()));
        let proxy = Arc::new(ToolProxy::new(config.sessions.tool_proxy_timeout()));
        let registry = Arc::new(ConnectionRegistry::new(
            correlation.clone(),
            proxy.clone(),
            config.wakeword.clone(),
        ));
        let token_validator = build_validator(&config.auth, http.clone());

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            correlation,
            proxy,
            token_validator,
            runner_factory: Arc::new(EchoRunnerFactory),
            http,
        }
    }

    /// Swap in a different runner factory (the real agent engine binding).
    pub fn with_runner_factory(mut self, factory: Arc<dyn RunnerFactory>) -> Self {
        self.runner_factory = factory;
        self
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't
    /// blocked. AppConfig is designed to be cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so we don't hold the lock while sending the HTTP
    /// response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);

        let endpoint = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(endpoint.request_count, 2);
        assert_eq!(endpoint.average_duration_ms(), 20.0);
        assert_eq!(endpoint.error_rate(), 0.5);
    }
}
