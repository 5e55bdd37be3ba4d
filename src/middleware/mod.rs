pub mod logging;
pub mod metrics;

pub use logging::AccessLog;
pub use metrics::HttpMetrics;
