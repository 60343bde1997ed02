//! Tower middleware layers for request services.
//!
//! - [`access_log`]: Context propagation, request log completion and timing spans
//! - [`timeout`]: Per-request timeout enforcement following the context
//! - [`pipeline`]: Binds a service and composes all layers into a single stack

pub mod access_log;
pub mod pipeline;
pub mod timeout;

pub use access_log::AccessLogLayer;
pub use pipeline::build_service_pipeline;
pub use timeout::TimeoutLayer;
