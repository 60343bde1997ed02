//! Pipeline composition: binds a service at its route and wraps it with the
//! middleware layers.

use ctrlshift_core::Result;
use tower::ServiceBuilder;

use super::access_log::AccessLogLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::ServiceConfig;
use crate::service::{boxed, BoxedService, RequestService};

/// Notifies `service` that it was bound under `config` and wraps it with the
/// middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `AccessLogLayer` -- pushes the context and completes the request log
/// 2. `TimeoutLayer` -- enforces the context's request timeout
///
/// # Errors
///
/// Propagates the rejection of [`RequestService::service_added`].
pub fn build_service_pipeline<I, O>(
    config: &ServiceConfig,
    mut service: BoxedService<I, O>,
) -> Result<BoxedService<I, O>>
where
    I: Send + 'static,
    O: Send + 'static,
{
    service.service_added(config)?;
    Ok(boxed(
        ServiceBuilder::new()
            .layer(AccessLogLayer)
            .layer(TimeoutLayer)
            .service(service),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
