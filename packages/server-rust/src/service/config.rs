use std::sync::{Arc, OnceLock};

use ctrlshift_core::{Error, Result};
use regex::Regex;

use super::mapping::PathMapping;

/// Server-level defaults applied to every request context.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hostname used in context descriptions when the request carries none.
    pub default_hostname: String,
    /// Initial request timeout in milliseconds. `0` disables the timeout.
    pub default_request_timeout_ms: u64,
    /// Initial maximum request length in bytes. `0` disables the limit.
    pub default_max_request_length: u64,
    /// Prefix prepended to every service logger name.
    pub service_logger_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_hostname: "localhost".to_string(),
            default_request_timeout_ms: 10_000,
            default_max_request_length: 10 * 1024 * 1024,
            service_logger_prefix: "ctrlshift.services".to_string(),
        }
    }
}

const LOGGER_NAME_PATTERN: &str = r"^[\p{L}_][\p{L}\p{Nd}_]*(?:\.[\p{L}_][\p{L}\p{Nd}_]*)*$";

fn is_valid_logger_name(name: &str) -> Result<bool> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(pattern) = PATTERN.get() {
        return Ok(pattern.is_match(name));
    }
    let compiled = Regex::new(LOGGER_NAME_PATTERN).map_err(Error::other)?;
    Ok(PATTERN.get_or_init(|| compiled).is_match(name))
}

/// Binding of one service to a route, as seen by the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    route: PathMapping,
    logger_name: String,
    server: Arc<ServerConfig>,
}

impl ServiceConfig {
    /// Binds a service at `route`, naming its logger after the route.
    #[must_use]
    pub fn new(route: PathMapping, server: Arc<ServerConfig>) -> Self {
        let logger_name = route.logger_name();
        Self {
            route,
            logger_name,
            server,
        }
    }

    /// Overrides the logger name.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless `name` is a dot-separated list of identifiers.
    pub fn with_logger_name(mut self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_logger_name(&name)? {
            return Err(Error::InvalidArgument(format!(
                "logger_name: {name} (expected: a dot-separated identifier)"
            )));
        }
        self.logger_name = name;
        Ok(self)
    }

    #[must_use]
    pub fn route(&self) -> &PathMapping {
        &self.route
    }

    #[must_use]
    pub fn logger_name(&self) -> &str {
        &self.logger_name
    }

    /// `<service_logger_prefix>.<logger_name>`.
    #[must_use]
    pub fn full_logger_name(&self) -> String {
        format!("{}.{}", self.server.service_logger_prefix, self.logger_name)
    }

    #[must_use]
    pub fn server(&self) -> &Arc<ServerConfig> {
        &self.server
    }
}
