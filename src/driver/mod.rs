//! Database drivers behind the [`Driver`](crate::connection::Driver) seam.
//!
//! `postgres://` endpoints are served by tokio-postgres; `memory://name`
//! endpoints by an in-process database looked up in a shared catalog.

pub mod memory;
pub mod postgres;

use crate::connection::Driver;
use crate::connection::config::Endpoint;
use crate::core::{Result, RouterError};
use memory::{MemoryCatalog, MemoryDriver};
use postgres::PostgresDriver;
use std::sync::Arc;

/// Builds drivers for endpoint URLs by scheme.
#[derive(Clone, Default)]
pub struct DriverFactory {
    memory: MemoryCatalog,
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing catalog so callers can reach the same in-process
    /// databases the router talks to.
    pub fn with_memory_catalog(memory: MemoryCatalog) -> Self {
        Self { memory }
    }

    pub fn memory_catalog(&self) -> &MemoryCatalog {
        &self.memory
    }

    pub fn driver_for(&self, url: &str) -> Result<Arc<dyn Driver>> {
        let endpoint = Endpoint::parse(url)?;

        match endpoint.scheme.as_str() {
            "postgres" | "postgresql" => Ok(Arc::new(PostgresDriver::new(url)?)),
            "memory" => Ok(Arc::new(MemoryDriver::new(
                self.memory.database(&endpoint.host),
            ))),
            other => Err(RouterError::Config(format!(
                "Unsupported database scheme '{}' in '{}'",
                other,
                endpoint.redacted()
            ))),
        }
    }
}
