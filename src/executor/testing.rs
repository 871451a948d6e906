//! Shard backed by a driver that checks parameter counts before any I/O,
//! the way the Postgres driver binds parameters.

use crate::connection::config::PoolConfig;
use crate::connection::pool::ConnectionPool;
use crate::connection::{Driver, DriverConnection};
use crate::core::{Result, RouterError, Value};
use crate::result::QueryResult;
use crate::shard::Shard;
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) struct OneParamDriver;

struct OneParamConnection;

#[async_trait]
impl Driver for OneParamDriver {
    fn name(&self) -> &'static str {
        "one-param"
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        Ok(Box::new(OneParamConnection))
    }
}

#[async_trait]
impl DriverConnection for OneParamConnection {
    async fn execute(&mut self, _sql: &str, params: &[Value]) -> Result<QueryResult> {
        if params.len() != 1 {
            return Err(RouterError::Validation(format!(
                "statement expects 1 parameter, got {}",
                params.len()
            )));
        }
        Ok(QueryResult::affected("INSERT", 1))
    }

    async fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn one_param_shard() -> Shard {
    let pool = ConnectionPool::new(
        "strict/primary",
        PoolConfig::new("memory://strict"),
        Arc::new(OneParamDriver),
    )
    .unwrap();
    Shard::new("strict", "Strict", Vec::new(), pool, Vec::new())
}
