use crate::connection::{Driver, DriverConnection};
use crate::core::{Result, RouterError, Value};
use crate::result::{QueryResult, command_tag};
use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls, Row, Statement};
use tracing::{debug, warn};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL driver over tokio-postgres.
pub struct PostgresDriver {
    config: tokio_postgres::Config,
}

impl PostgresDriver {
    pub fn new(url: &str) -> Result<Self> {
        let config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| RouterError::Config(format!("Invalid PostgreSQL URL: {}", e)))?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<Box<dyn DriverConnection>> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(pg_error)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection terminated: {}", e);
            }
        });

        Ok(Box::new(PostgresConnection {
            client,
            statement_timeout: None,
        }))
    }
}

pub struct PostgresConnection {
    client: Client,
    /// Last `statement_timeout` applied to this session
    statement_timeout: Option<Duration>,
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let statement = self.client.prepare(sql).await.map_err(pg_error)?;
        let bound = bind_params(&statement, params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let command = command_tag(sql);

        if statement.columns().is_empty() {
            let affected = self
                .client
                .execute(&statement, &refs)
                .await
                .map_err(pg_error)?;
            return Ok(QueryResult::affected(command, affected));
        }

        let rows = self.client.query(&statement, &refs).await.map_err(pg_error)?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = rows.iter().map(row_values).collect::<Result<Vec<_>>>()?;

        Ok(QueryResult::with_rows(command, columns, rows))
    }

    async fn begin(&mut self) -> Result<()> {
        self.client.batch_execute("BEGIN").await.map_err(pg_error)
    }

    async fn commit(&mut self) -> Result<()> {
        self.client.batch_execute("COMMIT").await.map_err(pg_error)
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await.map_err(pg_error)
    }

    async fn ping(&mut self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(pg_error)
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.statement_timeout == Some(timeout) {
            return Ok(());
        }
        self.client
            .batch_execute(&format!("SET statement_timeout = {}", timeout.as_millis()))
            .await
            .map_err(pg_error)?;
        self.statement_timeout = Some(timeout);
        Ok(())
    }

    async fn replication_lag(&mut self) -> Result<Option<Duration>> {
        // NULL on a primary or on a replica that has not replayed anything yet.
        let row = self
            .client
            .query_one(
                "SELECT (EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())) * 1000)::float8",
                &[],
            )
            .await
            .map_err(pg_error)?;
        let lag_ms: Option<f64> = row.try_get(0).map_err(pg_error)?;
        Ok(lag_ms.map(|ms| Duration::from_millis(ms.max(0.0) as u64)))
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}

fn pg_error(err: tokio_postgres::Error) -> RouterError {
    let message = match err.as_db_error() {
        Some(db) => format!("{} (SQLSTATE {})", db.message(), db.code().code()),
        None => err.to_string(),
    };
    debug!("PostgreSQL error: {}", message);
    RouterError::QueryExecution(message)
}

/// Convert request parameters to the types the server inferred for the
/// prepared statement.
fn bind_params(statement: &Statement, params: &[Value]) -> Result<Vec<BoxedParam>> {
    let expected = statement.params();
    if expected.len() != params.len() {
        return Err(RouterError::Validation(format!(
            "Statement expects {} parameters, got {}",
            expected.len(),
            params.len()
        )));
    }

    expected
        .iter()
        .zip(params)
        .enumerate()
        .map(|(index, (ty, value))| bind_param(ty, value).map_err(|reason| {
            RouterError::Validation(format!(
                "Parameter ${} ({}) cannot accept {}: {}",
                index + 1,
                ty.name(),
                value.type_name(),
                reason
            ))
        }))
        .collect()
}

fn bind_param(ty: &Type, value: &Value) -> std::result::Result<BoxedParam, String> {
    let out: BoxedParam = match *ty {
        Type::BOOL => Box::new(match value {
            Value::Null => None,
            Value::Boolean(b) => Some(*b),
            _ => return Err("expected boolean".into()),
        }),
        Type::INT2 => Box::new(match value {
            Value::Null => None,
            Value::Integer(i) => Some(i16::try_from(*i).map_err(|e| e.to_string())?),
            _ => return Err("expected integer".into()),
        }),
        Type::INT4 => Box::new(match value {
            Value::Null => None,
            Value::Integer(i) => Some(i32::try_from(*i).map_err(|e| e.to_string())?),
            _ => return Err("expected integer".into()),
        }),
        Type::INT8 => Box::new(match value {
            Value::Null => None,
            Value::Integer(i) => Some(*i),
            _ => return Err("expected integer".into()),
        }),
        Type::FLOAT4 => Box::new(match value {
            Value::Null => None,
            Value::Integer(i) => Some(*i as f32),
            Value::Float(f) => Some(*f as f32),
            _ => return Err("expected number".into()),
        }),
        Type::FLOAT8 => Box::new(match value {
            Value::Null => None,
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => return Err("expected number".into()),
        }),
        Type::JSON | Type::JSONB => Box::new(match value {
            Value::Null => None,
            other => Some(other.to_json()),
        }),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Box::new(match value {
                Value::Null => None,
                Value::Json(v) => Some(v.to_string()),
                other => Some(other.to_string()),
            })
        }
        _ => return Err("unsupported parameter type".into()),
    };
    Ok(out)
}

fn row_values(row: &Row) -> Result<Vec<Value>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| column_value(row, idx, column.type_()))
        .collect()
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Result<Value> {
    let value = match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .map(|v| v.map(Value::Boolean)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map(|i| Value::Integer(i as i64))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map(|i| Value::Integer(i as i64))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .map(|v| v.map(Value::Integer)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(|f| Value::Float(f as f64))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map(|v| v.map(Value::Float)),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .map(|v| v.map(Value::Json)),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => Ok(v.map(Value::Text)),
            Err(_) => return Ok(Value::Text(format!("<{}>", ty.name()))),
        },
    };

    value
        .map(|v| v.unwrap_or(Value::Null))
        .map_err(pg_error)
}
