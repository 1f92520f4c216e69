//! PostgreSQL lock storage implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lease_lock_core::error::{LockError, LockResult};
use lease_lock_core::traits::{LockState, LockStorage};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, debug, field, instrument};

use crate::connection::PostgresConnection;
use crate::schema::LockTableSchema;

fn backend_error(context: &str, e: sqlx::Error) -> LockError {
    LockError::Backend(Box::new(std::io::Error::other(format!("{context}: {e}"))))
}

/// Builder for PostgreSQL lock storage configuration.
pub struct PostgresLockStorageBuilder {
    connection: Option<PostgresConnection>,
    schema: LockTableSchema,
}

impl PostgresLockStorageBuilder {
    /// Creates a new builder using the default table layout.
    pub fn new() -> Self {
        Self {
            connection: None,
            schema: LockTableSchema::default(),
        }
    }

    /// Sets the PostgreSQL connection string.
    pub fn connection_string(mut self, conn_str: impl Into<String>) -> Self {
        self.connection = Some(PostgresConnection::ConnectionString(conn_str.into()));
        self
    }

    /// Sets an existing connection pool.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.connection = Some(PostgresConnection::Pool(pool));
        self
    }

    /// Sets the table and column names.
    pub fn schema(mut self, schema: LockTableSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Shorthand for a table with the default column names.
    pub fn table(self, table: impl Into<String>) -> Self {
        self.schema(LockTableSchema::new(table))
    }

    /// Builds the storage.
    ///
    /// Identifiers are validated before connecting.
    pub async fn build(self) -> LockResult<PostgresLockStorage> {
        let connection = self.connection.ok_or_else(|| {
            LockError::InvalidConfiguration("connection not specified".to_string())
        })?;
        let quoted = self.schema.quoted()?;
        let pool = connection.get_pool().await?;

        Ok(PostgresLockStorage {
            pool,
            statements: Statements {
                create_table: quoted.create_table_sql(),
                create_lock: quoted.create_lock_sql(),
                try_lock: quoted.try_lock_sql(),
                select_owner: quoted.select_owner_sql(),
            },
            schema: self.schema,
        })
    }
}

impl Default for PostgresLockStorageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Statements {
    create_table: String,
    create_lock: String,
    try_lock: String,
    select_owner: String,
}

/// Lock storage backed by a PostgreSQL table.
///
/// Work executed under the lock receives the serializable transaction in
/// which ownership was confirmed. Committing it makes the work visible; if a
/// competing transfer touched the row in between, PostgreSQL aborts the
/// commit with a serialization failure.
pub struct PostgresLockStorage {
    pool: PgPool,
    schema: LockTableSchema,
    statements: Statements,
}

impl PostgresLockStorage {
    /// Returns a new builder for configuring the storage.
    pub fn builder() -> PostgresLockStorageBuilder {
        PostgresLockStorageBuilder::new()
    }

    /// Creates a storage over the default `locks` table.
    pub async fn new(connection_string: impl Into<String>) -> LockResult<Self> {
        Self::builder()
            .connection_string(connection_string)
            .build()
            .await
    }

    /// The connection pool used by this storage.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The table layout used by this storage.
    pub fn schema(&self) -> &LockTableSchema {
        &self.schema
    }

    /// Creates the lock table if it does not exist.
    #[instrument(skip(self), fields(table = %self.schema.table, backend = "postgres"))]
    pub async fn create_locks_table(&self) -> LockResult<()> {
        sqlx::query(&self.statements.create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| backend_error("failed to create lock table", e))?;
        Ok(())
    }

    async fn begin_serializable(&self) -> LockResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            LockError::Connection(Box::new(std::io::Error::other(format!(
                "failed to start transaction: {e}"
            ))))
        })?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| backend_error("failed to set isolation level", e))?;
        Ok(tx)
    }
}

impl LockStorage for PostgresLockStorage {
    type Transaction = Transaction<'static, Postgres>;

    #[instrument(skip(self), fields(lock.name = %name, backend = "postgres", created = field::Empty))]
    async fn create_lock(&self, name: &str) -> LockResult<bool> {
        let result = sqlx::query(&self.statements.create_lock)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| backend_error("failed to create lock record", e))?;
        let created = result.rows_affected() == 1;
        Span::current().record("created", created);
        Ok(created)
    }

    #[instrument(skip(self), fields(lock.name = %name, backend = "postgres", acquired = field::Empty))]
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> LockResult<LockState> {
        let ttl_micros = i64::try_from(ttl.as_micros()).map_err(|_| {
            LockError::InvalidConfiguration(format!("ttl {ttl:?} is out of range"))
        })?;

        let mut tx = self.begin_serializable().await?;
        let row = sqlx::query(&self.statements.try_lock)
            .bind(name)
            .bind(owner)
            .bind(ttl_micros)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| backend_error("failed to update lease", e))?;
        let Some(row) = row else {
            return Err(LockError::NotFound(name.to_string()));
        };

        let current_owner: Option<String> = row
            .try_get(0)
            .map_err(|e| backend_error("failed to read owner", e))?;
        let deadline: Option<DateTime<Utc>> = row
            .try_get(1)
            .map_err(|e| backend_error("failed to read deadline", e))?;
        tx.commit()
            .await
            .map_err(|e| backend_error("failed to commit lease update", e))?;

        let state = LockState::new(current_owner.unwrap_or_default(), deadline);
        Span::current().record("acquired", state.is_owned_by(owner));
        Ok(state)
    }

    #[instrument(skip(self), fields(lock.name = %name, backend = "postgres"))]
    async fn check_lock_owner(
        &self,
        name: &str,
        expected_owner: &str,
    ) -> LockResult<Option<Self::Transaction>> {
        let mut tx = self.begin_serializable().await?;
        let row = sqlx::query(&self.statements.select_owner)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| backend_error("failed to read owner", e))?;
        let owner: Option<String> = match row {
            Some(row) => row
                .try_get(0)
                .map_err(|e| backend_error("failed to read owner", e))?,
            None => return Err(LockError::NotFound(name.to_string())),
        };

        if LockState::new(owner.unwrap_or_default(), None).is_owned_by(expected_owner) {
            return Ok(Some(tx));
        }

        debug!(expected_owner, "not the owner, rolling back");
        tx.rollback()
            .await
            .map_err(|e| backend_error("failed to roll back ownership check", e))?;
        Ok(None)
    }
}
