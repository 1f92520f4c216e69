//! Lock table layout and the SQL statements run against it.
//!
//! Table and column names are supplied by the caller, so they are validated
//! and emitted as quoted identifiers. Lock names, owners and lease lengths are
//! always bound as parameters.

use lease_lock_core::error::{LockError, LockResult};

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Names of the table and columns holding lock records.
///
/// The table may carry extra columns; only these three are read or written.
/// A schema-qualified table name such as `infra.locks` is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTableSchema {
    /// Table name, optionally schema-qualified.
    pub table: String,
    /// Primary key column holding the lock name.
    pub lock_name_column: String,
    /// Column holding the current owner; empty or NULL means unowned.
    pub owner_column: String,
    /// `TIMESTAMPTZ` column holding the lease deadline.
    pub deadline_column: String,
}

impl Default for LockTableSchema {
    fn default() -> Self {
        Self::new("locks")
    }
}

impl LockTableSchema {
    /// Uses `table` with the default column names `lock_name`, `owner` and
    /// `deadline`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            lock_name_column: "lock_name".to_string(),
            owner_column: "owner".to_string(),
            deadline_column: "deadline".to_string(),
        }
    }

    /// Checks every identifier and returns the quoted forms.
    pub(crate) fn quoted(&self) -> LockResult<QuotedSchema> {
        let table = self
            .table
            .split('.')
            .map(quote_identifier)
            .collect::<LockResult<Vec<_>>>()?;
        if table.len() > 2 {
            return Err(LockError::InvalidName(format!(
                "table name '{}' has too many qualifiers",
                self.table
            )));
        }

        Ok(QuotedSchema {
            table: table.join("."),
            lock_name: quote_identifier(&self.lock_name_column)?,
            owner: quote_identifier(&self.owner_column)?,
            deadline: quote_identifier(&self.deadline_column)?,
        })
    }
}

/// Quotes `ident` as a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_identifier(ident: &str) -> LockResult<String> {
    if ident.is_empty() {
        return Err(LockError::InvalidName(
            "identifier cannot be empty".to_string(),
        ));
    }
    if ident.contains('\0') {
        return Err(LockError::InvalidName(format!(
            "identifier '{}' contains a NUL character",
            ident.escape_default()
        )));
    }
    if ident.len() > MAX_IDENTIFIER_LENGTH {
        return Err(LockError::InvalidName(format!(
            "identifier '{ident}' exceeds {MAX_IDENTIFIER_LENGTH} bytes"
        )));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

/// Validated, quoted identifiers and the statements built from them.
#[derive(Debug, Clone)]
pub(crate) struct QuotedSchema {
    table: String,
    lock_name: String,
    owner: String,
    deadline: String,
}

impl QuotedSchema {
    pub(crate) fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             {name} TEXT NOT NULL PRIMARY KEY, \
             {owner} TEXT NOT NULL DEFAULT '', \
             {deadline} TIMESTAMPTZ)",
            table = self.table,
            name = self.lock_name,
            owner = self.owner,
            deadline = self.deadline,
        )
    }

    /// `$1` = lock name.
    pub(crate) fn create_lock_sql(&self) -> String {
        format!(
            "INSERT INTO {table} ({name}, {owner}, {deadline}) \
             VALUES ($1, '', now()) \
             ON CONFLICT ({name}) DO NOTHING",
            table = self.table,
            name = self.lock_name,
            owner = self.owner,
            deadline = self.deadline,
        )
    }

    /// `$1` = lock name, `$2` = owner, `$3` = ttl in microseconds.
    ///
    /// SET expressions see the row as it was before the update, so owner and
    /// deadline are decided on the same snapshot.
    pub(crate) fn try_lock_sql(&self) -> String {
        format!(
            "UPDATE {table} SET \
             {owner} = CASE \
                 WHEN {owner} = $2 THEN {owner} \
                 WHEN now() >= COALESCE({deadline}, now()) THEN $2 \
                 ELSE {owner} END, \
             {deadline} = CASE \
                 WHEN {owner} = $2 OR now() >= COALESCE({deadline}, now()) \
                 THEN now() + $3 * INTERVAL '1 microsecond' \
                 ELSE {deadline} END \
             WHERE {name} = $1 \
             RETURNING {owner}, {deadline}",
            table = self.table,
            name = self.lock_name,
            owner = self.owner,
            deadline = self.deadline,
        )
    }

    /// `$1` = lock name.
    pub(crate) fn select_owner_sql(&self) -> String {
        format!(
            "SELECT {owner} FROM {table} WHERE {name} = $1",
            table = self.table,
            name = self.lock_name,
            owner = self.owner,
        )
    }
}
