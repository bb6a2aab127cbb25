//! Ownership cleanliness flag repository

use crate::error::Result;
use crate::models::{CaseId, OwnershipCleanlinessFlag};
use libsql::{params, Connection, Value};

use super::sync_log_repository::optional_text;

/// Trait for cleanliness flag storage (async)
#[allow(async_fn_in_trait)]
pub trait CleanlinessRepository {
    /// Get the flag of one owner
    async fn get(&self, domain: &str, owner_id: &str) -> Result<Option<OwnershipCleanlinessFlag>>;

    /// Insert the flag unless the owner already has one.
    ///
    /// Returns whether a row was written.
    async fn insert_if_absent(&self, flag: &OwnershipCleanlinessFlag) -> Result<bool>;

    /// Write the flag only if the stored row was last checked at `expected_last_checked`.
    ///
    /// Returns `false` when another writer got there first.
    async fn write_if_unchanged(
        &self,
        flag: &OwnershipCleanlinessFlag,
        expected_last_checked: i64,
    ) -> Result<bool>;

    /// All flags of a domain, ordered by owner
    async fn list(&self, domain: &str) -> Result<Vec<OwnershipCleanlinessFlag>>;
}

/// libSQL implementation of `CleanlinessRepository`
pub struct LibSqlCleanlinessRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCleanlinessRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_flag(row: &libsql::Row) -> Result<OwnershipCleanlinessFlag> {
        let hint = match row.get_value(3)? {
            Value::Text(hint) => Some(CaseId::new(hint)),
            _ => None,
        };
        Ok(OwnershipCleanlinessFlag {
            domain: row.get(0)?,
            owner_id: row.get(1)?,
            is_clean: row.get::<i32>(2)? != 0,
            hint,
            last_checked: row.get(4)?,
        })
    }
}

impl CleanlinessRepository for LibSqlCleanlinessRepository<'_> {
    async fn get(&self, domain: &str, owner_id: &str) -> Result<Option<OwnershipCleanlinessFlag>> {
        let mut rows = self
            .conn
            .query(
                "SELECT domain, owner_id, is_clean, hint, last_checked
                 FROM ownership_cleanliness_flags WHERE domain = ? AND owner_id = ?",
                [domain, owner_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_flag(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_if_absent(&self, flag: &OwnershipCleanlinessFlag) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO ownership_cleanliness_flags
                 (domain, owner_id, is_clean, hint, last_checked) VALUES (?, ?, ?, ?, ?)",
                params![
                    flag.domain.as_str(),
                    flag.owner_id.as_str(),
                    i32::from(flag.is_clean),
                    optional_text(flag.hint.as_ref().map(CaseId::as_str)),
                    flag.last_checked
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn write_if_unchanged(
        &self,
        flag: &OwnershipCleanlinessFlag,
        expected_last_checked: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE ownership_cleanliness_flags
                 SET is_clean = ?, hint = ?, last_checked = ?
                 WHERE domain = ? AND owner_id = ? AND last_checked = ?",
                params![
                    i32::from(flag.is_clean),
                    optional_text(flag.hint.as_ref().map(CaseId::as_str)),
                    flag.last_checked,
                    flag.domain.as_str(),
                    flag.owner_id.as_str(),
                    expected_last_checked
                ],
            )
            .await?;
        Ok(rows == 1)
    }

    async fn list(&self, domain: &str) -> Result<Vec<OwnershipCleanlinessFlag>> {
        let mut rows = self
            .conn
            .query(
                "SELECT domain, owner_id, is_clean, hint, last_checked
                 FROM ownership_cleanliness_flags WHERE domain = ? ORDER BY owner_id",
                [domain],
            )
            .await?;

        let mut flags = Vec::new();
        while let Some(row) = rows.next().await? {
            flags.push(Self::parse_flag(&row)?);
        }
        Ok(flags)
    }
}
