//! Sync log repository implementation

use crate::error::{Error, Result};
use crate::models::SyncLogId;
use crate::sync_log::SyncLog;
use libsql::{params, Connection, Value};

/// Trait for sync log storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SyncLogRepository {
    /// Get a log by ID
    async fn get(&self, id: &SyncLogId) -> Result<Option<SyncLog>>;

    /// Append a new log to its chain
    async fn insert(&self, log: &SyncLog) -> Result<()>;

    /// Overwrite a log that has no successor yet
    async fn update(&self, log: &SyncLog) -> Result<()>;

    /// Whether some log names `id` as its previous log
    async fn has_successor(&self, id: &SyncLogId) -> Result<bool>;

    /// Most recent logs of a user, newest first
    async fn list_for_user(&self, domain: &str, user_id: &str, limit: usize)
        -> Result<Vec<SyncLog>>;
}

/// libSQL implementation of `SyncLogRepository`
pub struct LibSqlSyncLogRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSyncLogRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

pub(crate) fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |value| Value::Text(value.to_string()))
}

impl SyncLogRepository for LibSqlSyncLogRepository<'_> {
    async fn get(&self, id: &SyncLogId) -> Result<Option<SyncLog>> {
        let mut rows = self
            .conn
            .query("SELECT doc FROM sync_logs WHERE id = ?", [id.as_str()])
            .await?;

        if let Some(row) = rows.next().await? {
            let doc: String = row.get(0)?;
            Ok(Some(serde_json::from_str(&doc)?))
        } else {
            Ok(None)
        }
    }

    async fn insert(&self, log: &SyncLog) -> Result<()> {
        let doc = serde_json::to_string(log)?;
        let previous = log.previous_log_id.map(|id| id.as_str());
        self.conn
            .execute(
                "INSERT INTO sync_logs (id, domain, user_id, device_id, previous_log_id, date, had_state_error, doc)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    log.id.as_str(),
                    log.domain.as_str(),
                    log.user_id.as_str(),
                    optional_text(log.device_id.as_deref()),
                    optional_text(previous.as_deref()),
                    log.date,
                    i32::from(log.had_state_error),
                    doc
                ],
            )
            .await?;
        tracing::debug!(log_id = %log.id, cases = log.case_count(), "Stored sync log");
        Ok(())
    }

    async fn update(&self, log: &SyncLog) -> Result<()> {
        let doc = serde_json::to_string(log)?;
        let rows = self
            .conn
            .execute(
                "UPDATE sync_logs SET had_state_error = ?, doc = ?
                 WHERE id = ?
                   AND NOT EXISTS (SELECT 1 FROM sync_logs WHERE previous_log_id = ?)",
                params![
                    i32::from(log.had_state_error),
                    doc,
                    log.id.as_str(),
                    log.id.as_str()
                ],
            )
            .await?;

        if rows == 0 {
            if self.has_successor(&log.id).await? {
                return Err(Error::invalid_mutation(
                    "",
                    format!("sync log {} has been superseded", log.id),
                ));
            }
            return Err(Error::NotFound(log.id.to_string()));
        }
        Ok(())
    }

    async fn has_successor(&self, id: &SyncLogId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sync_logs WHERE previous_log_id = ?)",
                [id.as_str()],
            )
            .await?;

        Ok(rows
            .next()
            .await?
            .map(|row| row.get::<i32>(0))
            .transpose()?
            .is_some_and(|exists| exists != 0))
    }

    async fn list_for_user(
        &self,
        domain: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncLog>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows = self
            .conn
            .query(
                "SELECT doc FROM sync_logs WHERE domain = ? AND user_id = ?
                 ORDER BY date DESC, id DESC LIMIT ?",
                params![domain, user_id, limit],
            )
            .await?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await? {
            let doc: String = row.get(0)?;
            logs.push(serde_json::from_str(&doc)?);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::CaseState;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get_log() {
        let db = setup().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());

        let mut log = SyncLog::new("clinic", "user-1")
            .with_device("phone-1")
            .with_owners(["owner-1"]);
        log.add_primary(CaseState::new("c1"));
        repo.insert(&log).await.unwrap();

        let loaded = repo.get(&log.id).await.unwrap().unwrap();
        assert_eq!(loaded, log);
        assert!(repo.get(&SyncLogId::new()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_refuses_superseded_log() {
        let db = setup().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());

        let first = SyncLog::new("clinic", "user-1");
        repo.insert(&first).await.unwrap();
        repo.insert(&first.next()).await.unwrap();

        let mut changed = first.clone();
        changed.add_primary(CaseState::new("late"));
        let error = repo.update(&changed).await.unwrap_err();
        assert!(matches!(error, Error::InvalidMutation { .. }));
        assert_eq!(repo.get(&first.id).await.unwrap(), Some(first));

        let missing = SyncLog::new("clinic", "user-1");
        assert!(matches!(
            repo.update(&missing).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_successor_tracking() {
        let db = setup().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());

        let first = SyncLog::new("clinic", "user-1");
        repo.insert(&first).await.unwrap();
        assert!(!repo.has_successor(&first.id).await.unwrap());

        let second = first.next();
        repo.insert(&second).await.unwrap();
        assert!(repo.has_successor(&first.id).await.unwrap());
        assert_eq!(second.get_previous(&repo).await.unwrap(), Some(first));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_missing_log_fails() {
        let db = setup().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());

        let log = SyncLog::new("clinic", "user-1");
        assert!(repo.update(&log).await.is_err());

        repo.insert(&log).await.unwrap();
        let mut changed = log.clone();
        changed.had_state_error = true;
        repo.update(&changed).await.unwrap();
        assert!(repo.get(&log.id).await.unwrap().unwrap().had_state_error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_for_user_newest_first() {
        let db = setup().await;
        let repo = LibSqlSyncLogRepository::new(db.connection());

        let mut first = SyncLog::new("clinic", "user-1");
        first.date = 100;
        let mut second = first.next();
        second.date = 200;
        let mut other = SyncLog::new("clinic", "user-2");
        other.date = 300;
        for log in [&first, &second, &other] {
            repo.insert(log).await.unwrap();
        }

        let ids: Vec<SyncLogId> = repo
            .list_for_user("clinic", "user-1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|log| log.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
