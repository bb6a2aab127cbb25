//! libSQL-backed case store

use libsql::{params, Connection};

use super::{CaseStore, ReverseIndex};
use crate::error::{Error, Result};
use crate::models::{Case, CaseId, CaseIndex, Relationship};

const CASE_COLUMNS: &str =
    "case_id, domain, case_type, owner_id, closed, deleted, server_modified_on, indices";

/// Case store over the `cases` and `case_indices` tables.
///
/// Id lists are bound as one JSON array and expanded with `json_each`.
#[derive(Clone)]
pub struct LibSqlCaseStore {
    conn: Connection,
}

impl LibSqlCaseStore {
    /// Create a store over an open connection
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Insert or replace cases along with their index rows
    pub async fn upsert_cases(&self, cases: &[Case]) -> Result<usize> {
        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        for case in cases {
            if let Err(e) = self.write_case(case).await {
                self.conn.execute("ROLLBACK", ()).await.ok();
                return Err(e);
            }
        }
        if let Err(e) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
        tracing::debug!(count = cases.len(), "Upserted cases");
        Ok(cases.len())
    }

    pub async fn upsert_case(&self, case: &Case) -> Result<()> {
        self.upsert_cases(std::slice::from_ref(case)).await.map(|_| ())
    }

    async fn write_case(&self, case: &Case) -> Result<()> {
        let indices = serde_json::to_string(&case.indices)?;
        self.conn
            .execute(
                &format!("INSERT OR REPLACE INTO cases ({CASE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
                params![
                    case.case_id.as_str(),
                    case.domain.as_str(),
                    case.case_type.as_str(),
                    case.owner_id.as_str(),
                    i32::from(case.closed),
                    i32::from(case.deleted),
                    case.server_modified_on,
                    indices
                ],
            )
            .await?;
        self.conn
            .execute(
                "DELETE FROM case_indices WHERE case_id = ?",
                [case.case_id.as_str()],
            )
            .await?;
        for index in &case.indices {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO case_indices (case_id, identifier, referenced_id, relationship)
                     VALUES (?, ?, ?, ?)",
                    [
                        case.case_id.as_str(),
                        index.identifier.as_str(),
                        index.referenced_id.as_str(),
                        index.relationship.as_str(),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn query_ids(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<CaseId>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(CaseId::new(row.get::<String>(0)?));
        }
        Ok(ids)
    }

    fn parse_case(row: &libsql::Row) -> Result<Case> {
        let indices: String = row.get(7)?;
        Ok(Case {
            case_id: CaseId::new(row.get::<String>(0)?),
            domain: row.get(1)?,
            case_type: row.get(2)?,
            owner_id: row.get(3)?,
            closed: row.get::<i32>(4)? != 0,
            deleted: row.get::<i32>(5)? != 0,
            server_modified_on: row.get(6)?,
            indices: serde_json::from_str(&indices)?,
        })
    }

    fn id_list(case_ids: &[CaseId]) -> Result<String> {
        Ok(serde_json::to_string(case_ids)?)
    }
}

/// Map a storage failure onto the error planning treats as an outage
fn unavailable(error: Error) -> Error {
    match error {
        Error::BatchFetch(_) => error,
        other => Error::BatchFetch(other.to_string()),
    }
}

impl CaseStore for LibSqlCaseStore {
    async fn get_open_case_ids_by_owner(
        &self,
        domain: &str,
        owner_id: &str,
    ) -> Result<Vec<CaseId>> {
        self.query_ids(
            "SELECT case_id FROM cases
             WHERE domain = ? AND owner_id = ? AND closed = 0 AND deleted = 0
             ORDER BY case_id",
            [domain, owner_id],
        )
        .await
        .map_err(unavailable)
    }

    async fn get_cases_modified_since(
        &self,
        domain: &str,
        owner_id: &str,
        since: i64,
    ) -> Result<Vec<CaseId>> {
        self.query_ids(
            "SELECT case_id FROM cases
             WHERE domain = ? AND owner_id = ? AND deleted = 0 AND server_modified_on >= ?
             ORDER BY case_id",
            params![domain, owner_id, since],
        )
        .await
        .map_err(unavailable)
    }

    async fn get_indexed_case_ids(
        &self,
        domain: &str,
        case_ids: &[CaseId],
    ) -> Result<Vec<CaseId>> {
        let ids = Self::id_list(case_ids)?;
        self.query_ids(
            "SELECT DISTINCT ci.referenced_id FROM case_indices ci
             JOIN cases c ON c.case_id = ci.case_id
             WHERE c.domain = ? AND c.deleted = 0
               AND ci.case_id IN (SELECT value FROM json_each(?))
             ORDER BY ci.referenced_id",
            [domain, ids.as_str()],
        )
        .await
        .map_err(unavailable)
    }

    async fn get_extension_case_ids(
        &self,
        domain: &str,
        case_ids: &[CaseId],
        include_closed: bool,
    ) -> Result<Vec<CaseId>> {
        let ids = Self::id_list(case_ids)?;
        self.query_ids(
            "SELECT DISTINCT ci.case_id FROM case_indices ci
             JOIN cases c ON c.case_id = ci.case_id
             WHERE c.domain = ? AND c.deleted = 0 AND ci.relationship = 'extension'
               AND ci.referenced_id IN (SELECT value FROM json_each(?))
               AND (? = 1 OR c.closed = 0)
             ORDER BY ci.case_id",
            params![domain, ids, i32::from(include_closed)],
        )
        .await
        .map_err(unavailable)
    }

    async fn get_reverse_indices(
        &self,
        domain: &str,
        case_ids: &[CaseId],
    ) -> Result<Vec<ReverseIndex>> {
        let ids = Self::id_list(case_ids)?;
        let fetch = async {
            let mut rows = self
                .conn
                .query(
                    "SELECT ci.case_id, ci.identifier, ci.referenced_id, ci.relationship
                     FROM case_indices ci
                     JOIN cases c ON c.case_id = ci.case_id
                     WHERE c.domain = ? AND c.deleted = 0
                       AND ci.referenced_id IN (SELECT value FROM json_each(?))
                     ORDER BY ci.case_id, ci.identifier",
                    [domain, ids.as_str()],
                )
                .await?;
            let mut reverse = Vec::new();
            while let Some(row) = rows.next().await? {
                let relationship: String = row.get(3)?;
                reverse.push(ReverseIndex {
                    case_id: CaseId::new(row.get::<String>(0)?),
                    index: CaseIndex {
                        identifier: row.get(1)?,
                        referenced_id: CaseId::new(row.get::<String>(2)?),
                        relationship: relationship
                            .parse::<Relationship>()
                            .map_err(Error::Database)?,
                    },
                });
            }
            Ok::<_, Error>(reverse)
        };
        fetch.await.map_err(unavailable)
    }

    async fn get_cases(&self, domain: &str, case_ids: &[CaseId]) -> Result<Vec<Case>> {
        let ids = Self::id_list(case_ids)?;
        let fetch = async {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {CASE_COLUMNS} FROM cases
                         WHERE domain = ? AND case_id IN (SELECT value FROM json_each(?))
                         ORDER BY case_id"
                    ),
                    [domain, ids.as_str()],
                )
                .await?;
            let mut cases = Vec::new();
            while let Some(row) = rows.next().await? {
                cases.push(Self::parse_case(&row)?);
            }
            Ok::<_, Error>(cases)
        };
        fetch.await.map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, LibSqlCaseStore) {
        let db = Database::open_in_memory().await.unwrap();
        let store = LibSqlCaseStore::new(db.connection().clone());
        store
            .upsert_cases(&[
                Case::new("parent", "clinic", "owner-1").modified_at(10),
                Case::new("child", "clinic", "owner-1")
                    .with_index(CaseIndex::child("parent", "parent"))
                    .modified_at(20),
                Case::new("extension", "clinic", "-")
                    .with_index(CaseIndex::extension("host", "parent"))
                    .modified_at(30),
                Case::new("closed", "clinic", "owner-1").closed().modified_at(40),
            ])
            .await
            .unwrap();
        (db, store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cases_round_trip_with_indices() {
        let (_db, store) = setup().await;
        let child = store
            .get_case("clinic", &CaseId::from("child"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.indices, vec![CaseIndex::child("parent", "parent")]);
        assert_eq!(child.server_modified_on, 20);
        assert!(store
            .get_case("other-domain", &CaseId::from("child"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn owner_queries_filter_closed_and_modified() {
        let (_db, store) = setup().await;
        assert_eq!(
            store
                .get_open_case_ids_by_owner("clinic", "owner-1")
                .await
                .unwrap(),
            vec![CaseId::from("child"), CaseId::from("parent")]
        );
        assert_eq!(
            store
                .get_cases_modified_since("clinic", "owner-1", 20)
                .await
                .unwrap(),
            vec![CaseId::from("child"), CaseId::from("closed")]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn index_lookups_go_both_ways() {
        let (_db, store) = setup().await;
        assert_eq!(
            store
                .get_indexed_case_ids("clinic", &[CaseId::from("child")])
                .await
                .unwrap(),
            vec![CaseId::from("parent")]
        );
        assert_eq!(
            store
                .get_extension_case_ids("clinic", &[CaseId::from("parent")], false)
                .await
                .unwrap(),
            vec![CaseId::from("extension")]
        );
        let reverse = store
            .get_reverse_indices("clinic", &[CaseId::from("parent")])
            .await
            .unwrap();
        assert_eq!(reverse.len(), 2);
        assert_eq!(reverse[1].index.relationship, Relationship::Extension);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reimport_replaces_index_rows() {
        let (_db, store) = setup().await;
        store
            .upsert_case(&Case::new("child", "clinic", "owner-1"))
            .await
            .unwrap();
        assert!(store
            .get_indexed_case_ids("clinic", &[CaseId::from("child")])
            .await
            .unwrap()
            .is_empty());
    }
}
