//! Profile storage access for the reconciler.
//!
//! The driver never reaches for ambient globals: it receives a
//! [`ProfileStore`] and talks to storage only through it. `PgProfileStore`
//! is the production Postgres implementation; `MemoryProfileStore` backs
//! tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use pfr_core::{ProfessionKind, ProfileRecord, RawField, TableSchema};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pfr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot reach profile storage: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("table {table} does not exist")]
    SchemaMissing { table: String },
    #[error("column {column} is not part of table {table}")]
    UnknownColumn { table: String, column: String },
    #[error("query against {table} failed: {source}")]
    Query {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("updating {table} id {id} failed: {source}")]
    Write {
        table: String,
        id: i64,
        #[source]
        source: sqlx::Error,
    },
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetches a bounded page of profiles for one kind; `limit` 0 means
    /// unbounded.
    async fn fetch_profiles(
        &self,
        kind: ProfessionKind,
        limit: u32,
    ) -> Result<Vec<ProfileRecord>, StoreError>;

    /// Replaces one semi-structured column on one row.
    async fn update_field(
        &self,
        kind: ProfessionKind,
        profile_id: i64,
        column: &str,
        value: &str,
    ) -> Result<(), StoreError>;
}

/// Resolves the diploma value between the current and legacy column
/// names: the first non-null wins, even when blank.
pub fn pick_diploma_column(
    schema: &TableSchema,
    current: Option<String>,
    legacy: Option<String>,
) -> (RawField, &'static str) {
    if current.is_some() {
        (RawField::from_text(current), schema.diploma_column)
    } else if legacy.is_some() {
        (
            RawField::from_text(legacy),
            schema.legacy_diploma_column.unwrap_or(schema.diploma_column),
        )
    } else {
        (RawField::Absent, schema.diploma_column)
    }
}

#[derive(Debug, Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_query_error(table: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            // Postgres undefined_table
            if db.code().as_deref() == Some("42P01") {
                return StoreError::SchemaMissing {
                    table: table.to_string(),
                };
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            return StoreError::Connect(err);
        }
        _ => {}
    }
    StoreError::Query {
        table: table.to_string(),
        source: err,
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn fetch_profiles(
        &self,
        kind: ProfessionKind,
        limit: u32,
    ) -> Result<Vec<ProfileRecord>, StoreError> {
        let schema = kind.schema();
        let legacy_select = schema
            .legacy_diploma_column
            .map(|column| format!(", p.{column} AS legacy_diplomas"))
            .unwrap_or_default();
        let mut sql = format!(
            "SELECT p.id, p.user_id, u.name AS user_name, u.email AS user_email, \
             p.{diplomas} AS diplomas, p.{experiences} AS experiences{legacy_select} \
             FROM {table} p LEFT JOIN users u ON u.id = p.user_id ORDER BY p.id",
            diplomas = schema.diploma_column,
            experiences = schema.experience_column,
            table = schema.table,
        );
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_query_error(schema.table, err))?;
        debug!(table = schema.table, rows = rows.len(), "fetched profile page");

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let get_err = |err| map_query_error(schema.table, err);
            let current: Option<String> = row.try_get("diplomas").map_err(get_err)?;
            let legacy: Option<String> = if schema.legacy_diploma_column.is_some() {
                row.try_get("legacy_diplomas").map_err(get_err)?
            } else {
                None
            };
            let (diplomas, diploma_column) = pick_diploma_column(&schema, current, legacy);
            let experiences: Option<String> = row.try_get("experiences").map_err(get_err)?;
            records.push(ProfileRecord {
                id: row.try_get("id").map_err(get_err)?,
                user_id: row.try_get("user_id").map_err(get_err)?,
                user_name: row.try_get("user_name").map_err(get_err)?,
                user_email: row.try_get("user_email").map_err(get_err)?,
                diplomas,
                diploma_column,
                experiences: RawField::from_text(experiences),
            });
        }
        Ok(records)
    }

    async fn update_field(
        &self,
        kind: ProfessionKind,
        profile_id: i64,
        column: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let schema = kind.schema();
        // Column names are interpolated into SQL; only descriptor-listed
        // columns are allowed through.
        if !schema.has_column(column) {
            return Err(StoreError::UnknownColumn {
                table: schema.table.to_string(),
                column: column.to_string(),
            });
        }
        let sql = format!(
            "UPDATE {table} SET {column} = $1 WHERE id = $2",
            table = schema.table,
        );
        sqlx::query(&sql)
            .bind(value)
            .bind(profile_id)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Write {
                table: schema.table.to_string(),
                id: profile_id,
                source: err,
            })?;
        Ok(())
    }
}

/// One stored row as the in-memory store keeps it, mirroring the raw
/// column layout of the profile tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryProfile {
    pub id: i64,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub diplomes: Option<String>,
    pub diplome: Option<String>,
    pub experiences: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    profiles: HashMap<ProfessionKind, Vec<MemoryProfile>>,
    missing_tables: HashSet<ProfessionKind>,
    fail_writes: bool,
}

/// Fixture-backed store for tests; write-backs mutate the held rows so
/// repeated runs observe their own fixes.
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: ProfessionKind, profile: MemoryProfile) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.profiles.entry(kind).or_default().push(profile);
    }

    /// Simulates a deployment where this kind's table was never created.
    pub fn mark_table_missing(&self, kind: ProfessionKind) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.missing_tables.insert(kind);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.fail_writes = fail;
    }

    pub fn field(&self, kind: ProfessionKind, profile_id: i64, column: &str) -> Option<String> {
        let inner = self.inner.lock().expect("memory store lock");
        let profile = inner
            .profiles
            .get(&kind)?
            .iter()
            .find(|p| p.id == profile_id)?;
        match column {
            "diplomes" => profile.diplomes.clone(),
            "diplome" => profile.diplome.clone(),
            "experiences" => profile.experiences.clone(),
            _ => None,
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn fetch_profiles(
        &self,
        kind: ProfessionKind,
        limit: u32,
    ) -> Result<Vec<ProfileRecord>, StoreError> {
        let schema = kind.schema();
        let inner = self.inner.lock().expect("memory store lock");
        if inner.missing_tables.contains(&kind) {
            return Err(StoreError::SchemaMissing {
                table: schema.table.to_string(),
            });
        }
        let profiles = inner.profiles.get(&kind).cloned().unwrap_or_default();
        let page = if limit > 0 {
            profiles.into_iter().take(limit as usize).collect::<Vec<_>>()
        } else {
            profiles
        };
        Ok(page
            .into_iter()
            .map(|profile| {
                let (diplomas, diploma_column) =
                    pick_diploma_column(&schema, profile.diplomes, profile.diplome);
                ProfileRecord {
                    id: profile.id,
                    user_id: profile.user_id,
                    user_name: profile.user_name,
                    user_email: profile.user_email,
                    diplomas,
                    diploma_column,
                    experiences: RawField::from_text(profile.experiences),
                }
            })
            .collect())
    }

    async fn update_field(
        &self,
        kind: ProfessionKind,
        profile_id: i64,
        column: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let schema = kind.schema();
        if !schema.has_column(column) {
            return Err(StoreError::UnknownColumn {
                table: schema.table.to_string(),
                column: column.to_string(),
            });
        }
        let mut inner = self.inner.lock().expect("memory store lock");
        if inner.fail_writes {
            return Err(StoreError::Write {
                table: schema.table.to_string(),
                id: profile_id,
                source: sqlx::Error::PoolClosed,
            });
        }
        let profile = inner
            .profiles
            .get_mut(&kind)
            .and_then(|rows| rows.iter_mut().find(|p| p.id == profile_id))
            .ok_or(StoreError::Write {
                table: schema.table.to_string(),
                id: profile_id,
                source: sqlx::Error::RowNotFound,
            })?;
        match column {
            "diplomes" => profile.diplomes = Some(value.to_string()),
            "diplome" => profile.diplome = Some(value.to_string()),
            "experiences" => profile.experiences = Some(value.to_string()),
            _ => unreachable!("column validated against schema"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: i64) -> MemoryProfile {
        MemoryProfile {
            id,
            user_id: Some(id + 100),
            user_name: Some(format!("User {id}")),
            user_email: Some(format!("user{id}@example.test")),
            ..MemoryProfile::default()
        }
    }

    #[test]
    fn diploma_column_preference_is_current_then_legacy() {
        let schema = ProfessionKind::Medecin.schema();
        let (raw, column) =
            pick_diploma_column(&schema, Some("[\"a\"]".into()), Some("old".into()));
        assert_eq!(raw, RawField::Text("[\"a\"]".into()));
        assert_eq!(column, "diplomes");

        let (raw, column) = pick_diploma_column(&schema, None, Some("old".into()));
        assert_eq!(raw, RawField::Text("old".into()));
        assert_eq!(column, "diplome");

        let (raw, column) = pick_diploma_column(&schema, None, None);
        assert_eq!(raw, RawField::Absent);
        assert_eq!(column, "diplomes");
    }

    #[test]
    fn blank_current_column_still_wins_over_legacy() {
        let schema = ProfessionKind::Kine.schema();
        let (raw, column) = pick_diploma_column(&schema, Some("".into()), Some("old".into()));
        assert!(raw.is_empty());
        assert_eq!(column, "diplomes");
    }

    #[tokio::test]
    async fn memory_store_pages_and_updates() {
        let store = MemoryProfileStore::new();
        for id in 1..=3 {
            store.insert(ProfessionKind::Kine, profile(id));
        }

        let page = store.fetch_profiles(ProfessionKind::Kine, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        let all = store.fetch_profiles(ProfessionKind::Kine, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        store
            .update_field(ProfessionKind::Kine, 2, "experiences", "[{\"description\":\"x\"}]")
            .await
            .unwrap();
        assert_eq!(
            store.field(ProfessionKind::Kine, 2, "experiences").as_deref(),
            Some("[{\"description\":\"x\"}]")
        );
    }

    #[tokio::test]
    async fn missing_table_surfaces_schema_missing() {
        let store = MemoryProfileStore::new();
        store.mark_table_missing(ProfessionKind::Psychologue);
        let err = store
            .fetch_profiles(ProfessionKind::Psychologue, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMissing { table } if table == "psychologues"));
    }

    #[tokio::test]
    async fn unknown_column_is_rejected() {
        let store = MemoryProfileStore::new();
        store.insert(ProfessionKind::Medecin, profile(1));
        let err = store
            .update_field(ProfessionKind::Medecin, 1, "id", "1")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { .. }));
    }
}
