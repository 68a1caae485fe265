//! Session persistence on the `sessions` table.
//!
//! Identity columns use native `PostgreSQL` types (`macaddr`, `inet`). Text
//! parameters are cast on the way in and rendered back to text on the way
//! out, so the rest of the workspace only ever sees strings. Kind sets are
//! stored as `smallint[]` codes translated through the [`KindTable`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use geode_core::store::{FieldPatch, OrderPolicy, OverlapQuery, SessionStore, StoreError};
use geode_types::{
    AttributeKey, Attributes, EventRecord, IdentityKey, IdentityLookup, Interval, KindTable,
    SessionId,
};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::error::DbError;

/// Columns selected for every session read.
const SELECT_COLUMNS: &str = "id, mac::TEXT AS mac, host(ip) AS ip, netid, hostname, start, stop, useragent, os, event_type";

const INSERT_SQL: &str = r"INSERT INTO sessions (mac, ip, netid, hostname, start, stop, useragent, os, event_type)
  VALUES ($1::macaddr, $2::inet, $3, $4, $5, $6, $7, $8, $9)
  RETURNING id";

const OVERWRITE_SQL: &str = r"UPDATE sessions
  SET mac = $1::macaddr, ip = $2::inet, netid = $3, hostname = $4, start = $5, stop = $6,
      useragent = $7, os = $8, event_type = $9
  WHERE id = $10";

const TERMINATE_SQL: &str = "UPDATE sessions SET stop = $1 WHERE id = $2";

/// A row from the `sessions` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionRow {
    /// Store-assigned id.
    pub id: i64,
    /// Hardware address, rendered as text.
    pub mac: Option<String>,
    /// IP address without prefix length.
    pub ip: Option<String>,
    /// User id.
    pub netid: Option<String>,
    /// Host name.
    pub hostname: Option<String>,
    /// Interval start.
    pub start: DateTime<Utc>,
    /// Interval stop.
    pub stop: DateTime<Utc>,
    /// Browser user-agent string.
    pub useragent: Option<String>,
    /// Operating system.
    pub os: Option<String>,
    /// Kind codes.
    pub event_type: Vec<i16>,
}

impl SessionRow {
    /// Rebuild the session, decoding kind codes through `kinds`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Corrupt`] for an inverted interval and
    /// [`DbError::Kinds`] for a code missing from `kinds`.
    pub fn into_record(self, kinds: &KindTable) -> Result<EventRecord, DbError> {
        let interval = Interval::new(self.start, self.stop).map_err(|e| DbError::Corrupt {
            id: self.id,
            reason: e.to_string(),
        })?;

        let mut record = EventRecord::new(interval);
        record.id = Some(SessionId(self.id));
        record.identity = IdentityKey {
            mac: self.mac,
            ip: self.ip,
        };
        record.attributes = Attributes {
            netid: self.netid,
            hostname: self.hostname,
            user_agent: self.useragent,
            os: self.os,
        };
        record.kinds = kinds.decode(&self.event_type)?;
        Ok(record)
    }
}

/// Column name and parameter cast for a patchable field.
const fn column_of(key: AttributeKey) -> (&'static str, &'static str) {
    match key {
        AttributeKey::Mac => ("mac", "::macaddr"),
        AttributeKey::Ip => ("ip", "::inet"),
        AttributeKey::Netid => ("netid", ""),
        AttributeKey::Hostname => ("hostname", ""),
        AttributeKey::UserAgent => ("useragent", ""),
        AttributeKey::Os => ("os", ""),
    }
}

/// The overlap lookup for one identity column and candidate order.
///
/// `$1` is the identity value and `[$2, $3]` the lookup window; a row
/// qualifies when either endpoint falls inside the window or the row spans
/// it entirely.
fn overlap_sql(key: &IdentityLookup, order: OrderPolicy) -> String {
    let predicate = match key {
        IdentityLookup::Mac(_) => "mac = $1::macaddr",
        IdentityLookup::Ip(_) => "ip = $1::inet",
    };
    let order_by = match order {
        OrderPolicy::LatestStop => "stop DESC, id DESC",
        OrderPolicy::NewestFirst => "id DESC",
    };
    format!(
        "SELECT {SELECT_COLUMNS} FROM sessions \
         WHERE {predicate} AND (($2 <= start AND start <= $3) \
         OR ($2 <= stop AND stop <= $3) \
         OR (start <= $2 AND $2 <= stop)) \
         ORDER BY {order_by} LIMIT 1"
    )
}

/// Bind the nine record columns in `INSERT_SQL` / `OVERWRITE_SQL` order.
fn bind_record<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &'q EventRecord,
    codes: &'q [i16],
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(record.identity.mac.as_deref())
        .bind(record.identity.ip.as_deref())
        .bind(record.attributes.netid.as_deref())
        .bind(record.attributes.hostname.as_deref())
        .bind(record.start())
        .bind(record.stop())
        .bind(record.attributes.user_agent.as_deref())
        .bind(record.attributes.os.as_deref())
        .bind(codes)
}

/// Operations on the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionTable {
    pool: PgPool,
    kinds: Arc<KindTable>,
}

impl SessionTable {
    /// Bind the table to a pool and a kind vocabulary.
    pub const fn new(pool: PgPool, kinds: Arc<KindTable>) -> Self {
        Self { pool, kinds }
    }

    /// Preferred session for the query's identity overlapping its window.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or the row is unreadable.
    pub async fn find_session(&self, query: &OverlapQuery) -> Result<Option<EventRecord>, DbError> {
        let row = sqlx::query_as::<_, SessionRow>(&overlap_sql(&query.key, query.order))
            .bind(query.key.value())
            .bind(query.window.start())
            .bind(query.window.stop())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row.into_record(&self.kinds)).transpose()
    }

    /// Insert a new session and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub async fn insert_session(&self, record: &EventRecord) -> Result<SessionId, DbError> {
        let codes = self.kinds.encode(&record.kinds)?;
        let row = bind_record(sqlx::query(INSERT_SQL), record, &codes)
            .fetch_one(&self.pool)
            .await?;
        let id = SessionId(row.try_get("id")?);

        tracing::debug!(%id, start = %record.start(), "Inserted session");
        Ok(id)
    }

    /// Replace every column of session `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no row has `id`.
    pub async fn overwrite_session(&self, id: SessionId, record: &EventRecord) -> Result<(), DbError> {
        let codes = self.kinds.encode(&record.kinds)?;
        let result = bind_record(sqlx::query(OVERWRITE_SQL), record, &codes)
            .bind(id.into_inner())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(id));
        }
        Ok(())
    }

    /// Update only the columns named by `patch`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no row has `id`, or
    /// [`DbError::Postgres`] if the new stop would precede the start.
    pub async fn patch_session(&self, id: SessionId, patch: &FieldPatch) -> Result<(), DbError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new("UPDATE sessions SET ");
        let mut assignments = builder.separated(", ");
        if let Some(stop) = patch.stop {
            assignments.push("stop = ").push_bind_unseparated(stop);
        }
        for (key, value) in &patch.fields {
            let (column, cast) = column_of(*key);
            assignments
                .push(format_args!("{column} = "))
                .push_bind_unseparated(value.clone())
                .push_unseparated(cast);
        }
        builder.push(" WHERE id = ").push_bind(id.into_inner());

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(id));
        }
        Ok(())
    }

    /// In one transaction, set the stop of session `id` and insert
    /// `successor`. Nothing is written unless both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no row has `id`.
    pub async fn split_session(
        &self,
        id: SessionId,
        stop: DateTime<Utc>,
        successor: &EventRecord,
    ) -> Result<SessionId, DbError> {
        let codes = self.kinds.encode(&successor.kinds)?;
        let mut tx = self.pool.begin().await?;

        let terminated = sqlx::query(TERMINATE_SQL)
            .bind(stop)
            .bind(id.into_inner())
            .execute(&mut *tx)
            .await?;
        if terminated.rows_affected() == 0 {
            return Err(DbError::NotFound(id));
        }

        let row = bind_record(sqlx::query(INSERT_SQL), successor, &codes)
            .fetch_one(&mut *tx)
            .await?;
        let successor_id = SessionId(row.try_get("id")?);

        tx.commit().await?;
        tracing::debug!(terminated = %id, successor = %successor_id, %stop, "Split session");
        Ok(successor_id)
    }
}

impl SessionStore for SessionTable {
    async fn find_overlapping(&self, query: &OverlapQuery) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.find_session(query).await?)
    }

    async fn insert(&self, record: &EventRecord) -> Result<SessionId, StoreError> {
        Ok(self.insert_session(record).await?)
    }

    async fn overwrite(&self, id: SessionId, record: &EventRecord) -> Result<(), StoreError> {
        Ok(self.overwrite_session(id, record).await?)
    }

    async fn patch_fields(&self, id: SessionId, patch: &FieldPatch) -> Result<(), StoreError> {
        Ok(self.patch_session(id, patch).await?)
    }

    async fn terminate_and_insert(
        &self,
        id: SessionId,
        stop: DateTime<Utc>,
        successor: &EventRecord,
    ) -> Result<SessionId, StoreError> {
        Ok(self.split_session(id, stop, successor).await?)
    }
}
