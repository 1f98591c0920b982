//! PostgreSQL backing store.
//!
//! Rows travel as JSON: reads select `to_jsonb(t)`, writes go through
//! `jsonb_populate_record` so column types are PostgreSQL's business. Table
//! and column names are spliced into SQL, so tables must be whitelisted and
//! columns must pass [`is_identifier`].
//!
//! Changes are published by the `courtside_notify` trigger (see
//! `migrations/0001_init.sql`) on the `courtside_changes` channel.

use std::collections::HashSet;
use std::sync::Arc;

use courtside_engine::{
    error::Result, Error, Payload, RawChange, Record, RecordFilter, RecordId, RecordOrder,
    SortDirection,
};
use futures::StreamExt;
use serde::Deserialize;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};

use super::{is_identifier, unknown_collection, BackingStore, ChangeStream};

/// Channel the change trigger notifies.
pub const CHANGE_CHANNEL: &str = "courtside_changes";

/// A notification as the trigger formats it.
#[derive(Debug, Deserialize)]
struct Notification {
    table: String,
    #[serde(flatten)]
    change: RawChange,
}

/// PostgreSQL store over a connection pool.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
    tables: Arc<HashSet<String>>,
}

impl PgBackend {
    /// Wrap a pool, exposing only the listed tables.
    pub fn new<I, S>(pool: PgPool, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables = tables
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| is_identifier(name))
            .collect();
        Self {
            pool,
            tables: Arc::new(tables),
        }
    }

    /// Connect to the database.
    pub async fn connect<I, S>(database_url: &str, tables: I) -> std::result::Result<Self, sqlx::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, tables))
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    fn table<'a>(&self, collection: &'a str) -> Result<&'a str> {
        if self.tables.contains(collection) {
            Ok(collection)
        } else {
            Err(unknown_collection(collection))
        }
    }
}

fn columns(payload: &Payload) -> Result<Vec<&str>> {
    payload
        .keys()
        .filter(|name| name.as_str() != "id")
        .map(|name| {
            if is_identifier(name) {
                Ok(name.as_str())
            } else {
                Err(Error::InvalidPayload(format!("invalid field name '{}'", name)))
            }
        })
        .collect()
}

fn select_sql(table: &str, filter: &RecordFilter, order: &RecordOrder) -> Result<String> {
    let mut sql = format!("SELECT to_jsonb(t) AS row FROM {} t", table);

    for (n, (field, _)) in filter.terms().iter().enumerate() {
        if !is_identifier(field) {
            return Err(Error::InvalidPayload(format!("invalid filter field '{}'", field)));
        }
        sql.push_str(if n == 0 { " WHERE " } else { " AND " });
        sql.push_str(&format!("to_jsonb(t) -> '{}' = ${}", field, n + 1));
    }

    for (n, key) in order.keys().iter().enumerate() {
        if !is_identifier(&key.field) {
            return Err(Error::InvalidPayload(format!("invalid order field '{}'", key.field)));
        }
        sql.push_str(if n == 0 { " ORDER BY " } else { ", " });
        let direction = match key.direction {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        };
        sql.push_str(&format!("t.{} {}", key.field, direction));
    }

    Ok(sql)
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return format!(
            "INSERT INTO {table} DEFAULT VALUES RETURNING to_jsonb({table}.*) AS row"
        );
    }
    let list = columns.join(", ");
    format!(
        "INSERT INTO {table} ({list}) SELECT {list} FROM jsonb_populate_record(NULL::{table}, $1) \
         RETURNING to_jsonb({table}.*) AS row"
    )
}

fn update_sql(table: &str, columns: &[&str]) -> String {
    let list = columns.join(", ");
    format!(
        "UPDATE {table} SET ({list}) = (SELECT {list} FROM jsonb_populate_record(NULL::{table}, $1)) \
         WHERE id::text = $2"
    )
}

/// Map a database failure onto the engine's taxonomy.
///
/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint
/// violation) mean the store judged the write; anything else is transport.
fn store_error(error: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &error {
        let class = db.code().map(|code| code.chars().take(2).collect::<String>());
        if matches!(class.as_deref(), Some("22") | Some("23")) {
            return Error::WriteRejected(db.message().to_string());
        }
    }
    Error::Transport(error.to_string())
}

impl BackingStore for PgBackend {
    async fn fetch_all(
        &self,
        collection: &str,
        filter: &RecordFilter,
        order: &RecordOrder,
    ) -> Result<Vec<Record>> {
        let table = self.table(collection)?;
        let sql = select_sql(table, filter, order)?;

        let mut query = sqlx::query(&sql);
        for (_, value) in filter.terms() {
            query = query.bind(value.clone());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(store_error)?;

        rows.iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get("row").map_err(store_error)?;
                Record::from_value(value)
            })
            .collect()
    }

    async fn create(&self, collection: &str, payload: Payload) -> Result<Record> {
        let table = self.table(collection)?;
        let sql = insert_sql(table, &columns(&payload)?);

        let row = sqlx::query(&sql)
            .bind(serde_json::Value::Object(payload))
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;
        let value: serde_json::Value = row.try_get("row").map_err(store_error)?;
        Record::from_value(value)
    }

    async fn update(&self, collection: &str, id: &str, patch: Payload) -> Result<()> {
        let table = self.table(collection)?;
        let columns = columns(&patch)?;
        if columns.is_empty() {
            return Ok(());
        }
        let sql = update_sql(table, &columns);

        let result = sqlx::query(&sql)
            .bind(serde_json::Value::Object(patch))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(Error::RecordNotFound(RecordId::persistent(id)));
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let table = self.table(collection)?;
        sqlx::query(&format!("DELETE FROM {} WHERE id::text = $1", table))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn subscribe_changes(&self, collection: &str) -> Result<ChangeStream> {
        let table = self.table(collection)?.to_string();

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(store_error)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(store_error)?;

        // try_recv reports a lost connection as Ok(None); end the stream
        // there so the subscriber re-fetches what was missed
        let stream = futures::stream::unfold(Some(listener), move |listener| {
            let table = table.clone();
            async move {
                let mut listener = listener?;
                loop {
                    let notification = match listener.try_recv().await {
                        Ok(Some(notification)) => notification,
                        Ok(None) => {
                            return Some((
                                Err(Error::Transport("listener connection lost".into())),
                                None,
                            ))
                        }
                        Err(e) => return Some((Err(store_error(e)), None)),
                    };

                    match serde_json::from_str::<Notification>(notification.payload()) {
                        Ok(parsed) if parsed.table == table => {
                            return Some((Ok(parsed.change), Some(listener)));
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(
                                table = %table,
                                "Skipping malformed change notification: {}",
                                e
                            );
                            continue;
                        }
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_sql() {
        let filter = RecordFilter::new().field_eq("is_finished", false);
        let order = RecordOrder::by("court").then("created_at", SortDirection::Descending);
        assert_eq!(
            select_sql("matches", &filter, &order).unwrap(),
            "SELECT to_jsonb(t) AS row FROM matches t WHERE to_jsonb(t) -> 'is_finished' = $1 \
             ORDER BY t.court ASC, t.created_at DESC"
        );
        assert_eq!(
            select_sql("teams", &RecordFilter::new(), &RecordOrder::new()).unwrap(),
            "SELECT to_jsonb(t) AS row FROM teams t"
        );
    }

    #[test]
    fn test_rejects_unsafe_names() {
        let filter = RecordFilter::new().field_eq("court' OR 1=1 --", 1);
        assert!(select_sql("matches", &filter, &RecordOrder::new()).is_err());

        let payload = json!({"bad name": 1}).as_object().cloned().unwrap();
        assert!(columns(&payload).is_err());
    }

    #[test]
    fn test_write_sql() {
        assert_eq!(
            insert_sql("messages", &["message_body"]),
            "INSERT INTO messages (message_body) SELECT message_body FROM \
             jsonb_populate_record(NULL::messages, $1) RETURNING to_jsonb(messages.*) AS row"
        );
        assert_eq!(
            insert_sql("teams", &[]),
            "INSERT INTO teams DEFAULT VALUES RETURNING to_jsonb(teams.*) AS row"
        );
        assert_eq!(
            update_sql("matches", &["team1_score", "is_finished"]),
            "UPDATE matches SET (team1_score, is_finished) = (SELECT team1_score, is_finished \
             FROM jsonb_populate_record(NULL::matches, $1)) WHERE id::text = $2"
        );
    }

    #[test]
    fn test_notification_format() {
        let payload = r#"{"table":"matches","operation":"UPDATE",
            "newRecord":{"id":7,"court":2},"oldRecord":{"id":7,"court":1}}"#;
        let parsed: Notification = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.table, "matches");
        let event = parsed.change.normalize().unwrap();
        assert_eq!(event.record.id, RecordId::persistent("7"));
    }

    #[test]
    fn test_transport_errors() {
        assert!(matches!(
            store_error(sqlx::Error::PoolTimedOut),
            Error::Transport(_)
        ));
    }
}
