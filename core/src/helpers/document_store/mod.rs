pub mod document_filter;

use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use async_stream::try_stream;
use chrono::{Duration, NaiveDateTime};
use document_filter::DocumentFilter;
use futures::stream::Stream;
use rusqlite::{params, ErrorCode, ToSql};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, instrument};

#[derive(Debug, Clone)]
pub struct Document<T> {
  pub id: u64,
  pub collection: String,
  pub key: String,
  pub document: T,
  pub created_at: NaiveDateTime,
  pub updated_at: NaiveDateTime,
  pub expires_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
  pub limit: Option<usize>,
  pub id_cursor: Option<u64>,
}

#[derive(Debug)]
pub struct QueryResult<T> {
  pub documents: Vec<Document<T>>,
  pub next_id_cursor: Option<u64>,
}

type RawRow = (
  u64,
  String,
  String,
  String,
  NaiveDateTime,
  NaiveDateTime,
  Option<NaiveDateTime>,
);

fn row_to_document<T: DeserializeOwned>(row: RawRow) -> Option<Document<T>> {
  let (id, collection, key, json, created_at, updated_at, expires_at) = row;
  serde_json::from_str::<T>(&json)
    .inspect_err(|e| error!(err = e.to_string(), "Failed to deserialize document"))
    .ok()
    .map(|document| Document {
      id,
      collection,
      key,
      document,
      created_at,
      updated_at,
      expires_at,
    })
}

/**
 * DocumentStore is a lightweight helper for interacting with jsonb documents in the
 * sqlite database as if it were a document store. Every control-plane entity lives in
 * a named collection here; uniqueness and secondary lookups are enforced with
 * expression indexes over the jsonb payloads, and counter updates are single-statement
 * increments so concurrent reconciles never lose writes.
 */
#[derive(Debug, Clone)]
pub struct DocumentStore {
  sqlite_connection: Arc<SqliteConnection>,
}

impl DocumentStore {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip(self))]
  pub async fn setup_indexes(
    &self,
    mappings: HashMap<&'static str, Vec<&'static str>>,
  ) -> Result<()> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        for (collection, keys) in mappings.into_iter() {
          for key in keys.into_iter() {
            let index_name = format!("{}_{}_index", collection, key.replace('.', "_"));
            tx.execute(
              format!(
                "
                CREATE INDEX IF NOT EXISTS {}
                ON document_store (jsonb_extract(json, '$.{}'), id)
                WHERE collection = '{}';
                ",
                index_name, key, collection
              )
              .as_str(),
              [],
            )?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to setup indexes in sqlite database"
        );
        anyhow!("Failed to setup indexes in sqlite database")
      })?
  }

  /// Case-insensitive unique indexes, one per key tuple.
  #[instrument(skip(self))]
  pub async fn setup_unique_indexes(
    &self,
    mappings: HashMap<&'static str, Vec<Vec<&'static str>>>,
  ) -> Result<()> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        for (collection, key_tuples) in mappings.into_iter() {
          for keys in key_tuples.into_iter() {
            let index_name = format!(
              "{}_{}_unique_index",
              collection,
              keys.join("_").replace('.', "_")
            );
            let columns = keys
              .iter()
              .map(|key| format!("lower(jsonb_extract(json, '$.{}'))", key))
              .collect::<Vec<_>>()
              .join(", ");
            tx.execute(
              format!(
                "
                CREATE UNIQUE INDEX IF NOT EXISTS {}
                ON document_store ({})
                WHERE collection = '{}';
                ",
                index_name, columns, collection
              )
              .as_str(),
              [],
            )?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to setup unique indexes in sqlite database"
        );
        anyhow!("Failed to setup unique indexes in sqlite database")
      })?
  }

  #[instrument(skip(self, entries))]
  pub async fn put_many<T: Serialize + Send + Sync>(
    &self,
    collection: &str,
    entries: Vec<(&str, T, Option<Duration>)>,
  ) -> Result<()> {
    let entries = entries
      .into_iter()
      .map(|(key, document, ttl)| {
        let expires_at = ttl.map(|ttl| chrono::Utc::now().naive_utc() + ttl);
        let json = serde_json::to_string(&document)?;
        Ok((key.to_string(), json, expires_at))
      })
      .collect::<Result<Vec<(String, String, Option<NaiveDateTime>)>>>()?;
    let collection = collection.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        for (key, json, expires_at) in entries.into_iter() {
          tx.execute(
            "
            INSERT INTO document_store (collection, key, json, expires_at)
            VALUES (?, ?, jsonb(?), ?)
            ON CONFLICT(collection, key) DO UPDATE SET
              json = excluded.json,
              expires_at = excluded.expires_at,
              updated_at = CURRENT_TIMESTAMP;
            ",
            params![collection, key, json, expires_at],
          )?;
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to put documents in sqlite database"
        );
        anyhow!("Failed to put documents in sqlite database")
      })??;
    Ok(())
  }

  #[instrument(skip(self, document))]
  pub async fn put<T: Serialize + Send + Sync>(
    &self,
    collection: &str,
    key: &str,
    document: T,
    ttl: Option<Duration>,
  ) -> Result<()> {
    self.put_many(collection, vec![(key, document, ttl)]).await
  }

  /// Insert-only variant; a unique-index collision surfaces as `DuplicateDocument`.
  #[instrument(skip(self, document))]
  pub async fn insert<T: Serialize + Send + Sync>(
    &self,
    collection: &str,
    key: &str,
    document: T,
  ) -> Result<()> {
    let collection = collection.to_string();
    let key = key.to_string();
    let json = serde_json::to_string(&document)?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "
          INSERT INTO document_store (collection, key, json)
          VALUES (?, ?, jsonb(?));
          ",
          params![collection, key, json],
        )
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to insert document in sqlite database"
        );
        anyhow!("Failed to insert document in sqlite database")
      })?
      .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(inner, _)
          if inner.code == ErrorCode::ConstraintViolation =>
        {
          anyhow!("DuplicateDocument")
        }
        _ => anyhow!(e.to_string()),
      })?;
    Ok(())
  }

  #[instrument(skip(self, filter))]
  pub async fn query<T: DeserializeOwned + Send + Sync>(
    &self,
    collection: &str,
    mut filter: DocumentFilter,
    options: QueryOptions,
  ) -> Result<QueryResult<T>> {
    let (mut sql, mut query_params) = filter.to_sql(collection.to_string())?;
    if let Some(id_cursor) = options.id_cursor {
      sql.push_str(" AND id >= :id_cursor");
      query_params.push((":id_cursor".to_string(), Box::new(id_cursor)));
    }
    sql.push_str(" ORDER BY id ASC");
    let limit = options.limit;
    let extended_limit = limit.map(|l| l + 1);
    if let Some(extended_limit) = extended_limit {
      sql.push_str(" LIMIT :limit");
      query_params.push((":limit".to_string(), Box::new(extended_limit as i64)));
    }

    let rows = self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut stmt = conn.prepare(sql.as_str())?;
        let params_refs = query_params
          .iter()
          .map(|(k, v)| (k.as_str(), v.as_ref() as &dyn ToSql))
          .collect::<Vec<_>>();
        let rows = stmt.query_map(params_refs.as_slice(), |row| {
          Ok((
            row.get::<_, u64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, NaiveDateTime>(4)?,
            row.get::<_, NaiveDateTime>(5)?,
            row.get::<_, Option<NaiveDateTime>>(6)?,
          ))
        })?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to query documents from sqlite database"
        );
        anyhow!("Failed to query documents from sqlite database")
      })??;

    let mut documents = rows
      .into_iter()
      .filter_map(row_to_document::<T>)
      .collect::<Vec<_>>();
    let next_cursor_doc = match limit {
      Some(limit) if documents.len() > limit => documents.pop(),
      _ => None,
    };
    Ok(QueryResult {
      documents,
      next_id_cursor: next_cursor_doc.map(|doc| doc.id),
    })
  }

  pub async fn find_by_filter<T: DeserializeOwned + Send + Sync>(
    &self,
    collection: &str,
    filter: DocumentFilter,
  ) -> Result<Option<Document<T>>> {
    let mut result = self
      .query::<T>(
        collection,
        filter,
        QueryOptions {
          limit: Some(1),
          id_cursor: None,
        },
      )
      .await?;
    Ok(result.documents.pop())
  }

  /// Batched iteration over every document matching the filter, in insertion order.
  pub fn stream_query<'a, T: DeserializeOwned + Send + Sync + Clone + 'a>(
    &'a self,
    collection: &'a str,
    filter_factory: impl Fn() -> DocumentFilter + 'a,
    batch_size: usize,
  ) -> impl Stream<Item = Result<Vec<Document<T>>>> + 'a {
    try_stream! {
      let mut id_cursor: Option<u64> = None;
      loop {
        let result = self
          .query::<T>(
            collection,
            filter_factory(),
            QueryOptions {
              limit: Some(batch_size),
              id_cursor,
            },
          )
          .await?;
        if result.documents.is_empty() {
          break;
        }
        let next_id_cursor = result.next_id_cursor;
        yield result.documents;
        match next_id_cursor {
          Some(cursor) => id_cursor = Some(cursor),
          None => break,
        }
      }
    }
  }

  #[instrument(skip(self, filter))]
  pub async fn count(&self, collection: &str, mut filter: DocumentFilter) -> Result<usize> {
    let collection = collection.to_string();
    let (where_sql, mut query_params) = filter.to_where_clause()?;
    let mut sql = "
      SELECT COUNT(*)
      FROM document_store
      WHERE collection = :collection
      AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
      "
    .to_string();
    if !where_sql.is_empty() {
      sql.push_str(format!(" AND ({})", where_sql).as_str());
    }
    query_params.push((":collection".to_string(), Box::new(collection)));

    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let params_refs = query_params
          .iter()
          .map(|(k, v)| (k.as_str(), v.as_ref() as &dyn ToSql))
          .collect::<Vec<_>>();
        conn.query_row(sql.as_str(), params_refs.as_slice(), |row| {
          row.get::<_, usize>(0)
        })
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count documents");
        anyhow!("Failed to count documents")
      })?
      .map_err(|e| anyhow!(e.to_string()))
  }

  /// Count of distinct values at a jsonb path among matching documents.
  #[instrument(skip(self, filter))]
  pub async fn count_distinct(
    &self,
    collection: &str,
    path: &str,
    mut filter: DocumentFilter,
  ) -> Result<usize> {
    let collection = collection.to_string();
    let (where_sql, mut query_params) = filter.to_where_clause()?;
    let mut sql = format!(
      "
      SELECT COUNT(DISTINCT jsonb_extract(json, '$.{}'))
      FROM document_store
      WHERE collection = :collection
      AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP)
      ",
      path
    );
    if !where_sql.is_empty() {
      sql.push_str(format!(" AND ({})", where_sql).as_str());
    }
    query_params.push((":collection".to_string(), Box::new(collection)));

    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let params_refs = query_params
          .iter()
          .map(|(k, v)| (k.as_str(), v.as_ref() as &dyn ToSql))
          .collect::<Vec<_>>();
        conn.query_row(sql.as_str(), params_refs.as_slice(), |row| {
          row.get::<_, usize>(0)
        })
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count distinct values");
        anyhow!("Failed to count distinct values")
      })?
      .map_err(|e| anyhow!(e.to_string()))
  }

  #[instrument(skip(self))]
  pub async fn find_many<T: DeserializeOwned + Send + Sync>(
    &self,
    collection: &str,
    keys: Vec<String>,
  ) -> Result<HashMap<String, Document<T>>> {
    let collection = collection.to_string();
    let documents = self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let mut stmt = conn.prepare(
          format!(
            "
            SELECT id, collection, key, json(json), created_at, updated_at, expires_at
            FROM document_store
            WHERE collection = ? AND key IN ({})
            AND (expires_at IS NULL OR expires_at > CURRENT_TIMESTAMP);
            ",
            placeholders
          )
          .as_str(),
        )?;
        let mut query_params: Vec<&dyn ToSql> = vec![&collection];
        for key in keys.iter() {
          query_params.push(key);
        }
        let rows = stmt.query_map(query_params.as_slice(), |row| {
          Ok((
            row.get::<_, u64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, NaiveDateTime>(4)?,
            row.get::<_, NaiveDateTime>(5)?,
            row.get::<_, Option<NaiveDateTime>>(6)?,
          ))
        })?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to get document from sqlite database"
        );
        anyhow!("Failed to get document from sqlite database")
      })??
      .into_iter()
      .filter_map(|row| row_to_document::<T>(row).map(|doc| (doc.key.clone(), doc)))
      .collect::<HashMap<String, Document<T>>>();
    Ok(documents)
  }

  #[instrument(skip(self))]
  pub async fn find<T: DeserializeOwned + Send + Sync>(
    &self,
    collection: &str,
    key: &str,
  ) -> Result<Option<Document<T>>> {
    Ok(
      self
        .find_many(collection, vec![key.to_string()])
        .await?
        .remove(key),
    )
  }

  /// Single-statement `x = x + delta` updates on numeric jsonb paths. Missing
  /// paths count from zero. This is the only sanctioned way to mutate org
  /// byte/second counters.
  #[instrument(skip(self, deltas))]
  pub async fn inc_counters(
    &self,
    collection: &str,
    key: &str,
    deltas: Vec<(&str, i64)>,
  ) -> Result<()> {
    if deltas.is_empty() {
      return Ok(());
    }
    let collection = collection.to_string();
    let key = key.to_string();
    let set_args = deltas
      .iter()
      .enumerate()
      .map(|(idx, (path, _))| {
        format!(
          "'$.{}', COALESCE(jsonb_extract(json, '$.{}'), 0) + :d{}",
          path, path, idx
        )
      })
      .collect::<Vec<_>>()
      .join(", ");
    let sql = format!(
      "
      UPDATE document_store
      SET json = jsonb_set(json, {}), updated_at = CURRENT_TIMESTAMP
      WHERE collection = :collection AND key = :key;
      ",
      set_args
    );
    let deltas = deltas
      .into_iter()
      .map(|(_, delta)| delta)
      .collect::<Vec<_>>();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut query_params: Vec<(String, &dyn ToSql)> = vec![
          (":collection".to_string(), &collection),
          (":key".to_string(), &key),
        ];
        for (idx, delta) in deltas.iter().enumerate() {
          query_params.push((format!(":d{}", idx), delta));
        }
        let params_refs = query_params
          .iter()
          .map(|(k, v)| (k.as_str(), *v))
          .collect::<Vec<_>>();
        conn.execute(sql.as_str(), params_refs.as_slice())?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to increment counters");
        anyhow!("Failed to increment counters")
      })??;
    Ok(())
  }

  /// Partial update of named jsonb paths, leaving the rest of the document alone.
  #[instrument(skip(self, fields))]
  pub async fn set_fields(
    &self,
    collection: &str,
    key: &str,
    fields: Vec<(&str, serde_json::Value)>,
  ) -> Result<()> {
    if fields.is_empty() {
      return Ok(());
    }
    let collection = collection.to_string();
    let key = key.to_string();
    let set_args = fields
      .iter()
      .enumerate()
      .map(|(idx, (path, _))| format!("'$.{}', jsonb(:v{})", path, idx))
      .collect::<Vec<_>>()
      .join(", ");
    let sql = format!(
      "
      UPDATE document_store
      SET json = jsonb_set(json, {}), updated_at = CURRENT_TIMESTAMP
      WHERE collection = :collection AND key = :key;
      ",
      set_args
    );
    let values = fields
      .into_iter()
      .map(|(_, value)| serde_json::to_string(&value))
      .collect::<Result<Vec<_>, _>>()?;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut query_params: Vec<(String, &dyn ToSql)> = vec![
          (":collection".to_string(), &collection),
          (":key".to_string(), &key),
        ];
        for (idx, value) in values.iter().enumerate() {
          query_params.push((format!(":v{}", idx), value));
        }
        let params_refs = query_params
          .iter()
          .map(|(k, v)| (k.as_str(), *v))
          .collect::<Vec<_>>();
        conn.execute(sql.as_str(), params_refs.as_slice())?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set document fields");
        anyhow!("Failed to set document fields")
      })??;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn delete(&self, collection: &str, key: &str) -> Result<()> {
    let collection = collection.to_string();
    let key = key.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "
          DELETE FROM document_store
          WHERE collection = ? AND key = ?;
          ",
          params![collection, key],
        )?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(
          message = e.to_string(),
          "Failed to delete document from sqlite database"
        );
        anyhow!("Failed to delete document from sqlite database")
      })??;
    Ok(())
  }

  #[instrument(skip(self, filter))]
  pub async fn delete_matching(
    &self,
    collection: &str,
    mut filter: DocumentFilter,
  ) -> Result<usize> {
    let collection = collection.to_string();
    let (where_sql, mut query_params) = filter.to_where_clause()?;
    let mut sql = "DELETE FROM document_store WHERE collection = :collection".to_string();
    if !where_sql.is_empty() {
      sql.push_str(format!(" AND ({})", where_sql).as_str());
    }
    query_params.push((":collection".to_string(), Box::new(collection)));

    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let params_refs = query_params
          .iter()
          .map(|(k, v)| (k.as_str(), v.as_ref() as &dyn ToSql))
          .collect::<Vec<_>>();
        conn.execute(sql.as_str(), params_refs.as_slice())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to delete documents");
        anyhow!("Failed to delete documents")
      })?
      .map_err(|e| anyhow!(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
  struct TestDoc {
    oid: String,
    state: String,
    count: i64,
    nested: Nested,
  }

  #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
  struct Nested {
    size: i64,
  }

  async fn test_store() -> (tempfile::TempDir, DocumentStore) {
    let dir = tempfile::tempdir().unwrap();
    let connection = Arc::new(
      crate::sqlite::SqliteConnection::at_path(dir.path().join("test.db"))
        .await
        .unwrap(),
    );
    (dir, DocumentStore::new(connection))
  }

  fn doc(oid: &str, state: &str) -> TestDoc {
    TestDoc {
      oid: oid.to_string(),
      state: state.to_string(),
      count: 0,
      nested: Nested { size: 10 },
    }
  }

  #[tokio::test]
  async fn test_put_find_roundtrip() {
    let (_dir, store) = test_store().await;
    store.put("crawls", "c1", doc("o1", "running"), None).await.unwrap();
    let found = store.find::<TestDoc>("crawls", "c1").await.unwrap().unwrap();
    assert_eq!(found.document, doc("o1", "running"));
    assert!(store.find::<TestDoc>("crawls", "missing").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_query_with_filter() {
    let (_dir, store) = test_store().await;
    store.put("crawls", "c1", doc("o1", "running"), None).await.unwrap();
    store.put("crawls", "c2", doc("o1", "complete"), None).await.unwrap();
    store.put("crawls", "c3", doc("o2", "running"), None).await.unwrap();

    let mut filter = DocumentFilter::new();
    filter
      .condition("oid", "=", "o1".to_string())
      .condition("state", "=", "running".to_string());
    let result = store
      .query::<TestDoc>("crawls", filter.build(), QueryOptions::default())
      .await
      .unwrap();
    assert_eq!(result.documents.len(), 1);
    assert_eq!(result.documents[0].key, "c1");

    let mut any_filter = DocumentFilter::new();
    any_filter.any_of("state", vec!["running".to_string(), "complete".to_string()]);
    let count = store.count("crawls", any_filter.build()).await.unwrap();
    assert_eq!(count, 3);
  }

  #[tokio::test]
  async fn test_inc_counters_is_cumulative() {
    let (_dir, store) = test_store().await;
    store.put("orgs", "o1", doc("o1", "active"), None).await.unwrap();
    store
      .inc_counters("orgs", "o1", vec![("count", 5), ("nested.size", -3)])
      .await
      .unwrap();
    store
      .inc_counters("orgs", "o1", vec![("count", 2)])
      .await
      .unwrap();
    let found = store.find::<TestDoc>("orgs", "o1").await.unwrap().unwrap();
    assert_eq!(found.document.count, 7);
    assert_eq!(found.document.nested.size, 7);
  }

  #[tokio::test]
  async fn test_set_fields_partial_update() {
    let (_dir, store) = test_store().await;
    store.put("crawls", "c1", doc("o1", "running"), None).await.unwrap();
    store
      .set_fields(
        "crawls",
        "c1",
        vec![("state", serde_json::json!("complete"))],
      )
      .await
      .unwrap();
    let found = store.find::<TestDoc>("crawls", "c1").await.unwrap().unwrap();
    assert_eq!(found.document.state, "complete");
    assert_eq!(found.document.oid, "o1");
  }

  #[tokio::test]
  async fn test_unique_index_rejects_duplicates_case_insensitively() {
    let (_dir, store) = test_store().await;
    store
      .setup_unique_indexes(HashMap::from([("orgs", vec![vec!["oid", "state"]])]))
      .await
      .unwrap();
    store.insert("orgs", "a", doc("O1", "Default")).await.unwrap();
    let duplicate = store.insert("orgs", "b", doc("o1", "default")).await;
    assert!(duplicate.is_err());
    assert!(duplicate.unwrap_err().to_string().contains("DuplicateDocument"));
  }

  #[tokio::test]
  async fn test_count_distinct_and_delete_matching() {
    let (_dir, store) = test_store().await;
    store.put("pages", "p1", doc("o1", "a"), None).await.unwrap();
    store.put("pages", "p2", doc("o1", "a"), None).await.unwrap();
    store.put("pages", "p3", doc("o1", "b"), None).await.unwrap();

    let distinct = store
      .count_distinct("pages", "state", DocumentFilter::new())
      .await
      .unwrap();
    assert_eq!(distinct, 2);

    let mut filter = DocumentFilter::new();
    filter.condition("state", "=", "a".to_string());
    let deleted = store.delete_matching("pages", filter.build()).await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.count("pages", DocumentFilter::new()).await.unwrap(), 1);
  }
}
