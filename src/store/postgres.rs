//! Postgres adapter: every collection lives in one JSONB table and a trigger
//! publishes the touched collection on `document_changes`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    stamp_new, stamp_update, BatchOp, CollectionRef, DocRef, Document, DocumentStore, Fields, Op,
    Query, StoreError,
};

const CHANGE_CHANNEL: &str = "document_changes";
const CHANGE_CAPACITY: usize = 256;

pub struct PgDocumentStore {
    pool: PgPool,
    /// Subscription template. The listener task owns the only sender, so
    /// subscribers see `Closed` once it stops.
    changes: broadcast::Receiver<String>,
    listener: JoinHandle<()>,
}

/// Source of changed collection names.
#[async_trait]
trait ChangeSource: Send + 'static {
    async fn next_change(&mut self) -> Result<String, sqlx::Error>;
}

#[async_trait]
impl ChangeSource for PgListener {
    async fn next_change(&mut self) -> Result<String, sqlx::Error> {
        Ok(self.recv().await?.payload().to_string())
    }
}

/// Forwards changes from `source` until it fails, then drops the sender.
fn spawn_change_feed<S: ChangeSource>(
    mut source: S,
) -> (JoinHandle<()>, broadcast::Receiver<String>) {
    let (sender, changes) = broadcast::channel(CHANGE_CAPACITY);
    let task = tokio::spawn(async move {
        loop {
            match source.next_change().await {
                Ok(collection) => {
                    debug!(%collection, "document change");
                    let _ = sender.send(collection);
                }
                Err(err) => {
                    warn!(error = %err, "change listener stopped");
                    break;
                }
            }
        }
    });
    (task, changes)
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        let (listener, changes) = spawn_change_feed(listener);

        Ok(Self {
            pool,
            changes,
            listener,
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

impl Drop for PgDocumentStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn body_fields(body: Value) -> Result<Fields, StoreError> {
    match body {
        Value::Object(fields) => Ok(fields),
        other => Err(StoreError::InvalidDocument(format!(
            "document body is not an object: {other}"
        ))),
    }
}

async fn upsert<'e, E: PgExecutor<'e>>(
    executor: E,
    doc: &DocRef,
    mut fields: Fields,
) -> Result<(), StoreError> {
    stamp_new(&mut fields);
    sqlx::query(
        r#"
        INSERT INTO scoreboard.documents (collection, id, body)
        VALUES ($1, $2, $3)
        ON CONFLICT (collection, id) DO UPDATE
        SET body = CASE
                WHEN documents.body ? 'createdAt'
                THEN EXCLUDED.body || jsonb_build_object('createdAt', documents.body -> 'createdAt')
                ELSE EXCLUDED.body
            END,
            updated_at = now()
        "#,
    )
    .bind(&doc.collection)
    .bind(&doc.id)
    .bind(Value::Object(fields))
    .execute(executor)
    .await?;
    Ok(())
}

async fn merge<'e, E: PgExecutor<'e>>(
    executor: E,
    doc: &DocRef,
    mut fields: Fields,
) -> Result<(), StoreError> {
    stamp_update(&mut fields);
    let result = sqlx::query(
        r#"
        UPDATE scoreboard.documents
        SET body = body || $3, updated_at = now()
        WHERE collection = $1 AND id = $2
        "#,
    )
    .bind(&doc.collection)
    .bind(&doc.id)
    .bind(Value::Object(fields))
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            collection: doc.collection.clone(),
            id: doc.id.clone(),
        });
    }
    Ok(())
}

async fn remove<'e, E: PgExecutor<'e>>(executor: E, doc: &DocRef) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM scoreboard.documents WHERE collection = $1 AND id = $2")
        .bind(&doc.collection)
        .bind(&doc.id)
        .execute(executor)
        .await?;
    Ok(())
}

fn build_select(query: &Query) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(
        "SELECT id, body FROM scoreboard.documents WHERE collection = ",
    );
    builder.push_bind(query.collection.clone());

    for filter in &query.filters {
        builder.push(" AND body -> ");
        builder.push_bind(filter.field.clone());
        match filter.op {
            Op::Eq => {
                builder.push(" = ");
                builder.push_bind(filter.value.clone());
            }
            Op::In => {
                let options = match &filter.value {
                    Value::Array(options) => options.clone(),
                    single => vec![single.clone()],
                };
                builder.push(" = ANY(");
                builder.push_bind(options);
                builder.push(")");
            }
            Op::ArrayContains => {
                builder.push(" @> ");
                builder.push_bind(Value::Array(vec![filter.value.clone()]));
            }
        }
    }

    builder.push(" ORDER BY created_at, id");
    builder
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get_doc(&self, doc: &DocRef) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            "SELECT id, body FROM scoreboard.documents WHERE collection = $1 AND id = $2",
        )
        .bind(&doc.collection)
        .bind(&doc.id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Document {
                id: row.get("id"),
                fields: body_fields(row.get("body"))?,
            })
        })
        .transpose()
    }

    async fn get_docs(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut builder = build_select(query);
        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            docs.push(Document {
                id: row.get("id"),
                fields: body_fields(row.get("body"))?,
            });
        }
        Ok(docs)
    }

    async fn add_doc(
        &self,
        collection: &CollectionRef,
        fields: Fields,
    ) -> Result<DocRef, StoreError> {
        let doc = collection.doc(Uuid::new_v4().to_string());
        upsert(&self.pool, &doc, fields).await?;
        Ok(doc)
    }

    async fn set_doc(&self, doc: &DocRef, fields: Fields) -> Result<(), StoreError> {
        upsert(&self.pool, doc, fields).await
    }

    async fn update_doc(&self, doc: &DocRef, fields: Fields) -> Result<(), StoreError> {
        merge(&self.pool, doc, fields).await
    }

    async fn delete_doc(&self, doc: &DocRef) -> Result<(), StoreError> {
        remove(&self.pool, doc).await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                BatchOp::Set(doc, fields) => upsert(&mut *tx, &doc, fields).await?,
                BatchOp::Update(doc, fields) => merge(&mut *tx, &doc, fields).await?,
                BatchOp::Delete(doc) => remove(&mut *tx, &doc).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<String> {
        self.changes.resubscribe()
    }
}
