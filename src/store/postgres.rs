use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::info;

use super::{DocKey, DocumentStore, FilterOp, Query, ReadStamp, Snapshot, WriteOp};
use crate::error::{StoreError, StoreResult};

/// Postgres-backed document store - one `jsonb` row per document plus a version column
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then run the embedded migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("📊 Connecting to document store...");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await?;

        info!("🔄 Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✓ Document store ready ({} max connections)", max_connections);
        Ok(Self::new(pool))
    }

    async fn apply_op(conn: &mut PgConnection, op: WriteOp, insert_only: bool) -> StoreResult<()> {
        match op {
            WriteOp::Set { key, body } if insert_only => {
                // The transaction observed this document as absent; a concurrent insert is a conflict.
                Self::insert(conn, &key, body).await.map_err(|e| match e {
                    StoreError::AlreadyExists(_) => StoreError::Conflict,
                    other => other,
                })
            }
            WriteOp::Set { key, body } => {
                sqlx::query(
                    r#"
                    INSERT INTO documents (collection, id, version, body)
                    VALUES ($1, $2, 1, $3)
                    ON CONFLICT (collection, id)
                    DO UPDATE SET body = EXCLUDED.body, version = documents.version + 1, updated_at = NOW()
                    "#,
                )
                .bind(&key.collection)
                .bind(&key.id)
                .bind(Json(body))
                .execute(&mut *conn)
                .await?;
                Ok(())
            }
            WriteOp::Create { key, body } => Self::insert(conn, &key, body).await,
            WriteOp::Update { key, fields } => {
                let result = sqlx::query(
                    r#"
                    UPDATE documents
                    SET body = body || $3, version = version + 1, updated_at = NOW()
                    WHERE collection = $1 AND id = $2
                    "#,
                )
                .bind(&key.collection)
                .bind(&key.id)
                .bind(Json(Value::Object(fields)))
                .execute(&mut *conn)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound(key));
                }
                Ok(())
            }
        }
    }

    async fn insert(conn: &mut PgConnection, key: &DocKey, body: Value) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, version, body)
            VALUES ($1, $2, 1, $3)
            "#,
        )
        .bind(&key.collection)
        .bind(&key.id)
        .bind(Json(body))
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, key: &DocKey) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query_as::<_, (i64, Json<Value>)>(
            r#"
            SELECT version, body
            FROM documents
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(&key.collection)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(version, Json(body))| Snapshot {
            key: key.clone(),
            version: version as u64,
            body,
        }))
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Snapshot>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, version, body FROM documents WHERE collection = ",
        );
        qb.push_bind(query.collection.clone());

        for filter in &query.filters {
            let field = filter.field.clone();
            match filter.op {
                FilterOp::Eq if filter.value.is_null() => {
                    qb.push(" AND (body -> ")
                        .push_bind(field.clone())
                        .push(" IS NULL OR body -> ")
                        .push_bind(field)
                        .push(" = 'null'::jsonb)");
                }
                FilterOp::Eq => {
                    qb.push(" AND body -> ")
                        .push_bind(field)
                        .push(" = ")
                        .push_bind(Json(filter.value.clone()));
                }
                FilterOp::Ne if filter.value.is_null() => {
                    qb.push(" AND body -> ")
                        .push_bind(field.clone())
                        .push(" IS NOT NULL AND body -> ")
                        .push_bind(field)
                        .push(" <> 'null'::jsonb");
                }
                FilterOp::Ne => {
                    qb.push(" AND (body -> ")
                        .push_bind(field.clone())
                        .push(" IS NULL OR body -> ")
                        .push_bind(field)
                        .push(" <> ")
                        .push_bind(Json(filter.value.clone()))
                        .push(")");
                }
                FilterOp::Lte => {
                    qb.push(" AND body -> ")
                        .push_bind(field)
                        .push(" <= ")
                        .push_bind(Json(filter.value.clone()));
                }
                FilterOp::Contains => {
                    qb.push(" AND body -> ")
                        .push_bind(field)
                        .push(" @> ")
                        .push_bind(Json(Value::Array(vec![filter.value.clone()])));
                }
            }
        }

        if let Some(cursor) = &query.start_after {
            qb.push(" AND id > ").push_bind(cursor.clone());
        }

        qb.push(" ORDER BY id");
        if query.limit != usize::MAX {
            qb.push(" LIMIT ").push_bind(query.limit as i64);
        }

        let rows = qb
            .build_query_as::<(String, i64, Json<Value>)>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, version, Json(body))| Snapshot {
                key: DocKey::new(query.collection.clone(), id),
                version: version as u64,
                body,
            })
            .collect())
    }

    async fn batch_write(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            Self::apply_op(&mut tx, op, false).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn commit(&self, reads: Vec<ReadStamp>, writes: Vec<WriteOp>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for read in &reads {
            let current = sqlx::query_scalar::<_, i64>(
                r#"
                SELECT version
                FROM documents
                WHERE collection = $1 AND id = $2
                FOR UPDATE
                "#,
            )
            .bind(&read.key.collection)
            .bind(&read.key.id)
            .fetch_optional(&mut *tx)
            .await?;

            if current.map(|v| v as u64) != read.version {
                tx.rollback().await?;
                return Err(StoreError::Conflict);
            }
        }

        let absent: HashSet<&DocKey> = reads
            .iter()
            .filter(|r| r.version.is_none())
            .map(|r| &r.key)
            .collect();

        for op in writes {
            let insert_only = absent.contains(op.key());
            Self::apply_op(&mut tx, op, insert_only).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
