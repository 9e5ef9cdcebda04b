//! PostgreSQL implementation of CoordinationStore
//!
//! Production persistence with:
//! - Optimistic concurrency on the per-constraint queue version
//! - Queue order drawn from a counter on the constraint row
//! - Row locks for barrier check-in, conditional upserts for idempotency

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::records::*;
use super::store::*;

const INSTANCE_COLUMNS: &str = r#"id, resource_constraint_id, resource_unit, "order", state, strategy,
    permits, release_entity_type, release_entity_id, acquired_at, valid_until, created_at"#;

const CONSTRAINT_COLUMNS: &str =
    "id, account_id, name, capacity, strategy, created_by, created_at, updated_at";

/// PostgreSQL implementation of CoordinationStore
///
/// # Example
///
/// ```ignore
/// use convoy_coordination::PostgresCoordinationStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/convoy").await?;
/// let store = PostgresCoordinationStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresCoordinationStore {
    pool: PgPool,
}

impl PostgresCoordinationStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run coordination migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn constraint_from_row(row: &PgRow) -> Result<ResourceConstraint, StoreError> {
    let strategy: String = row.get("strategy");
    Ok(ResourceConstraint {
        id: row.get("id"),
        account_id: row.get("account_id"),
        name: row.get("name"),
        capacity: row.get::<i32, _>("capacity") as u32,
        strategy: strategy.parse()?,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn instance_from_row(row: &PgRow) -> Result<ResourceConstraintInstance, StoreError> {
    let state: String = row.get("state");
    let strategy: String = row.get("strategy");
    let scope: String = row.get("release_entity_type");
    Ok(ResourceConstraintInstance {
        id: row.get("id"),
        resource_constraint_id: row.get("resource_constraint_id"),
        resource_unit: row.get("resource_unit"),
        order: row.get("order"),
        state: state.parse()?,
        strategy: strategy.parse()?,
        permits: row.get::<i32, _>("permits") as u32,
        release_entity_type: scope.parse()?,
        release_entity_id: row.get("release_entity_id"),
        acquired_at: row.get("acquired_at"),
        valid_until: row.get("valid_until"),
        created_at: row.get("created_at"),
    })
}

fn barrier_from_row(row: &PgRow) -> Result<BarrierInstance, StoreError> {
    let state: String = row.get("state");
    let workflows: serde_json::Value = row.get("workflows");
    Ok(BarrierInstance {
        id: row.get("id"),
        app_id: row.get("app_id"),
        name: row.get("name"),
        state: state.parse()?,
        pipeline: BarrierPipeline {
            execution_id: row.get("execution_id"),
            workflows: serde_json::from_value(workflows)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        },
        valid_until: row.get("valid_until"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn idempotent_from_row(row: &PgRow) -> Result<IdempotentRecord, StoreError> {
    let state: String = row.get("state");
    let result: serde_json::Value = row.get("result");
    Ok(IdempotentRecord {
        fingerprint: row.get("fingerprint"),
        state: state.parse()?,
        owner: row.get("owner"),
        result: serde_json::from_value(result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        valid_until: row.get("valid_until"),
        created_at: row.get("created_at"),
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[async_trait]
impl CoordinationStore for PostgresCoordinationStore {
    #[instrument(skip(self, constraint), fields(account_id = %constraint.account_id, constraint = %constraint.name))]
    async fn create_constraint(
        &self,
        constraint: NewResourceConstraint,
    ) -> Result<ResourceConstraint, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO resource_constraints (id, account_id, name, capacity, strategy, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {CONSTRAINT_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(&constraint.account_id)
        .bind(&constraint.name)
        .bind(constraint.capacity as i32)
        .bind(constraint.strategy.to_string())
        .bind(&constraint.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::DuplicateConstraint {
                    account_id: constraint.account_id.clone(),
                    name: constraint.name.clone(),
                };
            }
            error!("Failed to create resource constraint: {}", e);
            db_err(e)
        })?;

        let created = constraint_from_row(&row)?;
        debug!(constraint_id = %created.id, "created resource constraint");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get_constraint(&self, id: Uuid) -> Result<ResourceConstraint, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONSTRAINT_COLUMNS} FROM resource_constraints WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ConstraintNotFound(id))?;

        constraint_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_constraint_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<ResourceConstraint>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONSTRAINT_COLUMNS} FROM resource_constraints WHERE account_id = $1 AND name = $2"
        ))
        .bind(account_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(constraint_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn update_constraint(
        &self,
        id: Uuid,
        capacity: u32,
        strategy: ConstraintStrategy,
    ) -> Result<ResourceConstraint, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE resource_constraints
            SET capacity = $2,
                strategy = $3,
                queue_version = queue_version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {CONSTRAINT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(capacity as i32)
        .bind(strategy.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update resource constraint: {}", e);
            db_err(e)
        })?
        .ok_or(StoreError::ConstraintNotFound(id))?;

        constraint_from_row(&row)
    }

    #[instrument(skip(self, instance), fields(resource_unit = %instance.resource_unit))]
    async fn enqueue_instance(
        &self,
        constraint_id: Uuid,
        instance: NewConstraintInstance,
    ) -> Result<ResourceConstraintInstance, StoreError> {
        // Order allocation and version bump happen in the same statement
        let row = sqlx::query(&format!(
            r#"
            WITH bumped AS (
                UPDATE resource_constraints
                SET next_order = next_order + 1,
                    queue_version = queue_version + 1
                WHERE id = $1
                RETURNING next_order - 1 AS assigned_order
            )
            INSERT INTO resource_constraint_instances (
                id, resource_constraint_id, resource_unit, "order", state, strategy,
                permits, release_entity_type, release_entity_id, valid_until
            )
            SELECT $2, $1, $3, assigned_order, 'blocked', $4, $5, $6, $7, $8
            FROM bumped
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(constraint_id)
        .bind(Uuid::now_v7())
        .bind(&instance.resource_unit)
        .bind(instance.strategy.to_string())
        .bind(instance.permits as i32)
        .bind(instance.release_entity_type.to_string())
        .bind(&instance.release_entity_id)
        .bind(instance.valid_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue constraint instance: {}", e);
            db_err(e)
        })?
        .ok_or(StoreError::ConstraintNotFound(constraint_id))?;

        let created = instance_from_row(&row)?;
        debug!(%constraint_id, instance_id = %created.id, order = created.order, "enqueued instance");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get_instance(
        &self,
        id: Uuid,
    ) -> Result<Option<ResourceConstraintInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM resource_constraint_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn load_queue(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
    ) -> Result<ConstraintQueue, StoreError> {
        // The version is read before the instances. Any instance change that
        // slips in between also bumps the version, so the CAS in
        // apply_queue_update rejects plans built on a torn snapshot.
        let row = sqlx::query(&format!(
            "SELECT {CONSTRAINT_COLUMNS}, queue_version FROM resource_constraints WHERE id = $1"
        ))
        .bind(constraint_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ConstraintNotFound(constraint_id))?;

        let constraint = constraint_from_row(&row)?;
        let version: i64 = row.get("queue_version");

        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM resource_constraint_instances
            WHERE resource_constraint_id = $1
              AND resource_unit = $2
              AND state <> 'finished'
            ORDER BY "order"
            "#
        ))
        .bind(constraint_id)
        .bind(resource_unit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let instances = rows
            .iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConstraintQueue {
            constraint,
            version,
            instances,
        })
    }

    #[instrument(skip(self, update), fields(finish = update.finish.len(), activate = update.activate.len()))]
    async fn apply_queue_update(
        &self,
        constraint_id: Uuid,
        expected_version: i64,
        update: &QueueUpdate,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Conditional bump takes the row lock; concurrent appliers serialize here
        let bumped = sqlx::query(
            r#"
            UPDATE resource_constraints
            SET queue_version = queue_version + 1
            WHERE id = $1 AND queue_version = $2
            RETURNING queue_version
            "#,
        )
        .bind(constraint_id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(bumped) = bumped else {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT queue_version FROM resource_constraints WHERE id = $1",
            )
            .bind(constraint_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            return match actual {
                Some(actual) => Err(StoreError::ConcurrencyConflict {
                    expected: expected_version,
                    actual,
                }),
                None => Err(StoreError::ConstraintNotFound(constraint_id)),
            };
        };
        let new_version: i64 = bumped.get("queue_version");

        if !update.finish.is_empty() {
            sqlx::query(
                r#"
                UPDATE resource_constraint_instances
                SET state = 'finished'
                WHERE id = ANY($1) AND state <> 'finished'
                "#,
            )
            .bind(&update.finish)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if !update.activate.is_empty() {
            sqlx::query(
                r#"
                UPDATE resource_constraint_instances
                SET state = 'active',
                    acquired_at = $2
                WHERE id = ANY($1) AND state = 'blocked'
                "#,
            )
            .bind(&update.activate)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%constraint_id, new_version, "applied queue update");
        Ok(new_version)
    }

    #[instrument(skip(self))]
    async fn list_instances(
        &self,
        constraint_id: Uuid,
        resource_unit: Option<&str>,
        states: &[InstanceState],
    ) -> Result<Vec<ResourceConstraintInstance>, StoreError> {
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM resource_constraint_instances
            WHERE resource_constraint_id = $1
              AND ($2::TEXT IS NULL OR resource_unit = $2)
              AND (cardinality($3::TEXT[]) = 0 OR state = ANY($3))
            ORDER BY "order"
            "#
        ))
        .bind(constraint_id)
        .bind(resource_unit)
        .bind(&states)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_instances_for_holder(
        &self,
        scope: HoldingScope,
        entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM resource_constraint_instances
            WHERE release_entity_type = $1
              AND release_entity_id = $2
              AND state <> 'finished'
            ORDER BY resource_constraint_id, "order"
            "#
        ))
        .bind(scope.to_string())
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self, barrier), fields(barrier = %barrier.name, execution_id = %barrier.pipeline.execution_id))]
    async fn insert_barrier(
        &self,
        barrier: BarrierInstance,
    ) -> Result<(BarrierInstance, bool), StoreError> {
        let workflows = serde_json::to_value(&barrier.pipeline.workflows)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Replaces an expired barrier under the same key, keeps a live one
        let inserted = sqlx::query(
            r#"
            INSERT INTO barrier_instances (id, app_id, name, execution_id, state, workflows, valid_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name, execution_id) DO UPDATE
            SET id = EXCLUDED.id,
                app_id = EXCLUDED.app_id,
                state = EXCLUDED.state,
                workflows = EXCLUDED.workflows,
                valid_until = EXCLUDED.valid_until,
                created_at = NOW(),
                updated_at = NOW()
            WHERE barrier_instances.valid_until <= NOW()
            RETURNING *
            "#,
        )
        .bind(barrier.id)
        .bind(&barrier.app_id)
        .bind(&barrier.name)
        .bind(&barrier.pipeline.execution_id)
        .bind(barrier.state.to_string())
        .bind(&workflows)
        .bind(barrier.valid_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert barrier: {}", e);
            db_err(e)
        })?;

        if let Some(row) = inserted {
            return Ok((barrier_from_row(&row)?, true));
        }

        let existing = self
            .get_barrier(&barrier.name, &barrier.pipeline.execution_id)
            .await?
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "barrier {} for execution {} vanished during declare",
                    barrier.name, barrier.pipeline.execution_id
                ))
            })?;
        Ok((existing, false))
    }

    #[instrument(skip(self))]
    async fn get_barrier(
        &self,
        name: &str,
        execution_id: &str,
    ) -> Result<Option<BarrierInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM barrier_instances WHERE name = $1 AND execution_id = $2",
        )
        .bind(name)
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(barrier_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn check_in_barrier(
        &self,
        name: &str,
        execution_id: &str,
        workflow_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CheckInResult, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT *
            FROM barrier_instances
            WHERE name = $1 AND execution_id = $2 AND valid_until > $3
            FOR UPDATE
            "#,
        )
        .bind(name)
        .bind(execution_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(CheckInResult::Missing);
        };
        let mut barrier = barrier_from_row(&row)?;

        let outcome = barrier.record_arrival(workflow_id, at);
        if let CheckInResult::Recorded { changed: true, .. } = outcome {
            let workflows = serde_json::to_value(&barrier.pipeline.workflows)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                UPDATE barrier_instances
                SET state = $2, workflows = $3, updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(barrier.id)
            .bind(barrier.state.to_string())
            .bind(&workflows)
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(barrier = name, execution_id, workflow_id, ?outcome, "barrier check-in");
        Ok(outcome)
    }

    #[instrument(skip(self, record), fields(fingerprint = %record.fingerprint))]
    async fn insert_idempotent(
        &self,
        record: IdempotentRecord,
        now: DateTime<Utc>,
    ) -> Result<IdempotentInsert, StoreError> {
        let result = serde_json::to_value(&record.result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // The record can be reaped between a refused insert and the re-read
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotent_locks (fingerprint, state, owner, result, valid_until, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (fingerprint) DO UPDATE
                SET state = EXCLUDED.state,
                    owner = EXCLUDED.owner,
                    result = EXCLUDED.result,
                    valid_until = EXCLUDED.valid_until,
                    created_at = EXCLUDED.created_at
                WHERE idempotent_locks.valid_until <= $7
                RETURNING *
                "#,
            )
            .bind(&record.fingerprint)
            .bind(record.state.to_string())
            .bind(record.owner)
            .bind(&result)
            .bind(record.valid_until)
            .bind(record.created_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to insert idempotent record: {}", e);
                db_err(e)
            })?;

            if let Some(row) = inserted {
                return Ok(IdempotentInsert::Inserted(idempotent_from_row(&row)?));
            }

            if let Some(existing) = self.get_idempotent(&record.fingerprint).await? {
                return Ok(IdempotentInsert::Existing(existing));
            }
        }

        Err(StoreError::Database(format!(
            "idempotent record {} kept changing during insert",
            record.fingerprint
        )))
    }

    #[instrument(skip(self))]
    async fn get_idempotent(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IdempotentRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM idempotent_locks WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(idempotent_from_row).transpose()
    }

    #[instrument(skip(self, result))]
    async fn succeed_idempotent(
        &self,
        fingerprint: &str,
        owner: Uuid,
        result: &[serde_json::Value],
        valid_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = serde_json::to_value(result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE idempotent_locks
            SET state = 'succeeded',
                result = $3,
                valid_until = $4
            WHERE fingerprint = $1
              AND owner = $2
              AND state = 'tentative'
              AND valid_until > $5
            "#,
        )
        .bind(fingerprint)
        .bind(owner)
        .bind(&result)
        .bind(valid_until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete idempotent record: {}", e);
            db_err(e)
        })?;

        Ok(updated.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn delete_tentative_idempotent(
        &self,
        fingerprint: &str,
        owner: Uuid,
    ) -> Result<bool, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM idempotent_locks
            WHERE fingerprint = $1 AND owner = $2 AND state = 'tentative'
            "#,
        )
        .bind(fingerprint)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(deleted.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let finished = sqlx::query(
            "DELETE FROM resource_constraint_instances WHERE state = 'finished'",
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Dropping a live holder changes the queue, so its version moves too
        let expired = sqlx::query(
            r#"
            WITH removed AS (
                DELETE FROM resource_constraint_instances
                WHERE valid_until <= $1
                RETURNING resource_constraint_id
            )
            UPDATE resource_constraints
            SET queue_version = queue_version + 1
            WHERE id IN (SELECT DISTINCT resource_constraint_id FROM removed)
            RETURNING (SELECT COUNT(*) FROM removed) AS removed_count
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let expired_instances = expired
            .first()
            .map(|row| row.get::<i64, _>("removed_count") as u64)
            .unwrap_or(0);

        tx.commit().await.map_err(db_err)?;

        let barriers = sqlx::query("DELETE FROM barrier_instances WHERE valid_until <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let locks = sqlx::query("DELETE FROM idempotent_locks WHERE valid_until <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let report = ReapReport {
            finished_instances: finished.rows_affected(),
            expired_instances,
            barriers: barriers.rows_affected(),
            idempotent_locks: locks.rows_affected(),
        };
        debug!(?report, "reaped expired coordination records");
        Ok(report)
    }
}
