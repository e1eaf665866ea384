//! PostgreSQL work store
//!
//! The batch routine runs as one transaction: heartbeat, stale-instance
//! GC, outcome application, lease renewal, new-work insertion, checkpoint
//! auto-creation, then partition-scoped claims with `FOR UPDATE SKIP
//! LOCKED`. Any error rolls the whole exchange back and the caller
//! resubmits on its next tick. The schema is in `schema.sql` at the crate
//! root; the store assumes it already exists.

use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::BTreeMap;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use wb_domain::{
    CheckpointStatus, EventId, EventRecord, FailureReason, InstanceId, MessageAssociation,
    MessageId, PerspectiveCheckpoint, StatusFlags, WorkMessage,
};
use wb_ports::{
    AckCounts, CheckpointOutcome, Completion, FailureOutcome, WorkBatch, WorkBatchRequest,
    WorkStore, WorkStoreError,
};

type PgTx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

/// PostgreSQL-backed work store
pub struct PostgresWorkStore {
    pool: PgPool,
}

trait SqlxResultExt<T> {
    fn store_err(self) -> Result<T, WorkStoreError>;
}

impl<T> SqlxResultExt<T> for Result<T, sqlx::Error> {
    fn store_err(self) -> Result<T, WorkStoreError> {
        self.map_err(|e| WorkStoreError::Connection {
            message: e.to_string(),
        })
    }
}

impl PostgresWorkStore {
    /// Create a new work store with an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to PostgreSQL and create a new work store
    pub async fn connect(database_url: &str) -> Result<Self, WorkStoreError> {
        let pool = PgPool::connect(database_url).await.store_err()?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying pool (for testing/migrations)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn heartbeat(
        tx: &mut PgTx<'_>,
        request: &WorkBatchRequest,
    ) -> Result<(), WorkStoreError> {
        let identity = &request.instance;
        let metadata = serde_json::to_value(&identity.metadata)
            .map_err(|e| WorkStoreError::Serialization {
                message: e.to_string(),
            })?;
        sqlx::query(
            r#"
            INSERT INTO wb.service_instances
                (instance_id, service_name, host_name, process_id, started_at, last_heartbeat_at, metadata)
            VALUES ($1, $2, $3, $4, now(), now(), $5)
            ON CONFLICT (instance_id)
            DO UPDATE SET last_heartbeat_at = now(), metadata = EXCLUDED.metadata
            "#,
        )
        .bind(identity.instance_id.as_uuid())
        .bind(&identity.service_name)
        .bind(&identity.host_name)
        .bind(identity.process_id as i32)
        .bind(metadata)
        .execute(&mut **tx)
        .await.store_err()?;

        sqlx::query(
            "DELETE FROM wb.service_instances WHERE last_heartbeat_at < now() - make_interval(secs => $1)",
        )
        .bind(request.control.stale_threshold_seconds as f64)
        .execute(&mut **tx)
        .await.store_err()?;

        Ok(())
    }

    async fn apply_completions(
        tx: &mut PgTx<'_>,
        table: &str,
        completions: &[Completion],
        done: StatusFlags,
        debug_mode: bool,
        acked: &mut usize,
    ) -> Result<(), WorkStoreError> {
        for completion in completions {
            *acked += 1;
            sqlx::query(&format!(
                r#"
                UPDATE wb.{table} SET
                    status = status | $2,
                    published_at = CASE WHEN $2 & 2 != 0 AND published_at IS NULL THEN now() ELSE published_at END,
                    processed_at = CASE WHEN $2 & 4 != 0 AND processed_at IS NULL THEN now() ELSE processed_at END,
                    instance_id = NULL,
                    lease_expiry = NULL
                WHERE message_id = $1
                "#
            ))
            .bind(completion.message_id.as_uuid())
            .bind(completion.status.bits() as i32)
            .execute(&mut **tx)
            .await.store_err()?;

            if !debug_mode {
                sqlx::query(&format!(
                    "DELETE FROM wb.{table} WHERE message_id = $1 AND status & $2 = $2"
                ))
                .bind(completion.message_id.as_uuid())
                .bind(done.bits() as i32)
                .execute(&mut **tx)
                .await.store_err()?;
            }
        }
        Ok(())
    }

    async fn apply_failures(
        tx: &mut PgTx<'_>,
        table: &str,
        failures: &[FailureOutcome],
        max_attempts: u32,
        acked: &mut usize,
    ) -> Result<(), WorkStoreError> {
        for failure in failures {
            *acked += 1;
            let dead_letter = failure.reason.dead_letters();
            let permanent = failure.reason.is_permanent();
            let unknown = failure.reason == FailureReason::Unknown;
            sqlx::query(&format!(
                r#"
                UPDATE wb.{table} SET
                    attempts = attempts + 1,
                    error = $2,
                    failure_reason = $3,
                    instance_id = NULL,
                    lease_expiry = NULL,
                    status = CASE
                        WHEN $4 THEN status | 16
                        WHEN $5 THEN status | 8
                        WHEN $6 AND attempts + 1 >= $7 THEN status | 16
                        ELSE status
                    END
                WHERE message_id = $1
                "#
            ))
            .bind(failure.message_id.as_uuid())
            .bind(&failure.error)
            .bind(failure.reason.as_str())
            .bind(dead_letter)
            .bind(permanent)
            .bind(unknown)
            .bind(max_attempts as i32)
            .execute(&mut **tx)
            .await.store_err()?;
        }
        Ok(())
    }

    async fn apply_checkpoint_outcomes(
        tx: &mut PgTx<'_>,
        outcomes: &[CheckpointOutcome],
        acked: &mut usize,
    ) -> Result<(), WorkStoreError> {
        for outcome in outcomes {
            *acked += 1;
            match outcome.last_event_id {
                Some(advanced_to) => {
                    // Up to date iff the reported boundary is the stream
                    // head; UUIDv7 byte order is creation order, so max()
                    // is the newest event.
                    let head: Option<Uuid> =
                        sqlx::query_scalar("SELECT max(event_id) FROM wb.events WHERE stream_id = $1")
                            .bind(&outcome.stream_id)
                            .fetch_one(&mut **tx)
                            .await.store_err()?;
                    let status = if head == Some(advanced_to.as_uuid()) {
                        "up_to_date"
                    } else {
                        "pending"
                    };
                    sqlx::query(
                        r#"
                        UPDATE wb.perspective_checkpoints SET
                            last_event_id = CASE
                                WHEN last_event_id IS NULL OR $3 > last_event_id THEN $3
                                ELSE last_event_id
                            END,
                            status = $4,
                            processed_at = now(),
                            error = NULL,
                            instance_id = NULL,
                            lease_expiry = NULL
                        WHERE stream_id = $1 AND perspective_name = $2
                        "#,
                    )
                    .bind(&outcome.stream_id)
                    .bind(&outcome.perspective_name)
                    .bind(advanced_to.as_uuid())
                    .bind(status)
                    .execute(&mut **tx)
                    .await.store_err()?;
                }
                None => {
                    let status = if outcome.reason.is_retryable() {
                        "pending"
                    } else {
                        "faulted"
                    };
                    sqlx::query(
                        r#"
                        UPDATE wb.perspective_checkpoints SET
                            status = $3,
                            processed_at = now(),
                            error = $4,
                            instance_id = NULL,
                            lease_expiry = NULL
                        WHERE stream_id = $1 AND perspective_name = $2
                        "#,
                    )
                    .bind(&outcome.stream_id)
                    .bind(&outcome.perspective_name)
                    .bind(status)
                    .bind(&outcome.error)
                    .execute(&mut **tx)
                    .await.store_err()?;
                }
            }
        }
        Ok(())
    }

    async fn renew_leases(
        tx: &mut PgTx<'_>,
        table: &str,
        ids: &[MessageId],
        holder: InstanceId,
        lease_seconds: u32,
        acked: &mut usize,
    ) -> Result<(), WorkStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let result = sqlx::query(&format!(
            r#"
            UPDATE wb.{table}
            SET lease_expiry = now() + make_interval(secs => $3)
            WHERE message_id = ANY($1) AND instance_id = $2
            "#
        ))
        .bind(&uuids)
        .bind(holder.as_uuid())
        .bind(lease_seconds as f64)
        .execute(&mut **tx)
        .await.store_err()?;
        *acked += result.rows_affected() as usize;
        Ok(())
    }

    async fn insert_messages(
        tx: &mut PgTx<'_>,
        table: &str,
        messages: &[WorkMessage],
        acked: &mut usize,
    ) -> Result<(), WorkStoreError> {
        for message in messages {
            *acked += 1;
            let metadata = serde_json::to_value(&message.metadata)
                .map_err(|e| WorkStoreError::Serialization {
                    message: e.to_string(),
                })?;
            let scope = message
                .scope
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| WorkStoreError::Serialization {
                    message: e.to_string(),
                })?;
            sqlx::query(&format!(
                r#"
                INSERT INTO wb.{table} (
                    message_id, destination, message_type, payload, metadata, scope,
                    status, attempts, error, created_at, stream_id, partition_number,
                    failure_reason, scheduled_for
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, NULL, $8, $9, $10, $11, $12)
                ON CONFLICT (message_id) DO NOTHING
                "#
            ))
            .bind(message.message_id.as_uuid())
            .bind(&message.destination)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(metadata)
            .bind(scope)
            .bind((message.status | StatusFlags::STORED).bits() as i32)
            .bind(message.created_at)
            .bind(&message.stream_id)
            .bind(message.partition_number as i32)
            .bind(message.failure_reason.as_str())
            .bind(message.scheduled_for)
            .execute(&mut **tx)
            .await.store_err()?;
        }
        Ok(())
    }

    async fn append_events(
        tx: &mut PgTx<'_>,
        events: &[EventRecord],
        partition_count: u32,
        acked: &mut usize,
    ) -> Result<(), WorkStoreError> {
        for event in events {
            *acked += 1;
            let metadata = serde_json::to_value(&event.metadata)
                .map_err(|e| WorkStoreError::Serialization {
                    message: e.to_string(),
                })?;
            let scope = event
                .scope
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| WorkStoreError::Serialization {
                    message: e.to_string(),
                })?;
            let insert = sqlx::query(
                r#"
                INSERT INTO wb.events (
                    event_id, stream_id, aggregate_id, aggregate_type, version,
                    event_type, event_data, metadata, scope, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.stream_id)
            .bind(event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(event.version as i64)
            .bind(&event.event_type)
            .bind(&event.event_data)
            .bind(metadata)
            .bind(scope)
            .bind(event.created_at)
            .execute(&mut **tx)
            .await;

            match insert {
                Ok(_) => {}
                Err(e) => {
                    let unique = e
                        .as_database_error()
                        .map(|db| db.is_unique_violation())
                        .unwrap_or(false);
                    if unique {
                        debug!(
                            stream_id = %event.stream_id,
                            version = event.version,
                            "Optimistic concurrency conflict on append"
                        );
                        return Err(WorkStoreError::Conflict {
                            stream_id: event.stream_id.clone(),
                            version: event.version,
                        });
                    }
                    return Err(WorkStoreError::Connection {
                        message: e.to_string(),
                    });
                }
            }

            // Materialize a checkpoint per perspective association; a new
            // event also re-pends an existing checkpoint.
            sqlx::query(
                r#"
                INSERT INTO wb.perspective_checkpoints (stream_id, perspective_name, status, partition_number)
                SELECT $1, a.target_name, 'pending', $2
                FROM wb.message_associations a
                WHERE a.message_type = $3 AND a.association_kind = 'perspective'
                ON CONFLICT (stream_id, perspective_name)
                DO UPDATE SET status = 'pending'
                "#,
            )
            .bind(&event.stream_id)
            .bind(wb_domain::partition::partition_for_stream(&event.stream_id, partition_count) as i32)
            .bind(&event.event_type)
            .execute(&mut **tx)
            .await.store_err()?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn claim_messages(
        tx: &mut PgTx<'_>,
        table: &str,
        done: StatusFlags,
        instance_id: InstanceId,
        instance_index: usize,
        instance_count: usize,
        lease_seconds: u32,
        batch_size: usize,
        receptor_split: Option<(&str, bool)>,
    ) -> Result<Vec<WorkMessage>, WorkStoreError> {
        // Split inbox claims into rows with/without a receptor association
        // for the calling service.
        let association_clause = match receptor_split {
            Some((_, true)) => {
                r#"AND EXISTS (
                    SELECT 1 FROM wb.message_associations a
                    WHERE a.message_type = c.message_type
                      AND a.association_kind = 'receptor'
                      AND a.service_name = $7
                )"#
            }
            Some((_, false)) => {
                r#"AND NOT EXISTS (
                    SELECT 1 FROM wb.message_associations a
                    WHERE a.message_type = c.message_type
                      AND a.association_kind = 'receptor'
                      AND a.service_name = $7
                )"#
            }
            None => "",
        };

        let sql = format!(
            r#"
            UPDATE wb.{table} SET
                instance_id = $1,
                lease_expiry = now() + make_interval(secs => $2)
            WHERE message_id IN (
                SELECT c.message_id FROM wb.{table} c
                WHERE c.status & $3 = 0
                  AND c.status & 24 = 0
                  AND (c.instance_id IS NULL OR c.instance_id = $1 OR c.lease_expiry IS NULL OR c.lease_expiry < now())
                  AND (c.scheduled_for IS NULL OR c.scheduled_for <= now())
                  AND c.partition_number % $4 = $5
                  {association_clause}
                ORDER BY c.message_id
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(instance_id.as_uuid())
            .bind(lease_seconds as f64)
            .bind(done.bits() as i32)
            .bind(instance_count as i32)
            .bind(instance_index as i32)
            .bind(batch_size as i64);
        if let Some((service_name, _)) = receptor_split {
            query = query.bind(service_name);
        }

        let rows = query.fetch_all(&mut **tx).await.store_err()?;
        rows.iter().map(row_to_message).collect()
    }

    async fn claim_checkpoints(
        tx: &mut PgTx<'_>,
        instance_id: InstanceId,
        instance_index: usize,
        instance_count: usize,
        lease_seconds: u32,
        batch_size: usize,
    ) -> Result<Vec<PerspectiveCheckpoint>, WorkStoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE wb.perspective_checkpoints SET
                instance_id = $1,
                lease_expiry = now() + make_interval(secs => $2)
            WHERE (stream_id, perspective_name) IN (
                SELECT stream_id, perspective_name FROM wb.perspective_checkpoints
                WHERE status = 'pending'
                  AND (instance_id IS NULL OR lease_expiry IS NULL OR lease_expiry < now())
                  AND partition_number % $3 = $4
                ORDER BY stream_id, perspective_name
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(instance_id.as_uuid())
        .bind(lease_seconds as f64)
        .bind(instance_count as i32)
        .bind(instance_index as i32)
        .bind(batch_size as i64)
        .fetch_all(&mut **tx)
        .await.store_err()?;
        rows.iter().map(row_to_checkpoint).collect()
    }
}

impl WorkStore for PostgresWorkStore {
    #[instrument(skip(self, request), fields(instance_id = %request.instance.instance_id))]
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
    ) -> Result<WorkBatch, WorkStoreError> {
        let control = request.control;
        let caller = request.instance.instance_id;
        let mut acknowledged = AckCounts::default();

        let mut tx = self.pool.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            WorkStoreError::Connection { message: e.to_string() }
        })?;

        // 1-2. Heartbeat and stale-instance GC.
        Self::heartbeat(&mut tx, &request).await?;

        // 3. Outcomes before claims.
        Self::apply_completions(
            &mut tx,
            "outbox",
            &request.outbox_completions,
            StatusFlags::PUBLISHED,
            control.debug_mode,
            &mut acknowledged.completions,
        )
        .await?;
        Self::apply_completions(
            &mut tx,
            "inbox",
            &request.inbox_completions,
            StatusFlags::PROCESSED,
            control.debug_mode,
            &mut acknowledged.completions,
        )
        .await?;
        Self::apply_completions(
            &mut tx,
            "inbox",
            &request.receptor_completions,
            StatusFlags::PROCESSED,
            control.debug_mode,
            &mut acknowledged.completions,
        )
        .await?;
        Self::apply_failures(
            &mut tx,
            "outbox",
            &request.outbox_failures,
            control.max_attempts,
            &mut acknowledged.failures,
        )
        .await?;
        Self::apply_failures(
            &mut tx,
            "inbox",
            &request.inbox_failures,
            control.max_attempts,
            &mut acknowledged.failures,
        )
        .await?;
        Self::apply_checkpoint_outcomes(
            &mut tx,
            &request.perspective_outcomes,
            &mut acknowledged.completions,
        )
        .await?;

        // 4. Lease renewals for deferred work.
        Self::renew_leases(
            &mut tx,
            "outbox",
            &request.renew_outbox_leases,
            caller,
            control.lease_seconds,
            &mut acknowledged.renewals,
        )
        .await?;
        Self::renew_leases(
            &mut tx,
            "inbox",
            &request.renew_inbox_leases,
            caller,
            control.lease_seconds,
            &mut acknowledged.renewals,
        )
        .await?;

        // 5-6. New work and event appends with checkpoint materialization.
        Self::insert_messages(
            &mut tx,
            "outbox",
            &request.new_outbox,
            &mut acknowledged.new_messages,
        )
        .await?;
        Self::insert_messages(
            &mut tx,
            "inbox",
            &request.new_inbox,
            &mut acknowledged.new_messages,
        )
        .await?;
        Self::append_events(
            &mut tx,
            &request.new_events,
            control.partition_count,
            &mut acknowledged.new_events,
        )
        .await?;

        // 7. Partition assignment from the live instance set.
        let live: Vec<Uuid> =
            sqlx::query_scalar("SELECT instance_id FROM wb.service_instances ORDER BY instance_id")
                .fetch_all(&mut *tx)
                .await.store_err()?;
        let instance_count = live.len();
        let instance_index = live
            .iter()
            .position(|id| *id == caller.as_uuid())
            .ok_or_else(|| WorkStoreError::Misconfigured {
                message: "caller heartbeat row missing after upsert".to_string(),
            })?;

        let outbox = Self::claim_messages(
            &mut tx,
            "outbox",
            StatusFlags::PUBLISHED,
            caller,
            instance_index,
            instance_count,
            control.lease_seconds,
            control.batch_size,
            None,
        )
        .await?;
        let service_name = request.instance.service_name.as_str();
        let receptors = Self::claim_messages(
            &mut tx,
            "inbox",
            StatusFlags::PROCESSED,
            caller,
            instance_index,
            instance_count,
            control.lease_seconds,
            control.batch_size,
            Some((service_name, true)),
        )
        .await?;
        let inbox = Self::claim_messages(
            &mut tx,
            "inbox",
            StatusFlags::PROCESSED,
            caller,
            instance_index,
            instance_count,
            control.lease_seconds,
            control.batch_size,
            Some((service_name, false)),
        )
        .await?;
        let perspectives = Self::claim_checkpoints(
            &mut tx,
            caller,
            instance_index,
            instance_count,
            control.lease_seconds,
            control.batch_size,
        )
        .await?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit work batch");
            WorkStoreError::Connection { message: e.to_string() }
        })?;

        debug!(
            outbox = outbox.len(),
            inbox = inbox.len(),
            receptors = receptors.len(),
            perspectives = perspectives.len(),
            "Work batch exchanged"
        );

        Ok(WorkBatch {
            outbox,
            inbox,
            receptors,
            perspectives,
            acknowledged,
        })
    }

    #[instrument(skip(self), fields(stream_id = %stream_id))]
    async fn read_events(
        &self,
        stream_id: &str,
        after: Option<EventId>,
        limit: usize,
    ) -> Result<Vec<EventRecord>, WorkStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM wb.events
            WHERE stream_id = $1
              AND ($2::uuid IS NULL OR event_id > $2)
            ORDER BY version ASC
            LIMIT $3
            "#,
        )
        .bind(stream_id)
        .bind(after.map(|id| id.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await.store_err()?;
        rows.iter().map(row_to_event).collect()
    }

    async fn load_model(
        &self,
        perspective_name: &str,
        stream_id: &str,
    ) -> Result<Option<serde_json::Value>, WorkStoreError> {
        let model: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT model FROM wb.perspective_models WHERE perspective_name = $1 AND stream_id = $2",
        )
        .bind(perspective_name)
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await.store_err()?;
        Ok(model)
    }

    async fn save_model(
        &self,
        perspective_name: &str,
        stream_id: &str,
        model: &serde_json::Value,
    ) -> Result<(), WorkStoreError> {
        sqlx::query(
            r#"
            INSERT INTO wb.perspective_models (perspective_name, stream_id, model, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (perspective_name, stream_id)
            DO UPDATE SET model = EXCLUDED.model, updated_at = now()
            "#,
        )
        .bind(perspective_name)
        .bind(stream_id)
        .bind(model)
        .execute(&self.pool)
        .await.store_err()?;
        Ok(())
    }

    async fn record_dedup(&self, message_id: MessageId) -> Result<bool, WorkStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO wb.message_deduplication (message_id, first_seen_at)
            VALUES ($1, now())
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await.store_err()?;
        Ok(result.rows_affected() == 1)
    }

    async fn register_association(
        &self,
        association: MessageAssociation,
    ) -> Result<(), WorkStoreError> {
        let kind = match association.kind {
            wb_domain::AssociationKind::Receptor => "receptor",
            wb_domain::AssociationKind::Perspective => "perspective",
        };
        sqlx::query(
            r#"
            INSERT INTO wb.message_associations (message_type, association_kind, target_name, service_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&association.message_type)
        .bind(kind)
        .bind(&association.target_name)
        .bind(&association.service_name)
        .execute(&self.pool)
        .await.store_err()?;
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

// ============================================================================
// Row Decoding
// ============================================================================

fn decode_metadata(value: serde_json::Value) -> BTreeMap<String, String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn row_to_message(row: &PgRow) -> Result<WorkMessage, WorkStoreError> {
    let map_err = |e: sqlx::Error| WorkStoreError::Serialization {
        message: e.to_string(),
    };
    let scope: Option<serde_json::Value> = row.try_get("scope").map_err(map_err)?;
    Ok(WorkMessage {
        message_id: MessageId::from_uuid(row.try_get("message_id").map_err(map_err)?),
        destination: row.try_get("destination").map_err(map_err)?,
        message_type: row.try_get("message_type").map_err(map_err)?,
        payload: row.try_get("payload").map_err(map_err)?,
        metadata: decode_metadata(row.try_get("metadata").map_err(map_err)?),
        scope: scope.and_then(|s| serde_json::from_value(s).ok()),
        status: StatusFlags::from_bits(row.try_get::<i32, _>("status").map_err(map_err)? as u32),
        attempts: row.try_get::<i32, _>("attempts").map_err(map_err)? as u32,
        error: row.try_get("error").map_err(map_err)?,
        created_at: row.try_get("created_at").map_err(map_err)?,
        published_at: row.try_get("published_at").map_err(map_err)?,
        processed_at: row.try_get("processed_at").map_err(map_err)?,
        instance_id: row
            .try_get::<Option<Uuid>, _>("instance_id")
            .map_err(map_err)?
            .map(InstanceId::from_uuid),
        lease_expiry: row.try_get("lease_expiry").map_err(map_err)?,
        stream_id: row.try_get("stream_id").map_err(map_err)?,
        partition_number: row.try_get::<i32, _>("partition_number").map_err(map_err)? as u32,
        failure_reason: FailureReason::from_str_lossy(
            row.try_get::<String, _>("failure_reason").map_err(map_err)?.as_str(),
        ),
        scheduled_for: row.try_get("scheduled_for").map_err(map_err)?,
    })
}

fn row_to_checkpoint(row: &PgRow) -> Result<PerspectiveCheckpoint, WorkStoreError> {
    let map_err = |e: sqlx::Error| WorkStoreError::Serialization {
        message: e.to_string(),
    };
    let status = match row.try_get::<String, _>("status").map_err(map_err)?.as_str() {
        "up_to_date" => CheckpointStatus::UpToDate,
        "faulted" => CheckpointStatus::Faulted,
        _ => CheckpointStatus::Pending,
    };
    Ok(PerspectiveCheckpoint {
        stream_id: row.try_get("stream_id").map_err(map_err)?,
        perspective_name: row.try_get("perspective_name").map_err(map_err)?,
        last_event_id: row
            .try_get::<Option<Uuid>, _>("last_event_id")
            .map_err(map_err)?
            .map(EventId::from_uuid),
        status,
        processed_at: row.try_get("processed_at").map_err(map_err)?,
        error: row.try_get("error").map_err(map_err)?,
        instance_id: row
            .try_get::<Option<Uuid>, _>("instance_id")
            .map_err(map_err)?
            .map(InstanceId::from_uuid),
        lease_expiry: row.try_get("lease_expiry").map_err(map_err)?,
        partition_number: row.try_get::<i32, _>("partition_number").map_err(map_err)? as u32,
    })
}

fn row_to_event(row: &PgRow) -> Result<EventRecord, WorkStoreError> {
    let map_err = |e: sqlx::Error| WorkStoreError::Serialization {
        message: e.to_string(),
    };
    let scope: Option<serde_json::Value> = row.try_get("scope").map_err(map_err)?;
    Ok(EventRecord {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(map_err)?),
        stream_id: row.try_get("stream_id").map_err(map_err)?,
        aggregate_id: row.try_get("aggregate_id").map_err(map_err)?,
        aggregate_type: row.try_get("aggregate_type").map_err(map_err)?,
        version: row.try_get::<i64, _>("version").map_err(map_err)? as u64,
        event_type: row.try_get("event_type").map_err(map_err)?,
        event_data: row.try_get("event_data").map_err(map_err)?,
        metadata: decode_metadata(row.try_get("metadata").map_err(map_err)?),
        scope: scope.and_then(|s| serde_json::from_value(s).ok()),
        created_at: row.try_get("created_at").map_err(map_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_db_round_trip() {
        for reason in [
            FailureReason::None,
            FailureReason::TransportException,
            FailureReason::PermanentReject,
        ] {
            assert_eq!(FailureReason::from_str_lossy(reason.as_str()), reason);
        }
    }

    #[test]
    fn test_status_bits_match_sql_masks() {
        // The SQL uses literal masks: published = 2, processed = 4, and
        // terminal = 24. Keep them in lockstep with the domain flags.
        assert_eq!(StatusFlags::PUBLISHED.bits(), 2);
        assert_eq!(StatusFlags::PROCESSED.bits(), 4);
        assert_eq!(
            (StatusFlags::FAILED | StatusFlags::DEAD_LETTERED).bits(),
            24
        );
    }
}
