use crate::error::CivicError;
use crate::reports::ReportStore;
use crate::types::{Milestone, Priority, WorkOrder, WorkOrderStatus};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Persistence backend configuration shared by the work-order and report
/// stores.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Keep all rows in process memory only.
    Memory,
    /// Persist rows in PostgreSQL; schema is created on bootstrap.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Bundled stores sharing one backend (and, for PostgreSQL, one pool).
#[derive(Clone)]
pub struct Storage {
    pub work_orders: WorkOrderStore,
    pub reports: ReportStore,
    label: &'static str,
}

impl Storage {
    pub async fn bootstrap(config: StorageConfig) -> Result<Self, CivicError> {
        let label = config.label();
        match config {
            StorageConfig::Memory => Ok(Self {
                work_orders: WorkOrderStore::memory(),
                reports: ReportStore::memory(),
                label,
            }),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .connect(&database_url)
                    .await
                    .map_err(|e| CivicError::store(format!("postgres connect failed: {e}")))?;

                let work_orders = WorkOrderStore::postgres(pool.clone());
                work_orders.ensure_schema().await?;
                let reports = ReportStore::postgres(pool);
                reports.ensure_schema().await?;

                Ok(Self {
                    work_orders,
                    reports,
                    label,
                })
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.label
    }
}

#[derive(Clone)]
enum WorkOrderBackend {
    Memory(Arc<Mutex<HashMap<Uuid, WorkOrder>>>),
    Postgres(PgPool),
}

/// Durable work-order store.
///
/// One row per order with the ordered milestone array embedded as JSONB, so
/// the whole roadmap is read and written atomically without a join. Every
/// milestone/status write is guarded by a compare-and-swap on `revision`;
/// a stale write yields `RevisionConflict` instead of silently overwriting a
/// concurrent transition on a sibling index.
#[derive(Clone)]
pub struct WorkOrderStore {
    backend: WorkOrderBackend,
}

impl WorkOrderStore {
    pub fn memory() -> Self {
        Self {
            backend: WorkOrderBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: WorkOrderBackend::Postgres(pool),
        }
    }

    pub(crate) async fn ensure_schema(&self) -> Result<(), CivicError> {
        let WorkOrderBackend::Postgres(pool) = &self.backend else {
            return Ok(());
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS work_orders (
                id UUID PRIMARY KEY,
                report_id UUID NOT NULL,
                contractor_id TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                estimated_cost_minor BIGINT NOT NULL,
                deadline DATE NULL,
                admin_notes TEXT NOT NULL,
                milestones JSONB NOT NULL,
                escrow_intent_id TEXT NULL,
                escrow_id TEXT NULL,
                completed_at TIMESTAMPTZ NULL,
                created_at TIMESTAMPTZ NOT NULL,
                revision BIGINT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| CivicError::store(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_work_orders_contractor \
             ON work_orders (contractor_id, created_at DESC)",
        )
        .execute(pool)
        .await
        .map_err(|e| CivicError::store(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    /// Single atomic insert; captures whatever escrow ids exist at insert
    /// time.
    pub async fn create(&self, order: WorkOrder) -> Result<WorkOrder, CivicError> {
        match &self.backend {
            WorkOrderBackend::Memory(rows) => {
                let mut rows = rows.lock().await;
                if rows.contains_key(&order.id) {
                    return Err(CivicError::store(format!(
                        "work order '{}' already exists",
                        order.id
                    )));
                }
                rows.insert(order.id, order.clone());
                Ok(order)
            }
            WorkOrderBackend::Postgres(pool) => {
                let milestones = milestones_to_json(&order.milestones)?;
                sqlx::query(
                    r#"
                    INSERT INTO work_orders (
                        id, report_id, contractor_id, status, priority,
                        estimated_cost_minor, deadline, admin_notes, milestones,
                        escrow_intent_id, escrow_id, completed_at, created_at, revision
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(order.id)
                .bind(order.report_id)
                .bind(&order.contractor_id)
                .bind(status_to_str(order.status))
                .bind(priority_to_str(order.priority))
                .bind(order.estimated_cost_minor as i64)
                .bind(order.deadline)
                .bind(&order.admin_notes)
                .bind(&milestones)
                .bind(&order.escrow_intent_id)
                .bind(&order.escrow_id)
                .bind(order.completed_at)
                .bind(order.created_at)
                .bind(order.revision as i64)
                .execute(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres insert failed: {e}")))?;

                Ok(order)
            }
        }
    }

    pub async fn get(&self, order_id: Uuid) -> Result<WorkOrder, CivicError> {
        match &self.backend {
            WorkOrderBackend::Memory(rows) => rows
                .lock()
                .await
                .get(&order_id)
                .cloned()
                .ok_or(CivicError::OrderNotFound(order_id)),
            WorkOrderBackend::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM work_orders WHERE id = $1")
                    .bind(order_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| CivicError::store(format!("postgres select failed: {e}")))?
                    .ok_or(CivicError::OrderNotFound(order_id))?;

                decode_order(&row)
            }
        }
    }

    /// Replace the milestone array under a revision compare-and-swap.
    ///
    /// The array shape is immutable after creation: a write that changes the
    /// milestone count is rejected outright.
    pub async fn update_milestones(
        &self,
        order_id: Uuid,
        milestones: Vec<Milestone>,
        expected_revision: u64,
    ) -> Result<WorkOrder, CivicError> {
        self.write_milestones(order_id, milestones, None, expected_revision)
            .await
    }

    /// Milestone replace plus aggregate status change in one atomic write.
    pub async fn update_milestones_and_status(
        &self,
        order_id: Uuid,
        milestones: Vec<Milestone>,
        status: WorkOrderStatus,
        completed_at: Option<DateTime<Utc>>,
        expected_revision: u64,
    ) -> Result<WorkOrder, CivicError> {
        self.write_milestones(
            order_id,
            milestones,
            Some((status, completed_at)),
            expected_revision,
        )
        .await
    }

    async fn write_milestones(
        &self,
        order_id: Uuid,
        milestones: Vec<Milestone>,
        status_change: Option<(WorkOrderStatus, Option<DateTime<Utc>>)>,
        expected_revision: u64,
    ) -> Result<WorkOrder, CivicError> {
        match &self.backend {
            WorkOrderBackend::Memory(rows) => {
                let mut rows = rows.lock().await;
                let order = rows
                    .get_mut(&order_id)
                    .ok_or(CivicError::OrderNotFound(order_id))?;

                if order.milestones.len() != milestones.len() {
                    return Err(CivicError::MilestoneShapeChanged(order_id));
                }
                if order.revision != expected_revision {
                    return Err(CivicError::RevisionConflict(order_id));
                }

                order.milestones = milestones;
                if let Some((status, completed_at)) = status_change {
                    order.status = status;
                    order.completed_at = completed_at;
                }
                order.revision += 1;
                Ok(order.clone())
            }
            WorkOrderBackend::Postgres(pool) => {
                let current = self.get(order_id).await?;
                if current.milestones.len() != milestones.len() {
                    return Err(CivicError::MilestoneShapeChanged(order_id));
                }

                let (status, completed_at) = match status_change {
                    Some((status, completed_at)) => (status, completed_at),
                    None => (current.status, current.completed_at),
                };
                let milestones_json = milestones_to_json(&milestones)?;

                let result = sqlx::query(
                    r#"
                    UPDATE work_orders
                    SET milestones = $3, status = $4, completed_at = $5,
                        revision = revision + 1
                    WHERE id = $1 AND revision = $2
                    "#,
                )
                .bind(order_id)
                .bind(expected_revision as i64)
                .bind(&milestones_json)
                .bind(status_to_str(status))
                .bind(completed_at)
                .execute(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres update failed: {e}")))?;

                if result.rows_affected() == 0 {
                    return Err(CivicError::RevisionConflict(order_id));
                }

                self.get(order_id).await
            }
        }
    }

    pub async fn update_status(
        &self,
        order_id: Uuid,
        status: WorkOrderStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), CivicError> {
        match &self.backend {
            WorkOrderBackend::Memory(rows) => {
                let mut rows = rows.lock().await;
                let order = rows
                    .get_mut(&order_id)
                    .ok_or(CivicError::OrderNotFound(order_id))?;
                order.status = status;
                order.completed_at = completed_at;
                order.revision += 1;
                Ok(())
            }
            WorkOrderBackend::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE work_orders SET status = $2, completed_at = $3, \
                     revision = revision + 1 WHERE id = $1",
                )
                .bind(order_id)
                .bind(status_to_str(status))
                .bind(completed_at)
                .execute(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres update failed: {e}")))?;

                if result.rows_affected() == 0 {
                    return Err(CivicError::OrderNotFound(order_id));
                }
                Ok(())
            }
        }
    }

    /// Attach the escrow intent ids. Set at most once per order; a second
    /// attempt is a correctness bug surfaced as `IntentAlreadyExists`.
    pub async fn set_intent(
        &self,
        order_id: Uuid,
        intent_id: &str,
        escrow_id: Option<&str>,
    ) -> Result<(), CivicError> {
        match &self.backend {
            WorkOrderBackend::Memory(rows) => {
                let mut rows = rows.lock().await;
                let order = rows
                    .get_mut(&order_id)
                    .ok_or(CivicError::OrderNotFound(order_id))?;
                if order.escrow_intent_id.is_some() {
                    return Err(CivicError::IntentAlreadyExists(order_id));
                }
                order.escrow_intent_id = Some(intent_id.to_string());
                order.escrow_id = escrow_id.map(str::to_string);
                order.revision += 1;
                Ok(())
            }
            WorkOrderBackend::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE work_orders SET escrow_intent_id = $2, escrow_id = $3, \
                     revision = revision + 1 \
                     WHERE id = $1 AND escrow_intent_id IS NULL",
                )
                .bind(order_id)
                .bind(intent_id)
                .bind(escrow_id)
                .execute(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres update failed: {e}")))?;

                if result.rows_affected() == 0 {
                    // Distinguish a missing row from an already-set intent.
                    return match self.get(order_id).await {
                        Ok(_) => Err(CivicError::IntentAlreadyExists(order_id)),
                        Err(err) => Err(err),
                    };
                }
                Ok(())
            }
        }
    }

    /// Orders for one contractor, newest first.
    pub async fn list_by_contractor(
        &self,
        contractor_id: &str,
    ) -> Result<Vec<WorkOrder>, CivicError> {
        match &self.backend {
            WorkOrderBackend::Memory(rows) => {
                let rows = rows.lock().await;
                let mut orders: Vec<WorkOrder> = rows
                    .values()
                    .filter(|order| order.contractor_id == contractor_id)
                    .cloned()
                    .collect();
                orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(orders)
            }
            WorkOrderBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT * FROM work_orders WHERE contractor_id = $1 \
                     ORDER BY created_at DESC",
                )
                .bind(contractor_id)
                .fetch_all(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres select failed: {e}")))?;

                rows.iter().map(decode_order).collect()
            }
        }
    }
}

fn milestones_to_json(milestones: &[Milestone]) -> Result<serde_json::Value, CivicError> {
    serde_json::to_value(milestones).map_err(|e| CivicError::Serialization(e.to_string()))
}

fn status_to_str(status: WorkOrderStatus) -> &'static str {
    status.name()
}

fn parse_status(value: &str) -> Result<WorkOrderStatus, CivicError> {
    match value {
        "assigned" => Ok(WorkOrderStatus::Assigned),
        "completed" => Ok(WorkOrderStatus::Completed),
        other => Err(CivicError::store(format!(
            "unknown work order status '{other}' in storage"
        ))),
    }
}

fn priority_to_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "Low",
        Priority::Medium => "Medium",
        Priority::High => "High",
    }
}

fn parse_priority(value: &str) -> Result<Priority, CivicError> {
    match value {
        "Low" => Ok(Priority::Low),
        "Medium" => Ok(Priority::Medium),
        "High" => Ok(Priority::High),
        other => Err(CivicError::store(format!(
            "unknown priority '{other}' in storage"
        ))),
    }
}

fn decode_order(row: &sqlx::postgres::PgRow) -> Result<WorkOrder, CivicError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CivicError::store(format!("postgres decode status failed: {e}")))?;
    let priority: String = row
        .try_get("priority")
        .map_err(|e| CivicError::store(format!("postgres decode priority failed: {e}")))?;
    let estimated_cost_minor: i64 = row
        .try_get("estimated_cost_minor")
        .map_err(|e| CivicError::store(format!("postgres decode estimated_cost failed: {e}")))?;
    let revision: i64 = row
        .try_get("revision")
        .map_err(|e| CivicError::store(format!("postgres decode revision failed: {e}")))?;
    let milestones_json: serde_json::Value = row
        .try_get("milestones")
        .map_err(|e| CivicError::store(format!("postgres decode milestones failed: {e}")))?;
    let milestones: Vec<Milestone> = serde_json::from_value(milestones_json)
        .map_err(|e| CivicError::Serialization(format!("milestone decode failed: {e}")))?;

    Ok(WorkOrder {
        id: row
            .try_get("id")
            .map_err(|e| CivicError::store(format!("postgres decode id failed: {e}")))?,
        report_id: row
            .try_get("report_id")
            .map_err(|e| CivicError::store(format!("postgres decode report_id failed: {e}")))?,
        contractor_id: row
            .try_get("contractor_id")
            .map_err(|e| CivicError::store(format!("postgres decode contractor_id failed: {e}")))?,
        status: parse_status(&status)?,
        priority: parse_priority(&priority)?,
        estimated_cost_minor: estimated_cost_minor
            .try_into()
            .map_err(|_| CivicError::store("negative estimated cost in storage".to_string()))?,
        deadline: row
            .try_get("deadline")
            .map_err(|e| CivicError::store(format!("postgres decode deadline failed: {e}")))?,
        admin_notes: row
            .try_get("admin_notes")
            .map_err(|e| CivicError::store(format!("postgres decode admin_notes failed: {e}")))?,
        milestones,
        escrow_intent_id: row.try_get("escrow_intent_id").map_err(|e| {
            CivicError::store(format!("postgres decode escrow_intent_id failed: {e}"))
        })?,
        escrow_id: row
            .try_get("escrow_id")
            .map_err(|e| CivicError::store(format!("postgres decode escrow_id failed: {e}")))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(|e| CivicError::store(format!("postgres decode completed_at failed: {e}")))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CivicError::store(format!("postgres decode created_at failed: {e}")))?,
        revision: revision
            .try_into()
            .map_err(|_| CivicError::store("negative revision in storage".to_string()))?,
    })
}
