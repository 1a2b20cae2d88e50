//! Citizen report store and the status lifecycle the orchestrator bridges
//! into when a work order is created.

use crate::error::CivicError;
use crate::types::{Report, ReportStatus};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone)]
enum ReportBackend {
    Memory(Arc<Mutex<HashMap<Uuid, Report>>>),
    Postgres(PgPool),
}

#[derive(Clone)]
pub struct ReportStore {
    backend: ReportBackend,
}

impl ReportStore {
    pub fn memory() -> Self {
        Self {
            backend: ReportBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: ReportBackend::Postgres(pool),
        }
    }

    pub(crate) async fn ensure_schema(&self) -> Result<(), CivicError> {
        let ReportBackend::Postgres(pool) = &self.backend else {
            return Ok(());
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id UUID PRIMARY KEY,
                user_id TEXT NULL,
                category TEXT NOT NULL,
                description TEXT NOT NULL,
                latitude DOUBLE PRECISION NOT NULL,
                longitude DOUBLE PRECISION NOT NULL,
                image_url TEXT NULL,
                status TEXT NOT NULL,
                risk_score SMALLINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| CivicError::store(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reports_user ON reports (user_id, created_at DESC)",
        )
        .execute(pool)
        .await
        .map_err(|e| CivicError::store(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    pub async fn create(&self, report: Report) -> Result<Report, CivicError> {
        match &self.backend {
            ReportBackend::Memory(rows) => {
                rows.lock().await.insert(report.id, report.clone());
                Ok(report)
            }
            ReportBackend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO reports (
                        id, user_id, category, description, latitude, longitude,
                        image_url, status, risk_score, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(report.id)
                .bind(&report.user_id)
                .bind(&report.category)
                .bind(&report.description)
                .bind(report.latitude)
                .bind(report.longitude)
                .bind(&report.image_url)
                .bind(report.status.name())
                .bind(report.risk_score as i16)
                .bind(report.created_at)
                .execute(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres insert failed: {e}")))?;

                Ok(report)
            }
        }
    }

    pub async fn get(&self, report_id: Uuid) -> Result<Report, CivicError> {
        match &self.backend {
            ReportBackend::Memory(rows) => rows
                .lock()
                .await
                .get(&report_id)
                .cloned()
                .ok_or(CivicError::ReportNotFound(report_id)),
            ReportBackend::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM reports WHERE id = $1")
                    .bind(report_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| CivicError::store(format!("postgres select failed: {e}")))?
                    .ok_or(CivicError::ReportNotFound(report_id))?;

                decode_report(&row)
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<Report>, CivicError> {
        match &self.backend {
            ReportBackend::Memory(rows) => {
                let rows = rows.lock().await;
                let mut reports: Vec<Report> = rows.values().cloned().collect();
                reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(reports)
            }
            ReportBackend::Postgres(pool) => {
                let rows = sqlx::query("SELECT * FROM reports ORDER BY created_at DESC")
                    .fetch_all(pool)
                    .await
                    .map_err(|e| CivicError::store(format!("postgres select failed: {e}")))?;

                rows.iter().map(decode_report).collect()
            }
        }
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Report>, CivicError> {
        match &self.backend {
            ReportBackend::Memory(rows) => {
                let rows = rows.lock().await;
                let mut reports: Vec<Report> = rows
                    .values()
                    .filter(|report| report.user_id.as_deref() == Some(user_id))
                    .cloned()
                    .collect();
                reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(reports)
            }
            ReportBackend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT * FROM reports WHERE user_id = $1 ORDER BY created_at DESC",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .map_err(|e| CivicError::store(format!("postgres select failed: {e}")))?;

                rows.iter().map(decode_report).collect()
            }
        }
    }

    /// Move a report forward in its lifecycle. Writing the current status
    /// again is a no-op so repeat assignments against one report stay quiet.
    pub async fn update_status(
        &self,
        report_id: Uuid,
        status: ReportStatus,
    ) -> Result<Report, CivicError> {
        let current = self.get(report_id).await?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(CivicError::InvalidStatusTransition {
                from: current.status,
                to: status,
            });
        }

        match &self.backend {
            ReportBackend::Memory(rows) => {
                let mut rows = rows.lock().await;
                let report = rows
                    .get_mut(&report_id)
                    .ok_or(CivicError::ReportNotFound(report_id))?;
                report.status = status;
                Ok(report.clone())
            }
            ReportBackend::Postgres(pool) => {
                let result = sqlx::query("UPDATE reports SET status = $2 WHERE id = $1")
                    .bind(report_id)
                    .bind(status.name())
                    .execute(pool)
                    .await
                    .map_err(|e| CivicError::store(format!("postgres update failed: {e}")))?;

                if result.rows_affected() == 0 {
                    return Err(CivicError::ReportNotFound(report_id));
                }
                self.get(report_id).await
            }
        }
    }
}

fn parse_report_status(value: &str) -> Result<ReportStatus, CivicError> {
    match value {
        "PENDING" => Ok(ReportStatus::Pending),
        "IN_PROGRESS" => Ok(ReportStatus::InProgress),
        "RESOLVED" => Ok(ReportStatus::Resolved),
        other => Err(CivicError::store(format!(
            "unknown report status '{other}' in storage"
        ))),
    }
}

fn decode_report(row: &sqlx::postgres::PgRow) -> Result<Report, CivicError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CivicError::store(format!("postgres decode status failed: {e}")))?;
    let risk_score: i16 = row
        .try_get("risk_score")
        .map_err(|e| CivicError::store(format!("postgres decode risk_score failed: {e}")))?;

    Ok(Report {
        id: row
            .try_get("id")
            .map_err(|e| CivicError::store(format!("postgres decode id failed: {e}")))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CivicError::store(format!("postgres decode user_id failed: {e}")))?,
        category: row
            .try_get("category")
            .map_err(|e| CivicError::store(format!("postgres decode category failed: {e}")))?,
        description: row
            .try_get("description")
            .map_err(|e| CivicError::store(format!("postgres decode description failed: {e}")))?,
        latitude: row
            .try_get("latitude")
            .map_err(|e| CivicError::store(format!("postgres decode latitude failed: {e}")))?,
        longitude: row
            .try_get("longitude")
            .map_err(|e| CivicError::store(format!("postgres decode longitude failed: {e}")))?,
        image_url: row
            .try_get("image_url")
            .map_err(|e| CivicError::store(format!("postgres decode image_url failed: {e}")))?,
        status: parse_report_status(&status)?,
        risk_score: risk_score
            .try_into()
            .map_err(|_| CivicError::store("risk score out of range in storage".to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CivicError::store(format!("postgres decode created_at failed: {e}")))?,
    })
}
