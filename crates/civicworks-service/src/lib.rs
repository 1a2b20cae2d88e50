#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use civicworks_adapters::{AlwaysFailEscrowClient, HttpEscrowClient, HttpEscrowConfig, MockEscrowClient};
use civicworks_core::{
    ApprovalResponse, AssignWorkRequest, AssignWorkResponse, CivicError, ContractorDashboard,
    EscrowClient, EscrowDetails, EscrowError, IntentReceipt, LedgerPage, NewReport,
    OrchestratorConfig, OrderView, ReconciliationReport, Report, ReportStatus, Storage,
    StorageConfig, SyncMilestonesResponse, VerificationResponse, WorkOrderOrchestrator,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Escrow provider wiring for one service instance.
#[derive(Debug, Clone)]
pub enum EscrowConfig {
    /// Remote provider over HTTPS.
    Http(HttpEscrowConfig),
    /// Deterministic in-process provider for local development.
    Mock,
    /// No provider configured; every escrow call fails as unavailable and
    /// the workflow runs escrow-offline.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub escrow: EscrowConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            escrow: EscrowConfig::Mock,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub orchestrator: Arc<WorkOrderOrchestrator>,
    pub storage: Storage,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let storage = Storage::bootstrap(config.storage).await?;

        let escrow: Arc<dyn EscrowClient> = match config.escrow {
            EscrowConfig::Http(http) => Arc::new(HttpEscrowClient::new(http)?),
            EscrowConfig::Mock => Arc::new(MockEscrowClient::new()),
            EscrowConfig::Disabled => {
                Arc::new(AlwaysFailEscrowClient::new("escrow provider not configured"))
            }
        };

        let orchestrator = Arc::new(WorkOrderOrchestrator::new(
            storage.clone(),
            escrow,
            config.orchestrator,
        ));

        Ok(Self {
            orchestrator,
            storage,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/reports", post(create_report).get(list_reports))
        .route("/v1/reports/user/:user_id", get(list_user_reports))
        .route("/v1/reports/:id", patch(update_report_status))
        .route("/v1/work-orders", post(assign_work))
        .route("/v1/work-orders/:id", get(get_order))
        .route("/v1/work-orders/:id/reconciliation", get(reconciliation))
        .route("/v1/work-orders/:id/escrow", get(escrow_details))
        .route("/v1/work-orders/:id/intent", post(create_intent))
        .route("/v1/work-orders/:id/milestones/sync", post(sync_milestones))
        .route(
            "/v1/work-orders/:id/milestones/:index/review",
            post(request_verification),
        )
        .route("/v1/work-orders/:id/approve", post(approve_milestone))
        .route("/v1/contractors/:id/dashboard", get(contractor_dashboard))
        .route("/v1/ledger", get(ledger))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core error: {0}")]
    Core(#[from] CivicError),
    #[error("escrow client error: {0}")]
    Escrow(#[from] EscrowError),
}

/// API error with the status mapping for the core taxonomy: validation is
/// 4xx before side effects, missing records are 404, duplicate intents and
/// exhausted revision retries are 409, store failures are 500, and fatal
/// provider failures surface as 502.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ApiError(#[from] CivicError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CivicError::Validation(_)
            | CivicError::IndexOutOfBounds { .. }
            | CivicError::MilestoneNotPending { .. }
            | CivicError::MilestoneNotInReview { .. }
            | CivicError::PriorMilestonesIncomplete { .. }
            | CivicError::MilestoneShapeChanged(_)
            | CivicError::InvalidStatusTransition { .. } => StatusCode::BAD_REQUEST,
            CivicError::ReportNotFound(_) | CivicError::OrderNotFound(_) => StatusCode::NOT_FOUND,
            CivicError::IntentAlreadyExists(_) | CivicError::RevisionConflict(_) => {
                StatusCode::CONFLICT
            }
            CivicError::Escrow(_) => StatusCode::BAD_GATEWAY,
            CivicError::Store(_) | CivicError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(serde_json::json!({ "success": false, "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    escrow_provider: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "civicworks-service",
        storage_backend: state.storage.backend_label(),
        escrow_provider: state.orchestrator.escrow_provider(),
    })
}

#[derive(Debug, Clone, Serialize)]
struct ReportResponse {
    success: bool,
    report: Report,
}

async fn create_report(
    State(state): State<ServiceState>,
    Json(submission): Json<NewReport>,
) -> Result<(StatusCode, Json<ReportResponse>), ApiError> {
    let report = state
        .storage
        .reports
        .create(Report::from_submission(submission))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ReportResponse {
            success: true,
            report,
        }),
    ))
}

async fn list_reports(State(state): State<ServiceState>) -> Result<Json<Vec<Report>>, ApiError> {
    Ok(Json(state.storage.reports.list().await?))
}

async fn list_user_reports(
    Path(user_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Vec<Report>>, ApiError> {
    Ok(Json(state.storage.reports.list_by_user(&user_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ReportStatusUpdate {
    status: ReportStatus,
}

async fn update_report_status(
    Path(report_id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(update): Json<ReportStatusUpdate>,
) -> Result<Json<ReportResponse>, ApiError> {
    let report = state
        .storage
        .reports
        .update_status(report_id, update.status)
        .await?;
    Ok(Json(ReportResponse {
        success: true,
        report,
    }))
}

async fn assign_work(
    State(state): State<ServiceState>,
    Json(request): Json<AssignWorkRequest>,
) -> Result<(StatusCode, Json<AssignWorkResponse>), ApiError> {
    let response = state.orchestrator.assign_work(request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_order(
    Path(order_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<OrderView>, ApiError> {
    Ok(Json(state.orchestrator.get_order(order_id).await?))
}

async fn reconciliation(
    Path(order_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    Ok(Json(state.orchestrator.reconciliation(order_id).await?))
}

async fn escrow_details(
    Path(order_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<EscrowDetails>, ApiError> {
    Ok(Json(state.orchestrator.escrow_details(order_id).await?))
}

async fn create_intent(
    Path(order_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<(StatusCode, Json<IntentReceipt>), ApiError> {
    let receipt = state.orchestrator.create_intent(order_id).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn sync_milestones(
    Path(order_id): Path<Uuid>,
    State(state): State<ServiceState>,
) -> Result<Json<SyncMilestonesResponse>, ApiError> {
    Ok(Json(state.orchestrator.sync_milestones(order_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewRequest {
    image_url: String,
}

async fn request_verification(
    Path((order_id, index)): Path<(Uuid, usize)>,
    State(state): State<ServiceState>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<VerificationResponse>, ApiError> {
    Ok(Json(
        state
            .orchestrator
            .request_verification(order_id, index, &request.image_url)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ApproveRequest {
    milestone_index: usize,
}

async fn approve_milestone(
    Path(order_id): Path<Uuid>,
    State(state): State<ServiceState>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    Ok(Json(
        state
            .orchestrator
            .approve_milestone(order_id, request.milestone_index)
            .await?,
    ))
}

async fn contractor_dashboard(
    Path(contractor_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ContractorDashboard>, ApiError> {
    Ok(Json(
        state
            .orchestrator
            .contractor_dashboard(&contractor_id)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct LedgerQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn ledger(
    State(state): State<ServiceState>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerPage>, ApiError> {
    let limit = query.limit.unwrap_or(20).min(100);
    let offset = query.offset.unwrap_or(0);
    Ok(Json(state.orchestrator.ledger(limit, offset).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig::default())
            .await
            .unwrap();
        build_router(state)
    }

    async fn offline_app() -> Router {
        let state = ServiceState::bootstrap(ServiceConfig {
            escrow: EscrowConfig::Disabled,
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        build_router(state)
    }

    async fn send_json(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap();
        (status, value)
    }

    async fn submit_report(app: &Router) -> String {
        let (status, body) = send_json(
            app,
            "POST",
            "/v1/reports",
            serde_json::json!({
                "user_id": "citizen-1",
                "category": "pothole",
                "description": "deep pothole on 5th avenue",
                "latitude": 40.73,
                "longitude": -73.93,
                "image_url": null,
                "risk_score": 70
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["report"]["id"].as_str().unwrap().to_string()
    }

    fn assignment_body(report_id: &str) -> serde_json::Value {
        serde_json::json!({
            "report_id": report_id,
            "contractor_id": "contractor-1",
            "milestones": [
                {"title": "Phase 1", "description": "excavation"},
                {"title": "Phase 2", "description": "base layer"},
                {"title": "Phase 3", "description": "paving"},
                {"title": "Phase 4", "description": "cleanup"}
            ],
            "estimated_cost": "1000",
            "priority": "High",
            "deadline": null,
            "admin_notes": "fix before winter"
        })
    }

    #[tokio::test]
    async fn health_reports_backends() {
        let app = test_app().await;
        let (status, body) = get_json(&app, "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage_backend"], "memory");
        assert_eq!(body["escrow_provider"], "mock");
    }

    #[tokio::test]
    async fn full_workflow_over_http() {
        let app = test_app().await;
        let report_id = submit_report(&app).await;

        let (status, assigned) = send_json(
            &app,
            "POST",
            "/v1/work-orders",
            assignment_body(&report_id),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(assigned["success"], true);
        assert_eq!(assigned["escrow_live"], true);
        let order_id = assigned["work_order_id"].as_str().unwrap().to_string();

        // Assignment moved the report to IN_PROGRESS.
        let (_, reports) = get_json(&app, "/v1/reports/user/citizen-1").await;
        assert_eq!(reports[0]["status"], "IN_PROGRESS");

        // Equal split visible on the provider side: 1000.00 over 4 -> 250.00.
        let (status, escrow) = get_json(&app, &format!("/v1/work-orders/{order_id}/escrow")).await;
        assert_eq!(status, StatusCode::OK);
        let remote_milestones = escrow["milestones"].as_array().unwrap();
        assert_eq!(remote_milestones.len(), 4);
        assert!(remote_milestones.iter().all(|m| m["amount"] == "250.00"));

        for index in 0..4 {
            let (status, verified) = send_json(
                &app,
                "POST",
                &format!("/v1/work-orders/{order_id}/milestones/{index}/review"),
                serde_json::json!({"image_url": "https://x/evidence1.jpg"}),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(verified["success"], true);

            let (status, approved) = send_json(
                &app,
                "POST",
                &format!("/v1/work-orders/{order_id}/approve"),
                serde_json::json!({"milestone_index": index}),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(approved["success"], true);
            assert_eq!(approved["all_completed"], index == 3);
        }

        let (status, view) = get_json(&app, &format!("/v1/work-orders/{order_id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["order"]["status"], "completed");
        assert_eq!(view["phase"], "completed");
        assert!(view["order"]["completed_at"].is_string());

        // Four settlements appear in the provider ledger.
        let (status, ledger) = get_json(&app, "/v1/ledger?limit=10&offset=0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ledger["entries"].as_array().unwrap().len(), 4);

        let (status, dashboard) = get_json(&app, "/v1/contractors/contractor-1/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dashboard["completed_works"], 1);
        assert_eq!(dashboard["total_earnings"], "1000.00");
    }

    #[tokio::test]
    async fn escrow_offline_assignment_still_succeeds() {
        let app = offline_app().await;
        let report_id = submit_report(&app).await;

        let (status, assigned) = send_json(
            &app,
            "POST",
            "/v1/work-orders",
            assignment_body(&report_id),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(assigned["success"], true);
        assert_eq!(assigned["escrow_live"], false);
        assert!(assigned["escrow_intent_id"].is_null());
        assert!(assigned["message"]
            .as_str()
            .unwrap()
            .contains("escrow offline"));

        let order_id = assigned["work_order_id"].as_str().unwrap();
        let (status, reconciliation) =
            get_json(&app, &format!("/v1/work-orders/{order_id}/reconciliation")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reconciliation["in_sync"], true);
        assert_eq!(reconciliation["phase"], "created");

        // No intent means no provider-side view to fetch.
        let (status, _) = get_json(&app, &format!("/v1/work-orders/{order_id}/escrow")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_records_return_not_found() {
        let app = test_app().await;
        let missing = Uuid::new_v4();

        let (status, body) = send_json(
            &app,
            "POST",
            &format!("/v1/work-orders/{missing}/approve"),
            serde_json::json!({"milestone_index": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = get_json(&app, &format!("/v1/work-orders/{missing}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send_json(
            &app,
            "POST",
            "/v1/work-orders",
            assignment_body(&missing.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_transitions_are_bad_requests() {
        let app = test_app().await;
        let report_id = submit_report(&app).await;
        let (_, assigned) = send_json(
            &app,
            "POST",
            "/v1/work-orders",
            assignment_body(&report_id),
        )
        .await;
        let order_id = assigned["work_order_id"].as_str().unwrap().to_string();

        // Approval without a review request.
        let (status, body) = send_json(
            &app,
            "POST",
            &format!("/v1/work-orders/{order_id}/approve"),
            serde_json::json!({"milestone_index": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("expected 'review'"));

        // Out-of-order verification request.
        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/v1/work-orders/{order_id}/milestones/2/review"),
            serde_json::json!({"image_url": "https://x/evidence.jpg"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Out-of-bounds index.
        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/v1/work-orders/{order_id}/milestones/9/review"),
            serde_json::json!({"image_url": "https://x/evidence.jpg"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Report status regression.
        let (status, _) = send_json(
            &app,
            "PATCH",
            &format!("/v1/reports/{report_id}"),
            serde_json::json!({"status": "PENDING"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn duplicate_intent_is_a_conflict() {
        let app = test_app().await;
        let report_id = submit_report(&app).await;
        let (_, assigned) = send_json(
            &app,
            "POST",
            "/v1/work-orders",
            assignment_body(&report_id),
        )
        .await;
        let order_id = assigned["work_order_id"].as_str().unwrap().to_string();
        assert!(assigned["escrow_intent_id"].is_string());

        let (status, body) = send_json(
            &app,
            "POST",
            &format!("/v1/work-orders/{order_id}/intent"),
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("already exists"));
    }

    #[tokio::test]
    async fn validation_failures_reject_before_side_effects() {
        let app = test_app().await;
        let report_id = submit_report(&app).await;

        let mut body = assignment_body(&report_id);
        body["estimated_cost"] = serde_json::json!("-10");
        let (status, response) = send_json(&app, "POST", "/v1/work-orders", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["success"], false);

        let mut body = assignment_body(&report_id);
        body["milestones"] = serde_json::json!([]);
        let (status, _) = send_json(&app, "POST", "/v1/work-orders", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The report was never touched by the rejected assignments.
        let (_, reports) = get_json(&app, "/v1/reports/user/citizen-1").await;
        assert_eq!(reports[0]["status"], "PENDING");
    }
}
