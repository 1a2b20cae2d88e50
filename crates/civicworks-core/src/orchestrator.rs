//! Work-order orchestration.
//!
//! The orchestrator drives the lifecycle assignment -> escrow intent ->
//! milestone programming -> proof submission -> approval -> settlement and
//! owns every consistency decision between the local store and the escrow
//! provider. The local store is the system of record: provider failures are
//! recorded and surfaced but never block a local workflow transition. The one
//! exception is creating a second payment intent for an order, which is a
//! correctness bug and fails hard.

use crate::error::CivicError;
use crate::escrow::{
    delivery_proof_hash, CreateIntentRequest, CreateMilestoneRequest, EscrowClient, EscrowDetails,
    EscrowError, IntentReceipt, LedgerPage, ProofSubmission,
};
use crate::money;
use crate::store::Storage;
use crate::types::{
    ApprovalResponse, AssignWorkRequest, AssignWorkResponse, ContractorDashboard, DesyncFinding,
    DesyncKind, EscrowOutcome, Milestone, MilestoneStatus, MilestoneSyncResult, OrderView,
    OrderWithReport, ReconciliationReport, ReportStatus, SyncMilestonesResponse,
    VerificationResponse, WorkOrder, WorkOrderStatus,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub currency: String,
    pub settlement_destination: String,
    /// Extra attempts after a retryable provider failure. Safe because every
    /// mutating call carries an idempotency key; settlement is never retried.
    pub escrow_retry_attempts: u32,
    /// Extra attempts after a revision conflict on the milestone array.
    pub revision_retry_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            settlement_destination: "city_treasury_bank".to_string(),
            escrow_retry_attempts: 1,
            revision_retry_attempts: 3,
        }
    }
}

/// Core state machine tying work orders to the escrow provider.
pub struct WorkOrderOrchestrator {
    storage: Storage,
    escrow: Arc<dyn EscrowClient>,
    config: OrchestratorConfig,
}

impl WorkOrderOrchestrator {
    pub fn new(storage: Storage, escrow: Arc<dyn EscrowClient>, config: OrchestratorConfig) -> Self {
        Self {
            storage,
            escrow,
            config,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn escrow_provider(&self) -> &'static str {
        self.escrow.provider()
    }

    /// Admin assignment: create the work order, best-effort escrow setup.
    ///
    /// Provider failures leave the order escrow-offline instead of blocking
    /// city operations; store failures abort the transition.
    pub async fn assign_work(
        &self,
        request: AssignWorkRequest,
    ) -> Result<AssignWorkResponse, CivicError> {
        if request.contractor_id.trim().is_empty() {
            return Err(CivicError::validation("contractor_id is required"));
        }
        if request.milestones.is_empty() {
            return Err(CivicError::validation("at least one milestone is required"));
        }
        if request.milestones.iter().any(|m| m.title.trim().is_empty()) {
            return Err(CivicError::validation("milestone titles must not be empty"));
        }
        let estimated_cost_minor = money::parse_decimal(&request.estimated_cost)?;
        if estimated_cost_minor == 0 {
            return Err(CivicError::validation("estimated cost must be positive"));
        }

        let report = self.storage.reports.get(request.report_id).await?;

        let mut escrow_notes = Vec::new();
        let intent = match self
            .create_intent_for_report(report.id, estimated_cost_minor)
            .await
        {
            Ok(receipt) => Some(receipt),
            Err(err) => {
                warn!(report_id = %report.id, error = %err, "escrow intent creation failed; continuing offline");
                escrow_notes.push(format!("escrow offline: {err}"));
                None
            }
        };

        let order = WorkOrder {
            id: Uuid::new_v4(),
            report_id: report.id,
            contractor_id: request.contractor_id,
            status: WorkOrderStatus::Assigned,
            priority: request.priority.unwrap_or_default(),
            estimated_cost_minor,
            deadline: request.deadline,
            admin_notes: request.admin_notes.unwrap_or_default(),
            milestones: request
                .milestones
                .iter()
                .map(Milestone::from_template)
                .collect(),
            escrow_intent_id: intent.as_ref().map(|receipt| receipt.intent_id.clone()),
            escrow_id: intent.as_ref().and_then(|receipt| receipt.escrow_id.clone()),
            completed_at: None,
            created_at: Utc::now(),
            revision: 0,
        };
        let order = self.storage.work_orders.create(order).await?;

        // Report bridge: only after the order insert succeeded.
        if let Err(err) = self
            .storage
            .reports
            .update_status(report.id, ReportStatus::InProgress)
            .await
        {
            warn!(report_id = %report.id, error = %err, "could not update report status");
        }

        let escrow_live = if let Some(receipt) = &intent {
            let results = self.program_milestones(&order, &receipt.intent_id).await?;
            let failures: Vec<&MilestoneSyncResult> = results
                .iter()
                .filter(|result| !result.outcome.is_acked())
                .collect();
            for failure in &failures {
                escrow_notes.push(format!(
                    "milestone {} not programmed into escrow",
                    failure.index
                ));
            }
            failures.is_empty()
        } else {
            false
        };

        let message = if intent.is_some() && escrow_live {
            "Work order created successfully".to_string()
        } else if intent.is_some() {
            "Work order created; some milestones need escrow reconciliation".to_string()
        } else {
            "Work order created; escrow offline".to_string()
        };

        Ok(AssignWorkResponse {
            success: true,
            work_order_id: order.id,
            escrow_intent_id: order.escrow_intent_id,
            escrow_live,
            message,
            escrow_notes,
        })
    }

    /// Contractor proof submission: milestone moves to review locally, proof
    /// is forwarded to escrow best-effort.
    pub async fn request_verification(
        &self,
        order_id: Uuid,
        index: usize,
        evidence_url: &str,
    ) -> Result<VerificationResponse, CivicError> {
        if evidence_url.trim().is_empty() {
            return Err(CivicError::validation("evidence url is required"));
        }

        let now = Utc::now();
        let order = self
            .mutate_milestones(order_id, |order| {
                let milestone = order
                    .milestones
                    .get(index)
                    .ok_or(CivicError::IndexOutOfBounds { order_id, index })?;
                if milestone.status != MilestoneStatus::Pending {
                    return Err(CivicError::MilestoneNotPending {
                        index,
                        status: milestone.status,
                    });
                }
                if order.milestones[..index]
                    .iter()
                    .any(|prior| prior.status != MilestoneStatus::Completed)
                {
                    return Err(CivicError::PriorMilestonesIncomplete { index });
                }

                let milestone = &mut order.milestones[index];
                milestone.status = MilestoneStatus::Review;
                milestone.evidence_url = Some(evidence_url.to_string());
                milestone.proof_submitted_at = Some(now);
                Ok(None)
            })
            .await?;

        let mut proof_forwarded = false;
        let mut message = "Verification requested".to_string();

        if let Some(intent_id) = order.escrow_intent_id.clone() {
            let proof = ProofSubmission {
                proof_hash: delivery_proof_hash(order_id, index, evidence_url),
                proof_uri: evidence_url.to_string(),
                submitted_by: order.contractor_id.clone(),
            };
            let outcome = match retry_escrow(self.config.escrow_retry_attempts, || {
                self.escrow.submit_proof(&intent_id, &proof)
            })
            .await
            {
                Ok(()) => {
                    proof_forwarded = true;
                    EscrowOutcome::acked()
                }
                Err(err) => {
                    warn!(order_id = %order_id, index, error = %err, "delivery proof submission failed");
                    message = format!("Verification requested; proof not forwarded to escrow ({err})");
                    EscrowOutcome::failed(err.to_string())
                }
            };

            self.record_milestone_outcome(order_id, index, |milestone| {
                milestone.proof_sync = outcome.clone();
            })
            .await?;
        }

        Ok(VerificationResponse {
            success: true,
            milestone_index: index,
            proof_forwarded,
            message,
        })
    }

    /// Admin approval: milestone completes locally, settlement is triggered
    /// downstream. Approval is the authoritative event; a settlement failure
    /// never rolls it back.
    pub async fn approve_milestone(
        &self,
        order_id: Uuid,
        index: usize,
    ) -> Result<ApprovalResponse, CivicError> {
        let current = self.storage.work_orders.get(order_id).await?;
        let milestone = current
            .milestones
            .get(index)
            .ok_or(CivicError::IndexOutOfBounds { order_id, index })?;

        // Re-approving a completed milestone is idempotent and must not
        // trigger a second settlement.
        if milestone.status == MilestoneStatus::Completed {
            return Ok(ApprovalResponse {
                success: true,
                all_completed: current.all_milestones_completed(),
                settlement_triggered: false,
                message: format!("milestone {index} was already approved"),
            });
        }

        let completed_at = Utc::now();
        let order = self
            .mutate_milestones(order_id, |order| {
                let milestone = order
                    .milestones
                    .get_mut(index)
                    .ok_or(CivicError::IndexOutOfBounds { order_id, index })?;
                match milestone.status {
                    MilestoneStatus::Review => milestone.status = MilestoneStatus::Completed,
                    MilestoneStatus::Completed => {}
                    MilestoneStatus::Pending => {
                        return Err(CivicError::MilestoneNotInReview {
                            index,
                            status: MilestoneStatus::Pending,
                        })
                    }
                }

                if order.all_milestones_completed() {
                    Ok(Some((WorkOrderStatus::Completed, Some(completed_at))))
                } else {
                    Ok(None)
                }
            })
            .await?;

        let all_completed = order.all_milestones_completed();
        let mut settlement_triggered = false;
        let mut message = format!("milestone {index} approved");

        if let Some(intent_id) = order.escrow_intent_id.clone() {
            // Never auto-retry settlement: a duplicate release is worse than
            // a recorded failure.
            let outcome = match self.escrow.settle_milestone(&intent_id, index).await {
                Ok(_) => {
                    settlement_triggered = true;
                    EscrowOutcome::acked()
                }
                Err(EscrowError::AlreadySettled { .. }) => EscrowOutcome::acked(),
                Err(err) => {
                    warn!(order_id = %order_id, index, error = %err, "settlement failed; manual reconciliation required");
                    message = format!("milestone {index} approved; settlement failed ({err})");
                    EscrowOutcome::failed(err.to_string())
                }
            };

            self.record_milestone_outcome(order_id, index, |milestone| {
                milestone.settlement = outcome.clone();
            })
            .await?;
        }

        Ok(ApprovalResponse {
            success: true,
            all_completed,
            settlement_triggered,
            message,
        })
    }

    /// Attach a payment intent to an order created escrow-offline.
    ///
    /// Unlike assignment-time creation, the caller explicitly asked for
    /// escrow here, so provider failures are request errors. A duplicate
    /// intent is the one fatal escrow guard in the system.
    pub async fn create_intent(&self, order_id: Uuid) -> Result<IntentReceipt, CivicError> {
        let order = self.storage.work_orders.get(order_id).await?;
        if order.escrow_intent_id.is_some() {
            return Err(CivicError::IntentAlreadyExists(order_id));
        }

        let receipt = self
            .create_intent_for_report(order.report_id, order.estimated_cost_minor)
            .await?;
        self.storage
            .work_orders
            .set_intent(order_id, &receipt.intent_id, receipt.escrow_id.as_deref())
            .await?;

        Ok(receipt)
    }

    /// Re-program every milestone into escrow, e.g. after a partial failure
    /// at assignment time. Already-programmed indices ack as successes.
    pub async fn sync_milestones(
        &self,
        order_id: Uuid,
    ) -> Result<SyncMilestonesResponse, CivicError> {
        let order = self.storage.work_orders.get(order_id).await?;
        let Some(intent_id) = order.escrow_intent_id.clone() else {
            return Err(CivicError::validation(
                "no payment intent exists for this work order",
            ));
        };

        let results = self.program_milestones(&order, &intent_id).await?;
        let synced = results.iter().filter(|r| r.outcome.is_acked()).count();
        let message = format!("{synced}/{} milestones synchronized with escrow", results.len());

        Ok(SyncMilestonesResponse {
            success: synced == results.len(),
            order_id,
            results,
            message,
        })
    }

    /// Operator view of where one order's local record and the escrow ledger
    /// disagree. Desync is an expected, queryable condition, not a crash.
    pub async fn reconciliation(&self, order_id: Uuid) -> Result<ReconciliationReport, CivicError> {
        let order = self.storage.work_orders.get(order_id).await?;
        let mut findings = Vec::new();

        match &order.escrow_intent_id {
            None => {
                if order
                    .milestones
                    .iter()
                    .any(|m| m.status != MilestoneStatus::Pending)
                {
                    findings.push(DesyncFinding {
                        milestone_index: None,
                        kind: DesyncKind::IntentMissing,
                        detail: "work progressed locally but no payment intent exists".to_string(),
                    });
                }
            }
            Some(_) => {
                for (index, milestone) in order.milestones.iter().enumerate() {
                    if !milestone.escrow_sync.is_acked() {
                        findings.push(DesyncFinding {
                            milestone_index: Some(index),
                            kind: DesyncKind::MilestoneUnprogrammed,
                            detail: format!("milestone {index} was never programmed into escrow"),
                        });
                    }
                    if milestone.status != MilestoneStatus::Pending
                        && !milestone.proof_sync.is_acked()
                    {
                        findings.push(DesyncFinding {
                            milestone_index: Some(index),
                            kind: DesyncKind::ProofUnsent,
                            detail: format!(
                                "milestone {index} is '{}' locally but escrow holds no delivery proof",
                                milestone.status
                            ),
                        });
                    }
                    if milestone.status == MilestoneStatus::Completed
                        && !milestone.settlement.is_acked()
                    {
                        findings.push(DesyncFinding {
                            milestone_index: Some(index),
                            kind: DesyncKind::SettlementMissing,
                            detail: format!("milestone {index} is approved but not settled"),
                        });
                    }
                }
            }
        }

        Ok(ReconciliationReport {
            order_id,
            phase: order.phase(),
            escrow_intent_id: order.escrow_intent_id,
            in_sync: findings.is_empty(),
            findings,
        })
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderView, CivicError> {
        let order = self.storage.work_orders.get(order_id).await?;
        Ok(OrderView {
            phase: order.phase(),
            order,
        })
    }

    /// Remote escrow view for one order; the provider-side half of a
    /// reconciliation check. Read-only, so a bounded retry is safe.
    pub async fn escrow_details(&self, order_id: Uuid) -> Result<EscrowDetails, CivicError> {
        let order = self.storage.work_orders.get(order_id).await?;
        let Some(intent_id) = order.escrow_intent_id else {
            return Err(CivicError::validation(
                "no payment intent exists for this work order",
            ));
        };

        let details = retry_escrow(self.config.escrow_retry_attempts, || {
            self.escrow.get_escrow_details(&intent_id)
        })
        .await?;
        Ok(details)
    }

    /// Provider ledger passthrough. Read-only, so a bounded retry is safe.
    pub async fn ledger(&self, limit: usize, offset: usize) -> Result<LedgerPage, CivicError> {
        let page = retry_escrow(self.config.escrow_retry_attempts, || {
            self.escrow.get_ledger_entries(limit, offset)
        })
        .await?;
        Ok(page)
    }

    /// Contractor dashboard: orders newest first with a one-hop join to the
    /// originating report, plus aggregate stats.
    pub async fn contractor_dashboard(
        &self,
        contractor_id: &str,
    ) -> Result<ContractorDashboard, CivicError> {
        let orders = self
            .storage
            .work_orders
            .list_by_contractor(contractor_id)
            .await?;

        let mut joined = Vec::with_capacity(orders.len());
        for order in orders {
            let report = match self.storage.reports.get(order.report_id).await {
                Ok(report) => Some(report),
                Err(CivicError::ReportNotFound(_)) => None,
                Err(err) => return Err(err),
            };
            joined.push(OrderWithReport { order, report });
        }

        Ok(ContractorDashboard::from_orders(contractor_id, joined))
    }

    async fn create_intent_for_report(
        &self,
        report_id: Uuid,
        amount_minor: u64,
    ) -> Result<IntentReceipt, EscrowError> {
        let mut metadata = BTreeMap::new();
        metadata.insert("report_id".to_string(), report_id.to_string());

        let request = CreateIntentRequest {
            amount_minor,
            currency: self.config.currency.clone(),
            description: format!("Infrastructure work order for report {report_id}"),
            settlement_destination: self.config.settlement_destination.clone(),
            metadata,
            idempotency_key: format!("report:{report_id}"),
        };

        retry_escrow(self.config.escrow_retry_attempts, || {
            self.escrow.create_payment_intent(&request)
        })
        .await
    }

    /// Program each milestone into escrow sequentially, index = array
    /// position, amount = equal split of the order total. Failures are
    /// recorded per milestone and never roll back earlier indices.
    async fn program_milestones(
        &self,
        order: &WorkOrder,
        intent_id: &str,
    ) -> Result<Vec<MilestoneSyncResult>, CivicError> {
        let amounts = money::equal_split(order.estimated_cost_minor, order.milestones.len());
        let mut results = Vec::with_capacity(order.milestones.len());

        for (index, milestone) in order.milestones.iter().enumerate() {
            let request = CreateMilestoneRequest {
                index,
                description: milestone.title.clone(),
                amount_minor: amounts[index],
                idempotency_key: format!("{}:{index}", order.id),
            };

            let outcome = match retry_escrow(self.config.escrow_retry_attempts, || {
                self.escrow.create_milestone(intent_id, &request)
            })
            .await
            {
                Ok(()) => EscrowOutcome::acked(),
                // Already programmed on a previous pass counts as synced.
                Err(EscrowError::DuplicateIndex { .. }) => EscrowOutcome::acked(),
                Err(err) => {
                    warn!(order_id = %order.id, index, error = %err, "milestone escrow programming failed");
                    EscrowOutcome::failed(err.to_string())
                }
            };
            results.push(MilestoneSyncResult { index, outcome });
        }

        self.mutate_milestones(order.id, |order| {
            for result in &results {
                order.milestones[result.index].escrow_sync = result.outcome.clone();
            }
            Ok(None)
        })
        .await?;

        Ok(results)
    }

    /// Read-modify-write over the milestone array under the revision CAS,
    /// with bounded retries so concurrent transitions on sibling indices
    /// serialize instead of clobbering each other.
    ///
    /// The closure may return a status change to persist atomically with the
    /// array; any error it returns aborts the write before side effects.
    async fn mutate_milestones<F>(&self, order_id: Uuid, apply: F) -> Result<WorkOrder, CivicError>
    where
        F: Fn(&mut WorkOrder) -> Result<Option<(WorkOrderStatus, Option<chrono::DateTime<Utc>>)>, CivicError>,
    {
        let mut attempts = 0;
        loop {
            let mut order = self.storage.work_orders.get(order_id).await?;
            let revision = order.revision;
            let status_change = apply(&mut order)?;

            let write = match status_change {
                Some((status, completed_at)) => {
                    self.storage
                        .work_orders
                        .update_milestones_and_status(
                            order_id,
                            order.milestones,
                            status,
                            completed_at,
                            revision,
                        )
                        .await
                }
                None => {
                    self.storage
                        .work_orders
                        .update_milestones(order_id, order.milestones, revision)
                        .await
                }
            };

            match write {
                Ok(updated) => return Ok(updated),
                Err(CivicError::RevisionConflict(_))
                    if attempts < self.config.revision_retry_attempts =>
                {
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record_milestone_outcome<F>(
        &self,
        order_id: Uuid,
        index: usize,
        apply: F,
    ) -> Result<WorkOrder, CivicError>
    where
        F: Fn(&mut Milestone),
    {
        self.mutate_milestones(order_id, |order| {
            let milestone = order
                .milestones
                .get_mut(index)
                .ok_or(CivicError::IndexOutOfBounds { order_id, index })?;
            apply(milestone);
            Ok(None)
        })
        .await
    }
}

async fn retry_escrow<T, F, Fut>(attempts: u32, mut call: F) -> Result<T, EscrowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EscrowError>>,
{
    let mut result = call().await;
    for _ in 0..attempts {
        match &result {
            Err(err) if err.is_retryable() => result = call().await,
            _ => break,
        }
    }
    result
}
