use crate::money;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Citizen report lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Pending,
    InProgress,
    Resolved,
}

impl ReportStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Resolved => "RESOLVED",
        }
    }

    /// Reports only move forward: PENDING -> IN_PROGRESS -> RESOLVED.
    /// Skipping straight to RESOLVED is an allowed admin action.
    pub fn can_transition_to(self, next: ReportStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Resolved)
                | (Self::InProgress, Self::Resolved)
        )
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Citizen infrastructure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub category: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_url: Option<String>,
    pub status: ReportStatus,
    /// 0..100 damage/risk score from the external scoring service.
    pub risk_score: u8,
    pub created_at: DateTime<Utc>,
}

/// Citizen submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReport {
    pub user_id: Option<String>,
    pub category: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub image_url: Option<String>,
    pub risk_score: Option<u8>,
}

impl Report {
    pub fn from_submission(submission: NewReport) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: submission.user_id,
            category: submission.category,
            description: submission.description,
            latitude: submission.latitude,
            longitude: submission.longitude,
            image_url: submission.image_url,
            status: ReportStatus::Pending,
            risk_score: submission.risk_score.unwrap_or(0).min(100),
            created_at: Utc::now(),
        }
    }
}

/// Work order dispatch priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    Assigned,
    Completed,
}

impl WorkOrderStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Milestone workflow status. Transitions only move forward:
/// pending -> review -> completed. There is no regression path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Review,
    Completed,
}

impl MilestoneStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Review => "review",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stored result of one escrow interaction.
///
/// Every provider call made on behalf of a milestone lands here instead of
/// only in the logs, so operators can query which orders need manual
/// reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EscrowOutcome {
    NotAttempted,
    Acked { at: DateTime<Utc> },
    Failed { reason: String, at: DateTime<Utc> },
}

impl EscrowOutcome {
    pub fn acked() -> Self {
        Self::Acked { at: Utc::now() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked { .. })
    }
}

impl Default for EscrowOutcome {
    fn default() -> Self {
        Self::NotAttempted
    }
}

/// Milestone template supplied at assignment time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneTemplate {
    pub title: String,
    pub description: String,
}

/// One phase of work inside a work order.
///
/// Milestones are referenced by ARRAY POSITION across the escrow boundary
/// (`milestoneIndex`); the array is never reordered, grown, or shrunk after
/// creation. `milestone_id` is the immutable local identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: MilestoneStatus,
    pub evidence_url: Option<String>,
    pub proof_submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escrow_sync: EscrowOutcome,
    #[serde(default)]
    pub proof_sync: EscrowOutcome,
    #[serde(default)]
    pub settlement: EscrowOutcome,
}

impl Milestone {
    pub fn from_template(template: &MilestoneTemplate) -> Self {
        Self {
            milestone_id: Uuid::new_v4(),
            title: template.title.clone(),
            description: template.description.clone(),
            status: MilestoneStatus::Pending,
            evidence_url: None,
            proof_submitted_at: None,
            escrow_sync: EscrowOutcome::NotAttempted,
            proof_sync: EscrowOutcome::NotAttempted,
            settlement: EscrowOutcome::NotAttempted,
        }
    }
}

/// Derived lifecycle phase of a work order, computed on read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderPhase {
    /// Persisted without an escrow intent (escrow-offline assignment).
    Created,
    /// Intent exists but not every milestone is programmed into escrow.
    Funded,
    /// Intent exists and all milestones are programmed.
    Programmed,
    /// At least one milestone awaits admin approval.
    InReview,
    Completed,
}

/// Durable work order record. Append-only audit trail: rows are never
/// destroyed, `completed` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Uuid,
    pub report_id: Uuid,
    pub contractor_id: String,
    pub status: WorkOrderStatus,
    pub priority: Priority,
    /// Total budget in minor units; decimal string on the wire.
    pub estimated_cost_minor: u64,
    pub deadline: Option<NaiveDate>,
    pub admin_notes: String,
    pub milestones: Vec<Milestone>,
    pub escrow_intent_id: Option<String>,
    pub escrow_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-concurrency counter; bumped on every milestone/status write.
    pub revision: u64,
}

impl WorkOrder {
    pub fn all_milestones_completed(&self) -> bool {
        !self.milestones.is_empty()
            && self
                .milestones
                .iter()
                .all(|m| m.status == MilestoneStatus::Completed)
    }

    /// Aggregate status implied by the milestone array. The stored `status`
    /// must always agree with this.
    pub fn aggregate_status(&self) -> WorkOrderStatus {
        if self.all_milestones_completed() {
            WorkOrderStatus::Completed
        } else {
            WorkOrderStatus::Assigned
        }
    }

    pub fn phase(&self) -> OrderPhase {
        if self.status == WorkOrderStatus::Completed || self.all_milestones_completed() {
            return OrderPhase::Completed;
        }
        if self
            .milestones
            .iter()
            .any(|m| m.status == MilestoneStatus::Review)
        {
            return OrderPhase::InReview;
        }
        match &self.escrow_intent_id {
            Some(_) if self.milestones.iter().all(|m| m.escrow_sync.is_acked()) => {
                OrderPhase::Programmed
            }
            Some(_) => OrderPhase::Funded,
            None => OrderPhase::Created,
        }
    }
}

/// Admin assignment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignWorkRequest {
    pub report_id: Uuid,
    pub contractor_id: String,
    pub milestones: Vec<MilestoneTemplate>,
    /// Decimal amount string, e.g. "1000" or "1000.50".
    pub estimated_cost: String,
    pub priority: Option<Priority>,
    pub deadline: Option<NaiveDate>,
    pub admin_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignWorkResponse {
    pub success: bool,
    pub work_order_id: Uuid,
    pub escrow_intent_id: Option<String>,
    /// False when the provider was unreachable and the order was persisted
    /// escrow-offline.
    pub escrow_live: bool,
    pub message: String,
    pub escrow_notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub success: bool,
    pub milestone_index: usize,
    pub proof_forwarded: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub success: bool,
    pub all_completed: bool,
    pub settlement_triggered: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneSyncResult {
    pub index: usize,
    pub outcome: EscrowOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMilestonesResponse {
    pub success: bool,
    pub order_id: Uuid,
    pub results: Vec<MilestoneSyncResult>,
    pub message: String,
}

/// Kind of disagreement between the local record and the escrow ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DesyncKind {
    /// Milestones progressed locally but no intent was ever created.
    IntentMissing,
    MilestoneUnprogrammed,
    ProofUnsent,
    SettlementMissing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesyncFinding {
    pub milestone_index: Option<usize>,
    pub kind: DesyncKind,
    pub detail: String,
}

/// Operator view of one order's local/remote consistency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub order_id: Uuid,
    pub phase: OrderPhase,
    pub escrow_intent_id: Option<String>,
    pub in_sync: bool,
    pub findings: Vec<DesyncFinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithReport {
    pub order: WorkOrder,
    pub report: Option<Report>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub phase: OrderPhase,
    pub order: WorkOrder,
}

/// Contractor dashboard aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractorDashboard {
    pub contractor_id: String,
    /// Decimal sum of `estimated_cost` over completed orders.
    pub total_earnings: String,
    pub pending_works: usize,
    pub completed_works: usize,
    pub assigned_orders: Vec<OrderWithReport>,
}

impl ContractorDashboard {
    pub fn from_orders(contractor_id: impl Into<String>, orders: Vec<OrderWithReport>) -> Self {
        let earnings_minor: u64 = orders
            .iter()
            .filter(|entry| entry.order.status == WorkOrderStatus::Completed)
            .map(|entry| entry.order.estimated_cost_minor)
            .sum();
        let completed_works = orders
            .iter()
            .filter(|entry| entry.order.status == WorkOrderStatus::Completed)
            .count();

        Self {
            contractor_id: contractor_id.into(),
            total_earnings: money::format_minor(earnings_minor),
            pending_works: orders.len() - completed_works,
            completed_works,
            assigned_orders: orders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_with_statuses(statuses: &[MilestoneStatus]) -> WorkOrder {
        let milestones = statuses
            .iter()
            .map(|status| {
                let mut milestone = Milestone::from_template(&MilestoneTemplate {
                    title: "phase".to_string(),
                    description: "work".to_string(),
                });
                milestone.status = *status;
                milestone
            })
            .collect();

        WorkOrder {
            id: Uuid::new_v4(),
            report_id: Uuid::new_v4(),
            contractor_id: "contractor-1".to_string(),
            status: WorkOrderStatus::Assigned,
            priority: Priority::Medium,
            estimated_cost_minor: 100_000,
            deadline: None,
            admin_notes: String::new(),
            milestones,
            escrow_intent_id: None,
            escrow_id: None,
            completed_at: None,
            created_at: Utc::now(),
            revision: 0,
        }
    }

    #[test]
    fn aggregate_status_matches_milestones_for_every_combination() {
        let statuses = [
            MilestoneStatus::Pending,
            MilestoneStatus::Review,
            MilestoneStatus::Completed,
        ];

        // Exhaustive over all 3^4 status combinations of a 4-milestone order.
        for combo in 0..81_u32 {
            let mut rest = combo;
            let assigned: Vec<MilestoneStatus> = (0..4)
                .map(|_| {
                    let status = statuses[(rest % 3) as usize];
                    rest /= 3;
                    status
                })
                .collect();

            let order = order_with_statuses(&assigned);
            let expect_completed = assigned
                .iter()
                .all(|status| *status == MilestoneStatus::Completed);

            assert_eq!(
                order.aggregate_status() == WorkOrderStatus::Completed,
                expect_completed,
                "combo {assigned:?}"
            );
        }
    }

    #[test]
    fn phase_derivation_follows_lifecycle() {
        let mut order = order_with_statuses(&[MilestoneStatus::Pending, MilestoneStatus::Pending]);
        assert_eq!(order.phase(), OrderPhase::Created);

        order.escrow_intent_id = Some("intent-1".to_string());
        assert_eq!(order.phase(), OrderPhase::Funded);

        for milestone in &mut order.milestones {
            milestone.escrow_sync = EscrowOutcome::acked();
        }
        assert_eq!(order.phase(), OrderPhase::Programmed);

        order.milestones[0].status = MilestoneStatus::Review;
        assert_eq!(order.phase(), OrderPhase::InReview);

        for milestone in &mut order.milestones {
            milestone.status = MilestoneStatus::Completed;
        }
        assert_eq!(order.phase(), OrderPhase::Completed);
    }

    #[test]
    fn report_status_transitions_are_forward_only() {
        assert!(ReportStatus::Pending.can_transition_to(ReportStatus::InProgress));
        assert!(ReportStatus::Pending.can_transition_to(ReportStatus::Resolved));
        assert!(ReportStatus::InProgress.can_transition_to(ReportStatus::Resolved));

        assert!(!ReportStatus::InProgress.can_transition_to(ReportStatus::Pending));
        assert!(!ReportStatus::Resolved.can_transition_to(ReportStatus::InProgress));
        assert!(!ReportStatus::Resolved.can_transition_to(ReportStatus::Pending));
    }

    #[test]
    fn dashboard_totals_only_count_completed_orders() {
        let mut completed = order_with_statuses(&[MilestoneStatus::Completed]);
        completed.status = WorkOrderStatus::Completed;
        let pending = order_with_statuses(&[MilestoneStatus::Pending]);

        let dashboard = ContractorDashboard::from_orders(
            "contractor-1",
            vec![
                OrderWithReport {
                    order: completed,
                    report: None,
                },
                OrderWithReport {
                    order: pending,
                    report: None,
                },
            ],
        );

        assert_eq!(dashboard.total_earnings, "1000.00");
        assert_eq!(dashboard.completed_works, 1);
        assert_eq!(dashboard.pending_works, 1);
    }
}
