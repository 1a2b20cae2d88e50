//! CivicWorks core: work-order orchestration against a programmable-escrow
//! provider.
//!
//! This crate enforces the milestone workflow invariants (forward-only
//! milestone status, index stability across the escrow boundary, at most one
//! payment intent per order, settlement only downstream of approval) while
//! keeping the local store authoritative when the provider is unreachable.

#![deny(unsafe_code)]

pub mod error;
pub mod escrow;
pub mod money;
pub mod orchestrator;
pub mod reports;
pub mod store;
pub mod types;

pub use error::CivicError;
pub use escrow::{
    delivery_proof_hash, CreateIntentRequest, CreateMilestoneRequest, EscrowClient, EscrowDetails,
    EscrowError, IntentReceipt, LedgerPage, ProofSubmission, RemoteMilestone, SettlementReceipt,
};
pub use orchestrator::{OrchestratorConfig, WorkOrderOrchestrator};
pub use reports::ReportStore;
pub use store::{Storage, StorageConfig, WorkOrderStore};
pub use types::{
    ApprovalResponse, AssignWorkRequest, AssignWorkResponse, ContractorDashboard, DesyncFinding,
    DesyncKind, EscrowOutcome, Milestone, MilestoneStatus, MilestoneSyncResult, MilestoneTemplate,
    NewReport, OrderPhase, OrderView, OrderWithReport, Priority, ReconciliationReport, Report,
    ReportStatus, SyncMilestonesResponse, VerificationResponse, WorkOrder, WorkOrderStatus,
};
