//! Escrow provider abstraction.
//!
//! The provider is a remote delivery-vs-payment service: one payment intent
//! per work order, one funded milestone per local milestone at the same
//! array index, proof submission, and per-milestone settlement. Client
//! implementations perform NO automatic retries; retry policy belongs to
//! the orchestrator, which knows how much local state is already committed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the escrow provider boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    /// Transport failure, timeout, or provider 5xx. Retryable where an
    /// idempotency key makes the retry safe.
    #[error("escrow provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider rejected the request (e.g. invalid amount). Not retryable.
    #[error("escrow provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("unknown payment intent '{0}'")]
    UnknownIntent(String),

    #[error("milestone index {index} already programmed for intent '{intent_id}'")]
    DuplicateIndex { intent_id: String, index: usize },

    #[error("milestone index {index} already settled for intent '{intent_id}'")]
    AlreadySettled { intent_id: String, index: usize },

    /// Response the client could not interpret.
    #[error("escrow protocol error: {0}")]
    Protocol(String),
}

/// Payment intent creation request.
///
/// Amounts cross the wire as decimal strings; `idempotency_key` lets a
/// bounded retry after a timeout reuse the same remote commitment instead of
/// creating a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    pub amount_minor: u64,
    pub currency: String,
    pub description: String,
    pub settlement_destination: String,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentReceipt {
    pub intent_id: String,
    pub escrow_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMilestoneRequest {
    pub index: usize,
    pub description: String,
    pub amount_minor: u64,
    pub idempotency_key: String,
}

/// Delivery proof, content-addressed by `proof_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofSubmission {
    pub proof_hash: String,
    pub proof_uri: String,
    pub submitted_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub status: String,
}

/// Remote view of one programmed milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMilestone {
    pub index: usize,
    pub description: String,
    pub amount: String,
    pub settled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowDetails {
    pub intent_id: String,
    pub escrow_id: Option<String>,
    pub status: String,
    pub milestones: Vec<RemoteMilestone>,
}

/// One page of the provider's account ledger, passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPage {
    pub limit: usize,
    pub offset: usize,
    pub entries: Vec<serde_json::Value>,
}

/// Pluggable escrow provider client.
///
/// Mirrors the provider REST contract one call per endpoint; every call is a
/// synchronous remote RPC with a bounded timeout. Timeouts surface as
/// `ProviderUnavailable`.
#[async_trait]
pub trait EscrowClient: Send + Sync {
    /// Short provider label used in logs and health output.
    fn provider(&self) -> &'static str;

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<IntentReceipt, EscrowError>;

    async fn get_escrow_details(&self, intent_id: &str) -> Result<EscrowDetails, EscrowError>;

    async fn create_milestone(
        &self,
        intent_id: &str,
        request: &CreateMilestoneRequest,
    ) -> Result<(), EscrowError>;

    async fn submit_proof(
        &self,
        intent_id: &str,
        proof: &ProofSubmission,
    ) -> Result<(), EscrowError>;

    async fn settle_milestone(
        &self,
        intent_id: &str,
        index: usize,
    ) -> Result<SettlementReceipt, EscrowError>;

    async fn get_ledger_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, EscrowError>;
}

/// Content-addressed delivery proof hash: blake3 over the order id, the
/// milestone index, and the evidence reference, hex with a `0x` prefix.
pub fn delivery_proof_hash(order_id: Uuid, index: usize, evidence_url: &str) -> String {
    let material = format!("{order_id}:{index}:{evidence_url}");
    format!("0x{}", blake3::hash(material.as_bytes()).to_hex())
}

impl EscrowError {
    /// Whether a bounded retry is safe for this failure, assuming the call
    /// carried an idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_hash_is_deterministic_and_prefixed() {
        let order_id = Uuid::new_v4();
        let a = delivery_proof_hash(order_id, 0, "https://x/evidence1.jpg");
        let b = delivery_proof_hash(order_id, 0, "https://x/evidence1.jpg");

        assert_eq!(a, b);
        assert!(a.starts_with("0x"));
        assert_eq!(a.len(), 2 + 64);
    }

    #[test]
    fn proof_hash_distinguishes_index_and_evidence() {
        let order_id = Uuid::new_v4();
        let base = delivery_proof_hash(order_id, 0, "https://x/evidence1.jpg");

        assert_ne!(base, delivery_proof_hash(order_id, 1, "https://x/evidence1.jpg"));
        assert_ne!(base, delivery_proof_hash(order_id, 0, "https://x/evidence2.jpg"));
    }

    #[test]
    fn only_unavailable_errors_are_retryable() {
        assert!(EscrowError::ProviderUnavailable("timeout".to_string()).is_retryable());
        assert!(!EscrowError::ProviderRejected("bad amount".to_string()).is_retryable());
        assert!(!EscrowError::UnknownIntent("intent-1".to_string()).is_retryable());
        assert!(!EscrowError::AlreadySettled {
            intent_id: "intent-1".to_string(),
            index: 0
        }
        .is_retryable());
    }
}
