//! Deterministic escrow clients for local runs and chaos testing.

use async_trait::async_trait;
use civicworks_core::escrow::{
    CreateIntentRequest, CreateMilestoneRequest, EscrowClient, EscrowDetails, EscrowError,
    IntentReceipt, LedgerPage, ProofSubmission, RemoteMilestone, SettlementReceipt,
};
use civicworks_core::money;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct MockMilestone {
    description: String,
    amount_minor: u64,
    settled: bool,
}

#[derive(Debug, Clone, Default)]
struct MockIntent {
    escrow_id: String,
    milestones: BTreeMap<usize, MockMilestone>,
    proofs: Vec<ProofSubmission>,
}

#[derive(Debug, Default)]
struct MockState {
    intents: BTreeMap<String, MockIntent>,
    counter: u64,
    ledger: Vec<serde_json::Value>,
}

/// In-process escrow provider with real provider semantics: unknown intents,
/// duplicate milestone indices, and repeat settlements are rejected the way
/// the remote service rejects them.
#[derive(Debug, Default)]
pub struct MockEscrowClient {
    state: Mutex<MockState>,
}

impl MockEscrowClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of intents created so far; test hook.
    pub fn intent_count(&self) -> usize {
        self.state.lock().expect("mock state poisoned").intents.len()
    }

    /// Delivery proofs received for one intent; test hook.
    pub fn proofs(&self, intent_id: &str) -> Vec<ProofSubmission> {
        let state = self.state.lock().expect("mock state poisoned");
        state
            .intents
            .get(intent_id)
            .map(|intent| intent.proofs.clone())
            .unwrap_or_default()
    }

    /// Settled (intent, index) pairs; test hook.
    pub fn settled(&self) -> Vec<(String, usize)> {
        let state = self.state.lock().expect("mock state poisoned");
        state
            .intents
            .iter()
            .flat_map(|(intent_id, intent)| {
                intent
                    .milestones
                    .iter()
                    .filter(|(_, milestone)| milestone.settled)
                    .map(|(index, _)| (intent_id.clone(), *index))
            })
            .collect()
    }
}

#[async_trait]
impl EscrowClient for MockEscrowClient {
    fn provider(&self) -> &'static str {
        "mock"
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<IntentReceipt, EscrowError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.counter += 1;
        let intent_id = format!("mock-intent-{}", state.counter);
        let escrow_id = format!("mock-escrow-{}", state.counter);

        state.intents.insert(
            intent_id.clone(),
            MockIntent {
                escrow_id: escrow_id.clone(),
                milestones: BTreeMap::new(),
                proofs: Vec::new(),
            },
        );

        Ok(IntentReceipt {
            intent_id,
            escrow_id: Some(escrow_id),
            status: "CREATED".to_string(),
        })
    }

    async fn get_escrow_details(&self, intent_id: &str) -> Result<EscrowDetails, EscrowError> {
        let state = self.state.lock().expect("mock state poisoned");
        let intent = state
            .intents
            .get(intent_id)
            .ok_or_else(|| EscrowError::UnknownIntent(intent_id.to_string()))?;

        Ok(EscrowDetails {
            intent_id: intent_id.to_string(),
            escrow_id: Some(intent.escrow_id.clone()),
            status: "ACTIVE".to_string(),
            milestones: intent
                .milestones
                .iter()
                .map(|(index, milestone)| RemoteMilestone {
                    index: *index,
                    description: milestone.description.clone(),
                    amount: money::format_minor(milestone.amount_minor),
                    settled: milestone.settled,
                })
                .collect(),
        })
    }

    async fn create_milestone(
        &self,
        intent_id: &str,
        request: &CreateMilestoneRequest,
    ) -> Result<(), EscrowError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| EscrowError::UnknownIntent(intent_id.to_string()))?;

        if intent.milestones.contains_key(&request.index) {
            return Err(EscrowError::DuplicateIndex {
                intent_id: intent_id.to_string(),
                index: request.index,
            });
        }

        intent.milestones.insert(
            request.index,
            MockMilestone {
                description: request.description.clone(),
                amount_minor: request.amount_minor,
                settled: false,
            },
        );
        Ok(())
    }

    async fn submit_proof(
        &self,
        intent_id: &str,
        proof: &ProofSubmission,
    ) -> Result<(), EscrowError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| EscrowError::UnknownIntent(intent_id.to_string()))?;
        intent.proofs.push(proof.clone());
        Ok(())
    }

    async fn settle_milestone(
        &self,
        intent_id: &str,
        index: usize,
    ) -> Result<SettlementReceipt, EscrowError> {
        let mut state = self.state.lock().expect("mock state poisoned");
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| EscrowError::UnknownIntent(intent_id.to_string()))?;

        let milestone = intent.milestones.get_mut(&index).ok_or_else(|| {
            EscrowError::ProviderRejected(format!("milestone index {index} is not programmed"))
        })?;
        if milestone.settled {
            return Err(EscrowError::AlreadySettled {
                intent_id: intent_id.to_string(),
                index,
            });
        }
        milestone.settled = true;

        let amount = money::format_minor(milestone.amount_minor);
        state.ledger.push(serde_json::json!({
            "type": "MILESTONE_RELEASE",
            "intentId": intent_id,
            "milestoneIndex": index,
            "amount": amount,
        }));

        Ok(SettlementReceipt {
            status: "SETTLED".to_string(),
        })
    }

    async fn get_ledger_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, EscrowError> {
        let state = self.state.lock().expect("mock state poisoned");
        let entries = state
            .ledger
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(LedgerPage {
            limit,
            offset,
            entries,
        })
    }
}

/// Escrow client that fails every call; chaos fixture for offline-mode tests.
#[derive(Debug, Clone)]
pub struct AlwaysFailEscrowClient {
    reason: String,
}

impl AlwaysFailEscrowClient {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> Result<T, EscrowError> {
        Err(EscrowError::ProviderUnavailable(self.reason.clone()))
    }
}

impl Default for AlwaysFailEscrowClient {
    fn default() -> Self {
        Self::new("forced outage")
    }
}

#[async_trait]
impl EscrowClient for AlwaysFailEscrowClient {
    fn provider(&self) -> &'static str {
        "always-fail"
    }

    async fn create_payment_intent(
        &self,
        _request: &CreateIntentRequest,
    ) -> Result<IntentReceipt, EscrowError> {
        self.unavailable()
    }

    async fn get_escrow_details(&self, _intent_id: &str) -> Result<EscrowDetails, EscrowError> {
        self.unavailable()
    }

    async fn create_milestone(
        &self,
        _intent_id: &str,
        _request: &CreateMilestoneRequest,
    ) -> Result<(), EscrowError> {
        self.unavailable()
    }

    async fn submit_proof(
        &self,
        _intent_id: &str,
        _proof: &ProofSubmission,
    ) -> Result<(), EscrowError> {
        self.unavailable()
    }

    async fn settle_milestone(
        &self,
        _intent_id: &str,
        _index: usize,
    ) -> Result<SettlementReceipt, EscrowError> {
        self.unavailable()
    }

    async fn get_ledger_entries(
        &self,
        _limit: usize,
        _offset: usize,
    ) -> Result<LedgerPage, EscrowError> {
        self.unavailable()
    }
}

/// Fails the first `failures` calls, then delegates. Exercises the
/// orchestrator's bounded-retry paths.
pub struct FlakyEscrowClient {
    inner: Arc<dyn EscrowClient>,
    failures_remaining: Mutex<u32>,
}

impl FlakyEscrowClient {
    pub fn new(inner: Arc<dyn EscrowClient>, failures: u32) -> Self {
        Self {
            inner,
            failures_remaining: Mutex::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        let mut remaining = self.failures_remaining.lock().expect("flaky state poisoned");
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl EscrowClient for FlakyEscrowClient {
    fn provider(&self) -> &'static str {
        "flaky"
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<IntentReceipt, EscrowError> {
        if self.should_fail() {
            return Err(EscrowError::ProviderUnavailable("flaky timeout".to_string()));
        }
        self.inner.create_payment_intent(request).await
    }

    async fn get_escrow_details(&self, intent_id: &str) -> Result<EscrowDetails, EscrowError> {
        if self.should_fail() {
            return Err(EscrowError::ProviderUnavailable("flaky timeout".to_string()));
        }
        self.inner.get_escrow_details(intent_id).await
    }

    async fn create_milestone(
        &self,
        intent_id: &str,
        request: &CreateMilestoneRequest,
    ) -> Result<(), EscrowError> {
        if self.should_fail() {
            return Err(EscrowError::ProviderUnavailable("flaky timeout".to_string()));
        }
        self.inner.create_milestone(intent_id, request).await
    }

    async fn submit_proof(
        &self,
        intent_id: &str,
        proof: &ProofSubmission,
    ) -> Result<(), EscrowError> {
        if self.should_fail() {
            return Err(EscrowError::ProviderUnavailable("flaky timeout".to_string()));
        }
        self.inner.submit_proof(intent_id, proof).await
    }

    async fn settle_milestone(
        &self,
        intent_id: &str,
        index: usize,
    ) -> Result<SettlementReceipt, EscrowError> {
        if self.should_fail() {
            return Err(EscrowError::ProviderUnavailable("flaky timeout".to_string()));
        }
        self.inner.settle_milestone(intent_id, index).await
    }

    async fn get_ledger_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, EscrowError> {
        if self.should_fail() {
            return Err(EscrowError::ProviderUnavailable("flaky timeout".to_string()));
        }
        self.inner.get_ledger_entries(limit, offset).await
    }
}

/// Delegating wrapper that records which calls were made, for asserting
/// call ordering and idempotency in tests.
pub struct RecordingEscrowClient {
    inner: Arc<dyn EscrowClient>,
    calls: Mutex<Vec<String>>,
}

impl RecordingEscrowClient {
    pub fn new(inner: Arc<dyn EscrowClient>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("recording state poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("recording state poisoned").push(call);
    }
}

#[async_trait]
impl EscrowClient for RecordingEscrowClient {
    fn provider(&self) -> &'static str {
        self.inner.provider()
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<IntentReceipt, EscrowError> {
        self.record(format!("create_intent:{}", request.idempotency_key));
        self.inner.create_payment_intent(request).await
    }

    async fn get_escrow_details(&self, intent_id: &str) -> Result<EscrowDetails, EscrowError> {
        self.record(format!("get_escrow:{intent_id}"));
        self.inner.get_escrow_details(intent_id).await
    }

    async fn create_milestone(
        &self,
        intent_id: &str,
        request: &CreateMilestoneRequest,
    ) -> Result<(), EscrowError> {
        self.record(format!("create_milestone:{intent_id}:{}", request.index));
        self.inner.create_milestone(intent_id, request).await
    }

    async fn submit_proof(
        &self,
        intent_id: &str,
        proof: &ProofSubmission,
    ) -> Result<(), EscrowError> {
        self.record(format!("submit_proof:{intent_id}:{}", proof.proof_hash));
        self.inner.submit_proof(intent_id, proof).await
    }

    async fn settle_milestone(
        &self,
        intent_id: &str,
        index: usize,
    ) -> Result<SettlementReceipt, EscrowError> {
        self.record(format!("settle:{intent_id}:{index}"));
        self.inner.settle_milestone(intent_id, index).await
    }

    async fn get_ledger_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, EscrowError> {
        self.record(format!("ledger:{limit}:{offset}"));
        self.inner.get_ledger_entries(limit, offset).await
    }
}
