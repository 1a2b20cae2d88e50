//! HTTP client for the remote programmable-escrow provider.
//!
//! One method per provider endpoint, JSON over HTTPS with API-key auth and a
//! fixed request timeout. Amounts cross the wire as decimal strings. The
//! client never retries; it only classifies failures so the orchestrator can
//! decide.

use async_trait::async_trait;
use civicworks_core::escrow::{
    CreateIntentRequest, CreateMilestoneRequest, EscrowClient, EscrowDetails, EscrowError,
    IntentReceipt, LedgerPage, ProofSubmission, RemoteMilestone, SettlementReceipt,
};
use civicworks_core::money;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpEscrowConfig {
    /// Provider origin, e.g. `https://escrow.example`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpEscrowConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Which provider endpoint a response came from; drives 404/409 mapping.
#[derive(Debug, Clone, Copy)]
enum CallContext {
    Intent,
    Milestone { index: usize },
    Settlement { index: usize },
}

pub struct HttpEscrowClient {
    http: reqwest::Client,
    config: HttpEscrowConfig,
}

impl HttpEscrowClient {
    pub fn new(config: HttpEscrowConfig) -> Result<Self, EscrowError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EscrowError::Protocol(format!("http client build failed: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        intent_id: &str,
        context: CallContext,
    ) -> Result<reqwest::Response, EscrowError> {
        let response = request
            .header("X-API-Key", self.config.api_key.as_str())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, intent_id, context, &body))
    }
}

fn transport_error(err: reqwest::Error) -> EscrowError {
    if err.is_timeout() {
        EscrowError::ProviderUnavailable("request timed out".to_string())
    } else {
        EscrowError::ProviderUnavailable(err.to_string())
    }
}

fn map_status(
    status: StatusCode,
    intent_id: &str,
    context: CallContext,
    body: &str,
) -> EscrowError {
    match (status, context) {
        (StatusCode::NOT_FOUND, _) => EscrowError::UnknownIntent(intent_id.to_string()),
        (StatusCode::CONFLICT, CallContext::Milestone { index }) => EscrowError::DuplicateIndex {
            intent_id: intent_id.to_string(),
            index,
        },
        (StatusCode::CONFLICT, CallContext::Settlement { index }) => EscrowError::AlreadySettled {
            intent_id: intent_id.to_string(),
            index,
        },
        (status, _) if status.is_server_error() => {
            EscrowError::ProviderUnavailable(format!("provider returned {status}"))
        }
        (status, _) => EscrowError::ProviderRejected(format!("{status}: {body}")),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntentBody<'a> {
    amount: String,
    currency: &'a str,
    r#type: &'static str,
    settlement_method: &'static str,
    settlement_destination: &'a str,
    description: &'a str,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MilestoneBody<'a> {
    milestone_index: usize,
    description: &'a str,
    amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProofBody<'a> {
    proof_hash: &'a str,
    #[serde(rename = "proofURI")]
    proof_uri: &'a str,
    submitted_by: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SettlementBody {
    milestone_index: usize,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentData {
    id: String,
    escrow_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscrowData {
    id: String,
    escrow_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    milestones: Vec<EscrowMilestoneData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscrowMilestoneData {
    milestone_index: usize,
    #[serde(default)]
    description: String,
    #[serde(default)]
    amount: String,
    #[serde(default)]
    settled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettlementData {
    #[serde(default)]
    status: Option<String>,
}

#[async_trait]
impl EscrowClient for HttpEscrowClient {
    fn provider(&self) -> &'static str {
        "http"
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<IntentReceipt, EscrowError> {
        let mut metadata = request.metadata.clone();
        metadata.insert("releaseType".to_string(), "MILESTONE_LOCKED".to_string());

        let body = IntentBody {
            amount: money::format_minor(request.amount_minor),
            currency: &request.currency,
            r#type: "DELIVERY_VS_PAYMENT",
            settlement_method: "OFF_RAMP_MOCK",
            settlement_destination: &request.settlement_destination,
            description: &request.description,
            metadata,
        };

        let response = self
            .execute(
                self.http
                    .post(self.url("/api/v1/payment-intents"))
                    .header("Idempotency-Key", request.idempotency_key.as_str())
                    .json(&body),
                "",
                CallContext::Intent,
            )
            .await?;

        let envelope: Envelope<IntentData> = response
            .json()
            .await
            .map_err(|e| EscrowError::Protocol(format!("intent response decode failed: {e}")))?;

        Ok(IntentReceipt {
            intent_id: envelope.data.id,
            escrow_id: envelope.data.escrow_id,
            status: envelope.data.status.unwrap_or_else(|| "CREATED".to_string()),
        })
    }

    async fn get_escrow_details(&self, intent_id: &str) -> Result<EscrowDetails, EscrowError> {
        let response = self
            .execute(
                self.http
                    .get(self.url(&format!("/api/v1/payment-intents/{intent_id}/escrow"))),
                intent_id,
                CallContext::Intent,
            )
            .await?;

        let envelope: Envelope<EscrowData> = response
            .json()
            .await
            .map_err(|e| EscrowError::Protocol(format!("escrow response decode failed: {e}")))?;

        Ok(EscrowDetails {
            intent_id: envelope.data.id,
            escrow_id: envelope.data.escrow_id,
            status: envelope.data.status.unwrap_or_else(|| "ACTIVE".to_string()),
            milestones: envelope
                .data
                .milestones
                .into_iter()
                .map(|milestone| RemoteMilestone {
                    index: milestone.milestone_index,
                    description: milestone.description,
                    amount: milestone.amount,
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
        let body = MilestoneBody {
            milestone_index: request.index,
            description: &request.description,
            amount: money::format_minor(request.amount_minor),
        };

        self.execute(
            self.http
                .post(self.url(&format!(
                    "/api/v1/payment-intents/{intent_id}/escrow/milestones"
                )))
                .header("Idempotency-Key", request.idempotency_key.as_str())
                .json(&body),
            intent_id,
            CallContext::Milestone {
                index: request.index,
            },
        )
        .await?;

        Ok(())
    }

    async fn submit_proof(
        &self,
        intent_id: &str,
        proof: &ProofSubmission,
    ) -> Result<(), EscrowError> {
        let body = ProofBody {
            proof_hash: &proof.proof_hash,
            proof_uri: &proof.proof_uri,
            submitted_by: &proof.submitted_by,
        };

        self.execute(
            self.http
                .post(self.url(&format!(
                    "/api/v1/payment-intents/{intent_id}/escrow/delivery-proof"
                )))
                .header("Idempotency-Key", proof.proof_hash.as_str())
                .json(&body),
            intent_id,
            CallContext::Intent,
        )
        .await?;

        Ok(())
    }

    async fn settle_milestone(
        &self,
        intent_id: &str,
        index: usize,
    ) -> Result<SettlementReceipt, EscrowError> {
        let response = self
            .execute(
                self.http
                    .post(self.url(&format!(
                        "/api/v1/payment-intents/{intent_id}/escrow/settlement"
                    )))
                    .json(&SettlementBody {
                        milestone_index: index,
                    }),
                intent_id,
                CallContext::Settlement { index },
            )
            .await?;

        let data: SettlementData = response
            .json()
            .await
            .map_err(|e| EscrowError::Protocol(format!("settlement decode failed: {e}")))?;

        Ok(SettlementReceipt {
            status: data.status.unwrap_or_else(|| "SUCCESS".to_string()),
        })
    }

    async fn get_ledger_entries(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, EscrowError> {
        let response = self
            .execute(
                self.http
                    .get(self.url("/api/v1/payment-intents/account/ledger-entries"))
                    .query(&[("limit", limit), ("offset", offset)]),
                "",
                CallContext::Intent,
            )
            .await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EscrowError::Protocol(format!("ledger decode failed: {e}")))?;

        let entries = match body.get("data") {
            Some(serde_json::Value::Array(entries)) => entries.clone(),
            _ => match body {
                serde_json::Value::Array(entries) => entries,
                other => vec![other],
            },
        };

        Ok(LedgerPage {
            limit,
            offset,
            entries,
        })
    }
}
