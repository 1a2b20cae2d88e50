use crate::escrow::EscrowError;
use crate::types::{MilestoneStatus, ReportStatus};
use thiserror::Error;
use uuid::Uuid;

/// CivicWorks runtime errors.
#[derive(Debug, Error)]
pub enum CivicError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("report '{0}' not found")]
    ReportNotFound(Uuid),

    #[error("work order '{0}' not found")]
    OrderNotFound(Uuid),

    #[error("milestone index {index} out of bounds for work order '{order_id}'")]
    IndexOutOfBounds { order_id: Uuid, index: usize },

    #[error("milestone {index} is '{status}', expected 'pending'")]
    MilestoneNotPending {
        index: usize,
        status: MilestoneStatus,
    },

    #[error("milestone {index} is '{status}', expected 'review'")]
    MilestoneNotInReview {
        index: usize,
        status: MilestoneStatus,
    },

    #[error("milestone {index} cannot enter review while an earlier milestone is incomplete")]
    PriorMilestonesIncomplete { index: usize },

    #[error("payment intent already exists for work order '{0}'")]
    IntentAlreadyExists(Uuid),

    #[error("concurrent update conflict on work order '{0}'")]
    RevisionConflict(Uuid),

    #[error("milestone list for work order '{0}' changed shape; indices are immutable")]
    MilestoneShapeChanged(Uuid),

    #[error("invalid report status transition: '{from}' -> '{to}'")]
    InvalidStatusTransition {
        from: ReportStatus,
        to: ReportStatus,
    },

    #[error("storage error: {0}")]
    Store(String),

    #[error("escrow provider error: {0}")]
    Escrow(#[from] EscrowError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CivicError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}
