use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Verified,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "Pending"),
            ApprovalStatus::Verified => write!(f, "Verified"),
            ApprovalStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

/// A rent payment recorded by an agent, awaiting manager review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Collection {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub amount: f64,
    pub collected_on: Option<NaiveDate>,
    #[serde(default)]
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

/// The review fields of a collection, captured as one unit so an action can
/// be reverted to exactly what it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ApprovalState {
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

impl ApprovalState {
    pub fn verified(approver: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: ApprovalStatus::Verified,
            approved_by: Some(approver.into()),
            approved_at: Some(at),
            rejection_reason: None,
        }
    }

    pub fn rejected(approver: impl Into<String>, at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            status: ApprovalStatus::Rejected,
            approved_by: Some(approver.into()),
            approved_at: Some(at),
            rejection_reason: Some(reason.into()),
        }
    }

    /// Column patch that writes these fields, nulls included.
    pub fn to_patch(&self) -> Value {
        json!({
            "status": self.status,
            "approved_by": self.approved_by,
            "approved_at": self.approved_at,
            "rejection_reason": self.rejection_reason,
        })
    }
}

impl Collection {
    pub fn approval(&self) -> ApprovalState {
        ApprovalState {
            status: self.status,
            approved_by: self.approved_by.clone(),
            approved_at: self.approved_at,
            rejection_reason: self.rejection_reason.clone(),
        }
    }

    pub fn set_approval(&mut self, state: ApprovalState) {
        self.status = state.status;
        self.approved_by = state.approved_by;
        self.approved_at = state.approved_at;
        self.rejection_reason = state.rejection_reason;
    }

    pub fn display_amount(&self) -> String {
        format!("{:.2}", self.amount)
    }
}
