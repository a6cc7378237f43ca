//! Shared types used across the snapshot, restore and clone resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Condition types reported by snapshots, restores and clones
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// The operation is actively working
    Progressing,
    /// The operation's result is usable
    Ready,
    /// The operation failed permanently
    Failure,
}

/// A condition on an operation's status
///
/// `reason` carries the human-readable explanation. Conditions are replaced
/// only when their status (and optionally reason) changes, so the transition
/// timestamp survives identical recomputations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Human-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Optional detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(type_: ConditionType, status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: String::new(),
            last_transition_time: Utc::now(),
        }
    }

    /// Progressing condition
    pub fn progressing(status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self::new(ConditionType::Progressing, status, reason)
    }

    /// Ready condition
    pub fn ready(status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self::new(ConditionType::Ready, status, reason)
    }

    /// Failure condition
    pub fn failure(status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self::new(ConditionType::Failure, status, reason)
    }
}

/// Merge `condition` into `conditions`.
///
/// An existing condition of the same type is replaced only when its status
/// differs, or when `include_reason` is set and its reason differs.
pub fn update_condition(conditions: &mut Vec<Condition>, condition: Condition, include_reason: bool) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status
                || (include_reason && existing.reason != condition.reason)
            {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check whether a condition of the given type has the given status
pub fn has_condition(
    conditions: &[Condition],
    type_: ConditionType,
    status: ConditionStatus,
) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == status)
}

/// Error recorded on a snapshot or its content
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// When the error was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationError {
    /// Create an error stamped with the current time
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            time: Some(Utc::now()),
            message: Some(message.into()),
        }
    }

    /// Message text, empty when unset
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}
