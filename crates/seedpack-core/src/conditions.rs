//! Status conditions
//!
//! A condition set holds at most one condition per type. Updates keep the
//! transition time unless the status flips and keep the update time unless
//! the reason or message changes, so re-applying an identical update is a
//! no-op and callers can skip persisting it.

use chrono::{DateTime, SubsecRound, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason carried by a condition that has been created but not evaluated yet
pub const REASON_INITIALIZED: &str = "ConditionInitialized";

const MESSAGE_INITIALIZED: &str =
    "The condition has been initialized but its semantic check has not been performed yet.";

/// Tri-state condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Condition types reported on an extension installation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    /// The referenced registration and seed resolve and the chart renders
    Valid,
    /// The rendered chart has been handed to the seed
    Installed,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "Valid",
            Self::Installed => "Installed",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, timestamped status field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. `Valid`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Current status
    pub status: ConditionStatus,

    /// Machine-readable CamelCase reason
    pub reason: String,

    /// Human-readable details
    pub message: String,

    /// Last time the status changed
    pub last_transition_time: DateTime<Utc>,

    /// Last time the reason or message changed
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    /// Create an initialized condition of the given type
    pub fn init(type_: ConditionType) -> Self {
        Self::init_at(type_, now())
    }

    pub fn init_at(type_: ConditionType, at: DateTime<Utc>) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status: ConditionStatus::Unknown,
            reason: REASON_INITIALIZED.to_string(),
            message: MESSAGE_INITIALIZED.to_string(),
            last_transition_time: at,
            last_update_time: at,
        }
    }

    /// Return an updated copy of this condition
    pub fn updated(
        &self,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.updated_at(status, reason, message, now())
    }

    /// Same as [`Condition::updated`] with an explicit clock reading
    pub fn updated_at(
        &self,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        let reason = reason.into();
        let message = message.into();

        let last_transition_time = if self.status == status {
            self.last_transition_time
        } else {
            at
        };
        let last_update_time = if self.reason == reason && self.message == message {
            self.last_update_time
        } else {
            at
        };

        Self {
            type_: self.type_.clone(),
            status,
            reason,
            message,
            last_transition_time,
            last_update_time,
        }
    }

    /// Check if this condition is of the given type
    pub fn is(&self, type_: ConditionType) -> bool {
        self.type_ == type_.as_str()
    }
}

/// Find a condition by type
pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.is(type_))
}

/// Return the condition of the given type, or a freshly initialized one
pub fn get_or_init(conditions: &[Condition], type_: ConditionType) -> Condition {
    find(conditions, type_)
        .cloned()
        .unwrap_or_else(|| Condition::init(type_))
}

/// Merge `updates` into `existing`
///
/// Conditions are replaced by type in place, new types are appended in the
/// order given. When a replacement keeps the existing status, the existing
/// transition time is kept as well.
pub fn merge_conditions(existing: &[Condition], updates: &[Condition]) -> Vec<Condition> {
    let mut merged = existing.to_vec();

    for update in updates {
        match merged.iter_mut().find(|c| c.type_ == update.type_) {
            Some(current) => {
                let mut next = update.clone();
                if current.status == next.status {
                    next.last_transition_time = current.last_transition_time;
                }
                *current = next;
            }
            None => merged.push(update.clone()),
        }
    }

    merged
}

/// Kubernetes persists condition times with second precision
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_init_is_unknown() {
        let c = Condition::init_at(ConditionType::Valid, at(0));
        assert_eq!(c.type_, "Valid");
        assert_eq!(c.status, ConditionStatus::Unknown);
        assert_eq!(c.reason, REASON_INITIALIZED);
    }

    #[test]
    fn test_identical_update_keeps_timestamps() {
        let c = Condition::init_at(ConditionType::Valid, at(0));
        let first = c.updated_at(ConditionStatus::True, "RegistrationValid", "ok", at(10));
        let second = first.updated_at(ConditionStatus::True, "RegistrationValid", "ok", at(20));

        assert_eq!(first, second);
        assert_eq!(second.last_transition_time, at(10));
        assert_eq!(second.last_update_time, at(10));
    }

    #[test]
    fn test_status_change_moves_transition_time() {
        let c = Condition::init_at(ConditionType::Installed, at(0));
        let pending = c.updated_at(ConditionStatus::False, "InstallationPending", "pending", at(5));
        assert_eq!(pending.last_transition_time, at(5));

        let failed = pending.updated_at(ConditionStatus::False, "InstallationFailed", "boom", at(9));
        assert_eq!(failed.last_transition_time, at(5));
        assert_eq!(failed.last_update_time, at(9));
    }

    #[test]
    fn test_get_or_init() {
        let existing = vec![Condition::init_at(ConditionType::Valid, at(0)).updated_at(
            ConditionStatus::True,
            "RegistrationValid",
            "ok",
            at(1),
        )];

        let valid = get_or_init(&existing, ConditionType::Valid);
        assert_eq!(valid.status, ConditionStatus::True);

        let installed = get_or_init(&existing, ConditionType::Installed);
        assert_eq!(installed.status, ConditionStatus::Unknown);
        assert!(installed.is(ConditionType::Installed));
    }

    #[test]
    fn test_merge_replaces_by_type_and_appends() {
        let foreign = Condition {
            type_: "Healthy".to_string(),
            ..Condition::init_at(ConditionType::Valid, at(0))
        };
        let valid = Condition::init_at(ConditionType::Valid, at(0));
        let existing = vec![foreign.clone(), valid.clone()];

        let new_valid = valid.updated_at(ConditionStatus::True, "RegistrationValid", "ok", at(3));
        let installed = Condition::init_at(ConditionType::Installed, at(3));

        let merged = merge_conditions(&existing, &[new_valid.clone(), installed.clone()]);

        assert_eq!(merged, vec![foreign, new_valid, installed]);
    }

    #[test]
    fn test_merge_keeps_transition_time_for_same_status() {
        let current = Condition::init_at(ConditionType::Valid, at(0)).updated_at(
            ConditionStatus::True,
            "RegistrationValid",
            "ok",
            at(1),
        );
        let stale_copy = Condition {
            last_transition_time: at(50),
            message: "still ok".to_string(),
            ..current.clone()
        };

        let merged = merge_conditions(&[current], &[stale_copy]);
        assert_eq!(merged[0].last_transition_time, at(1));
        assert_eq!(merged[0].message, "still ok");
    }

    #[test]
    fn test_status_serializes_as_kubernetes_strings() {
        let c = Condition::init_at(ConditionType::Valid, at(0));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["status"], "Unknown");
        assert_eq!(json["type"], "Valid");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
