use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Status of a call request.
///
/// ```text
/// ringing ──► accepted ──► ended
///    │
///    ├──► declined
///    ├──► missed
///    └──► cancelled
/// ```
///
/// Everything except `ringing` and `accepted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Missed,
    Cancelled,
    Ended,
}

impl CallStatus {
    pub const ALL: [CallStatus; 6] = [
        Self::Ringing,
        Self::Accepted,
        Self::Declined,
        Self::Missed,
        Self::Cancelled,
        Self::Ended,
    ];

    /// Statuses a call may be in for a write to `self` to land.
    pub fn predecessors(self) -> Vec<CallStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Declined | Self::Missed | Self::Cancelled | Self::Ended
        )
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Ringing,
                Self::Accepted | Self::Declined | Self::Missed | Self::Cancelled
            ) | (Self::Accepted, Self::Ended)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Missed => "missed",
            Self::Cancelled => "cancelled",
            Self::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Call {
    pub id: String,
    pub initiator_id: String,
    #[serde(default)]
    pub initiator_name: String,
    pub target_id: String,
    pub topic_id: String,
    pub session_id: String,
    pub audio_room: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which side of a call an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallParty {
    Initiator,
    Target,
}

impl Call {
    pub fn party_of(&self, actor_id: &str) -> Option<CallParty> {
        if actor_id == self.initiator_id {
            Some(CallParty::Initiator)
        } else if actor_id == self.target_id {
            Some(CallParty::Target)
        } else {
            None
        }
    }
}

/// Fields supplied by the initiator when a call is placed.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub initiator_id: String,
    pub initiator_name: String,
    pub target_id: String,
    pub topic_id: String,
    pub session_id: String,
    pub audio_room: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_by: Option<String>,
}

impl CallPatch {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ended_by: None,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartCallRequest {
    #[validate(length(min = 1))]
    pub student_id: String,
    #[serde(default)]
    pub student_name: Option<String>,
    #[validate(length(min = 1))]
    pub tutor_id: String,
    #[validate(length(min = 1))]
    pub topic_id: String,
}

#[derive(Debug, Serialize)]
pub struct StartCallResponse {
    pub call: Call,
    pub session_id: String,
    pub ring_timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct CallActionRequest {
    pub actor_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CallStatus; 6] = CallStatus::ALL;

    #[test]
    fn terminal_states_never_transition() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{:?} must not move to {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn accepted_is_the_only_non_terminal_exit_from_ringing() {
        let non_terminal_targets: Vec<_> = ALL
            .iter()
            .copied()
            .filter(|to| CallStatus::Ringing.can_transition_to(*to) && !to.is_terminal())
            .collect();
        assert_eq!(non_terminal_targets, vec![CallStatus::Accepted]);
    }

    #[test]
    fn accepted_only_ends() {
        assert!(CallStatus::Accepted.can_transition_to(CallStatus::Ended));
        assert!(!CallStatus::Accepted.can_transition_to(CallStatus::Missed));
        assert!(!CallStatus::Accepted.can_transition_to(CallStatus::Declined));
        assert!(!CallStatus::Ringing.can_transition_to(CallStatus::Ended));
    }

    #[test]
    fn predecessors_follow_the_graph() {
        assert_eq!(
            CallStatus::Missed.predecessors(),
            vec![CallStatus::Ringing]
        );
        assert_eq!(CallStatus::Ended.predecessors(), vec![CallStatus::Accepted]);
        assert!(CallStatus::Ringing.predecessors().is_empty());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&CallStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(CallStatus::Missed.as_str(), "missed");
    }
}
