use trunkline_core::types::CampaignStatus;
use trunkline_core::{TrunklineError, TrunklineResult};

/// Describes a single valid campaign state transition.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: CampaignStatus,
    pub to: CampaignStatus,
    pub trigger: &'static str,
}

/// Guards the campaign lifecycle by enforcing the finite transition set:
///
/// ```text
/// Draft -> Scheduled -> Sending -> {Completed | Paused | Cancelled | Failed}
/// Paused -> {Sending | Cancelled}
/// ```
#[derive(Debug, Clone)]
pub struct CampaignStateMachine {
    transitions: Vec<StateTransition>,
}

impl CampaignStateMachine {
    pub fn new() -> Self {
        let transitions = vec![
            StateTransition {
                from: CampaignStatus::Draft,
                to: CampaignStatus::Scheduled,
                trigger: "start",
            },
            StateTransition {
                from: CampaignStatus::Scheduled,
                to: CampaignStatus::Sending,
                trigger: "trigger",
            },
            StateTransition {
                from: CampaignStatus::Scheduled,
                to: CampaignStatus::Cancelled,
                trigger: "cancel_before_send",
            },
            StateTransition {
                from: CampaignStatus::Sending,
                to: CampaignStatus::Paused,
                trigger: "pause",
            },
            StateTransition {
                from: CampaignStatus::Sending,
                to: CampaignStatus::Cancelled,
                trigger: "cancel",
            },
            StateTransition {
                from: CampaignStatus::Sending,
                to: CampaignStatus::Completed,
                trigger: "all_sent",
            },
            StateTransition {
                from: CampaignStatus::Sending,
                to: CampaignStatus::Failed,
                trigger: "execution_error",
            },
            StateTransition {
                from: CampaignStatus::Paused,
                to: CampaignStatus::Sending,
                trigger: "resume",
            },
            StateTransition {
                from: CampaignStatus::Paused,
                to: CampaignStatus::Cancelled,
                trigger: "cancel_while_paused",
            },
        ];
        Self { transitions }
    }

    /// Returns `true` if the transition is allowed.
    pub fn can_transition(&self, from: CampaignStatus, to: CampaignStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Validate a transition, returning an error naming the states when it
    /// is not permitted.
    pub fn check(&self, from: CampaignStatus, to: CampaignStatus) -> TrunklineResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(TrunklineError::Campaign(format!(
                "invalid campaign transition {from:?} -> {to:?}"
            )))
        }
    }
}

impl Default for CampaignStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
