use serde::Serialize;

/// Lifecycle of one PeerConnection
///
/// Transitions only move forward: Initializing, then OfferSent or
/// OfferReceived, then AnswerReceived or AnswerSent, then Connected.
/// Closed and Failed are terminal and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Idle,
    Initializing,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            NegotiationState::Idle => 0,
            NegotiationState::Initializing => 1,
            NegotiationState::OfferSent | NegotiationState::OfferReceived => 2,
            NegotiationState::AnswerSent | NegotiationState::AnswerReceived => 3,
            NegotiationState::Connected => 4,
            NegotiationState::Closed | NegotiationState::Failed => 5,
        }
    }

    /// Whether moving from `self` to `next` is a forward step
    pub fn can_advance_to(self, next: NegotiationState) -> bool {
        next.rank() > self.rank()
    }
}

impl Default for NegotiationState {
    fn default() -> Self {
        NegotiationState::Idle
    }
}
