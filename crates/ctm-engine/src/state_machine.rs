//! Charge lifecycle state machine.
//!
//! # Design
//!
//! [`transition`] is a pure function from `(state, event)` to the next
//! state. It performs no I/O and mutates nothing; applying the result
//! atomically is the store's job ([`crate::store::ChargeStore`]'s guarded
//! commit). Two invariants:
//!
//! 1. **Legal transitions only.** Anything outside the table returns
//!    [`TransitionError`]; callers log and drop the event — the stored
//!    state stays authoritative.
//! 2. **Terminal states are final.** No event moves a charge out of
//!    `Paid` or `Dead`.
//!
//! # State diagram
//!
//! ```text
//!              GatewayAccepted            WebhookPaid
//!   Created ───────────────────► Pending ────────────► Paid (terminal)
//!      │                            │
//!      │ GatewayRejected            │ WebhookFailed
//!      ▼                            ▼
//!   Failed ◄────────────────────────┘
//!      │  RetryRequested (retry_count < max)
//!      ├────────────────────► Retrying ── GatewayAccepted ──► Pending
//!      │  RetryExhausted
//!      └────────────────────► Dead (terminal)
//! ```

use serde::{Deserialize, Serialize};

/// Bounded retry budget for failed charges.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

// ---------------------------------------------------------------------------
// ChargeState
// ---------------------------------------------------------------------------

/// All valid lifecycle states of a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeState {
    /// Persisted, gateway not yet called (or call outcome unknown).
    Created,
    /// Gateway accepted the charge; awaiting settlement webhooks.
    Pending,
    /// Settled. **Terminal.**
    Paid,
    /// Gateway rejected or settlement failed; retry may follow.
    Failed,
    /// A retry was granted; awaiting gateway re-acceptance.
    Retrying,
    /// Retries exhausted. **Terminal.**
    Dead,
}

impl ChargeState {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeState::Created => "CREATED",
            ChargeState::Pending => "PENDING",
            ChargeState::Paid => "PAID",
            ChargeState::Failed => "FAILED",
            ChargeState::Retrying => "RETRYING",
            ChargeState::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(ChargeState::Created),
            "PENDING" => Some(ChargeState::Pending),
            "PAID" => Some(ChargeState::Paid),
            "FAILED" => Some(ChargeState::Failed),
            "RETRYING" => Some(ChargeState::Retrying),
            "DEAD" => Some(ChargeState::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChargeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ChargeEvent
// ---------------------------------------------------------------------------

/// Events that drive charge transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeEvent {
    /// The gateway accepted a submission (first attempt or retry).
    GatewayAccepted,
    /// The gateway rejected the submission outright.
    GatewayRejected,
    /// Settlement webhook: paid.
    WebhookPaid,
    /// Settlement webhook: failed.
    WebhookFailed,
    /// A retry of a failed charge was requested.
    RetryRequested,
    /// The retry budget is spent; the charge is abandoned.
    RetryExhausted,
}

impl ChargeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeEvent::GatewayAccepted => "gateway_accepted",
            ChargeEvent::GatewayRejected => "gateway_rejected",
            ChargeEvent::WebhookPaid => "webhook_paid",
            ChargeEvent::WebhookFailed => "webhook_failed",
            ChargeEvent::RetryRequested => "retry_requested",
            ChargeEvent::RetryExhausted => "retry_exhausted",
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// Returned when an event cannot legally be applied in the current state.
///
/// For webhook-driven events this is an expected condition (stale or
/// out-of-order delivery) and is logged and swallowed by the reconciler.
/// For orchestrator-driven events it indicates a caller bug or a lost race
/// and propagates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal charge transition: {from} + {event}")]
pub struct TransitionError {
    pub from: ChargeState,
    pub event: &'static str,
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

/// The transition table. `retry_count`/`max_retries` guard the single
/// guarded edge, `(Failed, RetryRequested)`.
pub fn transition(
    current: ChargeState,
    event: ChargeEvent,
    retry_count: i32,
    max_retries: i32,
) -> Result<ChargeState, TransitionError> {
    use ChargeEvent::*;
    use ChargeState::*;

    let next = match (current, event) {
        (Created, GatewayAccepted) => Pending,
        (Created, GatewayRejected) => Failed,
        (Pending, WebhookPaid) => Paid,
        (Pending, WebhookFailed) => Failed,
        (Failed, RetryRequested) if retry_count < max_retries => Retrying,
        (Retrying, GatewayAccepted) => Pending,
        (Failed, RetryExhausted) => Dead,
        (from, event) => {
            return Err(TransitionError {
                from,
                event: event.as_str(),
            })
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
