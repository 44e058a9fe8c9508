//! Quote status state machine.
//!
//! `Quote::can_transition_to` holds the transition table; this module adds the
//! guards (items, validity window, capabilities, who may trigger what).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditAction;
use crate::domain::actor::{Actor, Capability};
use crate::domain::quote::{Quote, QuoteStatus};
use crate::errors::DomainError;

/// Who asked for a transition. Expiry is only ever requested by the system.
#[derive(Clone, Copy, Debug)]
pub enum TransitionTrigger<'a> {
    Actor(&'a Actor),
    System,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionRejection {
    TerminalState,
    NotAllowed,
    NoItems,
    ValidityElapsed,
    NotYetDue,
    MissingCapability(Capability),
    SystemOnly,
}

impl TransitionRejection {
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::MissingCapability(_) | Self::SystemOnly)
    }
}

impl fmt::Display for TransitionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerminalState => f.write_str("quote is in a terminal status"),
            Self::NotAllowed => f.write_str("transition is not part of the lifecycle"),
            Self::NoItems => f.write_str("quote has no items"),
            Self::ValidityElapsed => f.write_str("quote validity has elapsed"),
            Self::NotYetDue => f.write_str("quote validity has not elapsed yet"),
            Self::MissingCapability(capability) => {
                write!(f, "actor lacks the `{capability}` capability")
            }
            Self::SystemOnly => f.write_str("only the system may expire quotes"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: QuoteStatus,
    pub to: QuoteStatus,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn audit_action(&self) -> AuditAction {
        match self.to {
            QuoteStatus::Accepted => AuditAction::Approve,
            QuoteStatus::Rejected => AuditAction::Reject,
            QuoteStatus::Expired => AuditAction::Expire,
            QuoteStatus::Draft | QuoteStatus::Pending => AuditAction::Update,
        }
    }
}

pub fn check_transition(
    quote: &Quote,
    next: QuoteStatus,
    trigger: &TransitionTrigger<'_>,
    now: DateTime<Utc>,
) -> Result<(), DomainError> {
    let reject = |reason| DomainError::InvalidQuoteTransition { from: quote.status, to: next, reason };

    if quote.status.is_terminal() {
        return Err(reject(TransitionRejection::TerminalState));
    }
    if !quote.can_transition_to(next) {
        return Err(reject(TransitionRejection::NotAllowed));
    }

    match (quote.status, next) {
        (_, QuoteStatus::Expired) => {
            if let TransitionTrigger::Actor(_) = trigger {
                return Err(reject(TransitionRejection::SystemOnly));
            }
            // Only drafts may be empty, so an empty draft stays a draft.
            if quote.items.is_empty() {
                return Err(reject(TransitionRejection::NoItems));
            }
            if now < quote.valid_until {
                return Err(reject(TransitionRejection::NotYetDue));
            }
        }
        (QuoteStatus::Draft, QuoteStatus::Pending) => {
            require(trigger, Capability::Write).map_err(reject)?;
            if quote.items.is_empty() {
                return Err(reject(TransitionRejection::NoItems));
            }
            if now >= quote.valid_until {
                return Err(reject(TransitionRejection::ValidityElapsed));
            }
        }
        (QuoteStatus::Pending, QuoteStatus::Accepted) => {
            require(trigger, Capability::Approve).map_err(reject)?;
        }
        (QuoteStatus::Pending, QuoteStatus::Rejected) => {
            require(trigger, Capability::Write).map_err(reject)?;
        }
        _ => return Err(reject(TransitionRejection::NotAllowed)),
    }

    Ok(())
}

fn require(
    trigger: &TransitionTrigger<'_>,
    capability: Capability,
) -> Result<(), TransitionRejection> {
    match trigger {
        TransitionTrigger::Actor(actor) if actor.has(capability) => Ok(()),
        TransitionTrigger::Actor(_) => Err(TransitionRejection::MissingCapability(capability)),
        TransitionTrigger::System => Err(TransitionRejection::NotAllowed),
    }
}
