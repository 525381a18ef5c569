//! Document lifecycle states and the transitions allowed between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentState {
    Created,
    PendingGateway,
    Sent,
    Authorized,
    Rejected,
    Annulled,
}

impl DocumentState {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentState::Created => "CREATED",
            DocumentState::PendingGateway => "PENDING_GATEWAY",
            DocumentState::Sent => "SENT",
            DocumentState::Authorized => "AUTHORIZED",
            DocumentState::Rejected => "REJECTED",
            DocumentState::Annulled => "ANNULLED",
        }
    }

    pub fn can_transition_to(self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Created, Sent)
                | (Created, Authorized)
                | (Created, PendingGateway)
                | (Created, Annulled)
                | (PendingGateway, Sent)
                | (PendingGateway, Authorized)
                | (Sent, Authorized)
                | (Sent, Rejected)
                | (Authorized, Annulled)
        )
    }

    pub fn is_annullable(self) -> bool {
        self.can_transition_to(DocumentState::Annulled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Annulled | DocumentState::Rejected)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for an operation, passed explicitly into every lifecycle call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: String,
    #[serde(default)]
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActorContext {
    pub fn new(user_id: impl Into<String>, ip: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ip,
            timestamp: Utc::now(),
        }
    }

    pub fn system() -> Self {
        Self::new("system", None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: Option<DocumentState>,
    pub to: DocumentState,
    pub at: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl StateChange {
    pub fn new(
        from: Option<DocumentState>,
        to: DocumentState,
        actor: &ActorContext,
        note: Option<String>,
    ) -> Self {
        Self {
            from,
            to,
            at: Utc::now(),
            actor: actor.user_id.clone(),
            ip: actor.ip.clone(),
            note,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid state transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DocumentState,
    pub to: DocumentState,
}

/// Applies `to` onto `state`, appending to `history`. Fails without touching
/// either when the transition is not allowed.
pub fn transition(
    state: &mut DocumentState,
    history: &mut Vec<StateChange>,
    to: DocumentState,
    actor: &ActorContext,
    note: Option<String>,
) -> Result<(), InvalidTransition> {
    if !state.can_transition_to(to) {
        return Err(InvalidTransition { from: *state, to });
    }
    history.push(StateChange::new(Some(*state), to, actor, note));
    *state = to;
    Ok(())
}
