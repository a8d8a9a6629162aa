use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use coffre_collections::mail::mailbox::{Mailbox, MailboxEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("can't perform this transition")]
    ForbiddenTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxPerm {
    ReadOnly,
    ReadWrite,
}

/// The selected mailbox of a session, with its own subscription to the
/// mailbox events.
pub struct Selected {
    pub mailbox: Arc<Mailbox>,
    pub perm: MailboxPerm,
    pub events: broadcast::Receiver<MailboxEvent>,
}

impl Selected {
    pub fn new(mailbox: Arc<Mailbox>, perm: MailboxPerm) -> Self {
        let events = mailbox.subscribe();
        Self {
            mailbox,
            perm,
            events,
        }
    }
}

pub enum State {
    NotAuthenticated,
    Authenticated,
    Selected(Selected),
    Logout,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "NotAuthenticated"),
            Self::Authenticated => write!(f, "Authenticated"),
            Self::Selected(s) => write!(f, "Selected({}, {:?})", s.mailbox.id(), s.perm),
            Self::Logout => write!(f, "Logout"),
        }
    }
}

pub enum Transition {
    Authenticate,
    Select(Selected),
    Unselect,
    Logout,
}

// See RFC3501 section 3.
// https://datatracker.ietf.org/doc/html/rfc3501#page-13
impl State {
    pub fn apply(&mut self, tr: Transition) -> Result<(), Error> {
        let new_state = match (&*self, tr) {
            (State::NotAuthenticated, Transition::Authenticate) => State::Authenticated,
            (State::Authenticated | State::Selected(_), Transition::Select(selected)) => {
                State::Selected(selected)
            }
            (State::Selected(_), Transition::Unselect) => State::Authenticated,
            (_, Transition::Logout) => State::Logout,
            _ => return Err(Error::ForbiddenTransition),
        };
        tracing::trace!(from=?self, to=?new_state, "session state transition");
        *self = new_state;
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, State::Authenticated | State::Selected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_protocol() {
        let mut state = State::NotAuthenticated;
        assert_eq!(state.apply(Transition::Unselect), Err(Error::ForbiddenTransition));
        assert!(!state.is_authenticated());

        state.apply(Transition::Authenticate).unwrap();
        assert!(state.is_authenticated());
        assert_eq!(state.apply(Transition::Authenticate), Err(Error::ForbiddenTransition));
        assert_eq!(state.apply(Transition::Unselect), Err(Error::ForbiddenTransition));

        state.apply(Transition::Logout).unwrap();
        assert!(matches!(state, State::Logout));
        assert_eq!(state.apply(Transition::Authenticate), Err(Error::ForbiddenTransition));
    }
}
