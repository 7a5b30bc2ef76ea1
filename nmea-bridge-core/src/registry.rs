//! Source registry: the single owner of "which modem are we reading from".
//!
//! # States
//!
//! ```text
//!   bound:   None | ActiveBinding        (what the poll loop reads)
//!   pending: None | PendingBind          (bind attempt in flight)
//! ```
//!
//! Both may be set at once: a renumbered modem that shows up before the old
//! identity's removal is seen keeps the old binding live until the new one
//! commits. At most one source is ever *bound*.
//!
//! The registry performs no I/O. Callers issue the upstream setup call for
//! the ticket returned by [`SourceRegistry::bind`] and report back through
//! [`SourceRegistry::complete`] or [`SourceRegistry::fail`].

use chrono::{DateTime, Utc};

use crate::types::{ActiveBinding, BindTicket, LocationSources, SourceId};

/// Attempts before a bind gives up when not configured otherwise.
pub const DEFAULT_BIND_ATTEMPTS: u32 = 10;

/// A bind attempt sequence that has not committed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBind {
    pub ticket: BindTicket,
    pub identity: SourceId,
    pub capabilities: LocationSources,
    /// Attempts already made (failed) for this ticket.
    pub failures: u32,
}

/// Outcome of [`SourceRegistry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindRequest {
    /// `identity` is the bound source; nothing to do.
    AlreadyBound,
    /// A bind for `identity` is already in flight; nothing to do.
    AlreadyPending,
    /// The capability snapshot lacks the NMEA bit.
    NotCapable,
    /// Start a new attempt sequence for this ticket. `superseded` names an
    /// older in-flight attempt whose results will now be discarded.
    Start {
        ticket: BindTicket,
        superseded: Option<SourceId>,
    },
}

/// Outcome of [`SourceRegistry::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; `attempt` is the 1-based number of the next attempt.
    Retry { attempt: u32 },
    /// Attempts exhausted; the pending bind was dropped.
    GiveUp { attempts: u32 },
    /// The ticket is no longer in flight.
    Stale,
}

/// Outcome of [`SourceRegistry::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Commit {
    /// The pending source is now bound. `replaced` is the previously bound
    /// identity, if any.
    Bound { replaced: Option<SourceId> },
    /// The ticket is no longer in flight (unbound or superseded meanwhile).
    Stale,
}

/// What [`SourceRegistry::unbind`] cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unbound {
    pub binding: bool,
    pub pending: bool,
}

impl Unbound {
    pub fn changed(self) -> bool {
        self.binding || self.pending
    }
}

#[derive(Debug)]
pub struct SourceRegistry {
    bound: Option<ActiveBinding>,
    pending: Option<PendingBind>,
    next_ticket: u64,
    max_attempts: u32,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ATTEMPTS)
    }
}

impl SourceRegistry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            bound: None,
            pending: None,
            next_ticket: 1,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Requests a binding to `identity`.
    ///
    /// Repeated requests for the bound or in-flight identity are no-ops, so
    /// duplicate add-notifications never produce duplicate setup calls.
    pub fn bind(&mut self, identity: &SourceId, capabilities: LocationSources) -> BindRequest {
        if !capabilities.supports_nmea() {
            return BindRequest::NotCapable;
        }
        if self.bound.as_ref().is_some_and(|b| &b.identity == identity) {
            return BindRequest::AlreadyBound;
        }
        if self.pending.as_ref().is_some_and(|p| &p.identity == identity) {
            return BindRequest::AlreadyPending;
        }

        let ticket = BindTicket(self.next_ticket);
        self.next_ticket += 1;
        let superseded = self
            .pending
            .replace(PendingBind {
                ticket,
                identity: identity.clone(),
                capabilities,
                failures: 0,
            })
            .map(|p| p.identity);
        BindRequest::Start { ticket, superseded }
    }

    /// The in-flight attempt for `ticket`, if it is still wanted.
    pub fn pending_for(&self, ticket: BindTicket) -> Option<&PendingBind> {
        self.pending.as_ref().filter(|p| p.ticket == ticket)
    }

    pub fn pending(&self) -> Option<&PendingBind> {
        self.pending.as_ref()
    }

    /// Records a failed setup call for `ticket`.
    pub fn fail(&mut self, ticket: BindTicket) -> RetryDecision {
        let Some(pending) = self.pending.as_mut().filter(|p| p.ticket == ticket) else {
            return RetryDecision::Stale;
        };
        pending.failures += 1;
        if pending.failures >= self.max_attempts {
            let attempts = pending.failures;
            self.pending = None;
            return RetryDecision::GiveUp { attempts };
        }
        RetryDecision::Retry {
            attempt: pending.failures + 1,
        }
    }

    /// Commits the pending bind for `ticket` after a successful setup call.
    pub fn complete(&mut self, ticket: BindTicket, now: DateTime<Utc>) -> Commit {
        if self.pending_for(ticket).is_none() {
            return Commit::Stale;
        }
        let Some(pending) = self.pending.take() else {
            return Commit::Stale;
        };
        let replaced = self
            .bound
            .replace(ActiveBinding {
                identity: pending.identity,
                capabilities: pending.capabilities,
                bound_since: now,
            })
            .map(|b| b.identity);
        Commit::Bound { replaced }
    }

    /// Forgets `identity` if it is bound or in flight. Never touches any
    /// other source.
    pub fn unbind(&mut self, identity: &SourceId) -> Unbound {
        let mut cleared = Unbound::default();
        if self.bound.as_ref().is_some_and(|b| &b.identity == identity) {
            self.bound = None;
            cleared.binding = true;
        }
        if self.pending.as_ref().is_some_and(|p| &p.identity == identity) {
            self.pending = None;
            cleared.pending = true;
        }
        cleared
    }

    pub fn current_binding(&self) -> Option<&ActiveBinding> {
        self.bound.as_ref()
    }

    pub fn is_bound_to(&self, identity: &SourceId) -> bool {
        self.bound.as_ref().is_some_and(|b| &b.identity == identity)
    }

    /// Neither bound nor binding.
    pub fn is_idle(&self) -> bool {
        self.bound.is_none() && self.pending.is_none()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
