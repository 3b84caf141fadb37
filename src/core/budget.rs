//! Budget limits and enforcement for research sessions.
//!
//! Every provider call reserves its estimated cost before it is made and
//! commits the actual cost afterwards. Reservation is an atomic
//! check-and-add, so concurrent calls within one hop can never push a session
//! (or the process as a whole) past its ceiling.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tolerance for floating point cost arithmetic
const COST_EPSILON: f64 = 1e-9;

/// Budget limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Spend ceiling per session in USD (default: 1.00)
    #[serde(default = "default_session_limit")]
    pub session_limit_usd: f64,

    /// Spend ceiling across all sessions in this process in USD (default: 10.00)
    #[serde(default = "default_global_limit")]
    pub global_limit_usd: f64,

    /// Fraction of the session limit at which a warning is raised (default: 0.8)
    #[serde(default = "default_warn_fraction")]
    pub warn_fraction: f64,
}

fn default_session_limit() -> f64 {
    1.0
}
fn default_global_limit() -> f64 {
    10.0
}
fn default_warn_fraction() -> f64 {
    0.8
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            session_limit_usd: default_session_limit(),
            global_limit_usd: default_global_limit(),
            warn_fraction: default_warn_fraction(),
        }
    }
}

/// Budget violation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BudgetExceeded {
    #[error("Session budget exceeded: ${committed:.4} committed + ${reserved:.4} reserved + ${requested:.4} requested > ${limit:.4}")]
    Session {
        committed: f64,
        reserved: f64,
        requested: f64,
        limit: f64,
    },

    #[error("Global budget exceeded: ${committed:.4} committed + ${reserved:.4} reserved + ${requested:.4} requested > ${limit:.4}")]
    Global {
        committed: f64,
        reserved: f64,
        requested: f64,
        limit: f64,
    },
}

/// Point-in-time view of a session's spend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Cost committed by completed calls
    pub committed_usd: f64,

    /// Cost reserved by calls in flight
    pub reserved_usd: f64,

    /// Session ceiling
    pub limit_usd: f64,

    /// Cost committed across all sessions
    pub global_committed_usd: f64,

    /// Whether the session may not start further calls
    pub exhausted: bool,
}

impl BudgetSnapshot {
    /// Budget left for new reservations
    pub fn remaining_usd(&self) -> f64 {
        (self.limit_usd - self.committed_usd - self.reserved_usd).max(0.0)
    }

    /// Fraction of the session limit already committed
    pub fn used_fraction(&self) -> f64 {
        if self.limit_usd <= 0.0 {
            1.0
        } else {
            self.committed_usd / self.limit_usd
        }
    }
}

#[derive(Debug, Default)]
struct SessionLedger {
    limit_usd: Option<f64>,
    committed: f64,
    reserved: f64,
    denied: bool,
    warned: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    sessions: HashMap<Uuid, SessionLedger>,
    global_committed: f64,
    global_reserved: f64,
}

/// Shared budget guard
///
/// One guard is shared by every session in the process. A session that has
/// been refused once stays exhausted, so the loop can stop cleanly instead of
/// limping along on the scraps of its budget.
#[derive(Debug)]
pub struct BudgetGuard {
    limits: BudgetLimits,
    ledger: Mutex<Ledger>,
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new(BudgetLimits::default())
    }
}

impl BudgetGuard {
    /// Create a guard with the given limits
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Configured limits
    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Override the ceiling of one session
    pub fn set_session_limit(&self, session: Uuid, limit_usd: f64) {
        let mut ledger = self.lock();
        ledger.sessions.entry(session).or_default().limit_usd = Some(limit_usd.max(0.0));
    }

    /// Reserve `estimated_usd` for a call, or explain why not
    pub fn try_reserve(&self, session: Uuid, estimated_usd: f64) -> Result<(), BudgetExceeded> {
        let estimated = estimated_usd.max(0.0);
        let default_limit = self.limits.session_limit_usd;
        let global_limit = self.limits.global_limit_usd;

        let mut ledger = self.lock();
        let (global_committed, global_reserved) = (ledger.global_committed, ledger.global_reserved);
        let entry = ledger.sessions.entry(session).or_default();
        let limit = entry.limit_usd.unwrap_or(default_limit);

        let violation = if entry.committed + entry.reserved + estimated > limit + COST_EPSILON {
            Some(BudgetExceeded::Session {
                committed: entry.committed,
                reserved: entry.reserved,
                requested: estimated,
                limit,
            })
        } else if global_committed + global_reserved + estimated > global_limit + COST_EPSILON {
            Some(BudgetExceeded::Global {
                committed: global_committed,
                reserved: global_reserved,
                requested: estimated,
                limit: global_limit,
            })
        } else {
            None
        };

        if let Some(violation) = violation {
            entry.denied = true;
            warn!(%session, error = %violation, "Budget reservation denied");
            return Err(violation);
        }

        entry.reserved += estimated;
        ledger.global_reserved += estimated;
        debug!(%session, estimated, "Budget reserved");
        Ok(())
    }

    /// Reserve `estimated_usd` for a call. Returns false if it would exceed a ceiling.
    pub fn reserve(&self, session: Uuid, estimated_usd: f64) -> bool {
        self.try_reserve(session, estimated_usd).is_ok()
    }

    /// Settle a reservation with the actual cost of the call
    pub fn commit(&self, session: Uuid, reserved_usd: f64, actual_usd: f64) {
        let reserved = reserved_usd.max(0.0);
        let actual = actual_usd.max(0.0);

        let mut ledger = self.lock();
        ledger.global_reserved = (ledger.global_reserved - reserved).max(0.0);
        ledger.global_committed += actual;

        let entry = ledger.sessions.entry(session).or_default();
        entry.reserved = (entry.reserved - reserved).max(0.0);
        entry.committed += actual;
    }

    /// Give back a reservation for a call that cost nothing
    pub fn release(&self, session: Uuid, reserved_usd: f64) {
        self.commit(session, reserved_usd, 0.0);
    }

    /// Whether the session may not start further calls
    pub fn is_exhausted(&self, session: Uuid) -> bool {
        self.snapshot(session).exhausted
    }

    /// Current spend of a session
    pub fn snapshot(&self, session: Uuid) -> BudgetSnapshot {
        let ledger = self.lock();
        let global_committed = ledger.global_committed;
        match ledger.sessions.get(&session) {
            Some(entry) => {
                let limit = entry.limit_usd.unwrap_or(self.limits.session_limit_usd);
                BudgetSnapshot {
                    committed_usd: entry.committed,
                    reserved_usd: entry.reserved,
                    limit_usd: limit,
                    global_committed_usd: global_committed,
                    exhausted: entry.denied || entry.committed + entry.reserved >= limit - COST_EPSILON,
                }
            }
            None => BudgetSnapshot {
                committed_usd: 0.0,
                reserved_usd: 0.0,
                limit_usd: self.limits.session_limit_usd,
                global_committed_usd: global_committed,
                exhausted: self.limits.session_limit_usd <= 0.0,
            },
        }
    }

    /// Forget a finished session and return its final snapshot
    ///
    /// Its committed spend stays in the global total. Reservations still open
    /// are dropped from the global reserve.
    pub fn close_session(&self, session: Uuid) -> BudgetSnapshot {
        let snapshot = self.snapshot(session);
        let mut ledger = self.lock();
        if let Some(entry) = ledger.sessions.remove(&session) {
            ledger.global_reserved = (ledger.global_reserved - entry.reserved).max(0.0);
            debug!(%session, committed = entry.committed, "Budget session closed");
        }
        snapshot
    }

    /// Sessions currently tracked
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Returns a snapshot the first time a session's committed spend crosses
    /// the warn fraction, `None` otherwise
    pub fn take_warning(&self, session: Uuid) -> Option<BudgetSnapshot> {
        {
            let mut ledger = self.lock();
            let entry = ledger.sessions.get_mut(&session)?;
            let limit = entry.limit_usd.unwrap_or(self.limits.session_limit_usd);
            if entry.warned || entry.committed < limit * self.limits.warn_fraction {
                return None;
            }
            entry.warned = true;
        }
        Some(self.snapshot(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(session_limit: f64, global_limit: f64) -> BudgetGuard {
        BudgetGuard::new(BudgetLimits {
            session_limit_usd: session_limit,
            global_limit_usd: global_limit,
            warn_fraction: 0.8,
        })
    }

    #[test]
    fn test_default_limits() {
        let limits = BudgetLimits::default();
        assert_eq!(limits.session_limit_usd, 1.0);
        assert_eq!(limits.global_limit_usd, 10.0);
        assert_eq!(limits.warn_fraction, 0.8);
    }

    #[test]
    fn test_reserve_within_limit() {
        let guard = guard(1.0, 10.0);
        let session = Uuid::new_v4();

        assert!(guard.reserve(session, 0.4));
        assert!(guard.reserve(session, 0.6));
        // Reserved counts toward the ceiling before anything is committed
        assert!(!guard.reserve(session, 0.01));
        assert!(guard.is_exhausted(session));
    }

    #[test]
    fn test_commit_settles_reservation() {
        let guard = guard(1.0, 10.0);
        let session = Uuid::new_v4();

        assert!(guard.reserve(session, 0.5));
        guard.commit(session, 0.5, 0.2);

        let snapshot = guard.snapshot(session);
        assert!((snapshot.committed_usd - 0.2).abs() < 1e-12);
        assert_eq!(snapshot.reserved_usd, 0.0);
        assert!((snapshot.remaining_usd() - 0.8).abs() < 1e-12);
        assert!(!snapshot.exhausted);
    }

    #[test]
    fn test_release_returns_budget() {
        let guard = guard(0.1, 10.0);
        let session = Uuid::new_v4();

        assert!(guard.reserve(session, 0.1));
        guard.release(session, 0.1);
        assert!(guard.reserve(session, 0.1));
    }

    #[test]
    fn test_global_ceiling_spans_sessions() {
        let guard = guard(1.0, 1.5);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(guard.reserve(a, 1.0));
        guard.commit(a, 1.0, 1.0);

        let err = guard.try_reserve(b, 0.6).unwrap_err();
        assert!(matches!(err, BudgetExceeded::Global { .. }));
        assert!(guard.reserve(b, 0.5));
    }

    #[test]
    fn test_session_limit_override() {
        let guard = guard(1.0, 10.0);
        let session = Uuid::new_v4();
        guard.set_session_limit(session, 0.05);

        assert!(!guard.reserve(session, 0.06));
        assert_eq!(guard.snapshot(session).limit_usd, 0.05);
    }

    #[test]
    fn test_warning_raised_once() {
        let guard = guard(1.0, 10.0);
        let session = Uuid::new_v4();

        assert!(guard.reserve(session, 0.5));
        guard.commit(session, 0.5, 0.5);
        assert!(guard.take_warning(session).is_none());

        assert!(guard.reserve(session, 0.3));
        guard.commit(session, 0.3, 0.3);
        assert!(guard.take_warning(session).is_some());
        assert!(guard.take_warning(session).is_none());
    }

    #[test]
    fn test_unknown_session_snapshot() {
        let guard = guard(1.0, 10.0);
        let snapshot = guard.snapshot(Uuid::new_v4());
        assert_eq!(snapshot.committed_usd, 0.0);
        assert!(!snapshot.exhausted);
    }

    #[test]
    fn test_close_session_keeps_global_spend() {
        let guard = guard(1.0, 1.0);
        let a = Uuid::new_v4();

        assert!(guard.reserve(a, 0.6));
        guard.commit(a, 0.6, 0.6);
        assert!(guard.reserve(a, 0.2));
        assert_eq!(guard.open_sessions(), 1);

        let last = guard.close_session(a);
        assert!((last.committed_usd - 0.6).abs() < 1e-12);
        assert!((last.reserved_usd - 0.2).abs() < 1e-12);
        assert_eq!(guard.open_sessions(), 0);

        // Committed spend still counts, the dangling reservation does not
        let b = Uuid::new_v4();
        assert!(!guard.reserve(b, 0.5));
        assert!(guard.reserve(Uuid::new_v4(), 0.4));
        assert!((guard.snapshot(b).global_committed_usd - 0.6).abs() < 1e-12);
    }
}
