//! Session status and its transition table.
//!
//! The status lives in one `AtomicU8` and only moves through `attempt_transition`,
//! a compare-and-swap loop: of two threads racing toward the same target exactly
//! one sees `Transition::Applied`. Waiters park on a condvar that is notified after
//! every applied transition.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum SessionStatus {
    Disconnected = 1,
    Connecting,
    Connected,
    Logging,
    LoggedIn,
    LoggingOut,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Disconnected,
        SessionStatus::Connecting,
        SessionStatus::Connected,
        SessionStatus::Logging,
        SessionStatus::LoggedIn,
        SessionStatus::LoggingOut,
    ];

    /// Whether `self` may be entered from `from`.
    pub fn reachable_from(self, from: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Connecting => from == Disconnected,
            Connected => matches!(from, Connecting | LoggingOut),
            // any non-idle state can fall back
            Disconnected => from != Disconnected,
            Logging => from == Connected,
            LoggedIn => from == Logging,
            LoggingOut => from == LoggedIn,
        }
    }

    fn from_u8(v: u8) -> SessionStatus {
        match v {
            2 => SessionStatus::Connecting,
            3 => SessionStatus::Connected,
            4 => SessionStatus::Logging,
            5 => SessionStatus::LoggedIn,
            6 => SessionStatus::LoggingOut,
            _ => SessionStatus::Disconnected,
        }
    }
}

/// Outcome of one transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status moved `from` -> target.
    Applied { from: SessionStatus },
    /// Illegal from the observed status; nothing changed.
    Rejected { current: SessionStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

#[derive(Debug)]
pub struct StateMachine {
    status: AtomicU8,
    changed: Condvar,
    lock: Mutex<()>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(SessionStatus::Disconnected as u8),
            changed: Condvar::new(),
            lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move to `target` if the table allows it from the current status.
    pub fn attempt_transition(&self, target: SessionStatus) -> Transition {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let from = SessionStatus::from_u8(current);
            if !target.reachable_from(from) {
                trace!(?from, ?target, "Transition rejected");
                return Transition::Rejected { current: from };
            }
            match self.status.compare_exchange_weak(current, target as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    trace!(?from, ?target, "Transition applied");
                    metrics::gauge!("md_session_status").set(target as u8 as f64);
                    // take the lock so a waiter between its check and park cannot miss this
                    drop(self.lock.lock());
                    self.changed.notify_all();
                    return Transition::Applied { from };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Block until `done(status)` holds or `deadline` passes (`None` waits forever).
    /// Returns the last observed status.
    pub fn wait_until<F>(&self, mut done: F, deadline: Option<Instant>) -> SessionStatus
    where
        F: FnMut(SessionStatus) -> bool,
    {
        let mut guard = self.lock.lock();
        loop {
            let status = self.status();
            if done(status) {
                return status;
            }
            match deadline {
                Some(at) => {
                    if self.changed.wait_until(&mut guard, at).timed_out() {
                        return self.status();
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use SessionStatus::*;

    #[test]
    fn test_initial_status() {
        assert_eq!(StateMachine::new().status(), Disconnected);
    }

    #[test]
    fn test_table() {
        assert!(Connecting.reachable_from(Disconnected));
        assert!(!Connecting.reachable_from(Connected));
        assert!(Connected.reachable_from(Connecting));
        assert!(Connected.reachable_from(LoggingOut));
        assert!(!Connected.reachable_from(Disconnected));
        assert!(Logging.reachable_from(Connected));
        assert!(LoggedIn.reachable_from(Logging));
        assert!(!LoggedIn.reachable_from(LoggedIn));
        assert!(LoggingOut.reachable_from(LoggedIn));
        for s in SessionStatus::ALL {
            assert_eq!(Disconnected.reachable_from(s), s != Disconnected);
        }
    }

    #[test]
    fn test_happy_path() {
        let sm = StateMachine::new();
        for target in [Connecting, Connected, Logging, LoggedIn, LoggingOut, Connected, Disconnected] {
            assert!(sm.attempt_transition(target).is_applied(), "{target:?}");
            assert_eq!(sm.status(), target);
        }
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let sm = StateMachine::new();
        sm.attempt_transition(Connecting);
        sm.attempt_transition(Connected);
        assert_eq!(sm.attempt_transition(Connected), Transition::Rejected { current: Connected });
    }

    #[test]
    fn test_racing_callbacks_only_one_wins() {
        for _ in 0..50 {
            let sm = Arc::new(StateMachine::new());
            sm.attempt_transition(Connecting);
            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let (sm, wins) = (Arc::clone(&sm), Arc::clone(&wins));
                    thread::spawn(move || {
                        if sm.attempt_transition(Connected).is_applied() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_eq!(sm.status(), Connected);
        }
    }

    #[test]
    fn test_wait_until_wakes_on_transition() {
        let sm = Arc::new(StateMachine::new());
        sm.attempt_transition(Connecting);
        let waker = {
            let sm = Arc::clone(&sm);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sm.attempt_transition(Connected);
            })
        };
        let seen = sm.wait_until(|s| s == Connected, Some(Instant::now() + Duration::from_secs(2)));
        waker.join().unwrap();
        assert_eq!(seen, Connected);
    }

    #[test]
    fn test_wait_until_times_out() {
        let sm = StateMachine::new();
        let start = Instant::now();
        let seen = sm.wait_until(|s| s == Connected, Some(start + Duration::from_millis(30)));
        assert_eq!(seen, Disconnected);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    fn any_status() -> impl Strategy<Value = SessionStatus> {
        prop::sample::select(SessionStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn transition_lands_on_target_or_stays(targets in prop::collection::vec(any_status(), 0..64)) {
            let sm = StateMachine::new();
            for target in targets {
                let before = sm.status();
                let outcome = sm.attempt_transition(target);
                let after = sm.status();
                if target.reachable_from(before) {
                    prop_assert_eq!(outcome, Transition::Applied { from: before });
                    prop_assert_eq!(after, target);
                } else {
                    prop_assert_eq!(outcome, Transition::Rejected { current: before });
                    prop_assert_eq!(after, before);
                }
            }
        }
    }
}
