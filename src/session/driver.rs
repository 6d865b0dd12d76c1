//! Keeps a session alive: connect, log in within a retry budget, wait for a
//! drop, back off, repeat until asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, info, instrument, warn};

use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::session::state::SessionStatus;
use crate::session::Session;

const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised either way, e.g. 0.1 = ±10%.
    pub jitter: f64,
    /// 0 = unlimited.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 0,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current, attempts: 0 }
    }

    /// `None` once `max_attempts` is used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = jittered(self.current, self.config.jitter);
        let scaled = self.current.as_secs_f64() * self.config.multiplier;
        let next = if scaled.is_finite() && scaled > 0.0 {
            Duration::from_secs_f64(scaled.min(self.config.max_delay.as_secs_f64()))
        } else {
            self.config.max_delay
        };
        self.current = next;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub addresses: Vec<String>,
    /// `None` = let the gateway run until it exits.
    pub connect_timeout: Option<Duration>,
    pub login_retry_times: u32,
    pub login_retry_interval: Duration,
    pub reconnect: BackoffConfig,
    /// Spacing of retries for subscriptions the venue pushed back on.
    pub resubscribe: BackoffConfig,
    /// How long to wait for the logout acknowledgement on shutdown.
    pub logout_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            connect_timeout: Some(Duration::from_secs(3)),
            login_retry_times: 3,
            login_retry_interval: Duration::from_secs(1),
            reconnect: BackoffConfig::default(),
            resubscribe: BackoffConfig {
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
                ..BackoffConfig::default()
            },
            logout_timeout: Duration::from_secs(1),
        }
    }
}

pub struct Driver {
    session: Arc<Session>,
    config: DriverConfig,
    shutdown: Arc<AtomicBool>,
}

impl Driver {
    pub fn new(session: Arc<Session>, config: DriverConfig, shutdown: Arc<AtomicBool>) -> Self {
        Self { session, config, shutdown }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// One connect + login cycle.
    pub fn connect_and_login(&self) -> SessionResult<()> {
        self.session.connect(&self.config.addresses, self.config.connect_timeout)?;
        if self.config.connect_timeout.is_none() {
            // the gateway has already exited
            return Ok(());
        }
        self.login_with_retry()
    }

    /// Up to `login_retry_times` waits of `login_retry_interval` for the venue to confirm.
    /// A new request is sent whenever the session is back at `Connected`; a send
    /// failure ends the cycle so `run` can back off and reconnect.
    #[instrument(skip(self), fields(budget = self.config.login_retry_times))]
    pub fn login_with_retry(&self) -> SessionResult<()> {
        let budget = self.config.login_retry_times;
        let interval = self.config.login_retry_interval;
        if budget < 1 {
            return Err(SessionError::LoginTimeout);
        }

        for attempt in 1..=budget {
            if self.stopping() {
                break;
            }
            match self.session.status() {
                SessionStatus::LoggedIn => return Ok(()),
                // a failed send leaves the session in Logging; only a fresh cycle recovers it
                SessionStatus::Connected => self.session.login(budget - attempt + 1, interval)?,
                // a response to an earlier attempt may still arrive
                SessionStatus::Logging => {}
                other => {
                    return Err(SessionError::StatusConflict { expected: SessionStatus::Connected, actual: other })
                }
            }
            if self.session.wait_for(SessionStatus::LoggedIn, Some(interval)) {
                info!(attempt, "Login confirmed");
                return Ok(());
            }
            warn!(attempt, status = ?self.session.status(), "Login not confirmed in time");
        }
        Err(SessionError::LoginTimeout)
    }

    /// Run until shutdown is requested, reconnecting with backoff after every failure
    /// or drop. Configuration errors end the loop.
    pub fn run(&self) -> SessionResult<()> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut last_error = None;

        while !self.stopping() {
            match self.connect_and_login() {
                Ok(()) if self.config.connect_timeout.is_none() => break,
                Ok(()) => {
                    backoff.reset();
                    info!("Session live");
                    if !self.wait_for_drop() {
                        break;
                    }
                    warn!("Session dropped, reconnecting");
                }
                Err(e) if e.kind() == ErrorKind::Configuration => {
                    error!(error = %e, "Session cannot start");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, kind = ?e.kind(), retriable = e.is_retriable(), status = ?self.session.status(), "Session cycle failed");
                    self.session.abandon();
                    last_error = Some(e);
                }
            }

            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempts(), "Reconnect attempts exhausted");
                return Err(last_error.unwrap_or(SessionError::LoginTimeout));
            };
            info!(?delay, attempt = backoff.attempts(), "Reconnecting after delay");
            self.sleep(delay);
        }

        self.stop();
        Ok(())
    }

    // true when the session dropped, false when shutdown was requested first.
    // Subscriptions left pending by backpressure are re-sent meanwhile.
    fn wait_for_drop(&self) -> bool {
        let mut retry = Backoff::new(self.config.resubscribe.clone());
        let mut due: Option<Instant> = None;
        loop {
            if self.stopping() {
                return false;
            }
            if self.session.wait_for(SessionStatus::Disconnected, Some(POLL)) {
                return true;
            }
            if self.session.registry().pending_len() == 0 {
                retry.reset();
                due = None;
                continue;
            }
            let at = *due.get_or_insert_with(|| {
                Instant::now() + retry.next_delay().unwrap_or(self.config.resubscribe.max_delay)
            });
            if Instant::now() >= at && self.session.status() == SessionStatus::LoggedIn {
                due = None;
                self.flush_pending();
            }
        }
    }

    fn flush_pending(&self) {
        match self.session.retry_pending() {
            Ok(n) => info!(count = n, "Pending subscriptions sent"),
            Err(e) => warn!(error = %e, retriable = e.is_retriable(), pending = self.session.registry().pending_len(), "Pending subscriptions still pushed back"),
        }
    }

    /// Log out if logged in and wait briefly for the acknowledgement.
    pub fn stop(&self) {
        if self.session.status() != SessionStatus::LoggedIn {
            return;
        }
        match self.session.logout() {
            Ok(()) => {
                if !self.session.wait_for(SessionStatus::Connected, Some(self.config.logout_timeout)) {
                    warn!(status = ?self.session.status(), "Logout not acknowledged");
                }
            }
            Err(e) => warn!(error = %e, "Logout failed"),
        }
    }

    // sleeps in slices so a shutdown request is noticed promptly
    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_ceiling() {
        let mut b = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 0,
        });
        let delays: Vec<_> = (0..4).map(|_| b.next_delay().unwrap().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[test]
    fn test_backoff_respects_max_attempts_and_reset() {
        let mut b = Backoff::new(BackoffConfig { max_attempts: 2, jitter: 0.0, ..Default::default() });
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jittered(base, 0.1).as_millis();
            assert!((900..=1100).contains(&d), "{d}");
        }
    }
}
