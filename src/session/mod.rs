//! One logical market-data connection: status machine, subscriptions, ingestion.
//!
//! Outbound calls (`connect`, `login`, `logout`, `subscribe`, `unsubscribe`) come
//! from the owning thread and are gated on the current status. Inbound events
//! arrive through `GatewayEvents` on gateway threads; each one first attempts the
//! transition it implies and does nothing else if that is rejected.

pub mod driver;
pub mod registry;
pub mod state;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{SessionError, SessionResult};
use crate::gateway::{check_status, disconnect_reason, Credentials, Gateway, GatewayEvents, LoginInfo, RspInfo};
use crate::market_data::pipeline::{IngestError, Pipeline};
use crate::market_data::record::{InstrumentId, RawTick};
use registry::{batches, SubscriptionRegistry, DEFAULT_MAX_BATCH};
use state::{SessionStatus, StateMachine, Transition};

pub use driver::{Backoff, BackoffConfig, Driver, DriverConfig};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub credentials: Credentials,
    /// Gateway working directory; must be non-empty.
    pub flow_path: String,
    /// Most instruments per subscribe/unsubscribe request.
    pub max_batch: usize,
    /// Subscribed after every successful login.
    pub instruments: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            flow_path: "./flow".into(),
            max_batch: DEFAULT_MAX_BATCH,
            instruments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Subscribe,
    Unsubscribe,
}

pub struct Session {
    state: StateMachine,
    request_id: AtomicI32,
    gateway: RwLock<Option<Arc<dyn Gateway>>>,
    registry: SubscriptionRegistry,
    pipeline: Pipeline,
    credentials: Credentials,
    flow_path: String,
    max_batch: usize,
    login_instruments: Vec<InstrumentId>,
}

impl Session {
    pub fn new(settings: SessionSettings, pipeline: Pipeline) -> SessionResult<Arc<Self>> {
        let login_instruments = settings
            .instruments
            .iter()
            .map(|s| InstrumentId::new(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Arc::new(Self {
            state: StateMachine::new(),
            request_id: AtomicI32::new(0),
            gateway: RwLock::new(None),
            registry: SubscriptionRegistry::new(),
            pipeline,
            credentials: settings.credentials,
            flow_path: settings.flow_path,
            max_batch: settings.max_batch.max(1),
            login_instruments,
        }))
    }

    /// Bind to a gateway and register this session as its event sink.
    pub fn init(self: &Arc<Self>, gateway: Arc<dyn Gateway>) -> SessionResult<()> {
        if self.flow_path.trim().is_empty() {
            return Err(SessionError::FlowPathEmpty);
        }
        let events: Arc<dyn GatewayEvents> = Arc::clone(self) as Arc<dyn GatewayEvents>;
        gateway.register_events(Arc::downgrade(&events));
        *self.gateway.write() = Some(gateway);
        info!(flow_path = %self.flow_path, "Session initialised");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn attempt_transition(&self, target: SessionStatus) -> Transition {
        self.state.attempt_transition(target)
    }

    /// Last request id handed out.
    pub fn request_id(&self) -> i32 {
        self.request_id.load(Ordering::Acquire)
    }

    fn next_request_id(&self) -> i32 {
        self.request_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn gateway(&self) -> SessionResult<Arc<dyn Gateway>> {
        self.gateway.read().clone().ok_or(SessionError::NotInitialized)
    }

    fn enter(&self, target: SessionStatus, expected: SessionStatus) -> SessionResult<()> {
        match self.state.attempt_transition(target) {
            Transition::Applied { .. } => Ok(()),
            Transition::Rejected { current } => {
                warn!(?target, ?current, "Status change rejected");
                Err(SessionError::StatusConflict { expected, actual: current })
            }
        }
    }

    /// Register `addresses` and start the gateway. `timeout == None` blocks until the
    /// gateway exits; otherwise waits for `Connected` and fails with `ConnectTimeout`,
    /// leaving the status at `Connecting`.
    #[instrument(skip(self, addresses), fields(addresses = addresses.len()))]
    pub fn connect(&self, addresses: &[String], timeout: Option<Duration>) -> SessionResult<()> {
        let fronts: Vec<&str> = addresses.iter().map(|a| a.trim()).filter(|a| !a.is_empty()).collect();
        if fronts.is_empty() {
            return Err(SessionError::AddressEmpty);
        }
        let gateway = self.gateway()?;
        self.enter(SessionStatus::Connecting, SessionStatus::Disconnected)?;

        for front in &fronts {
            debug!(front, "Registering front");
            gateway.register_front(front);
        }
        gateway.init();

        let Some(timeout) = timeout else {
            info!("Gateway running until it exits");
            gateway.join();
            return Ok(());
        };

        let reached = self
            .state
            .wait_until(|s| s == SessionStatus::Connected, Some(Instant::now() + timeout));
        if reached == SessionStatus::Connected {
            Ok(())
        } else {
            warn!(?timeout, status = ?reached, "Connect timed out");
            Err(SessionError::ConnectTimeout(timeout))
        }
    }

    /// Issue exactly one login request. `retry_times`/`retry_interval` describe the
    /// caller's budget; only `retry_times < 1` is checked here.
    #[instrument(skip(self))]
    pub fn login(&self, retry_times: u32, retry_interval: Duration) -> SessionResult<()> {
        if retry_times < 1 {
            return Err(SessionError::LoginTimeout);
        }
        let gateway = self.gateway()?;
        self.enter(SessionStatus::Logging, SessionStatus::Connected)?;

        let request_id = self.next_request_id();
        check_status(gateway.request_login(&self.credentials, request_id)).map_err(|e| {
            error!(request_id, error = %e, "Login request failed");
            SessionError::LoginFailed(e)
        })?;
        info!(request_id, user = %self.credentials.user_id, "Login requested");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn logout(&self) -> SessionResult<()> {
        let gateway = self.gateway()?;
        self.enter(SessionStatus::LoggingOut, SessionStatus::LoggedIn)?;

        let request_id = self.next_request_id();
        check_status(gateway.request_logout(&self.credentials, request_id))?;
        info!(request_id, "Logout requested");
        Ok(())
    }

    /// Subscribe to the instruments not already subscribed. Returns how many were requested.
    pub fn subscribe<S: AsRef<str>>(&self, instruments: &[S]) -> SessionResult<usize> {
        let ids = parse_ids(instruments)?;
        self.subscribe_ids(&ids)
    }

    pub fn subscribe_ids(&self, ids: &[InstrumentId]) -> SessionResult<usize> {
        let gateway = self.gateway()?;
        let net_new = self.registry.diff_subscribe(ids);
        self.send(&*gateway, &net_new, Direction::Subscribe)
    }

    /// Unsubscribe the instruments currently subscribed. Returns how many were requested.
    pub fn unsubscribe<S: AsRef<str>>(&self, instruments: &[S]) -> SessionResult<usize> {
        let ids = parse_ids(instruments)?;
        let gateway = self.gateway()?;
        let net_removed = self.registry.diff_unsubscribe(&ids);
        self.send(&*gateway, &net_removed, Direction::Unsubscribe)
    }

    /// Re-send everything marked subscribed, e.g. after a relogin. Nothing is
    /// unmarked on failure; the unsent remainder is left pending.
    pub fn resubscribe_all(&self) -> SessionResult<usize> {
        let gateway = self.gateway()?;
        let ids = self.registry.take_all();
        self.send(&*gateway, &ids, Direction::Subscribe)
    }

    /// Send the subscriptions an earlier request failed to deliver.
    pub fn retry_pending(&self) -> SessionResult<usize> {
        let gateway = self.gateway()?;
        let ids = self.registry.take_pending();
        self.send(&*gateway, &ids, Direction::Subscribe)
    }

    // Batches ids under the venue ceiling. On failure everything not sent is kept
    // for a retry: subscribes stay marked but pending, unsubscribes are re-marked.
    fn send(&self, gateway: &dyn Gateway, ids: &[InstrumentId], direction: Direction) -> SessionResult<usize> {
        let mut sent = 0;
        for batch in batches(ids, self.max_batch) {
            let code = match direction {
                Direction::Subscribe => gateway.subscribe(&batch),
                Direction::Unsubscribe => gateway.unsubscribe(&batch),
            };
            if let Err(e) = check_status(code) {
                let unsent = &ids[sent..];
                match direction {
                    Direction::Subscribe => self.registry.mark_pending(unsent),
                    Direction::Unsubscribe => self.registry.restore(unsent),
                }
                warn!(?direction, sent, unsent = unsent.len(), error = %e, "Subscription request failed");
                return Err(e.into());
            }
            sent += batch.len();
        }
        if sent > 0 {
            info!(?direction, count = sent, "Subscription request sent");
        }
        Ok(sent)
    }

    /// Block until the session is disconnected.
    pub fn wait(&self) -> SessionStatus {
        self.state.wait_until(|s| s == SessionStatus::Disconnected, None)
    }

    /// Wait for `target`, up to `timeout` (`None` = forever). True if reached.
    pub fn wait_for(&self, target: SessionStatus, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.state.wait_until(|s| s == target, deadline) == target
    }

    /// Drop back to `Disconnected` locally after an aborted cycle (e.g. a connect
    /// timeout or a login that never completed). Rejected when already idle.
    pub fn abandon(&self) -> Transition {
        let outcome = self.state.attempt_transition(SessionStatus::Disconnected);
        if let Transition::Applied { from } = outcome {
            info!(?from, "Session abandoned");
        }
        outcome
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
    }

    fn after_login(&self) {
        match self.resubscribe_all() {
            Ok(n) if n > 0 => info!(count = n, "Resubscribed after login"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, pending = self.registry.pending_len(), "Resubscribe after login incomplete"),
        }
        if !self.login_instruments.is_empty() {
            if let Err(e) = self.subscribe_ids(&self.login_instruments) {
                warn!(error = %e, pending = self.registry.pending_len(), "Subscribing configured instruments incomplete");
            }
        }
    }
}

fn parse_ids<S: AsRef<str>>(instruments: &[S]) -> SessionResult<Vec<InstrumentId>> {
    instruments
        .iter()
        .map(|s| InstrumentId::new(s.as_ref()).map_err(SessionError::from))
        .collect()
}

fn rsp_failed(rsp: Option<&RspInfo>) -> Option<&RspInfo> {
    rsp.filter(|r| !r.is_ok())
}

impl GatewayEvents for Session {
    fn on_connected(&self) {
        match self.state.attempt_transition(SessionStatus::Connected) {
            Transition::Applied { .. } => info!("Gateway connected"),
            Transition::Rejected { current } => error!(?current, "Connected event rejected"),
        }
    }

    fn on_disconnected(&self, reason: i32) {
        match self.state.attempt_transition(SessionStatus::Disconnected) {
            Transition::Applied { from } => {
                let code = format!("{reason:#06x}");
                info!(reason = %code, detail = disconnect_reason(reason), ?from, "Gateway disconnected")
            }
            Transition::Rejected { current } => error!(reason, ?current, "Disconnected event rejected"),
        }
    }

    fn on_heartbeat_warning(&self, elapsed_secs: i32) {
        warn!(elapsed_secs, "Heartbeat timeout warning");
    }

    fn on_login_response(&self, login: Option<&LoginInfo>, rsp: Option<&RspInfo>, request_id: i32, is_last: bool) {
        if let Some(rsp) = rsp_failed(rsp) {
            error!(request_id, error_id = rsp.error_id, msg = %rsp.error_msg, "Login refused");
            return;
        }
        if let Transition::Rejected { current } = self.state.attempt_transition(SessionStatus::LoggedIn) {
            warn!(request_id, ?current, "Login response ignored, status does not allow it");
            return;
        }
        info!(
            request_id,
            is_last,
            trading_day = login.map(|l| l.trading_day.as_str()).unwrap_or(""),
            session_id = login.map(|l| l.session_id).unwrap_or(0),
            "Logged in"
        );
        self.after_login();
    }

    fn on_logout_response(&self, rsp: Option<&RspInfo>, request_id: i32, _is_last: bool) {
        if let Some(rsp) = rsp_failed(rsp) {
            error!(request_id, error_id = rsp.error_id, msg = %rsp.error_msg, "Logout refused");
            return;
        }
        match self.state.attempt_transition(SessionStatus::Connected) {
            Transition::Applied { .. } => info!(request_id, "Logged out"),
            Transition::Rejected { current } => warn!(request_id, ?current, "Logout response ignored"),
        }
    }

    fn on_error(&self, rsp: Option<&RspInfo>, request_id: i32, is_last: bool) {
        let (error_id, msg) = rsp.map(|r| (r.error_id, r.error_msg.as_str())).unwrap_or((0, ""));
        error!(request_id, is_last, error_id, msg, "Gateway error response");
    }

    fn on_subscribe_response(&self, instrument: Option<&str>, rsp: Option<&RspInfo>, request_id: i32, _is_last: bool) {
        let instrument = instrument.unwrap_or("");
        match rsp_failed(rsp) {
            // advisory only, the registry keeps its optimistic mark
            Some(rsp) => warn!(instrument, request_id, error_id = rsp.error_id, msg = %rsp.error_msg, "Subscribe refused"),
            None => debug!(instrument, request_id, "Subscribed"),
        }
    }

    fn on_unsubscribe_response(&self, instrument: Option<&str>, rsp: Option<&RspInfo>, request_id: i32, _is_last: bool) {
        let instrument = instrument.unwrap_or("");
        match rsp_failed(rsp) {
            Some(rsp) => warn!(instrument, request_id, error_id = rsp.error_id, msg = %rsp.error_msg, "Unsubscribe refused"),
            None => debug!(instrument, request_id, "Unsubscribed"),
        }
    }

    fn on_tick(&self, tick: &RawTick) {
        match self.pipeline.ingest(tick) {
            Ok(_) => {}
            Err(IngestError::Convert(e)) => warn!(instrument = %tick.instrument_id, error = %e, "Dropped malformed tick"),
            Err(e) => debug!(instrument = %tick.instrument_id, kind = ?e.kind(), error = %e, "Dropped tick"),
        }
    }
}
