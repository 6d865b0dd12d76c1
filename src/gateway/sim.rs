// Simulated venue: acknowledges requests on its own threads and streams
// random-walk depth ticks for whatever is subscribed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::{Credentials, Gateway, GatewayEvents, LoginInfo, RspInfo};
use crate::market_data::record::{InstrumentId, RawTick, MAX_DEPTH};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub flow_path: String,
    pub use_udp: bool,
    pub use_multicast: bool,
    pub connect_delay: Duration,
    pub response_delay: Duration,
    pub tick_interval: Duration,
    pub seed: u64,
    pub trading_day: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            flow_path: "./flow".into(),
            use_udp: false,
            use_multicast: false,
            connect_delay: Duration::from_millis(20),
            response_delay: Duration::from_millis(5),
            tick_interval: Duration::from_millis(250),
            seed: 7,
            trading_day: "20240105".into(),
        }
    }
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    logged_in: AtomicBool,
    /// Subscribe calls still to be refused with -3.
    throttled: AtomicUsize,
    subscribed: Mutex<BTreeSet<String>>,
    events: Mutex<Option<Weak<dyn GatewayEvents>>>,
}

impl Shared {
    fn events(&self) -> Option<Arc<dyn GatewayEvents>> {
        self.events.lock().as_ref().and_then(Weak::upgrade)
    }
}

pub struct SimGateway {
    config: SimConfig,
    fronts: Mutex<Vec<String>>,
    shared: Arc<Shared>,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl SimGateway {
    pub fn new(config: SimConfig) -> Self {
        info!(flow_path = %config.flow_path, udp = config.use_udp, multicast = config.use_multicast, "Sim gateway created");
        Self {
            config,
            fronts: Mutex::new(Vec::new()),
            shared: Arc::new(Shared::default()),
            feed: Mutex::new(None),
        }
    }

    pub fn fronts(&self) -> Vec<String> {
        self.fronts.lock().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.shared.subscribed.lock().iter().cloned().collect()
    }

    /// Refuse the next `calls` subscribe requests as rate limited (-3).
    pub fn throttle_subscribes(&self, calls: usize) {
        self.shared.throttled.store(calls, Ordering::Release);
    }

    /// Drop the connection as the venue would, reporting `reason`. The venue
    /// forgets every subscription of the dropped session.
    pub fn drop_connection(&self, reason: i32) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.logged_in.store(false, Ordering::Release);
        self.shared.subscribed.lock().clear();
        let code = format!("{reason:#06x}");
        warn!(reason = %code, "Sim gateway dropping connection");
        if let Some(events) = self.shared.events() {
            events.on_disconnected(reason);
        }
    }

    /// Stop the feed thread; `join` returns afterwards.
    pub fn release(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
        if let Some(handle) = self.feed.lock().take() {
            let _ = handle.join();
        }
    }

    // Deliver `f` on a fresh thread after the configured response delay.
    fn respond<F>(&self, f: F)
    where
        F: FnOnce(&Shared, &dyn GatewayEvents) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let delay = self.config.response_delay;
        thread::spawn(move || {
            thread::sleep(delay);
            if let Some(events) = shared.events() {
                f(&*shared, &*events);
            }
        });
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn spawn_feed(&self) {
        let mut feed = self.feed.lock();
        if feed.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let interval = self.config.tick_interval;
        let trading_day = self.config.trading_day.clone();
        let mut walk = RandomWalk::new(self.config.seed);

        let spawned = thread::Builder::new().name("sim-feed".into()).spawn(move || {
            while shared.running.load(Ordering::Acquire) {
                thread::sleep(interval);
                if !shared.logged_in.load(Ordering::Acquire) {
                    continue;
                }
                let Some(events) = shared.events() else { break };
                let ids: Vec<String> = shared.subscribed.lock().iter().cloned().collect();
                for id in ids {
                    events.on_tick(&walk.tick(&id, &trading_day));
                }
            }
            debug!("Sim feed stopped");
        });
        match spawned {
            Ok(handle) => *feed = Some(handle),
            Err(e) => warn!(error = %e, "Sim feed thread failed to start"),
        }
    }
}

impl Gateway for SimGateway {
    fn register_events(&self, events: Weak<dyn GatewayEvents>) {
        *self.shared.events.lock() = Some(events);
    }

    fn register_front(&self, address: &str) {
        let mut fronts = self.fronts.lock();
        if !fronts.iter().any(|f| f == address) {
            fronts.push(address.to_string());
        }
    }

    fn init(&self) {
        if self.fronts.lock().is_empty() {
            warn!("Sim gateway has no front registered, staying offline");
            return;
        }
        self.shared.running.store(true, Ordering::Release);
        self.spawn_feed();

        let shared = Arc::clone(&self.shared);
        let delay = self.config.connect_delay;
        thread::spawn(move || {
            thread::sleep(delay);
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            shared.connected.store(true, Ordering::Release);
            if let Some(events) = shared.events() {
                events.on_connected();
            }
        });
    }

    fn join(&self) {
        let handle = self.feed.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn request_login(&self, credentials: &Credentials, request_id: i32) -> i32 {
        if !self.connected() {
            return -1;
        }
        let login = LoginInfo {
            trading_day: self.config.trading_day.clone(),
            login_time: "09:00:00".into(),
            session_id: request_id,
            front_id: 1,
        };
        debug!(user = %credentials.user_id, request_id, "Sim login");
        self.respond(move |shared, events| {
            shared.logged_in.store(true, Ordering::Release);
            events.on_login_response(Some(&login), Some(&RspInfo::ok()), request_id, true);
        });
        0
    }

    fn request_logout(&self, _credentials: &Credentials, request_id: i32) -> i32 {
        if !self.connected() {
            return -1;
        }
        self.respond(move |shared, events| {
            shared.logged_in.store(false, Ordering::Release);
            events.on_logout_response(Some(&RspInfo::ok()), request_id, true);
        });
        0
    }

    fn subscribe(&self, instruments: &[InstrumentId]) -> i32 {
        if !self.connected() {
            return -1;
        }
        let throttled = self
            .shared
            .throttled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if throttled.is_ok() {
            debug!(count = instruments.len(), "Sim subscribe rate limited");
            return -3;
        }
        let ids: Vec<String> = instruments.iter().map(|i| i.as_str().to_string()).collect();
        self.shared.subscribed.lock().extend(ids.iter().cloned());
        self.respond(move |_, events| {
            let last = ids.len().saturating_sub(1);
            for (i, id) in ids.iter().enumerate() {
                events.on_subscribe_response(Some(id), Some(&RspInfo::ok()), 0, i == last);
            }
        });
        0
    }

    fn unsubscribe(&self, instruments: &[InstrumentId]) -> i32 {
        if !self.connected() {
            return -1;
        }
        let ids: Vec<String> = instruments.iter().map(|i| i.as_str().to_string()).collect();
        {
            let mut subscribed = self.shared.subscribed.lock();
            for id in &ids {
                subscribed.remove(id);
            }
        }
        self.respond(move |_, events| {
            let last = ids.len().saturating_sub(1);
            for (i, id) in ids.iter().enumerate() {
                events.on_unsubscribe_response(Some(id), Some(&RspInfo::ok()), 0, i == last);
            }
        });
        0
    }
}

impl Drop for SimGateway {
    fn drop(&mut self) {
        self.release();
    }
}

struct RandomWalk {
    rng: StdRng,
    state: AHashMap<String, (f64, i64)>,
    clock_ms: u32,
}

impl RandomWalk {
    const TICK_SIZE: f64 = 1.0;

    fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), state: AHashMap::new(), clock_ms: 9 * 3_600_000 }
    }

    fn tick(&mut self, id: &str, trading_day: &str) -> RawTick {
        let start = self.rng.gen_range(1_000.0..5_000.0_f64).round();
        let step = self.rng.gen_range(-2..=2) as f64 * Self::TICK_SIZE;
        let traded = self.rng.gen_range(0..20);
        let (last, volume) = {
            let entry = self.state.entry(id.to_string()).or_insert((start, 0));
            entry.0 = (entry.0 + step).max(Self::TICK_SIZE);
            entry.1 += traded;
            *entry
        };
        self.clock_ms = self.clock_ms.wrapping_add(500);

        let secs = self.clock_ms / 1000;
        let bids = (0..MAX_DEPTH)
            .map(|i| (last - Self::TICK_SIZE * (i + 1) as f64, self.rng.gen_range(1..50)))
            .collect();
        let asks = (0..MAX_DEPTH)
            .map(|i| (last + Self::TICK_SIZE * (i + 1) as f64, self.rng.gen_range(1..50)))
            .collect();

        RawTick {
            instrument_id: id.to_string(),
            trading_day: trading_day.to_string(),
            update_time: format!("{:02}:{:02}:{:02}", (secs / 3600) % 24, (secs / 60) % 60, secs % 60),
            update_millisec: (self.clock_ms % 1000) as i32,
            last_price: last,
            // the venue's "no value" marker
            settlement_price: f64::MAX,
            volume,
            turnover: last * volume as f64,
            bids,
            asks,
            ..RawTick::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::record::MarketDataRecord;
    use std::time::Instant;

    #[derive(Default)]
    struct Counter {
        connected: AtomicUsize,
        logins: AtomicUsize,
        subs: AtomicUsize,
        ticks: AtomicUsize,
    }

    impl GatewayEvents for Counter {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self, _: i32) {}
        fn on_heartbeat_warning(&self, _: i32) {}
        fn on_login_response(&self, _: Option<&LoginInfo>, _: Option<&RspInfo>, _: i32, _: bool) {
            self.logins.fetch_add(1, Ordering::SeqCst);
        }
        fn on_logout_response(&self, _: Option<&RspInfo>, _: i32, _: bool) {}
        fn on_error(&self, _: Option<&RspInfo>, _: i32, _: bool) {}
        fn on_subscribe_response(&self, _: Option<&str>, _: Option<&RspInfo>, _: i32, _: bool) {
            self.subs.fetch_add(1, Ordering::SeqCst);
        }
        fn on_unsubscribe_response(&self, _: Option<&str>, _: Option<&RspInfo>, _: i32, _: bool) {}
        fn on_tick(&self, tick: &RawTick) {
            let rec = MarketDataRecord::from_raw(tick).unwrap();
            assert_eq!(rec.settlement_price, 0.0);
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn eventually(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_requests_fail_before_connect() {
        let gw = SimGateway::new(SimConfig::default());
        assert_eq!(gw.request_login(&Credentials::default(), 1), -1);
        assert_eq!(gw.subscribe(&[InstrumentId::new("rb2405").unwrap()]), -1);
    }

    #[test]
    fn test_no_front_never_connects() {
        let counter = Arc::new(Counter::default());
        let events: Arc<dyn GatewayEvents> = counter.clone();
        let gw = SimGateway::new(SimConfig { connect_delay: Duration::from_millis(1), ..Default::default() });
        gw.register_events(Arc::downgrade(&events));
        gw.init();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.connected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_full_cycle_streams_ticks() {
        let counter = Arc::new(Counter::default());
        let events: Arc<dyn GatewayEvents> = counter.clone();
        let gw = SimGateway::new(SimConfig { tick_interval: Duration::from_millis(5), ..Default::default() });
        gw.register_events(Arc::downgrade(&events));
        gw.register_front("tcp://127.0.0.1:41213");
        gw.register_front("tcp://127.0.0.1:41213");
        assert_eq!(gw.fronts().len(), 1);
        gw.init();

        assert!(eventually(|| counter.connected.load(Ordering::SeqCst) == 1));
        assert_eq!(gw.request_login(&Credentials::default(), 1), 0);
        assert!(eventually(|| counter.logins.load(Ordering::SeqCst) == 1));

        let ids = [InstrumentId::new("rb2405").unwrap(), InstrumentId::new("cu2403").unwrap()];
        assert_eq!(gw.subscribe(&ids), 0);
        assert!(eventually(|| counter.subs.load(Ordering::SeqCst) == 2));
        assert!(eventually(|| counter.ticks.load(Ordering::SeqCst) >= 4));

        gw.release();
        gw.join();
    }

    #[test]
    fn test_throttled_subscribe_and_drop_forget_subscriptions() {
        let counter = Arc::new(Counter::default());
        let events: Arc<dyn GatewayEvents> = counter.clone();
        let gw = SimGateway::new(SimConfig { connect_delay: Duration::from_millis(1), ..Default::default() });
        gw.register_events(Arc::downgrade(&events));
        gw.register_front("tcp://127.0.0.1:41213");
        gw.init();
        assert!(eventually(|| counter.connected.load(Ordering::SeqCst) == 1));

        let ids = [InstrumentId::new("rb2405").unwrap()];
        gw.throttle_subscribes(1);
        assert_eq!(gw.subscribe(&ids), -3);
        assert!(gw.subscribed().is_empty());
        assert_eq!(gw.subscribe(&ids), 0);
        assert_eq!(gw.subscribed(), vec!["rb2405".to_string()]);

        gw.drop_connection(0x1001);
        assert!(gw.subscribed().is_empty());
        gw.release();
    }

    #[test]
    fn test_random_walk_ladder_is_ordered() {
        let mut walk = RandomWalk::new(1);
        for _ in 0..20 {
            let t = walk.tick("ag2406", "20240105");
            assert_eq!(t.bids.len(), MAX_DEPTH);
            assert!(t.bids.windows(2).all(|w| w[0].0 > w[1].0));
            assert!(t.asks.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(t.bids[0].0 < t.last_price && t.last_price < t.asks[0].0);
        }
    }
}
