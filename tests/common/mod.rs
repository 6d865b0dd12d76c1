#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use md_session::gateway::{Credentials, Gateway, GatewayEvents};
use md_session::market_data::{InstrumentId, MarketDataRecord, Pipeline, PipelineConfig, RawTick};
use md_session::session::{Session, SessionSettings};

/// Gateway double that records every call and answers with scripted status codes.
/// Callbacks are not generated; tests invoke them on the session directly, except
/// `on_connected` which is sent from a background thread after `init` when
/// `connect_on_init` is set.
#[derive(Default)]
pub struct StubGateway {
    pub fronts: Mutex<Vec<String>>,
    pub inits: AtomicUsize,
    pub logins: Mutex<Vec<i32>>,
    pub logouts: Mutex<Vec<i32>>,
    pub subscribe_calls: Mutex<Vec<Vec<String>>>,
    pub unsubscribe_calls: Mutex<Vec<Vec<String>>>,
    pub login_code: AtomicI32,
    /// Codes returned by the next subscribe/unsubscribe calls; 0 once drained.
    pub subscribe_codes: Mutex<VecDeque<i32>>,
    pub unsubscribe_codes: Mutex<VecDeque<i32>>,
    pub connect_on_init: AtomicBool,
    events: Mutex<Option<Weak<dyn GatewayEvents>>>,
}

impl StubGateway {
    pub fn connecting() -> Arc<Self> {
        let gw = Self::default();
        gw.connect_on_init.store(true, Ordering::SeqCst);
        Arc::new(gw)
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.subscribe_calls.lock().clone()
    }

    pub fn events(&self) -> Option<Arc<dyn GatewayEvents>> {
        self.events.lock().as_ref().and_then(Weak::upgrade)
    }
}

fn names(ids: &[InstrumentId]) -> Vec<String> {
    ids.iter().map(|i| i.as_str().to_string()).collect()
}

impl Gateway for StubGateway {
    fn register_events(&self, events: Weak<dyn GatewayEvents>) {
        *self.events.lock() = Some(events);
    }

    fn register_front(&self, address: &str) {
        self.fronts.lock().push(address.to_string());
    }

    fn init(&self) {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.connect_on_init.load(Ordering::SeqCst) {
            if let Some(events) = self.events() {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    events.on_connected();
                });
            }
        }
    }

    fn join(&self) {}

    fn request_login(&self, _credentials: &Credentials, request_id: i32) -> i32 {
        self.logins.lock().push(request_id);
        self.login_code.load(Ordering::SeqCst)
    }

    fn request_logout(&self, _credentials: &Credentials, request_id: i32) -> i32 {
        self.logouts.lock().push(request_id);
        0
    }

    fn subscribe(&self, instruments: &[InstrumentId]) -> i32 {
        let code = self.subscribe_codes.lock().pop_front().unwrap_or(0);
        if code == 0 {
            self.subscribe_calls.lock().push(names(instruments));
        }
        code
    }

    fn unsubscribe(&self, instruments: &[InstrumentId]) -> i32 {
        let code = self.unsubscribe_codes.lock().pop_front().unwrap_or(0);
        if code == 0 {
            self.unsubscribe_calls.lock().push(names(instruments));
        }
        code
    }
}

/// Collects every processed record.
#[derive(Default)]
pub struct Collector {
    pub records: Mutex<Vec<MarketDataRecord>>,
}

pub fn pipeline(workers: usize, collector: &Arc<Collector>) -> Pipeline {
    let sink = Arc::clone(collector);
    let config = PipelineConfig { workers, ..PipelineConfig::default() };
    Pipeline::start(config, Arc::new(move |r: &MarketDataRecord| sink.records.lock().push(r.clone())))
        .expect("pipeline starts")
}

pub fn session(settings: SessionSettings, gateway: &Arc<StubGateway>) -> (Arc<Session>, Arc<Collector>) {
    let collector = Arc::new(Collector::default());
    let session = Session::new(settings, pipeline(2, &collector)).expect("valid settings");
    session.init(gateway.clone()).expect("init");
    (session, collector)
}

pub fn addresses() -> Vec<String> {
    vec!["tcp://127.0.0.1:41213".into(), "".into(), "tcp://127.0.0.1:41214".into()]
}

pub fn tick(id: &str, last: f64, volume: i64) -> RawTick {
    RawTick {
        instrument_id: id.to_string(),
        trading_day: "20240105".into(),
        update_time: "09:30:00".into(),
        last_price: last,
        volume,
        bids: vec![(last - 1.0, 5)],
        asks: vec![(last + 1.0, 7)],
        ..RawTick::default()
    }
}
