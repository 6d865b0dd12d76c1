mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{pipeline, session, tick, Collector, StubGateway};
use md_session::gateway::GatewayEvents;
use md_session::session::SessionSettings;

#[test]
fn single_producer_order_is_preserved_per_instrument() {
    let gw = StubGateway::connecting();
    let (s, collector) = session(SessionSettings::default(), &gw);

    for volume in 1..=500 {
        for id in ["rb2405", "cu2403", "ag2406"] {
            s.on_tick(&tick(id, 100.0, volume));
        }
    }
    assert!(s.pipeline().wait_idle(Duration::from_secs(5)));

    let records = collector.records.lock();
    let mut by_instrument: HashMap<String, Vec<i64>> = HashMap::new();
    for r in records.iter() {
        by_instrument.entry(r.instrument.to_string()).or_default().push(r.volume);
    }
    let stats = s.pipeline().stats();
    for (id, volumes) in by_instrument {
        assert!(volumes.windows(2).all(|w| w[0] < w[1]), "{id} out of order");
        if stats.evicted == 0 {
            assert_eq!(volumes.len(), 500, "{id}");
        }
    }
}

#[test]
fn concurrent_callbacks_keep_each_source_in_order() {
    let collector = Arc::new(Collector::default());
    let pipeline = Arc::new(pipeline(4, &collector));
    let instruments = ["rb2405", "cu2403", "ag2406", "au2406", "sc2405"];

    // every producer numbers its own ticks in `volume` and tags them in `last_price`
    let producers: Vec<_> = (0..4)
        .map(|t| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                for i in 0..200 {
                    for id in instruments {
                        let _ = pipeline.ingest(&tick(id, 3600.0 + t as f64, i));
                    }
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    assert!(pipeline.wait_idle(Duration::from_secs(5)));

    let records = collector.records.lock();
    let mut streams: HashMap<(String, i64), Vec<i64>> = HashMap::new();
    for r in records.iter() {
        let producer = (r.last_price - 3600.0) as i64;
        streams.entry((r.instrument.to_string(), producer)).or_default().push(r.volume);
    }
    assert!(!streams.is_empty());
    for ((id, producer), volumes) in &streams {
        assert!(volumes.windows(2).all(|w| w[0] < w[1]), "{id} from producer {producer} out of order");
    }
    assert_eq!(pipeline.pool().in_use(), 0);

    let stats = pipeline.stats();
    assert_eq!(stats.received, 4 * 200 * instruments.len() as u64);
    assert_eq!(stats.processed + stats.evicted + stats.rejected, stats.received);
}
