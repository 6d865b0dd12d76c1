// Tick snapshot value type and the pure mapping from the gateway's raw tick into it.

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Longest instrument identifier the venue accepts (its C buffer is 31 bytes incl. NUL).
pub const MAX_INSTRUMENT_LEN: usize = 30;

/// Price/volume levels kept per side.
pub const MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentIdError {
    #[error("instrument id is empty")]
    Empty,
    #[error("instrument id {id:?} exceeds {max} bytes")]
    TooLong { id: String, max: usize },
}

/// Fixed-capacity, copyable instrument identifier. Over-length input is rejected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstrumentId {
    len: u8,
    bytes: [u8; MAX_INSTRUMENT_LEN],
}

impl InstrumentId {
    pub fn new(id: &str) -> Result<Self, InstrumentIdError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(InstrumentIdError::Empty);
        }
        if id.len() > MAX_INSTRUMENT_LEN {
            return Err(InstrumentIdError::TooLong { id: id.to_string(), max: MAX_INSTRUMENT_LEN });
        }
        let mut bytes = [0u8; MAX_INSTRUMENT_LEN];
        bytes[..id.len()].copy_from_slice(id.as_bytes());
        Ok(Self { len: id.len() as u8, bytes })
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from a &str, so the prefix is valid UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl TryFrom<&str> for InstrumentId {
    type Error = InstrumentIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl fmt::Debug for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl Serialize for InstrumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One depth level. An unpopulated level is `price == 0.0, volume == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Level {
    pub price: f64,
    pub volume: i64,
}

/// Depth-market-data tick as the gateway hands it over.
#[derive(Debug, Clone, Default)]
pub struct RawTick {
    pub instrument_id: String,
    pub trading_day: String, // "YYYYMMDD"
    pub update_time: String, // "HH:MM:SS", venue local
    pub update_millisec: i32,
    pub last_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,
    pub pre_open_interest: f64,
    pub open_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub close_price: f64,
    pub average_price: f64,
    pub volume: i64,
    pub turnover: f64,
    pub open_interest: f64,
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub settlement_price: f64,
    pub bids: Vec<(f64, i64)>, // best first
    pub asks: Vec<(f64, i64)>,
}

/// Normalised tick snapshot. `Default` is the all-sentinel state a pooled slot is reset to.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketDataRecord {
    /// Pipeline-assigned arrival sequence, 0 until enqueued.
    pub sequence: u64,
    pub instrument: InstrumentId,
    pub trading_day: u32,
    /// Milliseconds since venue-local midnight.
    pub update_ms: u32,
    pub last_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,
    pub pre_open_interest: f64,
    pub open_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub close_price: f64,
    pub average_price: f64,
    pub volume: i64,
    pub turnover: f64,
    pub open_interest: f64,
    pub bids: [Level; MAX_DEPTH],
    pub asks: [Level; MAX_DEPTH],
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub settlement_price: f64,
}

impl MarketDataRecord {
    /// Back to sentinel values, every field.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_blank(&self) -> bool {
        *self == Self::default()
    }

    pub fn from_raw(src: &RawTick) -> Result<Self, InstrumentIdError> {
        let mut record = Self::default();
        convert(&mut record, src)?;
        Ok(record)
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied().filter(|l| l.volume > 0)
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied().filter(|l| l.volume > 0)
    }
}

/// Populate `dst` from `src`. `dst` is reset first so nothing from a previous use survives,
/// ladder levels beyond what `src` carries stay at the sentinel.
pub fn convert(dst: &mut MarketDataRecord, src: &RawTick) -> Result<(), InstrumentIdError> {
    dst.reset();
    dst.instrument = InstrumentId::new(&src.instrument_id)?;
    dst.trading_day = src.trading_day.trim().parse().unwrap_or(0);
    dst.update_ms = parse_update_ms(&src.update_time, src.update_millisec);

    dst.last_price = price(src.last_price);
    dst.pre_settlement_price = price(src.pre_settlement_price);
    dst.pre_close_price = price(src.pre_close_price);
    dst.pre_open_interest = src.pre_open_interest;
    dst.open_price = price(src.open_price);
    dst.highest_price = price(src.highest_price);
    dst.lowest_price = price(src.lowest_price);
    dst.close_price = price(src.close_price);
    dst.average_price = price(src.average_price);
    dst.volume = src.volume;
    dst.turnover = src.turnover;
    dst.open_interest = src.open_interest;
    dst.upper_limit_price = price(src.upper_limit_price);
    dst.lower_limit_price = price(src.lower_limit_price);
    dst.settlement_price = price(src.settlement_price);

    copy_levels(&mut dst.bids, &src.bids);
    copy_levels(&mut dst.asks, &src.asks);
    Ok(())
}

fn copy_levels(dst: &mut [Level; MAX_DEPTH], src: &[(f64, i64)]) {
    for (slot, &(px, vol)) in dst.iter_mut().zip(src.iter()) {
        *slot = Level { price: price(px), volume: vol };
    }
}

// The venue marks "no value" with DBL_MAX.
fn price(p: f64) -> f64 {
    if p.is_finite() && p.abs() < f64::MAX {
        p
    } else {
        0.0
    }
}

fn parse_update_ms(time: &str, millis: i32) -> u32 {
    let mut parts = time.trim().splitn(3, ':').map(|p| p.parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(h)), Some(Ok(m)), Some(Ok(s))) if h < 24 && m < 60 && s < 61 => {
            ((h * 60 + m) * 60 + s) * 1000 + millis.clamp(0, 999) as u32
        }
        _ => 0,
    }
}
