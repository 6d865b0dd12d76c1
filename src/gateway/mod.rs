// Gateway capability traits: what the session calls out to, and what it is called back on.
//
// The venue SDK sits behind `Gateway`; the session implements `GatewayEvents` and
// hands a weak reference to the gateway on `init`.

use std::sync::Weak;

use crate::error::GatewayError;
use crate::market_data::record::{InstrumentId, RawTick};

pub mod sim;

/// Login credentials forwarded verbatim to the venue.
#[derive(Clone, Default, serde::Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub broker_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("broker_id", &self.broker_id)
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Venue response status attached to most responses. `error_id == 0` is success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RspInfo {
    pub error_id: i32,
    pub error_msg: String,
}

impl RspInfo {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(error_id: i32, msg: impl Into<String>) -> Self {
        Self { error_id, error_msg: msg.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.error_id == 0
    }
}

/// Payload of a successful login response.
#[derive(Debug, Clone, Default)]
pub struct LoginInfo {
    pub trading_day: String,
    pub login_time: String,
    pub session_id: i32,
    pub front_id: i32,
}

/// Outbound half of the venue connection.
///
/// Every request returns the raw venue status code: `0` success, `-1` already
/// disconnected, `-2` too many unhandled requests, `-3` too many requests.
pub trait Gateway: Send + Sync {
    /// Hand the gateway the sink it must deliver callbacks to.
    fn register_events(&self, events: Weak<dyn GatewayEvents>);
    fn register_front(&self, address: &str);
    /// Start the gateway's own threads; connection progress is reported via `on_connected`.
    fn init(&self);
    /// Block until the gateway's threads exit.
    fn join(&self);
    fn request_login(&self, credentials: &Credentials, request_id: i32) -> i32;
    fn request_logout(&self, credentials: &Credentials, request_id: i32) -> i32;
    fn subscribe(&self, instruments: &[InstrumentId]) -> i32;
    fn unsubscribe(&self, instruments: &[InstrumentId]) -> i32;
}

/// Inbound half: callbacks delivered on arbitrary gateway threads.
///
/// Implementations must never panic across this boundary and must not block
/// for longer than a short bounded wait.
pub trait GatewayEvents: Send + Sync {
    fn on_connected(&self);
    fn on_disconnected(&self, reason: i32);
    fn on_heartbeat_warning(&self, elapsed_secs: i32);
    fn on_login_response(
        &self,
        login: Option<&LoginInfo>,
        rsp: Option<&RspInfo>,
        request_id: i32,
        is_last: bool,
    );
    fn on_logout_response(&self, rsp: Option<&RspInfo>, request_id: i32, is_last: bool);
    fn on_error(&self, rsp: Option<&RspInfo>, request_id: i32, is_last: bool);
    fn on_subscribe_response(
        &self,
        instrument: Option<&str>,
        rsp: Option<&RspInfo>,
        request_id: i32,
        is_last: bool,
    );
    fn on_unsubscribe_response(
        &self,
        instrument: Option<&str>,
        rsp: Option<&RspInfo>,
        request_id: i32,
        is_last: bool,
    );
    fn on_tick(&self, tick: &RawTick);
}

/// Map a raw request status code into a typed result.
pub fn check_status(code: i32) -> Result<(), GatewayError> {
    match code {
        0 => Ok(()),
        -1 => Err(GatewayError::AlreadyDisconnected),
        -2 => Err(GatewayError::TooManyUnhandledRequests),
        -3 => Err(GatewayError::TooManyRequests),
        other => Err(GatewayError::Rejected(other)),
    }
}

/// Human readable disconnect reason.
pub fn disconnect_reason(reason: i32) -> &'static str {
    match reason {
        0x1001 => "network read failed",
        0x1002 => "network write failed",
        0x2001 => "heartbeat timeout",
        0x2002 => "heartbeat send failed",
        0x2003 => "bad heartbeat message",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_map_to_distinct_errors() {
        assert!(check_status(0).is_ok());
        assert_eq!(check_status(-1), Err(GatewayError::AlreadyDisconnected));
        assert_eq!(check_status(-2), Err(GatewayError::TooManyUnhandledRequests));
        assert_eq!(check_status(-3), Err(GatewayError::TooManyRequests));
        assert_eq!(check_status(-9), Err(GatewayError::Rejected(-9)));
    }

    #[test]
    fn test_backpressure_is_retriable_disconnect_is_not() {
        assert!(GatewayError::TooManyUnhandledRequests.is_backpressure());
        assert!(GatewayError::TooManyRequests.is_backpressure());
        assert!(!GatewayError::AlreadyDisconnected.is_backpressure());
        assert!(GatewayError::AlreadyDisconnected.needs_reconnect());
    }

    #[test]
    fn test_disconnect_reason() {
        assert_eq!(disconnect_reason(0x2001), "heartbeat timeout");
        assert_eq!(disconnect_reason(42), "unknown");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials { broker_id: "9999".into(), user_id: "u".into(), password: "secret".into() };
        let out = format!("{:?}", creds);
        assert!(!out.contains("secret"));
        assert!(out.contains("[REDACTED]"));
    }
}
