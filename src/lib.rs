pub mod error;
pub mod gateway;
pub mod market_data;
pub mod session;
pub mod settings;
pub mod telemetry;

pub use error::{ErrorKind, GatewayError, SessionError, SessionResult};
pub use session::state::{SessionStatus, Transition};
pub use session::Session;
