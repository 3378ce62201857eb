//! Hitless database switchover for a fleet of independent processes.
//!
//! Each process runs a [`Handler`] which participates in a leaderless
//! consensus protocol over a broadcast [`Bus`](bus::Broadcast), pauses the
//! local [`App`] for a bounded window, and intercepts connection checkout so
//! that once the shared cutover marker is flipped every new connection lands
//! on the next database.
//!
//! The operator side of the protocol lives in [`Controller`].

mod app;
pub mod bus;
mod config;
mod connector;
mod control;
mod deadline;
mod handler;
mod mainloop;
pub mod marker;
mod offset;
mod state;
mod status;

pub use app::App;
pub use config::{DeadlineArgs, HandlerArgs};
pub use connector::{Connector, PgConnector, SwitchoverConn, SwitchoverManager, Target};
pub use control::{ControlMessage, Controller};
pub use deadline::DeadlineConfig;
pub use handler::{Handler, Pool};
pub use marker::CutoverMarker;
pub use offset::calc_db_offset;
pub use state::State;
pub use status::Status;

/// Channel carrying serialized node [`Status`] announcements.
pub const STATE_CHANNEL: &str = "switchover_state";
/// Channel carrying [`ControlMessage`]s from the operator.
pub const CONTROL_CHANNEL: &str = "switchover_control";
/// Interval at which each node re-announces its status.
pub const STATUS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);
/// Advisory lock key which serializes connection acquisition against the cutover.
pub const GLOBAL_SWITCHOVER_LOCK: i64 = 4369;

/// Error parsing a wire payload.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing required field {0:?}")]
    Missing(&'static str),
    #[error("invalid state {0:?}")]
    State(String),
    #[error("invalid duration for {field}")]
    Duration {
        field: &'static str,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid timestamp for {field}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid integer for {field}")]
    Integer {
        field: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid boolean for {field}")]
    Bool {
        field: &'static str,
        #[source]
        source: std::str::ParseBoolError,
    },
    #[error("duration for {0} is out of range")]
    OutOfRange(&'static str),
}

// Parse a flat `key=value&...` payload into its pairs.
pub(crate) fn decode_pairs(payload: &str) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(payload.as_bytes())
        .into_owned()
        .collect()
}

pub(crate) fn required<'m>(
    pairs: &'m std::collections::HashMap<String, String>,
    key: &'static str,
) -> Result<&'m str, ParseError> {
    pairs
        .get(key)
        .map(String::as_str)
        .ok_or(ParseError::Missing(key))
}

pub(crate) fn parse_duration(
    pairs: &std::collections::HashMap<String, String>,
    key: &'static str,
) -> Result<std::time::Duration, ParseError> {
    humantime::parse_duration(required(pairs, key)?)
        .map_err(|source| ParseError::Duration { field: key, source })
}
