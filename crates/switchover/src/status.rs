use super::{decode_pairs, required, ParseError, State};
use chrono::{DateTime, Utc};

/// Status is a node's announcement of its current switchover state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub node_id: String,
    pub state: State,
    /// Clock offset of the node relative to the old database.
    pub offset: chrono::Duration,
    /// Identity of the old database.
    pub db_id: String,
    /// Identity of the next database.
    pub db_next_id: String,
    pub active_requests: u64,
    /// When this status was received. Local only, and never serialized.
    pub at: DateTime<Utc>,
}

impl Status {
    /// Encode as a `key=value` payload suitable for the state channel.
    pub fn serialize(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("NodeID", &self.node_id)
            .append_pair("State", self.state.into_str())
            .append_pair("Offset", &format_offset(self.offset))
            .append_pair("DBID", &self.db_id)
            .append_pair("DBNextID", &self.db_next_id)
            .append_pair("ActiveRequests", &self.active_requests.to_string())
            .finish()
    }

    /// Decode a state channel payload, stamping it as received now.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let pairs = decode_pairs(payload);

        let state = required(&pairs, "State")?;
        let state = state
            .parse()
            .map_err(|_| ParseError::State(state.to_string()))?;

        let active_requests = required(&pairs, "ActiveRequests")?
            .parse()
            .map_err(|source| ParseError::Integer {
                field: "ActiveRequests",
                source,
            })?;

        Ok(Self {
            node_id: required(&pairs, "NodeID")?.to_string(),
            state,
            offset: parse_offset(required(&pairs, "Offset")?)?,
            db_id: required(&pairs, "DBID")?.to_string(),
            db_next_id: required(&pairs, "DBNextID")?.to_string(),
            active_requests,
            at: Utc::now(),
        })
    }

    /// Returns true if both nodes are configured against the same pair of databases.
    pub fn same_databases(&self, other: &Status) -> bool {
        self.db_id == other.db_id && self.db_next_id == other.db_next_id
    }
}

// Offsets may be negative, which humantime can't represent directly.
fn format_offset(offset: chrono::Duration) -> String {
    let magnitude = offset.abs().to_std().unwrap_or_default();
    let formatted = humantime::format_duration(magnitude).to_string();

    if offset < chrono::Duration::zero() {
        format!("-{formatted}")
    } else {
        formatted
    }
}

fn parse_offset(s: &str) -> Result<chrono::Duration, ParseError> {
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let magnitude = humantime::parse_duration(s).map_err(|source| ParseError::Duration {
        field: "Offset",
        source,
    })?;
    let magnitude =
        chrono::Duration::from_std(magnitude).map_err(|_| ParseError::OutOfRange("Offset"))?;

    Ok(if negative { -magnitude } else { magnitude })
}
