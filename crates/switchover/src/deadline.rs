use super::{decode_pairs, parse_duration, required, ParseError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

/// DeadlineConfig is the timing contract of one switchover attempt.
///
/// All deadlines are derived from `begin_at`, which is re-based on receipt
/// by each node's own clock offset so that every node acts against the same
/// database-relative instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineConfig {
    pub begin_at: DateTime<Utc>,
    /// Time allowed for every node to arm.
    pub consensus_timeout: Duration,
    /// Delay from `begin_at` until nodes begin to pause.
    pub pause_delay: Duration,
    /// Time allowed for the local pause to complete.
    pub pause_timeout: Duration,
    /// Maximum time the fleet may remain paused.
    pub max_pause: Duration,
    /// Keep the API serving while paused.
    pub no_pause_api: bool,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            begin_at: Utc::now(),
            consensus_timeout: Duration::from_secs(3),
            pause_delay: Duration::from_secs(5),
            pause_timeout: Duration::from_secs(10),
            max_pause: Duration::from_secs(13),
            no_pause_api: false,
        }
    }
}

impl DeadlineConfig {
    pub fn consensus_deadline(&self) -> DateTime<Utc> {
        after(self.begin_at, self.consensus_timeout)
    }

    pub fn pause_at(&self) -> DateTime<Utc> {
        after(self.begin_at, self.pause_delay)
    }

    pub fn pause_deadline(&self) -> DateTime<Utc> {
        after(self.pause_at(), self.pause_timeout)
    }

    pub fn absolute_deadline(&self) -> DateTime<Utc> {
        after(self.pause_at(), self.max_pause)
    }

    /// Encode for the control channel. `offset` is the sender's clock offset
    /// from the database, which is applied to `begin_at` so that the encoded
    /// instant is in database time.
    pub fn serialize(&self, offset: chrono::Duration) -> String {
        let begin_at = (self.begin_at + offset).to_rfc3339_opts(SecondsFormat::Nanos, true);

        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("BeginAt", &begin_at)
            .append_pair(
                "ConsensusTimeout",
                &humantime::format_duration(self.consensus_timeout).to_string(),
            )
            .append_pair(
                "PauseDelay",
                &humantime::format_duration(self.pause_delay).to_string(),
            )
            .append_pair(
                "PauseTimeout",
                &humantime::format_duration(self.pause_timeout).to_string(),
            )
            .append_pair(
                "MaxPause",
                &humantime::format_duration(self.max_pause).to_string(),
            )
            .append_pair("NoPauseAPI", &self.no_pause_api.to_string())
            .finish()
    }

    /// Decode a control channel payload. `offset` is the receiver's clock
    /// offset from the database, used to translate `begin_at` into local time.
    pub fn parse(payload: &str, offset: chrono::Duration) -> Result<Self, ParseError> {
        let pairs = decode_pairs(payload);

        let begin_at = DateTime::parse_from_rfc3339(required(&pairs, "BeginAt")?)
            .map_err(|source| ParseError::Timestamp {
                field: "BeginAt",
                source,
            })?
            .with_timezone(&Utc);

        let no_pause_api = required(&pairs, "NoPauseAPI")?
            .parse()
            .map_err(|source| ParseError::Bool {
                field: "NoPauseAPI",
                source,
            })?;

        Ok(Self {
            begin_at: begin_at - offset,
            consensus_timeout: parse_duration(&pairs, "ConsensusTimeout")?,
            pause_delay: parse_duration(&pairs, "PauseDelay")?,
            pause_timeout: parse_duration(&pairs, "PauseTimeout")?,
            max_pause: parse_duration(&pairs, "MaxPause")?,
            no_pause_api,
        })
    }
}

/// Translate a wall-clock instant into the tokio clock.
pub(crate) fn instant_of(at: DateTime<Utc>) -> tokio::time::Instant {
    // Capped, as adding an unbounded duration to an Instant overflows.
    let remaining = (at - Utc::now())
        .to_std()
        .unwrap_or_default()
        .min(Duration::from_secs(86_400 * 365));
    tokio::time::Instant::now() + remaining
}

// Saturating `t + d`, as durations arrive from the wire.
fn after(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
