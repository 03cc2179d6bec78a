use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProtoError;

/// Identifier of one tracing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        RunId(Uuid::from_bytes(bytes))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RunId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(RunId)
            .map_err(|_| ProtoError::InvalidRunId(s.to_string()))
    }
}

/// Identifier of one recorded invocation, unique within the process that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(pub u64);

impl Display for SpanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(SpanId)
            .map_err(|_| ProtoError::InvalidSpanId(s.to_string()))
    }
}

// Wall clock sampled once, advanced by a monotonic clock afterwards so that
// timestamps taken in one process never go backwards.
static CLOCK_ANCHOR: Lazy<(u64, Instant)> = Lazy::new(|| {
    let wall = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    (wall, Instant::now())
});

/// Nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let (wall, anchor) = *CLOCK_ANCHOR;
        Timestamp(wall.saturating_add(anchor.elapsed().as_nanos() as u64))
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        (SystemTime::UNIX_EPOCH + Duration::from_nanos(self.0)).into()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_round_trips_through_string() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn test_run_id_serializes_as_plain_string() {
        let id = RunId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut last = Timestamp::now();
        for _ in 0..1000 {
            let now = Timestamp::now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_duration_since_saturates() {
        let early = Timestamp::from_nanos(100);
        let late = Timestamp::from_nanos(350);
        assert_eq!(late.duration_since(early), Duration::from_nanos(250));
        assert_eq!(early.duration_since(late), Duration::ZERO);
    }
}
