// crates/alphred-core/src/core/time.rs
// ============================================================================
// Module: Alphred Time Model
// Description: Canonical timestamp representation and clock seam.
// Purpose: Provide deterministic, database-stable time values across records.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Every persisted timestamp is unix epoch milliseconds with a canonical
//! RFC3339 UTC rendering at millisecond precision. The core never reads the
//! wall clock directly; the executor receives a [`Clock`] so tests can pin
//! time, and the SQL store stamps its own `updated_at` columns.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Canonical timestamp stored on every tracked row.
///
/// # Invariants
/// - The value is unix epoch milliseconds (UTC).
/// - The database rendering is RFC3339 with exactly three fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp from unix epoch milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as unix epoch milliseconds.
    #[must_use]
    pub const fn unix_millis(self) -> i64 {
        self.0
    }

    /// Renders the canonical RFC3339 UTC form with millisecond precision.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        let seconds = self.0.div_euclid(1_000);
        let millis = self.0.rem_euclid(1_000);
        let rendered = OffsetDateTime::from_unix_timestamp(seconds)
            .ok()
            .and_then(|instant| instant.format(&Rfc3339).ok());
        match rendered {
            Some(formatted) => {
                // Rfc3339 renders whole seconds with a trailing Z; splice the
                // millisecond field in so the stored form is stable.
                let base = formatted.trim_end_matches('Z');
                format!("{base}.{millis:03}Z")
            }
            None => format!("invalid-epoch-millis:{}", self.0),
        }
    }

    /// Parses the canonical RFC3339 form (returns `None` on malformed input).
    #[must_use]
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
        let nanos = parsed.unix_timestamp_nanos();
        i64::try_from(nanos / 1_000_000).ok().map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

// ============================================================================
// SECTION: Clock Seam
// ============================================================================

/// Clock seam supplying timestamps to the runtime.
///
/// Implementations must be monotone enough for record ordering; the executor
/// only compares timestamps produced within one process.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        Timestamp::from_unix_millis(millis)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use super::Timestamp;

    /// Renders millisecond precision with a trailing Z.
    #[test]
    fn rfc3339_millisecond_rendering() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_123);
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:20.123Z");
        let zero = Timestamp::from_unix_millis(0);
        assert_eq!(zero.to_rfc3339(), "1970-01-01T00:00:00.000Z");
    }

    /// Round-trips through the canonical rendering.
    #[test]
    fn rfc3339_round_trip() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_007);
        let back = Timestamp::parse_rfc3339(&ts.to_rfc3339()).unwrap();
        assert_eq!(back, ts);
    }

    /// Ordering follows epoch milliseconds.
    #[test]
    fn ordering_follows_millis() {
        let earlier = Timestamp::from_unix_millis(10);
        let later = Timestamp::from_unix_millis(11);
        assert!(earlier < later);
    }
}
