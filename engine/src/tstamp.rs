//! Timestamps handed out by the coordination store's own clock.
//!
//! Every ordering guarantee in this system (delta ordering within a
//! transaction, reconnection catch-up, cache staleness) rests on one thing:
//! the timestamp attached to a change is never read from a process's local
//! wall clock. It comes from the coordination store, so concurrent writers
//! on different machines still produce a single total order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(seconds, micros)` pair as returned by the coordination store's clock
/// command. `Ord` compares seconds first, then micros, giving a total order
/// matching wall-clock progression as observed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tstamp {
    secs: i64,
    micros: i64,
}

impl Tstamp {
    pub const EPOCH: Tstamp = Tstamp { secs: 0, micros: 0 };

    pub fn new(secs: i64, micros: i64) -> Self {
        Self { secs, micros }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn micros(&self) -> i64 {
        self.micros
    }

    /// The fractional-seconds float the wire protocol represents timestamps
    /// as, matching the original implementation's `_make_tstamp`.
    pub fn as_f64(&self) -> f64 {
        self.secs as f64 + (self.micros as f64 / 1_000_000.0)
    }

    pub fn from_f64(value: f64) -> Self {
        let secs = value.trunc() as i64;
        let micros = ((value.fract()) * 1_000_000.0).round() as i64;
        Self { secs, micros }
    }
}

impl fmt::Display for Tstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

impl Serialize for TstampWire {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.0.as_f64())
    }
}

/// Wrapper used only at the wire boundary, where a [`Tstamp`] must encode as
/// a bare float rather than the `{secs, micros}` struct used internally.
pub struct TstampWire(pub Tstamp);

impl<'de> Deserialize<'de> for TstampWire {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Ok(TstampWire(Tstamp::from_f64(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_by_seconds_then_micros() {
        let a = Tstamp::new(10, 500);
        let b = Tstamp::new(10, 600);
        let c = Tstamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn float_roundtrip() {
        let t = Tstamp::new(1_700_000_000, 123_456);
        let back = Tstamp::from_f64(t.as_f64());
        assert_eq!(t, back);
    }

    #[test]
    fn wire_serializes_as_bare_float() {
        let wire = TstampWire(Tstamp::new(5, 250_000));
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(json, "5.25");
    }
}
