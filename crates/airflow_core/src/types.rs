//! Data model for one controller exchange.
//!
//! A [`RawReply`] comes off the serial line, the parser turns it into a
//! [`Measurement`], and the sampler stamps it into a [`Sample`] that goes out
//! on the publish bus as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::TERMINATOR;

// ──────────────────────────────────────────────
// Device endpoint
// ──────────────────────────────────────────────

/// How a reply is framed on the serial line.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Read until the carriage-return terminator.
    #[default]
    Terminated,
    /// One bounded read, returned as-is. Legacy firmware only.
    SingleRead,
}

/// How to reach one controller. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    /// Serial device path (ex: "/dev/ttyS5")
    pub path: String,
    /// Line speed in baud
    pub baud_rate: u32,
    /// Query address of the controller on the line (ex: "A")
    pub address: String,
    /// Upper bound for one reply to arrive
    pub read_timeout: Duration,
    /// Reply framing strategy
    pub framing: Framing,
    /// Buffer size for [`Framing::SingleRead`]
    pub single_read_max_len: usize,
}

// ──────────────────────────────────────────────
// Raw reply
// ──────────────────────────────────────────────

/// Bytes of one controller reply, terminator included when framed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawReply(Vec<u8>);

impl RawReply {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the reply ends with the carriage-return terminator.
    pub fn is_terminated(&self) -> bool {
        self.0.last() == Some(&TERMINATOR)
    }

    /// Reply decoded as text; invalid UTF-8 is replaced, not rejected.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

// ──────────────────────────────────────────────
// Measurement / Sample
// ──────────────────────────────────────────────

/// Typed fields of one controller reply. Units are whatever the firmware uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub pressure: f64,
    pub temperature: f64,
    /// Wire name keeps the historical spelling consumers already rely on.
    #[serde(rename = "volumetic-flow")]
    pub volumetric_flow: f64,
    #[serde(rename = "mass-flow")]
    pub mass_flow: f64,
    #[serde(rename = "set-point")]
    pub set_point: f64,
    /// Gas identifier token (ex: "N2", "Air")
    pub gas: String,
}

/// One site-tagged, timestamped measurement ready for publication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    #[serde(flatten)]
    pub measurement: Measurement,
    pub site: String,
    /// Capture time, taken when parsing completed
    pub at: DateTime<Utc>,
}

impl Sample {
    pub fn new(measurement: Measurement, site: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            measurement,
            site: site.into(),
            at,
        }
    }

    pub fn mass_flow(&self) -> f64 {
        self.measurement.mass_flow
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_measurement_is_zeroed() {
        let m = Measurement::default();
        assert_eq!(m.pressure, 0.0);
        assert_eq!(m.mass_flow, 0.0);
        assert!(m.gas.is_empty());
    }

    #[test]
    fn raw_reply_detects_terminator() {
        assert!(RawReply::new(b"OK 1\r".to_vec()).is_terminated());
        assert!(!RawReply::new(b"OK 1".to_vec()).is_terminated());
        assert!(!RawReply::default().is_terminated());
    }

    #[test]
    fn raw_reply_text_is_lossy() {
        let reply = RawReply::new(vec![b'O', b'K', 0xFF, b'\r']);
        assert_eq!(reply.to_text(), "OK\u{FFFD}\r");
    }

    #[test]
    fn framing_uses_kebab_case() {
        let json = serde_json::to_string(&Framing::SingleRead).unwrap();
        assert_eq!(json, "\"single-read\"");
    }

    #[test]
    fn sample_exposes_mass_flow() {
        let sample = Sample::new(
            Measurement {
                mass_flow: 118.3,
                ..Default::default()
            },
            "glbrc",
            Utc::now(),
        );
        assert_eq!(sample.mass_flow(), 118.3);
        assert_eq!(sample.site, "glbrc");
    }
}
