//! Fixed-position parsing of controller replies.
//!
//! A reply is split on runs of whitespace. Token 0 is the controller echo and
//! is dropped, tokens 1–5 are the numeric fields and token 6 is the gas.
//! Anything after token 6 is ignored.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::REPLY_TOKENS;
use crate::types::{Measurement, Sample};

/// Numeric field names in reply order (tokens 1–5).
const NUMERIC_FIELDS: [&str; 5] = [
    "pressure",
    "temperature",
    "volumetric-flow",
    "mass-flow",
    "set-point",
];

/// What to do with a numeric token that does not parse.
///
/// Applied to all five numeric fields the same way.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberPolicy {
    /// Field becomes 0.0. Controllers occasionally emit line noise in a
    /// numeric position and the rest of the record is still good.
    #[default]
    Lenient,
    /// The whole record fails with [`ParseError::BadNumber`].
    Strict,
}

/// Parser errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("short reply: {tokens} tokens, expected at least {REPLY_TOKENS}")]
    ShortReply { tokens: usize },

    #[error("bad number for {field}: {token:?}")]
    BadNumber { field: &'static str, token: String },
}

/// Parses one reply line into a [`Measurement`].
pub fn parse_measurement(line: &str, policy: NumberPolicy) -> Result<Measurement, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < REPLY_TOKENS {
        return Err(ParseError::ShortReply {
            tokens: tokens.len(),
        });
    }

    let mut values = [0.0f64; 5];
    for (i, (slot, field)) in values.iter_mut().zip(NUMERIC_FIELDS).enumerate() {
        *slot = parse_number(tokens[i + 1], field, policy)?;
    }
    let [pressure, temperature, volumetric_flow, mass_flow, set_point] = values;

    Ok(Measurement {
        pressure,
        temperature,
        volumetric_flow,
        mass_flow,
        set_point,
        gas: tokens[6].to_string(),
    })
}

/// Parses a reply and stamps it with `site` and the current time.
///
/// The timestamp is taken after parsing succeeds, so it marks when the
/// measurement became available rather than when the query was sent.
pub fn parse(line: &str, site: &str, policy: NumberPolicy) -> Result<Sample, ParseError> {
    let measurement = parse_measurement(line, policy)?;
    Ok(Sample::new(measurement, site, Utc::now()))
}

fn parse_number(
    token: &str,
    field: &'static str,
    policy: NumberPolicy,
) -> Result<f64, ParseError> {
    // `f64::from_str` also accepts "nan" and "inf", which JSON cannot carry
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => match policy {
            NumberPolicy::Lenient => {
                debug!("{field}: unparsable token {token:?}, using 0.0");
                Ok(0.0)
            }
            NumberPolicy::Strict => Err(ParseError::BadNumber {
                field,
                token: token.to_string(),
            }),
        },
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
