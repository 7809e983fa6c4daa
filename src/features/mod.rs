//! Feature extraction -- raw traffic observations to validated feature vectors.

pub mod vector;

pub use self::vector::{FeatureVector, TRAFFIC_FIELDS};

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("invalid source address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid feature {field}: {value} (must be finite and non-negative)")]
    InvalidFeature { field: &'static str, value: f64 },
}

/// One already-demultiplexed traffic unit as delivered by a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default, alias = "ip_address", alias = "ip", alias = "src")]
    pub source_address: Option<String>,
    #[serde(alias = "PacketSize")]
    pub packet_size: f64,
    #[serde(alias = "ResponseTime")]
    pub response_time: f64,
}

impl Observation {
    pub fn new(source_address: Option<&str>, packet_size: f64, response_time: f64) -> Self {
        Self {
            source_address: source_address.map(str::to_string),
            packet_size,
            response_time,
        }
    }
}

/// An observation that passed extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub source: Option<IpAddr>,
    pub features: FeatureVector,
}

impl Flow {
    /// Canonical textual address, empty when the feed supplied none.
    pub fn source_address(&self) -> String {
        self.source.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

/// Validate an observation and turn it into a traffic feature vector.
///
/// A blank source address counts as absent. Anything else must be an IPv4 or
/// IPv6 literal.
pub fn extract(obs: &Observation) -> Result<Flow, FeatureError> {
    let source = match obs.source_address.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<IpAddr>()
                .map_err(|_| FeatureError::InvalidAddress(raw.to_string()))?,
        ),
    };

    let packet_size = check_feature("packet_size", obs.packet_size)?;
    let response_time = check_feature("response_time", obs.response_time)?;

    Ok(Flow {
        source,
        features: FeatureVector::traffic(packet_size, response_time),
    })
}

fn check_feature(field: &'static str, value: f64) -> Result<f64, FeatureError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(FeatureError::InvalidFeature { field, value })
    }
}
