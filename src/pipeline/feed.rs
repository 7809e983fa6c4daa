//! Observation feeds: JSONL replay and simulated traffic.

use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BaselineConfig;
use crate::features::{extract, FeatureVector, Observation};

/// Narrow band: typical traffic, mean 50 and scale 15 for both features.
pub const NARROW_BAND: (f64, f64) = (50.0, 15.0);

/// Wide band: attack-like traffic, mean 100 and scale 20 for both features.
pub const WIDE_BAND: (f64, f64) = (100.0, 20.0);

/// Standard normal draw (Box-Muller).
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>(); // (0, 1], keeps ln finite
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn band(n: usize, seed: u64, (mean, scale): (f64, f64), subnet: &str) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            // Sizes and latencies cannot be negative.
            let packet_size = (mean + scale * standard_normal(&mut rng)).max(0.0);
            let response_time = (mean + scale * standard_normal(&mut rng)).max(0.0);
            Observation {
                source_address: Some(format!("{subnet}.{}", 1 + i % 254)),
                packet_size,
                response_time,
            }
        })
        .collect()
}

/// `n` narrow-band observations from 192.168.1.0/24.
pub fn narrow_band(n: usize, seed: u64) -> Vec<Observation> {
    band(n, seed, NARROW_BAND, "192.168.1")
}

/// `n` wide-band observations from 203.0.113.0/24.
pub fn wide_band(n: usize, seed: u64) -> Vec<Observation> {
    band(n, seed, WIDE_BAND, "203.0.113")
}

/// Narrow-band traffic followed by wide-band traffic.
pub fn simulated_traffic(normal: usize, attack: usize, seed: u64) -> Vec<Observation> {
    let mut traffic = narrow_band(normal, seed);
    traffic.extend(wide_band(attack, seed.wrapping_add(1)));
    traffic
}

/// Parse one JSONL line. Blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Option<serde_json::Result<Observation>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Read every well-formed observation from a JSONL file.
pub fn read_jsonl(path: &Path) -> Result<Vec<Observation>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read observations: {}", path.display()))?;

    let mut out = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        match parse_line(line) {
            None => {}
            Some(Ok(obs)) => out.push(obs),
            Some(Err(e)) => warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping malformed observation"),
        }
    }
    Ok(out)
}

/// Outcome of a replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sent: u64,
    pub malformed: u64,
}

/// Stream JSONL observations from `reader` into the pipeline queue.
///
/// Malformed lines are skipped. Stops early if the pipeline has shut down.
pub async fn replay<R>(reader: R, sender: mpsc::Sender<Observation>) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = ReplaySummary::default();
    let mut lineno = 0u64;

    while let Some(line) = lines.next_line().await.context("failed to read feed")? {
        lineno += 1;
        match parse_line(&line) {
            None => {}
            Some(Ok(obs)) => {
                if sender.send(obs).await.is_err() {
                    warn!(line = lineno, "pipeline closed, stopping replay");
                    break;
                }
                summary.sent += 1;
            }
            Some(Err(e)) => {
                summary.malformed += 1;
                debug!(line = lineno, error = %e, "skipping malformed observation");
            }
        }
    }

    info!(sent = summary.sent, malformed = summary.malformed, "feed replay finished");
    Ok(summary)
}

/// Push already-built observations into the pipeline queue.
pub async fn send_all(observations: Vec<Observation>, sender: mpsc::Sender<Observation>) -> Result<u64> {
    let mut sent = 0;
    for obs in observations {
        sender
            .send(obs)
            .await
            .map_err(|_| anyhow::anyhow!("pipeline closed after {sent} observations"))?;
        sent += 1;
    }
    Ok(sent)
}

/// Baseline feature vectors: from the configured JSONL file, or simulated narrow-band
/// traffic. Observations that fail extraction are left out.
pub fn load_baseline(cfg: &BaselineConfig) -> Result<Vec<FeatureVector>> {
    let observations = match &cfg.source {
        Some(path) => read_jsonl(path)?,
        None => narrow_band(cfg.simulated_samples, cfg.seed),
    };

    let total = observations.len();
    let vectors: Vec<FeatureVector> = observations
        .iter()
        .filter_map(|o| match extract(o) {
            Ok(flow) => Some(flow.features),
            Err(e) => {
                warn!(error = %e, "baseline observation rejected");
                None
            }
        })
        .collect();

    info!(
        accepted = vectors.len(),
        rejected = total - vectors.len(),
        simulated = cfg.source.is_none(),
        "baseline loaded"
    );
    Ok(vectors)
}
