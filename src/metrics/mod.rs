//! Prometheus metrics
//!
//! Tracks:
//! - Step outcomes
//! - Chain writes and their failures
//! - Finality wait times
//! - Delivery polls
//!
//! There is no long-running process to scrape, so the registry is dumped in
//! text format to a file when the CLI exits.

use anyhow::Context;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

lazy_static! {
    pub static ref STEPS: CounterVec = register_counter_vec!(
        "xlend_step_total",
        "Workflow steps run, by outcome",
        &["step", "outcome"]
    ).unwrap();

    pub static ref CHAIN_WRITES: CounterVec = register_counter_vec!(
        "xlend_chain_writes_total",
        "Transactions that reached finality",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_WRITE_FAILURES: CounterVec = register_counter_vec!(
        "xlend_chain_write_failures_total",
        "Transactions that failed, by error kind",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref FINALITY_WAIT: HistogramVec = register_histogram_vec!(
        "xlend_finality_wait_seconds",
        "Time from submission to finality",
        &["chain_id"],
        vec![1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref DELIVERY_POLLS: CounterVec = register_counter_vec!(
        "xlend_delivery_polls_total",
        "Delivery polls, by result",
        &["status"]
    ).unwrap();
}

pub fn record_step(step: &str, outcome: &str) {
    STEPS.with_label_values(&[step, outcome]).inc();
}

pub fn record_write(chain_id: u64) {
    CHAIN_WRITES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_write_failure(chain_id: u64, kind: &str) {
    CHAIN_WRITE_FAILURES
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_finality_wait(chain_id: u64, elapsed: Duration) {
    FINALITY_WAIT
        .with_label_values(&[&chain_id.to_string()])
        .observe(elapsed.as_secs_f64());
}

pub fn record_delivery_poll(status: &str) {
    DELIVERY_POLLS.with_label_values(&[status]).inc();
}

/// Render everything registered so far in Prometheus text format
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not UTF-8")
}

/// Write the registry to `path` for a textfile collector
pub fn write_textfile(path: &Path) -> anyhow::Result<()> {
    let rendered = render()?;
    std::fs::write(path, rendered)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    debug!("Metrics written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_render() {
        record_step("borrow", "ok");
        record_write(11155111);
        record_write_failure(11155111, "transient");
        record_finality_wait(11155111, Duration::from_millis(1500));
        record_delivery_poll("pending");

        let text = render().unwrap();
        assert!(text.contains("xlend_step_total"));
        assert!(text.contains("xlend_chain_write_failures_total"));
        assert!(text.contains("xlend_finality_wait_seconds_bucket"));
        assert!(text.contains("status=\"pending\""));
    }

    #[test]
    fn test_textfile_written() {
        record_delivery_poll("delivered");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlend.prom");

        write_textfile(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("xlend_delivery_polls_total"));
    }
}
