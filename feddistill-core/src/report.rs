//! Reporting boundary: per-round summaries and per-client records.
//!
//! Sinks only observe. They receive shared references and cannot feed
//! anything back into orchestration state.

use std::collections::BTreeMap;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DistillError;

/// Round-level means and their change since the previous round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: usize,
    pub mean_test_accuracy: f64,
    pub mean_test_accuracy_delta: f64,
    pub mean_ref_accuracy: f64,
    pub mean_ref_accuracy_delta: f64,
}

impl RoundSummary {
    /// One-line progress description.
    pub fn description(&self) -> String {
        format!(
            "global epochs (local accuracy: {:.5}[{:+.5}] | global accuracy: {:.5}[{:+.5}])",
            self.mean_test_accuracy,
            self.mean_test_accuracy_delta,
            self.mean_ref_accuracy,
            self.mean_ref_accuracy_delta
        )
    }
}

/// Raw metrics of one client in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub round: usize,
    pub client: usize,
    pub train_accuracy: f64,
    pub test_accuracy: f64,
    pub ref_accuracy: f64,
}

/// Flat experiment-tracking record: `global_epoch` plus
/// `{idx}_train_accuracy`, `{idx}_test_accuracy`, `{idx}_ref_accuracy`.
pub fn flat_record(round: usize, clients: &[ClientRecord]) -> BTreeMap<String, f64> {
    let mut record = BTreeMap::new();
    record.insert("global_epoch".to_string(), round as f64);
    for c in clients {
        record.insert(format!("{}_train_accuracy", c.client), c.train_accuracy);
        record.insert(format!("{}_test_accuracy", c.client), c.test_accuracy);
        record.insert(format!("{}_ref_accuracy", c.client), c.ref_accuracy);
    }
    record
}

/// Receives a report at the end of every round.
pub trait ReportSink {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError>;
}

impl<S: ReportSink + ?Sized> ReportSink for &mut S {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError> {
        (**self).on_round_end(summary, clients)
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Box<S> {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError> {
        (**self).on_round_end(summary, clients)
    }
}

impl<A: ReportSink, B: ReportSink> ReportSink for (A, B) {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError> {
        self.0.on_round_end(summary, clients)?;
        self.1.on_round_end(summary, clients)
    }
}

/// Logs every round through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError> {
        tracing::info!(
            round = summary.round,
            global_test_accuracy = summary.mean_test_accuracy,
            global_ref_accuracy = summary.mean_ref_accuracy,
            "{}",
            summary.description()
        );
        for c in clients {
            tracing::debug!(
                round = c.round,
                client = c.client,
                train_accuracy = c.train_accuracy,
                test_accuracy = c.test_accuracy,
                ref_accuracy = c.ref_accuracy,
                "client metrics"
            );
        }
        Ok(())
    }
}

/// Keeps every report in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub summaries: Vec<RoundSummary>,
    pub clients: Vec<ClientRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportSink for MemorySink {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError> {
        self.summaries.push(summary.clone());
        self.clients.extend_from_slice(clients);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct JsonLine<'a> {
    run_id: Uuid,
    recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    summary: &'a RoundSummary,
    clients: BTreeMap<String, f64>,
}

/// Writes one JSON object per round.
pub struct JsonLinesSink<W: Write> {
    run_id: Uuid,
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            writer,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn on_round_end(
        &mut self,
        summary: &RoundSummary,
        clients: &[ClientRecord],
    ) -> Result<(), DistillError> {
        let line = JsonLine {
            run_id: self.run_id,
            recorded_at: Utc::now(),
            summary,
            clients: flat_record(summary.round, clients),
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
