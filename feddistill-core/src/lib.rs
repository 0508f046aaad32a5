//! # feddistill-core: federated, trust-weighted knowledge distillation
//!
//! A fixed set of independently trained clients runs repeated rounds. Each
//! round every client trains locally; after the pretraining rounds, it trains
//! against a distillation target built from the previous round's soft
//! decisions of all clients on a shared reference dataset, weighted by
//! per-client trust.
//!
//! The crate owns the orchestration only: phase gating, the one-round
//! lookback of soft decisions, trust-weight bookkeeping and per-round metric
//! history. Local optimisation, model internals and the trust formula live
//! behind the [`Client`] trait.

pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod report;
pub mod tensor;
pub mod training;

pub use client::{Client, ClientError, ClientId, EvalMode, TargetWithTrust};
pub use config::{DistillConfig, TrainerSettings};
pub use data::ReferenceLoader;
pub use error::DistillError;
pub use metrics::{Metric, MetricName};
pub use report::{ClientRecord, JsonLinesSink, MemorySink, ReportSink, RoundSummary, TracingSink};
pub use training::{Phase, RoundHistory, Trainer, TrainingOutcome, TrustWeights};
