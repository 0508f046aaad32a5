//! Training infrastructure: round history, the per-round orchestrator and the
//! training loop.

pub mod history;
pub mod orchestrator;
pub mod trainer;

pub use history::{HistoryTriple, RoundHistory, RoundLog, TrainingOutcome, TrustWeights};
pub use orchestrator::{Phase, RegisteredClient};
pub use trainer::Trainer;
