//! The capability boundary between the orchestrator and a client learner.
//!
//! A client owns a private model and private data. The orchestrator only ever
//! talks to it through [`Client`]; it never reads or writes client state.

use std::error::Error;
use std::fmt;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::data::ReferenceLoader;
use crate::metrics::MetricName;

/// Which private split a client evaluates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    Train,
    Test,
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalMode::Train => f.write_str("train"),
            EvalMode::Test => f.write_str("test"),
        }
    }
}

/// Stable identity of a client within one run.
pub type ClientId = String;

/// Distillation target plus the trust weight the client used to build it.
pub type TargetWithTrust = (Option<Array2<f32>>, Array1<f32>);

/// Error raised by a client capability.
///
/// The wrapped error is reported as-is: display and source chain pass through.
#[derive(Debug)]
pub struct ClientError(Box<dyn Error + Send + Sync + 'static>);

impl ClientError {
    pub fn new<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Self(msg.into().into())
    }

    pub fn into_inner(self) -> Box<dyn Error + Send + Sync + 'static> {
        self.0
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

/// Capabilities a federated learner exposes to the orchestrator.
pub trait Client: Send {
    /// One local epoch. `target` is `None` during the local-only phase.
    fn train(
        &mut self,
        reference: &ReferenceLoader,
        target: Option<&Array2<f32>>,
    ) -> Result<(), ClientError>;

    /// Score the private model on its own train or test split.
    fn test(&mut self, metric: MetricName, mode: EvalMode) -> Result<f64, ClientError>;

    /// Soft decisions `[reference_size, num_classes]` and the reference labels.
    fn infer_on_reference_data(
        &mut self,
        reference: &ReferenceLoader,
    ) -> Result<(Array2<f32>, Array1<usize>), ClientError>;

    /// Build the distillation target from the previous round's soft decisions
    /// of every client, in client order.
    fn calculate_soft_decision_target(
        &mut self,
        epoch: usize,
        prior_round: &[Array2<f32>],
    ) -> Result<TargetWithTrust, ClientError>;
}
