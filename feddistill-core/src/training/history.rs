//! Round-indexed, client-indexed history of a training run.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::DistillError;

/// Append-only `round x client` arena.
///
/// Values are stored round-major in one flat buffer. A round is opened with
/// [`RoundLog::begin_round`] and then receives exactly one value per client,
/// in client order. Nothing is ever overwritten or removed.
#[derive(Debug, Clone)]
pub struct RoundLog<T> {
    num_clients: usize,
    rounds: usize,
    values: Vec<T>,
}

impl<T> RoundLog<T> {
    pub fn new(num_clients: usize, expected_rounds: usize) -> Self {
        Self {
            num_clients,
            rounds: 0,
            values: Vec::with_capacity(num_clients * expected_rounds),
        }
    }

    /// Open the next round. The previous one must be complete.
    pub fn begin_round(&mut self) -> Result<usize, DistillError> {
        if self.values.len() != self.rounds * self.num_clients {
            return Err(DistillError::history_order(format!(
                "round {} has {} of {} client values",
                self.rounds.saturating_sub(1),
                self.values.len() - self.rounds.saturating_sub(1) * self.num_clients,
                self.num_clients
            )));
        }
        self.rounds += 1;
        Ok(self.rounds - 1)
    }

    /// Append `client`'s value for `round`.
    pub fn push(&mut self, round: usize, client: usize, value: T) -> Result<(), DistillError> {
        if self.rounds == 0 || round != self.rounds - 1 {
            return Err(DistillError::history_order(format!(
                "write to round {round} while round {} is open",
                self.rounds as isize - 1
            )));
        }
        let expected = self.values.len() - round * self.num_clients;
        if client != expected || client >= self.num_clients {
            return Err(DistillError::history_order(format!(
                "round {round}: expected client {expected}, got client {client}"
            )));
        }
        self.values.push(value);
        Ok(())
    }

    /// Values written so far for `round`, in client order.
    pub fn round(&self, round: usize) -> Option<&[T]> {
        if round >= self.rounds {
            return None;
        }
        let start = round * self.num_clients;
        let end = (start + self.num_clients).min(self.values.len());
        Some(&self.values[start..end])
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn num_clients(&self) -> usize {
        self.num_clients
    }

    fn iter_rounds(&self) -> impl Iterator<Item = &[T]> {
        (0..self.rounds).filter_map(move |r| self.round(r))
    }

    /// Copy out as one `Vec` per round.
    pub fn to_nested(&self) -> Vec<Vec<T>>
    where
        T: Clone,
    {
        self.iter_rounds().map(<[T]>::to_vec).collect()
    }
}

/// Trust weights consolidated for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "weights", rename_all = "snake_case")]
pub enum TrustWeights {
    /// Local-only round: no client produced a weight.
    NotCollected,
    /// `[clients, k]`, one row per client in client order.
    Collected(Array2<f32>),
}

impl TrustWeights {
    pub fn is_collected(&self) -> bool {
        matches!(self, TrustWeights::Collected(_))
    }

    pub fn as_matrix(&self) -> Option<&Array2<f32>> {
        match self {
            TrustWeights::NotCollected => None,
            TrustWeights::Collected(m) => Some(m),
        }
    }
}

/// Everything recorded during a run.
#[derive(Debug, Clone)]
pub struct RoundHistory {
    soft_decisions: RoundLog<Array2<f32>>,
    train_accuracies: RoundLog<f64>,
    test_accuracies: RoundLog<f64>,
    ref_accuracies: RoundLog<f64>,
    trust_weights: Vec<TrustWeights>,
}

impl RoundHistory {
    pub fn new(num_clients: usize, expected_rounds: usize) -> Self {
        Self {
            soft_decisions: RoundLog::new(num_clients, expected_rounds),
            train_accuracies: RoundLog::new(num_clients, expected_rounds),
            test_accuracies: RoundLog::new(num_clients, expected_rounds),
            ref_accuracies: RoundLog::new(num_clients, expected_rounds),
            trust_weights: Vec::with_capacity(expected_rounds),
        }
    }

    /// Open round slots in every log. Returns the new round index.
    pub(crate) fn begin_round(&mut self) -> Result<usize, DistillError> {
        let round = self.soft_decisions.begin_round()?;
        self.train_accuracies.begin_round()?;
        self.test_accuracies.begin_round()?;
        self.ref_accuracies.begin_round()?;
        Ok(round)
    }

    pub(crate) fn record_train_accuracy(
        &mut self,
        round: usize,
        client: usize,
        value: f64,
    ) -> Result<(), DistillError> {
        self.train_accuracies.push(round, client, value)
    }

    pub(crate) fn record_soft_decision(
        &mut self,
        round: usize,
        client: usize,
        value: Array2<f32>,
    ) -> Result<(), DistillError> {
        self.soft_decisions.push(round, client, value)
    }

    pub(crate) fn record_test_accuracy(
        &mut self,
        round: usize,
        client: usize,
        value: f64,
    ) -> Result<(), DistillError> {
        self.test_accuracies.push(round, client, value)
    }

    pub(crate) fn record_ref_accuracy(
        &mut self,
        round: usize,
        client: usize,
        value: f64,
    ) -> Result<(), DistillError> {
        self.ref_accuracies.push(round, client, value)
    }

    /// Close `round`'s trust slot. Must be called once per round, in order.
    pub(crate) fn record_trust_weights(
        &mut self,
        round: usize,
        weights: TrustWeights,
    ) -> Result<(), DistillError> {
        if round != self.trust_weights.len() || round >= self.rounds_completed() {
            return Err(DistillError::history_order(format!(
                "trust weights for round {round} but {} already recorded",
                self.trust_weights.len()
            )));
        }
        self.trust_weights.push(weights);
        Ok(())
    }

    pub fn num_clients(&self) -> usize {
        self.soft_decisions.num_clients()
    }

    pub fn rounds_completed(&self) -> usize {
        self.soft_decisions.rounds()
    }

    pub fn soft_decisions(&self, round: usize) -> Option<&[Array2<f32>]> {
        self.soft_decisions.round(round)
    }

    pub fn train_accuracies(&self, round: usize) -> Option<&[f64]> {
        self.train_accuracies.round(round)
    }

    pub fn test_accuracies(&self, round: usize) -> Option<&[f64]> {
        self.test_accuracies.round(round)
    }

    pub fn ref_accuracies(&self, round: usize) -> Option<&[f64]> {
        self.ref_accuracies.round(round)
    }

    pub fn trust_weights(&self, round: usize) -> Option<&TrustWeights> {
        self.trust_weights.get(round)
    }

    pub fn trust_weight_history(&self) -> &[TrustWeights] {
        &self.trust_weights
    }

    pub fn test_accuracy_history(&self) -> Vec<Vec<f64>> {
        self.test_accuracies.to_nested()
    }

    pub fn ref_accuracy_history(&self) -> Vec<Vec<f64>> {
        self.ref_accuracies.to_nested()
    }

    pub fn train_accuracy_history(&self) -> Vec<Vec<f64>> {
        self.train_accuracies.to_nested()
    }
}

/// Trust-weight history, test-accuracy history and ref-accuracy history.
pub type HistoryTriple = (Vec<TrustWeights>, Vec<Vec<f64>>, Vec<Vec<f64>>);

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    history: RoundHistory,
    sample_sizes: Array1<u64>,
}

impl TrainingOutcome {
    pub(crate) fn new(history: RoundHistory, sample_sizes: Array1<u64>) -> Self {
        Self {
            history,
            sample_sizes,
        }
    }

    pub fn history(&self) -> &RoundHistory {
        &self.history
    }

    pub fn client_sample_sizes(&self) -> &Array1<u64> {
        &self.sample_sizes
    }

    pub fn into_history(self) -> RoundHistory {
        self.history
    }

    pub fn into_parts(self) -> HistoryTriple {
        let test = self.history.test_accuracy_history();
        let reference = self.history.ref_accuracy_history();
        (self.history.trust_weights, test, reference)
    }
}
