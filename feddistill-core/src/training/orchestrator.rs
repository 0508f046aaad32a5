//! One global epoch: phase gate, local training, evaluation, history updates.

use ndarray::Array1;
use tracing::{debug, debug_span, trace};

use crate::client::{Client, ClientId, EvalMode};
use crate::data::ReferenceLoader;
use crate::error::DistillError;
use crate::metrics::Metric;
use crate::tensor::argmax_rows;
use crate::training::history::RoundHistory;

/// Whether a round distils from peers or trains purely locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LocalOnly,
    Distillation,
}

impl Phase {
    /// Round 0 has no previous round to distil from, so it is always local-only.
    pub fn for_round(round: usize, pretraining_rounds: usize) -> Self {
        if round == 0 || round < pretraining_rounds {
            Phase::LocalOnly
        } else {
            Phase::Distillation
        }
    }
}

/// A client together with its identity.
pub struct RegisteredClient {
    pub id: ClientId,
    pub client: Box<dyn Client>,
}

/// Executes a single round over every client, in order.
pub(crate) struct GlobalEpochOrchestrator<'a> {
    reference: &'a ReferenceLoader,
    metric: Metric,
    pretraining_rounds: usize,
    num_local_epochs: usize,
}

impl<'a> GlobalEpochOrchestrator<'a> {
    pub(crate) fn new(
        reference: &'a ReferenceLoader,
        metric: Metric,
        pretraining_rounds: usize,
        num_local_epochs: usize,
    ) -> Self {
        Self {
            reference,
            metric,
            pretraining_rounds,
            num_local_epochs,
        }
    }

    /// Run `round` and return the trust weights collected, in client order.
    ///
    /// The round's slots in `history` must already be open.
    pub(crate) fn run(
        &self,
        round: usize,
        clients: &mut [RegisteredClient],
        history: &mut RoundHistory,
    ) -> Result<Vec<Array1<f32>>, DistillError> {
        let phase = Phase::for_round(round, self.pretraining_rounds);
        let mut trust_weights = Vec::new();

        for (idx, entry) in clients.iter_mut().enumerate() {
            let span = debug_span!("client", id = %entry.id, idx);
            let _enter = span.enter();

            let target = match phase {
                Phase::LocalOnly => None,
                Phase::Distillation => {
                    let prior = history.soft_decisions(round - 1).ok_or_else(|| {
                        DistillError::history_order(format!(
                            "round {round} needs soft decisions of round {}",
                            round - 1
                        ))
                    })?;
                    let (target, trust_weight) =
                        entry.client.calculate_soft_decision_target(round, prior)?;
                    trust_weights.push(trust_weight);
                    target
                }
            };

            for local_epoch in 0..self.num_local_epochs {
                trace!(local_epoch, distilling = target.is_some(), "local epoch");
                entry.client.train(self.reference, target.as_ref())?;
            }

            let train_acc = entry.client.test(self.metric.name(), EvalMode::Train)?;
            history.record_train_accuracy(round, idx, train_acc)?;

            let (soft_decision, ref_labels) =
                entry.client.infer_on_reference_data(self.reference)?;
            let ref_pred = argmax_rows(&soft_decision);
            history.record_soft_decision(round, idx, soft_decision)?;

            let test_acc = entry.client.test(self.metric.name(), EvalMode::Test)?;
            history.record_test_accuracy(round, idx, test_acc)?;

            let ref_acc = self
                .metric
                .score(&ref_labels.to_vec(), &ref_pred.to_vec())?;
            history.record_ref_accuracy(round, idx, ref_acc)?;

            debug!(train_acc, test_acc, ref_acc, "client evaluated");
        }

        Ok(trust_weights)
    }
}
