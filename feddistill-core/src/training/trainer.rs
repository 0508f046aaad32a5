//! The training loop: drives rounds, consolidates trust weights and reports.

use std::collections::HashSet;

use ndarray::Array1;
use tracing::{info, info_span};

use crate::client::{Client, ClientId};
use crate::config::TrainerSettings;
use crate::data::ReferenceLoader;
use crate::error::DistillError;
use crate::metrics::{Metric, MetricName, mean};
use crate::report::{ClientRecord, ReportSink, RoundSummary};
use crate::tensor::stack_rows;
use crate::training::history::{RoundHistory, TrainingOutcome, TrustWeights};
use crate::training::orchestrator::{GlobalEpochOrchestrator, RegisteredClient};

/// Round means carried into the next round as the delta baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RoundMeans {
    test: f64,
    reference: f64,
}

/// Orchestrates federated, trust-weighted distillation across a fixed set of
/// clients.
pub struct Trainer {
    clients: Vec<RegisteredClient>,
    reference: ReferenceLoader,
    sample_sizes: Array1<u64>,
    pretraining_rounds: usize,
    num_local_epochs: usize,
    metric: Metric,
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("clients", &self.client_ids().collect::<Vec<_>>())
            .field("reference_size", &self.reference.len())
            .field("sample_sizes", &self.sample_sizes)
            .field("pretraining_rounds", &self.pretraining_rounds)
            .field("num_local_epochs", &self.num_local_epochs)
            .field("metric", &self.metric.name())
            .finish()
    }
}

impl Trainer {
    /// Build a trainer. Clients are iterated in the order given here for the
    /// whole run.
    pub fn new<I>(
        clients: I,
        reference: ReferenceLoader,
        client_sample_sizes: Array1<u64>,
        settings: &TrainerSettings,
    ) -> Result<Self, DistillError>
    where
        I: IntoIterator<Item = (ClientId, Box<dyn Client>)>,
    {
        let metric = Metric::from_identifier(&settings.metric)?;

        if settings.num_local_epochs == 0 {
            return Err(DistillError::invalid_config(
                "num_local_epochs must be positive",
            ));
        }
        if settings.pretraining_rounds == 0 {
            return Err(DistillError::invalid_config(
                "pretraining_rounds must be at least 1: round 0 has no previous round to distil from",
            ));
        }

        let clients: Vec<RegisteredClient> = clients
            .into_iter()
            .map(|(id, client)| RegisteredClient { id, client })
            .collect();

        if client_sample_sizes.len() != clients.len() {
            return Err(DistillError::invalid_config(format!(
                "{} sample sizes for {} clients",
                client_sample_sizes.len(),
                clients.len()
            )));
        }
        if clients.is_empty() {
            return Err(DistillError::invalid_config("at least one client is required"));
        }
        let mut seen = HashSet::new();
        for entry in &clients {
            if !seen.insert(entry.id.as_str()) {
                return Err(DistillError::DuplicateClient(entry.id.clone()));
            }
        }

        Ok(Self {
            clients,
            reference,
            sample_sizes: client_sample_sizes,
            pretraining_rounds: settings.pretraining_rounds,
            num_local_epochs: settings.num_local_epochs,
            metric,
        })
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.id.as_str())
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Per-client private sample sizes, as configured.
    pub fn client_sample_sizes(&self) -> &Array1<u64> {
        &self.sample_sizes
    }

    pub fn metric(&self) -> MetricName {
        self.metric.name()
    }

    pub fn pretraining_rounds(&self) -> usize {
        self.pretraining_rounds
    }

    pub fn num_local_epochs(&self) -> usize {
        self.num_local_epochs
    }

    /// Run exactly `global_epochs` rounds and return the full history.
    ///
    /// Any client or sink failure aborts the run and is returned unchanged.
    pub fn train<S: ReportSink>(
        mut self,
        global_epochs: usize,
        mut sink: S,
    ) -> Result<TrainingOutcome, DistillError> {
        if global_epochs == 0 {
            return Err(DistillError::invalid_input("global_epochs must be positive"));
        }

        info!(
            clients = self.clients.len(),
            global_epochs,
            pretraining_rounds = self.pretraining_rounds,
            num_local_epochs = self.num_local_epochs,
            metric = %self.metric.name(),
            "Starting federated distillation"
        );

        let mut history = RoundHistory::new(self.clients.len(), global_epochs);
        let orchestrator = GlobalEpochOrchestrator::new(
            &self.reference,
            self.metric,
            self.pretraining_rounds,
            self.num_local_epochs,
        );
        let clients = &mut self.clients;

        (0..global_epochs).try_fold(None, |previous: Option<RoundMeans>, round| {
            let span = info_span!("global_epoch", round);
            let _enter = span.enter();

            let opened = history.begin_round()?;
            if opened != round {
                return Err(DistillError::history_order(format!(
                    "opened round {opened} while driving round {round}"
                )));
            }

            let collected = orchestrator.run(round, clients.as_mut_slice(), &mut history)?;
            let trust = if collected.is_empty() {
                TrustWeights::NotCollected
            } else {
                TrustWeights::Collected(stack_rows(&collected)?)
            };
            history.record_trust_weights(round, trust)?;

            let means = round_means(&history, round);
            let baseline = previous.unwrap_or(means);
            let summary = RoundSummary {
                round,
                mean_test_accuracy: means.test,
                mean_test_accuracy_delta: means.test - baseline.test,
                mean_ref_accuracy: means.reference,
                mean_ref_accuracy_delta: means.reference - baseline.reference,
            };
            sink.on_round_end(&summary, &client_records(&history, round))?;

            Ok(Some(means))
        })?;

        info!(rounds = history.rounds_completed(), "Training complete");
        Ok(TrainingOutcome::new(history, self.sample_sizes))
    }
}

fn round_means(history: &RoundHistory, round: usize) -> RoundMeans {
    RoundMeans {
        test: mean(history.test_accuracies(round).unwrap_or_default()),
        reference: mean(history.ref_accuracies(round).unwrap_or_default()),
    }
}

fn client_records(history: &RoundHistory, round: usize) -> Vec<ClientRecord> {
    let train = history.train_accuracies(round).unwrap_or_default();
    let test = history.test_accuracies(round).unwrap_or_default();
    let reference = history.ref_accuracies(round).unwrap_or_default();
    train
        .iter()
        .zip(test)
        .zip(reference)
        .enumerate()
        .map(|(client, ((&train_accuracy, &test_accuracy), &ref_accuracy))| ClientRecord {
            round,
            client,
            train_accuracy,
            test_accuracy,
            ref_accuracy,
        })
        .collect()
}
