//! Integration tests for the training loop.
//!
//! Scripted mock clients record every capability call into a shared log so the
//! tests can assert phase gating, the one-round lookback and call ordering.

use std::sync::{Arc, Mutex};

use feddistill_core::client::TargetWithTrust;
use feddistill_core::{
    Client, ClientError, DistillError, EvalMode, MemorySink, MetricName, ReferenceLoader,
    ReportSink, RoundSummary, Trainer, TrainerSettings, TrustWeights,
};
use ndarray::{Array1, Array2, array};
use pretty_assertions::assert_eq;

const REF_LABELS: [usize; 3] = [0, 1, 0];

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Train { target: Option<Array2<f32>> },
    Test(EvalMode),
    Infer,
    Target { epoch: usize, prior: Vec<Array2<f32>> },
}

type CallLog = Arc<Mutex<Vec<(usize, Call)>>>;

#[derive(Debug, thiserror::Error)]
#[error("client {client} exploded in round {round}")]
struct Exploded {
    client: usize,
    round: usize,
}

/// Soft decisions for `client` in `round`. The off-class column encodes the
/// pair so tests can tell rounds apart; argmax depends only on `correct`.
fn soft(client: usize, round: usize, correct: bool) -> Array2<f32> {
    let tag = 0.1 + (client * 10 + round) as f32 * 0.001;
    Array2::from_shape_fn((REF_LABELS.len(), 2), |(row, col)| {
        let class = if correct {
            REF_LABELS[row]
        } else {
            1 - REF_LABELS[row]
        };
        if col == class { 0.6 } else { tag }
    })
}

struct MockClient {
    idx: usize,
    calls: CallLog,
    infers: usize,
    test_accuracies: Vec<f64>,
    ref_correct: Vec<bool>,
    fail_train_in_round: Option<usize>,
}

impl MockClient {
    fn new(idx: usize, calls: &CallLog) -> Self {
        Self {
            idx,
            calls: calls.clone(),
            infers: 0,
            test_accuracies: Vec::new(),
            ref_correct: Vec::new(),
            fail_train_in_round: None,
        }
    }

    fn with_test_accuracies(mut self, accs: Vec<f64>) -> Self {
        self.test_accuracies = accs;
        self
    }

    fn with_ref_correct(mut self, correct: Vec<bool>) -> Self {
        self.ref_correct = correct;
        self
    }

    fn failing_train_in_round(mut self, round: usize) -> Self {
        self.fail_train_in_round = Some(round);
        self
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push((self.idx, call));
    }
}

impl Client for MockClient {
    fn train(
        &mut self,
        _reference: &ReferenceLoader,
        target: Option<&Array2<f32>>,
    ) -> Result<(), ClientError> {
        self.log(Call::Train {
            target: target.cloned(),
        });
        if self.fail_train_in_round == Some(self.infers) {
            return Err(ClientError::new(Exploded {
                client: self.idx,
                round: self.infers,
            }));
        }
        Ok(())
    }

    fn test(&mut self, _metric: MetricName, mode: EvalMode) -> Result<f64, ClientError> {
        self.log(Call::Test(mode));
        Ok(match mode {
            EvalMode::Train => 1.0,
            EvalMode::Test => {
                let round = self.infers.saturating_sub(1);
                self.test_accuracies.get(round).copied().unwrap_or(0.5)
            }
        })
    }

    fn infer_on_reference_data(
        &mut self,
        _reference: &ReferenceLoader,
    ) -> Result<(Array2<f32>, Array1<usize>), ClientError> {
        self.log(Call::Infer);
        let round = self.infers;
        self.infers += 1;
        let correct = self.ref_correct.get(round).copied().unwrap_or(true);
        Ok((
            soft(self.idx, round, correct),
            Array1::from(REF_LABELS.to_vec()),
        ))
    }

    fn calculate_soft_decision_target(
        &mut self,
        epoch: usize,
        prior_round: &[Array2<f32>],
    ) -> Result<TargetWithTrust, ClientError> {
        self.log(Call::Target {
            epoch,
            prior: prior_round.to_vec(),
        });
        let n = prior_round.len() as f32;
        let mut target = Array2::<f32>::zeros(prior_round[0].raw_dim());
        for p in prior_round {
            target += p;
        }
        target /= n;
        Ok((Some(target), Array1::from_elem(prior_round.len(), 1.0 / n)))
    }
}

fn reference() -> ReferenceLoader {
    ReferenceLoader::new(
        array![[0.0, 1.0], [1.0, 0.0], [0.5, 0.5]],
        Array1::from(REF_LABELS.to_vec()),
        2,
    )
    .unwrap()
}

fn settings(pretraining_rounds: usize, num_local_epochs: usize, metric: &str) -> TrainerSettings {
    TrainerSettings {
        pretraining_rounds,
        num_local_epochs,
        metric: metric.to_string(),
        ..TrainerSettings::default()
    }
}

fn boxed(clients: Vec<MockClient>) -> Vec<(String, Box<dyn Client>)> {
    clients
        .into_iter()
        .map(|c| (format!("client-{}", c.idx), Box::new(c) as Box<dyn Client>))
        .collect()
}

fn trainer(clients: Vec<MockClient>, settings: &TrainerSettings) -> Trainer {
    let sizes = Array1::from_elem(clients.len(), 10u64);
    Trainer::new(boxed(clients), reference(), sizes, settings).unwrap()
}

fn calls_for(log: &CallLog, client: usize) -> Vec<Call> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(idx, _)| *idx == client)
        .map(|(_, call)| call.clone())
        .collect()
}

#[test]
fn test_two_client_scenario() {
    let log = CallLog::default();
    let clients = vec![MockClient::new(0, &log), MockClient::new(1, &log)];
    let outcome = trainer(clients, &settings(1, 1, "acc"))
        .train(2, MemorySink::new())
        .unwrap();

    let expected_prior = vec![soft(0, 0, true), soft(1, 0, true)];
    let expected_target = (&expected_prior[0] + &expected_prior[1]) / 2.0;
    for client in 0..2 {
        assert_eq!(
            calls_for(&log, client),
            vec![
                Call::Train { target: None },
                Call::Test(EvalMode::Train),
                Call::Infer,
                Call::Test(EvalMode::Test),
                Call::Target {
                    epoch: 1,
                    prior: expected_prior.clone(),
                },
                Call::Train {
                    target: Some(expected_target.clone()),
                },
                Call::Test(EvalMode::Train),
                Call::Infer,
                Call::Test(EvalMode::Test),
            ]
        );
    }

    let history = outcome.history();
    assert_eq!(history.trust_weights(0), Some(&TrustWeights::NotCollected));
    let weights = history.trust_weights(1).unwrap().as_matrix().unwrap();
    assert_eq!(weights.shape(), &[2, 2]);
    assert_eq!(weights, &array![[0.5f32, 0.5], [0.5, 0.5]]);
}

#[test]
fn test_clients_run_sequentially_in_configured_order() {
    let log = CallLog::default();
    let clients = vec![
        MockClient::new(2, &log),
        MockClient::new(0, &log),
        MockClient::new(1, &log),
    ];
    trainer(clients, &settings(1, 1, "acc"))
        .train(2, MemorySink::new())
        .unwrap();

    let order: Vec<usize> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, call)| *call == Call::Infer)
        .map(|(idx, _)| *idx)
        .collect();
    assert_eq!(order, vec![2, 0, 1, 2, 0, 1]);
}

#[test]
fn test_target_reads_only_previous_round() {
    let log = CallLog::default();
    let clients = vec![MockClient::new(0, &log), MockClient::new(1, &log)];
    trainer(clients, &settings(2, 1, "acc"))
        .train(5, MemorySink::new())
        .unwrap();

    for client in 0..2 {
        let targets: Vec<(usize, Vec<Array2<f32>>)> = calls_for(&log, client)
            .into_iter()
            .filter_map(|call| match call {
                Call::Target { epoch, prior } => Some((epoch, prior)),
                _ => None,
            })
            .collect();
        let epochs: Vec<usize> = targets.iter().map(|(e, _)| *e).collect();
        assert_eq!(epochs, vec![2, 3, 4]);
        for (epoch, prior) in targets {
            assert_eq!(prior, vec![soft(0, epoch - 1, true), soft(1, epoch - 1, true)]);
        }
    }
}

#[test]
fn test_local_only_rounds_train_without_target() {
    let log = CallLog::default();
    let clients = vec![MockClient::new(0, &log)];
    let outcome = trainer(clients, &settings(3, 1, "acc"))
        .train(3, MemorySink::new())
        .unwrap();

    let calls = calls_for(&log, 0);
    assert!(
        calls
            .iter()
            .all(|c| !matches!(c, Call::Target { .. }))
    );
    assert!(
        calls
            .iter()
            .filter(|c| matches!(c, Call::Train { .. }))
            .all(|c| *c == Call::Train { target: None })
    );
    for round in 0..3 {
        assert_eq!(
            outcome.history().trust_weights(round),
            Some(&TrustWeights::NotCollected)
        );
    }
}

#[test]
fn test_same_target_reused_across_local_epochs() {
    let log = CallLog::default();
    let clients = vec![MockClient::new(0, &log), MockClient::new(1, &log)];
    trainer(clients, &settings(1, 3, "acc"))
        .train(2, MemorySink::new())
        .unwrap();

    let trains: Vec<Option<Array2<f32>>> = calls_for(&log, 1)
        .into_iter()
        .filter_map(|call| match call {
            Call::Train { target } => Some(target),
            _ => None,
        })
        .collect();
    assert_eq!(trains.len(), 6);
    assert!(trains[..3].iter().all(Option::is_none));
    let first = trains[3].clone().unwrap();
    assert!(trains[3..].iter().all(|t| t.as_ref() == Some(&first)));
    assert_eq!(
        calls_for(&log, 1)
            .iter()
            .filter(|c| matches!(c, Call::Target { .. }))
            .count(),
        1
    );
}

#[test]
fn test_round_means_and_deltas() {
    let log = CallLog::default();
    let clients = vec![
        MockClient::new(0, &log).with_test_accuracies(vec![0.5, 0.7, 0.6]),
        MockClient::new(1, &log).with_test_accuracies(vec![0.7, 0.9, 0.9]),
    ];
    let mut sink = MemorySink::new();
    let outcome = trainer(clients, &settings(1, 1, "acc"))
        .train(3, &mut sink)
        .unwrap();

    let means: Vec<f64> = sink.summaries.iter().map(|s| s.mean_test_accuracy).collect();
    let deltas: Vec<f64> = sink
        .summaries
        .iter()
        .map(|s| s.mean_test_accuracy_delta)
        .collect();
    for (got, want) in means.iter().zip([0.6, 0.8, 0.75]) {
        assert!((got - want).abs() < 1e-9, "mean {got} != {want}");
    }
    for (got, want) in deltas.iter().zip([0.0, 0.2, -0.05]) {
        assert!((got - want).abs() < 1e-9, "delta {got} != {want}");
    }

    let history = outcome.history();
    for (round, summary) in sink.summaries.iter().enumerate() {
        let test = history.test_accuracies(round).unwrap();
        let mean = test.iter().sum::<f64>() / test.len() as f64;
        assert!((summary.mean_test_accuracy - mean).abs() < 1e-12);
        assert_eq!(summary.round, round);
    }
    assert_eq!(sink.summaries[0].mean_ref_accuracy_delta, 0.0);
    assert_eq!(sink.clients.len(), 6);
    assert_eq!(sink.clients[3].client, 1);
    assert_eq!(sink.clients[3].round, 1);
}

#[test]
fn test_ref_accuracy_recomputed_every_round() {
    let log = CallLog::default();
    let clients = vec![
        MockClient::new(0, &log).with_ref_correct(vec![false, true, false]),
        MockClient::new(1, &log),
    ];
    let (_, _, ref_history) = trainer(clients, &settings(1, 1, "acc"))
        .train(3, MemorySink::new())
        .unwrap()
        .into_parts();

    assert_eq!(
        ref_history,
        vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![0.0, 1.0]]
    );
}

#[test]
fn test_balanced_accuracy_is_used_for_ref_scoring() {
    let log = CallLog::default();
    // Always predicts class 0: recall 1.0 on class 0, 0.0 on class 1.
    struct AlwaysZero(MockClient);
    impl Client for AlwaysZero {
        fn train(
            &mut self,
            r: &ReferenceLoader,
            t: Option<&Array2<f32>>,
        ) -> Result<(), ClientError> {
            self.0.train(r, t)
        }
        fn test(&mut self, m: MetricName, mode: EvalMode) -> Result<f64, ClientError> {
            self.0.test(m, mode)
        }
        fn infer_on_reference_data(
            &mut self,
            _r: &ReferenceLoader,
        ) -> Result<(Array2<f32>, Array1<usize>), ClientError> {
            Ok((
                array![[0.9, 0.1], [0.9, 0.1], [0.9, 0.1]],
                Array1::from(REF_LABELS.to_vec()),
            ))
        }
        fn calculate_soft_decision_target(
            &mut self,
            e: usize,
            p: &[Array2<f32>],
        ) -> Result<TargetWithTrust, ClientError> {
            self.0.calculate_soft_decision_target(e, p)
        }
    }

    let run = |metric: &str| {
        let client: Box<dyn Client> = Box::new(AlwaysZero(MockClient::new(0, &log)));
        let trainer = Trainer::new(
            vec![("only".to_string(), client)],
            reference(),
            array![5],
            &settings(1, 1, metric),
        )
        .unwrap();
        trainer.train(1, MemorySink::new()).unwrap().into_parts().2
    };

    let acc = run("acc")[0][0];
    let bacc = run("bacc")[0][0];
    assert!((acc - 2.0 / 3.0).abs() < 1e-12);
    assert!((bacc - 0.5).abs() < 1e-12);
}

#[test]
fn test_unknown_metric_fails_at_construction() {
    let log = CallLog::default();
    let err = Trainer::new(
        boxed(vec![MockClient::new(0, &log)]),
        reference(),
        array![1],
        &settings(1, 1, "unknown"),
    )
    .unwrap_err();
    assert!(matches!(err, DistillError::UnknownMetric { .. }));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let log = CallLog::default();
    let build = |pretraining, local, sizes: Array1<u64>| {
        Trainer::new(
            boxed(vec![MockClient::new(0, &log), MockClient::new(1, &log)]),
            reference(),
            sizes,
            &settings(pretraining, local, "acc"),
        )
    };

    assert!(matches!(
        build(0, 1, array![1, 1]),
        Err(DistillError::InvalidConfig(_))
    ));
    assert!(matches!(
        build(1, 0, array![1, 1]),
        Err(DistillError::InvalidConfig(_))
    ));
    assert!(matches!(
        build(1, 1, array![1]),
        Err(DistillError::InvalidConfig(_))
    ));
}

#[test]
fn test_duplicate_and_empty_client_sets_are_rejected() {
    let log = CallLog::default();
    let mut clients = boxed(vec![MockClient::new(0, &log), MockClient::new(1, &log)]);
    clients[1].0 = clients[0].0.clone();
    let err = Trainer::new(clients, reference(), array![1, 1], &settings(1, 1, "acc")).unwrap_err();
    assert!(matches!(err, DistillError::DuplicateClient(id) if id == "client-0"));

    let err = Trainer::new(
        Vec::<(String, Box<dyn Client>)>::new(),
        reference(),
        Array1::<u64>::zeros(0),
        &settings(1, 1, "acc"),
    )
    .unwrap_err();
    assert!(matches!(err, DistillError::InvalidConfig(_)));
}

#[test]
fn test_zero_global_epochs_is_rejected() {
    let log = CallLog::default();
    let err = trainer(vec![MockClient::new(0, &log)], &settings(1, 1, "acc"))
        .train(0, MemorySink::new())
        .unwrap_err();
    assert!(matches!(err, DistillError::InvalidInput(_)));
}

#[test]
fn test_client_failure_aborts_run_unmodified() {
    let log = CallLog::default();
    let clients = vec![
        MockClient::new(0, &log),
        MockClient::new(1, &log).failing_train_in_round(1),
        MockClient::new(2, &log),
    ];
    let mut sink = MemorySink::new();
    let err = trainer(clients, &settings(1, 1, "acc"))
        .train(4, &mut sink)
        .unwrap_err();

    assert_eq!(err.to_string(), "client 1 exploded in round 1");
    match err {
        DistillError::Client(inner) => {
            let boxed = inner.into_inner();
            let exploded = boxed.downcast_ref::<Exploded>().unwrap();
            assert_eq!((exploded.client, exploded.round), (1, 1));
        }
        other => panic!("expected client error, got {other:?}"),
    }
    // Round 0 was reported, round 1 was not; client 2 never reached round 1.
    assert_eq!(sink.summaries.len(), 1);
    assert_eq!(
        calls_for(&log, 2)
            .iter()
            .filter(|c| **c == Call::Infer)
            .count(),
        1
    );
}

#[test]
fn test_sink_failure_aborts_run() {
    struct FailingSink;
    impl ReportSink for FailingSink {
        fn on_round_end(
            &mut self,
            summary: &RoundSummary,
            _clients: &[feddistill_core::ClientRecord],
        ) -> Result<(), DistillError> {
            Err(DistillError::report(format!("sink closed at {}", summary.round)))
        }
    }

    let log = CallLog::default();
    let err = trainer(vec![MockClient::new(0, &log)], &settings(1, 1, "acc"))
        .train(3, FailingSink)
        .unwrap_err();
    assert_eq!(err.to_string(), "Report error: sink closed at 0");
}

#[test]
fn test_runs_are_deterministic() {
    let run = || {
        let log = CallLog::default();
        let clients = vec![
            MockClient::new(0, &log)
                .with_test_accuracies(vec![0.1, 0.2, 0.3])
                .with_ref_correct(vec![true, false, true]),
            MockClient::new(1, &log).with_test_accuracies(vec![0.4, 0.5, 0.6]),
        ];
        trainer(clients, &settings(1, 2, "bacc"))
            .train(3, MemorySink::new())
            .unwrap()
    };

    let first = run();
    let second = run();
    assert_eq!(
        first.history().train_accuracy_history(),
        second.history().train_accuracy_history()
    );
    assert_eq!(first.clone().into_parts(), second.clone().into_parts());
    for round in 0..3 {
        assert_eq!(
            first.history().soft_decisions(round),
            second.history().soft_decisions(round)
        );
    }
}

#[test]
fn test_outcome_exposes_histories() {
    let log = CallLog::default();
    let clients = vec![MockClient::new(0, &log), MockClient::new(1, &log)];
    let trainer = trainer(clients, &settings(1, 1, "acc"));
    assert_eq!(trainer.client_ids().collect::<Vec<_>>(), vec!["client-0", "client-1"]);
    assert_eq!(trainer.client_sample_sizes(), &array![10u64, 10]);
    assert_eq!(trainer.metric(), MetricName::Accuracy);

    let outcome = trainer.train(3, MemorySink::new()).unwrap();
    assert_eq!(outcome.client_sample_sizes(), &array![10u64, 10]);
    let history = outcome.history();
    assert_eq!(history.rounds_completed(), 3);
    assert_eq!(history.num_clients(), 2);
    assert_eq!(history.soft_decisions(2).unwrap()[1], soft(1, 2, true));
    assert!(history.soft_decisions(3).is_none());

    let (trust, test, reference) = outcome.into_parts();
    assert_eq!(trust.len(), 3);
    assert!(!trust[0].is_collected());
    assert!(trust[1].is_collected() && trust[2].is_collected());
    assert_eq!(test, vec![vec![0.5, 0.5]; 3]);
    assert_eq!(reference, vec![vec![1.0, 1.0]; 3]);
}
