//! Synthetic federation: Gaussian class blobs and softmax-regression clients.
//!
//! Each client gets a private train/test split skewed towards one class. The
//! last `noisy_clients` clients train on heavily corrupted labels so the trust
//! weights have something to discriminate.

use feddistill_core::client::TargetWithTrust;
use feddistill_core::config::SimulationConfig;
use feddistill_core::tensor::argmax_rows;
use feddistill_core::{Client, ClientError, ClientId, EvalMode, Metric, MetricName, ReferenceLoader};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Share of a client's private samples drawn from its favoured class.
const CLASS_SKEW: f64 = 0.6;
/// Share of labels replaced at random on noisy clients.
const LABEL_NOISE: f64 = 0.8;
const CENTER_SPREAD: f32 = 2.0;

/// Everything needed to build a trainer.
pub struct Federation {
    pub clients: Vec<(ClientId, Box<dyn Client>)>,
    pub reference: ReferenceLoader,
    pub sample_sizes: Array1<u64>,
}

struct Split {
    features: Array2<f32>,
    labels: Array1<usize>,
}

struct Blobs {
    centers: Array2<f32>,
}

impl Blobs {
    fn new(rng: &mut StdRng, num_classes: usize, num_features: usize) -> Self {
        let centers = Array2::from_shape_fn((num_classes, num_features), |_| {
            rng.gen_range(-CENTER_SPREAD..CENTER_SPREAD)
        });
        Self { centers }
    }

    fn num_classes(&self) -> usize {
        self.centers.nrows()
    }

    fn sample(&self, rng: &mut StdRng, labels: Vec<usize>) -> Split {
        let num_features = self.centers.ncols();
        let mut features = Array2::zeros((labels.len(), num_features));
        for (mut row, &label) in features.rows_mut().into_iter().zip(labels.iter()) {
            for (value, center) in row.iter_mut().zip(self.centers.row(label).iter()) {
                *value = center + rng.sample::<f32, _>(StandardNormal);
            }
        }
        Split {
            features,
            labels: Array1::from(labels),
        }
    }

    /// Labels skewed towards `favoured`; `None` draws uniformly.
    fn labels(&self, rng: &mut StdRng, n: usize, favoured: Option<usize>) -> Vec<usize> {
        (0..n)
            .map(|_| match favoured {
                Some(class) if rng.gen_bool(CLASS_SKEW) => class,
                _ => rng.gen_range(0..self.num_classes()),
            })
            .collect()
    }
}

/// Build a deterministic federation from `config`.
pub fn build_federation(config: &SimulationConfig) -> anyhow::Result<Federation> {
    anyhow::ensure!(config.num_clients > 0, "simulation needs at least one client");
    anyhow::ensure!(config.num_classes > 1, "simulation needs at least two classes");
    anyhow::ensure!(config.num_features > 0, "simulation needs at least one feature");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let blobs = Blobs::new(&mut rng, config.num_classes, config.num_features);

    let ref_labels = blobs.labels(&mut rng, config.reference_size, None);
    let reference = blobs.sample(&mut rng, ref_labels);
    let reference = ReferenceLoader::new(reference.features, reference.labels, config.batch_size)?;

    let noisy_from = config.num_clients.saturating_sub(config.noisy_clients);
    let mut clients = Vec::with_capacity(config.num_clients);
    let mut sample_sizes = Vec::with_capacity(config.num_clients);
    for idx in 0..config.num_clients {
        let favoured = Some(idx % config.num_classes);
        let train_labels = blobs.labels(&mut rng, config.samples_per_client, favoured);
        let mut train = blobs.sample(&mut rng, train_labels);
        let test_labels = blobs.labels(&mut rng, config.test_size, favoured);
        let test = blobs.sample(&mut rng, test_labels);

        let noisy = idx >= noisy_from;
        if noisy {
            for label in train.labels.iter_mut() {
                if rng.gen_bool(LABEL_NOISE) {
                    *label = rng.gen_range(0..config.num_classes);
                }
            }
        }

        tracing::debug!(client = idx, noisy, samples = train.labels.len(), "built client");
        sample_sizes.push(train.labels.len() as u64);
        let client = SoftmaxClient::new(train, test, config);
        clients.push((format!("client-{idx}"), Box::new(client) as Box<dyn Client>));
    }

    Ok(Federation {
        clients,
        reference,
        sample_sizes: Array1::from(sample_sizes),
    })
}

/// Multinomial logistic regression trained with mini-batch gradient descent.
pub struct SoftmaxClient {
    weights: Array2<f32>,
    bias: Array1<f32>,
    train: Split,
    test: Split,
    batch_size: usize,
    learning_rate: f32,
    distillation_weight: f32,
    last_inference: Option<Array2<f32>>,
}

impl SoftmaxClient {
    fn new(train: Split, test: Split, config: &SimulationConfig) -> Self {
        Self {
            weights: Array2::zeros((config.num_features, config.num_classes)),
            bias: Array1::zeros(config.num_classes),
            train,
            test,
            batch_size: config.batch_size.max(1),
            learning_rate: config.learning_rate,
            distillation_weight: config.distillation_weight,
            last_inference: None,
        }
    }

    fn num_classes(&self) -> usize {
        self.bias.len()
    }

    fn probabilities(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        let mut logits = x.dot(&self.weights) + &self.bias;
        for mut row in logits.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let total = row.sum();
            row.mapv_inplace(|v| v / total);
        }
        logits
    }

    /// One gradient step of cross-entropy towards `targets` (rows sum to 1).
    fn step(&mut self, x: ArrayView2<'_, f32>, targets: ArrayView2<'_, f32>, lr: f32) {
        let n = x.nrows().max(1) as f32;
        let residual = self.probabilities(x) - &targets;
        let grad_w = x.t().dot(&residual) / n;
        let grad_b = residual.sum_axis(Axis(0)) / n;
        self.weights.scaled_add(-lr, &grad_w);
        self.bias.scaled_add(-lr, &grad_b);
    }

    fn one_hot(&self, labels: ArrayView1<'_, usize>) -> Array2<f32> {
        let mut encoded = Array2::zeros((labels.len(), self.num_classes()));
        for (row, &label) in labels.iter().enumerate() {
            encoded[[row, label]] = 1.0;
        }
        encoded
    }
}

impl Client for SoftmaxClient {
    fn train(
        &mut self,
        reference: &ReferenceLoader,
        target: Option<&Array2<f32>>,
    ) -> Result<(), ClientError> {
        let n = self.train.labels.len();
        let mut start = 0;
        while start < n {
            let end = (start + self.batch_size).min(n);
            let x = self.train.features.slice(s![start..end, ..]).to_owned();
            let y = self.one_hot(self.train.labels.slice(s![start..end]));
            self.step(x.view(), y.view(), self.learning_rate);
            start = end;
        }

        if let Some(target) = target {
            if target.nrows() != reference.len() {
                return Err(ClientError::msg(format!(
                    "distillation target has {} rows for {} reference samples",
                    target.nrows(),
                    reference.len()
                )));
            }
            let lr = self.learning_rate * self.distillation_weight;
            let mut offset = 0;
            for (x, _) in reference.batches() {
                let rows = x.nrows();
                let t = target.slice(s![offset..offset + rows, ..]);
                self.step(x, t, lr);
                offset += rows;
            }
        }
        Ok(())
    }

    fn test(&mut self, metric: MetricName, mode: EvalMode) -> Result<f64, ClientError> {
        let split = match mode {
            EvalMode::Train => &self.train,
            EvalMode::Test => &self.test,
        };
        let predicted = argmax_rows(&self.probabilities(split.features.view()));
        Metric::resolve(metric)
            .score(&split.labels.to_vec(), &predicted.to_vec())
            .map_err(ClientError::new)
    }

    fn infer_on_reference_data(
        &mut self,
        reference: &ReferenceLoader,
    ) -> Result<(Array2<f32>, Array1<usize>), ClientError> {
        let soft = self.probabilities(reference.features());
        self.last_inference = Some(soft.clone());
        Ok((soft, reference.labels().to_owned()))
    }

    fn calculate_soft_decision_target(
        &mut self,
        _epoch: usize,
        prior_round: &[Array2<f32>],
    ) -> Result<TargetWithTrust, ClientError> {
        let Some(first) = prior_round.first() else {
            return Err(ClientError::msg("no soft decisions from the previous round"));
        };
        let trust = match &self.last_inference {
            Some(own) => agreement_weights(own, prior_round),
            None => Array1::from_elem(prior_round.len(), 1.0 / prior_round.len() as f32),
        };

        let mut target = Array2::<f32>::zeros(first.raw_dim());
        for (soft, &weight) in prior_round.iter().zip(trust.iter()) {
            if soft.raw_dim() != target.raw_dim() {
                return Err(ClientError::msg("peer soft decisions differ in shape"));
            }
            target.scaled_add(weight, soft);
        }
        Ok((Some(target), trust))
    }
}

/// Share of reference samples where each peer's argmax agrees with `own`,
/// normalised to sum to one. Falls back to uniform if nobody agrees.
fn agreement_weights(own: &Array2<f32>, peers: &[Array2<f32>]) -> Array1<f32> {
    let own_pred = argmax_rows(own);
    let scores: Array1<f32> = peers
        .iter()
        .map(|peer| {
            let peer_pred = argmax_rows(peer);
            let agree = own_pred
                .iter()
                .zip(peer_pred.iter())
                .filter(|(a, b)| a == b)
                .count();
            agree as f32 / own_pred.len().max(1) as f32
        })
        .collect();
    let total = scores.sum();
    if total > 0.0 {
        scores / total
    } else {
        Array1::from_elem(peers.len(), 1.0 / peers.len() as f32)
    }
}
