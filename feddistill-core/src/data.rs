//! The shared reference dataset.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::DistillError;

/// Read-only, re-iterable batched view of the shared reference data.
///
/// Every client sees the same loader for the whole run. Iterating it never
/// mutates it, and two calls to [`ReferenceLoader::batches`] yield identical
/// batches in identical order.
#[derive(Debug, Clone)]
pub struct ReferenceLoader {
    features: Array2<f32>,
    labels: Array1<usize>,
    batch_size: usize,
}

impl ReferenceLoader {
    pub fn new(
        features: Array2<f32>,
        labels: Array1<usize>,
        batch_size: usize,
    ) -> Result<Self, DistillError> {
        if batch_size == 0 {
            return Err(DistillError::invalid_input("batch size must be positive"));
        }
        if features.nrows() != labels.len() {
            return Err(DistillError::invalid_input(format!(
                "reference data has {} feature rows but {} labels",
                features.nrows(),
                labels.len()
            )));
        }
        Ok(Self {
            features,
            labels,
            batch_size,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn features(&self) -> ArrayView2<'_, f32> {
        self.features.view()
    }

    pub fn labels(&self) -> ArrayView1<'_, usize> {
        self.labels.view()
    }

    /// Batches in dataset order; the last one may be short.
    pub fn batches(&self) -> impl Iterator<Item = (ArrayView2<'_, f32>, ArrayView1<'_, usize>)> {
        self.features
            .axis_chunks_iter(Axis(0), self.batch_size)
            .zip(self.labels.axis_chunks_iter(Axis(0), self.batch_size))
    }
}
