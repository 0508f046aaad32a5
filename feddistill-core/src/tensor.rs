//! Small `ndarray` helpers shared by the orchestrator and clients.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::DistillError;

/// Index of the largest entry in each row. Ties go to the lowest index and
/// NaN never wins over a finite value.
pub fn argmax_rows(probs: &Array2<f32>) -> Array1<usize> {
    probs.map_axis(Axis(1), argmax)
}

fn argmax(row: ArrayView1<'_, f32>) -> usize {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    let mut seen = false;
    for (idx, &value) in row.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        if !seen || value > best {
            best = value;
            best_idx = idx;
            seen = true;
        }
    }
    best_idx
}

/// Stack client-ordered trust weights into a `[clients, k]` matrix.
pub fn stack_rows(rows: &[Array1<f32>]) -> Result<Array2<f32>, DistillError> {
    let views: Vec<ArrayView1<'_, f32>> = rows.iter().map(|r| r.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}
