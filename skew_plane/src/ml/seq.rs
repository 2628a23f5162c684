use std::ops::Deref;

use anyhow::{anyhow, Result};

/// Values of every lane at a single timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<S> {
    packed: Vec<S>,
    present: Vec<bool>,
}

impl<S: Copy> Batch<S> {
    /// A batch in which every lane holds real data.
    pub fn full(packed: Vec<S>) -> Self {
        let present = vec![true; packed.len()];
        Self { packed, present }
    }

    pub fn packed(&self) -> &[S] {
        &self.packed
    }

    pub fn present(&self) -> &[bool] {
        &self.present
    }

    pub fn lanes(&self) -> usize {
        self.present.len()
    }

    pub fn num_present(&self) -> usize {
        self.present.iter().filter(|x| **x).count()
    }
}

/// Timestep-ordered batches sharing one lane count.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence<S>(Vec<Batch<S>>);

impl<S: Copy> Sequence<S> {
    pub fn new(batches: Vec<Batch<S>>) -> Self {
        if let Some(first) = batches.first() {
            let lanes = first.lanes();
            assert!(
                batches.iter().all(|x| x.lanes() == lanes),
                "all batches in a sequence must share one lane count"
            );
        }
        Self(batches)
    }

    pub fn timesteps(&self) -> usize {
        self.0.len()
    }

    pub fn lanes(&self) -> usize {
        self.0.first().map(|x| x.lanes()).unwrap_or_default()
    }
}

impl<S> Deref for Sequence<S> {
    type Target = [Batch<S>];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> IntoIterator for Sequence<S> {
    type Item = Batch<S>;
    type IntoIter = std::vec::IntoIter<Batch<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Row-major `count x stride` view used to swap the lane and time axes.
#[derive(Debug, Clone, PartialEq)]
struct Matrix<S> {
    inner: Vec<S>,
    stride: usize,
    count: usize,
}

impl<S: Copy> Matrix<S> {
    fn from_vec(stride: usize, inner: Vec<S>) -> Result<Self> {
        if stride == 0 || inner.len() % stride != 0 {
            return Err(anyhow!("mismatched values length/stride"));
        }
        let count = inner.len() / stride;
        Ok(Self {
            inner,
            stride,
            count,
        })
    }

    fn transpose(&self) -> Self {
        let (stride, count) = (self.stride, self.count);
        let inner = (0..self.inner.len())
            .map(|idx| {
                let (x, y) = (idx % count, idx / count);
                let (i, j) = (y, x); // transpose dims
                self.inner[i + j * stride]
            })
            .collect();

        Self {
            inner,
            stride: count,
            count: stride,
        }
    }

    fn rows_iter(&self) -> impl Iterator<Item = &[S]> {
        self.inner.chunks_exact(self.stride)
    }

    fn into_inner(self) -> Vec<S> {
        self.inner
    }
}

/// Splits a lane-major vector into one batch per timestep.
///
/// Element `i` belongs to lane `i / T` at timestep `i % T`, where `T = values.len() / lanes`.
/// Panics if `lanes` does not divide the vector length.
pub fn to_sequence<S: Copy>(values: &[S], lanes: usize) -> Sequence<S> {
    assert!(lanes > 0, "lane count must be positive");
    assert!(
        values.len() % lanes == 0,
        "lane count must divide vector length: len={}, lanes={lanes}",
        values.len()
    );
    if values.is_empty() {
        return Sequence(vec![]);
    }

    let timesteps = values.len() / lanes;
    let lane_major = Matrix {
        inner: values.to_vec(),
        stride: timesteps,
        count: lanes,
    };

    let time_major = lane_major.transpose();
    let batches = time_major
        .rows_iter()
        .map(|row| Batch::full(row.to_vec()))
        .collect();

    Sequence(batches)
}

/// Inverse of [`to_sequence`]: joins the batches back into lane-major order.
pub fn from_sequence<S: Copy>(sequence: &Sequence<S>) -> Vec<S> {
    let lanes = sequence.lanes();
    if lanes == 0 {
        return vec![];
    }

    let joined = sequence
        .iter()
        .flat_map(|batch| batch.packed().iter().copied())
        .collect();

    match Matrix::from_vec(lanes, joined) {
        Ok(time_major) => time_major.transpose().into_inner(),
        Err(e) => unreachable!("sequence batches share one lane count: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_sequence_groups_values_by_timestep() {
        let values = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let sequence = to_sequence(&values, 2);

        assert_eq!(3, sequence.timesteps());
        assert_eq!(2, sequence.lanes());
        assert_eq!([1.0, 10.0], sequence[0].packed());
        assert_eq!([2.0, 20.0], sequence[1].packed());
        assert_eq!([3.0, 30.0], sequence[2].packed());
        assert!(sequence.iter().all(|x| x.num_present() == 2));
        assert_eq!([true, true], sequence[0].present());
    }

    #[test]
    fn single_lane_sequence_keeps_value_order() {
        let values = [1.0, -1.0, 2.0, -0.5, 3.0];
        let sequence = to_sequence(&values, 1);

        let timesteps: Vec<_> = sequence.iter().map(|x| x.packed()[0]).collect();
        assert_eq!(values.to_vec(), timesteps);
    }

    #[test]
    fn from_sequence_restores_original_vector() {
        for (len, lanes) in [(1, 1), (6, 3), (12, 4), (12, 12), (35, 5)] {
            let values: Vec<f64> = (0..len).map(|x| x as f64 * 0.5 - 3.0).collect();
            let sequence = to_sequence(&values, lanes);

            assert_eq!(len / lanes, sequence.timesteps());
            assert_eq!(values, from_sequence(&sequence));
        }
    }

    #[test]
    fn empty_vector_has_no_timesteps() {
        let sequence = to_sequence::<f64>(&[], 3);

        assert_eq!(0, sequence.timesteps());
        assert!(from_sequence(&sequence).is_empty());
    }

    #[test]
    #[should_panic(expected = "lane count must divide vector length")]
    fn to_sequence_rejects_indivisible_length() {
        to_sequence(&[1.0, 2.0, 3.0], 2);
    }

    #[test]
    fn matrix_rejects_mismatched_stride() {
        assert!(Matrix::from_vec(4, vec![1.0; 6]).is_err());
        assert!(Matrix::from_vec(0, Vec::<f64>::new()).is_err());
    }
}
