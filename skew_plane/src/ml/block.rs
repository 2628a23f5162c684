use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use crate::ml::{
    autodiff::{Dual, Gradient, RVector, Scalar, Variable},
    serial::SerializableBlock,
    NodeValue,
};

/// Per-lane recurrent memory. Only the block that produced it reads its contents.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct State<S>(Vec<S>);

impl<S> State<S> {
    pub fn new(inner: Vec<S>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Vec<S> {
        self.0
    }
}

impl<S> Deref for State<S> {
    type Target = Vec<S>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> DerefMut for State<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Upstream gradient on the per-lane outputs of one timestep.
#[derive(Debug, Clone, Copy)]
pub enum OutputUpstream<'a, S> {
    /// Gradient on the tail timestep, one vector per lane.
    Tail(&'a [Vec<S>]),
    /// The timestep's outputs were not part of the result.
    Consumed,
}

impl<'a, S> OutputUpstream<'a, S> {
    pub fn lane(&self, lane: usize) -> Option<&'a [S]> {
        match self {
            OutputUpstream::Tail(lanes) => {
                let lanes: &'a [Vec<S>] = *lanes;
                lanes.get(lane).map(|x| x.as_slice())
            }
            OutputUpstream::Consumed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockGrads<S> {
    /// Gradients on the states fed into the timestep, one per lane.
    pub states: Vec<State<S>>,
    /// Gradients on the timestep inputs, one per lane.
    pub inputs: Vec<Vec<S>>,
}

/// The recorded result of one timestep.
pub trait BlockResult<S: Scalar>: Send + Sync {
    fn outputs(&self) -> &[Vec<S>];
    fn states(&self) -> &[State<S>];

    /// `down_states` is `None` when this step's states were never consumed.
    fn propagate_gradient(
        &self,
        upstream: OutputUpstream<'_, S>,
        down_states: Option<&[State<S>]>,
        grad: &mut Gradient<S>,
    ) -> BlockGrads<S>;
}

/// A recurrent state-transition unit, batched over lanes.
///
/// Transitions must return new states rather than mutating the block, so one block can
/// drive any number of independent unrolls at once.
pub trait Block<S: Scalar>: Send + Sync {
    fn start_state(&self, rv: &RVector) -> State<S>;

    fn apply_block<'a>(
        &'a self,
        rv: &RVector,
        states: &[State<S>],
        inputs: Vec<Vec<S>>,
    ) -> Box<dyn BlockResult<S> + 'a>;

    fn propagate_start(&self, start: &[State<S>], grads: &[State<S>], grad: &mut Gradient<S>);

    /// True when none of the block's variables are tracked by `grad`.
    ///
    /// Blocks that can not tell must keep the default, so their gradients always propagate.
    fn constant(&self, _grad: &Gradient<S>) -> bool {
        false
    }
}

pub trait Parameterized {
    fn parameters(&self) -> Vec<&Variable>;
    fn parameters_mut(&mut self) -> Vec<&mut Variable>;
}

/// Object-safe view of a block in both evaluation modes, plus its optional capabilities.
pub trait AnyBlock: Debug + Send + Sync {
    fn real(&self) -> &dyn Block<NodeValue>;
    fn dual(&self) -> &dyn Block<Dual>;

    fn block_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn as_parameterized(&self) -> Option<&dyn Parameterized> {
        None
    }

    fn as_parameterized_mut(&mut self) -> Option<&mut dyn Parameterized> {
        None
    }

    fn as_serializable(&self) -> Option<&dyn SerializableBlock> {
        None
    }
}

/// Selects the block view matching a scalar type.
pub trait BlockScalar: Scalar {
    fn select(block: &dyn AnyBlock) -> &dyn Block<Self>;
}

impl BlockScalar for NodeValue {
    fn select(block: &dyn AnyBlock) -> &dyn Block<Self> {
        block.real()
    }
}

impl BlockScalar for Dual {
    fn select(block: &dyn AnyBlock) -> &dyn Block<Self> {
        block.dual()
    }
}

pub(crate) fn mat_vec<S: Scalar>(matrix: &[S], stride: usize, vector: &[S]) -> Vec<S> {
    assert_eq!(stride, vector.len(), "mismatched dimensions");
    matrix
        .chunks_exact(stride)
        .map(|row| row.iter().zip(vector).map(|(&w, &x)| w * x).sum())
        .collect()
}

pub(crate) fn mat_t_vec<S: Scalar>(matrix: &[S], stride: usize, vector: &[S]) -> Vec<S> {
    assert_eq!(matrix.len(), stride * vector.len(), "mismatched dimensions");
    let mut output = vec![S::default(); stride];
    for (row, &x) in matrix.chunks_exact(stride).zip(vector) {
        for (out, &w) in output.iter_mut().zip(row) {
            *out += w * x;
        }
    }
    output
}

pub(crate) fn outer<'a, S: Scalar>(lhs: &'a [S], rhs: &'a [S]) -> impl Iterator<Item = S> + 'a {
    lhs.iter()
        .flat_map(move |&x| rhs.iter().map(move |&y| x * y))
}
