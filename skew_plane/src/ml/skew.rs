use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::ml::{
    autodiff::{Dual, Gradient, RVector, Res, Scalar, Variable},
    block::{AnyBlock, Block, BlockGrads, BlockResult, BlockScalar, OutputUpstream, State},
    seq::{from_sequence, to_sequence, Batch, Sequence},
    serial::{encode_block, envelope, Decoded, Registry, SerializeError},
    NodeValue,
};

/// Feeds the components of an input vector to a recurrent block one timestep at a time and
/// returns the block's output at the final timestep.
///
/// With `lanes` parallel lanes, the input holds each lane's timesteps contiguously, so a
/// vector of length `lanes * T` is unrolled over `T` timesteps.
#[derive(Debug)]
pub struct SkewLayer {
    block: Box<dyn AnyBlock>,
}

impl SkewLayer {
    pub const TYPE_TAG: &'static str = "skewplane::SkewLayer";

    pub fn new<B: AnyBlock + 'static>(block: B) -> Self {
        Self::from_boxed(Box::new(block))
    }

    pub fn from_boxed(block: Box<dyn AnyBlock>) -> Self {
        Self { block }
    }

    pub fn block(&self) -> &dyn AnyBlock {
        self.block.as_ref()
    }

    pub fn apply<'a>(&'a self, input: &'a dyn Res<NodeValue>) -> SkewOutput<'a, NodeValue> {
        self.batch(input, 1)
    }

    pub fn apply_r<'a>(&'a self, rv: &RVector, input: &'a dyn Res<Dual>) -> SkewOutput<'a, Dual> {
        self.batch_r(rv, input, 1)
    }

    pub fn batch<'a>(
        &'a self,
        input: &'a dyn Res<NodeValue>,
        lanes: usize,
    ) -> SkewOutput<'a, NodeValue> {
        self.unroll(&RVector::default(), input, lanes)
    }

    pub fn batch_r<'a>(
        &'a self,
        rv: &RVector,
        input: &'a dyn Res<Dual>,
        lanes: usize,
    ) -> SkewOutput<'a, Dual> {
        self.unroll(rv, input, lanes)
    }

    /// Runs the block over every timestep of `input`, recording each step on a fresh tape.
    ///
    /// Panics if `lanes` does not divide the input length or the input is empty.
    pub fn unroll<'a, S: BlockScalar>(
        &'a self,
        rv: &RVector,
        input: &'a dyn Res<S>,
        lanes: usize,
    ) -> SkewOutput<'a, S> {
        let block = S::select(self.block.as_ref());
        let sequence = to_sequence(input.output(), lanes);
        assert!(
            sequence.timesteps() > 0,
            "skew layer input must hold at least one timestep"
        );

        let start: Vec<State<S>> = (0..lanes).map(|_| block.start_state(rv)).collect();
        let mut tape = GradientTape::with_capacity(sequence.timesteps());

        for batch in sequence.iter() {
            let states = tape.tail().map(|x| x.states()).unwrap_or(start.as_slice());
            let inputs = batch.packed().iter().map(|&x| vec![x]).collect();
            let result = block.apply_block(rv, states, inputs);
            tape.record(result);
        }

        let output = tape
            .tail()
            .map(|x| x.outputs().concat())
            .unwrap_or_default();

        trace!(
            "Unrolled skew layer over {} timesteps with {} lanes",
            tape.len(),
            lanes
        );

        SkewOutput {
            block,
            input,
            lanes,
            start,
            tape,
            output,
        }
    }

    /// Trainable parameters of the block, or none if it does not expose any.
    pub fn parameters(&self) -> Vec<&Variable> {
        self.block
            .as_parameterized()
            .map(|x| x.parameters())
            .unwrap_or_default()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Variable> {
        match self.block.as_parameterized_mut() {
            Some(params) => params.parameters_mut(),
            None => vec![],
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let encode = || -> Result<Vec<u8>> {
            let data = json!({ "block": encode_block(self.block.as_ref())? });
            Ok(serde_json::to_vec(&envelope(Self::TYPE_TAG, data)?)?)
        };

        encode().context("serialize skew layer")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Self::deserialize_with(Registry::global(), bytes)
    }

    pub fn deserialize_with(registry: &Registry, bytes: &[u8]) -> Result<Self> {
        match registry.decode(bytes).context("deserialize skew layer")? {
            Decoded::Layer(layer) => Ok(layer),
            other => Err(SerializeError::UnexpectedType {
                expected: Self::TYPE_TAG,
                found: other.type_name().to_string(),
            })
            .context("deserialize skew layer"),
        }
    }

    pub(crate) fn decode(registry: &Registry, data: Value) -> Result<Decoded> {
        #[derive(Deserialize)]
        struct LayerData {
            block: Value,
        }

        let data: LayerData = serde_json::from_value(data)?;
        let block = registry.decode_block(data.block)?;
        debug!("Decoded skew layer with block type '{}'", block.block_type());

        Ok(Decoded::Layer(Self::from_boxed(block)))
    }
}

/// Per-timestep results of one unroll, indexed by time.
pub struct GradientTape<'a, S: Scalar>(Vec<Box<dyn BlockResult<S> + 'a>>);

impl<'a, S: Scalar> GradientTape<'a, S> {
    fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    fn record(&mut self, result: Box<dyn BlockResult<S> + 'a>) {
        self.0.push(result);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, timestep: usize) -> Option<&(dyn BlockResult<S> + 'a)> {
        self.0.get(timestep).map(|x| x.as_ref())
    }

    pub fn tail(&self) -> Option<&(dyn BlockResult<S> + 'a)> {
        self.0.last().map(|x| x.as_ref())
    }
}

/// Tail output of a [`SkewLayer`] unroll, able to propagate gradients back through every
/// recorded timestep.
pub struct SkewOutput<'a, S: Scalar> {
    block: &'a dyn Block<S>,
    input: &'a dyn Res<S>,
    lanes: usize,
    start: Vec<State<S>>,
    tape: GradientTape<'a, S>,
    output: Vec<S>,
}

impl<'a, S: Scalar> SkewOutput<'a, S> {
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn tape(&self) -> &GradientTape<'a, S> {
        &self.tape
    }
}

impl<'a, S: Scalar> Res<S> for SkewOutput<'a, S> {
    fn output(&self) -> &[S] {
        &self.output
    }

    fn propagate(&self, upstream: Vec<S>, grad: &mut Gradient<S>) {
        assert_eq!(
            upstream.len(),
            self.output.len(),
            "upstream length must match layer output length"
        );
        if self.constant(grad) {
            trace!("Skipping gradient propagation for constant skew output");
            return;
        }

        let lane_len = upstream.len() / self.lanes;
        let tail: Vec<Vec<S>> = (0..self.lanes)
            .map(|lane| upstream[lane * lane_len..(lane + 1) * lane_len].to_vec())
            .collect();

        let mut output_upstream = OutputUpstream::Tail(tail.as_slice());
        let mut down_states: Option<Vec<State<S>>> = None;
        let mut input_grads = Vec::with_capacity(self.tape.len());

        for timestep in (0..self.tape.len()).rev() {
            let result = &self.tape.0[timestep];
            let BlockGrads { states, inputs } =
                result.propagate_gradient(output_upstream, down_states.as_deref(), grad);

            output_upstream = OutputUpstream::Consumed;
            down_states = Some(states);

            assert!(
                inputs.iter().all(|x| x.len() == 1),
                "block must return one gradient per input component"
            );
            input_grads.push(Batch::full(inputs.into_iter().flatten().collect()));
        }

        if let Some(down_states) = down_states {
            self.block.propagate_start(&self.start, &down_states, grad);
        }

        if !self.input.constant(grad) {
            input_grads.reverse();
            let input_grad = from_sequence(&Sequence::new(input_grads));
            self.input.propagate(input_grad, grad);
        }
    }

    fn constant(&self, grad: &Gradient<S>) -> bool {
        self.input.constant(grad) && self.block.constant(grad)
    }
}
