use serde::{Deserialize, Serialize};

use crate::ml::{
    autodiff::{Dual, Gradient, RVector, Scalar, Variable},
    block::{
        mat_t_vec, mat_vec, outer, AnyBlock, Block, BlockGrads, BlockResult, OutputUpstream,
        Parameterized, State,
    },
    layer::LayerInitStrategy,
    serial::{SerializableBlock, TypedBlock},
    LayerValues, NodeValue, RngStrategy,
};

/// Long short-term memory unit.
///
/// Gates are packed in the order input, forget, cell, output. The per-lane state holds the
/// hidden vector followed by the cell vector, and the output of a step is its new hidden
/// vector.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Lstm {
    input_size: usize,
    hidden_size: usize,
    input_weights: Variable,
    state_weights: Variable,
    biases: Variable,
    init_state: Variable,
}

impl Lstm {
    pub fn new(input_size: usize, hidden_size: usize, rng: &RngStrategy) -> Self {
        Self::new_with_strategy(
            input_size,
            hidden_size,
            &LayerInitStrategy::ScaledFullRandom,
            rng,
        )
    }

    pub fn new_with_strategy(
        input_size: usize,
        hidden_size: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        assert!(input_size > 0, "input_size must be positive");
        assert!(hidden_size > 0, "hidden_size must be positive");
        let gate_size = 4 * hidden_size;

        let mut input_weights = LayerValues::new(vec![0.0; gate_size * input_size]);
        strategy.apply(
            input_weights.iter_mut(),
            std::iter::empty(),
            input_size,
            rng,
        );

        let mut state_weights = LayerValues::new(vec![0.0; gate_size * hidden_size]);
        strategy.apply(
            state_weights.iter_mut(),
            std::iter::empty(),
            hidden_size,
            rng,
        );

        let mut biases = LayerValues::new(vec![0.0; gate_size]);
        biases[hidden_size..2 * hidden_size]
            .iter_mut()
            .for_each(|x| *x = 1.0);

        Self {
            input_size,
            hidden_size,
            input_weights: input_weights.into(),
            state_weights: state_weights.into(),
            biases: biases.into(),
            init_state: Variable::zeros(2 * hidden_size),
        }
    }

    pub fn scale_input_weights(mut self, scale: NodeValue) -> Self {
        self.input_weights
            .values_mut()
            .iter_mut()
            .for_each(|x| *x *= scale);
        self
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn init_state(&self) -> &Variable {
        &self.init_state
    }

    fn lift_params<S: Scalar>(&self, rv: &RVector) -> LstmParams<S> {
        LstmParams {
            input_weights: self.input_weights.lift(rv),
            state_weights: self.state_weights.lift(rv),
            biases: self.biases.lift(rv),
        }
    }
}

impl<S: Scalar> Block<S> for Lstm {
    fn start_state(&self, rv: &RVector) -> State<S> {
        State::new(self.init_state.lift(rv))
    }

    fn apply_block<'a>(
        &'a self,
        rv: &RVector,
        states: &[State<S>],
        inputs: Vec<Vec<S>>,
    ) -> Box<dyn BlockResult<S> + 'a> {
        assert_eq!(states.len(), inputs.len(), "expected one state per lane");
        let params = self.lift_params(rv);
        let h = self.hidden_size;

        let mut lanes = Vec::with_capacity(inputs.len());
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut next_states = Vec::with_capacity(inputs.len());

        for (state, input) in states.iter().zip(inputs) {
            assert_eq!(input.len(), self.input_size, "mismatched input vector size");
            assert_eq!(state.len(), 2 * h, "mismatched state vector size");
            let (hidden, cell) = state.split_at(h);

            let mut z = mat_vec(&params.input_weights, self.input_size, &input);
            let recurrent = mat_vec(&params.state_weights, h, hidden);
            for ((z, r), &b) in z.iter_mut().zip(recurrent).zip(&params.biases) {
                *z += r + b;
            }

            let input_gate: Vec<S> = z[..h].iter().map(|x| x.sigmoid()).collect();
            let forget_gate: Vec<S> = z[h..2 * h].iter().map(|x| x.sigmoid()).collect();
            let cell_gate: Vec<S> = z[2 * h..3 * h].iter().map(|x| x.tanh()).collect();
            let output_gate: Vec<S> = z[3 * h..].iter().map(|x| x.sigmoid()).collect();

            let next_cell: Vec<S> = (0..h)
                .map(|k| forget_gate[k] * cell[k] + input_gate[k] * cell_gate[k])
                .collect();
            let cell_tanh: Vec<S> = next_cell.iter().map(|x| x.tanh()).collect();
            let next_hidden: Vec<S> = (0..h).map(|k| output_gate[k] * cell_tanh[k]).collect();

            outputs.push(next_hidden.clone());
            next_states.push(State::new([next_hidden, next_cell].concat()));
            lanes.push(LstmLane {
                input,
                hidden: hidden.to_vec(),
                cell: cell.to_vec(),
                input_gate,
                forget_gate,
                cell_gate,
                output_gate,
                cell_tanh,
            });
        }

        Box::new(LstmResult {
            lstm: self,
            params,
            lanes,
            outputs,
            states: next_states,
        })
    }

    fn propagate_start(&self, start: &[State<S>], grads: &[State<S>], grad: &mut Gradient<S>) {
        assert_eq!(start.len(), grads.len(), "expected one gradient per start state");
        for lane_grad in grads {
            grad.accumulate(self.init_state.id(), lane_grad.iter().copied());
        }
    }

    fn constant(&self, grad: &Gradient<S>) -> bool {
        self.parameters().iter().all(|x| !grad.contains(x.id()))
    }
}

impl Parameterized for Lstm {
    fn parameters(&self) -> Vec<&Variable> {
        vec![
            &self.input_weights,
            &self.state_weights,
            &self.biases,
            &self.init_state,
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Variable> {
        vec![
            &mut self.input_weights,
            &mut self.state_weights,
            &mut self.biases,
            &mut self.init_state,
        ]
    }
}

impl AnyBlock for Lstm {
    fn real(&self) -> &dyn Block<NodeValue> {
        self
    }

    fn dual(&self) -> &dyn Block<Dual> {
        self
    }

    fn block_type(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn as_parameterized(&self) -> Option<&dyn Parameterized> {
        Some(self)
    }

    fn as_parameterized_mut(&mut self) -> Option<&mut dyn Parameterized> {
        Some(self)
    }

    fn as_serializable(&self) -> Option<&dyn SerializableBlock> {
        Some(self)
    }
}

impl TypedBlock for Lstm {
    const TYPE_TAG: &'static str = "skewplane::Lstm";

    fn validate(&self) -> Result<(), String> {
        let (input_size, hidden_size) = (self.input_size, self.hidden_size);
        if input_size == 0 || hidden_size == 0 {
            return Err(format!(
                "sizes must be positive: input_size={input_size}, hidden_size={hidden_size}"
            ));
        }

        let gate_size = 4 * hidden_size;
        let expected = [
            ("input_weights", &self.input_weights, gate_size * input_size),
            ("state_weights", &self.state_weights, gate_size * hidden_size),
            ("biases", &self.biases, gate_size),
            ("init_state", &self.init_state, 2 * hidden_size),
        ];
        for (name, var, len) in expected {
            if var.len() != len {
                return Err(format!(
                    "mismatched {name} length: expected={len}, actual={}",
                    var.len()
                ));
            }
        }
        Ok(())
    }
}

struct LstmParams<S> {
    input_weights: Vec<S>,
    state_weights: Vec<S>,
    biases: Vec<S>,
}

struct LstmLane<S> {
    input: Vec<S>,
    hidden: Vec<S>,
    cell: Vec<S>,
    input_gate: Vec<S>,
    forget_gate: Vec<S>,
    cell_gate: Vec<S>,
    output_gate: Vec<S>,
    cell_tanh: Vec<S>,
}

struct LstmResult<'a, S> {
    lstm: &'a Lstm,
    params: LstmParams<S>,
    lanes: Vec<LstmLane<S>>,
    outputs: Vec<Vec<S>>,
    states: Vec<State<S>>,
}

impl<'a, S: Scalar> LstmResult<'a, S> {
    fn propagate_lane(
        &self,
        lane: &LstmLane<S>,
        d_output: Option<&[S]>,
        d_state: Option<&State<S>>,
        grad: &mut Gradient<S>,
    ) -> (State<S>, Vec<S>) {
        let h = self.lstm.hidden_size;
        let one = S::one();

        let mut d_hidden = vec![S::default(); h];
        let mut d_cell = vec![S::default(); h];
        if let Some(d_output) = d_output {
            assert_eq!(d_output.len(), h, "mismatched upstream vector size");
            for (dh, &u) in d_hidden.iter_mut().zip(d_output) {
                *dh += u;
            }
        }
        if let Some(d_state) = d_state {
            assert_eq!(d_state.len(), 2 * h, "mismatched state gradient size");
            for (dh, &u) in d_hidden.iter_mut().zip(&d_state[..h]) {
                *dh += u;
            }
            for (dc, &u) in d_cell.iter_mut().zip(&d_state[h..]) {
                *dc += u;
            }
        }

        let mut dz = vec![S::default(); 4 * h];
        let mut d_cell_prev = vec![S::default(); h];
        for k in 0..h {
            let (i, f, g, o) = (
                lane.input_gate[k],
                lane.forget_gate[k],
                lane.cell_gate[k],
                lane.output_gate[k],
            );
            let cell_tanh = lane.cell_tanh[k];

            let d_output_gate = d_hidden[k] * cell_tanh;
            let d_cell = d_cell[k] + d_hidden[k] * o * (one - cell_tanh * cell_tanh);

            dz[k] = d_cell * g * i * (one - i);
            dz[h + k] = d_cell * lane.cell[k] * f * (one - f);
            dz[2 * h + k] = d_cell * i * (one - g * g);
            dz[3 * h + k] = d_output_gate * o * (one - o);
            d_cell_prev[k] = d_cell * f;
        }

        let lstm = self.lstm;
        grad.accumulate(lstm.input_weights.id(), outer(&dz, &lane.input));
        grad.accumulate(lstm.state_weights.id(), outer(&dz, &lane.hidden));
        grad.accumulate(lstm.biases.id(), dz.iter().copied());

        let d_input = mat_t_vec(&self.params.input_weights, lstm.input_size, &dz);
        let d_hidden_prev = mat_t_vec(&self.params.state_weights, h, &dz);

        (State::new([d_hidden_prev, d_cell_prev].concat()), d_input)
    }
}

impl<'a, S: Scalar> BlockResult<S> for LstmResult<'a, S> {
    fn outputs(&self) -> &[Vec<S>] {
        &self.outputs
    }

    fn states(&self) -> &[State<S>] {
        &self.states
    }

    fn propagate_gradient(
        &self,
        upstream: OutputUpstream<'_, S>,
        down_states: Option<&[State<S>]>,
        grad: &mut Gradient<S>,
    ) -> BlockGrads<S> {
        if let Some(down_states) = down_states {
            assert_eq!(down_states.len(), self.lanes.len(), "expected one state per lane");
        }

        let (states, inputs) = self
            .lanes
            .iter()
            .enumerate()
            .map(|(idx, lane)| {
                let d_state = down_states.map(|x| &x[idx]);
                self.propagate_lane(lane, upstream.lane(idx), d_state, grad)
            })
            .unzip();

        BlockGrads { states, inputs }
    }
}
