use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};

use crate::ml::{
    autodiff::{Gradient, VarId, Variable},
    LayerValues, NodeValue,
};

pub trait Optimizer {
    fn update(&mut self, target: &mut Variable, dloss_dtarget: &[NodeValue]) -> Result<()>;

    /// Updates every parameter tracked by `grad`. Untracked parameters are left alone.
    fn step(&mut self, params: Vec<&mut Variable>, grad: &Gradient) -> Result<()> {
        for (idx, param) in params.into_iter().enumerate() {
            if let Some(dloss_dparam) = grad.get(param) {
                self.update(param, dloss_dparam)
                    .with_context(|| format!("failed to update parameter at index {idx}"))?;
            }
        }
        Ok(())
    }
}

pub struct AdamOptimizer {
    state: HashMap<VarId, AdamState>,
    beta: (NodeValue, NodeValue),
    epsilon: NodeValue,
    eta: NodeValue,
}

struct AdamState {
    momentum: LayerValues,
    rms: LayerValues,
    t: u64,
}

impl AdamOptimizer {
    pub fn new(learn_rate: NodeValue) -> Self {
        Self {
            state: HashMap::new(),
            beta: (0.9, 0.999),
            epsilon: 1e-8,
            eta: learn_rate,
        }
    }

    pub fn with_beta(mut self, beta1: NodeValue, beta2: NodeValue) -> Self {
        self.beta = (beta1, beta2);
        self
    }

    pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn set_eta(&mut self, eta: NodeValue) {
        self.eta = eta;
    }
}

impl Optimizer for AdamOptimizer {
    fn update(&mut self, target: &mut Variable, dloss_dtarget: &[NodeValue]) -> Result<()> {
        let len = target.len();
        if dloss_dtarget.len() != len {
            Err(anyhow!("mismatched gradient length"))?;
        }

        let (beta1, beta2) = self.beta;
        let (eta, epsilon) = (self.eta, self.epsilon);
        let state = self.state.entry(target.id()).or_insert_with(|| AdamState {
            momentum: LayerValues::new(vec![0.0; len]),
            rms: LayerValues::new(vec![0.0; len]),
            t: 1,
        });
        let t = state.t as NodeValue;

        let momentum: LayerValues = state
            .momentum
            .iter()
            .zip(dloss_dtarget)
            .map(|(m, g)| m * beta1 + g * (1.0 - beta1))
            .collect();

        let rms: LayerValues = state
            .rms
            .iter()
            .zip(dloss_dtarget)
            .map(|(r, g)| r * beta2 + g.powi(2) * (1.0 - beta2))
            .collect();

        let momentum_correction = 1.0 / (1.0 - beta1.powf(t));
        let rms_correction = 1.0 / (1.0 - beta2.powf(t));

        let next_value: LayerValues = target
            .values()
            .iter()
            .zip(momentum.iter().zip(rms.iter()))
            .map(|(x, (m, r))| {
                let m = m * momentum_correction;
                let r = r * rms_correction;
                x - eta * m / (r.sqrt() + epsilon)
            })
            .collect();

        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        state.momentum = momentum;
        state.rms = rms;
        state.t += 1;
        *target.values_mut() = next_value;
        Ok(())
    }
}

pub struct RMSpropOptimizer {
    cache: HashMap<VarId, LayerValues>,
    gamma: NodeValue,
    epsilon: NodeValue,
    eta: NodeValue,
}

impl RMSpropOptimizer {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            gamma: 0.9,
            epsilon: 1e-8,
            eta: 0.001,
        }
    }

    pub fn with_gamma(mut self, gamma: NodeValue) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_eta(mut self, eta: NodeValue) -> Self {
        self.eta = eta;
        self
    }
}

impl Default for RMSpropOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer for RMSpropOptimizer {
    fn update(&mut self, target: &mut Variable, dloss_dtarget: &[NodeValue]) -> Result<()> {
        let len = target.len();
        if dloss_dtarget.len() != len {
            Err(anyhow!("mismatched gradient length"))?;
        }

        let (gamma, epsilon, eta) = (self.gamma, self.epsilon, self.eta);
        let cache = self
            .cache
            .entry(target.id())
            .or_insert_with(|| LayerValues::new(vec![0.0; len]));

        let next_cache: LayerValues = cache
            .iter()
            .zip(dloss_dtarget)
            .map(|(c, g)| c * gamma + g.powi(2) * (1.0 - gamma))
            .collect();

        let next_value: LayerValues = target
            .values()
            .iter()
            .zip(dloss_dtarget.iter().zip(next_cache.iter()))
            .map(|(x, (g, c))| x - eta * g / (c.sqrt() + epsilon))
            .collect();

        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        *cache = next_cache;
        *target.values_mut() = next_value;
        Ok(())
    }
}

pub struct SGDOptimizer {
    learn_rate: NodeValue,
}

impl SGDOptimizer {
    pub fn new(learn_rate: NodeValue) -> Self {
        Self { learn_rate }
    }
}

impl Optimizer for SGDOptimizer {
    fn update(&mut self, target: &mut Variable, dloss_dtarget: &[NodeValue]) -> Result<()> {
        if dloss_dtarget.len() != target.len() {
            Err(anyhow!("mismatched gradient length"))?;
        }

        let next_value: LayerValues = target
            .values()
            .iter()
            .zip(dloss_dtarget)
            .map(|(x, g)| x - g * self.learn_rate)
            .collect();

        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        *target.values_mut() = next_value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::{
        autodiff::{ConstRes, Res},
        lstm::Lstm,
        skew::SkewLayer,
        RngStrategy,
    };

    use super::*;

    #[test]
    fn adam_can_optimise_quadratic() {
        let optimizer = AdamOptimizer::new(0.05);
        assert_quadratic_converges(optimizer, 500);
    }

    #[test]
    fn rms_prop_can_optimise_quadratic() {
        let optimizer = RMSpropOptimizer::new().with_eta(0.02).with_gamma(0.9);
        assert_quadratic_converges(optimizer, 400);
    }

    #[test]
    fn sgd_can_optimise_quadratic() {
        let optimizer = SGDOptimizer::new(0.1);
        assert_quadratic_converges(optimizer, 100);
    }

    #[test]
    fn optimizer_rejects_invalid_gradients() {
        let mut target = Variable::new(LayerValues::new(vec![1.0, 2.0]));
        let mut optimizer = SGDOptimizer::new(0.1);

        let err = optimizer.update(&mut target, &[NodeValue::NAN, 0.0]);
        assert!(err.is_err());
        assert_eq!(&LayerValues::new(vec![1.0, 2.0]), target.values());

        assert!(optimizer.update(&mut target, &[1.0]).is_err());
    }

    #[test]
    fn optimizer_step_skips_untracked_parameters() {
        let mut tracked = Variable::new(LayerValues::new(vec![1.0]));
        let mut untracked = Variable::new(LayerValues::new(vec![1.0]));
        let mut grad: Gradient = Gradient::zeros([&tracked]);
        grad.accumulate(tracked.id(), [2.0]);

        let mut optimizer = SGDOptimizer::new(0.5);
        optimizer
            .step(vec![&mut tracked, &mut untracked], &grad)
            .unwrap();

        assert_eq!(&LayerValues::new(vec![0.0]), tracked.values());
        assert_eq!(&LayerValues::new(vec![1.0]), untracked.values());
    }

    #[test]
    fn adam_can_train_skew_layer() {
        let rng = RngStrategy::testable(1234);
        let mut layer = SkewLayer::new(Lstm::new(1, 3, &rng));
        let input = ConstRes::new(vec![0.5, -1.0, 0.25, 1.0]);
        let target = LayerValues::new(vec![0.5, -0.25, 0.1]);
        let mut optimizer = AdamOptimizer::new(0.05);

        let mut losses = vec![];
        for _ in 0..200 {
            let mut grad: Gradient = Gradient::zeros(layer.parameters());
            {
                let output = layer.apply(&input);
                let values = LayerValues::from(output.output());
                losses.push(values.msd_error(&target).unwrap().ave());

                let dloss = values.msd_error_d(&target).unwrap();
                output.propagate(dloss.to_vec(), &mut grad);
            }
            optimizer.step(layer.parameters_mut(), &grad).unwrap();
        }

        let (first, last) = (losses[0], losses[losses.len() - 1]);
        assert!(last < first * 0.2, "loss did not converge: first={first}, last={last}");
    }

    fn assert_quadratic_converges<O: Optimizer>(mut optimizer: O, iters: usize) {
        let target = LayerValues::new(vec![0.5, -1.5, 3.0, 0.0]);
        let mut x = Variable::zeros(target.len());

        for _ in 0..iters {
            let dloss = x.values().msd_error_d(&target).unwrap();
            optimizer.update(&mut x, &dloss).unwrap();
        }

        let loss = x.values().msd_error(&target).unwrap().ave();
        assert!(loss < 1e-2, "loss did not converge: {loss}, x={:?}", x.values());
    }
}
