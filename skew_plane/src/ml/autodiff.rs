pub use gradient::Gradient;
pub use res::{ConstRes, RRes, Res, VarRes};
pub use scalar::{Dual, Scalar};
pub use var::{RVector, VarId, Variable};

pub mod scalar {
    use std::{
        fmt::Debug,
        iter::Sum,
        ops::{Add, AddAssign, Mul, Neg, Sub},
    };

    use serde::{Deserialize, Serialize};

    use crate::ml::NodeValue;

    /// Numeric element flowing through blocks and tapes.
    ///
    /// `NodeValue` carries plain values. `Dual` carries each value together with its
    /// directional derivative, so the same block code computes R-operator results when
    /// instantiated over it.
    pub trait Scalar:
        Copy
        + Debug
        + Default
        + PartialEq
        + Send
        + Sync
        + 'static
        + Add<Output = Self>
        + Sub<Output = Self>
        + Mul<Output = Self>
        + Neg<Output = Self>
        + AddAssign
        + Sum
    {
        fn constant(value: NodeValue) -> Self;
        fn lift(value: NodeValue, tangent: NodeValue) -> Self;
        fn value(self) -> NodeValue;
        fn tangent(self) -> NodeValue;
        fn tanh(self) -> Self;
        fn sigmoid(self) -> Self;

        fn one() -> Self {
            Self::constant(1.0)
        }
    }

    impl Scalar for NodeValue {
        fn constant(value: NodeValue) -> Self {
            value
        }

        fn lift(value: NodeValue, _: NodeValue) -> Self {
            value
        }

        fn value(self) -> NodeValue {
            self
        }

        fn tangent(self) -> NodeValue {
            0.0
        }

        fn tanh(self) -> Self {
            NodeValue::tanh(self)
        }

        fn sigmoid(self) -> Self {
            1.0 / (1.0 + (-self).exp())
        }
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Dual {
        pub value: NodeValue,
        pub tangent: NodeValue,
    }

    impl Dual {
        pub fn new(value: NodeValue, tangent: NodeValue) -> Self {
            Self { value, tangent }
        }
    }

    impl Scalar for Dual {
        fn constant(value: NodeValue) -> Self {
            Self::new(value, 0.0)
        }

        fn lift(value: NodeValue, tangent: NodeValue) -> Self {
            Self::new(value, tangent)
        }

        fn value(self) -> NodeValue {
            self.value
        }

        fn tangent(self) -> NodeValue {
            self.tangent
        }

        fn tanh(self) -> Self {
            let value = self.value.tanh();
            Self::new(value, (1.0 - value * value) * self.tangent)
        }

        fn sigmoid(self) -> Self {
            let value = self.value.sigmoid();
            Self::new(value, value * (1.0 - value) * self.tangent)
        }
    }

    impl Add for Dual {
        type Output = Self;

        fn add(self, rhs: Self) -> Self::Output {
            Self::new(self.value + rhs.value, self.tangent + rhs.tangent)
        }
    }

    impl Sub for Dual {
        type Output = Self;

        fn sub(self, rhs: Self) -> Self::Output {
            Self::new(self.value - rhs.value, self.tangent - rhs.tangent)
        }
    }

    impl Mul for Dual {
        type Output = Self;

        fn mul(self, rhs: Self) -> Self::Output {
            Self::new(
                self.value * rhs.value,
                self.value * rhs.tangent + self.tangent * rhs.value,
            )
        }
    }

    impl Neg for Dual {
        type Output = Self;

        fn neg(self) -> Self::Output {
            Self::new(-self.value, -self.tangent)
        }
    }

    impl AddAssign for Dual {
        fn add_assign(&mut self, rhs: Self) {
            self.value += rhs.value;
            self.tangent += rhs.tangent;
        }
    }

    impl Sum for Dual {
        fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
            iter.fold(Self::default(), |acc, x| acc + x)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn dual_product_follows_product_rule() {
            let x = Dual::new(3.0, 1.0);
            let y = Dual::new(-2.0, 0.5);

            let z = x * y + x;
            assert_eq!(-6.0 + 3.0, z.value);
            assert_eq!(3.0 * 0.5 + 1.0 * -2.0 + 1.0, z.tangent);
        }

        #[test]
        fn dual_activations_match_finite_differences() {
            let epsilon = 1e-6;
            for x in [-1.5, -0.2, 0.0, 0.7, 2.0] {
                let dual = Dual::new(x, 1.0);

                let tanh_d = (NodeValue::tanh(x + epsilon) - NodeValue::tanh(x - epsilon))
                    / (2.0 * epsilon);
                let sigmoid_d =
                    ((x + epsilon).sigmoid() - (x - epsilon).sigmoid()) / (2.0 * epsilon);

                assert!((Scalar::tanh(dual).tangent - tanh_d).abs() < 1e-8);
                assert!((dual.sigmoid().tangent - sigmoid_d).abs() < 1e-8);
            }
        }
    }
}

pub mod var {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU64, Ordering},
    };

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};

    use crate::ml::{LayerValues, NodeValue, RngStrategy};

    use super::{res::VarRes, Dual, Scalar};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct VarId(u64);

    impl VarId {
        pub fn next() -> Self {
            static NEXT_ID: AtomicU64 = AtomicU64::new(1);
            Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
        }
    }

    impl Default for VarId {
        fn default() -> Self {
            Self::next()
        }
    }

    /// A trainable vector. Identity is process-local and never persisted.
    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Variable {
        values: LayerValues,
        #[serde(skip)]
        id: VarId,
    }

    impl PartialEq for Variable {
        fn eq(&self, other: &Self) -> bool {
            self.values == other.values
        }
    }

    impl From<LayerValues> for Variable {
        fn from(values: LayerValues) -> Self {
            Self::new(values)
        }
    }

    impl Variable {
        pub fn new(values: LayerValues) -> Self {
            Self {
                values,
                id: VarId::next(),
            }
        }

        pub fn zeros(len: usize) -> Self {
            Self::new(LayerValues::new(vec![0.0; len]))
        }

        pub fn id(&self) -> VarId {
            self.id
        }

        pub fn values(&self) -> &LayerValues {
            &self.values
        }

        pub fn values_mut(&mut self) -> &mut LayerValues {
            &mut self.values
        }

        pub fn len(&self) -> usize {
            self.values.len()
        }

        pub fn is_empty(&self) -> bool {
            self.values.is_empty()
        }

        pub fn lift<S: Scalar>(&self, rv: &RVector) -> Vec<S> {
            match rv.get(self.id) {
                Some(tangent) => self
                    .values
                    .iter()
                    .zip(tangent.iter())
                    .map(|(&x, &t)| S::lift(x, t))
                    .collect(),
                None => self.values.iter().map(|&x| S::constant(x)).collect(),
            }
        }

        pub fn res(&self) -> VarRes<NodeValue> {
            VarRes::new(self, &RVector::default())
        }

        pub fn res_r(&self, rv: &RVector) -> VarRes<Dual> {
            VarRes::new(self, rv)
        }
    }

    /// Perturbation direction for forward-mode evaluation, keyed by variable identity.
    #[derive(Debug, Default, Clone, PartialEq)]
    pub struct RVector(HashMap<VarId, LayerValues>);

    impl RVector {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, var: &Variable, direction: LayerValues) -> Result<()> {
            direction
                .assert_length_equals(var.len())
                .context("direction must match variable length")?;
            self.0.insert(var.id(), direction);
            Ok(())
        }

        pub fn random<'a>(vars: impl IntoIterator<Item = &'a Variable>, rng: &RngStrategy) -> Self {
            let inner = vars
                .into_iter()
                .map(|var| {
                    let direction = (0..var.len()).map(|_| rng.rand_normal()).collect();
                    (var.id(), direction)
                })
                .collect();
            Self(inner)
        }

        pub fn get(&self, id: VarId) -> Option<&LayerValues> {
            self.0.get(&id)
        }
    }

}

pub mod gradient {
    use std::collections::HashMap;

    use itertools::Itertools;

    use crate::ml::NodeValue;

    use super::{Dual, Scalar, VarId, Variable};

    /// Accumulated derivatives for a fixed set of tracked variables.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Gradient<S = NodeValue>(HashMap<VarId, Vec<S>>);

    impl<S: Scalar> Default for Gradient<S> {
        fn default() -> Self {
            Self(HashMap::new())
        }
    }

    impl<S: Scalar> Gradient<S> {
        pub fn zeros<'a>(vars: impl IntoIterator<Item = &'a Variable>) -> Self {
            let inner = vars
                .into_iter()
                .map(|var| (var.id(), vec![S::default(); var.len()]))
                .collect();
            Self(inner)
        }

        pub fn contains(&self, id: VarId) -> bool {
            self.0.contains_key(&id)
        }

        pub fn get(&self, var: &Variable) -> Option<&[S]> {
            self.0.get(&var.id()).map(|x| x.as_slice())
        }

        pub fn get_by_id(&self, id: VarId) -> Option<&[S]> {
            self.0.get(&id).map(|x| x.as_slice())
        }

        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        /// Adds `values` into the entry for `id`. Untracked ids are ignored.
        pub fn accumulate(&mut self, id: VarId, values: impl IntoIterator<Item = S>) {
            if let Some(entry) = self.0.get_mut(&id) {
                for (x, delta) in entry.iter_mut().zip_eq(values) {
                    *x += delta;
                }
            }
        }

        pub fn merge(&mut self, other: Gradient<S>) {
            for (id, values) in other.0 {
                self.accumulate(id, values);
            }
        }

        pub fn zero(&mut self) {
            self.0
                .values_mut()
                .flat_map(|x| x.iter_mut())
                .for_each(|x| *x = S::default());
        }
    }

    impl Gradient<Dual> {
        /// Tracks every variable tracked by either map, with zeroed entries.
        pub fn joined(grad: &Gradient, rgrad: &Gradient) -> Self {
            let inner = grad
                .0
                .iter()
                .chain(rgrad.0.iter())
                .map(|(id, values)| (*id, vec![Dual::default(); values.len()]))
                .collect();
            Self(inner)
        }

        /// Adds value parts into `grad` and tangent parts into `rgrad`.
        pub fn split_into(self, grad: &mut Gradient, rgrad: &mut Gradient) {
            for (id, values) in self.0 {
                grad.accumulate(id, values.iter().map(|x| x.value));
                rgrad.accumulate(id, values.iter().map(|x| x.tangent));
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use crate::ml::LayerValues;

        use super::*;

        #[test]
        fn gradient_accumulates_additively() {
            let var = Variable::zeros(2);
            let mut grad: Gradient = Gradient::zeros([&var]);

            grad.accumulate(var.id(), [1.0, 2.0]);
            grad.accumulate(var.id(), [0.5, -1.0]);

            assert_eq!(Some([1.5, 1.0].as_slice()), grad.get(&var));
        }

        #[test]
        fn gradient_ignores_untracked_variables() {
            let tracked = Variable::zeros(1);
            let untracked = Variable::zeros(1);
            let mut grad: Gradient = Gradient::zeros([&tracked]);

            grad.accumulate(untracked.id(), [3.0]);

            assert!(!grad.contains(untracked.id()));
            assert_eq!(Some([0.0].as_slice()), grad.get(&tracked));
        }

        #[test]
        fn gradients_can_be_merged() {
            let var = Variable::new(LayerValues::new(vec![0.0, 0.0]));
            let mut lhs: Gradient = Gradient::zeros([&var]);
            let mut rhs: Gradient = Gradient::zeros([&var]);
            lhs.accumulate(var.id(), [1.0, 1.0]);
            rhs.accumulate(var.id(), [2.0, -3.0]);

            lhs.merge(rhs);
            assert_eq!(Some([3.0, -2.0].as_slice()), lhs.get(&var));

            lhs.zero();
            assert_eq!(Some([0.0, 0.0].as_slice()), lhs.get(&var));
        }

        #[test]
        fn dual_gradient_splits_into_value_and_tangent_parts() {
            let a = Variable::zeros(1);
            let b = Variable::zeros(1);
            let mut grad: Gradient = Gradient::zeros([&a]);
            let mut rgrad: Gradient = Gradient::zeros([&a, &b]);

            let mut joined = Gradient::joined(&grad, &rgrad);
            joined.accumulate(a.id(), [Dual::new(1.0, 2.0)]);
            joined.accumulate(b.id(), [Dual::new(3.0, 4.0)]);
            joined.split_into(&mut grad, &mut rgrad);

            assert_eq!(Some([1.0].as_slice()), grad.get(&a));
            assert!(grad.get(&b).is_none());
            assert_eq!(Some([2.0].as_slice()), rgrad.get(&a));
            assert_eq!(Some([4.0].as_slice()), rgrad.get(&b));
        }
    }
}

pub mod res {
    use itertools::Itertools;

    use crate::ml::NodeValue;

    use super::{Dual, Gradient, RVector, Scalar, VarId, Variable};

    /// A differentiable value: its output plus the ability to push an upstream
    /// gradient back towards the variables it was computed from.
    pub trait Res<S: Scalar> {
        fn output(&self) -> &[S];
        fn propagate(&self, upstream: Vec<S>, grad: &mut Gradient<S>);
        fn constant(&self, grad: &Gradient<S>) -> bool;
    }

    /// Forward-mode helpers over a dual-valued result.
    pub trait RRes: Res<Dual> {
        fn values(&self) -> Vec<NodeValue> {
            self.output().iter().map(|x| x.value).collect()
        }

        fn r_output(&self) -> Vec<NodeValue> {
            self.output().iter().map(|x| x.tangent).collect()
        }

        fn propagate_r(
            &self,
            upstream: &[NodeValue],
            upstream_r: &[NodeValue],
            rgrad: &mut Gradient,
            grad: &mut Gradient,
        ) {
            let upstream = upstream
                .iter()
                .zip_eq(upstream_r)
                .map(|(&x, &r)| Dual::new(x, r))
                .collect();

            let mut joined = Gradient::joined(grad, rgrad);
            self.propagate(upstream, &mut joined);
            joined.split_into(grad, rgrad);
        }
    }

    impl<T: Res<Dual> + ?Sized> RRes for T {}

    #[derive(Debug, Clone)]
    pub struct VarRes<S> {
        id: VarId,
        output: Vec<S>,
    }

    impl<S: Scalar> VarRes<S> {
        pub fn new(var: &Variable, rv: &RVector) -> Self {
            Self {
                id: var.id(),
                output: var.lift(rv),
            }
        }
    }

    impl<S: Scalar> Res<S> for VarRes<S> {
        fn output(&self) -> &[S] {
            &self.output
        }

        fn propagate(&self, upstream: Vec<S>, grad: &mut Gradient<S>) {
            grad.accumulate(self.id, upstream);
        }

        fn constant(&self, grad: &Gradient<S>) -> bool {
            !grad.contains(self.id)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct ConstRes<S>(Vec<S>);

    impl<S: Scalar> ConstRes<S> {
        pub fn new(values: Vec<S>) -> Self {
            Self(values)
        }
    }

    impl<S: Scalar> Res<S> for ConstRes<S> {
        fn output(&self) -> &[S] {
            &self.0
        }

        fn propagate(&self, _: Vec<S>, _: &mut Gradient<S>) {}

        fn constant(&self, _: &Gradient<S>) -> bool {
            true
        }
    }
}
