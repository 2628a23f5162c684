use std::ops::{Deref, DerefMut};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{RngStrategy, RNG};

pub type NodeValue = f64;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }
    pub fn assert_length_equals(&self, expected: usize) -> Result<()> {
        if self.len() == expected {
            Ok(())
        } else {
            return Err(anyhow!(
                "lengths are not equal: expected={expected}, actual={actual}",
                actual = self.len()
            ));
        }
    }
    pub fn ave(&self) -> NodeValue {
        if !self.is_empty() {
            self.iter().sum::<NodeValue>() / self.len() as NodeValue
        } else {
            0.0
        }
    }
    pub fn dot_product(&self, rhs: &[NodeValue]) -> NodeValue {
        assert_eq!(self.len(), rhs.len());
        self.iter().zip(rhs).map(|(x, y)| x * y).sum()
    }
    pub fn is_finite(&self) -> bool {
        self.iter().all(|x| x.is_finite())
    }

    pub fn msd_error(&self, expected_outputs: &LayerValues) -> Result<LayerValues> {
        self.assert_length_equals(expected_outputs.len())?;
        let mut error = vec![];
        for (actual, expected) in self.iter().zip(expected_outputs.iter()) {
            error.push((actual - expected).powi(2));
        }

        Ok(LayerValues(error))
    }

    pub fn msd_error_d(&self, expected_outputs: &LayerValues) -> Result<LayerValues> {
        self.assert_length_equals(expected_outputs.len())?;
        let mut error = vec![];
        for (actual, expected) in self.iter().zip(expected_outputs.iter()) {
            error.push((actual - expected) * 2.0);
        }

        Ok(LayerValues(error))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerInitStrategy {
    Zero,
    FullRandom,
    ScaledFullRandom,
    Kaiming,
    KaimingZeroBias,
}

impl LayerInitStrategy {
    pub fn apply<'a>(
        &self,
        weights: impl Iterator<Item = &'a mut NodeValue>,
        bias: impl Iterator<Item = &'a mut NodeValue>,
        inputs_count: usize,
        rng: &RngStrategy,
    ) {
        use LayerInitStrategy::*;

        let inputs_count = inputs_count.max(1) as NodeValue;
        match self {
            Zero => {
                for value in weights.chain(bias) {
                    *value = 0.0;
                }
            }
            FullRandom => {
                for value in weights.chain(bias) {
                    *value = Self::full_rand(rng);
                }
            }
            ScaledFullRandom => {
                let scale_factor = inputs_count.powf(-0.5) * 2.0;
                for value in weights.chain(bias) {
                    *value = Self::full_rand(rng) * scale_factor;
                }
            }
            Kaiming => {
                let scale_factor = inputs_count.powf(-0.5) * 5.0 / 3.0;
                for value in weights.chain(bias) {
                    *value = rng.rand_normal() * scale_factor;
                }
            }
            KaimingZeroBias => {
                let scale_factor = inputs_count.powf(-0.5) * 5.0 / 3.0;
                for value in weights {
                    *value = rng.rand_normal() * scale_factor;
                }
                for value in bias {
                    *value = 0.0;
                }
            }
        }
    }

    fn full_rand(rng: &dyn RNG) -> NodeValue {
        (rng.rand() * 2.0) - 1.0
    }
}
