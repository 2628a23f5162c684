use plane::ml::{LayerValues, NodeValue, RngStrategy, RNG};

/// Number of leading hidden units trained to hold the sequence summary.
pub const TARGET_DIMENSION: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input: Vec<NodeValue>,
    pub target: LayerValues,
}

impl Sample {
    pub fn new(input: Vec<NodeValue>) -> Self {
        let target = summarize(&input);
        Self { input, target }
    }
}

/// Random sequences with components in `[-1, 1)`.
pub fn generate(count: usize, timesteps: usize, rng: &RngStrategy) -> Vec<Sample> {
    (0..count)
        .map(|_| {
            let input = (0..timesteps).map(|_| rng.rand() * 2.0 - 1.0).collect();
            Sample::new(input)
        })
        .collect()
}

/// Half-scaled mean, first and last components of a sequence.
pub fn summarize(input: &[NodeValue]) -> LayerValues {
    let first = input.first().copied().unwrap_or_default();
    let last = input.last().copied().unwrap_or_default();
    let mean = LayerValues::from(input).ave();

    [mean, first, last].into_iter().map(|x| x * 0.5).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_holds_mean_first_and_last() {
        let target = summarize(&[1.0, -1.0, 2.0, -0.5, 3.0]);

        assert_eq!(LayerValues::new(vec![0.45, 0.5, 1.5]), target);
        assert_eq!(TARGET_DIMENSION, target.len());
    }

    #[test]
    fn generated_samples_are_bounded_and_reproducible() {
        let samples = generate(16, 5, &RngStrategy::testable(12));
        let repeated = generate(16, 5, &RngStrategy::testable(12));

        assert_eq!(samples, repeated);
        assert!(samples
            .iter()
            .flat_map(|x| x.input.iter())
            .all(|x| (-1.0..1.0).contains(x)));
        assert!(samples.iter().all(|x| x.input.len() == 5));
    }
}
