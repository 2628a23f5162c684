use std::time::Instant;

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use tracing::{info, instrument};

use plane::ml::{
    autodiff::{ConstRes, Gradient, Res},
    lstm::Lstm,
    skew::SkewLayer,
    solver::{AdamOptimizer, Optimizer, RMSpropOptimizer, SGDOptimizer},
    LayerValues, NodeValue, RngSeed, RngStrategy,
};

use crate::{
    config::{EvalConfig, OptimizerKind, TrainConfig},
    dataset::{self, Sample, TARGET_DIMENSION},
};

#[instrument(level = "info", name = "skew_train", skip_all)]
pub fn train(config: &TrainConfig) -> Result<SkewLayer> {
    validate_config(config)?;

    let rng = new_rng(config.seed);
    let lstm = Lstm::new(1, config.hidden_size, &rng).scale_input_weights(config.input_weight_scale);
    let mut layer = SkewLayer::new(lstm);
    let mut optimizer = new_optimizer(config.optimizer, config.train_rate);

    let test_set = dataset::generate(config.test_set_size, config.timesteps, &rng);
    info!(
        "Initialised skew layer: [ hidden_size = {}, timesteps = {}, params = {} ]",
        config.hidden_size,
        config.timesteps,
        layer.parameters().iter().map(|x| x.len()).sum::<usize>()
    );

    let started = Instant::now();
    for round in 0..config.training_rounds {
        let batch = dataset::generate(config.batch_size, config.timesteps, &rng);
        let (grad, train_loss) = compute_batch_gradient(&layer, &batch, config.lanes)?;
        optimizer.step(layer.parameters_mut(), &grad)?;

        if (round + 1) % config.report_interval.max(1) == 0 {
            let test_loss = compute_loss(&layer, &test_set, config.lanes)?;
            let ms_per_round = started.elapsed().as_millis() / (round as u128 + 1);
            info!(
                "round = {:<6} |  train_loss = {:<12.10}, test_loss = {:<12.10} [{ms_per_round}ms/round]",
                round + 1,
                train_loss,
                test_loss
            );
        }
    }

    if let Some(output_path) = &config.output_path {
        writer::write_model_to_disk(&layer, config, output_path)?;
    }

    Ok(layer)
}

#[instrument(level = "info", name = "skew_eval", skip_all)]
pub fn evaluate(config: &EvalConfig) -> Result<NodeValue> {
    let (layer, train_config) = writer::read_model_from_disk(&config.model_path)?;

    let rng = new_rng(config.seed);
    let test_set = dataset::generate(config.test_set_size, train_config.timesteps, &rng);
    let test_loss = compute_loss(&layer, &test_set, train_config.lanes)?;

    for sample in test_set.iter().take(config.print_samples) {
        let input = ConstRes::new(sample.input.clone());
        let output = layer.apply(&input);
        info!(
            "input = {:?} | target = {:?}, predicted = {:?}",
            sample.input,
            sample.target.as_slice(),
            &output.output()[..TARGET_DIMENSION]
        );
    }

    info!("Evaluated model: test_loss = {:<12.10}", test_loss);
    Ok(test_loss)
}

/// Mean loss and its gradient over `samples`, evaluated in chunks of up to `lanes` samples
/// on the rayon pool.
pub fn compute_batch_gradient(
    layer: &SkewLayer,
    samples: &[Sample],
    lanes: usize,
) -> Result<(Gradient, NodeValue)> {
    if samples.is_empty() {
        return Err(anyhow!("can not compute gradient of empty batch"));
    }
    let scale = 1.0 / samples.len() as NodeValue;

    let chunk_results = samples
        .par_chunks(lanes.max(1))
        .map(|chunk| chunk_gradient(layer, chunk, scale))
        .collect::<Result<Vec<_>>>()?;

    let mut grad = Gradient::zeros(layer.parameters());
    let mut loss = 0.0;
    for (chunk_grad, chunk_loss) in chunk_results {
        grad.merge(chunk_grad);
        loss += chunk_loss;
    }

    Ok((grad, loss * scale))
}

pub fn compute_loss(layer: &SkewLayer, samples: &[Sample], lanes: usize) -> Result<NodeValue> {
    if samples.is_empty() {
        return Ok(0.0);
    }

    let losses = samples
        .par_chunks(lanes.max(1))
        .map(|chunk| -> Result<NodeValue> {
            let input = ConstRes::new(join_inputs(chunk));
            let output = layer.batch(&input, chunk.len());
            let (loss, _) = chunk_loss(output.output(), chunk)?;
            Ok(loss)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(losses.iter().sum::<NodeValue>() / samples.len() as NodeValue)
}

fn chunk_gradient(
    layer: &SkewLayer,
    chunk: &[Sample],
    scale: NodeValue,
) -> Result<(Gradient, NodeValue)> {
    let input = ConstRes::new(join_inputs(chunk));
    let output = layer.batch(&input, chunk.len());
    let (loss, upstream) = chunk_loss(output.output(), chunk)?;

    let mut grad = Gradient::zeros(layer.parameters());
    output.propagate(upstream.iter().map(|x| x * scale).collect(), &mut grad);

    Ok((grad, loss))
}

/// Summed loss of the chunk and the upstream gradient over the layer output.
///
/// Only the leading [`TARGET_DIMENSION`] hidden units of each lane are scored.
fn chunk_loss(output: &[NodeValue], chunk: &[Sample]) -> Result<(NodeValue, Vec<NodeValue>)> {
    let hidden_size = output.len() / chunk.len();
    if hidden_size < TARGET_DIMENSION {
        Err(anyhow!(
            "layer output must hold at least {TARGET_DIMENSION} values per lane: found {hidden_size}"
        ))?;
    }
    let mut upstream = vec![0.0; output.len()];
    let mut loss = 0.0;

    for ((lane_output, lane_upstream), sample) in output
        .chunks_exact(hidden_size)
        .zip(upstream.chunks_exact_mut(hidden_size))
        .zip(chunk)
    {
        let predicted = LayerValues::from(&lane_output[..TARGET_DIMENSION]);
        loss += predicted.msd_error(&sample.target)?.ave();

        let dloss = predicted.msd_error_d(&sample.target)?;
        for (u, d) in lane_upstream.iter_mut().zip(dloss.iter()) {
            *u = d / TARGET_DIMENSION as NodeValue;
        }
    }

    Ok((loss, upstream))
}

fn join_inputs(chunk: &[Sample]) -> Vec<NodeValue> {
    chunk.iter().flat_map(|x| x.input.iter().copied()).collect()
}

fn validate_config(config: &TrainConfig) -> Result<()> {
    if config.hidden_size < TARGET_DIMENSION {
        Err(anyhow!(
            "hidden_size must be at least {TARGET_DIMENSION}: hidden_size={}",
            config.hidden_size
        ))?;
    }
    if config.timesteps == 0 {
        Err(anyhow!("timesteps must be positive"))?;
    }
    if config.batch_size == 0 {
        Err(anyhow!("batch_size must be positive"))?;
    }
    Ok(())
}

fn new_rng(seed: Option<u64>) -> RngStrategy {
    match seed {
        Some(seed) => RngStrategy::testable(seed),
        None => RngSeed::Default.into(),
    }
}

fn new_optimizer(kind: OptimizerKind, learn_rate: NodeValue) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Sgd => Box::new(SGDOptimizer::new(learn_rate)),
        OptimizerKind::Rmsprop => Box::new(RMSpropOptimizer::new().with_eta(learn_rate)),
        OptimizerKind::Adam => Box::new(AdamOptimizer::new(learn_rate)),
    }
}

pub mod writer {
    use std::{fs::File, io::BufReader};

    use anyhow::{Context, Result};
    use serde_json::Value;
    use tracing::info;

    use plane::ml::skew::SkewLayer;

    use crate::config::TrainConfig;

    pub fn write_model_to_disk(
        layer: &SkewLayer,
        config: &TrainConfig,
        file_path: &str,
    ) -> Result<()> {
        let mut snapshot: Value = serde_json::from_slice(&layer.serialize()?)?;
        snapshot["_trainer_config"] = serde_json::to_value(config)?;

        let snapshot_pretty = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(file_path, snapshot_pretty)
            .with_context(|| format!("unable to write model to path: {file_path}"))?;

        info!("Saved model to path: {file_path}");
        Ok(())
    }

    pub fn read_model_from_disk(file_path: &str) -> Result<(SkewLayer, TrainConfig)> {
        info!("Loading model from path: {file_path}");
        let file = File::open(file_path)
            .with_context(|| format!("unable to open model file: {file_path}"))?;
        let reader = BufReader::new(file);

        let mut snapshot: Value = serde_json::from_reader(reader)?;
        let config: TrainConfig = serde_json::from_value(snapshot["_trainer_config"].take())
            .context("unable to extract trainer config from saved model")?;

        let layer = SkewLayer::deserialize(&serde_json::to_vec(&snapshot)?)?;

        info!("Extracted model and trainer configuration from file");
        Ok((layer, config))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use test_log::test;

    use super::*;

    #[test]
    fn chunked_gradient_matches_single_chunk_gradient() {
        let config = TrainConfig::parse_from(["skewtrain", "-H", "4", "-s", "5"]);
        let rng = new_rng(config.seed);
        let layer = SkewLayer::new(Lstm::new(1, config.hidden_size, &rng));
        let samples = dataset::generate(10, 4, &rng);

        let (chunked, chunked_loss) = compute_batch_gradient(&layer, &samples, 3).unwrap();
        let (single, single_loss) = compute_batch_gradient(&layer, &samples, 10).unwrap();

        assert!((chunked_loss - single_loss).abs() < 1e-12);
        for param in layer.parameters() {
            let lhs = chunked.get(param).unwrap();
            let rhs = single.get(param).unwrap();
            for (x, y) in lhs.iter().zip(rhs) {
                assert!((x - y).abs() < 1e-12, "chunked={x}, single={y}");
            }
        }
    }

    #[test]
    fn batch_loss_matches_compute_loss() {
        let rng = RngStrategy::testable(9);
        let layer = SkewLayer::new(Lstm::new(1, 3, &rng));
        let samples = dataset::generate(6, 5, &rng);

        let (_, batch_loss) = compute_batch_gradient(&layer, &samples, 4).unwrap();
        let loss = compute_loss(&layer, &samples, 2).unwrap();

        assert!((batch_loss - loss).abs() < 1e-12);
    }

    #[test]
    fn training_reduces_test_loss() {
        let config = TrainConfig::parse_from([
            "skewtrain", "-H", "6", "-t", "4", "-c", "150", "-b", "16", "-r", "0.02", "-s", "1234",
        ]);
        let rng = new_rng(config.seed);
        let test_set = dataset::generate(64, config.timesteps, &rng);

        let initial_layer = SkewLayer::new(
            Lstm::new(1, config.hidden_size, &new_rng(config.seed))
                .scale_input_weights(config.input_weight_scale),
        );
        let initial_loss = compute_loss(&initial_layer, &test_set, 8).unwrap();

        let layer = train(&config).unwrap();
        let trained_loss = compute_loss(&layer, &test_set, 8).unwrap();

        assert!(
            trained_loss < initial_loss,
            "initial_loss={initial_loss}, trained_loss={trained_loss}"
        );
    }

    #[test]
    fn train_rejects_small_hidden_size() {
        let config = TrainConfig::parse_from(["skewtrain", "-H", "2"]);
        assert!(train(&config).is_err());
    }

    #[test]
    fn loss_rejects_layers_narrower_than_target() {
        let rng = RngStrategy::testable(17);
        let layer = SkewLayer::new(Lstm::new(1, 2, &rng));
        let samples = dataset::generate(4, 3, &rng);

        assert!(compute_loss(&layer, &samples, 2).is_err());
        assert!(compute_batch_gradient(&layer, &samples, 2).is_err());
    }

    #[test]
    fn model_can_be_written_and_evaluated() {
        let file_name = format!("skewtrain-model-{}.json", std::process::id());
        let path = std::env::temp_dir().join(file_name);
        let path_str = path.to_str().unwrap().to_string();

        let config = TrainConfig::parse_from([
            "skewtrain", "-H", "4", "-c", "5", "-s", "3", "-o", path_str.as_str(),
        ]);
        let layer = train(&config).unwrap();

        let (restored, restored_config) = writer::read_model_from_disk(&path_str).unwrap();
        assert_eq!(layer.parameters(), restored.parameters());
        assert_eq!(config.hidden_size, restored_config.hidden_size);

        let eval_config = EvalConfig {
            model_path: path_str.clone(),
            test_set_size: 8,
            seed: Some(4),
            print_samples: 1,
        };
        let loss = evaluate(&eval_config).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(loss.is_finite());
    }
}
