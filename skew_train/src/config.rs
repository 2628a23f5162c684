use std::{fs::File, io::BufReader};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use plane::ml::NodeValue;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[arg(short = 'H', long, default_value_t = 8)]
    pub hidden_size: usize,

    #[arg(short = 't', long, default_value_t = 6)]
    pub timesteps: usize,

    #[arg(short = 'c', long, default_value_t = 300)]
    pub training_rounds: usize,

    #[arg(short = 'b', long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(short = 'l', long, default_value_t = 8)]
    pub lanes: usize,

    #[arg(short = 'r', long, default_value_t = 1e-2)]
    pub train_rate: NodeValue,

    #[arg(short = 'k', long, default_value_t = 5.0)]
    pub input_weight_scale: NodeValue,

    #[arg(short = 'O', long, value_enum, default_value_t = OptimizerKind::Adam)]
    #[serde(default)]
    pub optimizer: OptimizerKind,

    #[arg(short = 'T', long, default_value_t = 128)]
    pub test_set_size: usize,

    #[arg(short = 'i', long, default_value_t = 25)]
    pub report_interval: usize,

    #[arg(short = 's', long, default_value = None)]
    #[serde(default)]
    pub seed: Option<u64>,

    #[arg(short = 'o', long, default_value = None)]
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Sgd,
    Rmsprop,
    #[default]
    Adam,
}

#[derive(Args, Debug, Clone)]
pub struct JsonTrainConfig {
    pub file_path: String,
}

#[derive(Args, Debug, Clone)]
pub struct EvalConfig {
    pub model_path: String,

    #[arg(short = 'T', long, default_value_t = 128)]
    pub test_set_size: usize,

    #[arg(short = 's', long, default_value = None)]
    pub seed: Option<u64>,

    #[arg(short = 'p', long, default_value_t = 3)]
    pub print_samples: usize,
}

#[derive(Parser, Debug, Clone)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    train_command: TrainConfig,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Train(self.train_command.clone()))
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(name = "train")]
    Train(TrainConfig),

    #[command(name = "json", arg_required_else_help = true)]
    JsonTrain(JsonTrainConfig),

    #[command(name = "eval", arg_required_else_help = true)]
    Eval(EvalConfig),
}

pub fn load_json_config(file_path: &str) -> Result<TrainConfig> {
    let file = File::open(file_path)
        .with_context(|| format!("unable to open trainer config: {file_path}"))?;
    let reader = BufReader::new(file);

    serde_json::from_reader(reader).context("unable to parse trainer config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_train_command() {
        let cli = Cli::parse_from(["skewtrain", "-H", "4", "-c", "10"]);

        match cli.command() {
            Command::Train(config) => {
                assert_eq!(4, config.hidden_size);
                assert_eq!(10, config.training_rounds);
                assert_eq!(OptimizerKind::Adam, config.optimizer);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_can_parse_eval_command() {
        let cli = Cli::parse_from(["skewtrain", "eval", "model.json", "-s", "7"]);

        match cli.command() {
            Command::Eval(config) => {
                assert_eq!("model.json", config.model_path);
                assert_eq!(Some(7), config.seed);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn train_config_can_be_loaded_from_json() {
        let config = TrainConfig::parse_from(["skewtrain", "-O", "rmsprop", "-s", "3"]);
        let json = serde_json::to_string(&config).unwrap();

        let file_name = format!("skewtrain-config-{}.json", std::process::id());
        let path = std::env::temp_dir().join(file_name);
        std::fs::write(&path, json).unwrap();
        let restored = load_json_config(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(OptimizerKind::Rmsprop, restored.optimizer);
        assert_eq!(Some(3), restored.seed);
        assert_eq!(config.hidden_size, restored.hidden_size);
    }

    #[test]
    fn missing_json_config_is_reported() {
        let err = load_json_config("/nonexistent/skewtrain.json").unwrap_err();
        assert!(err.to_string().contains("unable to open trainer config"));
    }
}
