use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use core::time::Duration;
use genserve::{DEFAULT_QUEUE_CAPACITY, DEFAULT_STREAM_BUFFER_SIZE, runtime::Precision};
use serde::{Deserialize, Deserializer};
use std::{
    collections::{BTreeMap, HashSet},
    net::IpAddr,
    path::{Path, PathBuf},
};

/// Port used by a deployment given with `--model`.
pub const CUSTOM_MODEL_PORT: u16 = 8000;

/// Route used by a deployment given with `--model`.
pub const CUSTOM_MODEL_ROUTE: &str = "/custom-model";

/// Runtime configuration for the `genserve-server` binary.
///
/// Deployments come either from a JSON model table (`--config`) or from a
/// single `--model`. Everything else tunes how each deployment's workers and
/// streams behave. All values can also be set through environment variables
/// (including a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "genserve-server",
    version,
    about = "Deploy generative language models behind HTTP endpoints"
)]
pub struct CliArgs {
    /// JSON model table describing the deployments to start.
    ///
    /// Environment variable: `GENSERVE_CONFIG`
    #[arg(long, env = "GENSERVE_CONFIG", conflicts_with = "model")]
    pub config: Option<PathBuf>,

    /// Model id or path for a single deployment at `/custom-model` on port
    /// 8000.
    ///
    /// Environment variable: `MODEL`
    #[arg(long, env = "MODEL")]
    pub model: Option<String>,

    /// Tokenizer name or path for `--model`. Defaults to the model path.
    ///
    /// Environment variable: `TOKENIZER`
    #[arg(long, env = "TOKENIZER", requires = "model")]
    pub tokenizer: Option<String>,

    /// Address every deployment listens on.
    ///
    /// Environment variable: `HOST`
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Worker threads (loaded model copies) per deployment.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 1)]
    pub num_workers: usize,

    /// Requests that may wait in each worker's queue.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Undelivered text fragments buffered per streaming request before the
    /// worker waits for the client.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = DEFAULT_STREAM_BUFFER_SIZE)]
    pub stream_buffer_size: usize,

    /// Upper bound in milliseconds on any wait inside a stream channel. `0`
    /// waits forever.
    ///
    /// Environment variable: `STREAM_TIMEOUT_MS`
    #[arg(long, env = "STREAM_TIMEOUT_MS", default_value_t = 0)]
    pub stream_timeout_ms: u64,

    /// Seconds each deployment gets to load its model before it is given up.
    ///
    /// Environment variable: `STARTUP_TIMEOUT_SECS`
    #[arg(long, env = "STARTUP_TIMEOUT_SECS", default_value_t = 600)]
    pub startup_timeout_secs: u64,

    /// Seconds in-flight streams get to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout: u64,

    /// Weight precision: `fp32` or `bf16`.
    ///
    /// Environment variable: `PRECISION`
    #[arg(long, env = "PRECISION", default_value = "bf16", value_parser = parse_precision)]
    pub precision: Precision,

    /// Leave the prompt out of streamed text.
    ///
    /// Environment variable: `SKIP_PROMPT`
    #[arg(long, env = "SKIP_PROMPT", default_value_t = true, action = ArgAction::Set)]
    pub skip_prompt: bool,
}

fn parse_precision(value: &str) -> Result<Precision, String> {
    match value.to_ascii_lowercase().as_str() {
        "fp32" => Ok(Precision::Fp32),
        "bf16" => Ok(Precision::Bf16),
        other => Err(format!("unknown precision {other:?} (expected fp32 or bf16)")),
    }
}

/// One entry of the model table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct DeploymentConfig {
    pub name: String,
    pub model_id_or_path: String,
    #[serde(default)]
    pub tokenizer_name_or_path: Option<String>,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    pub route_prefix: String,
    #[serde(default)]
    pub trust_remote_code: Option<bool>,
    #[serde(default)]
    pub prompt: PromptConfig,
}

impl DeploymentConfig {
    /// A deployment of `model` at `/custom-model` on port 8000.
    pub fn custom(model: String, tokenizer: Option<String>) -> Self {
        Self {
            name: "custom-model".into(),
            model_id_or_path: model,
            tokenizer_name_or_path: tokenizer,
            port: CUSTOM_MODEL_PORT,
            route_prefix: CUSTOM_MODEL_ROUTE.into(),
            trust_remote_code: None,
            prompt: PromptConfig::default(),
        }
    }

    pub fn tokenizer(&self) -> &str {
        self.tokenizer_name_or_path
            .as_deref()
            .unwrap_or(&self.model_id_or_path)
    }

    pub fn trust_remote_code(&self) -> bool {
        self.trust_remote_code.unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PromptConfig {
    #[serde(default)]
    pub stop_words: Vec<String>,
}

/// Ports appear both as numbers and as strings in model tables.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Parses a model table: a JSON object of deployments keyed by model name.
pub fn parse_model_table(json: &str) -> anyhow::Result<Vec<DeploymentConfig>> {
    let table: BTreeMap<String, DeploymentConfig> =
        serde_json::from_str(json).context("invalid model table")?;
    Ok(table.into_values().collect())
}

fn read_model_table(path: &Path) -> anyhow::Result<Vec<DeploymentConfig>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model table {}", path.display()))?;
    parse_model_table(&json).with_context(|| format!("in {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub deployments: Vec<DeploymentConfig>,
    pub host: IpAddr,
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub stream_buffer_size: usize,
    pub stream_timeout: Option<Duration>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub precision: Precision,
    pub skip_prompt: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        let deployments = match (args.config, args.model) {
            (Some(path), _) => read_model_table(&path)?,
            (None, Some(model)) => vec![DeploymentConfig::custom(model, args.tokenizer)],
            (None, None) => bail!("either --config or --model is required"),
        };
        validate_deployments(&deployments)?;

        Ok(Self {
            deployments,
            host: args.host,
            num_workers: args.num_workers,
            queue_capacity: args.queue_capacity,
            stream_buffer_size: args.stream_buffer_size,
            stream_timeout: (args.stream_timeout_ms > 0)
                .then(|| Duration::from_millis(args.stream_timeout_ms)),
            startup_timeout: Duration::from_secs(args.startup_timeout_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            precision: args.precision,
            skip_prompt: args.skip_prompt,
        })
    }
}

/// Rejects tables that cannot be served: no entries, malformed routes, or two
/// deployments on the same port and route.
pub fn validate_deployments(deployments: &[DeploymentConfig]) -> anyhow::Result<()> {
    if deployments.is_empty() {
        bail!("the model table contains no deployments");
    }

    let mut seen = HashSet::new();
    for deployment in deployments {
        if !deployment.route_prefix.starts_with('/') {
            bail!(
                "deployment {:?}: route_prefix {:?} must start with '/'",
                deployment.name,
                deployment.route_prefix
            );
        }
        if !seen.insert((deployment.port, deployment.route_prefix.as_str())) {
            bail!(
                "deployment {:?}: route {} on port {} is already taken",
                deployment.name,
                deployment.route_prefix,
                deployment.port
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r####"{
        "gpt-j-6B": {
            "model_id_or_path": "EleutherAI/gpt-j-6b",
            "tokenizer_name_or_path": "EleutherAI/gpt-j-6b",
            "port": "8000",
            "name": "gpt-j-6B",
            "route_prefix": "/gpt-j-6B",
            "chat_model": "ChatModelGptJ",
            "prompt": {
                "intro": "Below is an instruction...",
                "human_id": "\n### Instruction",
                "bot_id": "\n### Response",
                "stop_words": ["### Instruction", "</s>"]
            }
        },
        "mpt-7b": {
            "model_id_or_path": "mosaicml/mpt-7b",
            "port": 8001,
            "name": "mpt-7b",
            "route_prefix": "/mpt-7b",
            "trust_remote_code": true
        }
    }"####;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["genserve-server"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parses_model_table() {
        let deployments = parse_model_table(TABLE).unwrap();
        assert_eq!(deployments.len(), 2);

        let gptj = &deployments[0];
        assert_eq!(gptj.port, 8000);
        assert_eq!(gptj.tokenizer(), "EleutherAI/gpt-j-6b");
        assert_eq!(gptj.prompt.stop_words, vec!["### Instruction", "</s>"]);
        assert!(!gptj.trust_remote_code());

        let mpt = &deployments[1];
        assert_eq!(mpt.port, 8001);
        assert_eq!(mpt.tokenizer(), "mosaicml/mpt-7b");
        assert!(mpt.prompt.stop_words.is_empty());
        assert!(mpt.trust_remote_code());
    }

    #[test]
    fn rejects_bad_port() {
        let table = r#"{"m": {"name": "m", "model_id_or_path": "m", "port": "http", "route_prefix": "/m"}}"#;
        assert!(parse_model_table(table).is_err());
    }

    #[test]
    fn model_flag_builds_custom_deployment() {
        let config =
            ServerConfig::try_from(args(&["--model", "echo", "--tokenizer", "bytes"])).unwrap();
        assert_eq!(config.deployments.len(), 1);

        let deployment = &config.deployments[0];
        assert_eq!(deployment.name, "custom-model");
        assert_eq!(deployment.port, CUSTOM_MODEL_PORT);
        assert_eq!(deployment.route_prefix, CUSTOM_MODEL_ROUTE);
        assert_eq!(deployment.tokenizer(), "bytes");

        assert_eq!(config.precision, Precision::Bf16);
        assert_eq!(config.stream_timeout, None);
        assert!(config.skip_prompt);
    }

    #[test]
    fn cli_values_are_validated() {
        assert!(ServerConfig::try_from(args(&["--model", "echo", "--num-workers", "0"])).is_err());
        assert!(ServerConfig::try_from(args(&[])).is_err());
        assert!(CliArgs::try_parse_from(["genserve-server", "--precision", "fp16"]).is_err());

        let config = ServerConfig::try_from(args(&[
            "--model",
            "echo",
            "--precision",
            "fp32",
            "--stream-timeout-ms",
            "250",
            "--skip-prompt",
            "false",
        ]))
        .unwrap();
        assert_eq!(config.precision, Precision::Fp32);
        assert_eq!(config.stream_timeout, Some(Duration::from_millis(250)));
        assert!(!config.skip_prompt);
    }

    #[test]
    fn duplicate_routes_on_one_port_are_rejected() {
        let mut a = DeploymentConfig::custom("echo".into(), None);
        let b = a.clone();
        assert!(validate_deployments(&[a.clone(), b]).is_err());

        let mut c = a.clone();
        c.port = 8001;
        assert!(validate_deployments(&[a.clone(), c]).is_ok());

        a.route_prefix = "no-slash".into();
        assert!(validate_deployments(&[a]).is_err());
    }
}
