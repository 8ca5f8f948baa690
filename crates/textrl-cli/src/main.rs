//! TextRL CLI
//!
//! Command-line interface for PPO fine-tuning with the built-in byte-level
//! policy and a lexicon sentiment reward.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use textrl::checkpoint::{CheckpointManager, Checkpointable, POLICY_FILE};
use textrl::config::GenerationConfig;
use textrl::policy::{BigramPolicy, ByteTokenizer, Tokenizer, TrainablePolicy};
use textrl::prelude::*;
use textrl::rollout::RolloutGenerator;
use textrl::sync::{BackgroundUploader, FsObjectStore, RemoteUri};

#[derive(Parser)]
#[command(name = "textrl")]
#[command(version, about = "TextRL - PPO fine-tuning for text generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the built-in byte-level policy with PPO
    Train {
        /// Config file (JSON); defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON object merged over the config, e.g. '{"train":{"epochs":10}}'
        #[arg(long = "override")]
        overrides: Option<String>,

        /// Newline-separated prompt file (a built-in set when omitted)
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Remote checkpoint location, e.g. file://bucket/run1
        #[arg(long)]
        remote: Option<String>,

        /// Append per-round metrics as JSON lines to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Local directory backing the `file` remote scheme
        #[arg(long, default_value = "remote")]
        remote_root: PathBuf,

        /// Policy learning rate
        #[arg(long, default_value = "0.5")]
        lr: f32,
    },

    /// Evaluate a checkpoint: greedy generation and mean reward
    Eval {
        /// Checkpoint directory holding policy.json
        checkpoint: PathBuf,

        /// Newline-separated prompt file (a built-in set when omitted)
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Tokens to generate per prompt
        #[arg(long, default_value = "40")]
        max_new_tokens: usize,
    },

    /// Print the default configuration as JSON
    PrintConfig,
}

const BUILTIN_PROMPTS: &[&str] = &[
    "the movie was",
    "this film is",
    "i thought the acting was",
    "the plot felt",
    "overall the experience was",
    "the soundtrack sounded",
    "the ending left me",
    "the characters were",
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "love", "excellent", "wonderful", "best", "amazing", "enjoy", "brilliant",
    "delight",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "hate", "awful", "boring", "worst", "poor", "dull", "mess", "waste",
];

/// Lexicon sentiment: positive hits minus negative hits.
fn sentiment_score(text: &str) -> f32 {
    let lower = text.to_lowercase();
    let hits = |words: &[&str]| words.iter().filter(|w| lower.contains(*w)).count() as f32;
    hits(POSITIVE_WORDS) - hits(NEGATIVE_WORDS)
}

fn sentiment_reward() -> Box<dyn RewardFn> {
    Box::new(|samples: &[String]| Ok(samples.iter().map(|s| sentiment_score(s)).collect()))
}

fn load_prompts(path: Option<&Path>) -> Result<Vec<String>> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read prompts from {}", path.display()))?;
            let prompts: Vec<String> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
            if prompts.is_empty() {
                bail!("prompt file {} is empty", path.display());
            }
            Ok(prompts)
        }
        None => Ok(BUILTIN_PROMPTS.iter().map(|p| p.to_string()).collect()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            overrides,
            prompts,
            remote,
            log_file,
            remote_root,
            lr,
        } => train(
            config.as_deref(),
            overrides.as_deref(),
            prompts.as_deref(),
            remote.as_deref(),
            log_file.as_deref(),
            &remote_root,
            lr,
        ),
        Commands::Eval {
            checkpoint,
            prompts,
            max_new_tokens,
        } => eval(&checkpoint, prompts.as_deref(), max_new_tokens),
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&TrlConfig::default())?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, overrides: Option<&str>) -> Result<TrlConfig> {
    let base = match path {
        Some(path) => TrlConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TrlConfig::default(),
    };
    match overrides {
        Some(json) => {
            let value = serde_json::from_str(json).context("override is not valid JSON")?;
            Ok(base.update(&value)?)
        }
        None => Ok(base),
    }
}

fn train(
    config_path: Option<&Path>,
    overrides: Option<&str>,
    prompts_path: Option<&Path>,
    remote: Option<&str>,
    log_file: Option<&Path>,
    remote_root: &Path,
    lr: f32,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let prompts = load_prompts(prompts_path)?;
    let eval_prompts = prompts.clone();

    let logger: Box<dyn MetricLogger> = match log_file {
        Some(path) => Box::new(CompositeLogger::new(vec![
            Box::new(ConsoleLogger::new()),
            Box::new(JsonlLogger::create(path)?),
        ])),
        None => Box::new(ConsoleLogger::new()),
    };

    let mut trainer = PpoTrainer::new(
        config.clone(),
        BigramPolicy::byte_level(lr),
        Box::new(ByteTokenizer),
        sentiment_reward(),
        PromptSource::with_seed(prompts, true, config.train.seed),
        eval_prompts,
    )?
    .with_logger(logger);

    if let Some(uri) = remote {
        let remote = RemoteUri::parse(uri)?;
        if remote.scheme != "file" {
            bail!(
                "unsupported remote scheme `{}`; only `file` is built in",
                remote.scheme
            );
        }
        let store = Box::new(FsObjectStore::new(remote_root));
        let staging = PathBuf::from(&config.train.checkpoint_dir);
        trainer = trainer.with_uploader(BackgroundUploader::new(store, remote, staging));
    }

    trainer.train()?;
    tracing::info!(
        checkpoint_dir = %config.train.checkpoint_dir,
        "Final artifact written to the `delta` subdirectory"
    );
    Ok(())
}

fn eval(checkpoint: &Path, prompts_path: Option<&Path>, max_new_tokens: usize) -> Result<()> {
    let weights = CheckpointManager::read_file(checkpoint, POLICY_FILE)?;
    let mut policy = BigramPolicy::byte_level(0.0);
    policy.load_state(&weights)?;

    let prompts = load_prompts(prompts_path)?;
    let tokenizer = ByteTokenizer;
    let gen_kwargs = GenerationConfig {
        max_new_tokens,
        do_sample: false,
        ..GenerationConfig::default()
    };
    let prompt_tokens: Vec<Vec<_>> = prompts.iter().map(|p| tokenizer.encode(p)).collect();
    let longest = prompt_tokens.iter().map(Vec::len).max().unwrap_or(0);
    let mut generator = RolloutGenerator::new(&gen_kwargs, longest + max_new_tokens, 0);
    let reference = policy.snapshot();

    let rollouts = generator.generate(&policy, reference.as_ref(), &prompt_tokens)?;

    let mut scores = Vec::with_capacity(rollouts.len());
    for rollout in &rollouts {
        let text = format!(
            "{}{}",
            tokenizer.decode(&rollout.prompt),
            tokenizer.decode(&rollout.response)
        );
        let score = sentiment_score(&text);
        println!("{score:+.1}  {text}");
        scores.push(score);
    }
    let mean = scores.iter().sum::<f32>() / scores.len() as f32;
    println!("mean reward: {mean:.4} over {} prompts", scores.len());
    Ok(())
}
