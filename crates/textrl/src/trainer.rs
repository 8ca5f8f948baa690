//! Main PPO trainer loop.
//!
//! One generation round is: draw prompts, roll out the policy, score the
//! completions, estimate advantages, replace the experience store, then run
//! `ppo_epochs` chunked optimization passes over it. The KL penalty
//! coefficient is updated once per round from the realized divergence, and
//! evaluation/checkpointing run on their own round cadences.

use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand_chacha::ChaCha8Rng;

use crate::checkpoint::{
    CheckpointConfig, CheckpointManager, Checkpointable, RunState, POLICY_FILE, STATE_FILE,
    TOKENIZER_FILE,
};
use crate::config::{GenerationConfig, TrlConfig};
use crate::distributed::DistributedBackend;
use crate::gae;
use crate::kl::KlController;
use crate::log::{MetricLogger, NoOpLogger, RoundMetrics};
use crate::policy::{SampleGrads, Token, Tokenizer, TrainablePolicy};
use crate::reward::{RewardFn, RewardScorer};
use crate::rollout::{PromptSource, RolloutGenerator};
use crate::store::ExperienceStore;
use crate::sync::BackgroundUploader;
use crate::utils::{mean, seeded_rng, whiten};
use crate::{Result, TextRlError};

/// Per-chunk loss statistics, for logging.
struct ChunkStats {
    policy_loss: f64,
    value_loss: f64,
    approx_kl: f64,
}

/// PPO trainer over a black-box trainable policy.
pub struct PpoTrainer<P: TrainablePolicy + Checkpointable> {
    config: TrlConfig,
    policy: P,
    reference: Box<dyn crate::policy::ReferencePolicy>,
    tokenizer: Box<dyn Tokenizer>,
    scorer: RewardScorer,
    generator: RolloutGenerator,
    prompts: PromptSource,
    eval_prompts: Vec<String>,
    store: ExperienceStore,
    kl: KlController,
    checkpoints: CheckpointManager,
    uploader: Option<BackgroundUploader>,
    logger: Box<dyn MetricLogger>,
    distributed: Option<Arc<dyn DistributedBackend>>,
    rng: ChaCha8Rng,
    round: u64,
    global_step: u64,
    last_eval_reward: f64,
    start_time: Instant,
    progress: Option<ProgressBar>,
}

impl<P: TrainablePolicy + Checkpointable> PpoTrainer<P> {
    /// Create a trainer. The KL reference is snapshotted from the policy
    /// here, before any parameter update.
    pub fn new(
        config: TrlConfig,
        policy: P,
        tokenizer: Box<dyn Tokenizer>,
        reward_fn: Box<dyn RewardFn>,
        prompts: PromptSource,
        eval_prompts: Vec<String>,
    ) -> Result<Self> {
        config.validate()?;
        if prompts.is_empty() {
            return Err(TextRlError::Config("prompt source is empty".into()));
        }

        let reference = policy.snapshot();
        let scorer = RewardScorer::new(reward_fn, config.train.batch_size, &config.method);
        let generator = RolloutGenerator::new(
            &config.method.gen_kwargs,
            config.train.seq_length,
            config.train.seed,
        );
        let store = ExperienceStore::new(config.method.num_rollouts);
        let kl = KlController::new(
            config.method.init_kl_coef,
            config.method.target,
            config.method.horizon,
        );
        let checkpoints =
            CheckpointManager::new(CheckpointConfig::new(config.train.checkpoint_dir.clone()));
        let rng = seeded_rng(config.train.seed.wrapping_add(1));

        let progress = if config.train.total_steps > 0 {
            let pb = ProgressBar::new(config.train.total_steps);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Ok(Self {
            config,
            policy,
            reference,
            tokenizer,
            scorer,
            generator,
            prompts,
            eval_prompts,
            store,
            kl,
            checkpoints,
            uploader: None,
            logger: Box::new(NoOpLogger),
            distributed: None,
            rng,
            round: 0,
            global_step: 0,
            last_eval_reward: f64::NEG_INFINITY,
            start_time: Instant::now(),
            progress,
        })
    }

    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Ship checkpoints to a remote store as they are written.
    pub fn with_uploader(mut self, uploader: BackgroundUploader) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Cooperate with other workers: gradients averaged per step, observed
    /// KL pooled per round.
    pub fn with_distributed(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn kl_coef(&self) -> f64 {
        self.kl.kl_coef()
    }

    pub fn last_eval_reward(&self) -> f64 {
        self.last_eval_reward
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn store(&self) -> &ExperienceStore {
        &self.store
    }

    fn is_master(&self) -> bool {
        self.distributed.as_ref().map_or(true, |b| b.is_master())
    }

    /// Run the training loop to completion.
    ///
    /// Stops when either `total_steps` optimization steps or `epochs`
    /// generation rounds have been reached, whichever comes first, then
    /// writes the final `delta` artifact.
    pub fn train(&mut self) -> Result<()> {
        tracing::info!(
            rounds = self.config.train.epochs,
            total_steps = self.config.train.total_steps,
            num_rollouts = self.config.method.num_rollouts,
            "Starting PPO training"
        );

        while self.round < self.config.train.epochs
            && self.global_step < self.config.train.total_steps
        {
            self.round += 1;
            self.run_round()?;

            if self.round.is_multiple_of(self.config.train.eval_interval)
                && !self.eval_prompts.is_empty()
            {
                self.last_eval_reward = self.evaluate()?;
            }

            if self.round.is_multiple_of(self.config.train.checkpoint_interval)
                && self.is_master()
            {
                self.save_checkpoint();
            }
        }

        if self.is_master() {
            self.save_final();
        }
        if let Some(uploader) = self.uploader.take() {
            uploader.shutdown();
        }
        if let Some(pb) = &self.progress {
            pb.finish_with_message("Training complete");
        }
        self.logger.close();

        tracing::info!(
            rounds = self.round,
            steps = self.global_step,
            elapsed = ?self.start_time.elapsed(),
            "Training finished"
        );
        Ok(())
    }

    /// One generation round plus its inner optimization passes.
    fn run_round(&mut self) -> Result<()> {
        let round = self.round;
        let method = self.config.method.clone();

        // Generate
        let prompt_texts = self.prompts.next_batch(method.num_rollouts);
        let prompt_tokens: Vec<Vec<Token>> = prompt_texts
            .iter()
            .map(|p| self.encode_prompt(p))
            .collect();
        let mut rollouts = self
            .generator
            .generate(&self.policy, self.reference.as_ref(), &prompt_tokens)
            .map_err(|e| e.in_round(round))?;

        // Score
        let texts: Vec<String> = rollouts
            .iter()
            .map(|r| {
                format!(
                    "{}{}",
                    self.tokenizer.decode(&r.prompt),
                    self.tokenizer.decode(&r.response)
                )
            })
            .collect();
        let scores = self.scorer.score(&texts).map_err(|e| e.in_round(round))?;
        for (rollout, score) in rollouts.iter_mut().zip(&scores) {
            rollout.score = *score;
        }
        let mean_score = mean(&scores) as f64;

        // Estimate and store
        let kl_coef = self.kl.kl_coef() as f32;
        let samples = rollouts
            .into_iter()
            .map(|r| gae::estimate(r, kl_coef, method.gamma, method.lam).map_err(|e| e.in_round(round)))
            .collect::<Result<Vec<_>>>()?;
        let round_kl =
            samples.iter().map(|s| s.mean_kl as f64).sum::<f64>() / samples.len() as f64;
        self.store.replace(samples).map_err(|e| e.in_round(round))?;

        // Optimize
        let mut policy_loss = 0.0;
        let mut value_loss = 0.0;
        let mut approx_kl = 0.0;
        let mut steps = 0u64;
        'optimize: for epoch in 0..method.ppo_epochs {
            let chunks = self.store.epoch_chunks(method.chunk_size, Some(&mut self.rng));
            for (chunk_idx, chunk) in chunks.into_iter().enumerate() {
                let stats = self.train_chunk(&chunk, epoch, chunk_idx)?;
                policy_loss += stats.policy_loss;
                value_loss += stats.value_loss;
                approx_kl += stats.approx_kl;
                steps += 1;
                self.global_step += 1;

                if let Some(pb) = &self.progress {
                    pb.set_position(self.global_step);
                }
                if self.global_step >= self.config.train.total_steps {
                    break 'optimize;
                }
            }
        }
        let steps_f = steps.max(1) as f64;
        policy_loss /= steps_f;
        value_loss /= steps_f;
        approx_kl /= steps_f;

        // KL controller update from the pooled round divergence
        let pooled_kl = match &self.distributed {
            Some(backend) => backend.all_reduce_scalar(round_kl),
            None => round_kl,
        };
        if !pooled_kl.is_finite() {
            return Err(TextRlError::NumericInstability {
                quantity: "kl".into(),
                round,
                epoch: 0,
                chunk: 0,
            });
        }
        let world_size = self.distributed.as_ref().map_or(1, |b| b.world_size());
        self.kl.update(pooled_kl, method.num_rollouts * world_size);

        let total_loss = policy_loss + method.vf_coef as f64 * value_loss;
        self.logger.log_round(&RoundMetrics {
            round,
            step: self.global_step,
            reward_mean: mean_score,
            kl_observed: pooled_kl,
            kl_coef: self.kl.kl_coef(),
            policy_loss,
            value_loss,
            total_loss,
            approx_kl,
        });

        if let Some(pb) = &self.progress {
            let sps = self.global_step as f64 / self.start_time.elapsed().as_secs_f64().max(1e-9);
            pb.set_message(format!(
                "Loss: {total_loss:.4} Reward: {mean_score:.2} SPS: {sps:.2}"
            ));
        } else {
            tracing::info!(
                round,
                step = self.global_step,
                reward = mean_score,
                loss = total_loss,
                kl = pooled_kl,
                kl_coef = self.kl.kl_coef(),
                "Round complete"
            );
        }
        Ok(())
    }

    /// One optimization step over a chunk of stored samples.
    ///
    /// Computes the clipped surrogate policy loss and the clipped value loss
    /// over every generated token in the chunk, differentiates them with
    /// respect to the recomputed log-probabilities and values, and hands the
    /// per-token gradients to the policy as a single joint update.
    fn train_chunk(&mut self, chunk: &[usize], epoch: usize, chunk_idx: usize) -> Result<ChunkStats> {
        let method = &self.config.method;

        // Whiten advantages over the whole chunk
        let flat: Vec<f32> = chunk
            .iter()
            .flat_map(|&i| self.store.get(i).advantages.iter().copied())
            .collect();
        let advantages = whiten(&flat);
        let n = advantages.len() as f32;

        let mut grads = Vec::with_capacity(chunk.len());
        let mut policy_loss = 0.0f64;
        let mut value_loss = 0.0f64;
        let mut approx_kl = 0.0f64;
        let mut offset = 0usize;

        for &i in chunk {
            let sample = self.store.get(i);
            let eval = self
                .policy
                .evaluate(&sample.prompt, &sample.response)
                .map_err(|e| e.in_round(self.round))?;
            let len = sample.response.len();
            let chunk_adv = &advantages[offset..offset + len];
            offset += len;

            let mut d_log_probs = Vec::with_capacity(len);
            let mut d_values = Vec::with_capacity(len);

            for pos in 0..len {
                let adv = chunk_adv[pos];
                let ratio = (eval.log_probs[pos] - sample.log_probs[pos]).exp();
                let clipped = ratio.clamp(1.0 - method.cliprange, 1.0 + method.cliprange);
                let surr1 = ratio * adv;
                let surr2 = clipped * adv;
                policy_loss += -surr1.min(surr2) as f64;
                // The clipped branch is constant in the log-prob
                d_log_probs.push(if surr1 <= surr2 { -adv * ratio / n } else { 0.0 });

                let value = eval.values[pos];
                let old_value = sample.values[pos];
                let ret = sample.returns[pos];
                let value_clipped = old_value
                    + (value - old_value).clamp(-method.cliprange_value, method.cliprange_value);
                let unclipped_sq = (value - ret) * (value - ret);
                let clipped_sq = (value_clipped - ret) * (value_clipped - ret);
                value_loss += 0.5 * unclipped_sq.max(clipped_sq) as f64;
                let d_value = if unclipped_sq >= clipped_sq {
                    value - ret
                } else if (value - old_value).abs() < method.cliprange_value {
                    value_clipped - ret
                } else {
                    0.0
                };
                d_values.push(method.vf_coef * d_value / n);

                approx_kl += (sample.log_probs[pos] - eval.log_probs[pos]) as f64;
            }

            grads.push(SampleGrads {
                prompt: &sample.prompt,
                completion: &sample.response,
                d_log_probs,
                d_values,
            });
        }

        policy_loss /= n as f64;
        value_loss /= n as f64;
        approx_kl /= n as f64;

        let total = policy_loss + method.vf_coef as f64 * value_loss;
        if !total.is_finite() {
            return Err(TextRlError::NumericInstability {
                quantity: "loss".into(),
                round: self.round,
                epoch,
                chunk: chunk_idx,
            });
        }

        self.policy
            .apply_gradients(&grads)
            .map_err(|e| e.in_round(self.round))?;

        Ok(ChunkStats {
            policy_loss,
            value_loss,
            approx_kl,
        })
    }

    /// Greedy generation over the held-out prompts, scored raw.
    fn evaluate(&mut self) -> Result<f64> {
        let gen_kwargs = GenerationConfig {
            do_sample: false,
            ..self.config.method.gen_kwargs.clone()
        };
        let mut generator = RolloutGenerator::new(
            &gen_kwargs,
            self.config.train.seq_length,
            self.config.train.seed,
        );
        let prompt_tokens: Vec<Vec<Token>> = self
            .eval_prompts
            .iter()
            .map(|p| self.encode_prompt(p))
            .collect();
        let rollouts = generator
            .generate(&self.policy, self.reference.as_ref(), &prompt_tokens)
            .map_err(|e| e.in_round(self.round))?;

        let texts: Vec<String> = rollouts
            .iter()
            .map(|r| {
                format!(
                    "{}{}",
                    self.tokenizer.decode(&r.prompt),
                    self.tokenizer.decode(&r.response)
                )
            })
            .collect();
        let scores = self.scorer.score_raw(&texts).map_err(|e| e.in_round(self.round))?;
        let reward = mean(&scores) as f64;

        tracing::info!(round = self.round, reward, "Evaluation");
        self.logger.log_eval(self.global_step, reward);
        Ok(reward)
    }

    fn encode_prompt(&self, prompt: &str) -> Vec<Token> {
        let max_len = self.config.train.seq_length - self.config.method.gen_kwargs.max_new_tokens;
        let mut tokens = self.tokenizer.encode(prompt);
        if tokens.len() > max_len {
            if self.config.tokenizer.truncation_side == "left" {
                tokens = tokens.split_off(tokens.len() - max_len);
            } else {
                tokens.truncate(max_len);
            }
        }
        tokens
    }

    fn checkpoint_files(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        let state = RunState::new(
            self.round,
            self.global_step,
            self.kl.kl_coef(),
            self.last_eval_reward,
        );
        Ok(vec![
            (POLICY_FILE, self.policy.save_state()?),
            (TOKENIZER_FILE, self.tokenizer.artifact()),
            (STATE_FILE, state.to_bytes()?),
        ])
    }

    /// Best-effort checkpoint write; failure never stops training.
    fn save_checkpoint(&mut self) {
        let files = match self.checkpoint_files() {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Skipping checkpoint: {e}");
                return;
            }
        };
        match self.checkpoints.save(&files, self.round, self.last_eval_reward) {
            Ok(dir) => {
                if let Some(uploader) = &mut self.uploader {
                    if let Err(e) = uploader.enqueue(&dir) {
                        tracing::warn!("Failed to queue checkpoint upload: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("Checkpoint save failed: {e}"),
        }
    }

    fn save_final(&mut self) {
        let result = self
            .checkpoint_files()
            .and_then(|files| self.checkpoints.save_final(&files));
        match result {
            Ok(dir) => {
                if let Some(uploader) = &mut self.uploader {
                    if let Err(e) = uploader.enqueue(&dir) {
                        tracing::warn!("Failed to queue final upload: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("Final artifact save failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BigramPolicy, ByteTokenizer};
    use serde_json::json;
    use tempfile::tempdir;

    fn small_config(checkpoint_dir: &str) -> TrlConfig {
        TrlConfig::default()
            .update(&json!({
                "train": {
                    "seq_length": 16,
                    "epochs": 2,
                    "total_steps": 100,
                    "batch_size": 4,
                    "checkpoint_interval": 1,
                    "eval_interval": 1,
                    "checkpoint_dir": checkpoint_dir,
                    "seed": 3
                },
                "method": {
                    "num_rollouts": 4,
                    "chunk_size": 2,
                    "ppo_epochs": 1,
                    "gen_kwargs": { "max_new_tokens": 4 }
                }
            }))
            .unwrap()
    }

    fn constant_reward(value: f32) -> Box<dyn RewardFn> {
        Box::new(move |samples: &[String]| Ok(vec![value; samples.len()]))
    }

    fn trainer(config: TrlConfig) -> PpoTrainer<BigramPolicy> {
        PpoTrainer::new(
            config,
            BigramPolicy::byte_level(0.1),
            Box::new(ByteTokenizer),
            constant_reward(1.0),
            PromptSource::new(vec!["ab".into(), "ba".into()], true),
            vec!["ab".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_first_round_returns_equal_terminal_reward() {
        // With the reference snapshotted at start, the first round's KL
        // penalty is exactly zero, so at gamma = lam = 1 every return is
        // the terminal reward.
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path().to_str().unwrap());
        config.train.epochs = 1;
        config.method.gamma = 1.0;
        config.method.lam = 1.0;

        let mut trainer = trainer(config);
        trainer.train().unwrap();

        let store = trainer.store();
        assert_eq!(store.len(), 4);
        for i in 0..store.len() {
            let sample = store.get(i);
            for &ret in &sample.returns {
                assert!((ret - 1.0).abs() < 1e-5);
            }
            // The reward lands only on the last position
            let (last, rest) = sample.rewards.split_last().unwrap();
            assert!((last - 1.0).abs() < 1e-5);
            assert!(rest.iter().all(|r| r.abs() < 1e-5));
        }
    }

    #[test]
    fn test_total_steps_bounds_optimization() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path().to_str().unwrap());
        config.train.epochs = 100;
        config.train.total_steps = 3;

        let mut trainer = trainer(config);
        trainer.train().unwrap();
        assert_eq!(trainer.global_step(), 3);
        // 2 chunk steps per round: the bound lands mid-round 2
        assert_eq!(trainer.round(), 2);
    }

    #[test]
    fn test_epochs_bound_rounds() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path().to_str().unwrap());

        let mut trainer = trainer(config);
        trainer.train().unwrap();
        assert_eq!(trainer.round(), 2);
        assert_eq!(trainer.global_step(), 4);
    }

    #[test]
    fn test_checkpoints_and_final_artifact_written() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path().to_str().unwrap());

        let mut trainer = trainer(config);
        trainer.train().unwrap();

        let latest = trainer.checkpoints.latest().unwrap().unwrap();
        assert_eq!(latest.0, 2);
        assert!(trainer.checkpoints.best().is_some());

        let delta = dir.path().join("delta");
        assert!(delta.join(POLICY_FILE).exists());
        assert!(delta.join(TOKENIZER_FILE).exists());

        let state_bytes = CheckpointManager::read_file(&delta, STATE_FILE).unwrap();
        let state = RunState::from_bytes(&state_bytes).unwrap();
        assert_eq!(state.round, 2);
        assert_eq!(state.global_step, 4);
    }

    #[test]
    fn test_evaluation_sees_raw_rewards() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path().to_str().unwrap());

        let mut trainer = trainer(config);
        trainer.train().unwrap();
        // Constant reward 1.0, unscaled
        assert!((trainer.last_eval_reward() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_round_metrics_reach_logger() {
        use std::sync::{Arc, Mutex};

        struct Recorder {
            rounds: Arc<Mutex<Vec<RoundMetrics>>>,
            evals: Arc<Mutex<Vec<f64>>>,
        }
        impl MetricLogger for Recorder {
            fn log_round(&mut self, metrics: &RoundMetrics) {
                self.rounds.lock().unwrap().push(metrics.clone());
            }
            fn log_eval(&mut self, _step: u64, reward: f64) {
                self.evals.lock().unwrap().push(reward);
            }
        }

        let dir = tempdir().unwrap();
        let config = small_config(dir.path().to_str().unwrap());
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let evals = Arc::new(Mutex::new(Vec::new()));

        let mut trainer = trainer(config).with_logger(Box::new(Recorder {
            rounds: rounds.clone(),
            evals: evals.clone(),
        }));
        trainer.train().unwrap();

        let rounds = rounds.lock().unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].round, 1);
        assert_eq!(rounds[1].round, 2);
        assert_eq!(rounds[1].step, 4);
        for m in rounds.iter() {
            assert!((m.reward_mean - 1.0).abs() < 1e-6);
            assert!(m.total_loss.is_finite());
            assert!(m.kl_coef > 0.0);
        }
        // eval_interval is 1, so one eval per round
        assert_eq!(*evals.lock().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_scoring_failure_aborts_run() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path().to_str().unwrap());

        let failing: Box<dyn RewardFn> = Box::new(|_: &[String]| -> Result<Vec<f32>> {
            Err(TextRlError::Scoring("backend down".into()))
        });
        let mut trainer = PpoTrainer::new(
            config,
            BigramPolicy::byte_level(0.1),
            Box::new(ByteTokenizer),
            failing,
            PromptSource::new(vec!["ab".into()], false),
            vec![],
        )
        .unwrap();

        let err = trainer.train().unwrap_err();
        assert!(matches!(err, TextRlError::Scoring(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("round 1"));
    }

    #[test]
    fn test_empty_prompt_source_rejected() {
        let dir = tempdir().unwrap();
        let config = small_config(dir.path().to_str().unwrap());
        let err = PpoTrainer::new(
            config,
            BigramPolicy::byte_level(0.1),
            Box::new(ByteTokenizer),
            constant_reward(1.0),
            PromptSource::new(vec![], false),
            vec![],
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, TextRlError::Config(_)));
    }

    #[test]
    fn test_long_prompts_are_truncated_not_fatal() {
        let dir = tempdir().unwrap();
        let mut config = small_config(dir.path().to_str().unwrap());
        config.train.epochs = 1;

        let long = "x".repeat(100);
        let mut trainer = PpoTrainer::new(
            config,
            BigramPolicy::byte_level(0.1),
            Box::new(ByteTokenizer),
            constant_reward(1.0),
            PromptSource::new(vec![long], false),
            vec![],
        )
        .unwrap();
        trainer.train().unwrap();
        assert_eq!(trainer.store().len(), 4);
    }
}
