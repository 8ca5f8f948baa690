//! Checkpoint manager for rotation and best-model tracking.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Result, TextRlError};

/// Policy weights file inside a checkpoint directory.
pub const POLICY_FILE: &str = "policy.json";
/// Tokenizer artifact file inside a checkpoint directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Run bookkeeping file inside a checkpoint directory.
pub const STATE_FILE: &str = "state.json";

const BEST_DIR: &str = "best_checkpoint";
const FINAL_DIR: &str = "delta";

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory to store checkpoints
    pub checkpoint_dir: PathBuf,
    /// Keep only the last N numbered checkpoints (0 = keep all)
    pub keep_last: usize,
    /// Also maintain a best checkpoint by evaluation reward
    pub save_best: bool,
}

impl CheckpointConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_last: 5,
            save_best: true,
        }
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }

    pub fn save_best(mut self, enabled: bool) -> Self {
        self.save_best = enabled;
        self
    }
}

/// Manages checkpoint directories: save, rotation, best tracking, and the
/// final `delta` artifact.
///
/// Each checkpoint is a directory holding the adapted policy weights, the
/// tokenizer artifact, and run bookkeeping, sufficient to reload the policy
/// for further training or inference.
pub struct CheckpointManager {
    config: CheckpointConfig,
    best_reward: f64,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        if let Err(e) = fs::create_dir_all(&config.checkpoint_dir) {
            tracing::warn!("Failed to create checkpoint directory: {}", e);
        }
        Self {
            config,
            best_reward: f64::NEG_INFINITY,
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Write a numbered checkpoint from named file contents.
    ///
    /// Returns the checkpoint directory. Updates the best checkpoint when
    /// `eval_reward` beats the running best, then rotates old checkpoints.
    pub fn save(
        &mut self,
        files: &[(&str, Vec<u8>)],
        round: u64,
        eval_reward: f64,
    ) -> Result<PathBuf> {
        let dir = self
            .config
            .checkpoint_dir
            .join(format!("checkpoint_{round:06}"));
        write_dir(&dir, files)?;
        tracing::info!(path = %dir.display(), round, "Saved checkpoint");

        if self.config.save_best && eval_reward > self.best_reward {
            self.best_reward = eval_reward;
            let best = self.config.checkpoint_dir.join(BEST_DIR);
            write_dir(&best, files)?;
            tracing::info!(eval_reward, "New best checkpoint");
        }

        if self.config.keep_last > 0 {
            self.rotate()?;
        }

        Ok(dir)
    }

    /// Write the final artifact into the distinguished `delta` subdirectory.
    pub fn save_final(&self, files: &[(&str, Vec<u8>)]) -> Result<PathBuf> {
        let dir = self.config.checkpoint_dir.join(FINAL_DIR);
        write_dir(&dir, files)?;
        tracing::info!(path = %dir.display(), "Saved final artifact");
        Ok(dir)
    }

    /// Most recent numbered checkpoint, if any.
    pub fn latest(&self) -> Result<Option<(u64, PathBuf)>> {
        Ok(self.list()?.pop())
    }

    /// Path of the best checkpoint, if it exists.
    pub fn best(&self) -> Option<PathBuf> {
        let best = self.config.checkpoint_dir.join(BEST_DIR);
        best.exists().then_some(best)
    }

    /// Read one named file out of a checkpoint directory.
    pub fn read_file(dir: &Path, name: &str) -> Result<Vec<u8>> {
        fs::read(dir.join(name)).map_err(|e| {
            TextRlError::Persistence(format!("failed to read {name} from {}: {e}", dir.display()))
        })
    }

    /// All numbered checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.config.checkpoint_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };

        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| {
                let round = p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix("checkpoint_"))
                    .and_then(|n| n.parse().ok())?;
                Some((round, p))
            })
            .collect();

        checkpoints.sort();
        Ok(checkpoints)
    }

    fn rotate(&self) -> Result<()> {
        let mut checkpoints = self.list()?;
        while checkpoints.len() > self.config.keep_last {
            let (_, old) = checkpoints.remove(0);
            if let Err(e) = fs::remove_dir_all(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }
        Ok(())
    }
}

fn write_dir(dir: &Path, files: &[(&str, Vec<u8>)]) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| TextRlError::Persistence(format!("failed to create {}: {e}", dir.display())))?;
    for (name, data) in files {
        fs::write(dir.join(name), data).map_err(|e| {
            TextRlError::Persistence(format!("failed to write {name} in {}: {e}", dir.display()))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn files(tag: u8) -> Vec<(&'static str, Vec<u8>)> {
        vec![(POLICY_FILE, vec![tag]), (TOKENIZER_FILE, vec![0])]
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::new(CheckpointConfig::new(dir.path()));

        let saved = manager.save(&files(7), 3, 0.5).unwrap();
        assert_eq!(CheckpointManager::read_file(&saved, POLICY_FILE).unwrap(), vec![7]);

        let (round, latest) = manager.latest().unwrap().unwrap();
        assert_eq!(round, 3);
        assert_eq!(latest, saved);
    }

    #[test]
    fn test_best_tracking() {
        let dir = tempdir().unwrap();
        let mut manager = CheckpointManager::new(CheckpointConfig::new(dir.path()));

        manager.save(&files(1), 1, 0.5).unwrap();
        manager.save(&files(2), 2, 0.9).unwrap();
        manager.save(&files(3), 3, 0.7).unwrap();

        let best = manager.best().unwrap();
        // Round 2 had the best reward and stays the best
        assert_eq!(CheckpointManager::read_file(&best, POLICY_FILE).unwrap(), vec![2]);
    }

    #[test]
    fn test_rotation_keeps_last_n() {
        let dir = tempdir().unwrap();
        let config = CheckpointConfig::new(dir.path()).keep_last(2).save_best(false);
        let mut manager = CheckpointManager::new(config);

        for round in 1..=5 {
            manager.save(&files(round as u8), round, 0.0).unwrap();
        }

        let rounds: Vec<u64> = manager.list().unwrap().into_iter().map(|(r, _)| r).collect();
        assert_eq!(rounds, vec![4, 5]);
    }

    #[test]
    fn test_final_artifact_location() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointConfig::new(dir.path()));
        let delta = manager.save_final(&files(9)).unwrap();
        assert_eq!(delta, dir.path().join("delta"));
        assert!(delta.join(POLICY_FILE).exists());
    }
}
