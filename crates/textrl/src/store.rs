//! Experience store for completed rollouts.
//!
//! The store holds exactly one generation round's worth of train-ready
//! samples. It is wholly replaced each round, never patched in place, and
//! nothing reads it while it is being refilled.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::policy::Token;
use crate::{Result, TextRlError};

/// A rollout enriched with everything the optimizer needs, immutable once
/// stored.
#[derive(Clone, Debug)]
pub struct TrainSample {
    pub prompt: Vec<Token>,
    pub response: Vec<Token>,
    /// Log-probabilities under the policy that generated the rollout
    pub log_probs: Vec<f32>,
    /// Value estimates recorded at generation time
    pub values: Vec<f32>,
    /// KL-penalized per-token rewards
    pub rewards: Vec<f32>,
    pub advantages: Vec<f32>,
    pub returns: Vec<f32>,
    /// Mean per-token KL against the reference policy
    pub mean_kl: f32,
}

/// Fixed-capacity pool of train-ready samples with chunked iteration.
pub struct ExperienceStore {
    samples: Vec<TrainSample>,
    capacity: usize,
}

impl ExperienceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> &TrainSample {
        &self.samples[index]
    }

    /// Replace the entire contents with a fresh round of samples.
    ///
    /// Every sample must arrive with advantages and returns populated; a
    /// partial refill is rejected rather than trained on.
    pub fn replace(&mut self, samples: Vec<TrainSample>) -> Result<()> {
        if samples.len() != self.capacity {
            return Err(TextRlError::Generation(format!(
                "store refill produced {} rollouts, expected {}",
                samples.len(),
                self.capacity
            )));
        }
        for (i, sample) in samples.iter().enumerate() {
            let n = sample.response.len();
            if sample.advantages.len() != n || sample.returns.len() != n {
                return Err(TextRlError::Generation(format!(
                    "rollout {i} stored without advantage/return estimates"
                )));
            }
        }
        self.samples = samples;
        Ok(())
    }

    /// Index chunks for one inner epoch pass.
    ///
    /// Every stored sample appears in exactly one chunk. Order is shuffled
    /// when an RNG is supplied; the final chunk may be short when the chunk
    /// size does not divide the store.
    pub fn epoch_chunks(&self, chunk_size: usize, rng: Option<&mut ChaCha8Rng>) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(rng) = rng {
            indices.shuffle(rng);
        }
        indices
            .chunks(chunk_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::seeded_rng;

    fn sample(tag: u32) -> TrainSample {
        TrainSample {
            prompt: vec![0],
            response: vec![tag],
            log_probs: vec![-1.0],
            values: vec![0.0],
            rewards: vec![1.0],
            advantages: vec![1.0],
            returns: vec![1.0],
            mean_kl: 0.0,
        }
    }

    #[test]
    fn test_replace_requires_full_round() {
        let mut store = ExperienceStore::new(4);
        let err = store.replace(vec![sample(0)]).unwrap_err();
        assert!(matches!(err, TextRlError::Generation(_)));

        store
            .replace((0..4).map(sample).collect())
            .unwrap();
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_replace_rejects_unestimated_samples() {
        let mut store = ExperienceStore::new(1);
        let mut bad = sample(0);
        bad.advantages.clear();
        assert!(store.replace(vec![bad]).is_err());
    }

    #[test]
    fn test_replace_swaps_whole_contents() {
        let mut store = ExperienceStore::new(2);
        store.replace(vec![sample(1), sample(2)]).unwrap();
        store.replace(vec![sample(3), sample(4)]).unwrap();
        let seen: Vec<u32> = (0..2).map(|i| store.get(i).response[0]).collect();
        assert_eq!(seen, vec![3, 4]);
    }

    #[test]
    fn test_epoch_chunks_cover_exactly_once() {
        let mut store = ExperienceStore::new(12);
        store.replace((0..12).map(sample).collect()).unwrap();

        for chunk_size in [1, 2, 3, 4, 6, 12] {
            let mut rng = seeded_rng(9);
            let chunks = store.epoch_chunks(chunk_size, Some(&mut rng));
            assert_eq!(chunks.len(), 12 / chunk_size);
            let mut seen: Vec<usize> = chunks.into_iter().flatten().collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..12).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_epoch_chunks_unshuffled_order() {
        let mut store = ExperienceStore::new(4);
        store.replace((0..4).map(sample).collect()).unwrap();
        let chunks = store.epoch_chunks(2, None);
        assert_eq!(chunks, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_epoch_chunks_shuffles_between_epochs() {
        let mut store = ExperienceStore::new(32);
        store.replace((0..32).map(sample).collect()).unwrap();
        let mut rng = seeded_rng(3);
        let first: Vec<usize> = store.epoch_chunks(8, Some(&mut rng)).into_iter().flatten().collect();
        let second: Vec<usize> = store.epoch_chunks(8, Some(&mut rng)).into_iter().flatten().collect();
        assert_ne!(first, second);
    }
}
