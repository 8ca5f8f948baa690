//! Cooperative data-parallel training over local threads and channels.
//!
//! Workers train in lock-step: gradients are averaged once per chunk
//! optimization step before any parameter update, and the observed-KL
//! statistic is pooled over the global batch so every worker converges on
//! the same penalty coefficient.

use std::sync::{Arc, Barrier};

use crossbeam_channel::{bounded, Receiver, Sender};

/// Distributed worker configuration.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DistributedConfig {
    /// Total number of cooperating workers
    pub world_size: usize,
    /// This worker's rank (0-indexed)
    pub rank: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
        }
    }
}

/// Trait for cross-worker communication.
pub trait DistributedBackend: Send + Sync {
    /// Average a flat buffer across all workers, in place.
    fn all_reduce_mean(&self, buf: &mut [f32]);

    /// Average a scalar statistic across all workers.
    fn all_reduce_scalar(&self, value: f64) -> f64;

    /// Copy rank 0's buffer to every worker.
    fn broadcast(&self, buf: &mut [f32]);

    /// Synchronization point.
    fn barrier(&self);

    fn world_size(&self) -> usize;

    fn rank(&self) -> usize;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-process backend; every operation is the identity.
pub struct LocalBackend;

impl DistributedBackend for LocalBackend {
    fn all_reduce_mean(&self, _buf: &mut [f32]) {}
    fn all_reduce_scalar(&self, value: f64) -> f64 {
        value
    }
    fn broadcast(&self, _buf: &mut [f32]) {}
    fn barrier(&self) {}
    fn world_size(&self) -> usize {
        1
    }
    fn rank(&self) -> usize {
        0
    }
}

/// Channel mesh shared by all workers in one process.
pub struct SyncGroup {
    barrier: Arc<Barrier>,
    // Workers send to the master, the master sends the reduction back
    up_senders: Vec<Sender<Vec<f64>>>,
    up_receivers: Vec<Receiver<Vec<f64>>>,
    down_senders: Vec<Sender<Vec<f64>>>,
    down_receivers: Vec<Receiver<Vec<f64>>>,
}

impl SyncGroup {
    pub fn new(world_size: usize) -> Arc<Self> {
        let mut up_senders = Vec::with_capacity(world_size);
        let mut up_receivers = Vec::with_capacity(world_size);
        let mut down_senders = Vec::with_capacity(world_size);
        let mut down_receivers = Vec::with_capacity(world_size);

        for _ in 0..world_size {
            let (us, ur) = bounded(1);
            let (ds, dr) = bounded(1);
            up_senders.push(us);
            up_receivers.push(ur);
            down_senders.push(ds);
            down_receivers.push(dr);
        }

        Arc::new(Self {
            barrier: Arc::new(Barrier::new(world_size)),
            up_senders,
            up_receivers,
            down_senders,
            down_receivers,
        })
    }
}

/// Thread-local distributed backend over a shared [`SyncGroup`].
pub struct ThreadDistributedBackend {
    config: DistributedConfig,
    group: Arc<SyncGroup>,
}

impl ThreadDistributedBackend {
    pub fn new(config: DistributedConfig, group: Arc<SyncGroup>) -> Self {
        Self { config, group }
    }

    fn reduce(&self, values: Vec<f64>) -> Vec<f64> {
        let world_size = self.config.world_size;
        let rank = self.config.rank;

        if rank == 0 {
            let mut sum = values;
            for i in 1..world_size {
                let other = self.group.up_receivers[i].recv().expect("worker vanished");
                for (acc, v) in sum.iter_mut().zip(other) {
                    *acc += v;
                }
            }
            for v in sum.iter_mut() {
                *v /= world_size as f64;
            }
            for i in 1..world_size {
                self.group.down_senders[i]
                    .send(sum.clone())
                    .expect("worker vanished");
            }
            sum
        } else {
            self.group.up_senders[rank].send(values).expect("master vanished");
            self.group.down_receivers[rank]
                .recv()
                .expect("master vanished")
        }
    }
}

impl DistributedBackend for ThreadDistributedBackend {
    fn all_reduce_mean(&self, buf: &mut [f32]) {
        if self.config.world_size <= 1 {
            return;
        }
        let reduced = self.reduce(buf.iter().map(|v| *v as f64).collect());
        for (slot, v) in buf.iter_mut().zip(reduced) {
            *slot = v as f32;
        }
    }

    fn all_reduce_scalar(&self, value: f64) -> f64 {
        if self.config.world_size <= 1 {
            return value;
        }
        self.reduce(vec![value])[0]
    }

    fn broadcast(&self, buf: &mut [f32]) {
        if self.config.world_size <= 1 {
            return;
        }
        let world_size = self.config.world_size;
        let rank = self.config.rank;
        if rank == 0 {
            let values: Vec<f64> = buf.iter().map(|v| *v as f64).collect();
            for i in 1..world_size {
                self.group.down_senders[i]
                    .send(values.clone())
                    .expect("worker vanished");
            }
        } else {
            let values = self.group.down_receivers[rank]
                .recv()
                .expect("master vanished");
            for (slot, v) in buf.iter_mut().zip(values) {
                *slot = v as f32;
            }
        }
    }

    fn barrier(&self) {
        self.group.barrier.wait();
    }

    fn world_size(&self) -> usize {
        self.config.world_size
    }

    fn rank(&self) -> usize {
        self.config.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_reduce_averages_gradients() {
        let group = SyncGroup::new(3);
        let handles: Vec<_> = (0..3)
            .map(|rank| {
                let group = group.clone();
                std::thread::spawn(move || {
                    let backend = ThreadDistributedBackend::new(
                        DistributedConfig {
                            world_size: 3,
                            rank,
                        },
                        group,
                    );
                    let mut grads = vec![rank as f32; 4];
                    backend.all_reduce_mean(&mut grads);
                    grads
                })
            })
            .collect();

        for handle in handles {
            let grads = handle.join().unwrap();
            // (0 + 1 + 2) / 3
            assert!(grads.iter().all(|g| (g - 1.0).abs() < 1e-6));
        }
    }

    #[test]
    fn test_pooled_kl_statistic() {
        let group = SyncGroup::new(2);
        let handles: Vec<_> = [2.0f64, 6.0f64]
            .into_iter()
            .enumerate()
            .map(|(rank, local_kl)| {
                let group = group.clone();
                std::thread::spawn(move || {
                    let backend = ThreadDistributedBackend::new(
                        DistributedConfig {
                            world_size: 2,
                            rank,
                        },
                        group,
                    );
                    backend.all_reduce_scalar(local_kl)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 4.0);
        }
    }

    #[test]
    fn test_broadcast_from_master() {
        let group = SyncGroup::new(2);
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let group = group.clone();
                std::thread::spawn(move || {
                    let backend = ThreadDistributedBackend::new(
                        DistributedConfig {
                            world_size: 2,
                            rank,
                        },
                        group,
                    );
                    let mut weights = if rank == 0 {
                        vec![1.0f32, 2.0]
                    } else {
                        vec![0.0f32, 0.0]
                    };
                    backend.broadcast(&mut weights);
                    weights
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 2.0]);
        }
    }

    #[test]
    fn test_local_backend_is_identity() {
        let backend = LocalBackend;
        let mut buf = vec![3.0f32];
        backend.all_reduce_mean(&mut buf);
        assert_eq!(buf, vec![3.0]);
        assert_eq!(backend.all_reduce_scalar(5.0), 5.0);
        assert!(backend.is_master());
    }
}
