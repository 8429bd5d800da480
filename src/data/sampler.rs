use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits dataset indices across ranks.
///
/// Every rank sees the same shuffled order (seeded by `seed + epoch`), padded
/// by wrapping around to a multiple of `world_size`, and keeps every
/// `world_size`-th index starting at its own rank. The shards are therefore
/// equal in length, disjoint up to the padding, and together cover the dataset.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            shuffle,
            seed,
            epoch: 0,
        }
    }

    /// Reshuffle for a new epoch.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch as u64;
    }

    /// Indices per rank
    pub fn num_samples(&self) -> usize {
        (self.len + self.world_size - 1) / self.world_size
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        let mut i = 0;
        while order.len() < total {
            order.push(order[i]);
            i += 1;
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shards_cover_and_pad() {
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|r| DistributedSampler::new(10, r, 3, true, 7).indices())
            .collect();

        for shard in &shards {
            assert_eq!(shard.len(), 4);
        }
        let all: HashSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(all.len(), 10);
        assert_eq!(shards.iter().map(Vec::len).sum::<usize>(), 12);
    }

    #[test]
    fn test_shards_are_disjoint_when_divisible() {
        let a = DistributedSampler::new(8, 0, 2, true, 1).indices();
        let b = DistributedSampler::new(8, 1, 2, true, 1).indices();
        let a: HashSet<_> = a.into_iter().collect();
        assert!(b.iter().all(|i| !a.contains(i)));
    }

    #[test]
    fn test_epoch_reshuffles_deterministically() {
        let mut s = DistributedSampler::new(100, 0, 1, true, 42);
        let first = s.indices();
        assert_eq!(first, DistributedSampler::new(100, 0, 1, true, 42).indices());
        s.set_epoch(1);
        assert_ne!(first, s.indices());
    }

    #[test]
    fn test_no_shuffle_keeps_order() {
        let s = DistributedSampler::new(5, 1, 2, false, 0);
        assert_eq!(s.indices(), vec![1, 3, 0]);
    }

    #[test]
    fn test_empty_dataset() {
        assert!(DistributedSampler::new(0, 0, 2, true, 0).indices().is_empty());
    }
}
