use crate::common::*;

/// Splits sample indices across ranks.
///
/// Every rank draws from the same epoch-seeded permutation, padded by
/// repeating leading indices up to a multiple of the world size, so all
/// ranks receive the same number of indices.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    world_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
}

impl DistributedSampler {
    pub fn new(len: usize, world_size: usize, rank: usize, shuffle: bool, seed: u64) -> Result<Self> {
        ensure!(world_size > 0, "world_size must be positive");
        ensure!(
            rank < world_size,
            "rank {} is out of range for world size {}",
            rank,
            world_size
        );
        Ok(Self {
            len,
            world_size,
            rank,
            shuffle,
            seed,
        })
    }

    /// The number of indices per rank.
    pub fn num_samples(&self) -> usize {
        (self.len + self.world_size - 1) / self.world_size
    }

    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        if self.len == 0 {
            return vec![];
        }

        let mut indices: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        let padding: Vec<usize> = indices.iter().cycle().take(total - self.len).cloned().collect();
        indices.extend(padding);

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
