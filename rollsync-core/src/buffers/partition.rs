use crate::error::{Result, SamplerError};
use std::ops::Range;
use tracing::warn;

/// Assignment of environment columns to workers. Ranges are contiguous, disjoint, ordered by rank
/// and cover `0..n_envs` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPartition {
    ranges: Vec<Range<usize>>,
    n_envs: usize,
}

impl EnvPartition {
    /// Splits `n_envs` columns over `n_workers`. The remainder goes one column each to the first
    /// ranks.
    pub fn contiguous(n_envs: usize, n_workers: usize) -> Result<Self> {
        if n_workers == 0 {
            return Err(SamplerError::Partition("no workers to partition over".into()));
        }
        if n_envs < n_workers {
            return Err(SamplerError::Partition(format!(
                "{n_envs} environments cannot be split over {n_workers} workers"
            )));
        }
        let base = n_envs / n_workers;
        let remainder = n_envs % n_workers;
        if remainder != 0 {
            warn!(
                n_envs,
                n_workers, "environments do not split evenly, worker loads will differ by one"
            );
        }
        let mut start = 0;
        let ranges = (0..n_workers)
            .map(|rank| {
                let len = base + usize::from(rank < remainder);
                let range = start..start + len;
                start += len;
                range
            })
            .collect();
        Self::from_ranges(ranges, n_envs)
    }

    pub fn from_ranges(ranges: Vec<Range<usize>>, n_envs: usize) -> Result<Self> {
        let mut expected = 0;
        for range in &ranges {
            if range.start != expected || range.end <= range.start {
                return Err(SamplerError::Partition(format!(
                    "range {range:?} does not continue at column {expected}"
                )));
            }
            expected = range.end;
        }
        if expected != n_envs {
            return Err(SamplerError::Partition(format!(
                "ranges cover {expected} of {n_envs} columns"
            )));
        }
        Ok(Self { ranges, n_envs })
    }

    pub fn range(&self, rank: usize) -> Range<usize> {
        self.ranges[rank].clone()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub fn n_workers(&self) -> usize {
        self.ranges.len()
    }

    pub fn n_envs(&self) -> usize {
        self.n_envs
    }
}

#[cfg(test)]
mod test {
    use super::EnvPartition;

    #[test]
    fn even_split() {
        let partition = EnvPartition::contiguous(8, 4).unwrap();
        assert_eq!(partition.ranges(), &[0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn remainder_goes_to_first_ranks() {
        let partition = EnvPartition::contiguous(7, 3).unwrap();
        assert_eq!(partition.ranges(), &[0..3, 3..5, 5..7]);
        assert_eq!(partition.n_envs(), 7);
    }

    #[test]
    fn invalid_partitions() {
        assert!(EnvPartition::contiguous(2, 3).is_err());
        assert!(EnvPartition::contiguous(2, 0).is_err());
        assert!(EnvPartition::from_ranges(vec![0..2, 3..4], 4).is_err());
        assert!(EnvPartition::from_ranges(vec![0..2, 1..4], 4).is_err());
        assert!(EnvPartition::from_ranges(vec![0..2, 2..3], 4).is_err());
        assert!(EnvPartition::from_ranges(vec![0..2, 2..4], 4).is_ok());
    }
}
