//! Seeded batch sampling over packaged streamline groups.
//!
//! One epoch visits every streamline of every subject exactly once.
//! Batches are assembled in chunks so subjects contribute contiguous-ish
//! draws, and the whole schedule is deterministic under a fixed seed.
use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// How `batch_size` is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BatchUnits {
    /// Number of streamlines per batch.
    NbStreamlines,
    /// Total euclidean streamline length, in millimeters, per batch.
    LengthMm,
}

/// Sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub batch_size: f32,
    pub units: BatchUnits,
    pub chunk_size: usize,
    pub nb_subjects_per_batch: Option<usize>,
    pub cycles: Option<usize>,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100.0,
            units: BatchUnits::NbStreamlines,
            chunk_size: 25,
            nb_subjects_per_batch: None,
            cycles: None,
            seed: 1234,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size <= 0.0 {
            bail!("batch size must be positive, got {}", self.batch_size);
        }
        if self.chunk_size == 0 {
            bail!("chunk size must be at least 1");
        }
        if self.cycles.is_some() && self.nb_subjects_per_batch.is_none() {
            bail!("cycles requires a subjects-per-batch cap: without one every batch \
                   already draws from all subjects and cycling is meaningless");
        }
        Ok(())
    }
}

/// One subject's sampleable streamlines.
#[derive(Debug, Clone)]
pub struct SubjectStreamlines {
    pub subject: String,
    pub euclidean_lengths: Vec<f32>,
}

/// Streamline ids drawn from one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPart {
    pub subject: String,
    pub indices: Vec<usize>,
}

pub type Batch = Vec<BatchPart>;

/// Epoch-scoped sampler state.
#[derive(Debug)]
pub struct BatchSampler {
    subjects: Vec<SubjectStreamlines>,
    remaining: Vec<Vec<usize>>,
    config: SamplerConfig,
    rng: StdRng,
}

impl BatchSampler {
    pub fn new(subjects: Vec<SubjectStreamlines>, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        if subjects.is_empty() {
            bail!("sampler needs at least one subject");
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let remaining = subjects
            .iter()
            .map(|subject| {
                let mut ids: Vec<usize> = (0..subject.euclidean_lengths.len()).collect();
                ids.shuffle(&mut rng);
                ids
            })
            .collect();
        Ok(Self {
            subjects,
            remaining,
            config,
            rng,
        })
    }

    /// Draw the next batch, or `None` once the epoch is exhausted.
    pub fn next_batch(&mut self) -> Option<Batch> {
        let cycles = self.config.cycles.unwrap_or(1);
        let mut chosen = self.choose_subjects()?;
        let share = self.config.batch_size / (chosen.len() * cycles) as f32;

        let mut batch = Batch::new();
        for _ in 0..cycles {
            for &subject_idx in &chosen {
                let indices = self.draw_share(subject_idx, share);
                if indices.is_empty() {
                    continue;
                }
                batch.push(BatchPart {
                    subject: self.subjects[subject_idx].subject.clone(),
                    indices,
                });
            }
            // Later cycles reuse the same subjects, minus exhausted ones.
            chosen.retain(|&idx| !self.remaining[idx].is_empty());
            if chosen.is_empty() {
                break;
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// All batches of one epoch.
    pub fn epoch(&mut self) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch() {
            batches.push(batch);
        }
        batches
    }

    fn choose_subjects(&mut self) -> Option<Vec<usize>> {
        let mut nonempty: Vec<usize> = (0..self.subjects.len())
            .filter(|&idx| !self.remaining[idx].is_empty())
            .collect();
        if nonempty.is_empty() {
            return None;
        }
        nonempty.shuffle(&mut self.rng);
        if let Some(cap) = self.config.nb_subjects_per_batch {
            nonempty.truncate(cap.max(1));
        }
        // Stable order inside the batch; the shuffle only decides membership.
        nonempty.sort_unstable();
        Some(nonempty)
    }

    /// Draw whole chunks from one subject until its share of the batch
    /// measure is reached. The last chunk may overshoot the share; it is
    /// never split.
    fn draw_share(&mut self, subject_idx: usize, share: f32) -> Vec<usize> {
        let mut drawn = Vec::new();
        let mut measure = 0.0f32;
        while measure < share {
            let remaining = &mut self.remaining[subject_idx];
            if remaining.is_empty() {
                break;
            }
            let take = self.config.chunk_size.min(remaining.len());
            let chunk: Vec<usize> = remaining.split_off(remaining.len() - take);
            measure += match self.config.units {
                BatchUnits::NbStreamlines => chunk.len() as f32,
                BatchUnits::LengthMm => chunk
                    .iter()
                    .map(|&id| self.subjects[subject_idx].euclidean_lengths[id])
                    .sum(),
            };
            drawn.extend(chunk);
        }
        drawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn subjects(sizes: &[(&str, usize)]) -> Vec<SubjectStreamlines> {
        sizes
            .iter()
            .map(|(subject, n)| SubjectStreamlines {
                subject: subject.to_string(),
                euclidean_lengths: (0..*n).map(|i| 10.0 + i as f32).collect(),
            })
            .collect()
    }

    #[test]
    fn cycles_without_subject_cap_is_rejected() {
        let config = SamplerConfig {
            cycles: Some(2),
            nb_subjects_per_batch: None,
            ..SamplerConfig::default()
        };
        let err = BatchSampler::new(subjects(&[("subjA", 10)]), config).unwrap_err();
        assert!(err.to_string().contains("subjects-per-batch"));
    }

    #[test]
    fn epoch_covers_every_streamline_exactly_once() {
        let config = SamplerConfig {
            batch_size: 8.0,
            chunk_size: 3,
            ..SamplerConfig::default()
        };
        let mut sampler =
            BatchSampler::new(subjects(&[("subjA", 20), ("subjB", 13)]), config).unwrap();

        let mut seen: BTreeSet<(String, usize)> = BTreeSet::new();
        let mut total = 0usize;
        for batch in sampler.epoch() {
            for part in batch {
                for id in part.indices {
                    assert!(seen.insert((part.subject.clone(), id)), "duplicate draw");
                    total += 1;
                }
            }
        }
        assert_eq!(total, 33);
    }

    #[test]
    fn same_seed_reproduces_the_schedule() {
        let config = SamplerConfig {
            batch_size: 10.0,
            chunk_size: 4,
            seed: 99,
            ..SamplerConfig::default()
        };
        let mut first =
            BatchSampler::new(subjects(&[("subjA", 17), ("subjB", 9)]), config.clone()).unwrap();
        let mut second =
            BatchSampler::new(subjects(&[("subjA", 17), ("subjB", 9)]), config).unwrap();
        assert_eq!(first.epoch(), second.epoch());
    }

    #[test]
    fn subject_cap_limits_batch_membership() {
        let config = SamplerConfig {
            batch_size: 6.0,
            chunk_size: 2,
            nb_subjects_per_batch: Some(1),
            ..SamplerConfig::default()
        };
        let mut sampler = BatchSampler::new(
            subjects(&[("subjA", 8), ("subjB", 8), ("subjC", 8)]),
            config,
        )
        .unwrap();
        for batch in sampler.epoch() {
            assert_eq!(batch.len(), 1);
        }
    }

    #[test]
    fn length_mm_batches_stop_after_budget() {
        let config = SamplerConfig {
            batch_size: 50.0,
            units: BatchUnits::LengthMm,
            chunk_size: 1,
            ..SamplerConfig::default()
        };
        let mut sampler = BatchSampler::new(subjects(&[("subjA", 30)]), config).unwrap();
        let batches = sampler.epoch();
        assert!(batches.len() > 1);
        // Every streamline is at least 10 mm, so a 50 mm budget with
        // one-streamline chunks caps a batch at six draws.
        for batch in &batches[..batches.len() - 1] {
            let drawn: usize = batch.iter().map(|part| part.indices.len()).sum();
            assert!(drawn <= 6);
        }
    }
}
