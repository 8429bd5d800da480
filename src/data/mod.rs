//! Training data pipeline
//!
//! `feats.scp` + `utt2spk` → `SpeakerDataset` → `DistributedSampler` (one
//! shard per rank) → `DataLoader` (batched, prefetched on worker threads).

pub mod dataset;
pub mod kaldi;
pub mod loader;
pub mod sampler;
pub mod scp;

pub use dataset::{DatasetOptions, Sample, SpeakerDataset, SPEEDS};
pub use kaldi::{ArkReader, FeatMatrix};
pub use loader::{Batch, DataLoader, EpochIter, LoaderOptions};
pub use sampler::DistributedSampler;
pub use scp::{read_scp, spk2id};
