//! Batched, prefetching data loader
//!
//! Batches are assembled on background worker threads and handed to the
//! training loop through bounded channels, so feature reading overlaps with
//! the forward/backward pass. Tensors are created on the training thread.
//!
//! ```text
//! GPU: [step on batch N]   → [step on batch N+1] → ...
//! CPU: [load batch N+1..N+k on workers]
//! ```
//!
//! Worker `w` builds batches `w, w + n, w + 2n, ...` into its own channel and
//! the consumer reads the channels round-robin, so batch order does not depend
//! on the number of workers.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::dataset::SpeakerDataset;
use super::sampler::DistributedSampler;

/// Training batch: features `(B, num_frms, feat_dim)` f32 and labels `(B,)` u32.
pub struct Batch {
    pub feats: Tensor,
    pub labels: Tensor,
}

/// A batch still on the host, as produced by the workers
struct HostBatch {
    feats: Vec<f32>,
    labels: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub drop_last: bool,
    pub num_workers: usize,
    pub prefetch: usize,
    /// Base seed for per-batch randomness (chunking, perturbation, masks)
    pub seed: u64,
}

pub struct DataLoader {
    dataset: Arc<SpeakerDataset>,
    sampler: DistributedSampler,
    options: LoaderOptions,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<SpeakerDataset>,
        sampler: DistributedSampler,
        options: LoaderOptions,
        device: Device,
    ) -> Self {
        Self {
            dataset,
            sampler,
            options,
            device,
        }
    }

    /// Batches this rank processes per epoch
    pub fn len(&self) -> usize {
        let n = self.sampler.num_samples();
        let bs = self.options.batch_size;
        if self.options.drop_last {
            n / bs
        } else {
            (n + bs - 1) / bs
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start iterating over epoch `epoch`.
    pub fn epoch(&mut self, epoch: usize) -> EpochIter {
        self.sampler.set_epoch(epoch);
        let indices = self.sampler.indices();
        let batches: Vec<Vec<usize>> = indices
            .chunks(self.options.batch_size)
            .take(self.len())
            .map(<[usize]>::to_vec)
            .collect();

        let epoch_seed = self.options.seed.wrapping_add((epoch as u64) << 32);
        EpochIter::new(
            Arc::clone(&self.dataset),
            batches,
            epoch_seed,
            &self.options,
            self.device.clone(),
        )
    }
}

fn load_batch(dataset: &SpeakerDataset, indices: &[usize], seed: u64) -> Result<HostBatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let per_item = dataset.options().num_frms * dataset.options().feat_dim;
    let mut feats = Vec::with_capacity(indices.len() * per_item);
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
        let sample = dataset.get(i, &mut rng)?;
        feats.extend_from_slice(&sample.feats);
        labels.push(sample.label);
    }
    Ok(HostBatch { feats, labels })
}

/// Iterator over one epoch of batches.
pub struct EpochIter {
    dataset: Arc<SpeakerDataset>,
    batches: Vec<Vec<usize>>,
    seed: u64,
    next: usize,
    device: Device,
    receivers: Vec<Receiver<Result<HostBatch>>>,
    workers: Vec<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
}

impl EpochIter {
    fn new(
        dataset: Arc<SpeakerDataset>,
        batches: Vec<Vec<usize>>,
        seed: u64,
        options: &LoaderOptions,
        device: Device,
    ) -> Self {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let mut receivers = Vec::with_capacity(options.num_workers);
        let mut workers = Vec::with_capacity(options.num_workers);

        let num_workers = options.num_workers.min(batches.len());
        // Each worker's share of the prefetch budget, at least one batch
        let depth = (options.prefetch / num_workers.max(1)).max(1);

        for w in 0..num_workers {
            let (sender, receiver) = mpsc::sync_channel(depth);
            let jobs: Vec<(usize, Vec<usize>)> = batches
                .iter()
                .enumerate()
                .skip(w)
                .step_by(num_workers)
                .map(|(b, idx)| (b, idx.clone()))
                .collect();
            let dataset = Arc::clone(&dataset);
            let stop = Arc::clone(&stop_signal);
            workers.push(thread::spawn(move || {
                Self::worker(dataset, jobs, seed, sender, stop);
            }));
            receivers.push(receiver);
        }

        Self {
            dataset,
            batches,
            seed,
            next: 0,
            device,
            receivers,
            workers,
            stop_signal,
        }
    }

    fn worker(
        dataset: Arc<SpeakerDataset>,
        jobs: Vec<(usize, Vec<usize>)>,
        seed: u64,
        sender: SyncSender<Result<HostBatch>>,
        stop_signal: Arc<AtomicBool>,
    ) {
        for (b, indices) in jobs {
            if stop_signal.load(Ordering::Relaxed) {
                break;
            }
            let batch = load_batch(&dataset, &indices, seed.wrapping_add(b as u64));
            // Blocks when the channel is full; errors once the consumer is gone
            if sender.send(batch).is_err() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn to_device(&self, host: HostBatch) -> Result<Batch> {
        let opts = self.dataset.options();
        let b = host.labels.len();
        let feats = Tensor::from_vec(host.feats, (b, opts.num_frms, opts.feat_dim), &self.device)?;
        let labels = Tensor::from_vec(host.labels, b, &self.device)?;
        Ok(Batch { feats, labels })
    }

    fn shutdown(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        // Dropping the receivers unblocks workers waiting on a full channel
        self.receivers.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Iterator for EpochIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.batches.len() {
            return None;
        }
        let b = self.next;
        self.next += 1;

        let host = if self.receivers.is_empty() {
            load_batch(&self.dataset, &self.batches[b], self.seed.wrapping_add(b as u64))
        } else {
            let receiver = &self.receivers[b % self.receivers.len()];
            match receiver.recv() {
                Ok(batch) => batch,
                Err(_) => Err(candle_core::Error::Msg("data loader worker stopped".to_string())),
            }
        };
        Some(host.and_then(|h| self.to_device(h)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.batches.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for EpochIter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::DatasetOptions;
    use crate::data::kaldi::ArkReader;
    use crate::data::scp::spk2id;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    /// Archive with `n` utterances of `rows x 2` frames; utterance `i` holds the value `i`.
    fn fixture(dir: &std::path::Path, n: usize, rows: i32) -> (Vec<(String, String)>, Vec<(String, String)>) {
        let path = dir.join("feats.ark");
        let mut ark = Vec::new();
        let mut feats = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let key = format!("utt{:02}", i);
            ark.write_all(key.as_bytes()).unwrap();
            ark.push(b' ');
            feats.push((key.clone(), format!("{}:{}", path.display(), ark.len())));
            labels.push((key, format!("spk{}", i % 3)));
            ark.write_all(b"\0BFM ").unwrap();
            ark.write_u8(4).unwrap();
            ark.write_i32::<LittleEndian>(rows).unwrap();
            ark.write_u8(4).unwrap();
            ark.write_i32::<LittleEndian>(2).unwrap();
            for _ in 0..rows * 2 {
                ark.write_f32::<LittleEndian>(i as f32).unwrap();
            }
        }
        std::fs::write(&path, &ark).unwrap();
        (feats, labels)
    }

    fn loader(dir: &std::path::Path, num_workers: usize, drop_last: bool) -> DataLoader {
        let (feats, labels) = fixture(dir, 10, 6);
        let ids = spk2id(&labels);
        let options = DatasetOptions {
            feat_dim: 2,
            num_frms: 4,
            cmvn: false,
            speed_perturb: false,
            aug_prob: 0.0,
            max_time_mask: 0,
            max_freq_mask: 0,
        };
        let dataset =
            SpeakerDataset::new(feats, &labels, &ids, Arc::new(ArkReader::new()), options).unwrap();
        let sampler = DistributedSampler::new(dataset.len(), 0, 1, true, 5);
        DataLoader::new(
            Arc::new(dataset),
            sampler,
            LoaderOptions {
                batch_size: 4,
                drop_last,
                num_workers,
                prefetch: 2,
                seed: 5,
            },
            Device::Cpu,
        )
    }

    #[test]
    fn test_batches_have_expected_shapes_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = loader(dir.path(), 0, true);
        assert_eq!(dl.len(), 2);

        let batches: Vec<Batch> = dl.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.feats.dims(), &[4, 4, 2]);
            let feats: Vec<Vec<Vec<f32>>> = batch.feats.to_vec3().unwrap();
            let labels: Vec<u32> = batch.labels.to_vec1().unwrap();
            for (item, label) in feats.iter().zip(labels) {
                // every frame carries the utterance index; its speaker is index % 3
                assert_eq!(item[0][0] as u32 % 3, label);
            }
        }
    }

    #[test]
    fn test_keep_last_partial_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = loader(dir.path(), 0, false);
        assert_eq!(dl.len(), 3);
        let last = dl.epoch(0).last().unwrap().unwrap();
        assert_eq!(last.labels.dims(), &[2]);
    }

    #[test]
    fn test_workers_match_inline_loading() {
        let dir = tempfile::tempdir().unwrap();
        let inline: Vec<Vec<u32>> = loader(dir.path(), 0, true)
            .epoch(3)
            .map(|b| b.unwrap().labels.to_vec1().unwrap())
            .collect();
        let threaded: Vec<Vec<u32>> = loader(dir.path(), 3, true)
            .epoch(3)
            .map(|b| b.unwrap().labels.to_vec1().unwrap())
            .collect();
        assert_eq!(inline, threaded);
    }

    #[test]
    fn test_dropping_iterator_mid_epoch_stops_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut dl = loader(dir.path(), 2, false);
        let mut it = dl.epoch(0);
        assert!(it.next().is_some());
        drop(it);
    }
}
