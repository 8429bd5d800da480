//! Speaker classification dataset
//!
//! Each item is one utterance turned into a fixed-size training chunk:
//!
//! 1. read the feature matrix from its Kaldi archive
//! 2. subtract the per-utterance mean (cmvn)
//! 3. speed perturbation by frame resampling; each speed is its own speaker set
//! 4. cut a random `num_frms` window (repeat-padding short utterances)
//! 5. with probability `aug_prob`, zero one time band and one frequency band

use candle_core::Result;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::kaldi::{ArkReader, FeatMatrix};

/// Speed factors; index `i` shifts labels by `i * num_spk`.
pub const SPEEDS: [f64; 3] = [1.0, 0.9, 1.1];

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub feat_dim: usize,
    pub num_frms: usize,
    pub cmvn: bool,
    pub speed_perturb: bool,
    pub aug_prob: f64,
    pub max_time_mask: usize,
    pub max_freq_mask: usize,
}

#[derive(Debug, Clone)]
struct Utterance {
    key: String,
    location: String,
    label: u32,
}

/// One processed chunk, `num_frms * feat_dim` values in row-major order.
#[derive(Debug, Clone)]
pub struct Sample {
    pub feats: Vec<f32>,
    pub label: u32,
}

pub struct SpeakerDataset {
    utts: Vec<Utterance>,
    num_spk: usize,
    reader: Arc<ArkReader>,
    options: DatasetOptions,
}

impl SpeakerDataset {
    /// Pair every scp entry with its speaker id.
    ///
    /// # Arguments
    /// * `feats` - `(utt, location)` entries from `feats.scp`
    /// * `utt2spk` - `(utt, speaker)` entries from the label file
    /// * `spk2id` - dense speaker ids
    pub fn new(
        feats: Vec<(String, String)>,
        utt2spk: &[(String, String)],
        spk2id: &BTreeMap<String, u32>,
        reader: Arc<ArkReader>,
        options: DatasetOptions,
    ) -> Result<Self> {
        let labels: HashMap<&str, &str> = utt2spk
            .iter()
            .map(|(utt, spk)| (utt.as_str(), spk.as_str()))
            .collect();

        let mut utts = Vec::with_capacity(feats.len());
        for (key, location) in feats {
            let spk = labels.get(key.as_str()).ok_or_else(|| {
                candle_core::Error::Msg(format!("utterance {} has no speaker label", key))
            })?;
            let label = *spk2id.get(*spk).ok_or_else(|| {
                candle_core::Error::Msg(format!("speaker {} of {} has no id", spk, key))
            })?;
            utts.push(Utterance { key, location, label });
        }

        Ok(Self {
            utts,
            num_spk: spk2id.len(),
            reader,
            options,
        })
    }

    pub fn len(&self) -> usize {
        self.utts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utts.is_empty()
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    /// Load and process utterance `index`.
    pub fn get<R: Rng>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        let utt = &self.utts[index];
        let feats = self
            .reader
            .read(&utt.location)
            .map_err(candle_core::Error::wrap)?;
        if feats.cols != self.options.feat_dim {
            return Err(candle_core::Error::Msg(format!(
                "utterance {} has {} feature bins, expected {}",
                utt.key, feats.cols, self.options.feat_dim
            )));
        }
        if feats.rows == 0 {
            return Err(candle_core::Error::Msg(format!("utterance {} has no frames", utt.key)));
        }
        Ok(self.process(feats, utt.label, rng))
    }

    fn process<R: Rng>(&self, mut feats: FeatMatrix, mut label: u32, rng: &mut R) -> Sample {
        let opts = &self.options;

        if opts.cmvn {
            mean_normalize(&mut feats);
        }
        if opts.speed_perturb {
            let idx = rng.gen_range(0..SPEEDS.len());
            if idx > 0 {
                feats = resample_frames(&feats, SPEEDS[idx]);
            }
            label += (idx * self.num_spk) as u32;
        }

        let mut chunk = random_chunk(&feats, opts.num_frms, rng);

        if opts.aug_prob > 0.0 && rng.gen_bool(opts.aug_prob) {
            time_mask(&mut chunk, opts.max_time_mask, rng);
            freq_mask(&mut chunk, opts.max_freq_mask, rng);
        }

        Sample {
            feats: chunk.data,
            label,
        }
    }
}

/// Subtract the mean of every feature bin.
pub fn mean_normalize(feats: &mut FeatMatrix) {
    let mut mean = vec![0f64; feats.cols];
    for frame in feats.data.chunks(feats.cols) {
        for (m, &v) in mean.iter_mut().zip(frame) {
            *m += v as f64;
        }
    }
    let n = feats.rows.max(1) as f64;
    let cols = feats.cols;
    for frame in feats.data.chunks_mut(cols) {
        for (v, m) in frame.iter_mut().zip(&mean) {
            *v -= (m / n) as f32;
        }
    }
}

/// Change the apparent speaking rate: factor > 1 drops frames, < 1 repeats them.
pub fn resample_frames(feats: &FeatMatrix, factor: f64) -> FeatMatrix {
    let rows = ((feats.rows as f64 / factor).round() as usize).max(1);
    let mut data = Vec::with_capacity(rows * feats.cols);
    for j in 0..rows {
        let src = ((j as f64 * factor) as usize).min(feats.rows - 1);
        data.extend_from_slice(feats.row(src));
    }
    FeatMatrix::new(rows, feats.cols, data)
}

/// Random `num_frms` window; shorter inputs are tiled until long enough.
pub fn random_chunk<R: Rng>(feats: &FeatMatrix, num_frms: usize, rng: &mut R) -> FeatMatrix {
    let cols = feats.cols;
    if feats.rows >= num_frms {
        let start = rng.gen_range(0..=feats.rows - num_frms);
        let data = feats.data[start * cols..(start + num_frms) * cols].to_vec();
        return FeatMatrix::new(num_frms, cols, data);
    }

    let mut data = Vec::with_capacity(num_frms * cols);
    while data.len() < num_frms * cols {
        let need = num_frms * cols - data.len();
        let take = need.min(feats.data.len());
        data.extend_from_slice(&feats.data[..take]);
    }
    FeatMatrix::new(num_frms, cols, data)
}

pub fn time_mask<R: Rng>(feats: &mut FeatMatrix, max_width: usize, rng: &mut R) {
    let width = rng.gen_range(0..=max_width.min(feats.rows));
    if width == 0 {
        return;
    }
    let start = rng.gen_range(0..=feats.rows - width);
    let cols = feats.cols;
    feats.data[start * cols..(start + width) * cols].fill(0.0);
}

pub fn freq_mask<R: Rng>(feats: &mut FeatMatrix, max_width: usize, rng: &mut R) {
    let width = rng.gen_range(0..=max_width.min(feats.cols));
    if width == 0 {
        return;
    }
    let start = rng.gen_range(0..=feats.cols - width);
    let cols = feats.cols;
    for frame in feats.data.chunks_mut(cols) {
        frame[start..start + width].fill(0.0);
    }
}
