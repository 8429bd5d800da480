use std::path::PathBuf;

/// Errors raised while loading or validating the training configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid override '{0}': expected --key=value or --key value")]
    BadOverride(String),

    #[error("cannot override '{path}': '{segment}' is not a mapping")]
    OverrideTarget { path: String, segment: String },

    #[error("config validation error: {0}")]
    Validation(String),
}

/// Errors raised by the process group and the environment it is built from.
#[derive(Debug, thiserror::Error)]
pub enum DistError {
    #[error("environment variable {name} is not a valid integer: {value}")]
    BadEnv { name: &'static str, value: String },

    #[error("rank {rank} is out of range for world size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },

    #[error("rendezvous with {addr} timed out after {secs}s")]
    RendezvousTimeout { addr: String, secs: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("collective buffer length mismatch: expected {expected}, got {actual} from rank {rank}")]
    LengthMismatch {
        expected: usize,
        actual: usize,
        rank: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while decoding Kaldi feature archives.
#[derive(Debug, thiserror::Error)]
pub enum KaldiError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bad feature location '{0}': expected <path>[:<offset>]")]
    BadLocation(String),

    #[error("offset {offset} is past the end of {path}")]
    OffsetOutOfRange { path: PathBuf, offset: usize },

    #[error("unsupported matrix type '{0}' (only FM and DM are supported)")]
    UnsupportedType(String),

    #[error("malformed matrix in {path} at byte {offset}: {reason}")]
    Malformed {
        path: PathBuf,
        offset: usize,
        reason: String,
    },
}

/// Errors that stop a run before training starts.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("{} already exists !!!", .0.display())]
    ModelDirExists(PathBuf),

    #[error("rank {rank} has no GPU: gpus lists {available} device(s)")]
    NoGpuForRank { rank: usize, available: usize },

    #[error("no training batches: {utts} utterances are fewer than one batch per rank")]
    EmptyEpoch { utts: usize },
}
