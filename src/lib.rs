//! voxtrain: data-parallel speaker-embedding training on candle
//!
//! One process per GPU trains a speaker encoder (TDNN x-vector or ResNet)
//! with a margin-based classification head on Kaldi features. Processes
//! average gradients through a TCP process group (or NCCL), follow an
//! exponential learning-rate schedule and a margin schedule, and rank 0
//! checkpoints the model.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod executor;
pub mod logging;
pub mod model;
pub mod scheduler;
pub mod trainer;
