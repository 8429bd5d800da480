//! Kaldi binary matrix reader
//!
//! Feature locations look like `/path/feats.ark:1234`: an archive path and the
//! byte offset of the matrix header inside it (a bare path means offset 0).
//! Archives are memory-mapped on first use and shared between all readers.
//!
//! Supported matrix types are `FM` (f32) and `DM` (f64, converted to f32).
//! Compressed matrices (`CM`, `CM2`, `CM3`) are rejected.

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::KaldiError;

/// Dense row-major feature matrix (`rows` frames of `cols` bins).
#[derive(Debug, Clone, PartialEq)]
pub struct FeatMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl FeatMatrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// Split `path:offset` into its parts.
pub fn parse_location(location: &str) -> Result<(PathBuf, usize), KaldiError> {
    let location = location.trim();
    if location.is_empty() {
        return Err(KaldiError::BadLocation(location.to_string()));
    }
    match location.rsplit_once(':') {
        Some((path, offset))
            if !path.is_empty() && !offset.is_empty() && offset.bytes().all(|b| b.is_ascii_digit()) =>
        {
            let offset = offset
                .parse()
                .map_err(|_| KaldiError::BadLocation(location.to_string()))?;
            Ok((PathBuf::from(path), offset))
        }
        _ => Ok((PathBuf::from(location), 0)),
    }
}

/// Memory-mapped archive cache.
#[derive(Default)]
pub struct ArkReader {
    archives: Mutex<HashMap<PathBuf, Arc<Mmap>>>,
}

impl ArkReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the matrix at `location` (`path[:offset]`).
    pub fn read(&self, location: &str) -> Result<FeatMatrix, KaldiError> {
        let (path, offset) = parse_location(location)?;
        let mmap = self.archive(&path)?;
        decode_matrix(&mmap, offset, &path)
    }

    fn archive(&self, path: &Path) -> Result<Arc<Mmap>, KaldiError> {
        let mut archives = self
            .archives
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mmap) = archives.get(path) {
            return Ok(Arc::clone(mmap));
        }

        let open_err = |source: std::io::Error| KaldiError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_err)?;
        // Safety: archives are written once by feature extraction and only read here
        let mmap = unsafe { Mmap::map(&file) }.map_err(open_err)?;
        let mmap = Arc::new(mmap);
        archives.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }

    /// Number of archives currently mapped
    #[cfg(test)]
    fn cached(&self) -> usize {
        self.archives
            .lock()
            .map(|archives| archives.len())
            .unwrap_or(0)
    }
}

/// Decode one binary matrix starting at `offset` in `bytes`.
pub fn decode_matrix(bytes: &[u8], offset: usize, path: &Path) -> Result<FeatMatrix, KaldiError> {
    if offset >= bytes.len() {
        return Err(KaldiError::OffsetOutOfRange {
            path: path.to_path_buf(),
            offset,
        });
    }
    let malformed = |at: usize, reason: &str| KaldiError::Malformed {
        path: path.to_path_buf(),
        offset: at,
        reason: reason.to_string(),
    };

    let mut pos = offset;
    if bytes[pos..].starts_with(b"\0B") {
        pos += 2;
    }

    let token_end = bytes[pos..]
        .iter()
        .position(|&b| b == b' ')
        .map(|n| pos + n)
        .ok_or_else(|| malformed(pos, "missing matrix type token"))?;
    let token = String::from_utf8_lossy(&bytes[pos..token_end]).into_owned();
    let elem_size = match token.as_str() {
        "FM" => 4,
        "DM" => 8,
        _ => return Err(KaldiError::UnsupportedType(token)),
    };
    pos = token_end + 1;

    let read_dim = |pos: &mut usize| -> Result<usize, KaldiError> {
        if *pos + 5 > bytes.len() {
            return Err(malformed(*pos, "truncated dimension"));
        }
        if bytes[*pos] != 4 {
            return Err(malformed(*pos, "dimension is not a 4-byte integer"));
        }
        let value = LittleEndian::read_i32(&bytes[*pos + 1..*pos + 5]);
        if value < 0 {
            return Err(malformed(*pos, "negative dimension"));
        }
        *pos += 5;
        Ok(value as usize)
    };
    let rows = read_dim(&mut pos)?;
    let cols = read_dim(&mut pos)?;

    let n = rows
        .checked_mul(cols)
        .ok_or_else(|| malformed(pos, "matrix size overflows"))?;
    let end = n
        .checked_mul(elem_size)
        .and_then(|len| pos.checked_add(len))
        .ok_or_else(|| malformed(pos, "matrix size overflows"))?;
    if end > bytes.len() {
        return Err(malformed(pos, "matrix data runs past end of archive"));
    }

    let mut data = vec![0f32; n];
    if elem_size == 4 {
        LittleEndian::read_f32_into(&bytes[pos..end], &mut data);
    } else {
        let mut wide = vec![0f64; n];
        LittleEndian::read_f64_into(&bytes[pos..end], &mut wide);
        for (dst, src) in data.iter_mut().zip(wide) {
            *dst = src as f32;
        }
    }

    Ok(FeatMatrix::new(rows, cols, data))
}
