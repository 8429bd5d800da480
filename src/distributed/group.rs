//! TCP process group
//!
//! Star topology: rank 0 listens on `MASTER_ADDR:MASTER_PORT`, every other
//! rank connects to it and announces its rank. Collectives are executed by
//! rank 0 on behalf of the group:
//!
//! - `barrier`    - leaves send ARRIVE, root answers RELEASE once all arrived
//! - `all_reduce` - leaves send their buffer, root sums and sends the result back
//! - `broadcast`  - root sends its buffer, leaves overwrite theirs
//!
//! Every collective must be called by all ranks in the same order.
//!
//! # Wire format
//!
//! ```text
//! [tag: u8][len: u64 LE][payload: len bytes]
//! ```
//! f32 payloads are little-endian.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::env::DistEnv;
use crate::error::DistError;

const TAG_HELLO: u8 = 1;
const TAG_ARRIVE: u8 = 2;
const TAG_RELEASE: u8 = 3;
const TAG_REDUCE: u8 = 4;
const TAG_RESULT: u8 = 5;
const TAG_BROADCAST: u8 = 6;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_RETRY: Duration = Duration::from_millis(200);

pub const DEFAULT_RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(300);

enum Peers {
    /// World of one: every collective is a no-op
    Solo,
    /// Rank 0: one stream per leaf, indexed by `rank - 1`
    Root(Vec<TcpStream>),
    /// Any other rank: the stream to rank 0
    Leaf(TcpStream),
}

pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    peers: Mutex<Peers>,
}

impl ProcessGroup {
    /// Group of a single process; performs no I/O.
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            peers: Mutex::new(Peers::Solo),
        }
    }

    /// Rendezvous with the other ranks described by `env`.
    ///
    /// Blocks until every rank has joined or `timeout` elapses.
    pub fn init(env: &DistEnv, timeout: Duration) -> Result<Self, DistError> {
        if env.rank >= env.world_size {
            return Err(DistError::RankOutOfRange {
                rank: env.rank,
                world_size: env.world_size,
            });
        }
        if env.world_size == 1 {
            return Ok(Self::solo());
        }

        let peers = if env.is_primary() {
            Peers::Root(accept_leaves(env, timeout)?)
        } else {
            Peers::Leaf(connect_to_root(env, timeout)?)
        };

        log::debug!(
            "process group ready: rank {}/{} via {}",
            env.rank,
            env.world_size,
            env.master_endpoint()
        );

        Ok(Self {
            rank: env.rank,
            world_size: env.world_size,
            peers: Mutex::new(peers),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// Block until every rank has reached this point.
    pub fn barrier(&self) -> Result<(), DistError> {
        let mut peers = self.lock()?;
        match &mut *peers {
            Peers::Solo => Ok(()),
            Peers::Root(leaves) => {
                for stream in leaves.iter_mut() {
                    expect_frame(stream, TAG_ARRIVE)?;
                }
                for stream in leaves.iter_mut() {
                    write_frame(stream, TAG_RELEASE, &[])?;
                }
                Ok(())
            }
            Peers::Leaf(root) => {
                write_frame(root, TAG_ARRIVE, &[])?;
                expect_frame(root, TAG_RELEASE)?;
                Ok(())
            }
        }
    }

    /// Element-wise sum of `buf` across all ranks, written back in place.
    pub fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<(), DistError> {
        let mut peers = self.lock()?;
        match &mut *peers {
            Peers::Solo => Ok(()),
            Peers::Root(leaves) => {
                let mut incoming = vec![0f32; buf.len()];
                for (i, stream) in leaves.iter_mut().enumerate() {
                    let payload = expect_frame(stream, TAG_REDUCE)?;
                    decode_f32_into(&payload, &mut incoming, i + 1)?;
                    for (acc, v) in buf.iter_mut().zip(incoming.iter()) {
                        *acc += *v;
                    }
                }
                let bytes = encode_f32(buf);
                for stream in leaves.iter_mut() {
                    write_frame(stream, TAG_RESULT, &bytes)?;
                }
                Ok(())
            }
            Peers::Leaf(root) => {
                write_frame(root, TAG_REDUCE, &encode_f32(buf))?;
                let payload = expect_frame(root, TAG_RESULT)?;
                decode_f32_into(&payload, buf, 0)
            }
        }
    }

    /// Element-wise mean of `buf` across all ranks.
    pub fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<(), DistError> {
        self.all_reduce_sum(buf)?;
        if self.world_size > 1 {
            let scale = 1.0 / self.world_size as f32;
            for v in buf.iter_mut() {
                *v *= scale;
            }
        }
        Ok(())
    }

    /// Overwrite `buf` on every rank with rank 0's contents.
    pub fn broadcast(&self, buf: &mut [f32]) -> Result<(), DistError> {
        let mut payload = encode_f32(buf);
        self.broadcast_bytes(&mut payload)?;
        decode_f32_into(&payload, buf, 0)
    }

    /// Overwrite `buf` on every rank with rank 0's bytes (length included).
    pub fn broadcast_bytes(&self, buf: &mut Vec<u8>) -> Result<(), DistError> {
        let mut peers = self.lock()?;
        match &mut *peers {
            Peers::Solo => Ok(()),
            Peers::Root(leaves) => {
                for stream in leaves.iter_mut() {
                    write_frame(stream, TAG_BROADCAST, buf)?;
                }
                Ok(())
            }
            Peers::Leaf(root) => {
                *buf = expect_frame(root, TAG_BROADCAST)?;
                Ok(())
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Peers>, DistError> {
        self.peers
            .lock()
            .map_err(|_| DistError::Protocol("process group lock poisoned".to_string()))
    }
}

fn accept_leaves(env: &DistEnv, timeout: Duration) -> Result<Vec<TcpStream>, DistError> {
    let listener = TcpListener::bind(env.master_endpoint())?;
    listener.set_nonblocking(true)?;

    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<TcpStream>> = (1..env.world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < slots.len() {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                let hello = expect_frame(&mut stream, TAG_HELLO)?;
                if hello.len() != 4 {
                    return Err(DistError::Protocol(format!(
                        "HELLO from {} has {} bytes",
                        addr,
                        hello.len()
                    )));
                }
                let peer_rank = LittleEndian::read_u32(&hello) as usize;
                if peer_rank == 0 || peer_rank >= env.world_size {
                    return Err(DistError::RankOutOfRange {
                        rank: peer_rank,
                        world_size: env.world_size,
                    });
                }
                let slot = &mut slots[peer_rank - 1];
                if slot.is_some() {
                    return Err(DistError::Protocol(format!(
                        "rank {} joined twice",
                        peer_rank
                    )));
                }
                log::debug!("rank {} joined from {}", peer_rank, addr);
                *slot = Some(stream);
                joined += 1;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(DistError::RendezvousTimeout {
                        addr: env.master_endpoint(),
                        secs: timeout.as_secs(),
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

fn connect_to_root(env: &DistEnv, timeout: Duration) -> Result<TcpStream, DistError> {
    let endpoint = env.master_endpoint();
    let deadline = Instant::now() + timeout;

    let mut stream = loop {
        match TcpStream::connect(&endpoint) {
            Ok(stream) => break stream,
            Err(e) => {
                if Instant::now() >= deadline {
                    log::debug!("last connect error to {}: {}", endpoint, e);
                    return Err(DistError::RendezvousTimeout {
                        addr: endpoint,
                        secs: timeout.as_secs(),
                    });
                }
                std::thread::sleep(CONNECT_RETRY);
            }
        }
    };
    stream.set_nodelay(true)?;

    let mut hello = [0u8; 4];
    LittleEndian::write_u32(&mut hello, env.rank as u32);
    write_frame(&mut stream, TAG_HELLO, &hello)?;
    Ok(stream)
}

fn write_frame<W: Write>(stream: &mut W, tag: u8, payload: &[u8]) -> Result<(), DistError> {
    stream.write_u8(tag)?;
    stream.write_u64::<LittleEndian>(payload.len() as u64)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

fn read_frame<R: Read>(stream: &mut R) -> Result<(u8, Vec<u8>), DistError> {
    let tag = stream.read_u8()?;
    let len = stream.read_u64::<LittleEndian>()? as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((tag, payload))
}

fn expect_frame<R: Read>(stream: &mut R, expected: u8) -> Result<Vec<u8>, DistError> {
    let (tag, payload) = read_frame(stream)?;
    if tag != expected {
        return Err(DistError::Protocol(format!(
            "expected frame tag {}, got {}",
            expected, tag
        )));
    }
    Ok(payload)
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut bytes);
    bytes
}

fn decode_f32_into(bytes: &[u8], out: &mut [f32], from_rank: usize) -> Result<(), DistError> {
    if bytes.len() != out.len() * 4 {
        return Err(DistError::LengthMismatch {
            expected: out.len(),
            actual: bytes.len() / 4,
            rank: from_rank,
        });
    }
    LittleEndian::read_f32_into(bytes, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip_through_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, TAG_REDUCE, &encode_f32(&[1.5, -2.0])).unwrap();
        assert_eq!(buf.len(), 1 + 8 + 8);

        let (tag, payload) = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(tag, TAG_REDUCE);
        let mut out = [0f32; 2];
        decode_f32_into(&payload, &mut out, 0).unwrap();
        assert_eq!(out, [1.5, -2.0]);
    }

    #[test]
    fn test_unexpected_tag_is_protocol_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, TAG_RELEASE, &[]).unwrap();
        let err = expect_frame(&mut Cursor::new(buf), TAG_RESULT).unwrap_err();
        assert!(matches!(err, DistError::Protocol(_)));
    }

    #[test]
    fn test_length_mismatch_names_rank() {
        let bytes = encode_f32(&[1.0, 2.0, 3.0]);
        let mut out = [0f32; 2];
        let err = decode_f32_into(&bytes, &mut out, 3).unwrap_err();
        assert!(matches!(
            err,
            DistError::LengthMismatch { expected: 2, actual: 3, rank: 3 }
        ));
    }

    #[test]
    fn test_solo_group_is_noop() {
        let group = ProcessGroup::solo();
        let mut buf = [1.0f32, 2.0];
        group.barrier().unwrap();
        group.all_reduce_mean(&mut buf).unwrap();
        group.broadcast(&mut buf).unwrap();
        assert_eq!(buf, [1.0, 2.0]);
        assert!(group.is_primary());
    }
}
