//! Launcher environment for one training process.
//!
//! An external launcher starts one process per GPU and describes its place in
//! the group through environment variables:
//!
//! - `LOCAL_RANK`  - index of this process (default 0)
//! - `WORLD_SIZE`  - number of processes (default 1)
//! - `MASTER_ADDR` - address rank 0 listens on (default 127.0.0.1)
//! - `MASTER_PORT` - port rank 0 listens on (default 29500)

use crate::error::DistError;

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

#[derive(Debug, Clone, PartialEq)]
pub struct DistEnv {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl Default for DistEnv {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }
}

impl DistEnv {
    /// Read the launcher variables from the process environment.
    pub fn from_env() -> Result<Self, DistError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DistError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = parse_var(&lookup, "LOCAL_RANK")?.unwrap_or(0);
        let world_size = parse_var(&lookup, "WORLD_SIZE")?.unwrap_or(1).max(1);
        if rank >= world_size {
            return Err(DistError::RankOutOfRange { rank, world_size });
        }

        let master_addr = lookup("MASTER_ADDR")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = match parse_var(&lookup, "MASTER_PORT")? {
            Some(port) => u16::try_from(port).map_err(|_| DistError::BadEnv {
                name: "MASTER_PORT",
                value: port.to_string(),
            })?,
            None => DEFAULT_MASTER_PORT,
        };

        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    /// `host:port` rank 0 listens on.
    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

fn parse_var<F>(lookup: &F, name: &'static str) -> Result<Option<usize>, DistError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| DistError::BadEnv { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let env = DistEnv::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(env, DistEnv::default());
        assert!(env.is_primary());
        assert_eq!(env.world_size, 1);
    }

    #[test]
    fn test_reads_rank_and_world() {
        let env = DistEnv::from_lookup(lookup_from(&[
            ("LOCAL_RANK", "2"),
            ("WORLD_SIZE", "4"),
            ("MASTER_ADDR", "10.0.0.1"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap();
        assert_eq!(env.rank, 2);
        assert_eq!(env.world_size, 4);
        assert_eq!(env.master_endpoint(), "10.0.0.1:1234");
        assert!(!env.is_primary());
    }

    #[test]
    fn test_rejects_rank_outside_world() {
        let err = DistEnv::from_lookup(lookup_from(&[("LOCAL_RANK", "3"), ("WORLD_SIZE", "2")]))
            .unwrap_err();
        assert!(matches!(err, DistError::RankOutOfRange { rank: 3, world_size: 2 }));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = DistEnv::from_lookup(lookup_from(&[("WORLD_SIZE", "two")])).unwrap_err();
        assert!(matches!(err, DistError::BadEnv { name: "WORLD_SIZE", .. }));

        let err = DistEnv::from_lookup(lookup_from(&[("MASTER_PORT", "70000")])).unwrap_err();
        assert!(matches!(err, DistError::BadEnv { name: "MASTER_PORT", .. }));
    }
}
