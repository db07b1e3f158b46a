use std::{env, str::FromStr};

use crate::error::ConfigError;

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// Where this process sits in the run. Built once at startup and passed to whatever needs
/// rank or world information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessContext {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl ProcessContext {
    /// A context for the process with `rank` in a run of `world_size` processes, on the
    /// default rendezvous address.
    pub fn new(rank: usize, world_size: usize) -> Result<Self, ConfigError> {
        Self::with_master(rank, world_size, DEFAULT_MASTER_ADDR.to_string(), DEFAULT_MASTER_PORT)
    }

    pub fn with_master(
        rank: usize,
        world_size: usize,
        master_addr: String,
        master_port: u16,
    ) -> Result<Self, ConfigError> {
        if world_size == 0 {
            return Err(ConfigError::Env {
                var: "WORLD_SIZE",
                reason: "must be at least 1".into(),
            });
        }

        if rank >= world_size {
            return Err(ConfigError::RankOutOfRange { rank, world_size });
        }

        Ok(Self {
            rank,
            world_size,
            master_addr,
            master_port,
        })
    }

    /// Reads `WORLD_SIZE`, `RANK`, `MASTER_ADDR` and `MASTER_PORT` from the launch
    /// environment. Unset variables take their single-process defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let world_size = parse_var(&lookup, "WORLD_SIZE")?.unwrap_or(1);
        let rank = parse_var(&lookup, "RANK")?.unwrap_or(0);
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.into());
        let master_port = parse_var(&lookup, "MASTER_PORT")?.unwrap_or(DEFAULT_MASTER_PORT);

        Self::with_master(rank, world_size, master_addr, master_port)
    }

    /// True on the process that owns console output.
    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse().map_err(|e| ConfigError::Env {
                var,
                reason: format!("cannot parse `{raw}`: {e}"),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn empty_environment_is_a_single_process() {
        let ctx = ProcessContext::from_lookup(lookup(&[])).unwrap();
        assert_eq!(ctx, ProcessContext::new(0, 1).unwrap());
        assert!(ctx.is_primary());
        assert_eq!(ctx.master_port, 29500);
    }

    #[test]
    fn reads_launcher_variables() {
        let ctx = ProcessContext::from_lookup(lookup(&[
            ("WORLD_SIZE", "8"),
            ("RANK", "3"),
            ("MASTER_ADDR", "10.0.0.2"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap();

        assert_eq!(ctx.rank, 3);
        assert_eq!(ctx.world_size, 8);
        assert_eq!(ctx.master_addr, "10.0.0.2");
        assert_eq!(ctx.master_port, 1234);
        assert!(!ctx.is_primary());
    }

    #[test]
    fn rejects_malformed_or_inconsistent_values() {
        let res = ProcessContext::from_lookup(lookup(&[("WORLD_SIZE", "four")]));
        assert!(matches!(res, Err(ConfigError::Env { var: "WORLD_SIZE", .. })));

        let res = ProcessContext::from_lookup(lookup(&[("WORLD_SIZE", "2"), ("RANK", "2")]));
        assert!(matches!(res, Err(ConfigError::RankOutOfRange { rank: 2, .. })));

        let res = ProcessContext::from_lookup(lookup(&[("WORLD_SIZE", "0")]));
        assert!(res.is_err());
    }
}
