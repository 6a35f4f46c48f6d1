//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/waymark/config.toml or
/// /etc/waymark/config.toml. Env overrides: WAYMARK_ACK_DEADLINE_SECS,
/// WAYMARK_SWEEP_INTERVAL_SECS, WAYMARK_REDUNDANCY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds a delivery job may stay unresolved before it times out
    /// (default 900).
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,
    /// Seconds between timeout sweeps (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Default redundancy factor for new delivery jobs (default 2).
    #[serde(default = "default_redundancy")]
    pub redundancy: u8,
    /// Optional path to a JSON snapshot of the beacon directory.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

fn default_ack_deadline_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_redundancy() -> u8 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack_deadline_secs: default_ack_deadline_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redundancy: default_redundancy(),
            state_path: None,
        }
    }
}

impl Config {
    /// Job deadline in sweep ticks, as the delivery tracker counts it.
    pub fn deadline_ticks(&self) -> u64 {
        (self.ack_deadline_secs / self.sweep_interval_secs.max(1)).max(1)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("WAYMARK_ACK_DEADLINE_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.ack_deadline_secs = v;
        }
    }
    if let Ok(s) = std::env::var("WAYMARK_SWEEP_INTERVAL_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.sweep_interval_secs = v;
        }
    }
    if let Ok(s) = std::env::var("WAYMARK_REDUNDANCY") {
        if let Ok(v) = s.parse::<u8>() {
            c.redundancy = v;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/waymark/config.toml"));
    }
    out.push(PathBuf::from("/etc/waymark/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.ack_deadline_secs, 900);
        assert_eq!(c.sweep_interval_secs, 30);
        assert_eq!(c.deadline_ticks(), 30);
    }

    #[test]
    fn parses_partial_file() {
        let c: Config = toml::from_str("ack_deadline_secs = 60").unwrap();
        assert_eq!(c.ack_deadline_secs, 60);
        assert_eq!(c.sweep_interval_secs, 30);
    }

    #[test]
    fn deadline_ticks_never_zero() {
        let c: Config = toml::from_str("ack_deadline_secs = 1\nsweep_interval_secs = 60").unwrap();
        assert_eq!(c.deadline_ticks(), 1);
    }
}
