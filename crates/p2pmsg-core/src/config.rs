//! Typed configuration with the defaults from §4.I.

use serde::{Deserialize, Serialize};

/// All recognized options, with §4.I's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Dial connect timeout, in seconds.
    pub connect_timeout_s: u64,
    /// Handshake deadline, in seconds.
    pub handshake_timeout_s: u64,
    /// Outbound-silence interval before a heartbeat is sent, in seconds.
    pub heartbeat_interval_s: u64,
    /// Message count since last rekey that triggers a new rekey.
    pub rekey_msg_threshold: u64,
    /// Session age that triggers a new rekey, in seconds.
    pub rekey_time_s: u64,
    /// Maximum accepted frame length.
    pub max_frame_bytes: u32,
    /// Maximum accepted file attachment size.
    pub max_file_bytes: u64,
    /// Maximum reconnect attempts before giving up.
    pub reconnect_max_attempts: u32,
    /// Argon2id time cost (passes).
    pub argon2_time_cost: u32,
    /// Argon2id memory cost, in KiB.
    pub argon2_memory_kib: u32,
    /// Argon2id parallelism.
    pub argon2_parallelism: u32,
    /// Replay window size, in bits.
    pub replay_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 5555,
            connect_timeout_s: 10,
            handshake_timeout_s: 10,
            heartbeat_interval_s: 30,
            rekey_msg_threshold: 1000,
            rekey_time_s: 86_400,
            max_frame_bytes: 10 * 1024 * 1024,
            max_file_bytes: 10 * 1024 * 1024,
            reconnect_max_attempts: 5,
            argon2_time_cost: 2,
            argon2_memory_kib: 102_400,
            argon2_parallelism: 8,
            replay_window: 1024,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to TOML for writing a starter config file.
    #[must_use]
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("Config serializes without error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.listen_port, 5555);
        assert_eq!(c.rekey_msg_threshold, 1000);
        assert_eq!(c.rekey_time_s, 86_400);
        assert_eq!(c.replay_window, 1024);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = Config::from_toml_str("listen_port = 7000\n").unwrap();
        assert_eq!(cfg.listen_port, 7000);
        assert_eq!(cfg.heartbeat_interval_s, 30);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let s = cfg.to_toml_string();
        let back = Config::from_toml_str(&s).unwrap();
        assert_eq!(cfg, back);
    }
}
