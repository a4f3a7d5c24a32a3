//! Plain-text "key = value" settings, one subsystem's worth of defaults per field.
//! The original parses these into a process-wide singleton; here `Settings` is just a
//! value, built once and handed explicitly to whatever needs it, per the rearchitecture
//! called for by the singleton-heavy source.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Inane,
    Info,
    Warn,
    Fatal,
}

impl std::str::FromStr for LogLevel {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_uppercase().as_str() {
            "INANE" => Ok(Self::Inane),
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "FATAL" => Ok(Self::Fatal),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub io_workers: usize,
    pub io_buffer_count: usize,
    pub io_mtu: usize,
    pub tick_interval_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub keepalive_ms: u64,
    pub max_retries: u32,
    pub bandwidth_low_bps: u64,
    pub bandwidth_high_bps: u64,
    pub log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            io_workers: std::thread::available_parallelism().map_or(1, |c| c.get()),
            io_buffer_count: 10_000,
            io_mtu: sphynx_proto::constants::DEFAULT_MTU,
            tick_interval_ms: sphynx_proto::constants::DEFAULT_TICK_INTERVAL_MS,
            disconnect_timeout_ms: sphynx_proto::constants::DEFAULT_DISCONNECT_TIMEOUT_MS,
            keepalive_ms: sphynx_proto::constants::DEFAULT_KEEPALIVE_INTERVAL_MS,
            max_retries: sphynx_proto::constants::DEFAULT_MAX_RETRIES,
            bandwidth_low_bps: sphynx_proto::constants::DEFAULT_BANDWIDTH_LOW_BPS,
            bandwidth_high_bps: sphynx_proto::constants::DEFAULT_BANDWIDTH_HIGH_BPS,
            log_level: LogLevel::Info,
        }
    }
}

impl Settings {
    /// Parse a `Settings.cfg`-style file: blank lines and `#`-prefixed lines ignored,
    /// everything else must be `key = value`. Unknown keys and malformed values are
    /// fatal at startup.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::MissingFile(path.display().to_string()))?;
        Self::from_str_contents(&text)
    }

    pub fn from_str_contents(text: &str) -> Result<Self, ConfigError> {
        let mut raw = HashMap::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidLine { line_no: i + 1, text: line.to_string() });
            };
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut settings = Settings::default();
        for (key, value) in raw {
            apply_key(&mut settings, &key, &value)?;
        }
        Ok(settings)
    }
}

fn apply_key(settings: &mut Settings, key: &str, value: &str) -> Result<(), ConfigError> {
    fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() })
    }

    match key {
        "IO.Workers" => settings.io_workers = parse(key, value)?,
        "IO.BufferCount" => settings.io_buffer_count = parse(key, value)?,
        "IO.MTU" => settings.io_mtu = parse(key, value)?,
        "Sphynx.TickIntervalMsec" => settings.tick_interval_ms = parse(key, value)?,
        "Sphynx.DisconnectTimeoutMsec" => settings.disconnect_timeout_ms = parse(key, value)?,
        "Sphynx.KeepaliveMsec" => settings.keepalive_ms = parse(key, value)?,
        "Sphynx.MaxRetries" => settings.max_retries = parse(key, value)?,
        "FlowControl.BandwidthLowBps" => settings.bandwidth_low_bps = parse(key, value)?,
        "FlowControl.BandwidthHighBps" => settings.bandwidth_high_bps = parse(key, value)?,
        "Log.Level" => {
            settings.log_level = value.parse().map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() })?
        }
        _ => return Err(ConfigError::UnknownKey(key.to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let s = Settings::default();
        assert_eq!(s.io_buffer_count, 10_000);
        assert_eq!(s.io_mtu, 1350);
        assert_eq!(s.tick_interval_ms, 20);
        assert_eq!(s.disconnect_timeout_ms, 15_000);
    }

    #[test]
    fn parses_recognized_keys() {
        let text = "IO.Workers = 4\n# a comment\n\nSphynx.MaxRetries=3\nLog.Level = WARN\n";
        let s = Settings::from_str_contents(text).unwrap();
        assert_eq!(s.io_workers, 4);
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.log_level, LogLevel::Warn);
    }

    #[test]
    fn rejects_unknown_key() {
        let err = Settings::from_str_contents("Bogus.Key = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn rejects_malformed_line() {
        let err = Settings::from_str_contents("not-a-kv-pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine { .. }));
    }
}
