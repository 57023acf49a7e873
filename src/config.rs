use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::clock::OrgZone;
use crate::model::{MINUTE_MS, Ms};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both SLOTWISE_TLS_CERT and SLOTWISE_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Scheduling rules the engine enforces. Everything time-related in here is
/// already in milliseconds.
#[derive(Debug, Clone)]
pub struct Policy {
    pub zone: OrgZone,
    /// Grid step; `None` means "step by the requested duration".
    pub slot_step: Option<Ms>,
    /// Minimum gap between now and the earliest offerable start on the current day.
    pub lead_time: Ms,
    /// Extra trim the month view applies to the current day.
    pub today_buffer: Ms,
    /// Added to the end of every appointment and live reservation.
    pub rest_buffer: Ms,
    pub reservation_ttl: Ms,
    pub lock_timeout: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            zone: OrgZone::utc(),
            slot_step: None,
            lead_time: 0,
            today_buffer: 60 * MINUTE_MS,
            rest_buffer: 0,
            reservation_ttl: 5 * MINUTE_MS,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Policy::default();

        let zone = match lookup("SLOTWISE_TIMEZONE") {
            Some(name) => OrgZone::parse(&name).map_err(|e| ConfigError::Invalid {
                var: "SLOTWISE_TIMEZONE",
                value: name.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.zone,
        };

        let slot_step = parse_var::<u32>(&lookup, "SLOTWISE_SLOT_STEP_MIN")?
            .map(|m| positive_minutes("SLOTWISE_SLOT_STEP_MIN", m))
            .transpose()?;

        let policy = Policy {
            zone,
            slot_step,
            lead_time: minutes_or(&lookup, "SLOTWISE_LEAD_TIME_MIN", defaults.lead_time)?,
            today_buffer: minutes_or(&lookup, "SLOTWISE_TODAY_BUFFER_MIN", defaults.today_buffer)?,
            rest_buffer: minutes_or(&lookup, "SLOTWISE_REST_BUFFER_MIN", defaults.rest_buffer)?,
            reservation_ttl: parse_var::<u32>(&lookup, "SLOTWISE_RESERVATION_TTL_SEC")?
                .map_or(defaults.reservation_ttl, |s| Ms::from(s) * 1_000),
            lock_timeout: parse_var::<u64>(&lookup, "SLOTWISE_LOCK_TIMEOUT_MS")?
                .map_or(defaults.lock_timeout, Duration::from_millis),
        };

        let tls_cert = lookup("SLOTWISE_TLS_CERT");
        let tls_key = lookup("SLOTWISE_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            bind: lookup("SLOTWISE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_var(&lookup, "SLOTWISE_PORT")?.unwrap_or(5433),
            data_dir: lookup("SLOTWISE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("SLOTWISE_PASSWORD").unwrap_or_else(|| "slotwise".into()),
            max_connections: parse_var(&lookup, "SLOTWISE_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse_var(&lookup, "SLOTWISE_COMPACT_THRESHOLD")?.unwrap_or(1000),
            reaper_interval: Duration::from_secs(
                parse_var(&lookup, "SLOTWISE_REAPER_INTERVAL_SEC")?.unwrap_or(5),
            ),
            tls_cert,
            tls_key,
            metrics_port: parse_var(&lookup, "SLOTWISE_METRICS_PORT")?,
            policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn minutes_or(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Ms,
) -> Result<Ms, ConfigError> {
    Ok(parse_var::<u32>(lookup, var)?.map_or(default, |m| Ms::from(m) * MINUTE_MS))
}

fn positive_minutes(var: &'static str, minutes: u32) -> Result<Ms, ConfigError> {
    if minutes == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be positive".into(),
        });
    }
    Ok(Ms::from(minutes) * MINUTE_MS)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.policy.reservation_ttl, 5 * MINUTE_MS);
        assert_eq!(cfg.policy.today_buffer, 60 * MINUTE_MS);
        assert_eq!(cfg.policy.rest_buffer, 0);
        assert_eq!(cfg.policy.slot_step, None);
        assert_eq!(cfg.policy.zone, OrgZone::utc());
        assert!(cfg.wal_path().ends_with("slotwise.wal"));
    }

    #[test]
    fn policy_values_are_converted_to_ms() {
        let cfg = config_from(&[
            ("SLOTWISE_TIMEZONE", "Europe/Berlin"),
            ("SLOTWISE_SLOT_STEP_MIN", "15"),
            ("SLOTWISE_LEAD_TIME_MIN", "30"),
            ("SLOTWISE_REST_BUFFER_MIN", "10"),
            ("SLOTWISE_RESERVATION_TTL_SEC", "120"),
            ("SLOTWISE_LOCK_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(cfg.policy.zone.name(), "Europe/Berlin");
        assert_eq!(cfg.policy.slot_step, Some(15 * MINUTE_MS));
        assert_eq!(cfg.policy.lead_time, 30 * MINUTE_MS);
        assert_eq!(cfg.policy.rest_buffer, 10 * MINUTE_MS);
        assert_eq!(cfg.policy.reservation_ttl, 120_000);
        assert_eq!(cfg.policy.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = config_from(&[("SLOTWISE_PORT", "http")]).unwrap_err();
        assert!(err.to_string().starts_with("SLOTWISE_PORT=\"http\""));
    }

    #[test]
    fn zero_step_rejected() {
        assert!(config_from(&[("SLOTWISE_SLOT_STEP_MIN", "0")]).is_err());
    }

    #[test]
    fn unknown_zone_rejected() {
        assert!(config_from(&[("SLOTWISE_TIMEZONE", "Nowhere/Special")]).is_err());
    }

    #[test]
    fn tls_needs_both_halves() {
        assert!(matches!(
            config_from(&[("SLOTWISE_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
        let cfg = config_from(&[("SLOTWISE_TLS_CERT", "c.pem"), ("SLOTWISE_TLS_KEY", "k.pem")]).unwrap();
        assert_eq!(cfg.tls_key.as_deref(), Some("k.pem"));
    }
}
