//! Configuration surface: `TIERFS_*` environment keys with fail-fast
//! validation, plus the read-only remote credentials file.
//!
//! Durations accept `s`/`m`/`h`/`d` suffixes (`90s`, `5m`, `1h30m`); sizes
//! accept `K`/`M`/`G`/`T` binary suffixes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::AttrPolicy;
use crate::remote::{CacheMode, RemoteTuning};
use crate::sched::{CronExpr, MigrateConfig};

#[derive(Clone, Debug)]
pub struct Config {
    /// Remote identifier (bucket name for the S3 backend).
    pub remote: String,
    /// Path prefix inside the remote.
    pub remote_path: String,
    /// Credentials/endpoint file; never written by this process.
    pub remote_config: Option<PathBuf>,
    pub local_path: PathBuf,
    /// Identifier of the merged namespace this process presents.
    pub mount_path: PathBuf,
    pub schedule: CronExpr,
    pub cache_mode: CacheMode,
    pub cache_max_age: Duration,
    pub cache_max_size: u64,
    pub dir_cache_time: Duration,
    pub poll_interval: Duration,
    pub attr_timeout: Duration,
    pub attr_policy: AttrPolicy,
    pub min_free_space: u64,
    pub transfers: usize,
    pub checkers: usize,
    pub retries: u32,
    pub quiescence: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source; `from_env` is the thin production
    /// wrapper around this.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| get(key).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let invalid = |key: &'static str, value: &str, reason: String| ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason,
        };

        macro_rules! parse_or_default {
            ($key:literal, $default:expr, $parse:expr) => {
                match get($key) {
                    Some(v) => $parse(&v).map_err(|reason| invalid($key, &v, reason))?,
                    None => $default,
                }
            };
        }

        let remote = require("TIERFS_REMOTE")?;
        let local_path = PathBuf::from(require("TIERFS_LOCAL_PATH")?);
        let mount_path = PathBuf::from(require("TIERFS_MOUNT_PATH")?);

        Ok(Self {
            remote,
            remote_path: get("TIERFS_REMOTE_PATH").unwrap_or_default(),
            remote_config: get("TIERFS_REMOTE_CONFIG").map(PathBuf::from),
            local_path,
            mount_path,
            schedule: parse_or_default!("TIERFS_MIGRATE_SCHEDULE", default_schedule(), |v: &str| {
                CronExpr::parse(v).map_err(|e| e.to_string())
            }),
            cache_mode: parse_or_default!("TIERFS_CACHE_MODE", CacheMode::Full, |v: &str| v
                .parse::<CacheMode>()),
            cache_max_age: parse_or_default!(
                "TIERFS_CACHE_MAX_AGE",
                Duration::from_secs(3600),
                parse_duration
            ),
            cache_max_size: parse_or_default!(
                "TIERFS_CACHE_MAX_SIZE",
                10 * (1 << 30),
                parse_size
            ),
            dir_cache_time: parse_or_default!(
                "TIERFS_DIR_CACHE_TIME",
                Duration::from_secs(300),
                parse_duration
            ),
            poll_interval: parse_or_default!(
                "TIERFS_POLL_INTERVAL",
                Duration::from_secs(60),
                parse_duration
            ),
            attr_timeout: parse_or_default!(
                "TIERFS_ATTR_TIMEOUT",
                Duration::from_secs(60),
                parse_duration
            ),
            attr_policy: parse_or_default!("TIERFS_ATTR_POLICY", AttrPolicy::Newest, |v: &str| v
                .parse::<AttrPolicy>()),
            min_free_space: parse_or_default!("TIERFS_MIN_FREE_SPACE", 1 << 30, parse_size),
            transfers: parse_or_default!("TIERFS_TRANSFERS", 16, parse_concurrency),
            checkers: parse_or_default!("TIERFS_CHECKERS", 16, parse_concurrency),
            retries: parse_or_default!("TIERFS_RETRIES", 3, |v: &str| v
                .parse::<u32>()
                .map_err(|e| e.to_string())),
            quiescence: parse_or_default!(
                "TIERFS_QUIESCENCE",
                Duration::from_secs(60),
                parse_duration
            ),
        })
    }

    pub fn remote_tuning(&self) -> RemoteTuning {
        RemoteTuning {
            cache_mode: self.cache_mode,
            cache_max_age: self.cache_max_age,
            cache_max_size: self.cache_max_size,
            dir_cache_time: self.dir_cache_time,
            attr_timeout: self.attr_timeout,
            poll_interval: self.poll_interval,
            max_retries: self.retries,
            ..RemoteTuning::default()
        }
    }

    pub fn migrate_config(&self) -> MigrateConfig {
        MigrateConfig {
            schedule: self.schedule.clone(),
            transfers: self.transfers,
            checkers: self.checkers,
            max_retries: self.retries,
            quiescence: self.quiescence,
            ..MigrateConfig::default()
        }
    }
}

fn default_schedule() -> CronExpr {
    CronExpr::parse("0 2 * * *").expect("default schedule")
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    if n == 0 {
        return Err("must be at least 1".into());
    }
    Ok(n)
}

/// `90` (seconds), `90s`, `5m`, `1h`, `2d`, or concatenations like `1h30m`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut num = String::new();
    let mut any = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: u64 = num
            .parse()
            .map_err(|_| format!("missing number before {c:?}"))?;
        num.clear();
        let mult = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(format!("unknown duration unit {c:?}")),
        };
        total = total
            .checked_add(n.checked_mul(mult).ok_or("duration overflow")?)
            .ok_or("duration overflow")?;
        any = true;
    }
    if !num.is_empty() || !any {
        return Err(format!("malformed duration {s:?}"));
    }
    Ok(Duration::from_secs(total))
}

/// Plain bytes or a binary `K`/`M`/`G`/`T` suffix.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".into());
    }
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (num, suffix) = s.split_at(s.len() - 1);
    let shift = match suffix {
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        "T" | "t" => 40,
        _ => return Err(format!("unknown size suffix {suffix:?}")),
    };
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("{num:?} is not a number"))?;
    n.checked_shl(shift)
        .filter(|v| v >> shift == n)
        .ok_or_else(|| "size overflow".to_string())
}

/// Remote credentials and endpoint, read from a YAML file that this process
/// never writes.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteCredentials {
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

fn default_region() -> String {
    "us-east-1".into()
}

impl RemoteCredentials {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::RemoteConfig {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::RemoteConfigFormat {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write as _;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const MINIMAL: &[(&str, &str)] = &[
        ("TIERFS_REMOTE", "archive-bucket"),
        ("TIERFS_LOCAL_PATH", "/srv/tierfs/local"),
        ("TIERFS_MOUNT_PATH", "/srv/tierfs/merged"),
    ];

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = Config::from_lookup(lookup(MINIMAL)).unwrap();
        assert_eq!(cfg.remote, "archive-bucket");
        assert_eq!(cfg.cache_mode, CacheMode::Full);
        assert_eq!(cfg.cache_max_size, 10 * (1 << 30));
        assert_eq!(cfg.transfers, 16);
        assert_eq!(cfg.min_free_space, 1 << 30);
        assert_eq!(cfg.attr_policy, AttrPolicy::Newest);
        assert_eq!(cfg.quiescence, Duration::from_secs(60));
    }

    #[test]
    fn missing_required_key_fails_fast() {
        let err = Config::from_lookup(lookup(&[("TIERFS_REMOTE", "b")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TIERFS_LOCAL_PATH")));
    }

    #[test]
    fn invalid_values_are_rejected_with_the_offending_key() {
        let mut pairs = MINIMAL.to_vec();
        pairs.push(("TIERFS_MIGRATE_SCHEDULE", "not a cron"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "TIERFS_MIGRATE_SCHEDULE",
                ..
            }
        ));

        let mut pairs = MINIMAL.to_vec();
        pairs.push(("TIERFS_TRANSFERS", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn tuning_overrides_parse() {
        let mut pairs = MINIMAL.to_vec();
        pairs.extend([
            ("TIERFS_CACHE_MODE", "minimal"),
            ("TIERFS_CACHE_MAX_AGE", "30m"),
            ("TIERFS_CACHE_MAX_SIZE", "512M"),
            ("TIERFS_MIN_FREE_SPACE", "10G"),
            ("TIERFS_ATTR_POLICY", "local-first"),
            ("TIERFS_MIGRATE_SCHEDULE", "*/30 * * * *"),
        ]);
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.cache_mode, CacheMode::Minimal);
        assert_eq!(cfg.cache_max_age, Duration::from_secs(1800));
        assert_eq!(cfg.cache_max_size, 512 << 20);
        assert_eq!(cfg.min_free_space, 10 << 30);
        assert_eq!(cfg.attr_policy, AttrPolicy::LocalFirst);

        let tuning = cfg.remote_tuning();
        assert_eq!(tuning.cache_mode, CacheMode::Minimal);
        let migrate = cfg.migrate_config();
        assert_eq!(migrate.transfers, 16);
    }

    #[test]
    fn duration_parser() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("5m3").is_err());
    }

    #[test]
    fn size_parser() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64K").unwrap(), 64 << 10);
        assert_eq!(parse_size("10G").unwrap(), 10 << 30);
        assert_eq!(parse_size("1t").unwrap(), 1 << 40);
        assert!(parse_size("10Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn credentials_file_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "endpoint: http://127.0.0.1:9000\nregion: us-west-2\naccess_key_id: ak\nsecret_access_key: sk"
        )
        .unwrap();
        let creds = RemoteCredentials::load(f.path()).unwrap();
        assert_eq!(creds.endpoint.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(creds.region, "us-west-2");
        assert_eq!(creds.access_key_id.as_deref(), Some("ak"));

        assert!(matches!(
            RemoteCredentials::load(Path::new("/no/such/file.yaml")),
            Err(ConfigError::RemoteConfig { .. })
        ));

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "endpoint: [unclosed").unwrap();
        assert!(matches!(
            RemoteCredentials::load(bad.path()),
            Err(ConfigError::RemoteConfigFormat { .. })
        ));
    }
}
