#![forbid(unsafe_code)]

//! Runtime settings shared by the binaries.
//!
//! Values come from, in order of precedence: explicit overrides (CLI flags),
//! the process environment, the `.env` file, built-in defaults. Blank values
//! count as unset; unparsable numbers fall back to the default.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

use crate::metadata_cache::DEFAULT_METADATA_CAPACITY;
use crate::sweeper::CheckFailurePolicy;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SWEEP_INTERVAL_HOURS: u64 = 24;
pub const DEFAULT_METADATA_QUOTA_BYTES: usize = 5 * 1024 * 1024;

pub const LINKS_DB_FILE: &str = "links.db";
pub const METADATA_CACHE_FILE: &str = "metadata-cache.json";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    /// Bearer secret for the sweep/backfill triggers. `None` disables them.
    pub sweep_secret: Option<String>,
    /// `0` disables the scheduled sweep.
    pub sweep_interval_hours: u64,
    pub check_failure_policy: CheckFailurePolicy,
    pub youtube_api_key: Option<String>,
    pub embed_origin: Option<String>,
    pub metadata_cache_capacity: usize,
    pub metadata_cache_quota_bytes: usize,
}

impl RuntimeSettings {
    pub fn links_db_path(&self) -> PathBuf {
        self.data_root.join(LINKS_DB_FILE)
    }

    pub fn metadata_cache_path(&self) -> PathBuf {
        self.data_root.join(METADATA_CACHE_FILE)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_hours > 0)
            .then(|| Duration::from_secs(self.sweep_interval_hours * 60 * 60))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn load_settings() -> Result<RuntimeSettings> {
    resolve_settings(RuntimeOverrides::default())
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let data_root = overrides
        .data_root
        .or_else(|| lookup("STUDYBEATS_DATA_ROOT").map(PathBuf::from))
        .ok_or_else(|| anyhow!("STUDYBEATS_DATA_ROOT not set"))?;
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("STUDYBEATS_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| parsed(&lookup, "STUDYBEATS_PORT"))
        .unwrap_or(DEFAULT_PORT);

    let check_failure_policy = match lookup("STUDYBEATS_SWEEP_ON_CHECK_FAILURE") {
        Some(raw) => CheckFailurePolicy::parse(&raw).unwrap_or_else(|| {
            warn!("unknown STUDYBEATS_SWEEP_ON_CHECK_FAILURE value {raw:?}, using skip");
            CheckFailurePolicy::Skip
        }),
        None => CheckFailurePolicy::default(),
    };

    Ok(RuntimeSettings {
        data_root,
        host,
        port,
        sweep_secret: lookup("STUDYBEATS_SWEEP_SECRET"),
        sweep_interval_hours: parsed(&lookup, "STUDYBEATS_SWEEP_INTERVAL_HOURS")
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_HOURS),
        check_failure_policy,
        youtube_api_key: lookup("YOUTUBE_API_KEY"),
        embed_origin: lookup("STUDYBEATS_EMBED_ORIGIN"),
        metadata_cache_capacity: parsed(&lookup, "STUDYBEATS_METADATA_CACHE_CAPACITY")
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(DEFAULT_METADATA_CAPACITY),
        metadata_cache_quota_bytes: parsed(&lookup, "STUDYBEATS_METADATA_CACHE_QUOTA_BYTES")
            .filter(|quota: &usize| *quota > 0)
            .unwrap_or(DEFAULT_METADATA_QUOTA_BYTES),
    })
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring invalid {key} value {raw:?}");
            None
        }
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .and_then(non_blank)
        .or_else(|| file_vars.get(key).cloned().and_then(non_blank))
}

/// Parses a dotenv-style file. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|inner| inner.strip_suffix(*quote))
        })
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn defaults_apply_when_only_data_root_is_set() {
        let settings = settings_from("STUDYBEATS_DATA_ROOT=\"/srv/beats\"\n");
        assert_eq!(settings.data_root, PathBuf::from("/srv/beats"));
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.sweep_secret, None);
        assert_eq!(settings.sweep_interval_hours, 24);
        assert_eq!(settings.check_failure_policy, CheckFailurePolicy::Skip);
        assert_eq!(settings.metadata_cache_capacity, 500);
        assert_eq!(settings.metadata_cache_quota_bytes, 5_242_880);
        assert_eq!(settings.links_db_path(), PathBuf::from("/srv/beats/links.db"));
    }

    #[test]
    fn missing_data_root_is_an_error() {
        let vars = HashMap::new();
        let err = build_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("STUDYBEATS_DATA_ROOT"));
    }

    #[test]
    fn reads_every_key_from_file() {
        let settings = settings_from(
            r#"
            export STUDYBEATS_DATA_ROOT="/data"
            STUDYBEATS_HOST='0.0.0.0'
            STUDYBEATS_PORT=9090
            STUDYBEATS_SWEEP_SECRET="s3cret"
            STUDYBEATS_SWEEP_INTERVAL_HOURS=0
            STUDYBEATS_SWEEP_ON_CHECK_FAILURE=remove
            YOUTUBE_API_KEY = "key"
            STUDYBEATS_EMBED_ORIGIN="https://beats.example"
            STUDYBEATS_METADATA_CACHE_CAPACITY=42
            # comment
            INVALID_LINE
            "#,
        );
        assert_eq!(settings.host, "0.0.0.0");
        assert_eq!(settings.port, 9090);
        assert_eq!(settings.sweep_secret.as_deref(), Some("s3cret"));
        assert_eq!(settings.sweep_interval(), None);
        assert_eq!(settings.check_failure_policy, CheckFailurePolicy::Remove);
        assert_eq!(settings.youtube_api_key.as_deref(), Some("key"));
        assert_eq!(settings.embed_origin.as_deref(), Some("https://beats.example"));
        assert_eq!(settings.metadata_cache_capacity, 42);
    }

    #[test]
    fn environment_beats_file_and_overrides_beat_both() {
        let mut vars = HashMap::new();
        vars.insert("STUDYBEATS_DATA_ROOT".to_string(), "/file".to_string());
        vars.insert("STUDYBEATS_PORT".to_string(), "7000".to_string());
        vars.insert("STUDYBEATS_HOST".to_string(), "file-host".to_string());

        let env_lookup = |key: &str| match key {
            "STUDYBEATS_DATA_ROOT" => Some("/env".to_string()),
            "STUDYBEATS_PORT" => Some("8000".to_string()),
            _ => None,
        };

        let settings = build_settings(&vars, env_lookup, RuntimeOverrides::default()).unwrap();
        assert_eq!(settings.data_root, PathBuf::from("/env"));
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.host, "file-host");

        let settings = build_settings(
            &vars,
            env_lookup,
            RuntimeOverrides {
                port: Some(9000),
                host: Some("override-host".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.host, "override-host");
    }

    #[test]
    fn blank_and_invalid_values_fall_back() {
        let settings = settings_from(
            "STUDYBEATS_DATA_ROOT=/d\nSTUDYBEATS_PORT=nope\nSTUDYBEATS_SWEEP_SECRET=\"  \"\n\
             STUDYBEATS_SWEEP_INTERVAL_HOURS=-3\nSTUDYBEATS_SWEEP_ON_CHECK_FAILURE=maybe\n\
             STUDYBEATS_METADATA_CACHE_CAPACITY=0\n",
        );
        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.sweep_secret, None);
        assert_eq!(settings.sweep_interval_hours, DEFAULT_SWEEP_INTERVAL_HOURS);
        assert_eq!(settings.check_failure_policy, CheckFailurePolicy::Skip);
        assert_eq!(settings.metadata_cache_capacity, DEFAULT_METADATA_CAPACITY);
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let vars = read_env_file(make_config("STUDYBEATS_DATA_ROOT=/d\n").path()).unwrap();
        let settings = build_settings(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.host, DEFAULT_HOST);
    }

    #[test]
    fn missing_env_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn sweep_interval_converts_hours() {
        let settings = settings_from("STUDYBEATS_DATA_ROOT=/d\nSTUDYBEATS_SWEEP_INTERVAL_HOURS=2\n");
        assert_eq!(settings.sweep_interval(), Some(Duration::from_secs(7200)));
    }
}
