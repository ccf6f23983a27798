#![forbid(unsafe_code)]

//! Runtime settings for the backend.
//!
//! Values are looked up in this order: explicit overrides (CLI flags), the
//! process environment, the `.env` file, then the built-in defaults.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STORAGE_DIR: &str = "downloads";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";

const STORAGE_DIR_KEY: &str = "VIDFETCH_STORAGE_DIR";
const HOST_KEY: &str = "VIDFETCH_HOST";
const PORT_KEY: &str = "VIDFETCH_PORT";
const YTDLP_KEY: &str = "VIDFETCH_YTDLP";
const ENV_FILE_KEY: &str = "VIDFETCH_ENV_FILE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub storage_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_program: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub storage_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_program: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .or_else(|| env_var_string(ENV_FILE_KEY).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let storage_dir = overrides
        .storage_dir
        .or_else(|| lookup_value(STORAGE_DIR_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value(HOST_KEY, file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value(PORT_KEY, file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let ytdlp_program = overrides
        .ytdlp_program
        .or_else(|| lookup_value(YTDLP_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PROGRAM));

    RuntimeConfig {
        storage_dir,
        host,
        port,
        ytdlp_program,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a dotenv-style file. A missing file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
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

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let file = make_env(contents);
        let vars = read_env_file(file.path()).unwrap();
        build_runtime_config(&vars, |_| None, RuntimeOverrides::default())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from("");
        assert_eq!(config.storage_dir, PathBuf::from(DEFAULT_STORAGE_DIR));
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ytdlp_program, PathBuf::from(DEFAULT_YTDLP_PROGRAM));
    }

    #[test]
    fn env_file_values_are_read() {
        let config = config_from(
            "VIDFETCH_STORAGE_DIR=\"/srv/media\"\nVIDFETCH_PORT=\"4242\"\nVIDFETCH_HOST=\"0.0.0.0\"\n",
        );
        assert_eq!(config.storage_dir, PathBuf::from("/srv/media"));
        assert_eq!(config.port, 4242);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let config = config_from("VIDFETCH_PORT=\"nope\"\n");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn process_env_beats_file() {
        let vars = read_env_file(make_env("VIDFETCH_STORAGE_DIR=\"/file\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |key| (key == STORAGE_DIR_KEY).then(|| "/env".to_string()),
            RuntimeOverrides::default(),
        );
        assert_eq!(config.storage_dir, PathBuf::from("/env"));
    }

    #[test]
    fn overrides_beat_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert(PORT_KEY.to_string(), "7000".to_string());
        vars.insert(YTDLP_KEY.to_string(), "/file/yt-dlp".to_string());

        let config = build_runtime_config(
            &vars,
            |key| (key == PORT_KEY).then(|| "8000".to_string()),
            RuntimeOverrides {
                port: Some(9000),
                ytdlp_program: Some(PathBuf::from("/opt/yt-dlp")),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(config.port, 9000);
        assert_eq!(config.ytdlp_program, PathBuf::from("/opt/yt-dlp"));
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let config = build_runtime_config(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let file = make_env(
            r#"
            export VIDFETCH_STORAGE_DIR="/media"
            VIDFETCH_YTDLP='/usr/bin/yt-dlp'
            VIDFETCH_HOST =  "0.0.0.0"
            # comment
            NOT_A_PAIR
            "#,
        );
        let vars = read_env_file(file.path()).unwrap();
        assert_eq!(vars.get("VIDFETCH_STORAGE_DIR").unwrap(), "/media");
        assert_eq!(vars.get("VIDFETCH_YTDLP").unwrap(), "/usr/bin/yt-dlp");
        assert_eq!(vars.get("VIDFETCH_HOST").unwrap(), "0.0.0.0");
        assert!(!vars.contains_key("NOT_A_PAIR"));
    }

    #[test]
    fn missing_env_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn resolve_reads_explicit_env_path() {
        let file = make_env("VIDFETCH_YTDLP=\"/custom/yt-dlp\"\n");
        let config = resolve_runtime_config(RuntimeOverrides {
            env_path: Some(file.path().to_path_buf()),
            ytdlp_program: None,
            ..RuntimeOverrides::default()
        })
        .unwrap();
        // The process environment may carry VIDFETCH_YTDLP on a dev box.
        if env::var(YTDLP_KEY).is_err() {
            assert_eq!(config.ytdlp_program, PathBuf::from("/custom/yt-dlp"));
        }
    }
}
