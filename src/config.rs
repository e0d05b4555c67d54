use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_db_path() -> String {
    "./sharefile.db".to_string()
}

fn default_max_upload_bytes() -> usize {
    1024 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory where uploaded blobs are stored.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Directory holding the download audit log.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// SQLite database path for file metadata.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Request body cap for uploads.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            log_dir: default_log_dir(),
            db_path: default_db_path(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        Ok(cfg)
    }

    /// Load config from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &str) -> Result<Self> {
        if Path::new(path).is_file() {
            Self::from_file(path)
        } else {
            tracing::info!("config file {} not found, using defaults", path);
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "upload_dir": "/data/uploads",
                "log_dir": "/data/logs",
                "db_path": "/data/files.db"
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.upload_dir, "/data/uploads");
        assert_eq!(config.log_dir, "/data/logs");
        assert_eq!(config.db_path, "/data/files.db");
        assert_eq!(config.max_upload_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_config_defaults_on_missing_file() {
        let config = Config::load("/nonexistent/path/config.json").unwrap();
        assert_eq!(config.upload_dir, "./uploads");
        assert_eq!(config.db_path, "./sharefile.db");
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        let result = Config::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_config_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"upload_dir": "/tmp/up"}}"#).unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.upload_dir, "/tmp/up");
        assert_eq!(config.log_dir, "./logs");
    }
}
