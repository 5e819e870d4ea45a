//! Operator configuration: which provider module to load and how to print.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Bytes of each data object shown in the table preview.
pub const DEFAULT_PREVIEW_BYTES: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Provider module used when `--module` is not given.
    pub module_path: Option<PathBuf>,
    pub format: OutputFormat,
    pub preview_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            format: OutputFormat::Table,
            preview_bytes: DEFAULT_PREVIEW_BYTES,
        }
    }
}

impl AppConfig {
    /// Loads `explicit` when given (it must exist), otherwise the per-user
    /// config file if there is one, otherwise defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "hsm-bridge", "hsm-cli")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// `--module` (or its env var) wins over the config file, which wins
    /// over the platform's eID middleware location.
    pub fn module_path(&self, cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| self.module_path.clone())
            .unwrap_or_else(|| PathBuf::from(default_module_path()))
    }
}

/// Where the Belgian eID middleware installs its PKCS#11 module.
pub fn default_module_path() -> &'static str {
    if cfg!(target_os = "macos") {
        "/Library/Belgium Identity Card/Pkcs11/libbeidpkcs11.dylib"
    } else if cfg!(windows) {
        "C:/Windows/System32/beidpkcs11.dll"
    } else {
        "/usr/lib/libbeidpkcs11.so"
    }
}
