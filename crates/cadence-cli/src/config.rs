//! Credential and connection configuration for the CLI.
//!
//! Tuning knobs live in the environment (see `cadence_core::config`); this
//! module resolves the pieces with secrets in them through the chain:
//! CLI flag > env var > config file > error.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub api: ApiSection,
    #[serde(default)]
    pub model: ModelSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiSection {
    /// Base URL of the scheduler façade (without the /api suffix).
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Config directory, always in XDG layout: `$XDG_CONFIG_HOME/cadence` or
/// `~/.config/cadence`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("cadence");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("cadence")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Errors if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Write the config file (0600 on Unix), creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved connection settings.
#[derive(Debug)]
pub struct Connection {
    pub api_url: String,
    pub api_token: Option<String>,
    pub model_api_key: String,
    pub model_base_url: Option<String>,
}

impl Connection {
    /// Resolve using the chain CLI flag > env var > config file > error.
    pub fn resolve(cli_api_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let api_url = if let Some(url) = cli_api_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("CADENCE_API_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.api.url.clone()
        } else {
            bail!(
                "scheduler api url not found; set CADENCE_API_URL or run `cadence init` to \
                 create a config file"
            );
        };

        let api_token = std::env::var("CADENCE_API_TOKEN")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.api.token.clone()));

        let model_api_key = if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            key
        } else if let Some(key) = file_config
            .as_ref()
            .and_then(|c| c.model.api_key.clone())
        {
            key
        } else {
            bail!("model api key not found; set OPENAI_API_KEY or add it to the config file");
        };

        let model_base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .or_else(|| file_config.as_ref().and_then(|c| c.model.base_url.clone()));

        Ok(Self {
            api_url,
            api_token,
            model_api_key,
            model_base_url,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    fn lock_env() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn clear_env() {
        for key in [
            "CADENCE_API_URL",
            "CADENCE_API_TOKEN",
            "OPENAI_API_KEY",
            "OPENAI_BASE_URL",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn config_roundtrip() {
        let original = ConfigFile {
            api: ApiSection {
                url: "http://localhost:3000".to_string(),
                token: Some("secret".to_string()),
            },
            model: ModelSection {
                api_key: Some("sk-test".to_string()),
                base_url: None,
            },
        };
        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.api.url, original.api.url);
        assert_eq!(loaded.api.token, original.api.token);
        assert_eq!(loaded.model.api_key, original.model.api_key);
    }

    #[test]
    fn cli_flag_overrides_env() {
        let _lock = lock_env();
        clear_env();

        unsafe {
            std::env::set_var("CADENCE_API_URL", "http://env:3000");
            std::env::set_var("OPENAI_API_KEY", "sk-env");
        }

        let connection = Connection::resolve(Some("http://cli:3000")).unwrap();
        assert_eq!(connection.api_url, "http://cli:3000");
        assert_eq!(connection.model_api_key, "sk-env");

        clear_env();
    }

    #[test]
    fn resolve_errors_without_api_url() {
        let _lock = lock_env();
        clear_env();

        // Point HOME and XDG_CONFIG_HOME at an empty temp dir so no real
        // config file leaks into the test.
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe {
            std::env::set_var("HOME", tmp.path());
            std::env::remove_var("XDG_CONFIG_HOME");
            std::env::set_var("OPENAI_API_KEY", "sk-test");
        }

        let result = Connection::resolve(None);

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
        clear_env();

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("scheduler api url not found")
        );
    }

    #[test]
    fn resolve_errors_without_model_key() {
        let _lock = lock_env();
        clear_env();

        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe {
            std::env::set_var("HOME", tmp.path());
            std::env::remove_var("XDG_CONFIG_HOME");
        }

        let result = Connection::resolve(Some("http://cli:3000"));

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }
        clear_env();

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("model api key not found")
        );
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("cadence/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
