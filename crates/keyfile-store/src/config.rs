use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SKIP_OWNER_CHECK_ENV: &str = "KEYFILE_STORE_SKIP_OWNER_CHECK";

/// The uid/gid the daemon runs as; storage files are owned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl RuntimeIdentity {
    pub fn current() -> Self {
        // SAFETY: geteuid/getegid cannot fail and touch no memory.
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self { uid, gid }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestingConfig {
    #[serde(default)]
    pub skip_owner_check: bool,
}

/// External declarative-config generator invoked after a local commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetplanConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub rootdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub keyfile_dir: PathBuf,
    pub profile_dir: Option<PathBuf>,
    #[serde(default = "default_with_extension")]
    pub with_extension: bool,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub testing: TestingConfig,
    pub netplan: Option<NetplanConfig>,
}

fn default_with_extension() -> bool {
    true
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

impl StorageConfig {
    pub fn new(keyfile_dir: impl Into<PathBuf>) -> Self {
        Self {
            keyfile_dir: keyfile_dir.into(),
            profile_dir: None,
            with_extension: default_with_extension(),
            runtime: RuntimeConfig::default(),
            testing: TestingConfig::default(),
            netplan: None,
        }
    }

    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let cfg: StorageConfig = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.keyfile_dir.is_absolute() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "keyfile_dir must be absolute: {}",
                    self.keyfile_dir.display()
                ),
            });
        }
        if let Some(p) = &self.profile_dir
            && !p.is_absolute()
        {
            return Err(ConfigError::Invalid {
                message: format!("profile_dir must be absolute: {}", p.display()),
            });
        }
        if let Some(np) = &self.netplan
            && np.command.trim().is_empty()
        {
            return Err(ConfigError::Invalid {
                message: "netplan.command must be non-empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn profile_dir(&self) -> &Path {
        self.profile_dir.as_deref().unwrap_or(&self.keyfile_dir)
    }

    /// Configured identity, falling back to the process's effective ids.
    pub fn runtime_identity(&self) -> RuntimeIdentity {
        let current = RuntimeIdentity::current();
        RuntimeIdentity {
            uid: self.runtime.uid.unwrap_or(current.uid),
            gid: self.runtime.gid.unwrap_or(current.gid),
        }
    }

    pub fn skip_owner_check(&self) -> bool {
        self.testing.skip_owner_check || env_flag(SKIP_OWNER_CHECK_ENV)
    }
}

pub fn load_storage_config(path: &Path) -> Result<StorageConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    StorageConfig::from_toml_str(&raw, path)
}

#[cfg(test)]
mod tests;
