use crate::dispatcher::{MismatchPolicy, Mode};
use crate::errors::FixtureError;
use crate::logging::init_run_logger;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type EnvMap = BTreeMap<String, String>;

pub const MODE_ENV: &str = "REPLAYFIX_MODE";
pub const DIR_ENV: &str = "REPLAYFIX_DIR";
pub const MISMATCH_ENV: &str = "REPLAYFIX_ON_MISMATCH";

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub mode: Option<Mode>,
    pub dir: Option<PathBuf>,
    pub on_mismatch: Option<MismatchPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureConfig {
    pub mode: Mode,
    pub dir: PathBuf,
    pub on_mismatch: MismatchPolicy,
    pub log_path: Option<PathBuf>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Live,
            dir: PathBuf::from("fixtures"),
            on_mismatch: MismatchPolicy::Warn,
            log_path: None,
        }
    }
}

impl FixtureConfig {
    /// `dir` made absolute against `base` when it is relative.
    pub fn resolved_dir(&self, base: &Path) -> PathBuf {
        absolutize_path(base, &self.dir)
    }

    /// Starts the process run logger when `log_path` is set. Returns whether
    /// a logger was installed.
    pub fn init_logging(&self, base: &Path) -> Result<bool, FixtureError> {
        let Some(log_path) = &self.log_path else {
            return Ok(false);
        };
        init_run_logger(absolutize_path(base, log_path))?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialConfigFile {
    fixtures: Option<PartialFixtureConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialFixtureConfig {
    mode: Option<Mode>,
    dir: Option<PathBuf>,
    on_mismatch: Option<MismatchPolicy>,
    log_path: Option<PathBuf>,
}

/// Defaults, then the TOML file, then the environment, then `overrides`.
pub fn load_config(
    overrides: &ConfigOverrides,
    env: &EnvMap,
    fs: &dyn FileSystem,
) -> Result<FixtureConfig, FixtureError> {
    let mut cfg = FixtureConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialConfigFile = toml::from_str(&file_contents)
            .map_err(|e| FixtureError::ConfigParse(e.to_string()))?;
        if let Some(fixtures) = partial.fixtures {
            merge_partial_config(&mut cfg, fixtures);
        }
    }

    apply_env(&mut cfg, env)?;
    apply_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// `load_config` against the real filesystem and process environment.
pub fn load_process_config(config_path: Option<PathBuf>) -> Result<FixtureConfig, FixtureError> {
    let env = std::env::vars().collect::<EnvMap>();
    load_config(
        &ConfigOverrides {
            config_path,
            ..ConfigOverrides::default()
        },
        &env,
        &crate::runtime::ProductionFileSystem,
    )
}

fn merge_partial_config(cfg: &mut FixtureConfig, partial: PartialFixtureConfig) {
    if let Some(mode) = partial.mode {
        cfg.mode = mode;
    }
    if let Some(dir) = partial.dir {
        cfg.dir = dir;
    }
    if let Some(on_mismatch) = partial.on_mismatch {
        cfg.on_mismatch = on_mismatch;
    }
    if let Some(log_path) = partial.log_path {
        cfg.log_path = Some(log_path);
    }
}

fn apply_env(cfg: &mut FixtureConfig, env: &EnvMap) -> Result<(), FixtureError> {
    if let Some(mode) = non_empty(env, MODE_ENV) {
        cfg.mode = mode.parse()?;
    }
    if let Some(dir) = non_empty(env, DIR_ENV) {
        cfg.dir = PathBuf::from(dir);
    }
    if let Some(policy) = non_empty(env, MISMATCH_ENV) {
        cfg.on_mismatch = policy.parse()?;
    }
    Ok(())
}

fn non_empty<'a>(env: &'a EnvMap, key: &str) -> Option<&'a str> {
    env.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn apply_overrides(cfg: &mut FixtureConfig, overrides: &ConfigOverrides) {
    if let Some(mode) = overrides.mode {
        cfg.mode = mode;
    }
    if let Some(dir) = &overrides.dir {
        cfg.dir = dir.clone();
    }
    if let Some(on_mismatch) = overrides.on_mismatch {
        cfg.on_mismatch = on_mismatch;
    }
}

fn validate_config(cfg: &FixtureConfig) -> Result<(), FixtureError> {
    if cfg.dir.as_os_str().is_empty() {
        return Err(FixtureError::InvalidConfig(
            "fixtures.dir must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}
