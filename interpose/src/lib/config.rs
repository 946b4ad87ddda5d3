use ledger::{FreePolicy, LedgerError, DEFAULT_MAX_FRAMES, MAX_FRAMES_LIMIT};
use thiserror::Error;

pub const ENV_DEBUG: &str       = "SOLEAK_DEBUG";
pub const ENV_BACKTRACE: &str   = "SOLEAK_BACKTRACE";
pub const ENV_FREE_POLICY: &str = "SOLEAK_FREE_POLICY";
pub const ENV_MAX_FRAMES: &str  = "SOLEAK_MAX_FRAMES";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, got `{value}`")]
    BadFlag {
        var:    &'static str,
        value:  String,
    },
    #[error("SOLEAK_FREE_POLICY: {0}")]
    BadPolicy(#[from] LedgerError),
    #[error("SOLEAK_MAX_FRAMES: expected a frame count in 1..=64, got `{0}`")]
    BadFrames(String),
}

/// Engine settings. `init` starts from [`Config::from_env`] and lets
/// its two arguments override `debug` and `backtrace`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Log every intercepted call at `debug!`.
    pub debug:          bool,
    /// Capture call stacks for new records.
    pub backtrace:      bool,
    pub free_policy:    FreePolicy,
    pub max_frames:     usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug:          false,
            backtrace:      false,
            free_policy:    FreePolicy::default(),
            max_frames:     DEFAULT_MAX_FRAMES,
        }
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on"         => Ok(true),
        "" | "0" | "false" | "no" | "off"   => Ok(false),
        _                                   => Err(ConfigError::BadFlag { var, value: value.to_string() }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Config::from_env), reading variables through
    /// `get`. Unset variables keep their defaults.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        if let Some(v) = get(ENV_DEBUG) {
            cfg.debug = parse_flag(ENV_DEBUG, &v)?;
        }
        if let Some(v) = get(ENV_BACKTRACE) {
            cfg.backtrace = parse_flag(ENV_BACKTRACE, &v)?;
        }
        if let Some(v) = get(ENV_FREE_POLICY) {
            cfg.free_policy = v.parse()?;
        }
        if let Some(v) = get(ENV_MAX_FRAMES) {
            cfg.max_frames = match v.trim().parse::<usize>() {
                Ok(n) if (1..=MAX_FRAMES_LIMIT).contains(&n)    => n,
                _                                               => return Err(ConfigError::BadFrames(v)),
            };
        }
        Ok(cfg)
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn backtrace(mut self, on: bool) -> Self {
        self.backtrace = on;
        self
    }

    pub fn free_policy(mut self, policy: FreePolicy) -> Self {
        self.free_policy = policy;
        self
    }

    pub fn max_frames(mut self, n: usize) -> Self {
        self.max_frames = n.clamp(1, MAX_FRAMES_LIMIT);
        self
    }
}
