use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Deadline for proxy-originated requests, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Whether the control-plane HTTP endpoint is started.
    #[serde(default = "default_control_plane")]
    pub control_plane: bool,

    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            control_plane: default_control_plane(),
            debug: false,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_control_plane() -> bool {
    true
}

pub fn get_config_path() -> PathBuf {
    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE").expect("USERPROFILE environment variable not set")
    } else {
        std::env::var("HOME").expect("HOME environment variable not set")
    };

    PathBuf::from(home)
        .join(".config")
        .join("lsproxy")
        .join("config.toml")
}

pub fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let config_path = get_config_path();

    if !config_path.exists() {
        debug!("Config file does not exist, using defaults");
        return Ok(Config::default());
    }

    debug!("Loading config from: {:?}", config_path);

    let content = fs::read_to_string(&config_path)?;
    let config: Config = toml::from_str(&content).map_err(|e| {
        format!(
            "invalid configuration in {:?}: {}\n\nexpected keys: request_timeout_ms, control_plane, debug",
            config_path, e
        )
    })?;

    debug!("Loaded config: {:?}", config);
    Ok(config)
}
