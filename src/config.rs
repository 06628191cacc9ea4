/**
 * @module config
 * @description Configuration management for the shopfloor services
 *
 * This module provides a flexible configuration system with file-based and
 * default configurations. Core semantics depend on only two things: the
 * store location and the gateway URL used for inter-service calls; the
 * remaining sections tune the HTTP listener and the recovery sweeper.
 *
 * ## Configuration Loading Strategy
 *
 * The `load_config()` function implements a smart search algorithm:
 * 1. Use the explicitly provided path, if any
 * 2. Otherwise start from the executable's directory
 * 3. Search up to 3 parent directories for config.yaml
 * 4. Fall back to hardcoded defaults if no file found
 *
 * This supports development (config.yaml in the project root), testing
 * (explicit path with a temp data dir), and production (config.yaml
 * alongside the executable).
 *
 * ## Configuration Structures
 *
 * ### BackendConfig
 * - `port`: Base port for the HTTP listener (default: 8000)
 * - `max_port_attempts`: Port search range (default: 10)
 *
 * When the base port is busy, the server tries port+1, port+2, etc., up to
 * `max_port_attempts`, enabling several instances during development.
 *
 * ### GatewayConfig
 * - `url`: Base URL all inter-service calls are addressed to (default:
 *   `http://127.0.0.1:8000`). In all-in-one mode this is the process's own
 *   listener; in split deployments it is the reverse proxy in front of the
 *   services.
 * - `request_timeout_secs`: Per-hop timeout (default: 2)
 * - `checkout_timeout_secs`: Whole-checkout budget (default: 10)
 *
 * ### StorageConfig
 * - `data_dir`: Directory holding one sled database per service
 *   (default: "data")
 *
 * ### RecoveryConfig
 * - `window_minutes`: Look-back window for the startup sweep (default: 5)
 * - `quiescence_secs`: A log group is only swept once its newest record is
 *   at least this old, so a live handler's records are never deleted out
 *   from under it (default: 30)
 * - `max_compensation_attempts`: Bound on re-posting a failed stock
 *   compensation before the group is left for the next pass (default: 10)
 * - `sweep_on_startup`: Run a recovery pass when a service boots
 *   (default: true)
 *
 * ## Error Handling
 *
 * Configuration loading is resilient: missing file or parse errors are
 * logged and defaults are used, prioritizing service availability over
 * configuration perfection.
 */

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

// Configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_checkout_timeout_secs")]
    pub checkout_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_quiescence_secs")]
    pub quiescence_secs: i64,
    #[serde(default = "default_max_compensation_attempts")]
    pub max_compensation_attempts: u32,
    #[serde(default = "default_sweep_on_startup")]
    pub sweep_on_startup: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_max_port_attempts() -> u16 {
    10
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    2
}

fn default_checkout_timeout_secs() -> u64 {
    10
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_window_minutes() -> i64 {
    5
}

fn default_quiescence_secs() -> i64 {
    30
}

fn default_max_compensation_attempts() -> u32 {
    10
}

fn default_sweep_on_startup() -> bool {
    true
}

// Default configuration
impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendConfig::default(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            port: default_port(),
            max_port_attempts: default_max_port_attempts(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            url: default_gateway_url(),
            request_timeout_secs: default_request_timeout_secs(),
            checkout_timeout_secs: default_checkout_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            window_minutes: default_window_minutes(),
            quiescence_secs: default_quiescence_secs(),
            max_compensation_attempts: default_max_compensation_attempts(),
            sweep_on_startup: default_sweep_on_startup(),
        }
    }
}

// Load configuration from file
pub fn load_config(config_path: Option<&str>) -> Config {
    if let Some(path) = config_path {
        return load_config_file(Path::new(path)).unwrap_or_default();
    }

    // Determine the executable directory
    let exe_path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("."));
    let exe_dir = exe_path.parent().unwrap_or_else(|| Path::new("."));

    // Try to find config.yaml in parent directories
    let mut search_dir = PathBuf::from(exe_dir);
    let mut found = false;

    // First check if config exists in the current directory
    if search_dir.join("config.yaml").exists() {
        found = true;
    } else {
        // Try up to 3 parent directories
        for _ in 0..3 {
            search_dir = match search_dir.parent() {
                Some(parent) => parent.to_path_buf(),
                None => break,
            };

            if search_dir.join("config.yaml").exists() {
                found = true;
                break;
            }
        }
    }

    if found {
        if let Some(config) = load_config_file(&search_dir.join("config.yaml")) {
            return config;
        }
    }

    // If we get here, use default configuration
    debug!("📄 Using default configuration");
    Config::default()
}

fn load_config_file(path: &Path) -> Option<Config> {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str(&contents) {
            Ok(config) => {
                debug!("📄 Loaded configuration from {:?}", path);
                Some(config)
            }
            Err(e) => {
                error!("Error parsing {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            error!("Error reading {:?}: {}", path, e);
            None
        }
    }
}
