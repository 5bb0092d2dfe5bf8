//! # Configuration
//!
//! Everything a MeshX node reads at start-up, loaded from a TOML file.
//! Every field has a default so a partial file (or an empty one) yields a
//! working node.
//!
//! ## Sections
//!
//! - [`DeviceConfig`] - product identity and the unprovisioned beacon UUID
//! - [`NvsConfig`] - store location and commit stability window
//! - [`ControlConfig`] - control bus queue depth and payload slot size
//! - [`BootConfig`] - fresh-boot delay
//! - [`TxcmConfig`] - acknowledged client request queue and retry budget
//! - [`CompositionConfig`] - which element types to build and how many
//! - [`LoggingConfig`] - log level and optional log file
//! - [`ConsoleConfig`] - unit-test console
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshx::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     println!("product: {}", config.device.product_name);
//!     Ok(())
//! }
//! ```
//!
//! ## File format
//!
//! ```toml
//! [device]
//! cid = 0x7908
//! pid = 0x0004
//! product_name = "all_in_one"
//!
//! [nvs]
//! data_dir = "data/nvs"
//! save_period_ms = 1000
//!
//! [composition]
//! max_element_count = 5
//! elements = [
//!   { type = "relay_server", count = 1 },
//!   { type = "cwww_client", count = 1 },
//! ]
//! ```
//!
//! The application callbacks cannot be expressed in TOML; they are passed
//! to [`crate::node::MeshxNode::start`] directly.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::api::ENVELOPE_LEN;
use crate::composition::{ElementType, MAX_ELEMENT_COUNT};
use crate::control::{DEFAULT_MAX_PAYLOAD, DEFAULT_QUEUE_DEPTH};
use crate::models::MIN_BUS_PAYLOAD;
use crate::port::DEVICE_NAME_MAX;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub nvs: NvsConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub txcm: TxcmConfig,
    #[serde(default)]
    pub composition: CompositionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_cid")]
    pub cid: u16,
    #[serde(default = "default_pid")]
    pub pid: u16,
    #[serde(default)]
    pub vid: u16,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    /// Device UUID advertised while unprovisioned.
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
}

fn default_cid() -> u16 {
    0x7908
}

fn default_pid() -> u16 {
    0x0004
}

fn default_product_name() -> String {
    "all_in_one".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cid: default_cid(),
            pid: default_pid(),
            vid: 0,
            product_name: default_product_name(),
            uuid: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Quiet period after the last armed write before the store is flushed.
    /// 0 disables the automatic commit.
    #[serde(default = "default_save_period_ms")]
    pub save_period_ms: u32,
}

fn default_data_dir() -> String {
    "data/nvs".to_string()
}

fn default_save_period_ms() -> u32 {
    1000
}

impl Default for NvsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            save_period_ms: default_save_period_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_payload: default_max_payload(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default = "default_fresh_boot_timeout_ms")]
    pub fresh_boot_timeout_ms: u64,
}

fn default_fresh_boot_timeout_ms() -> u64 {
    1500
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            fresh_boot_timeout_ms: default_fresh_boot_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxcmConfig {
    /// Client requests that may wait behind the one awaiting its status.
    #[serde(default = "default_txcm_queue_depth")]
    pub queue_depth: usize,
    /// Resends after the first attempt before a timeout reaches the app.
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
}

fn default_txcm_queue_depth() -> usize {
    10
}

fn default_max_retries() -> u8 {
    3
}

impl Default for TxcmConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_txcm_queue_depth(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementEntry {
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionConfig {
    #[serde(default = "default_max_element_count")]
    pub max_element_count: usize,
    #[serde(default = "default_elements")]
    pub elements: Vec<ElementEntry>,
}

fn default_max_element_count() -> usize {
    MAX_ELEMENT_COUNT
}

fn default_elements() -> Vec<ElementEntry> {
    ElementType::ALL
        .iter()
        .map(|t| ElementEntry {
            element_type: *t,
            count: 1,
        })
        .collect()
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self {
            max_element_count: default_max_element_count(),
            elements: default_elements(),
        }
    }
}

impl CompositionConfig {
    /// Element count if no type folds into the root element.
    pub fn worst_case_element_count(&self) -> usize {
        1 + self.elements.iter().map(|e| e.count).sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("meshx.log".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub enabled: bool,
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let name = &self.device.product_name;
        if name.is_empty() {
            return Err(anyhow!("device.product_name must not be empty"));
        }
        if name.len() > DEVICE_NAME_MAX {
            return Err(anyhow!(
                "device.product_name is {} bytes, limit is {}",
                name.len(),
                DEVICE_NAME_MAX
            ));
        }
        if self.control.queue_depth == 0 {
            return Err(anyhow!("control.queue_depth must be at least 1"));
        }
        if self.txcm.queue_depth == 0 {
            return Err(anyhow!("txcm.queue_depth must be at least 1"));
        }
        let min_payload = MIN_BUS_PAYLOAD.max(ENVELOPE_LEN);
        if self.control.max_payload < min_payload {
            return Err(anyhow!(
                "control.max_payload {} is below the {} bytes the core publishes",
                self.control.max_payload,
                min_payload
            ));
        }
        let comp = &self.composition;
        if comp.max_element_count == 0 {
            return Err(anyhow!("composition.max_element_count must be at least 1"));
        }
        if let Some(entry) = comp.elements.iter().find(|e| e.count == 0) {
            return Err(anyhow!("composition entry {} has count 0", entry.element_type));
        }
        let worst = comp.worst_case_element_count();
        if worst > comp.max_element_count {
            return Err(anyhow!(
                "composition needs up to {} elements, max_element_count is {}",
                worst,
                comp.max_element_count
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(anyhow!("unknown logging.level '{}'", self.logging.level));
        }
        Ok(())
    }
}
