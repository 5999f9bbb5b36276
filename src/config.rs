//! Configuration for Stockflow, read from `.stockflow/stockflow.toml`.
//!
//! Layering is file → environment → CLI flags. Missing files and missing
//! sections fall back to defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 3141
//! db_path = ".stockflow/stockflow.db"
//! dev_mode = false
//!
//! [erp]
//! base_url = "https://sap.example.com:50000"
//! company_db = "SBODEMO"
//! username = "manager"
//! password = "secret"
//! timeout_secs = 10
//! cache_ttl_secs = 300
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [client]
//! base_url = "http://127.0.0.1:3141"
//! user_id = 1
//! role = "user"
//! page_size = 10
//!
//! [[catalog.items]]
//! code = "ITM-1"
//! description = "Handheld scanner"
//! serial_tracked = true
//!
//! [[catalog.serials]]
//! serial = "SN-100"
//! item_code = "ITM-1"
//! location = "WH-A"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stockflow_common::{BinLocation, CatalogItem, PAGE_SIZES, Role, Warehouse};

use crate::warehouse::erp::CatalogSerial;

pub const CONFIG_DIR: &str = ".stockflow";
pub const CONFIG_FILE: &str = "stockflow.toml";

const REDACTED: &str = "********";

/// Default config file location relative to the working directory.
pub fn default_config_path() -> PathBuf {
    Path::new(CONFIG_DIR).join(CONFIG_FILE)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StockflowConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub erp: ErpConfig,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for local front-end development.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    Path::new(CONFIG_DIR).join("stockflow.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// SAP Business One Service Layer connection. Without a `base_url` the
/// server runs against the offline `[catalog]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How long resolved item descriptions stay cached.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Service Layer installs commonly use self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            company_db: None,
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for a daily-rolling log file, in addition to stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// Settings for the CLI acting as a sync client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_api_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_api_url() -> String {
    format!("http://127.0.0.1:{}", default_port())
}

fn default_page_size() -> u32 {
    stockflow_common::DEFAULT_PAGE_SIZE
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            user_id: None,
            role: None,
            page_size: default_page_size(),
        }
    }
}

/// Offline catalog served when no ERP is configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub items: Vec<CatalogItem>,
    #[serde(default)]
    pub serials: Vec<CatalogSerial>,
    #[serde(default)]
    pub warehouses: Vec<Warehouse>,
    #[serde(default)]
    pub bins: Vec<BinLocation>,
}

impl StockflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse stockflow.toml")
    }

    /// Load from `path`, or defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).context("Failed to serialize stockflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STOCKFLOW_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`. Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("STOCKFLOW_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid STOCKFLOW_PORT '{}'", port))?;
        }
        if let Some(path) = get("STOCKFLOW_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(url) = get("STOCKFLOW_ERP_URL") {
            self.erp.base_url = Some(url);
        }
        if let Some(user) = get("STOCKFLOW_ERP_USER") {
            self.erp.username = Some(user);
        }
        if let Some(password) = get("STOCKFLOW_ERP_PASSWORD") {
            self.erp.password = Some(password);
        }
        if let Some(url) = get("STOCKFLOW_API_URL") {
            self.client.base_url = url;
        }
        Ok(())
    }

    /// Copy safe to print: the ERP password is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.erp.password.is_some() {
            copy.erp.password = Some(REDACTED.to_string());
        }
        copy
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !PAGE_SIZES.contains(&self.client.page_size) {
            warnings.push(format!(
                "client.page_size {} is not one of {:?}",
                self.client.page_size, PAGE_SIZES
            ));
        }

        if !(self.client.base_url.starts_with("http://")
            || self.client.base_url.starts_with("https://"))
        {
            warnings.push(format!(
                "client.base_url '{}' should start with http:// or https://",
                self.client.base_url
            ));
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "logging.level '{}' is not a valid filter directive",
                self.logging.level
            ));
        }

        if self.erp.base_url.is_some() {
            for (name, value) in [
                ("company_db", &self.erp.company_db),
                ("username", &self.erp.username),
                ("password", &self.erp.password),
            ] {
                if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                    warnings.push(format!("erp.base_url is set but erp.{} is missing", name));
                }
            }
        } else if self.catalog.items.is_empty() {
            warnings.push(
                "No ERP configured and the offline catalog is empty; no item can be added"
                    .to_string(),
            );
        }

        for serial in &self.catalog.serials {
            if !self.catalog.items.iter().any(|i| i.code == serial.item_code) {
                warnings.push(format!(
                    "catalog serial '{}' refers to unknown item '{}'",
                    serial.serial, serial.item_code
                ));
            }
        }

        warnings
    }

    /// Starter configuration written by `config init`, with a small
    /// offline catalog so the server is usable without an ERP.
    pub fn sample() -> Self {
        let mut config = Self::default();
        config.catalog = CatalogConfig {
            items: vec![
                CatalogItem {
                    code: "ITM-1".to_string(),
                    description: "Handheld barcode scanner".to_string(),
                    serial_tracked: true,
                    batch_tracked: false,
                },
                CatalogItem {
                    code: "ITM-2".to_string(),
                    description: "Shrink wrap roll".to_string(),
                    serial_tracked: false,
                    batch_tracked: true,
                },
            ],
            serials: ["SN-100", "SN-101", "SN-102"]
                .into_iter()
                .map(|s| CatalogSerial {
                    serial: s.to_string(),
                    item_code: "ITM-1".to_string(),
                    location: "WH-A".to_string(),
                    issued: false,
                    system_number: None,
                })
                .collect(),
            warehouses: vec![
                Warehouse {
                    code: "WH-A".to_string(),
                    name: "Main warehouse".to_string(),
                },
                Warehouse {
                    code: "WH-B".to_string(),
                    name: "Overflow warehouse".to_string(),
                },
            ],
            bins: vec![BinLocation {
                code: "WH-A-01".to_string(),
                warehouse: "WH-A".to_string(),
            }],
        };
        config
    }
}
