//! ---
//! helio_section: "01-core-functionality"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Shared primitives and utilities for the monitoring runtime."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono_tz::Tz;
use indexmap::IndexMap;
use tracing::{debug, error};

use crate::ini::IniDocument;

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_watchdog_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_watchdog_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_stale_data_timeout() -> Duration {
    Duration::from_secs(900)
}

fn default_filter_state_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_decrease_window() -> Duration {
    Duration::from_secs(600)
}

fn default_db_file() -> PathBuf {
    PathBuf::from("helio_history.db")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

/// Primary configuration object for the Helio runtime.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub inverter_system: InverterSystemConfig,
    pub watchdog: WatchdogConfig,
    pub filter: FilterConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    /// Instance sections in declaration order of `general.plugin_instances`.
    pub instances: IndexMap<String, InstanceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "HELIO_CONFIG";

    /// Load configuration from disk, respecting the `HELIO_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let doc = IniDocument::from_path(path)?;
        let config = Self::from_document(&doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the typed configuration from a parsed document.
    pub fn from_document(doc: &IniDocument) -> Result<Self> {
        let general = GeneralConfig::from_document(doc)?;

        let mut instances = IndexMap::new();
        for name in &general.plugin_instances {
            let section = format!("plugin_{name}");
            instances.insert(name.clone(), InstanceConfig::from_document(doc, name, &section));
        }

        Ok(Self {
            general,
            inverter_system: InverterSystemConfig::from_document(doc),
            watchdog: WatchdogConfig::from_document(doc),
            filter: FilterConfig::from_document(doc),
            database: DatabaseConfig::from_document(doc),
            logging: LoggingConfig::from_document(doc),
            instances,
        })
    }

    /// Validate structural invariants. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.general.plugin_instances.is_empty() {
            return Err(anyhow!(
                "general.plugin_instances must name at least one instance"
            ));
        }
        if self.general.poll_interval.is_zero() {
            return Err(anyhow!("general.poll_interval_seconds must be > 0"));
        }
        for (name, instance) in &self.instances {
            instance
                .validate()
                .map_err(|err| anyhow!("instance '{}': {}", name, err))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(contents: &str) -> Result<Self> {
        let doc = IniDocument::parse(contents)?;
        let config = Self::from_document(&doc)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub plugin_instances: Vec<String>,
    pub poll_interval: Duration,
    pub local_timezone: Tz,
    /// Connect attempts inside one worker cycle before the supervisor is told.
    pub max_reconnect_attempts: u32,
    pub shutdown_grace: Duration,
}

impl GeneralConfig {
    fn from_document(doc: &IniDocument) -> Result<Self> {
        let instances_raw = doc.get_str("general", "plugin_instances", "");
        let plugin_instances: Vec<String> = instances_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let tz_raw = doc.get_str("general", "local_timezone", "UTC");
        let local_timezone: Tz = tz_raw.parse().unwrap_or_else(|_| {
            error!(timezone = %tz_raw, "invalid IANA timezone, using UTC");
            chrono_tz::UTC
        });

        Ok(Self {
            plugin_instances,
            poll_interval: Duration::from_secs(doc.get_u64(
                "general",
                "poll_interval_seconds",
                default_poll_interval().as_secs(),
            )),
            local_timezone,
            max_reconnect_attempts: doc.get_u64("general", "max_reconnect_attempts", 5) as u32,
            shutdown_grace: Duration::from_secs(doc.get_u64("general", "shutdown_grace_seconds", 10)),
        })
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            plugin_instances: Vec::new(),
            poll_interval: default_poll_interval(),
            local_timezone: chrono_tz::UTC,
            max_reconnect_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Physical sizing of the installation, used for filter ceilings and
/// percent-of-capacity displays.
#[derive(Debug, Clone, Default)]
pub struct InverterSystemConfig {
    pub default_mppt_count: u32,
    pub pv_installed_capacity_w: f64,
    pub inverter_max_ac_power_w: f64,
    pub battery_usable_capacity_kwh: f64,
    pub battery_max_charge_power_w: f64,
    pub battery_max_discharge_power_w: f64,
}

impl InverterSystemConfig {
    fn from_document(doc: &IniDocument) -> Self {
        Self {
            default_mppt_count: doc.get_u64("inverter_system", "default_mppt_count", 2) as u32,
            pv_installed_capacity_w: doc.get_f64("inverter_system", "pv_installed_capacity_w", 0.0),
            inverter_max_ac_power_w: doc.get_f64("inverter_system", "inverter_max_ac_power_w", 0.0),
            battery_usable_capacity_kwh: doc.get_f64(
                "inverter_system",
                "battery_usable_capacity_kwh",
                0.0,
            ),
            battery_max_charge_power_w: doc.get_f64(
                "inverter_system",
                "battery_max_charge_power_w",
                0.0,
            ),
            battery_max_discharge_power_w: doc.get_f64(
                "inverter_system",
                "battery_max_discharge_power_w",
                0.0,
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub timeout: Duration,
    pub grace_period: Duration,
    pub max_plugin_reload_attempts: u32,
    pub stale_data_timeout: Duration,
}

impl WatchdogConfig {
    fn from_document(doc: &IniDocument) -> Self {
        Self {
            timeout: Duration::from_secs(doc.get_u64(
                "watchdog",
                "watchdog_timeout",
                default_watchdog_timeout().as_secs(),
            )),
            grace_period: Duration::from_secs(doc.get_u64(
                "watchdog",
                "watchdog_grace_period",
                default_watchdog_grace().as_secs(),
            )),
            max_plugin_reload_attempts: doc.get_u64("watchdog", "max_plugin_reload_attempts", 3)
                as u32,
            stale_data_timeout: Duration::from_secs(doc.get_u64(
                "watchdog",
                "stale_data_timeout",
                default_stale_data_timeout().as_secs(),
            )),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout: default_watchdog_timeout(),
            grace_period: default_watchdog_grace(),
            max_plugin_reload_attempts: 3,
            stale_data_timeout: default_stale_data_timeout(),
        }
    }
}

/// Adaptive filter tuning: absolute daily ceilings, confirmation counts and
/// the decrease self-correction window.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub daily_limit_grid_import_kwh: f64,
    pub daily_limit_grid_export_kwh: f64,
    pub daily_limit_battery_charge_kwh: f64,
    pub daily_limit_battery_discharge_kwh: f64,
    pub daily_limit_pv_generation_kwh: f64,
    pub daily_limit_load_consumption_kwh: f64,
    pub spike_confirmation_count: u32,
    pub decrease_window: Duration,
    pub min_consistent_samples: u32,
    pub state_ttl: Duration,
    /// Explicit per-key base rates in kWh/s; keys not listed here fall back
    /// to `daily_limit / 86400`.
    pub rate_overrides_kwh_per_s: IndexMap<String, f64>,
}

impl FilterConfig {
    fn from_document(doc: &IniDocument) -> Self {
        let mut rate_overrides_kwh_per_s = IndexMap::new();
        for (key, value) in doc.section("filter") {
            if let Some(stripped) = key.strip_prefix("rate_") {
                if let Ok(rate) = value.parse::<f64>() {
                    rate_overrides_kwh_per_s.insert(stripped.to_owned(), rate);
                }
            }
        }
        Self {
            daily_limit_grid_import_kwh: doc.get_f64("filter", "daily_limit_grid_import_kwh", 100.0),
            daily_limit_grid_export_kwh: doc.get_f64("filter", "daily_limit_grid_export_kwh", 50.0),
            daily_limit_battery_charge_kwh: doc.get_f64(
                "filter",
                "daily_limit_battery_charge_kwh",
                50.0,
            ),
            daily_limit_battery_discharge_kwh: doc.get_f64(
                "filter",
                "daily_limit_battery_discharge_kwh",
                50.0,
            ),
            daily_limit_pv_generation_kwh: doc.get_f64(
                "filter",
                "daily_limit_pv_generation_kwh",
                80.0,
            ),
            daily_limit_load_consumption_kwh: doc.get_f64(
                "filter",
                "daily_limit_load_consumption_kwh",
                120.0,
            ),
            spike_confirmation_count: doc.get_u64("filter", "spike_confirmation_count", 3) as u32,
            decrease_window: Duration::from_secs(
                doc.get_u64(
                    "filter",
                    "decrease_window_minutes",
                    default_decrease_window().as_secs() / 60,
                ) * 60,
            ),
            min_consistent_samples: doc.get_u64("filter", "min_consistent_samples", 5) as u32,
            state_ttl: Duration::from_secs(
                doc.get_u64(
                    "filter",
                    "state_ttl_minutes",
                    default_filter_state_ttl().as_secs() / 60,
                ) * 60,
            ),
            rate_overrides_kwh_per_s,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            daily_limit_grid_import_kwh: 100.0,
            daily_limit_grid_export_kwh: 50.0,
            daily_limit_battery_charge_kwh: 50.0,
            daily_limit_battery_discharge_kwh: 50.0,
            daily_limit_pv_generation_kwh: 80.0,
            daily_limit_load_consumption_kwh: 120.0,
            spike_confirmation_count: 3,
            decrease_window: default_decrease_window(),
            min_consistent_samples: 5,
            state_ttl: default_filter_state_ttl(),
            rate_overrides_kwh_per_s: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub db_file: PathBuf,
    pub power_history_interval: Duration,
    pub history_max_age_hours: u64,
    pub hourly_summary_power_threshold_w: f64,
}

impl DatabaseConfig {
    fn from_document(doc: &IniDocument) -> Self {
        Self {
            db_file: PathBuf::from(doc.get_str(
                "database",
                "db_file",
                &default_db_file().display().to_string(),
            )),
            power_history_interval: Duration::from_secs(doc.get_u64(
                "database",
                "power_history_interval_seconds",
                60,
            )),
            history_max_age_hours: doc.get_u64("database", "history_max_age_hours", 168),
            hourly_summary_power_threshold_w: doc.get_f64(
                "database",
                "hourly_summary_power_threshold_w",
                2.0,
            ),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
            power_history_interval: Duration::from_secs(60),
            history_max_age_hours: 168,
            hourly_summary_power_threshold_w: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_prefix: Option<String>,
    pub format: crate::logging::LogFormat,
}

impl LoggingConfig {
    fn from_document(doc: &IniDocument) -> Self {
        let format = match doc.get_str("logging", "format", "structured-json").as_str() {
            "pretty" => crate::logging::LogFormat::Pretty,
            _ => crate::logging::LogFormat::StructuredJson,
        };
        Self {
            directory: PathBuf::from(doc.get_str(
                "logging",
                "directory",
                &default_log_directory().display().to_string(),
            )),
            file_prefix: doc.get("logging", "file_prefix").map(str::to_owned),
            format,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            file_prefix: None,
            format: crate::logging::LogFormat::StructuredJson,
        }
    }
}

/// How a plugin instance reaches its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionKind {
    #[default]
    Tcp,
    Serial,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Tcp => "tcp",
            ConnectionKind::Serial => "serial",
        }
    }
}

/// Per-instance configuration. Communication tuning defaults follow the
/// field devices this runtime was built against; plugin-specific flags stay
/// in `raw` for the plugin constructor to interpret.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub plugin_type: String,
    pub connection: ConnectionKind,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub serial_port: String,
    pub baud_rate: u32,
    pub slave_address: u8,
    pub modbus_timeout: Duration,
    pub inter_read_delay: Duration,
    pub max_regs_per_read: u16,
    pub max_register_gap: u16,
    pub max_read_retries_per_group: u32,
    pub max_consecutive_waiting_polls: u32,
    pub startup_grace_period: Duration,
    pub mppt_detection_min_voltage: f64,
    /// Untyped section passthrough for plugin-specific keys
    /// (`deye_model_series`, `powmr_protocol_version`, ...).
    pub raw: IndexMap<String, String>,
}

impl InstanceConfig {
    fn from_document(doc: &IniDocument, name: &str, section: &str) -> Self {
        let connection = match doc.get_str(section, "connection_type", "tcp").to_ascii_lowercase().as_str()
        {
            "serial" => ConnectionKind::Serial,
            _ => ConnectionKind::Tcp,
        };
        Self {
            name: name.to_owned(),
            plugin_type: doc.get_str(section, "plugin_type", ""),
            connection,
            tcp_host: doc.get_str(section, "tcp_host", "127.0.0.1"),
            tcp_port: doc.get_u64(section, "tcp_port", 502) as u16,
            serial_port: doc.get_str(section, "serial_port", "/dev/ttyUSB0"),
            baud_rate: doc.get_u64(section, "baud_rate", 9600) as u32,
            slave_address: doc.get_u64(section, "slave_address", 1) as u8,
            modbus_timeout: Duration::from_secs(doc.get_u64(section, "modbus_timeout_seconds", 5)),
            inter_read_delay: Duration::from_millis(doc.get_u64(section, "inter_read_delay_ms", 50)),
            max_regs_per_read: doc.get_u64(section, "max_regs_per_read", 60) as u16,
            max_register_gap: doc.get_u64(section, "modbus_max_register_gap", 10) as u16,
            max_read_retries_per_group: doc.get_u64(section, "max_read_retries_per_group", 2) as u32,
            max_consecutive_waiting_polls: doc.get_u64(section, "max_consecutive_waiting_polls", 5)
                as u32,
            startup_grace_period: Duration::from_secs(doc.get_u64(
                section,
                "startup_grace_period_seconds",
                120,
            )),
            mppt_detection_min_voltage: doc.get_f64(section, "mppt_detection_min_voltage", 30.0),
            raw: doc.section(section),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.plugin_type.is_empty() {
            return Err(anyhow!("missing plugin_type"));
        }
        if !self.plugin_type.contains('.') {
            return Err(anyhow!(
                "plugin_type '{}' must be of the form category.name",
                self.plugin_type
            ));
        }
        if self.max_regs_per_read == 0 {
            return Err(anyhow!("max_regs_per_read must be > 0"));
        }
        Ok(())
    }
}
