//! Service configuration
//!
//! Layered with figment: built-in defaults, then `config/hubsrv.yaml`, then
//! `HUBSRV_` environment variables (`__` separates nested keys, e.g.
//! `HUBSRV_SERIAL__PORT=/dev/ttyUSB0`).

use errors::{HubError, HubResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::bus::BusTiming;
use crate::forward::ForwardConfig;
use crate::notify::NotifierConfig;
use crate::transport::SerialLinkConfig;

pub const ENV_PREFIX: &str = "HUBSRV_";
pub const DEFAULT_API_PORT: u16 = 7777;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub service: ServiceSection,
    pub serial: SerialLinkConfig,
    pub bus: BusSection,
    pub notifier: NotifierConfig,
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Listener of the binary TCP API
    pub api_bind: String,
    /// Listener of the admin HTTP API
    pub admin_bind: String,
    /// Id of the locally attached router
    pub router_id: u8,
    pub log_dir: Option<String>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            api_bind: format!("0.0.0.0:{DEFAULT_API_PORT}"),
            admin_bind: "127.0.0.1:7780".to_string(),
            router_id: 1,
            log_dir: None,
        }
    }
}

/// Bus timing in config units
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub response_timeout_ms: u64,
    pub settle_ms: u64,
    pub mode_settle_ms: u64,
    pub watcher_stop_ms: u64,
    pub boot_retry_delay_ms: u64,
    pub boot_attempts: u32,
    pub mirror_cycle_secs: f64,
    pub mirror_enabled: bool,
    pub events_enabled: bool,
}

impl Default for BusSection {
    fn default() -> Self {
        let timing = BusTiming::default();
        Self {
            response_timeout_ms: timing.response_timeout.as_millis() as u64,
            settle_ms: timing.settle.as_millis() as u64,
            mode_settle_ms: timing.mode_settle.as_millis() as u64,
            watcher_stop_ms: timing.watcher_stop.as_millis() as u64,
            boot_retry_delay_ms: timing.boot_retry_delay.as_millis() as u64,
            boot_attempts: timing.boot_attempts,
            mirror_cycle_secs: timing.mirror_cycle_secs,
            mirror_enabled: timing.mirror_enabled,
            events_enabled: timing.events_enabled,
        }
    }
}

impl BusSection {
    pub fn timing(&self) -> BusTiming {
        BusTiming {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
            mode_settle: Duration::from_millis(self.mode_settle_ms),
            watcher_stop: Duration::from_millis(self.watcher_stop_ms),
            boot_retry_delay: Duration::from_millis(self.boot_retry_delay_ms),
            boot_attempts: self.boot_attempts,
            mirror_cycle_secs: self.mirror_cycle_secs,
            mirror_enabled: self.mirror_enabled,
            events_enabled: self.events_enabled,
        }
    }

    fn validate(&self) -> HubResult<()> {
        if self.response_timeout_ms == 0 {
            return Err(invalid("bus.response_timeout_ms", "must be positive"));
        }
        if self.boot_attempts == 0 {
            return Err(invalid("bus.boot_attempts", "at least one attempt is required"));
        }
        if !(0.01..=2.55).contains(&self.mirror_cycle_secs) {
            return Err(invalid(
                "bus.mirror_cycle_secs",
                "mirror cycle must be between 0.01 and 2.55 seconds",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> HubError {
    HubError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl HubConfig {
    /// Load from `path` (skipped with a warning when missing) plus environment
    pub fn load(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(HubConfig::default()));
        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        } else {
            warn!("Config file {} not found, using defaults", path.display());
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> HubResult<Self> {
        let config: HubConfig = figment
            .extract()
            .map_err(|e| HubError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HubResult<()> {
        self.api_addr()?;
        self.admin_addr()?;
        self.serial.validate()?;
        self.bus.validate()?;
        self.notifier.validate()?;
        self.forward.validate()?;
        Ok(())
    }

    pub fn api_addr(&self) -> HubResult<SocketAddr> {
        parse_addr("service.api_bind", &self.service.api_bind)
    }

    pub fn admin_addr(&self) -> HubResult<SocketAddr> {
        parse_addr("service.admin_bind", &self.service.admin_bind)
    }
}

fn parse_addr(field: &str, value: &str) -> HubResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| invalid(field, &format!("'{value}': {e}")))
}
