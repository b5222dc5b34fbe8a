//! Service bootstrap helpers: banner, logging, development env

use crate::bootstrap_args::ServiceArgs;
use crate::logging::{self, LogConfig};
use tracing::info;

/// Service metadata for startup
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Default TCP port of the service's API listener
    pub default_port: u16,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>, default_port: u16) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: description.into(),
            default_port,
        }
    }
}

pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ██╗  ██╗██╗   ██╗██████╗ ███████╗██████╗ ██╗   ██╗
 ██║  ██║██║   ██║██╔══██╗██╔════╝██╔══██╗██║   ██║
 ███████║██║   ██║██████╔╝███████╗██████╔╝██║   ██║
 ██╔══██║██║   ██║██╔══██╗╚════██║██╔══██╗╚██╗ ██╔╝
 ██║  ██║╚██████╔╝██████╔╝███████║██║  ██║ ╚████╔╝
 ╚═╝  ╚═╝ ╚═════╝ ╚═════╝ ╚══════╝╚═╝  ╚═╝  ╚═══╝
    "#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" API Port: {}", service.default_port);
}

/// Initialize logging for a service
///
/// Log root priority: `HUB_LOG_DIR` env, then `log_dir`, then `"logs"`.
pub fn init_logging(
    service: &ServiceInfo,
    args: &ServiceArgs,
    log_dir: Option<&str>,
) -> anyhow::Result<()> {
    logging::init_log_root(log_dir);

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root().join(&service.name),
        console_level: args.parse_log_level(),
        no_color: args.no_color,
        ..Default::default()
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}

/// Read `.env` into the environment in debug builds; no-op in release
pub fn load_development_env() {
    #[cfg(debug_assertions)]
    {
        if let Ok(content) = std::fs::read_to_string(".env") {
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.starts_with('#') || trimmed.is_empty() {
                    continue;
                }
                if let Some((key, value)) = trimmed.split_once('=') {
                    let key = key.trim();
                    if std::env::var(key).is_err() {
                        std::env::set_var(key, value.trim());
                    }
                }
            }
        }
    }
}
