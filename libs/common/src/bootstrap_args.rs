//! Startup arguments shared by the hub services
//!
//! Each service defines its own clap `Args` and converts it into
//! [`ServiceArgs`], so bootstrap code never depends on service crates.

/// Common service startup arguments
#[derive(Debug, Clone)]
pub struct ServiceArgs {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Configuration file path
    pub config_path: Option<String>,
    /// API bind address override (e.g. 0.0.0.0:7777)
    pub bind_address: Option<String>,
    /// Disable colored console output and the banner
    pub no_color: bool,
    /// Only validate configuration without starting service
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            config_path: None,
            bind_address: None,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// Parse log level string to tracing::Level
    pub fn parse_log_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    /// Configuration file, falling back to `config/{service}.yaml`
    pub fn config_path_or_default(&self, service_name: &str) -> String {
        self.config_path
            .clone()
            .unwrap_or_else(|| format!("config/{}.yaml", service_name))
    }
}
