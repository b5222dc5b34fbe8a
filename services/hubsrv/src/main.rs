//! hubsrv: bus router gateway service

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use common::service_bootstrap::{self, ServiceInfo};
use common::ServiceArgs;
use hubsrv::api::{create_routes, AdminState, ApiServer};
use hubsrv::bus::{BusLinkContext, EventSinks, ModeManager, SerialLink};
use hubsrv::config::HubConfig;
use hubsrv::forward::{ForwardRelay, ForwardTable};
use hubsrv::mirror::ModuleRegistry;
use hubsrv::notify::{LogNotifier, Notifier, WebsocketNotifier};
use hubsrv::router_status::RouterState;
use hubsrv::transport::open_serial;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "hubsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Bus router gateway",
    long_about = None
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Configuration file (default: config/hubsrv.yaml)
    #[arg(short = 'c', long, env = "HUBSRV_CONFIG")]
    config: Option<String>,

    /// Bind address of the TCP API, overrides the config file
    #[arg(short = 'b', long)]
    bind_address: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl From<Args> for ServiceArgs {
    fn from(args: Args) -> Self {
        ServiceArgs {
            log_level: args.log_level,
            config_path: args.config,
            bind_address: args.bind_address,
            no_color: args.no_color,
            validate: args.validate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    service_bootstrap::load_development_env();
    let service_args: ServiceArgs = Args::parse().into();

    let config_path = service_args.config_path_or_default("hubsrv");
    let mut config = HubConfig::load(&config_path)
        .with_context(|| format!("Loading configuration from {config_path}"))?;
    if let Some(bind) = &service_args.bind_address {
        config.service.api_bind = bind.clone();
        config.validate().context("Invalid bind address override")?;
    }

    let service_info = ServiceInfo::new(
        "hubsrv",
        "Home-automation bus router gateway",
        config.api_addr()?.port(),
    );
    service_bootstrap::init_logging(
        &service_info,
        &service_args,
        config.service.log_dir.as_deref(),
    )?;
    common::logging::enable_sighup_log_reopen();
    if !service_args.no_color {
        service_bootstrap::print_startup_banner(&service_info);
    }

    if service_args.validate {
        info!("Configuration {} is valid", config_path);
        return Ok(());
    }

    run(config).await
}

async fn run(config: HubConfig) -> anyhow::Result<()> {
    let shutdown = common::shutdown::shutdown_token();

    let transport = open_serial(&config.serial)
        .with_context(|| format!("Opening serial port {}", config.serial.port))?;
    let link = Arc::new(SerialLink::new(Arc::new(transport)));
    let ctx = Arc::new(BusLinkContext::new(link, config.bus.timing()));

    let notifier: Arc<dyn Notifier> = if config.notifier.enabled {
        info!("Forwarding events to {}", config.notifier.url);
        Arc::new(WebsocketNotifier::new(config.notifier.clone()))
    } else {
        info!("Event notifier disabled, events are only logged");
        Arc::new(LogNotifier)
    };

    let forward_table = Arc::new(ForwardTable::load(&config.forward.table_file)?);
    let relay = Arc::new(ForwardRelay::from_config(
        forward_table.clone(),
        &config.forward,
    ));
    let sinks = EventSinks {
        notifier,
        registry: Arc::new(ModuleRegistry::new()),
        router: Arc::new(RouterState::new()),
        relay: Some(relay),
    };

    let manager = Arc::new(ModeManager::new(
        ctx,
        sinks,
        config.service.router_id,
        shutdown.child_token(),
    ));
    manager
        .initialize()
        .await
        .context("Router did not answer the boot sequence")?;
    if let Err(e) = manager.start_operate().await {
        warn!("Starting Operate mode failed, staying in ClientServer: {}", e);
    }

    let api_listener = TcpListener::bind(config.api_addr()?)
        .await
        .with_context(|| format!("Binding API listener {}", config.service.api_bind))?;
    let api_server = Arc::new(ApiServer::new(manager.clone()));
    let api_handle = tokio::spawn(api_server.serve(api_listener, shutdown.child_token()));

    let admin_addr = config.admin_addr()?;
    let admin_listener = TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("Binding admin listener {admin_addr}"))?;
    let app = create_routes(AdminState {
        manager: manager.clone(),
        forward: forward_table,
    });
    info!("Admin API listening on http://{}", admin_addr);
    info!("Health check: http://{}/health", admin_addr);
    let admin_token = shutdown.child_token();
    let admin_handle = tokio::spawn(async move {
        let server = axum::serve(admin_listener, app)
            .with_graceful_shutdown(async move { admin_token.cancelled().await });
        if let Err(e) = server.await {
            error!("Admin server error: {}", e);
        }
    });

    shutdown.cancelled().await;
    info!("Shutting down");

    match api_handle.await {
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task failed: {}", e),
        Ok(Ok(())) => {},
    }
    if let Err(e) = manager.shutdown().await {
        warn!("Bus shutdown incomplete: {}", e);
    }
    if let Err(e) = admin_handle.await {
        error!("Admin server task failed: {}", e);
    }

    info!("hubsrv stopped");
    Ok(())
}
