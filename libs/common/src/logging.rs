//! Logging setup shared by the hub services
//!
//! Console output plus a daily rolling service log. Raw serial traffic
//! (target [`BUS_TRAFFIC_TARGET`]) goes to its own `{date}_{service}_bus.log`
//! so frame dumps do not drown the service log.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    filter,
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Tracing target for raw bus frames, routed to the bus log file
pub const BUS_TRAFFIC_TARGET: &str = "bus_traffic";

/// Tracing target for admin HTTP access lines
pub const API_ACCESS_TARGET: &str = "api_access";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `timestamp [LEVEL] message fields`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();
static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the log root directory
///
/// Priority: `HUB_LOG_DIR` env > `config_dir` > `"logs"`.
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| {
        std::env::var("HUB_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                config_dir
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("logs"))
            })
    });
}

/// Configured log root, falling back to the temp dir under `cargo test`
pub fn get_log_root() -> PathBuf {
    LOG_ROOT.get().cloned().unwrap_or_else(|| {
        std::env::var("HUB_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                if std::env::var("CARGO_TARGET_TMPDIR").is_ok() {
                    std::env::temp_dir().join("hub-test-logs")
                } else {
                    PathBuf::from("logs")
                }
            })
    })
}

const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

fn lock_err<T>(e: std::sync::PoisonError<T>) -> std::io::Error {
    std::io::Error::other(format!("Mutex poisoned: {}", e))
}

/// Daily rolling file writer: `{YYYYMMDD}_{service}{suffix}.log`
///
/// Rotates on date change, when the file disappears, and when the size limit
/// is reached (`{YYYYMMDD}_{service}{suffix}.N.log`).
struct DailyRollingWriter {
    stem: String,
    log_dir: PathBuf,
    current_date: Arc<Mutex<String>>,
    current_file: Arc<Mutex<Option<File>>>,
    current_size: Arc<AtomicU64>,
    max_file_size: u64,
    rotation_count: Arc<AtomicU32>,
}

impl DailyRollingWriter {
    fn new(service_name: &str, suffix: &str, log_dir: PathBuf) -> std::io::Result<Self> {
        let stem = format!("{}{}", service_name, suffix);
        let current_date = chrono::Local::now().format("%Y%m%d").to_string();
        fs::create_dir_all(&log_dir)?;

        let file = open_append(&log_dir.join(format!("{}_{}.log", current_date, stem)))?;
        let initial_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            stem,
            log_dir,
            current_date: Arc::new(Mutex::new(current_date)),
            current_file: Arc::new(Mutex::new(Some(file))),
            current_size: Arc::new(AtomicU64::new(initial_size)),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            rotation_count: Arc::new(AtomicU32::new(0)),
        })
    }

    fn rotate_by_size(&self) -> std::io::Result<()> {
        let current_date = self.current_date.lock().map_err(lock_err)?;
        let count = self.rotation_count.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self
            .log_dir
            .join(format!("{}_{}.{}.log", *current_date, self.stem, count));
        let new_file = open_append(&path)?;

        self.current_size.store(0, Ordering::SeqCst);
        *self.current_file.lock().map_err(lock_err)? = Some(new_file);
        Ok(())
    }

    fn get_writer(&self) -> std::io::Result<std::sync::MutexGuard<'_, Option<File>>> {
        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let mut current_date = self.current_date.lock().map_err(lock_err)?;

        let current_path = self
            .log_dir
            .join(format!("{}_{}.log", *current_date, self.stem));

        if *current_date != today || !current_path.exists() {
            fs::create_dir_all(&self.log_dir)?;
            let new_file = open_append(&self.log_dir.join(format!("{}_{}.log", today, self.stem)))?;
            let initial_size = new_file.metadata().map(|m| m.len()).unwrap_or(0);

            if *current_date != today {
                *current_date = today;
                self.rotation_count.store(0, Ordering::SeqCst);
            }
            self.current_size.store(initial_size, Ordering::SeqCst);
            *self.current_file.lock().map_err(lock_err)? = Some(new_file);
        }

        self.current_file.lock().map_err(lock_err)
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.current_size.load(Ordering::Relaxed) + buf.len() as u64 > self.max_file_size {
            self.rotate_by_size()?;
        }

        match *self.get_writer()? {
            Some(ref mut file) => {
                let written = file.write(buf)?;
                self.current_size
                    .fetch_add(written as u64, Ordering::Relaxed);
                Ok(written)
            },
            None => Ok(0),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match *self.get_writer()? {
            Some(ref mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Writer handle whose target can be swapped after a log reopen
#[derive(Clone)]
struct ReloadableWriter {
    inner: Arc<Mutex<Option<NonBlocking>>>,
}

impl ReloadableWriter {
    fn new(writer: NonBlocking) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    fn reload(&self, new_writer: NonBlocking) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(new_writer);
        }
    }
}

impl Write for ReloadableWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(ref mut writer) = *guard {
                return writer.write(buf);
            }
        }
        Ok(0)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(ref mut writer) = *guard {
                return writer.flush();
            }
        }
        Ok(())
    }
}

impl MakeWriter<'_> for ReloadableWriter {
    type Writer = Self;

    fn make_writer(&'_ self) -> Self::Writer {
        self.clone()
    }
}

#[derive(Clone)]
struct LogRuntime {
    service_name: String,
    log_dir: PathBuf,
}

struct FileSink {
    suffix: &'static str,
    writer: ReloadableWriter,
}

static LOG_RUNTIME: OnceLock<LogRuntime> = OnceLock::new();
static FILE_SINKS: OnceLock<Vec<FileSink>> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name (e.g. "hubsrv")
    pub service_name: String,
    /// Base directory for logs
    pub log_dir: PathBuf,
    /// Default level for the service's own targets
    pub console_level: Level,
    /// Emit JSON lines in the service file
    pub enable_json: bool,
    /// Disable ANSI colors on the console
    pub no_color: bool,
    /// Write raw bus frames to a separate file
    pub enable_bus_log: bool,
    /// Level for the bus traffic target
    pub bus_log_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: get_log_root(),
            console_level: Level::INFO,
            enable_json: false,
            no_color: false,
            enable_bus_log: true,
            bus_log_level: Level::DEBUG,
        }
    }
}

fn keep_guard(guard: WorkerGuard) {
    let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
    match guards.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }
}

fn file_sink(
    service_name: &str,
    suffix: &'static str,
    log_dir: &Path,
) -> std::io::Result<FileSink> {
    let writer = DailyRollingWriter::new(service_name, suffix, log_dir.to_path_buf())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);
    keep_guard(guard);
    Ok(FileSink {
        suffix,
        writer: ReloadableWriter::new(non_blocking),
    })
}

/// Build the initial filter string, honouring `RUST_LOG` when set
fn initial_filter(config: &LogConfig) -> String {
    let bus_level = if config.enable_bus_log {
        config.bus_log_level.as_str().to_lowercase()
    } else {
        "off".to_string()
    };

    match std::env::var("RUST_LOG") {
        Ok(env_str) if env_str.contains(BUS_TRAFFIC_TARGET) => env_str,
        Ok(env_str) => format!("{},{}={}", env_str, BUS_TRAFFIC_TARGET, bus_level),
        Err(_) => format!(
            "info,{}={},{}={}",
            config.service_name,
            config.console_level.as_str().to_lowercase(),
            BUS_TRAFFIC_TARGET,
            bus_level
        ),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(&config.log_dir)?;

    let filter_str = initial_filter(&config);
    let (reload_filter, reload_handle) = reload::Layer::new(EnvFilter::try_new(&filter_str)?);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(filter_str));

    let service_sink = file_sink(&config.service_name, "", &config.log_dir)?;
    let service_writer = service_sink.writer.clone();
    let mut sinks = vec![service_sink];

    // Console shows everything except raw frame dumps
    let console_layer = fmt::layer()
        .with_ansi(!config.no_color)
        .event_format(BracketedLevelFormat)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() != BUS_TRAFFIC_TARGET
        }))
        .boxed();

    let service_file_layer = if config.enable_json {
        fmt::layer()
            .json()
            .with_writer(service_writer)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(filter::filter_fn(|metadata| {
                metadata.target() != BUS_TRAFFIC_TARGET
            }))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(service_writer)
            .with_ansi(false)
            .event_format(BracketedLevelFormat)
            .with_filter(filter::filter_fn(|metadata| {
                metadata.target() != BUS_TRAFFIC_TARGET
            }))
            .boxed()
    };

    let bus_file_layer = if config.enable_bus_log {
        let bus_sink = file_sink(&config.service_name, "_bus", &config.log_dir)?;
        let bus_writer = bus_sink.writer.clone();
        sinks.push(bus_sink);
        Some(
            fmt::layer()
                .with_writer(bus_writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .with_filter(filter::filter_fn(|metadata| {
                    metadata.target() == BUS_TRAFFIC_TARGET
                }))
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(service_file_layer)
        .with(bus_file_layer)
        .try_init()?;

    let _ = FILE_SINKS.set(sinks);
    let _ = LOG_RUNTIME.set(LogRuntime {
        service_name: config.service_name.clone(),
        log_dir: config.log_dir.clone(),
    });

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);
    start_log_compression_task(config.log_dir, config.service_name);
    Ok(())
}

/// Reopen all log files (e.g. after external rotation)
pub fn reopen_logs_now() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = LOG_RUNTIME.get().ok_or("logging not initialized")?;
    let sinks = FILE_SINKS.get().ok_or("file sinks not initialized")?;

    for sink in sinks {
        let writer =
            DailyRollingWriter::new(&runtime.service_name, sink.suffix, runtime.log_dir.clone())?;
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);
        keep_guard(guard);
        sink.writer.reload(non_blocking);
    }

    tracing::debug!("Log reopened");
    Ok(())
}

/// Reopen logs on SIGHUP (Unix only)
pub fn enable_sighup_log_reopen() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async move {
            match signal(SignalKind::hangup()) {
                Ok(mut hup) => loop {
                    hup.recv().await;
                    if let Err(e) = reopen_logs_now() {
                        tracing::warn!("SIGHUP reopen: {}", e);
                    }
                },
                Err(e) => tracing::warn!("SIGHUP handler: {}", e),
            }
        });
    }
}

/// Replace the active filter at runtime
///
/// Accepts a bare level ("debug") or a full filter spec
/// ("info,hubsrv=debug,bus_traffic=trace").
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Current filter string
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

// ==================== Log Compression Support ====================

use tokio::time::{interval, Duration};

/// Compress week-old logs daily; drop compressed logs after a year
pub fn start_log_compression_task(log_dir: PathBuf, service_name: String) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut interval = interval(Duration::from_secs(86400));

        loop {
            interval.tick().await;
            if let Err(e) = compress_old_logs(&log_dir, &service_name).await {
                tracing::error!("Log compression error for {}: {}", service_name, e);
            }
        }
    });
}

fn is_service_log(file_name: &str, service_name: &str) -> bool {
    file_name.contains(&format!("_{}", service_name))
        && (file_name.ends_with(".log") || file_name.ends_with(".log.gz"))
}

async fn compress_old_logs(
    log_dir: &Path,
    service_name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::time::SystemTime;

    let mut entries = tokio::fs::read_dir(log_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !is_service_log(&file_name, service_name) {
            continue;
        }

        let modified = tokio::fs::metadata(&path).await?.modified()?;
        let age = SystemTime::now().duration_since(modified)?;

        if !file_name.ends_with(".gz") {
            if age > Duration::from_secs(7 * 86400) {
                compress_file(&path).await?;
                tokio::fs::remove_file(&path).await?;
                tracing::debug!("Compressed: {}", file_name);
            }
        } else if age > Duration::from_secs(365 * 86400) {
            tokio::fs::remove_file(&path).await?;
            tracing::debug!("Deleted: {}", file_name);
        }
    }

    Ok(())
}

async fn compress_file(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let buffer = tokio::fs::read(path).await?;
    let output = File::create(format!("{}.gz", path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    encoder.write_all(&buffer)?;
    encoder.finish()?;
    Ok(())
}

// ============================================================================
// HTTP API Request Logging Middleware
// ============================================================================

/// Access log middleware for the admin router
///
/// Modifying requests are logged at INFO, reads at DEBUG, both under the
/// [`API_ACCESS_TARGET`] target.
#[cfg(feature = "axum")]
pub async fn http_request_logger(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use std::time::Instant;
    use tracing::{debug, info};

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis();

    if matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE") {
        info!(
            target: API_ACCESS_TARGET,
            method = %method,
            path = %path,
            status = %status,
            duration_ms = %duration_ms,
            "HTTP request"
        );
    } else {
        debug!(
            target: API_ACCESS_TARGET,
            method = %method,
            path = %path,
            status = %status,
            duration_ms = %duration_ms,
            "HTTP request"
        );
    }

    response
}
