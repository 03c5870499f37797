use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use mirage_core::{
    load_mirage_config, BehaviorEngine, ChromiumDriver, DeviceProfile, DeviceRegistry,
    MirageConfig, Orchestrator, ProxyPool, ProxyStats, RotationPolicy, SessionRecord,
    SessionRequest, SessionSummary, SqliteEventStore, StoreStatistics,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] mirage_core::ConfigError),
    #[error("behavior error: {0}")]
    Behavior(#[from] mirage_core::BehaviorError),
    #[error("session error: {0}")]
    Session(#[from] mirage_core::SessionError),
    #[error("store error: {0}")]
    Store(#[from] mirage_core::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0} configuration check(s) failed")]
    ChecksFailed(usize),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Mirage session engine control interface", long_about = None)]
pub struct Cli {
    /// Path to the main mirage.toml
    #[arg(long, default_value = "configs/mirage.toml")]
    pub config: PathBuf,
    /// Alternative path for the events database
    #[arg(long)]
    pub events_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs one or more browsing sessions
    Run(RunArgs),
    /// Prints aggregate statistics from the event store
    Stats,
    /// Lists recently finished sessions
    Sessions(SessionsArgs),
    /// Lists the device catalog
    Devices,
    /// Validates the configuration and its referenced resources
    #[command(name = "check-config")]
    CheckConfig,
    /// Generates shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of sessions to run
    #[arg(long, default_value_t = 1)]
    pub count: usize,
    /// Search query; sessions start from a search-results page
    #[arg(long, conflicts_with = "url")]
    pub query: Option<String>,
    /// Target URL; sessions navigate straight to it
    #[arg(long)]
    pub url: Option<String>,
    /// Proxy identifier to use, bypassing pool rotation
    #[arg(long)]
    pub proxy: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    /// Maximum number of sessions to list
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing();

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "miragectl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let report = context.run_sessions(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Stats => {
            let report = context.stats()?;
            render(&report, cli.format)?;
        }
        Commands::Sessions(args) => {
            let report = context.sessions(args)?;
            render(&report, cli.format)?;
        }
        Commands::Devices => {
            let report = context.devices();
            render(&report, cli.format)?;
        }
        Commands::CheckConfig => {
            let report = context.check_config();
            render(&report, cli.format)?;
            let failures = report
                .entries
                .iter()
                .filter(|entry| matches!(entry.status, CheckStatus::Error))
                .count();
            if failures > 0 {
                return Err(AppError::ChecksFailed(failures));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    config: MirageConfig,
    config_path: PathBuf,
    events_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_mirage_config(&config_path)?;
        let events_db = cli
            .events_db
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.observability.events_db));
        Ok(Self {
            config,
            config_path,
            events_db,
        })
    }

    async fn run_sessions(&self, args: &RunArgs) -> Result<RunReport> {
        let behavior = BehaviorEngine::new(self.config.behavior.clone())?;
        let devices = DeviceRegistry::from_config(&self.config.devices);
        let pool = Arc::new(ProxyPool::from_config(&self.config.pool));
        let policy = RotationPolicy::from_name(&self.config.pool.rotation_policy);
        let driver = Arc::new(ChromiumDriver::new(self.config.driver.clone()));
        let timeout = Duration::from_secs(self.config.driver.navigation_timeout_s);
        let orchestrator = Arc::new(Orchestrator::new(
            driver,
            Arc::clone(&pool),
            devices,
            behavior,
            policy,
            timeout,
        ));

        if let Some(parent) = self.events_db.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = SqliteEventStore::new(&self.events_db)?;
        store.initialize()?;
        orchestrator.register_sink(Box::new(store.clone()));

        {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling in-flight sessions");
                    orchestrator.shutdown();
                }
            });
        }

        let mut sessions = Vec::new();
        for _ in 0..args.count {
            let request = match (&args.url, &args.query) {
                (Some(url), _) => SessionRequest::url(url.clone()),
                (None, Some(query)) => SessionRequest::query(query.clone()),
                (None, None) => SessionRequest::random_query(),
            };
            let request = match &args.proxy {
                Some(proxy) => request.with_proxy(proxy.clone()),
                None => request,
            };
            let record = orchestrator.run_session(request).await?;
            store.save_session(&record)?;
            sessions.push(SessionOutcome::from_record(&record));
        }

        let succeeded = sessions.iter().filter(|s| s.success).count();
        Ok(RunReport {
            succeeded,
            failed: sessions.len() - succeeded,
            sessions,
            pool: pool.stats(),
        })
    }

    fn stats(&self) -> Result<StatsReport> {
        let store = self.open_store()?;
        Ok(StatsReport {
            statistics: store.statistics()?,
            recent: store.recent_sessions(5)?,
        })
    }

    fn sessions(&self, args: &SessionsArgs) -> Result<SessionList> {
        let store = self.open_store()?;
        Ok(SessionList {
            rows: store.recent_sessions(args.limit)?,
        })
    }

    fn devices(&self) -> DeviceList {
        DeviceList {
            rows: DeviceRegistry::from_config(&self.config.devices).all(),
        }
    }

    fn check_config(&self) -> CheckReport {
        let mut entries = Vec::new();

        entries.push(CheckEntry::ok(
            "config",
            format!("{}", self.config_path.display()),
        ));

        match BehaviorEngine::new(self.config.behavior.clone()) {
            Ok(_) => entries.push(CheckEntry::ok("behavior", "parameters valid".to_string())),
            Err(err) => entries.push(CheckEntry::error("behavior", err.to_string())),
        }

        let devices = DeviceRegistry::from_config(&self.config.devices);
        if devices.is_empty() {
            entries.push(CheckEntry::error(
                "devices",
                "device catalog is empty".to_string(),
            ));
        } else {
            entries.push(CheckEntry::ok(
                "devices",
                format!("{} profile(s)", devices.len()),
            ));
        }

        let pool = ProxyPool::from_config(&self.config.pool);
        if pool.is_empty() {
            entries.push(CheckEntry::warn(
                "pool",
                "no proxies configured and synthetic pool disabled".to_string(),
            ));
        } else {
            entries.push(CheckEntry::ok("pool", format!("{} record(s)", pool.len())));
        }

        let configured = self.config.pool.rotation_policy.to_lowercase();
        let resolved = RotationPolicy::from_name(&configured);
        if resolved.to_string() == configured {
            entries.push(CheckEntry::ok("rotation_policy", resolved.to_string()));
        } else {
            entries.push(CheckEntry::warn(
                "rotation_policy",
                format!("unknown policy '{configured}', {resolved} will be used"),
            ));
        }

        let executable = Path::new(&self.config.driver.executable_path);
        if executable.exists() {
            entries.push(CheckEntry::ok(
                "browser",
                format!("{}", executable.display()),
            ));
        } else {
            entries.push(CheckEntry::warn(
                "browser",
                format!("{} not found", executable.display()),
            ));
        }

        entries.push(self.check_events_db());

        CheckReport { entries }
    }

    fn check_events_db(&self) -> CheckEntry {
        if !self.events_db.exists() {
            return CheckEntry::warn(
                "events_db",
                format!("{} not created yet", self.events_db.display()),
            );
        }
        let store = match SqliteEventStore::builder()
            .path(&self.events_db)
            .read_only(true)
            .build()
        {
            Ok(store) => store,
            Err(err) => return CheckEntry::error("events_db", err.to_string()),
        };
        match store.statistics() {
            Ok(stats) => CheckEntry::ok(
                "events_db",
                format!("{} session(s) recorded", stats.total_sessions),
            ),
            Err(err) => CheckEntry::error("events_db", err.to_string()),
        }
    }

    fn open_store(&self) -> Result<SqliteEventStore> {
        let store = SqliteEventStore::builder()
            .path(&self.events_db)
            .read_only(true)
            .create_if_missing(false)
            .build()?;
        Ok(store)
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub succeeded: usize,
    pub failed: usize,
    pub sessions: Vec<SessionOutcome>,
    pub pool: Vec<ProxyStats>,
}

#[derive(Debug, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub device: String,
    pub proxy: Option<String>,
    pub target_url: String,
    pub success: bool,
    pub duration_s: f64,
    pub clicks: usize,
}

impl SessionOutcome {
    fn from_record(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            device: record.device.clone(),
            proxy: record.proxy.clone(),
            target_url: record.target_url.clone(),
            success: record.success,
            duration_s: record.duration_s,
            clicks: record
                .events
                .iter()
                .filter(|event| event.kind() == "click")
                .count(),
        }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Sessions: {} succeeded, {} failed",
            self.succeeded, self.failed
        )];
        for session in &self.sessions {
            let status = if session.success { "ok" } else { "failed" };
            lines.push(format!(
                "  - {} [{status}] {} via {} ({:.1}s, {} click(s))",
                session.session_id,
                session.target_url,
                session.proxy.as_deref().unwrap_or("direct"),
                session.duration_s,
                session.clicks,
            ));
        }
        lines.push("Pool:".to_string());
        for proxy in &self.pool {
            lines.push(format!(
                "  - {} [{}] used {} times, {:.0}% success",
                proxy.id,
                proxy.health,
                proxy.use_count,
                proxy.success_rate * 100.0
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub statistics: StoreStatistics,
    pub recent: Vec<SessionSummary>,
}

impl DisplayFallback for StatsReport {
    fn display(&self) -> String {
        let stats = &self.statistics;
        let mut lines = vec![
            format!("Total sessions: {}", stats.total_sessions),
            format!(
                "Succeeded: {} ({:.0}%)",
                stats.successful_sessions,
                stats.success_rate * 100.0
            ),
            format!("Failed: {}", stats.failed_sessions),
            format!("Clicks: {}", stats.total_clicks),
            format!("Average duration: {:.1}s", stats.average_duration_s),
        ];
        if !self.recent.is_empty() {
            lines.push("Recent:".to_string());
            for session in &self.recent {
                lines.push(format_summary(session));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<SessionSummary>,
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No sessions recorded".to_string();
        }
        self.rows
            .iter()
            .map(format_summary)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn format_summary(session: &SessionSummary) -> String {
    let status = if session.success { "ok" } else { "failed" };
    format!(
        "  - {} [{status}] {} on {} ({:.1}s)",
        session.session_id, session.target_url, session.device, session.duration_s
    )
}

#[derive(Debug, Serialize)]
pub struct DeviceList {
    pub rows: Vec<DeviceProfile>,
}

impl DisplayFallback for DeviceList {
    fn display(&self) -> String {
        self.rows
            .iter()
            .map(|profile| {
                format!(
                    "  - {} [{}] {}x{}",
                    profile.name, profile.class, profile.viewport_width, profile.viewport_height
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Serialize)]
pub struct CheckEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckEntry {
    fn ok(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Ok,
            detail,
        }
    }

    fn warn(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            detail,
        }
    }

    fn error(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Error,
            detail,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub entries: Vec<CheckEntry>,
}

impl DisplayFallback for CheckReport {
    fn display(&self) -> String {
        self.entries
            .iter()
            .map(|entry| {
                let label = match entry.status {
                    CheckStatus::Ok => "OK",
                    CheckStatus::Warn => "WARN",
                    CheckStatus::Error => "ERROR",
                };
                format!("  [{label}] {}: {}", entry.name, entry.detail)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
