use std::path::PathBuf;

use cfwatch::{
    Account, Credentials, Monitor, MonitorEvent, NewAccount, ProxyConfig, RefreshPolicy, Snapshot,
};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cfwatch", version, about = "Cloudflare usage monitor")]
struct Cli {
    /// Data directory holding the database and its JSON mirror
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor loop, streaming updates to the log
    Run,

    /// Refresh every account once and print the results
    Status,

    /// Manage registered accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Show or change proxy and refresh settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List accounts in display order
    List,

    /// Add an account (email + global key, or an API token)
    Add {
        name: String,

        /// Account email (global key mode)
        #[arg(long)]
        email: Option<String>,

        /// Global API key (global key mode)
        #[arg(long)]
        key: Option<String>,

        /// Scoped API token (token mode)
        #[arg(long)]
        token: Option<String>,

        /// Explicit account id; skips resolution when set
        #[arg(long)]
        account_id: Option<String>,
    },

    /// Remove the account at the given position
    Remove { index: usize },

    /// Move an account to a new position
    Move { from: usize, to: usize },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the current settings
    Show,

    /// Route API calls through a proxy
    SetProxy {
        #[arg(long)]
        host: String,

        #[arg(long)]
        port: u16,

        /// http, https or socks5
        #[arg(long, default_value = "http")]
        scheme: String,

        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Stop using a proxy
    ClearProxy,

    /// Seconds between full refreshes (30..=3600)
    SetInterval { secs: u64 },

    /// Daily request threshold used for percent readouts
    SetLimit { limit: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cfwatch=info,cfwatch_cli=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let monitor = open_monitor(cli.data_dir)?;

    match cli.command {
        Commands::Run => run(&monitor).await?,
        Commands::Status => status(&monitor).await,
        Commands::Account { command } => account(&monitor, command)?,
        Commands::Config { command } => config(&monitor, command)?,
    }

    Ok(())
}

fn open_monitor(data_dir: Option<PathBuf>) -> anyhow::Result<Monitor> {
    let monitor = match data_dir {
        Some(dir) => Monitor::open(&dir.join("cfwatch.db"), &dir.join("cfwatch.json"))?,
        None => Monitor::open_default()?,
    };
    Ok(monitor)
}

async fn run(monitor: &Monitor) -> anyhow::Result<()> {
    let accounts = monitor.registry().accounts();
    if accounts.is_empty() {
        println!("No accounts configured. Run `cfwatch account add` first.");
        return Ok(());
    }

    let policy = monitor.registry().policy();
    tracing::info!(
        accounts = accounts.len(),
        interval_secs = policy.interval_secs,
        "starting monitor"
    );

    let mut events = monitor.subscribe();
    monitor.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(MonitorEvent::FullUpdate(snapshot)) => {
                    report_snapshot(monitor, &snapshot);
                }
                Ok(MonitorEvent::AccountUpdate { name, result }) => match result {
                    Ok(stats) => tracing::info!(
                        account = %name,
                        total = stats.total_requests,
                        workers = stats.worker_requests,
                        pages = stats.page_requests,
                        "account refreshed"
                    ),
                    Err(e) => tracing::warn!(account = %name, "refresh failed: {e}"),
                },
                Ok(MonitorEvent::Error(message)) => tracing::error!("{message}"),
                // Dropped behind: skip to the live stream.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("stopping monitor");
    monitor.stop().await;
    Ok(())
}

fn report_snapshot(monitor: &Monitor, snapshot: &Snapshot) {
    let limit = monitor.registry().policy().daily_request_limit;
    for account in monitor.registry().accounts() {
        let Some(entry) = snapshot.get(&account.name) else { continue };
        match &entry.result {
            Ok(stats) => {
                let used = format!("{:.1}%", percent(stats.total_requests, limit));
                tracing::info!(
                    account = %account.name,
                    total = stats.total_requests,
                    workers = stats.worker_requests,
                    pages = stats.page_requests,
                    used = %used,
                    "usage"
                );
            }
            Err(e) => tracing::warn!(account = %account.name, "refresh failed: {e}"),
        }
    }
}

async fn status(monitor: &Monitor) {
    let accounts = monitor.registry().accounts();
    if accounts.is_empty() {
        println!("No accounts configured.");
        return;
    }

    let snapshot = monitor.aggregator().refresh_all().await;
    let limit = monitor.registry().policy().daily_request_limit;
    for account in accounts {
        let Some(entry) = snapshot.get(&account.name) else { continue };
        match &entry.result {
            Ok(stats) => println!(
                "{:<24} {:>10} requests today ({} workers, {} pages, {:.1}% of {})",
                account.name,
                stats.total_requests,
                stats.worker_requests,
                stats.page_requests,
                percent(stats.total_requests, limit),
                limit,
            ),
            Err(e) => println!("{:<24} ERROR: {e}", account.name),
        }
    }
    if let Some(latest) = snapshot.values().map(|e| e.updated_at).max() {
        let local = latest.with_timezone(&chrono::Local);
        println!("As of {}", local.format("%Y-%m-%d %H:%M:%S"));
    }
}

fn percent(total: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    total as f64 / limit as f64 * 100.0
}

fn account(monitor: &Monitor, command: AccountCommands) -> anyhow::Result<()> {
    let registry = monitor.registry();
    match command {
        AccountCommands::List => {
            let accounts = registry.accounts();
            if accounts.is_empty() {
                println!("No accounts configured.");
                return Ok(());
            }
            for (i, account) in accounts.iter().enumerate() {
                println!("{i:>3}  {}", describe(account));
            }
        }
        AccountCommands::Add { name, email, key, token, account_id } => {
            let credentials = match (email, key, token) {
                (None, None, Some(token)) => Credentials::ApiToken { token },
                (Some(email), Some(key), None) => Credentials::GlobalKey { email, key },
                _ => anyhow::bail!("pass either --email and --key, or --token"),
            };
            registry.add(NewAccount { name: name.clone(), credentials, account_id })?;
            println!("Added account {name:?}.");
        }
        AccountCommands::Remove { index } => {
            let removed = monitor.delete_account(index)?;
            println!("Removed account {:?}.", removed.name);
        }
        AccountCommands::Move { from, to } => {
            let len = registry.accounts().len();
            anyhow::ensure!(from < len && to < len, "positions must be below {len}");
            let mut order: Vec<usize> = (0..len).collect();
            let moved = order.remove(from);
            order.insert(to, moved);
            registry.reorder(&order)?;
            println!("New order:");
            for (i, name) in registry.account_names().iter().enumerate() {
                println!("{i:>3}  {name}");
            }
        }
    }
    Ok(())
}

fn describe(account: &Account) -> String {
    let mode = match &account.credentials {
        Credentials::GlobalKey { email, .. } => format!("global key ({email})"),
        Credentials::ApiToken { .. } => "api token".to_string(),
    };
    let id = match (&account.account_id, &account.cached_account_id) {
        (Some(id), _) => format!("id {id}"),
        (None, Some(id)) => format!("cached id {id}"),
        (None, None) => "id unresolved".to_string(),
    };
    format!("{:<24} {mode}, {id}", account.name)
}

fn config(monitor: &Monitor, command: ConfigCommands) -> anyhow::Result<()> {
    let registry = monitor.registry();
    match command {
        ConfigCommands::Show => {
            let policy = registry.policy();
            println!("refresh interval: {}s", policy.interval_secs);
            println!("daily request limit: {}", policy.daily_request_limit);
            match registry.proxy().url() {
                Some(url) => println!("proxy: {url}"),
                None => println!("proxy: none"),
            }
        }
        ConfigCommands::SetProxy { host, port, scheme, username, password } => {
            let proxy = ProxyConfig {
                enabled: true,
                scheme,
                host,
                port,
                username: username.unwrap_or_default(),
                password: password.unwrap_or_default(),
            };
            anyhow::ensure!(proxy.url().is_some(), "proxy host and port must be set");
            registry.set_proxy(proxy)?;
            println!("Proxy updated.");
        }
        ConfigCommands::ClearProxy => {
            registry.set_proxy(ProxyConfig::default())?;
            println!("Proxy cleared.");
        }
        ConfigCommands::SetInterval { secs } => {
            let policy = RefreshPolicy { interval_secs: secs, ..registry.policy() }.clamped();
            let clamped = policy.interval_secs != secs;
            registry.set_policy(policy.clone())?;
            if clamped {
                println!("Interval bounded to {}s.", policy.interval_secs);
            } else {
                println!("Interval set to {secs}s.");
            }
        }
        ConfigCommands::SetLimit { limit } => {
            let policy = RefreshPolicy { daily_request_limit: limit, ..registry.policy() };
            registry.set_policy(policy)?;
            println!("Daily request limit set to {limit}.");
        }
    }
    Ok(())
}
