//! supadesk - sign in to a Supabase project and view report tables.
//!
//! The session is restored from disk on start, refreshed when needed, and
//! written back after each command.

mod app;
mod render;

use std::io;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::{App, ReportSource};
use render::{render_status, render_table};
use supadesk_core::config::Config;
use supadesk_core::models::{Filter, Order, ReportQuery};

/// Log file name inside the cache directory
const LOG_FILE: &str = "supadesk.log";

#[derive(Parser)]
#[command(name = "supadesk", version, about = "Sign in to a Supabase project and view report tables")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long, env = "SUPADESK_EMAIL")]
        email: Option<String>,
        /// Store the password in the OS keychain
        #[arg(long)]
        remember: bool,
    },
    /// Sign out and discard the stored session and cached reports
    Logout {
        /// Also remove the password from the OS keychain
        #[arg(long)]
        forget: bool,
    },
    /// Show the current session state
    Status,
    /// Print a valid access token, refreshing it first if needed
    Token,
    /// Fetch a table or view and print it
    Report(ReportArgs),
}

#[derive(Args)]
struct ReportArgs {
    /// Table or view name
    table: String,
    /// Columns to return, comma separated
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,
    /// Row filter, e.g. `status=eq.open`; repeatable
    #[arg(long = "filter", value_name = "COLUMN=OP.VALUE")]
    filters: Vec<Filter>,
    /// Sort column, optionally suffixed with `.asc` or `.desc`
    #[arg(long)]
    order: Option<Order>,
    #[arg(long)]
    limit: Option<usize>,
    /// Show the cached copy without contacting the server
    #[arg(long)]
    offline: bool,
    /// Print rows as JSON instead of a table
    #[arg(long)]
    json: bool,
    /// Truncate cells to this many characters
    #[arg(long, default_value_t = 40)]
    max_width: usize,
}

impl ReportArgs {
    fn to_query(&self) -> Result<ReportQuery> {
        let mut query = ReportQuery::new(&self.table)?;
        if !self.select.is_empty() {
            query = query.select(&self.select)?;
        }
        for filter in &self.filters {
            query = query.filter(filter.clone());
        }
        if let Some(ref order) = self.order {
            query = query.order(order.clone());
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        Ok(query)
    }
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). When a log directory is
/// available the same events are also appended to a daily log file there; the
/// returned guard must stay alive until exit so the file is flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let loaded = Config::load();
    let log_dir = loaded.as_ref().ok().and_then(|c| c.cache_dir().ok());
    if let Some(ref dir) = log_dir {
        // Logging to file is optional
        let _ = std::fs::create_dir_all(dir);
    }
    let _guard = init_tracing(log_dir.as_deref());

    let mut config = loaded.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    config.apply_env();

    info!("supadesk starting");
    let mut app = App::new(config).await?;

    match cli.command {
        Command::Login { email, remember } => {
            app.login(email, remember).await?;
            let status = app.status();
            println!("{}", render_status(&status, Utc::now()).trim_end());
        }
        Command::Logout { forget } => {
            app.logout(forget).await?;
            println!("Signed out");
        }
        Command::Status => {
            print!("{}", render_status(&app.status(), Utc::now()));
        }
        Command::Token => {
            let token = app.token().await?;
            println!("{}", token.as_str());
        }
        Command::Report(args) => {
            let query = args.to_query()?;
            let (report, source) = app.report(&query, args.offline).await?;

            if let ReportSource::Cached { age } = source {
                eprintln!("Showing cached copy from {}", age);
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report.rows)?);
            } else {
                print!("{}", render_table(&report, args.max_width));
            }
        }
    }

    Ok(())
}
