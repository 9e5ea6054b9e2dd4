//! jobtrack CLI — operator interface to the status store.
//!
//! A pure consumer of the listing, lookup, kill, and clear operations;
//! it never touches the dispatcher or runs job bodies.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use jobtrack::config::Config;
use jobtrack::kv::redis::RedisKv;
use jobtrack::model::{JobId, Status, StatusRecord};
use jobtrack::store::{ListFilter, Page, StatusStore};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "jobtrack", about = "Job status tracking over a shared key-value store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List status records, most recent first
    List {
        /// Filter by exact status
        #[arg(long)]
        status: Option<String>,
        /// Filter by job-name substring
        #[arg(long)]
        name: Option<String>,
        /// Page number (1-indexed)
        #[arg(long, default_value_t = 1)]
        page: usize,
        /// Records per page
        #[arg(long, default_value_t = 25)]
        per_page: usize,
    },
    /// Show a single record
    Show {
        /// Job uuid
        uuid: String,
    },
    /// Request cooperative cancellation of a job
    Kill {
        /// Job uuid
        uuid: String,
    },
    /// Bulk-remove records
    Clear {
        /// What to clear
        #[arg(value_parser = ["all", "completed", "failed"])]
        what: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    let kv = Arc::new(RedisKv::connect(config.redis_url.expose_secret()).await?);
    let store = StatusStore::new(kv, config.status_ttl);

    let cli = Cli::parse();
    match cli.command {
        Command::List {
            status,
            name,
            page,
            per_page,
        } => cmd_list(&store, status, name, page, per_page).await,
        Command::Show { uuid } => cmd_show(&store, uuid).await,
        Command::Kill { uuid } => cmd_kill(&store, uuid).await,
        Command::Clear { what } => cmd_clear(&store, what).await,
    }
}

async fn cmd_list(
    store: &StatusStore,
    status: Option<String>,
    name: Option<String>,
    page: usize,
    per_page: usize,
) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let records = store
        .list(
            &ListFilter {
                status,
                name_contains: name,
            },
            Page {
                number: page,
                per_page,
            },
        )
        .await?;

    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<10}  {:<5}  UPDATED",
        "UUID", "NAME", "STATUS", "PCT"
    );
    println!("{}", "-".repeat(90));
    for record in &records {
        println!(
            "{:<36}  {:<16}  {:<10}  {:<5}  {}",
            record.uuid,
            record.name,
            record.status.to_string(),
            record.pct_complete(),
            record.time.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} record(s)", records.len());
    Ok(())
}

async fn cmd_show(store: &StatusStore, uuid: String) -> anyhow::Result<()> {
    let uuid: JobId = uuid.parse()?;
    match store.get(&uuid).await? {
        Some(record) => print_record(&record),
        None => println!("No record for {uuid}."),
    }
    Ok(())
}

fn print_record(record: &StatusRecord) {
    println!("UUID:        {}", record.uuid);
    println!("Name:        {}", record.name);
    println!("Status:      {}", record.status);
    println!("Message:     {}", record.message);
    println!("Progress:    {}%", record.pct_complete());
    if let (Some(num), Some(total)) = (record.num, record.total) {
        println!("Counters:    {num}/{total}");
    }
    println!("Updated:     {}", record.time);
    if let Some(started) = record.started_at {
        println!("Started:     {started}");
    }
    if let Some(parent) = record.parent_uuid {
        println!("Parent:      {parent}");
    }
    if record.retry_num > 0 {
        println!("Retries:     {}", record.retry_num);
    }
    if !record.options.is_empty() {
        println!(
            "Options:     {}",
            serde_json::Value::Object(record.options.clone())
        );
    }
    if !record.extra.is_empty() {
        println!(
            "Extra:       {}",
            serde_json::Value::Object(record.extra.clone())
        );
    }
}

async fn cmd_kill(store: &StatusStore, uuid: String) -> anyhow::Result<()> {
    let uuid: JobId = uuid.parse()?;
    store.kill(&uuid).await?;
    println!("Kill requested for {uuid}.");
    Ok(())
}

async fn cmd_clear(store: &StatusStore, what: String) -> anyhow::Result<()> {
    let cleared = match what.as_str() {
        "completed" => store.clear_completed().await?,
        "failed" => store.clear_failed().await?,
        _ => store.clear_all().await?,
    };
    println!("Cleared {cleared} record(s).");
    Ok(())
}
