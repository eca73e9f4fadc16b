use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobpath_discovery::{default_sources, discover, DiscoveryQuery};
use jobpath_mailbox::{GmailMailbox, MailboxProvider};
use jobpath_store::{MemoryNotificationSink, MemoryStore, NotificationSink, Store};
use jobpath_sync::{SyncConfig, SyncEngine, SyncOptions};
use jobpath_web::{serve_from_env, AppState, GmailFactory};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "jobpath")]
#[command(about = "JobPath inbox-to-pipeline sync and job discovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one mailbox sync pass for a user and print the outcome.
    Sync {
        #[arg(long)]
        user_id: Uuid,
        /// Gmail OAuth access token; falls back to $JOBPATH_GMAIL_TOKEN.
        #[arg(long)]
        access_token: Option<String>,
        /// Recency window in days for the mailbox query.
        #[arg(long)]
        range_days: Option<u32>,
        /// Scan the entire inbox instead of the recency window.
        #[arg(long)]
        full_inbox: bool,
    },
    /// Query external job boards and print ranked matches.
    Discover {
        #[arg(long = "role")]
        roles: Vec<String>,
        #[arg(long = "location")]
        locations: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Serve the JSON API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sync {
            user_id,
            access_token,
            range_days,
            full_inbox,
        } => {
            let token = match access_token {
                Some(token) => token,
                None => std::env::var("JOBPATH_GMAIL_TOKEN")
                    .context("pass --access-token or set JOBPATH_GMAIL_TOKEN")?,
            };
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            let mailbox: Arc<dyn MailboxProvider> = Arc::new(GmailMailbox::new(token)?);
            let notifications: Arc<dyn NotificationSink> =
                Arc::new(MemoryNotificationSink::new());
            let engine = SyncEngine::new(store, mailbox, notifications)
                .with_config(SyncConfig::from_env());

            let outcome = engine
                .run(
                    user_id,
                    SyncOptions {
                        range_days,
                        full_inbox,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Discover {
            roles,
            locations,
            limit,
        } => {
            let sources = default_sources()?;
            let query = DiscoveryQuery {
                target_roles: roles,
                locations,
                limit,
            };
            let jobs = discover(&sources, &query).await;
            for job in &jobs {
                println!(
                    "{} @ {} [{}] {}",
                    job.title,
                    job.company_name,
                    job.source,
                    job.url.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Serve => {
            let state = AppState {
                store: Arc::new(MemoryStore::new()),
                notifications: Arc::new(MemoryNotificationSink::new()),
                mailbox_factory: Arc::new(GmailFactory),
                sources: default_sources()?,
                sync_config: SyncConfig::from_env(),
            };
            serve_from_env(state).await?;
        }
    }

    Ok(())
}
