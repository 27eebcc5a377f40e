use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use studymate::config;
use studymate::feed::reconciler::{MarkRead, ReadStateReconciler};
use studymate::feed::{FeedSnapshot, FeedStatus, NotificationFeed};
use studymate::models::notification::unread_badge;
use studymate::store::http::HttpStore;
use studymate::store::DocumentStore;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let json_logs = std::env::var("STUDYMATE_LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "studymate=info".into()),
        ))
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = run(cfg, args).await;

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run(cfg: config::Config, args: cli::Cli) -> anyhow::Result<()> {
    let user = args
        .user
        .ok_or_else(|| anyhow::anyhow!("Please log in to view your inbox (pass --user or set STUDYMATE_USER_ID)"))?;

    let store: Arc<dyn DocumentStore> =
        Arc::new(HttpStore::from_config(&cfg).context("failed to configure document store")?);
    let feed = NotificationFeed::with_limit(store, cfg.collection.clone(), cfg.feed_limit);
    let reconciler = ReadStateReconciler::new(feed.clone());
    // A listener that connects but never delivers must not block the CLI.
    let wait = Duration::from_secs(cfg.request_timeout_secs);

    tracing::debug!(user_id = %user, store = %cfg.store_url, "opening inbox");
    let handle = feed.subscribe(Some(user)).await;

    let result = match args.command.unwrap_or(cli::Commands::List { json: false }) {
        cli::Commands::List { json } => {
            let snapshot = feed.settled_within(wait).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_inbox(&snapshot);
            }
            Ok(())
        }
        cli::Commands::Watch => watch_inbox(&feed).await,
        cli::Commands::Unread => {
            let snapshot = feed.settled_within(wait).await;
            println!("{}", unread_badge(snapshot.unread_count).unwrap_or_else(|| "0".into()));
            Ok(())
        }
        cli::Commands::Read { id } => {
            let snapshot = feed.settled_within(wait).await;
            let notification = snapshot
                .notifications
                .iter()
                .find(|n| n.id == id)
                .ok_or_else(|| anyhow::anyhow!("Notification not found in inbox: {}", id))?;

            match reconciler.mark_read(notification).await.context("Failed to mark as read")? {
                MarkRead::Marked => {
                    let snapshot = feed.settled_within(wait).await;
                    println!("Marked as read ({} unread left)", snapshot.unread_count);
                }
                MarkRead::AlreadyRead => println!("Already read"),
            }
            Ok(())
        }
        cli::Commands::ReadAll => {
            let snapshot = feed.settled_within(wait).await;
            let report = reconciler.mark_all_read(&snapshot.notifications).await;
            if report.is_noop() {
                println!("No unread notifications");
                Ok(())
            } else if report.is_complete() {
                println!("All notifications marked as read");
                Ok(())
            } else {
                for failed in &report.failed {
                    eprintln!("  {}: {}", failed.id, failed.error);
                }
                Err(anyhow::anyhow!(
                    "Failed to mark {} of {} notifications as read",
                    report.failed.len(),
                    report.failed.len() + report.marked.len()
                ))
            }
        }
    };

    handle.cancel();
    feed.stop();
    result
}

async fn watch_inbox(feed: &NotificationFeed) -> anyhow::Result<()> {
    let mut rx = feed.watch();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        if !snapshot.loading {
            print_inbox(&snapshot);
            if snapshot.status == FeedStatus::Degraded {
                eprintln!("Live updates unavailable; run `studymate list` to refresh.");
            }
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                return Ok(());
            }
        }
    }
}

fn print_inbox(snapshot: &FeedSnapshot) {
    let now = chrono::Utc::now();
    println!("Inbox ({} unread)", snapshot.unread_count);
    if snapshot.loading {
        println!("  Still waiting for the notification store; showing the last known view");
    }

    if snapshot.notifications.is_empty() {
        println!("  No notifications yet");
        println!("  When you have new replies or mentions, they'll appear here");
        return;
    }

    for n in &snapshot.notifications {
        let marker = if n.read { ' ' } else { '*' };
        println!("{} [{}] {}", marker, n.kind.label(), n.message);
        println!("    {} · {} · {}", n.age_label(now), n.link_target(), n.id);
    }
}
