use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use pulse::audit::{AuditFilter, AuditStore, MetricPair, NewAuditEntry};
use pulse::config::{Config, DatabaseBackend};
use pulse::counters::{
    CounterBackend, CounterStore, DurableCounterBackend, MembershipSets, MemoryCounterBackend,
    MetricsQuery, OverwritePatch,
};
use pulse::storage::{DurableStore, PostgresStore, SqliteStore};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pulse-admin")]
#[command(about = "Pulse metrics management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show counters for a slug
    Show { slug: String },
    /// Overwrite counters for a slug (records an audit entry)
    Overwrite {
        slug: String,
        #[arg(long)]
        views: Option<u64>,
        #[arg(long)]
        likes: Option<u64>,
        /// Operator name recorded in the audit log
        #[arg(long, default_value = "cli")]
        changed_by: String,
    },
    /// List recent audit entries
    Audit {
        /// Comma-separated slug filter
        #[arg(long)]
        slugs: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let durable: Arc<dyn DurableStore> = match config.database.backend {
        DatabaseBackend::Sqlite => Arc::new(
            SqliteStore::new(&config.database.url, config.database.max_connections).await?,
        ),
        DatabaseBackend::Postgres => Arc::new(PostgresStore::new(&config.database.url).await?),
        DatabaseBackend::Off => {
            bail!("pulse-admin requires a durable store; set DATABASE_BACKEND to sqlite or postgres")
        }
    };

    // Ensure the schema exists
    durable.init().await?;

    let membership = Arc::new(MembershipSets::new());
    let backends: Vec<Arc<dyn CounterBackend>> = vec![
        Arc::new(DurableCounterBackend::new(
            Arc::clone(&durable),
            Arc::clone(&membership),
        )),
        Arc::new(MemoryCounterBackend::new(membership)),
    ];
    let counters = CounterStore::new(backends);
    let audit = AuditStore::new(None, Some(Arc::clone(&durable)));

    match cli.command {
        Commands::Show { slug } => {
            let metrics = counters.get_metrics(&slug, &MetricsQuery::default()).await?;
            println!("{:<20} {:>8} {:>8}", "Slug", "Views", "Likes");
            println!("{}", "-".repeat(40));
            println!("{:<20} {:>8} {:>8}", slug, metrics.views, metrics.likes);
            if !metrics.history.is_empty() {
                println!();
                println!("{:<12} {:>8} {:>8}", "Date", "Views", "Likes");
                for row in metrics.history {
                    println!("{:<12} {:>8} {:>8}", row.date, row.views, row.likes);
                }
            }
        }
        Commands::Overwrite {
            slug,
            views,
            likes,
            changed_by,
        } => {
            let before = counters.get_metrics(&slug, &MetricsQuery::default()).await?;
            let (new_views, new_likes) = counters
                .overwrite_metrics(
                    &slug,
                    &OverwritePatch {
                        views,
                        likes,
                        history: None,
                    },
                )
                .await?;

            audit
                .record(vec![NewAuditEntry {
                    slug: slug.clone(),
                    changed_by,
                    changed_at: None,
                    before: MetricPair {
                        views: before.views,
                        likes: before.likes,
                    },
                    after: MetricPair {
                        views: new_views,
                        likes: new_likes,
                    },
                }])
                .await?;

            println!(
                "✓ Overwrote '{}': views {} → {}, likes {} → {}",
                slug, before.views, new_views, before.likes, new_likes
            );
        }
        Commands::Audit { slugs, limit } => {
            let filter = AuditFilter {
                slugs: slugs.map(|raw| {
                    raw.split(',')
                        .map(|slug| slug.trim().to_string())
                        .filter(|slug| !slug.is_empty())
                        .collect()
                }),
                limit: Some(limit),
            };

            let entries = audit.list(&filter).await?;
            if entries.is_empty() {
                println!("No audit entries found.");
            } else {
                println!(
                    "{:<24} {:<20} {:<16} {}",
                    "Changed At", "Slug", "Changed By", "Change"
                );
                println!("{}", "-".repeat(80));
                for entry in entries {
                    println!(
                        "{:<24} {:<20} {:<16} views {} → {}, likes {} → {}",
                        entry.changed_at,
                        entry.slug,
                        entry.changed_by,
                        entry.before.views,
                        entry.after.views,
                        entry.before.likes,
                        entry.after.likes
                    );
                }
            }
        }
    }

    Ok(())
}
