//! Run command - materialize one view until interrupted

use super::ConfigOverrides;
use anyhow::Context;
use clap::Args;
use colored::Colorize;
use std::sync::Arc;
use tracing::info;
use viewsync_config::{ViewKind, ViewSyncConfig};
use viewsync_processor::materializer::{
    FieldIndexer, IndexedView, Materializer, RawPassthrough, SearchIndexer, Versioned,
};
use viewsync_processor::{
    shutdown_signal, Admitted, AdmissionLimiter, ConsumerReport, KafkaConnector,
    RedisCheckpointStore, RedisViewStore, ViewRunner, ViewStore,
};

/// Consume and materialize until SIGINT or SIGTERM
#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

impl RunCommand {
    /// Execute the run command
    pub async fn execute(&self, config: ViewSyncConfig) -> anyhow::Result<()> {
        let scope = config.scope();
        info!(
            scope = %scope,
            kind = ?config.view.kind,
            versioned = config.view.versioned,
            "Starting view"
        );

        let redis = config.redis_config()?;
        let view_store = RedisViewStore::new(redis.clone())
            .await
            .with_context(|| format!("failed to connect to {}", redis.url))?;

        // view writes and checkpoint writes share one admission budget
        let limiter = AdmissionLimiter::new(config.store.parallelism);
        let checkpoints = Admitted::new(
            RedisCheckpointStore::with_connection(view_store.connection(), redis.key_prefix.clone()),
            limiter.clone(),
        );
        let view = Admitted::new(view_store, limiter);

        let materializer = build_materializer(&config, view);
        let connector = KafkaConnector::new(config.kafka_config());

        let report = ViewRunner::new(
            scope,
            Arc::new(connector),
            materializer,
            Arc::new(checkpoints),
            config.consumer_config()?,
        )
        .run_until(shutdown_signal())
        .await?;

        print_report(&report);
        Ok(())
    }
}

/// Materializer for the configured view kind
pub fn build_materializer<S>(config: &ViewSyncConfig, store: S) -> Arc<dyn Materializer>
where
    S: ViewStore + Clone + 'static,
{
    let view = &config.view;
    let base: Arc<dyn Materializer> = match view.kind {
        ViewKind::Raw => Arc::new(RawPassthrough::new(store.clone())),
        ViewKind::CategoryIndex => {
            let mut indexer = FieldIndexer::new(view.field.clone().unwrap_or_default());
            if let Some(prefix) = &view.bucket {
                indexer = indexer.with_set_prefix(prefix.clone());
            }
            Arc::new(IndexedView::new(&view.name, store.clone(), indexer))
        }
        ViewKind::SearchIndex => {
            let term = view.search_term.clone().unwrap_or_default();
            let set = view
                .bucket
                .clone()
                .unwrap_or_else(|| format!("search:{}", term));
            Arc::new(IndexedView::new(
                &view.name,
                store.clone(),
                SearchIndexer::new(term, view.search_fields.clone(), set),
            ))
        }
    };

    if view.versioned {
        Arc::new(Versioned::new(&view.name, base, store))
    } else {
        base
    }
}

fn print_report(report: &ConsumerReport) {
    println!();
    println!("{}", "View stopped".bold().cyan());
    println!("{}", "-".repeat(40));
    match report.final_checkpoint {
        Some(offset) => println!("  {:<20} {}", "checkpoint", offset.to_string().green()),
        None => println!("  {:<20} {}", "checkpoint", "none".dimmed()),
    }
    println!("  {:<20} {}", "applied", report.messages_applied);
    if report.messages_skipped > 0 {
        println!("  {:<20} {}", "skipped", report.messages_skipped.to_string().yellow());
    }
    println!(
        "  {:<20} {} by count, {} by timer",
        "cycles", report.cycles_by_count, report.cycles_by_timer
    );
    if report.commit_failures > 0 {
        println!(
            "  {:<20} {}",
            "commit failures",
            report.commit_failures.to_string().red()
        );
    }
}
