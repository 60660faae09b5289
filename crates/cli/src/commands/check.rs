//! Check command - validate configuration

use super::ConfigOverrides;
use anyhow::Context;
use clap::Args;
use colored::Colorize;
use viewsync_config::ViewSyncConfig;
use viewsync_processor::RedisViewStore;

/// Print the resolved configuration and optionally probe Redis
#[derive(Args, Debug, Clone)]
pub struct CheckCommand {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Also connect to Redis
    #[arg(long, help = "Connect to Redis and send a PING")]
    pub probe: bool,
}

impl CheckCommand {
    /// Execute the check command
    pub async fn execute(&self, config: ViewSyncConfig) -> anyhow::Result<()> {
        let consumer = config.consumer_config()?;

        println!("{}", "Configuration OK".bold().green());
        println!("{}", "-".repeat(40));
        println!("  {:<20} {}", "scope", config.scope());
        println!("  {:<20} {:?}", "view kind", config.view.kind);
        println!("  {:<20} {}", "versioned", config.view.versioned);
        println!("  {:<20} {}", "brokers", config.source.brokers);
        println!("  {:<20} {}", "redis", config.store.url);
        println!("  {:<20} {}", "parallelism", config.store.parallelism);
        println!("  {:<20} {:?}", "flush interval", consumer.flush_interval);
        println!("  {:<20} {}", "flush capacity", consumer.flush_capacity);
        println!("  {:<20} {:?}", "apply failure", consumer.apply_failure);
        println!("  {:<20} {:?}", "decode failure", consumer.decode_failure);

        if self.probe {
            let redis = config.redis_config()?;
            let store = RedisViewStore::new(redis.clone())
                .await
                .with_context(|| format!("failed to connect to {}", redis.url))?;
            let healthy = store.health_check().await?;
            let status = if healthy { "reachable".green() } else { "unhealthy".red() };
            println!("  {:<20} {}", "redis status", status);
            if !healthy {
                anyhow::bail!("redis at {} did not answer PING", redis.url);
            }
        }

        Ok(())
    }
}
