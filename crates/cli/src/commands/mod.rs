//! CLI command implementations

pub mod check;
pub mod run;

pub use check::CheckCommand;
pub use run::RunCommand;

use clap::Args;
use figment::providers::Serialized;
use std::path::Path;
use viewsync_config::ViewSyncConfig;

/// Flags overriding file and environment configuration
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// View name
    #[arg(long, value_name = "NAME")]
    pub view_name: Option<String>,

    /// View kind
    #[arg(long, value_name = "KIND", value_parser = ["raw", "category_index", "search_index"])]
    pub view_kind: Option<String>,

    /// Kafka brokers, comma separated
    #[arg(long, value_name = "BROKERS")]
    pub brokers: Option<String>,

    /// Topic to consume
    #[arg(long, value_name = "TOPIC")]
    pub topic: Option<String>,

    /// Partition to consume
    #[arg(long, value_name = "N")]
    pub partition: Option<i32>,

    /// Redis URL
    #[arg(long, value_name = "URL")]
    pub redis_url: Option<String>,

    /// Concurrent Redis operations
    #[arg(long, value_name = "N")]
    pub parallelism: Option<u32>,
}

impl ConfigOverrides {
    /// Layer the flags over file and environment values, then validate
    pub fn resolve(
        &self,
        config_path: Option<&Path>,
        verbose: bool,
        json_logs: bool,
    ) -> anyhow::Result<ViewSyncConfig> {
        let mut figment = ViewSyncConfig::figment(config_path);

        if let Some(name) = &self.view_name {
            figment = figment.merge(Serialized::default("view.name", name));
        }
        if let Some(kind) = &self.view_kind {
            figment = figment.merge(Serialized::default("view.kind", kind));
        }
        if let Some(brokers) = &self.brokers {
            figment = figment.merge(Serialized::default("source.brokers", brokers));
        }
        if let Some(topic) = &self.topic {
            figment = figment.merge(Serialized::default("source.topic", topic));
        }
        if let Some(partition) = self.partition {
            figment = figment.merge(Serialized::default("source.partition", partition));
        }
        if let Some(url) = &self.redis_url {
            figment = figment.merge(Serialized::default("store.url", url));
        }
        if let Some(parallelism) = self.parallelism {
            figment = figment.merge(Serialized::default("store.parallelism", parallelism));
        }
        if verbose {
            figment = figment.merge(Serialized::default("observability.log_level", "debug"));
        }
        if json_logs {
            figment = figment.merge(Serialized::default("observability.json_logs", true));
        }

        Ok(ViewSyncConfig::extract(figment)?)
    }
}
