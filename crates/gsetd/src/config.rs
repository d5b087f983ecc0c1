//! Configuration for gsetd

use clap::Parser;
use gset_core::Strategy;
use std::path::PathBuf;
use std::time::Duration;

/// gsetd - replicated grow-only set node
#[derive(Parser, Debug, Clone)]
#[command(name = "gsetd")]
#[command(about = "Replicated grow-only set node with gossip and anti-entropy repair")]
pub struct Config {
    /// Gossip tick interval in milliseconds
    #[arg(long, env = "GSET_GOSSIP_INTERVAL_MS", default_value = "125")]
    pub gossip_interval_ms: u64,

    /// Anti-entropy round interval in milliseconds
    #[arg(long, env = "GSET_RECONCILE_INTERVAL_MS", default_value = "2000")]
    pub reconcile_interval_ms: u64,

    /// How long a peer request may stay unanswered, in milliseconds
    #[arg(long, default_value = "1000")]
    pub rpc_timeout_ms: u64,

    /// Hop budget given to client-submitted values
    #[arg(long, default_value = "1")]
    pub gossip_hops: u32,

    /// Anti-entropy strategy (pull or checksum)
    #[arg(long, env = "GSET_STRATEGY", default_value = "pull")]
    pub strategy: Strategy,

    /// Directory for the durable value log (in-memory only when unset)
    #[arg(short, long, env = "GSET_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Capacity of the inbound message queue
    #[arg(long, default_value = "4096")]
    pub inbox_capacity: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gossip_interval_ms == 0 {
            anyhow::bail!("Gossip interval must be positive");
        }
        if self.reconcile_interval_ms == 0 {
            anyhow::bail!("Reconcile interval must be positive");
        }
        if self.rpc_timeout_ms == 0 {
            anyhow::bail!("RPC timeout must be positive");
        }
        if self.gossip_hops == 0 {
            anyhow::bail!("Gossip hops must be at least 1");
        }
        if self.inbox_capacity == 0 {
            anyhow::bail!("Inbox capacity must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty, got {}", self.log_format);
        }
        Ok(())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["gsetd"]);
        assert_eq!(config.gossip_interval(), Duration::from_millis(125));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(2));
        assert_eq!(config.gossip_hops, 1);
        assert_eq!(config.strategy, Strategy::Pull);
        assert!(config.data_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags() {
        let config = Config::parse_from([
            "gsetd",
            "--strategy",
            "checksum",
            "--gossip-hops",
            "3",
            "--log-format",
            "json",
        ]);
        assert_eq!(config.strategy, Strategy::Checksum);
        assert_eq!(config.gossip_hops, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::parse_from(["gsetd"]);
        config.gossip_hops = 0;
        assert!(config.validate().is_err());

        let mut config = Config::parse_from(["gsetd"]);
        config.log_format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = Config::parse_from(["gsetd"]);
        config.reconcile_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
