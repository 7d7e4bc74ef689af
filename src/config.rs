//! Validated runtime configuration

use crate::cli::Cli;
use crate::filter::{BlockList, TrafficFilter};
use crate::interfaces::PrefixAllowlist;
use crate::supervisor::{SupervisorConfig, DEFAULT_REMOVAL_THRESHOLD};
use crate::{NetlogError, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub source_blocklist: BlockList,
    pub destination_blocklist: BlockList,
    pub interface_prefixes: PrefixAllowlist,
    pub poll_interval: Duration,
    pub metrics_address: String,
    pub metrics_port: u16,
    pub log_file: PathBuf,
    pub log_max_bytes: u64,
    pub log_backups: usize,
    /// 0 means unbounded
    pub max_tracked_addresses: usize,
    pub promiscuous: bool,
}

impl Config {
    pub fn filter(&self) -> TrafficFilter {
        TrafficFilter::new(
            self.source_blocklist.clone(),
            self.destination_blocklist.clone(),
        )
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: self.poll_interval,
            discovery_backoff: self.poll_interval,
            removal_threshold: DEFAULT_REMOVAL_THRESHOLD,
        }
    }
}

impl TryFrom<Cli> for Config {
    type Error = NetlogError;

    fn try_from(cli: Cli) -> Result<Self> {
        if cli.poll_interval == 0 {
            return Err(NetlogError::Config(
                "poll interval must be at least one second".to_string(),
            ));
        }

        if cli.log_max_bytes == 0 {
            return Err(NetlogError::Config(
                "log size ceiling must be greater than zero".to_string(),
            ));
        }

        let interface_prefixes =
            PrefixAllowlist::new(cli.interface_prefixes.iter().map(|p| p.trim()));
        if interface_prefixes.is_empty() {
            return Err(NetlogError::Config(
                "at least one interface prefix is required".to_string(),
            ));
        }

        Ok(Self {
            source_blocklist: BlockList::parse(&cli.source_blocklist),
            destination_blocklist: BlockList::parse(&cli.destination_blocklist),
            interface_prefixes,
            poll_interval: Duration::from_secs(cli.poll_interval),
            metrics_address: cli.metrics_address,
            metrics_port: cli.metrics_port,
            log_file: cli.log_file,
            log_max_bytes: cli.log_max_bytes,
            log_backups: cli.log_backups,
            max_tracked_addresses: cli.max_tracked_addresses,
            promiscuous: !cli.no_promiscuous,
        })
    }
}
