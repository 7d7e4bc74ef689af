use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "netlog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Logs per-interface traffic on container hosts and exposes Prometheus metrics",
    long_about = None
)]
pub struct Cli {
    #[arg(
        long,
        env = "BLACKLIST_SOURCE_IPS",
        default_value = "",
        help = "Comma-separated source IPs whose packets are ignored"
    )]
    pub source_blocklist: String,

    #[arg(
        long,
        env = "BLACKLIST_DESTINATION_IPS",
        default_value = "",
        help = "Comma-separated destination IPs whose packets are ignored"
    )]
    pub destination_blocklist: String,

    #[arg(
        long,
        env = "NETLOG_INTERFACE_PREFIXES",
        value_delimiter = ',',
        default_value = "br-,docker,eth,ens,bond",
        help = "Interface name prefixes eligible for capture"
    )]
    pub interface_prefixes: Vec<String>,

    #[arg(
        long,
        env = "NETLOG_POLL_INTERVAL_SECS",
        default_value_t = 10,
        help = "Seconds between interface discovery polls"
    )]
    pub poll_interval: u64,

    #[arg(long, default_value = "0.0.0.0", help = "Metrics server listen address")]
    pub metrics_address: String,

    #[arg(long, default_value_t = 8000, help = "Metrics server port")]
    pub metrics_port: u16,

    #[arg(
        long,
        default_value = "/logs/docker_network_logs.json",
        help = "Traffic event log file"
    )]
    pub log_file: PathBuf,

    #[arg(
        long,
        default_value_t = crate::sink::DEFAULT_MAX_BYTES,
        help = "Rotate the event log once it would exceed this many bytes"
    )]
    pub log_max_bytes: u64,

    #[arg(
        long,
        default_value_t = crate::sink::DEFAULT_BACKUPS,
        help = "Number of rotated event logs to keep"
    )]
    pub log_backups: usize,

    #[arg(
        long,
        default_value_t = 0,
        help = "Maximum distinct IPs tracked before folding into \"other\" (0 = unbounded)"
    )]
    pub max_tracked_addresses: usize,

    #[arg(long, help = "Do not put interfaces into promiscuous mode")]
    pub no_promiscuous: bool,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}
