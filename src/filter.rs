//! Address block-lists and the admit/drop predicate applied to every packet

use netlog_common::PacketRecord;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// Immutable set of blocked addresses
///
/// Entries that parse as IP addresses are matched by value, so `::1` also
/// blocks `0:0::1`. Anything else is matched verbatim.
#[derive(Debug, Clone, Default)]
pub struct BlockList {
    ips: HashSet<IpAddr>,
    raw: HashSet<String>,
}

impl BlockList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }

            match entry.parse::<IpAddr>() {
                Ok(ip) => {
                    list.ips.insert(ip);
                }
                Err(_) => {
                    warn!("Block-list entry '{}' is not an IP address, matching verbatim", entry);
                    list.raw.insert(entry.to_string());
                }
            }
        }

        list
    }

    /// Parse a comma-separated list, ignoring blank entries
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn contains(&self, address: &str) -> bool {
        match address.parse::<IpAddr>() {
            Ok(ip) => self.ips.contains(&ip),
            Err(_) => self.raw.contains(address),
        }
    }

    pub fn len(&self) -> usize {
        self.ips.len() + self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty() && self.raw.is_empty()
    }
}

/// Decides whether a packet is aggregated and logged
#[derive(Debug, Clone, Default)]
pub struct TrafficFilter {
    source: Arc<BlockList>,
    destination: Arc<BlockList>,
}

impl TrafficFilter {
    pub fn new(source: BlockList, destination: BlockList) -> Self {
        Self {
            source: Arc::new(source),
            destination: Arc::new(destination),
        }
    }

    /// A filter with empty block-lists admits everything
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn admit(&self, record: &PacketRecord) -> bool {
        !(self.source.contains(&record.source_address)
            || self.destination.contains(&record.destination_address))
    }

    pub fn source_blocklist(&self) -> &BlockList {
        &self.source
    }

    pub fn destination_blocklist(&self) -> &BlockList {
        &self.destination
    }
}
