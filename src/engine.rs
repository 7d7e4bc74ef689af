//! Live traffic aggregation engine
//!
//! Maintains per-protocol packet counters and per-address byte totals and
//! running mean packet sizes. The engine is a cheap-to-clone handle: every
//! capture task and the metrics collector hold a clone of the same state.
//!
//! Each key lives in a sharded concurrent map and is updated inside its
//! shard's entry lock, so writers to different keys run in parallel. A
//! `record` call holds the shared side of a snapshot gate across all of its
//! updates and `snapshot` takes the exclusive side while copying, so a
//! snapshot contains every packet's updates in full or not at all.

use dashmap::DashMap;
use netlog_common::PacketRecord;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Address key that absorbs new addresses once the tracking cap is reached
pub const OVERFLOW_ADDRESS: &str = "other";

/// Aggregates for one address
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AddressStats {
    /// Bytes seen with this address as source or destination
    pub cumulative_bytes: u64,
    /// Mean size of the packets this address sent
    pub running_mean_size: f64,
    /// Number of packets this address sent
    pub sample_count: u64,
}

impl AddressStats {
    fn add_bytes(&mut self, bytes: u64) {
        self.cumulative_bytes = self.cumulative_bytes.saturating_add(bytes);
    }

    fn add_sample(&mut self, size: u64) {
        self.sample_count = self.sample_count.saturating_add(1);
        let size = size as f64;
        self.running_mean_size += (size - self.running_mean_size) / self.sample_count as f64;
    }
}

/// Point-in-time copy of the engine state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    pub protocols: BTreeMap<String, u64>,
    pub addresses: BTreeMap<String, AddressStats>,
    pub packets_recorded: u64,
    pub packets_filtered: u64,
}

#[derive(Clone)]
pub struct AggregationEngine {
    protocols: Arc<DashMap<String, u64>>,
    addresses: Arc<DashMap<String, AddressStats>>,
    packets_recorded: Arc<AtomicU64>,
    packets_filtered: Arc<AtomicU64>,
    gate: Arc<RwLock<()>>,
    max_addresses: usize,
}

impl AggregationEngine {
    /// Create an engine that tracks every address it sees
    pub fn new() -> Self {
        Self::with_address_limit(0)
    }

    /// Create an engine tracking at most `max_addresses` distinct addresses
    ///
    /// Addresses first seen after the limit is reached are accounted under
    /// [`OVERFLOW_ADDRESS`]. Zero disables the limit. Concurrent first
    /// sightings may overshoot the limit by at most the number of writers.
    pub fn with_address_limit(max_addresses: usize) -> Self {
        Self {
            protocols: Arc::new(DashMap::new()),
            addresses: Arc::new(DashMap::new()),
            packets_recorded: Arc::new(AtomicU64::new(0)),
            packets_filtered: Arc::new(AtomicU64::new(0)),
            gate: Arc::new(RwLock::new(())),
            max_addresses,
        }
    }

    /// Fold an admitted packet into the aggregates
    pub fn record(&self, packet: &PacketRecord) {
        let len = packet.byte_length;
        let _recording = self.enter_record();

        self.increment_protocol(&packet.protocol_label);

        self.update_address(&packet.source_address, |stats| {
            stats.add_bytes(len);
            stats.add_sample(len);
        });
        self.update_address(&packet.destination_address, |stats| stats.add_bytes(len));

        self.packets_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a packet dropped by the block-lists
    pub fn record_filtered(&self) {
        self.packets_filtered.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current aggregates
    ///
    /// Waits for in-flight `record` calls and holds new ones off while
    /// copying. The pause grows with the number of tracked keys, not with
    /// packet rate.
    pub fn snapshot(&self) -> EngineSnapshot {
        let _copying = self.enter_snapshot();

        let protocols = self
            .protocols
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let addresses = self
            .addresses
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        EngineSnapshot {
            protocols,
            addresses,
            packets_recorded: self.packets_recorded.load(Ordering::Relaxed),
            packets_filtered: self.packets_filtered.load(Ordering::Relaxed),
        }
    }

    pub fn protocol_count(&self, label: &str) -> u64 {
        self.protocols.get(label).map(|c| *c).unwrap_or(0)
    }

    pub fn address_stats(&self, address: &str) -> Option<AddressStats> {
        self.addresses.get(address).map(|s| *s)
    }

    /// Number of distinct addresses tracked
    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn packets_recorded(&self) -> u64 {
        self.packets_recorded.load(Ordering::Relaxed)
    }

    pub fn packets_filtered(&self) -> u64 {
        self.packets_filtered.load(Ordering::Relaxed)
    }

    // The gate guards no data, so a poisoned lock is still usable
    fn enter_record(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter_snapshot(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn increment_protocol(&self, label: &str) {
        if let Some(mut count) = self.protocols.get_mut(label) {
            *count = count.saturating_add(1);
            return;
        }

        *self.protocols.entry(label.to_string()).or_insert(0) += 1;
    }

    fn update_address<F>(&self, address: &str, update: F)
    where
        F: FnOnce(&mut AddressStats),
    {
        // Fast path avoids allocating a key for known addresses
        if let Some(mut stats) = self.addresses.get_mut(address) {
            update(&mut stats);
            return;
        }

        let key = self.admission_key(address);
        let mut stats = self.addresses.entry(key).or_default();
        update(&mut stats);
    }

    fn admission_key(&self, address: &str) -> String {
        if self.max_addresses > 0 && self.addresses.len() >= self.max_addresses {
            OVERFLOW_ADDRESS.to_string()
        } else {
            address.to_string()
        }
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new()
    }
}
