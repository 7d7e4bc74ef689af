//! Per-packet processing shared by every capture task: filter, aggregate, log

use crate::engine::AggregationEngine;
use crate::filter::TrafficFilter;
use crate::sink::EventSink;
use netlog_common::PacketRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct TrafficPipeline {
    filter: TrafficFilter,
    engine: AggregationEngine,
    sink: Arc<dyn EventSink>,
    sink_failing: Arc<AtomicBool>,
}

impl TrafficPipeline {
    pub fn new(filter: TrafficFilter, engine: AggregationEngine, sink: Arc<dyn EventSink>) -> Self {
        Self {
            filter,
            engine,
            sink,
            sink_failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run one packet through the pipeline; returns whether it was admitted
    ///
    /// Sink failures are logged once per failure streak and never stop
    /// aggregation.
    pub fn process(&self, record: PacketRecord) -> bool {
        if !self.filter.admit(&record) {
            self.engine.record_filtered();
            return false;
        }

        self.engine.record(&record);

        debug!(
            source_ip = %record.source_address,
            destination_ip = %record.destination_address,
            protocol = %record.protocol_label,
            length = record.byte_length,
            "packet"
        );

        match self.sink.append(&record) {
            Ok(()) => {
                if self.sink_failing.swap(false, Ordering::Relaxed) {
                    warn!("Event log writes recovered");
                }
            }
            Err(e) => {
                if !self.sink_failing.swap(true, Ordering::Relaxed) {
                    warn!("Failed to write traffic event: {}", e);
                }
            }
        }

        true
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }
}
