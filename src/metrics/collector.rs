use crate::engine::AggregationEngine;
use crate::supervisor::TaskStatus;
use crate::Result;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts};
use tokio::sync::watch;
use tracing::warn;

const PACKETS: &str = "network_logger_packets_total";
const BANDWIDTH: &str = "network_logger_bandwidth_bytes_total";
const AVG_SIZE: &str = "network_logger_avg_packet_size";
const FILTERED: &str = "network_logger_packets_filtered_total";
const TRACKED: &str = "network_logger_tracked_addresses";
const TASKS: &str = "network_logger_capture_tasks";

/// Fresh metric instances for one scrape
struct Families {
    packets: IntCounterVec,
    bandwidth: IntCounterVec,
    avg_size: GaugeVec,
    filtered: IntCounter,
    tracked: IntGauge,
    tasks: IntGaugeVec,
}

impl Families {
    fn new() -> Result<Self> {
        Ok(Self {
            packets: IntCounterVec::new(
                Opts::new(PACKETS, "Total packets observed, by protocol"),
                &["protocol"],
            )?,
            bandwidth: IntCounterVec::new(
                Opts::new(BANDWIDTH, "Total bytes sent or received, by IP address"),
                &["ip"],
            )?,
            avg_size: GaugeVec::new(
                Opts::new(AVG_SIZE, "Running mean packet size in bytes, by IP address"),
                &["ip"],
            )?,
            filtered: IntCounter::new(FILTERED, "Packets dropped by the address blocklists")?,
            tracked: IntGauge::new(TRACKED, "Distinct IP addresses with traffic statistics")?,
            tasks: IntGaugeVec::new(
                Opts::new(TASKS, "Capture tasks, by interface and state"),
                &["interface", "state"],
            )?,
        })
    }

    fn descs(&self) -> Vec<Desc> {
        self.packets
            .desc()
            .into_iter()
            .chain(self.bandwidth.desc())
            .chain(self.avg_size.desc())
            .chain(self.filtered.desc())
            .chain(self.tracked.desc())
            .chain(self.tasks.desc())
            .cloned()
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.packets.collect());
        families.extend(self.bandwidth.collect());
        families.extend(self.avg_size.collect());
        families.extend(self.filtered.collect());
        families.extend(self.tracked.collect());
        families.extend(self.tasks.collect());
        families
    }
}

/// Exposes an [`AggregationEngine`] to Prometheus
///
/// Values are read from an engine snapshot at scrape time, so the engine's
/// hot path never touches Prometheus types.
pub struct EngineCollector {
    engine: AggregationEngine,
    tasks: Option<watch::Receiver<Vec<TaskStatus>>>,
    descs: Vec<Desc>,
}

impl EngineCollector {
    pub fn new(engine: AggregationEngine) -> Result<Self> {
        Ok(Self {
            engine,
            tasks: None,
            descs: Families::new()?.descs(),
        })
    }

    /// Also report capture task states
    pub fn with_task_status(mut self, tasks: watch::Receiver<Vec<TaskStatus>>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    fn families(&self) -> Result<Families> {
        let families = Families::new()?;
        let snapshot = self.engine.snapshot();

        for (protocol, count) in &snapshot.protocols {
            families
                .packets
                .with_label_values(&[protocol.as_str()])
                .inc_by(*count);
        }

        for (ip, stats) in &snapshot.addresses {
            families
                .bandwidth
                .with_label_values(&[ip.as_str()])
                .inc_by(stats.cumulative_bytes);
            families
                .avg_size
                .with_label_values(&[ip.as_str()])
                .set(stats.running_mean_size);
        }

        families.filtered.inc_by(snapshot.packets_filtered);
        families.tracked.set(snapshot.addresses.len() as i64);

        if let Some(tasks) = &self.tasks {
            for status in tasks.borrow().iter() {
                families
                    .tasks
                    .with_label_values(&[status.interface_name.as_str(), status.state.as_str()])
                    .set(1);
            }
        }

        Ok(families)
    }
}

impl Collector for EngineCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        match self.families() {
            Ok(families) => families.collect(),
            Err(e) => {
                warn!("Failed to build traffic metrics: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::TaskState;
    use netlog_common::PacketRecord;
    use prometheus::{Encoder, Registry, TextEncoder};

    fn render(collector: EngineCollector) -> String {
        let registry = Registry::new();
        registry.register(Box::new(collector)).unwrap();

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_exposes_engine_totals() {
        let engine = AggregationEngine::new();
        engine.record(&PacketRecord::new("10.0.0.1", "10.0.0.2", "TCP", 100));
        engine.record(&PacketRecord::new("10.0.0.1", "10.0.0.3", "UDP", 50));
        engine.record_filtered();

        let text = render(EngineCollector::new(engine).unwrap());

        assert!(text.contains(r#"network_logger_packets_total{protocol="TCP"} 1"#));
        assert!(text.contains(r#"network_logger_packets_total{protocol="UDP"} 1"#));
        assert!(text.contains(r#"network_logger_bandwidth_bytes_total{ip="10.0.0.1"} 150"#));
        assert!(text.contains(r#"network_logger_bandwidth_bytes_total{ip="10.0.0.3"} 50"#));
        assert!(text.contains(r#"network_logger_avg_packet_size{ip="10.0.0.1"} 75"#));
        assert!(text.contains("network_logger_packets_filtered_total 1"));
        assert!(text.contains("network_logger_tracked_addresses 3"));
        assert!(text.contains("# TYPE network_logger_packets_total counter"));
        assert!(text.contains("# TYPE network_logger_avg_packet_size gauge"));
    }

    #[test]
    fn test_scrapes_follow_engine_updates() {
        let engine = AggregationEngine::new();
        let registry = Registry::new();
        registry
            .register(Box::new(EngineCollector::new(engine.clone()).unwrap()))
            .unwrap();

        engine.record(&PacketRecord::new("10.0.0.1", "10.0.0.2", "ICMP", 10));
        let first = TextEncoder::new().encode_to_string(&registry.gather()).unwrap();
        assert!(first.contains(r#"network_logger_packets_total{protocol="ICMP"} 1"#));

        engine.record(&PacketRecord::new("10.0.0.1", "10.0.0.2", "ICMP", 10));
        let second = TextEncoder::new().encode_to_string(&registry.gather()).unwrap();
        assert!(second.contains(r#"network_logger_packets_total{protocol="ICMP"} 2"#));
    }

    #[test]
    fn test_reports_capture_task_states() {
        let (tx, rx) = watch::channel(vec![
            TaskStatus {
                interface_name: "eth0".to_string(),
                state: TaskState::Running,
                last_error: None,
            },
            TaskStatus {
                interface_name: "br-5e1d".to_string(),
                state: TaskState::Stopped,
                last_error: None,
            },
        ]);

        let collector = EngineCollector::new(AggregationEngine::new())
            .unwrap()
            .with_task_status(rx);
        let text = render(collector);
        drop(tx);

        assert!(text.contains(r#"network_logger_capture_tasks{interface="eth0",state="running"} 1"#));
        assert!(text.contains(
            r#"network_logger_capture_tasks{interface="br-5e1d",state="stopped"} 1"#
        ));
    }
}
