pub mod collector;
pub mod exporter;

pub use collector::EngineCollector;
pub use exporter::PrometheusExporter;
