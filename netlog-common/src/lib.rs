//! Packet record types shared between capture providers and the aggregation core
//!
//! This crate defines:
//! - [`PacketRecord`], the decoded metadata of one observed packet
//! - [`TrafficEvent`], the append-only log form of an admitted packet
//! - IP protocol numbers and their classification labels

use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata of one observed packet
///
/// Produced once per packet by a capture provider and moved through the
/// filter into the aggregation engine. Addresses are kept as text so that
/// providers which cannot decode an address can still report the packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub timestamp: SystemTime,
    pub source_address: String,
    pub destination_address: String,
    pub protocol_label: String,
    pub byte_length: u64,
}

impl PacketRecord {
    /// Create a record stamped with the current time
    pub fn new(
        source_address: impl Into<String>,
        destination_address: impl Into<String>,
        protocol_label: impl Into<String>,
        byte_length: u64,
    ) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_address: source_address.into(),
            destination_address: destination_address.into(),
            protocol_label: protocol_label.into(),
            byte_length,
        }
    }

    /// Replace the capture timestamp
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Capture time as fractional seconds since the Unix epoch
    pub fn unix_timestamp(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// One line of the traffic event log
///
/// Field names match the JSON records consumed by existing log pipelines.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrafficEvent {
    pub timestamp: f64,
    pub source_ip: String,
    pub destination_ip: String,
    pub protocol: String,
    pub length: u64,
}

impl From<&PacketRecord> for TrafficEvent {
    fn from(record: &PacketRecord) -> Self {
        Self {
            timestamp: record.unix_timestamp(),
            source_ip: record.source_address.clone(),
            destination_ip: record.destination_address.clone(),
            protocol: record.protocol_label.clone(),
            length: record.byte_length,
        }
    }
}

/// IP protocol numbers and labels
pub mod protocol {
    use std::borrow::Cow;

    pub const ICMP: u8 = 1;
    pub const IGMP: u8 = 2;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const GRE: u8 = 47;
    pub const ESP: u8 = 50;
    pub const AH: u8 = 51;
    pub const ICMPV6: u8 = 58;
    pub const SCTP: u8 = 132;

    /// Label used when a provider cannot classify a packet
    pub const UNKNOWN: &str = "Unknown";

    /// Classification label for an IP next-header number
    pub fn label(number: u8) -> Cow<'static, str> {
        match number {
            ICMP => Cow::Borrowed("ICMP"),
            IGMP => Cow::Borrowed("IGMP"),
            TCP => Cow::Borrowed("TCP"),
            UDP => Cow::Borrowed("UDP"),
            GRE => Cow::Borrowed("GRE"),
            ESP => Cow::Borrowed("ESP"),
            AH => Cow::Borrowed("AH"),
            ICMPV6 => Cow::Borrowed("ICMPv6"),
            SCTP => Cow::Borrowed("SCTP"),
            other => Cow::Owned(format!("IP-{}", other)),
        }
    }
}
