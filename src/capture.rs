//! Packet capture providers
//!
//! A [`PacketSource`] opens one interface and hands back a [`PacketStream`]
//! of decoded [`PacketRecord`]s. Dropping the stream releases the capture.

use crate::{NetlogError, Result};
use async_trait::async_trait;
use netlog_common::{protocol, PacketRecord};
use pnet::datalink::{self, Channel, DataLinkReceiver};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::Packet;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Start capturing on `interface`
    async fn open(&self, interface: &str) -> Result<Box<dyn PacketStream>>;
}

#[async_trait]
pub trait PacketStream: Send {
    /// Wait for the next packet
    ///
    /// An error means the capture is dead; the stream must not be polled
    /// again. Must be cancel-safe.
    async fn next_packet(&mut self) -> Result<PacketRecord>;
}

/// Raw-socket capture via `pnet::datalink`
///
/// Each open interface gets a dedicated reader thread, which decodes frames
/// and forwards IP traffic over a bounded channel. Non-IP frames are
/// discarded in the reader.
#[derive(Debug, Clone)]
pub struct LiveSource {
    promiscuous: bool,
    read_timeout: Duration,
    buffer: usize,
}

impl LiveSource {
    pub fn new(promiscuous: bool) -> Self {
        Self {
            promiscuous,
            read_timeout: Duration::from_millis(500),
            buffer: 4096,
        }
    }

    /// How often an idle reader thread checks whether its stream was dropped
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

impl Default for LiveSource {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl PacketSource for LiveSource {
    async fn open(&self, interface: &str) -> Result<Box<dyn PacketStream>> {
        debug!("Opening capture on {}", interface);

        // Device lookup and socket setup are blocking syscalls
        let config = datalink::Config {
            read_timeout: Some(self.read_timeout),
            promiscuous: self.promiscuous,
            ..Default::default()
        };
        let name = interface.to_string();
        let rx = tokio::task::spawn_blocking(move || open_channel(&name, config))
            .await
            .map_err(|e| NetlogError::capture_start(interface, e))??;

        let (tx, records) = mpsc::channel(self.buffer);
        let name = interface.to_string();

        thread::Builder::new()
            .name(format!("capture-{}", interface))
            .spawn(move || read_frames(name, rx, tx))
            .map_err(|e| NetlogError::capture_start(interface, e))?;

        info!("Capture attached to {}", interface);

        Ok(Box::new(LiveStream {
            interface: interface.to_string(),
            records,
        }))
    }
}

fn open_channel(interface: &str, config: datalink::Config) -> Result<Box<dyn DataLinkReceiver>> {
    let device = datalink::interfaces()
        .into_iter()
        .find(|i| i.name == interface)
        .ok_or_else(|| NetlogError::InterfaceNotFound(interface.to_string()))?;

    match datalink::channel(&device, config) {
        Ok(Channel::Ethernet(_tx, rx)) => Ok(rx),
        Ok(_) => Err(NetlogError::capture_start(
            interface,
            "unsupported datalink channel type",
        )),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(NetlogError::capture_start(
            interface,
            "permission denied; CAP_NET_RAW and CAP_NET_ADMIN are required",
        )),
        Err(e) => Err(NetlogError::capture_start(interface, e)),
    }
}

struct LiveStream {
    interface: String,
    records: mpsc::Receiver<Result<PacketRecord>>,
}

#[async_trait]
impl PacketStream for LiveStream {
    async fn next_packet(&mut self) -> Result<PacketRecord> {
        match self.records.recv().await {
            Some(item) => item,
            None => Err(NetlogError::capture(
                &self.interface,
                "capture thread exited",
            )),
        }
    }
}

fn read_frames(
    interface: String,
    mut rx: Box<dyn DataLinkReceiver>,
    tx: mpsc::Sender<Result<PacketRecord>>,
) {
    loop {
        if tx.is_closed() {
            break;
        }

        match rx.next() {
            Ok(frame) => {
                let Some(record) = decode_frame(frame) else {
                    continue;
                };
                if tx.blocking_send(Ok(record)).is_err() {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!("Frame read failed on {}: {}", interface, e);
                let _ = tx.blocking_send(Err(NetlogError::capture(&interface, e)));
                break;
            }
        }
    }

    debug!("Reader thread for {} exiting", interface);
}

/// Decode an Ethernet frame into a record, skipping anything that is not IP
///
/// The recorded length is the full frame length as seen on the wire.
pub fn decode_frame(frame: &[u8]) -> Option<PacketRecord> {
    let ethernet = EthernetPacket::new(frame)?;
    let byte_length = frame.len() as u64;

    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(ethernet.payload())?;
            Some(PacketRecord::new(
                ip.get_source().to_string(),
                ip.get_destination().to_string(),
                protocol::label(ip.get_next_level_protocol().0),
                byte_length,
            ))
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(ethernet.payload())?;
            Some(PacketRecord::new(
                ip.get_source().to_string(),
                ip.get_destination().to_string(),
                protocol::label(ip.get_next_header().0),
                byte_length,
            ))
        }
        _ => None,
    }
}

/// Sending half of a [`ChannelSource`] stream
pub type ChannelFeed = mpsc::UnboundedSender<Result<PacketRecord>>;

enum Queued {
    Stream(mpsc::UnboundedReceiver<Result<PacketRecord>>),
    OpenFailure(String),
}

/// In-process source whose streams are fed through channels
///
/// Every `open` consumes the next queued stream (or open failure) for that
/// interface; opening with nothing queued fails. Useful for embedding the
/// aggregation pipeline behind another capture mechanism, and in tests.
#[derive(Clone, Default)]
pub struct ChannelSource {
    queued: Arc<Mutex<HashMap<String, VecDeque<Queued>>>>,
    opens: Arc<Mutex<HashMap<String, usize>>>,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream for the next open of `interface`
    pub fn push_stream(&self, interface: &str) -> ChannelFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.enqueue(interface, Queued::Stream(rx));
        tx
    }

    /// Make the next open of `interface` fail
    pub fn push_open_failure(&self, interface: &str, reason: &str) {
        self.enqueue(interface, Queued::OpenFailure(reason.to_string()));
    }

    /// Number of times `interface` has been opened
    pub fn open_count(&self, interface: &str) -> usize {
        self.opens
            .lock()
            .map(|opens| opens.get(interface).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn enqueue(&self, interface: &str, item: Queued) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.entry(interface.to_string()).or_default().push_back(item);
        }
    }
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn open(&self, interface: &str) -> Result<Box<dyn PacketStream>> {
        if let Ok(mut opens) = self.opens.lock() {
            *opens.entry(interface.to_string()).or_insert(0) += 1;
        }

        let next = self
            .queued
            .lock()
            .ok()
            .and_then(|mut queued| queued.get_mut(interface).and_then(|q| q.pop_front()));

        match next {
            Some(Queued::Stream(records)) => Ok(Box::new(ChannelStream {
                interface: interface.to_string(),
                records,
            })),
            Some(Queued::OpenFailure(reason)) => Err(NetlogError::capture_start(interface, reason)),
            None => Err(NetlogError::capture_start(interface, "no stream queued")),
        }
    }
}

struct ChannelStream {
    interface: String,
    records: mpsc::UnboundedReceiver<Result<PacketRecord>>,
}

#[async_trait]
impl PacketStream for ChannelStream {
    async fn next_packet(&mut self) -> Result<PacketRecord> {
        match self.records.recv().await {
            Some(item) => item,
            None => Err(NetlogError::capture(&self.interface, "stream closed")),
        }
    }
}
