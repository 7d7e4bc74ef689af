//! Discovery of host network interfaces eligible for capture

use crate::{NetlogError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io;
use tokio::process::Command;
use tracing::debug;

/// Interface name prefixes captured by default: Linux bridges, Docker
/// bridges, classic and predictable Ethernet names, bonds
pub const DEFAULT_PREFIXES: &[&str] = &["br-", "docker", "eth", "ens", "bond"];

#[async_trait]
pub trait InterfaceDiscovery: Send + Sync {
    /// Names of the eligible interfaces currently present
    ///
    /// An error means discovery itself failed, which is different from
    /// finding no interfaces.
    async fn discover(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl<F> InterfaceDiscovery for F
where
    F: Fn() -> Result<Vec<String>> + Send + Sync,
{
    async fn discover(&self) -> Result<Vec<String>> {
        self()
    }
}

/// Interface name prefix allowlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixAllowlist {
    prefixes: Vec<String>,
}

impl PrefixAllowlist {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

impl Default for PrefixAllowlist {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIXES.iter().copied())
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
}

/// Discovery through iproute2's JSON output (`ip -j link show`)
#[derive(Debug, Clone)]
pub struct IpLinkDiscovery {
    program: String,
    allowlist: PrefixAllowlist,
}

impl IpLinkDiscovery {
    pub fn new(allowlist: PrefixAllowlist) -> Self {
        Self {
            program: "ip".to_string(),
            allowlist,
        }
    }

    /// Use a different `ip` binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl InterfaceDiscovery for IpLinkDiscovery {
    async fn discover(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.program)
            .args(["-j", "link", "show"])
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => NetlogError::Discovery(format!(
                    "'{}' command is missing; ensure iproute2 is installed",
                    self.program
                )),
                _ => NetlogError::Discovery(format!("failed to run '{}': {}", self.program, e)),
            })?;

        if !output.status.success() {
            return Err(NetlogError::Discovery(format!(
                "'{} -j link show' exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let names = parse_ip_link_json(&output.stdout, &self.allowlist)?;
        debug!("Discovered interfaces: {:?}", names);
        Ok(names)
    }
}

/// Extract allowlisted interface names from `ip -j link show` output,
/// sorted and without duplicates
pub fn parse_ip_link_json(json: &[u8], allowlist: &PrefixAllowlist) -> Result<Vec<String>> {
    let links: Vec<IpLink> = serde_json::from_slice(json)
        .map_err(|e| NetlogError::Discovery(format!("unreadable 'ip -j link' output: {}", e)))?;

    let names: BTreeSet<String> = links
        .into_iter()
        .map(|link| link.ifname)
        .filter(|name| allowlist.matches(name))
        .collect();

    Ok(names.into_iter().collect())
}
