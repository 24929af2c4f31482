//! The balancer-provided list of backends and drop entries.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::client::load_balancing::grpclb::client_stats::GrpclbClientStats;
use crate::client::load_balancing::grpclb::proto::Server;
use crate::client::load_balancing::grpclb::subchannel::TokenAndClientStats;
use crate::client::name_resolution::{Address, Endpoint, TCP_IP_NETWORK_TYPE};

/// The longest LB token the protocol allows.  Longer tokens are truncated
/// during parsing.
pub(crate) const MAX_LB_TOKEN_LENGTH: usize = 50;

/// One entry of a serverlist: either a backend address or a drop instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerEntry {
    pub ip_address: Bytes,
    pub port: i32,
    pub lb_token: Bytes,
    pub drop: bool,
}

impl ServerEntry {
    pub fn from_proto(server: &Server) -> Self {
        let mut lb_token = Bytes::from(server.load_balance_token.clone());
        lb_token.truncate(MAX_LB_TOKEN_LENGTH);
        ServerEntry {
            ip_address: server.ip_address.clone(),
            port: server.port,
            lb_token,
            drop: server.drop,
        }
    }

    /// Reports whether the entry describes a usable backend address.  Drop
    /// entries and entries with a malformed address or port are not usable;
    /// they are skipped by iteration but still participate in equality.
    pub fn is_valid(&self) -> bool {
        if self.drop {
            return false;
        }
        if !(0..=u16::MAX as i32).contains(&self.port) {
            return false;
        }
        self.ip_address.len() == 4 || self.ip_address.len() == 16
    }

    /// The socket address of the entry, or None if the IP bytes are not a
    /// valid IPv4 or IPv6 address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = match self.ip_address.len() {
            4 => {
                let bytes: [u8; 4] = self.ip_address.as_ref().try_into().ok()?;
                Ipv4Addr::from(bytes).into()
            }
            16 => {
                let bytes: [u8; 16] = self.ip_address.as_ref().try_into().ok()?;
                Ipv6Addr::from(bytes).into()
            }
            _ => return None,
        };
        Some(SocketAddr::new(ip, self.port as u16))
    }
}

/// An immutable snapshot of the entries from one SERVERLIST message.
///
/// The drop index is shared by every picker holding this serverlist; it is
/// advanced from application threads, so it is atomic.  Everything else is
/// immutable after construction.
#[derive(Debug, Default)]
pub(crate) struct Serverlist {
    servers: Vec<ServerEntry>,
    drop_index: AtomicUsize,
}

impl PartialEq for Serverlist {
    fn eq(&self, other: &Self) -> bool {
        self.servers == other.servers
    }
}

impl Eq for Serverlist {}

impl Serverlist {
    pub fn new(servers: Vec<ServerEntry>) -> Self {
        Serverlist {
            servers,
            drop_index: AtomicUsize::new(0),
        }
    }

    pub fn from_proto(servers: &[Server]) -> Self {
        Serverlist::new(servers.iter().map(ServerEntry::from_proto).collect())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns a text representation suitable for logging.
    pub fn as_text(&self) -> String {
        let mut entries = String::new();
        for (i, server) in self.servers.iter().enumerate() {
            let ipport = if server.drop {
                "(drop)".to_string()
            } else {
                match server.socket_addr() {
                    Some(addr) => addr.to_string(),
                    None => format!("(invalid address of {} bytes)", server.ip_address.len()),
                }
            };
            entries.push_str(&format!(
                "  {}: {} token={}\n",
                i,
                ipport,
                String::from_utf8_lossy(&server.lb_token)
            ));
        }
        entries
    }

    /// Returns true if the serverlist contains at least one drop entry and
    /// no backend address entries.
    pub fn contains_all_drop_entries(&self) -> bool {
        !self.servers.is_empty() && self.servers.iter().all(|s| s.drop)
    }

    /// Returns the LB token to count a drop against, or None if the call
    /// should not be dropped.
    ///
    /// Note: this is called from the picker on application threads, not
    /// under the policy's serialized context.  The index uses relaxed
    /// ordering; no inter-pick causality is required.
    pub fn should_drop(&self) -> Option<Bytes> {
        if self.servers.is_empty() {
            return None;
        }
        let index = self.drop_index.fetch_add(1, Ordering::Relaxed);
        let server = &self.servers[index % self.servers.len()];
        server.drop.then(|| server.lb_token.clone())
    }

    /// Extracts all usable entries into endpoints for the child policy, each
    /// address annotated with its LB token and the stats handle.
    pub fn backend_endpoints(&self, client_stats: Option<&Arc<GrpclbClientStats>>) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for (i, server) in self.servers.iter().enumerate() {
            if !server.is_valid() {
                if !server.drop {
                    debug!("ignoring invalid entry at index {i} of serverlist");
                }
                continue;
            }
            let Some(addr) = server.socket_addr() else {
                continue;
            };
            if server.lb_token.is_empty() {
                debug!(
                    "missing LB token for backend address '{addr}'; the empty token will be used \
                     instead"
                );
            }
            let address = Address {
                network_type: TCP_IP_NETWORK_TYPE,
                address: addr.to_string().into(),
                attributes: crate::attributes::Attributes::new().add(TokenAndClientStats::new(
                    server.lb_token.clone(),
                    client_stats.cloned(),
                )),
            };
            endpoints.push(Endpoint {
                addresses: vec![address],
                ..Default::default()
            });
        }
        endpoints
    }
}
