//! Resolution of `.local` device names over multicast DNS.
//!
//! A query goes out on every IPv4 interface at once from an ephemeral port,
//! which makes responders answer us directly (legacy unicast). The first A
//! record for the name wins; the remaining sockets are dropped immediately.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info};

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(15);

const MAX_LABEL_LEN: usize = 63;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Whether `target` must go through mDNS
pub fn is_local_name(target: &str) -> bool {
    target.to_ascii_lowercase().ends_with(".local")
}

/// One-shot name lookup, the part of resolution that touches the network
#[async_trait::async_trait]
pub trait AddressLookup: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<Ipv4Addr>;
}

/// Resolver with a process-lifetime cache of answered names
pub struct LocalTargetResolver {
    lookup: Box<dyn AddressLookup>,
    cache: RwLock<HashMap<String, Ipv4Addr>>,
    lookups: AtomicU64,
}

impl LocalTargetResolver {
    pub fn new() -> Self {
        Self::with_lookup(Box::new(MulticastDns::new(RESOLVE_TIMEOUT)))
    }

    pub fn with_lookup(lookup: Box<dyn AddressLookup>) -> Self {
        Self {
            lookup,
            cache: RwLock::new(HashMap::new()),
            lookups: AtomicU64::new(0),
        }
    }

    /// Resolve a `.local` name to an address; anything else is returned as is.
    pub async fn resolve(&self, target: &str) -> Result<String> {
        if !is_local_name(target) {
            return Ok(target.to_string());
        }

        let key = target.to_ascii_lowercase();
        if let Some(addr) = self.cache.read().await.get(&key) {
            debug!(target = %target, address = %addr, "resolved from cache");
            return Ok(addr.to_string());
        }

        self.lookups.fetch_add(1, Ordering::Relaxed);
        let addr = self.lookup.lookup(target).await?;
        info!(target = %target, address = %addr, "resolved local target");

        self.cache.write().await.insert(key, addr);
        Ok(addr.to_string())
    }

    /// Number of network lookups issued so far
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl Default for LocalTargetResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// mDNS lookup racing one socket per IPv4 interface
pub struct MulticastDns {
    timeout: Duration,
}

impl MulticastDns {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl AddressLookup for MulticastDns {
    async fn lookup(&self, name: &str) -> Result<Ipv4Addr> {
        let interfaces = ipv4_interfaces()?;
        if interfaces.is_empty() {
            bail!("Did not find any network interfaces");
        }

        let query = encode_query(name, rand::random())?;
        let mut sockets = JoinSet::new();
        for iface in interfaces {
            let query = query.clone();
            let name = name.to_string();
            sockets.spawn(async move { query_interface(iface, &query, &name).await });
        }

        let answer = tokio::time::timeout(self.timeout, async {
            while let Some(joined) = sockets.join_next().await {
                match joined {
                    Ok(Ok(addr)) => return Some(addr),
                    Ok(Err(e)) => debug!(error = %format!("{:#}", e), "mDNS query failed on interface"),
                    Err(e) => debug!(error = %e, "mDNS query task failed"),
                }
            }
            None
        })
        .await;

        // Closes every socket still waiting
        sockets.abort_all();

        match answer {
            Ok(Some(addr)) => Ok(addr),
            _ => bail!("Could not resolve {}", name),
        }
    }
}

async fn query_interface(iface: Ipv4Addr, query: &[u8], name: &str) -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(iface, 0))
        .await
        .with_context(|| format!("binding mDNS socket on {}", iface))?;
    set_multicast_interface(&socket, iface)?;

    socket
        .send_to(query, SocketAddrV4::new(MDNS_GROUP, MDNS_PORT))
        .await
        .with_context(|| format!("sending mDNS query on {}", iface))?;

    let mut buf = vec![0u8; 9000];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if let Some(addr) = parse_a_answer(&buf[..len], name) {
            debug!(interface = %iface, responder = %from, "mDNS answer");
            return Ok(addr);
        }
    }
}

fn set_multicast_interface(socket: &UdpSocket, iface: Ipv4Addr) -> Result<()> {
    let addr = libc::in_addr {
        s_addr: u32::from(iface).to_be(),
    };
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // `addr` is a valid in_addr of the length passed.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            &addr as *const libc::in_addr as *const libc::c_void,
            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("selecting multicast interface {}", iface));
    }
    Ok(())
}

/// Non-loopback IPv4 addresses of this host
fn ipv4_interfaces() -> Result<Vec<Ipv4Addr>> {
    use nix::net::if_::InterfaceFlags;

    let addrs = nix::ifaddrs::getifaddrs().context("listing network interfaces")?;
    let mut found: Vec<Ipv4Addr> = addrs
        .filter(|ifa| !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK))
        .filter_map(|ifa| {
            let sin = ifa.address.as_ref()?.as_sockaddr_in()?;
            Some(*SocketAddrV4::from(*sin).ip())
        })
        .collect();
    found.dedup();
    Ok(found)
}

/// Build a single-question A query for `name`
pub fn encode_query(name: &str, id: u16) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(12 + name.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // flags: standard query
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // AN/NS/AR counts

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            bail!("Invalid label {:?} in {}", label, name);
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Find an A record for `name` among the answer and additional records
pub fn parse_a_answer(packet: &[u8], name: &str) -> Option<Ipv4Addr> {
    let read_u16 = |pos: usize| -> Option<u16> {
        Some(u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]))
    };

    let flags = read_u16(2)?;
    if flags & 0x8000 == 0 {
        return None; // a query, not a response
    }
    let questions = read_u16(4)?;
    let records = read_u16(6)? as usize + read_u16(8)? as usize + read_u16(10)? as usize;

    let mut pos = 12;
    for _ in 0..questions {
        let (_, next) = read_name(packet, pos)?;
        pos = next + 4;
    }

    let wanted = name.trim_end_matches('.');
    for _ in 0..records {
        let (record_name, next) = read_name(packet, pos)?;
        let rtype = read_u16(next)?;
        let rdlen = read_u16(next + 8)? as usize;
        let rdata = next + 10;
        let rdata_bytes = packet.get(rdata..rdata + rdlen)?;

        if rtype == TYPE_A && rdlen == 4 && record_name.eq_ignore_ascii_case(wanted) {
            return Some(Ipv4Addr::new(
                rdata_bytes[0],
                rdata_bytes[1],
                rdata_bytes[2],
                rdata_bytes[3],
            ));
        }
        pos = rdata + rdlen;
    }
    None
}

/// Decode a possibly compressed name; returns it and the offset after it
fn read_name(packet: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end = None;

    // Bounded so a pointer loop cannot spin forever
    for _ in 0..128 {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            return Some((labels.join("."), end.unwrap_or(pos + 1)));
        }
        if len & 0xC0 == 0xC0 {
            let target = ((len & 0x3F) << 8) | *packet.get(pos + 1)? as usize;
            end.get_or_insert(pos + 2);
            pos = target;
            continue;
        }
        let label = packet.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }
    None
}
