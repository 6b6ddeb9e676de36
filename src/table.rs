//! NAT table orchestration.
//!
//! [`NatTable`] owns one flow [`Pair`] per protocol, the external address,
//! the port allocator, the clock and the per-protocol timeouts, and drives
//! per-packet translation in both directions. Handlers rewrite the caller's
//! buffer in place and return a verdict; the caller routes or discards the
//! packet accordingly.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::allocator::{PortAllocator, EPHEMERAL_PORT_END, EPHEMERAL_PORT_START};
use crate::checksum;
use crate::conntrack::{DropRule, ExternalKey, Flow, InternalKey, Namespace, Pair, RedirectRule};
use crate::error::Result;
use crate::packet::{IcmpHeader, Ipv4Header, Protocol, TcpHeader, UdpHeader};

/// Ports taken from the rotation before falling back to a random probe.
const MAX_PORT_ATTEMPTS: usize = 1000;

/// Per-table tunables.
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// Maximum unswept flows per namespace; 0 disables the cap.
    pub max_conn_per_namespace: usize,
    /// Idle timeout for TCP flows, in seconds.
    pub tcp_timeout: i64,
    /// Idle timeout for UDP flows, in seconds.
    pub udp_timeout: i64,
    /// Idle timeout for ICMP flows, in seconds.
    pub icmp_timeout: i64,
    /// First port of the external port range.
    pub port_range_start: u16,
    /// Last port of the external port range.
    pub port_range_end: u16,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            max_conn_per_namespace: 200,
            tcp_timeout: 86_400, // 24 hours
            udp_timeout: 180,    // 3 minutes
            icmp_timeout: 30,
            port_range_start: EPHEMERAL_PORT_START,
            port_range_end: EPHEMERAL_PORT_END,
        }
    }
}

impl NatConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-namespace flow cap. 0 disables the cap.
    #[must_use]
    pub const fn with_max_conn_per_namespace(mut self, max: usize) -> Self {
        self.max_conn_per_namespace = max;
        self
    }

    /// Sets the TCP idle timeout in seconds.
    #[must_use]
    pub const fn with_tcp_timeout(mut self, secs: i64) -> Self {
        self.tcp_timeout = secs;
        self
    }

    /// Sets the UDP idle timeout in seconds.
    #[must_use]
    pub const fn with_udp_timeout(mut self, secs: i64) -> Self {
        self.udp_timeout = secs;
        self
    }

    /// Sets the ICMP idle timeout in seconds.
    #[must_use]
    pub const fn with_icmp_timeout(mut self, secs: i64) -> Self {
        self.icmp_timeout = secs;
        self
    }

    /// Sets the external port range.
    #[must_use]
    pub const fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }
}

/// Outcome of outbound translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundResult {
    /// Buffer rewritten; forward it to the external network.
    Translated,
    /// Not subject to NAT; forward the buffer unmodified.
    PassThrough,
    /// Silently discard the packet.
    Dropped,
}

/// Outcome of inbound translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundResult {
    /// Buffer rewritten; deliver it to the returned namespace.
    Translated(Namespace),
    /// Silently discard the packet.
    Dropped,
}

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Default)]
struct NatStats {
    outbound_translated: AtomicU64,
    inbound_translated: AtomicU64,
    dropped: AtomicU64,
    flows_created: AtomicU64,
    flows_expired: AtomicU64,
}

/// Point-in-time view of the table counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Outbound packets rewritten.
    pub outbound_translated: u64,
    /// Inbound packets rewritten.
    pub inbound_translated: u64,
    /// Packets answered with a drop verdict.
    pub dropped: u64,
    /// Flows created.
    pub flows_created: u64,
    /// Flows removed by maintenance.
    pub flows_expired: u64,
}

/// IPv4 NAT table.
///
/// Shared state is internally synchronized; wrap the table in an `Arc` and
/// call the handlers from any number of threads. Maintenance may run
/// concurrently with translation.
pub struct NatTable {
    tcp: Pair<Ipv4Addr>,
    udp: Pair<Ipv4Addr>,
    icmp: Pair<Ipv4Addr>,

    external_ip: RwLock<Ipv4Addr>,
    ports: PortAllocator,
    clock: Clock,

    max_conn_per_namespace: usize,
    tcp_timeout: i64,
    udp_timeout: i64,
    icmp_timeout: i64,

    stats: NatStats,
}

impl NatTable {
    /// Creates a table translating onto `external_ip` with default settings.
    #[must_use]
    pub fn new(external_ip: Ipv4Addr) -> Self {
        Self::with_config(external_ip, NatConfig::default())
    }

    /// Creates a table with explicit settings.
    #[must_use]
    pub fn with_config(external_ip: Ipv4Addr, config: NatConfig) -> Self {
        Self {
            tcp: Pair::new(),
            udp: Pair::new(),
            icmp: Pair::new(),
            external_ip: RwLock::new(external_ip),
            ports: PortAllocator::new(config.port_range_start, config.port_range_end),
            clock: Box::new(default_clock),
            max_conn_per_namespace: config.max_conn_per_namespace,
            tcp_timeout: config.tcp_timeout,
            udp_timeout: config.udp_timeout,
            icmp_timeout: config.icmp_timeout,
            stats: NatStats::default(),
        }
    }

    /// Replaces the time source.
    ///
    /// The clock returns Unix seconds and must be monotone. At line rate a
    /// cached atomic read refreshed by a timer thread beats querying the
    /// system clock per packet.
    pub fn set_clock(&mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) {
        self.clock = Box::new(clock);
    }

    /// Sets the external address used for new outbound translations.
    ///
    /// Existing flows keep the address they were created with.
    pub fn set_external_ip(&self, ip: Ipv4Addr) {
        *self.external_ip.write() = ip;
    }

    /// Returns the current external address.
    #[must_use]
    pub fn external_ip(&self) -> Ipv4Addr {
        *self.external_ip.read()
    }

    /// Total tracked flows across all protocols.
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.tcp.len() + self.udp.len() + self.icmp.len()
    }

    /// Returns a snapshot of the table counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            outbound_translated: self.stats.outbound_translated.load(Ordering::Relaxed),
            inbound_translated: self.stats.inbound_translated.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            flows_created: self.stats.flows_created.load(Ordering::Relaxed),
            flows_expired: self.stats.flows_expired.load(Ordering::Relaxed),
        }
    }

    /// Translates an outbound packet in place.
    ///
    /// Parses the IPv4 header, consults or creates the flow for the packet's
    /// tuple, rewrites the source (and, under a redirect rule, the
    /// destination), and refreshes all checksums. The buffer is only
    /// modified on [`OutboundResult::Translated`].
    ///
    /// # Errors
    ///
    /// Returns a parse error for packets too short or otherwise malformed;
    /// the buffer is untouched in that case.
    pub fn handle_outbound(
        &self,
        packet: &mut [u8],
        namespace: Namespace,
    ) -> Result<OutboundResult> {
        let mut ip = Ipv4Header::parse(packet)?;
        let now = self.now();

        let result = match Protocol::from(ip.protocol) {
            Protocol::Tcp => self.outbound_tcp(packet, &mut ip, namespace, now)?,
            Protocol::Udp => self.outbound_udp(packet, &mut ip, namespace, now)?,
            Protocol::Icmp => self.outbound_icmp(packet, &mut ip, namespace, now)?,
            Protocol::Unknown => {
                tracing::trace!(protocol = ip.protocol, "unsupported outbound protocol");
                OutboundResult::Dropped
            }
        };

        match result {
            OutboundResult::Translated => {
                self.stats.outbound_translated.fetch_add(1, Ordering::Relaxed);
            }
            OutboundResult::Dropped => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            OutboundResult::PassThrough => {}
        }
        Ok(result)
    }

    /// Translates an inbound packet in place.
    ///
    /// Looks the packet up by its wire tuple, restores the original internal
    /// destination (and, for redirected flows, the source the client
    /// expects), refreshes all checksums, and reports the namespace the
    /// packet belongs to.
    ///
    /// # Errors
    ///
    /// Returns a parse error for packets too short or otherwise malformed;
    /// the buffer is untouched in that case.
    pub fn handle_inbound(&self, packet: &mut [u8]) -> Result<InboundResult> {
        let mut ip = Ipv4Header::parse(packet)?;
        let now = self.now();

        let result = match Protocol::from(ip.protocol) {
            Protocol::Tcp => self.inbound_tcp(packet, &mut ip, now)?,
            Protocol::Udp => self.inbound_udp(packet, &mut ip, now)?,
            Protocol::Icmp => self.inbound_icmp(packet, &mut ip, now)?,
            Protocol::Unknown => {
                tracing::trace!(protocol = ip.protocol, "unsupported inbound protocol");
                InboundResult::Dropped
            }
        };

        match result {
            InboundResult::Translated(_) => {
                self.stats.inbound_translated.fetch_add(1, Ordering::Relaxed);
            }
            InboundResult::Dropped => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(result)
    }

    /// Removes expired and swept flows from every protocol table.
    ///
    /// Call periodically (every 30 seconds is typical) with the current Unix
    /// time. Idempotent, and safe to run concurrently with the handlers.
    pub fn run_maintenance(&self, now: i64) {
        let removed = self.tcp.cleanup_expired(now, self.tcp_timeout)
            + self.udp.cleanup_expired(now, self.udp_timeout)
            + self.icmp.cleanup_expired(now, self.icmp_timeout);

        if removed > 0 {
            self.stats
                .flows_expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "maintenance removed expired flows");
        }
    }

    /// Appends a drop rule: outbound packets to `dst_port` are discarded.
    ///
    /// Drop rules apply to TCP and UDP; ICMP has no destination port to
    /// match and requests for it are ignored.
    pub fn add_drop_rule(&self, protocol: Protocol, dst_port: u16) {
        let rule = DropRule { dst_port };
        match protocol {
            Protocol::Tcp => self.tcp.add_drop_rule(rule),
            Protocol::Udp => self.udp.add_drop_rule(rule),
            _ => tracing::debug!(?protocol, "drop rules apply to TCP and UDP only"),
        }
    }

    /// Removes the first drop rule for `dst_port`. Returns true if one was
    /// removed.
    pub fn remove_drop_rule(&self, protocol: Protocol, dst_port: u16) -> bool {
        match protocol {
            Protocol::Tcp => self.tcp.remove_drop_rule(dst_port),
            Protocol::Udp => self.udp.remove_drop_rule(dst_port),
            _ => false,
        }
    }

    /// Appends a redirect rule: new flows to `(dst_ip, dst_port)` are sent
    /// to `(new_dst_ip, new_dst_port)` instead, with returning packets
    /// restored so the client keeps seeing the address it targeted.
    ///
    /// Rules match in insertion order; the first match wins. For ICMP the
    /// port halves are ignored and matched as 0.
    pub fn add_redirect_rule(
        &self,
        protocol: Protocol,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        new_dst_ip: Ipv4Addr,
        new_dst_port: u16,
    ) {
        let rule = RedirectRule {
            dst_ip,
            dst_port,
            new_dst_ip,
            new_dst_port,
        };
        match protocol {
            Protocol::Tcp => self.tcp.add_redirect_rule(rule),
            Protocol::Udp => self.udp.add_redirect_rule(rule),
            Protocol::Icmp => self.icmp.add_redirect_rule(rule),
            Protocol::Unknown => {
                tracing::debug!("redirect rule for unknown protocol ignored");
            }
        }
    }

    /// Removes the first redirect rule for `(dst_ip, dst_port)`. Returns
    /// true if one was removed. Existing flows keep their rewrite.
    pub fn remove_redirect_rule(
        &self,
        protocol: Protocol,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> bool {
        match protocol {
            Protocol::Tcp => self.tcp.remove_redirect_rule(dst_ip, dst_port),
            Protocol::Udp => self.udp.remove_redirect_rule(dst_ip, dst_port),
            Protocol::Icmp => self.icmp.remove_redirect_rule(dst_ip, dst_port),
            Protocol::Unknown => false,
        }
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Inserts a new flow, retrying the allocator until the external key is
    /// free. The rotation is walked up to [`MAX_PORT_ATTEMPTS`] times, then
    /// one random port is probed.
    fn insert_with_unique_port(
        &self,
        pair: &Pair<Ipv4Addr>,
        make_flow: impl Fn(u16) -> Flow<Ipv4Addr>,
    ) -> Option<Arc<Flow<Ipv4Addr>>> {
        for attempt in 0..=MAX_PORT_ATTEMPTS {
            let port = if attempt == MAX_PORT_ATTEMPTS {
                self.ports.allocate_random()
            } else {
                self.ports.allocate()
            };
            if let Some(flow) = pair.add_connection(make_flow(port), self.max_conn_per_namespace)
            {
                self.stats.flows_created.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    namespace = flow.namespace,
                    port,
                    protocol = ?flow.protocol,
                    "created flow"
                );
                return Some(flow);
            }
        }
        tracing::debug!("no free external port for new flow");
        None
    }

    fn outbound_tcp(
        &self,
        packet: &mut [u8],
        ip: &mut Ipv4Header,
        namespace: Namespace,
        now: i64,
    ) -> Result<OutboundResult> {
        let header_len = ip.header_len();
        let mut tcp = TcpHeader::parse(packet, header_len)?;

        if self.tcp.check_drop_rule(tcp.dst_port) {
            tracing::trace!(port = tcp.dst_port, "outbound TCP matched drop rule");
            return Ok(OutboundResult::Dropped);
        }

        let key = InternalKey {
            src_ip: ip.src_ip,
            dst_ip: ip.dst_ip,
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
            namespace,
        };

        let flow = match self.tcp.lookup_outbound(&key) {
            Some(flow) => {
                flow.touch(now);
                flow
            }
            None => {
                let redirect = self.tcp.check_redirect_rule(key.dst_ip, key.dst_port);
                let (outside_dst_ip, outside_dst_port) =
                    redirect.unwrap_or((key.dst_ip, key.dst_port));
                let external_ip = self.external_ip();

                match self.insert_with_unique_port(&self.tcp, |port| Flow {
                    protocol: Protocol::Tcp,
                    namespace,
                    local_src_ip: key.src_ip,
                    local_src_port: key.src_port,
                    local_dst_ip: key.dst_ip,
                    local_dst_port: key.dst_port,
                    outside_src_ip: external_ip,
                    outside_src_port: port,
                    outside_dst_ip,
                    outside_dst_port,
                    rewrite_destination: redirect.is_some(),
                    last_seen: AtomicI64::new(now),
                    pending_sweep: AtomicBool::new(false),
                }) {
                    Some(flow) => flow,
                    None => return Ok(OutboundResult::Dropped),
                }
            }
        };

        ip.src_ip = flow.outside_src_ip;
        tcp.src_port = flow.outside_src_port;
        if flow.rewrite_destination {
            ip.dst_ip = flow.outside_dst_ip;
            tcp.dst_port = flow.outside_dst_port;
        }

        ip.write(packet);
        tcp.write(packet, header_len);
        write_l4_checksum(packet, header_len, Protocol::Tcp, ip.src_ip, ip.dst_ip);

        if tcp.flags & (TcpHeader::FLAG_FIN | TcpHeader::FLAG_RST) != 0 {
            flow.mark_pending_sweep();
        }

        Ok(OutboundResult::Translated)
    }

    fn outbound_udp(
        &self,
        packet: &mut [u8],
        ip: &mut Ipv4Header,
        namespace: Namespace,
        now: i64,
    ) -> Result<OutboundResult> {
        let header_len = ip.header_len();
        let mut udp = UdpHeader::parse(packet, header_len)?;

        if self.udp.check_drop_rule(udp.dst_port) {
            tracing::trace!(port = udp.dst_port, "outbound UDP matched drop rule");
            return Ok(OutboundResult::Dropped);
        }

        let key = InternalKey {
            src_ip: ip.src_ip,
            dst_ip: ip.dst_ip,
            src_port: udp.src_port,
            dst_port: udp.dst_port,
            namespace,
        };

        let flow = match self.udp.lookup_outbound(&key) {
            Some(flow) => {
                flow.touch(now);
                flow
            }
            None => {
                let redirect = self.udp.check_redirect_rule(key.dst_ip, key.dst_port);
                let (outside_dst_ip, outside_dst_port) =
                    redirect.unwrap_or((key.dst_ip, key.dst_port));
                let external_ip = self.external_ip();

                match self.insert_with_unique_port(&self.udp, |port| Flow {
                    protocol: Protocol::Udp,
                    namespace,
                    local_src_ip: key.src_ip,
                    local_src_port: key.src_port,
                    local_dst_ip: key.dst_ip,
                    local_dst_port: key.dst_port,
                    outside_src_ip: external_ip,
                    outside_src_port: port,
                    outside_dst_ip,
                    outside_dst_port,
                    rewrite_destination: redirect.is_some(),
                    last_seen: AtomicI64::new(now),
                    pending_sweep: AtomicBool::new(false),
                }) {
                    Some(flow) => flow,
                    None => return Ok(OutboundResult::Dropped),
                }
            }
        };

        ip.src_ip = flow.outside_src_ip;
        udp.src_port = flow.outside_src_port;
        if flow.rewrite_destination {
            ip.dst_ip = flow.outside_dst_ip;
            udp.dst_port = flow.outside_dst_port;
        }

        ip.write(packet);
        udp.write(packet, header_len);
        write_l4_checksum(packet, header_len, Protocol::Udp, ip.src_ip, ip.dst_ip);

        Ok(OutboundResult::Translated)
    }

    fn outbound_icmp(
        &self,
        packet: &mut [u8],
        ip: &mut Ipv4Header,
        namespace: Namespace,
        now: i64,
    ) -> Result<OutboundResult> {
        let header_len = ip.header_len();
        let mut icmp = IcmpHeader::parse(packet, header_len)?;

        // Only echo traffic is translated; other types cross untouched.
        if icmp.icmp_type != IcmpHeader::ECHO_REQUEST && icmp.icmp_type != IcmpHeader::ECHO_REPLY
        {
            return Ok(OutboundResult::PassThrough);
        }

        let key = InternalKey {
            src_ip: ip.src_ip,
            dst_ip: ip.dst_ip,
            src_port: icmp.identifier,
            dst_port: 0,
            namespace,
        };

        let flow = match self.icmp.lookup_outbound(&key) {
            Some(flow) => {
                flow.touch(now);
                flow
            }
            None => {
                // The echo identifier stands in for the port; a redirect
                // rule can move the destination host but not a port.
                let redirect = self.icmp.check_redirect_rule(key.dst_ip, 0);
                let outside_dst_ip = redirect.map_or(key.dst_ip, |(target, _)| target);
                let external_ip = self.external_ip();

                match self.insert_with_unique_port(&self.icmp, |identifier| Flow {
                    protocol: Protocol::Icmp,
                    namespace,
                    local_src_ip: key.src_ip,
                    local_src_port: key.src_port,
                    local_dst_ip: key.dst_ip,
                    local_dst_port: 0,
                    outside_src_ip: external_ip,
                    outside_src_port: identifier,
                    outside_dst_ip,
                    outside_dst_port: 0,
                    rewrite_destination: redirect.is_some(),
                    last_seen: AtomicI64::new(now),
                    pending_sweep: AtomicBool::new(false),
                }) {
                    Some(flow) => flow,
                    None => return Ok(OutboundResult::Dropped),
                }
            }
        };

        ip.src_ip = flow.outside_src_ip;
        icmp.identifier = flow.outside_src_port;
        if flow.rewrite_destination {
            ip.dst_ip = flow.outside_dst_ip;
        }

        ip.write(packet);
        icmp.write(packet, header_len);
        write_icmp_checksum(packet, header_len);

        Ok(OutboundResult::Translated)
    }

    fn inbound_tcp(
        &self,
        packet: &mut [u8],
        ip: &mut Ipv4Header,
        now: i64,
    ) -> Result<InboundResult> {
        let header_len = ip.header_len();
        let mut tcp = TcpHeader::parse(packet, header_len)?;

        let key = ExternalKey {
            src_ip: ip.src_ip,
            dst_ip: ip.dst_ip,
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
        };

        let Some(flow) = self.tcp.lookup_inbound(&key) else {
            tracing::trace!(port = tcp.dst_port, "inbound TCP has no matching flow");
            return Ok(InboundResult::Dropped);
        };
        flow.touch(now);

        ip.dst_ip = flow.local_src_ip;
        tcp.dst_port = flow.local_src_port;
        if flow.rewrite_destination {
            ip.src_ip = flow.local_dst_ip;
            tcp.src_port = flow.local_dst_port;
        }

        ip.write(packet);
        tcp.write(packet, header_len);
        write_l4_checksum(packet, header_len, Protocol::Tcp, ip.src_ip, ip.dst_ip);

        if tcp.flags & (TcpHeader::FLAG_FIN | TcpHeader::FLAG_RST) != 0 {
            flow.mark_pending_sweep();
        }

        Ok(InboundResult::Translated(flow.namespace))
    }

    fn inbound_udp(
        &self,
        packet: &mut [u8],
        ip: &mut Ipv4Header,
        now: i64,
    ) -> Result<InboundResult> {
        let header_len = ip.header_len();
        let mut udp = UdpHeader::parse(packet, header_len)?;

        let key = ExternalKey {
            src_ip: ip.src_ip,
            dst_ip: ip.dst_ip,
            src_port: udp.src_port,
            dst_port: udp.dst_port,
        };

        let Some(flow) = self.udp.lookup_inbound(&key) else {
            tracing::trace!(port = udp.dst_port, "inbound UDP has no matching flow");
            return Ok(InboundResult::Dropped);
        };
        flow.touch(now);

        ip.dst_ip = flow.local_src_ip;
        udp.dst_port = flow.local_src_port;
        if flow.rewrite_destination {
            ip.src_ip = flow.local_dst_ip;
            udp.src_port = flow.local_dst_port;
        }

        ip.write(packet);
        udp.write(packet, header_len);
        write_l4_checksum(packet, header_len, Protocol::Udp, ip.src_ip, ip.dst_ip);

        Ok(InboundResult::Translated(flow.namespace))
    }

    fn inbound_icmp(
        &self,
        packet: &mut [u8],
        ip: &mut Ipv4Header,
        now: i64,
    ) -> Result<InboundResult> {
        let header_len = ip.header_len();
        let mut icmp = IcmpHeader::parse(packet, header_len)?;

        match icmp.icmp_type {
            IcmpHeader::ECHO_REPLY | IcmpHeader::ECHO_REQUEST => {
                let key = ExternalKey {
                    src_ip: ip.src_ip,
                    dst_ip: ip.dst_ip,
                    src_port: 0,
                    dst_port: icmp.identifier,
                };

                let Some(flow) = self.icmp.lookup_inbound(&key) else {
                    tracing::trace!(
                        identifier = icmp.identifier,
                        "inbound ICMP echo has no matching flow"
                    );
                    return Ok(InboundResult::Dropped);
                };
                flow.touch(now);

                ip.dst_ip = flow.local_src_ip;
                icmp.identifier = flow.local_src_port;
                if flow.rewrite_destination {
                    ip.src_ip = flow.local_dst_ip;
                }

                ip.write(packet);
                icmp.write(packet, header_len);
                write_icmp_checksum(packet, header_len);

                Ok(InboundResult::Translated(flow.namespace))
            }
            // Mapping an embedded error packet back to its flow needs the
            // inner header parsed; not done yet, so the error is dropped.
            IcmpHeader::DESTINATION_UNREACHABLE => Ok(InboundResult::Dropped),
            _ => Ok(InboundResult::Dropped),
        }
    }
}

impl std::fmt::Debug for NatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTable")
            .field("external_ip", &self.external_ip())
            .field("tcp_flows", &self.tcp.len())
            .field("udp_flows", &self.udp.len())
            .field("icmp_flows", &self.icmp.len())
            .finish()
    }
}

fn default_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Clears and recomputes the L4 checksum over the pseudo-header and the
/// segment following the IPv4 header.
fn write_l4_checksum(
    packet: &mut [u8],
    header_len: usize,
    protocol: Protocol,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) {
    let offset = header_len
        + match protocol {
            Protocol::Tcp => TcpHeader::CHECKSUM_OFFSET,
            Protocol::Udp => UdpHeader::CHECKSUM_OFFSET,
            _ => return,
        };

    packet[offset..offset + 2].copy_from_slice(&[0, 0]);
    let segment = &packet[header_len..];
    let sum = match protocol {
        Protocol::Tcp => checksum::l4_checksum(src_ip, dst_ip, Protocol::Tcp as u8, segment),
        Protocol::Udp => checksum::udp_checksum(src_ip, dst_ip, segment),
        _ => return,
    };
    packet[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}

/// Clears and recomputes the ICMP checksum over the ICMP header and payload.
fn write_icmp_checksum(packet: &mut [u8], header_len: usize) {
    let offset = header_len + IcmpHeader::CHECKSUM_OFFSET;
    packet[offset..offset + 2].copy_from_slice(&[0, 0]);
    let sum = checksum::icmp_checksum(&packet[header_len..]);
    packet[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatConfig::default();
        assert_eq!(config.max_conn_per_namespace, 200);
        assert_eq!(config.tcp_timeout, 86_400);
        assert_eq!(config.udp_timeout, 180);
        assert_eq!(config.icmp_timeout, 30);
        assert_eq!(config.port_range_start, 49152);
        assert_eq!(config.port_range_end, 65535);
    }

    #[test]
    fn test_config_builder() {
        let config = NatConfig::new()
            .with_max_conn_per_namespace(16)
            .with_tcp_timeout(600)
            .with_udp_timeout(60)
            .with_icmp_timeout(10)
            .with_port_range(10000, 20000);

        assert_eq!(config.max_conn_per_namespace, 16);
        assert_eq!(config.tcp_timeout, 600);
        assert_eq!(config.udp_timeout, 60);
        assert_eq!(config.icmp_timeout, 10);
        assert_eq!(config.port_range_start, 10000);
        assert_eq!(config.port_range_end, 20000);
    }

    #[test]
    fn test_external_ip_is_updatable() {
        let table = NatTable::new(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(table.external_ip(), Ipv4Addr::new(1, 2, 3, 4));

        table.set_external_ip(Ipv4Addr::new(5, 6, 7, 8));
        assert_eq!(table.external_ip(), Ipv4Addr::new(5, 6, 7, 8));
    }

    #[test]
    fn test_clock_override() {
        let mut table = NatTable::new(Ipv4Addr::new(1, 2, 3, 4));
        table.set_clock(|| 4242);
        assert_eq!(table.now(), 4242);
    }

    #[test]
    fn test_empty_table_debug() {
        let table = NatTable::new(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(table.flow_count(), 0);
        let debug = format!("{table:?}");
        assert!(debug.contains("1.2.3.4"));
    }
}
