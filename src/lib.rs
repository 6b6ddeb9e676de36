//! # natbox
//!
//! Software NAT data plane for IPv4.
//!
//! Translates outbound flows from many isolated internal namespaces onto a
//! single external address and mirror-translates the returning inbound
//! packets, rewriting buffers in place:
//!
//! - **Connection tracking**: dual-indexed flow tables (internal five-tuple
//!   and external four-tuple) with per-namespace quotas, LRU eviction on
//!   insertion, protocol-specific idle timeouts, and FIN/RST-driven teardown
//! - **Translation**: in-place IPv4, TCP, UDP and ICMP-echo header
//!   rewriting with full checksum recomputation, plus destination redirect
//!   and destination-port drop rules
//! - **Port allocation**: lock-free ephemeral port issuer feeding unique
//!   external source identifiers
//!
//! Packet I/O stays with the caller: hand [`NatTable::handle_outbound`] and
//! [`NatTable::handle_inbound`] mutable byte buffers and route or discard
//! each packet according to the verdict. Namespaces are opaque `u64`
//! handles; inbound translation reports which namespace a packet belongs
//! to.
//!
//! # Example
//!
//! ```
//! use std::net::Ipv4Addr;
//!
//! use natbox::{NatTable, Protocol};
//!
//! let table = NatTable::new(Ipv4Addr::new(203, 0, 113, 1));
//! table.add_drop_rule(Protocol::Tcp, 25);
//!
//! // In the datapath, per packet:
//! // let verdict = table.handle_outbound(&mut buf, namespace)?;
//! // ...and periodically:
//! table.run_maintenance(1_700_000_000);
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod allocator;
pub mod checksum;
pub mod conntrack;
pub mod error;
pub mod packet;
pub mod table;

pub use addr::{parse_ipv4, NatIp};
pub use conntrack::{
    DropRule, ExternalKey, Flow, InternalKey, Namespace, Pair, RedirectRule,
};
pub use error::{NatError, Result};
pub use packet::{IcmpHeader, Ipv4Header, Protocol, TcpHeader, UdpHeader};
pub use table::{
    InboundResult, NatConfig, NatTable, OutboundResult, StatsSnapshot,
};
