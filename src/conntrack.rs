//! Connection tracking for the NAT engine.
//!
//! Each protocol owns a [`Pair`]: a dual-indexed flow table mapping both the
//! internal five-tuple and the external four-tuple to one shared flow
//! record, together with that protocol's redirect and drop rule lists.
//! Lookups take the shared side of a reader-writer lock; insertion,
//! eviction, expiry and rule mutation take the exclusive side. The hot-path
//! fields of a flow (`last_seen`, `pending_sweep`) are atomics so they can
//! be updated under the shared lock.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::addr::NatIp;
use crate::packet::Protocol;

/// Opaque handle identifying the internal tenant a flow belongs to.
///
/// The engine attaches no meaning to the bits beyond equality and hashing.
pub type Namespace = u64;

/// Key identifying a flow as seen from inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InternalKey<A> {
    /// Source address as observed from inside.
    pub src_ip: A,
    /// Destination address as observed from inside.
    pub dst_ip: A,
    /// Source port; the echo identifier for ICMP.
    pub src_port: u16,
    /// Destination port; 0 for ICMP.
    pub dst_port: u16,
    /// Originating namespace.
    pub namespace: Namespace,
}

/// Key identifying a flow as seen on the wire arriving from outside.
///
/// The external party is the source of an inbound packet, so on insertion
/// the key is built inverted: the flow's outside-destination becomes
/// `src_ip`/`src_port` and the flow's outside-source (the external address
/// and allocated port) becomes `dst_ip`/`dst_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalKey<A> {
    /// Remote address, the source of an inbound packet.
    pub src_ip: A,
    /// External address of the table.
    pub dst_ip: A,
    /// Remote port; 0 for ICMP.
    pub src_port: u16,
    /// Allocated external port; the echo identifier for ICMP.
    pub dst_port: u16,
}

/// Destination rewrite applied when a new flow's destination matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRule<A> {
    /// Destination address to match.
    pub dst_ip: A,
    /// Destination port to match.
    pub dst_port: u16,
    /// Replacement destination address.
    pub new_dst_ip: A,
    /// Replacement destination port.
    pub new_dst_port: u16,
}

/// Drops outbound packets addressed to a destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropRule {
    /// Destination port to match.
    pub dst_port: u16,
}

/// One tracked, translated flow.
///
/// The tuple fields are fixed at creation; only `last_seen` and
/// `pending_sweep` change afterwards. Both indexes of a [`Pair`] hold the
/// same `Arc`ed record.
#[derive(Debug)]
pub struct Flow<A> {
    /// L4 protocol of the flow.
    pub protocol: Protocol,
    /// Originating namespace.
    pub namespace: Namespace,

    /// Source address as observed from inside.
    pub local_src_ip: A,
    /// Source port as observed from inside; the echo identifier for ICMP.
    pub local_src_port: u16,
    /// Destination address as observed from inside.
    pub local_dst_ip: A,
    /// Destination port as observed from inside; 0 for ICMP.
    pub local_dst_port: u16,

    /// Source address on the external network; the table's external IP.
    pub outside_src_ip: A,
    /// Allocated external port; the echo identifier for ICMP.
    pub outside_src_port: u16,
    /// Destination on the external network; differs from the local
    /// destination only when a redirect rule matched.
    pub outside_dst_ip: A,
    /// Destination port on the external network; 0 for ICMP.
    pub outside_dst_port: u16,

    /// Set when a redirect rule matched at creation. The destination is
    /// rewritten outbound and the source mirror-restored inbound.
    pub rewrite_destination: bool,

    /// Unix seconds of the most recent packet in either direction.
    pub last_seen: AtomicI64,
    /// Requests removal on the next maintenance pass, set on TCP FIN/RST.
    pub pending_sweep: AtomicBool,
}

impl<A: NatIp> Flow<A> {
    /// The flow's key in the outbound index.
    #[must_use]
    pub fn internal_key(&self) -> InternalKey<A> {
        InternalKey {
            src_ip: self.local_src_ip,
            dst_ip: self.local_dst_ip,
            src_port: self.local_src_port,
            dst_port: self.local_dst_port,
            namespace: self.namespace,
        }
    }

    /// The flow's key in the inbound index, built from the wire view of a
    /// returning packet.
    #[must_use]
    pub fn external_key(&self) -> ExternalKey<A> {
        ExternalKey {
            src_ip: self.outside_dst_ip,
            dst_ip: self.outside_src_ip,
            src_port: self.outside_dst_port,
            dst_port: self.outside_src_port,
        }
    }

    /// Records packet activity at `now`.
    ///
    /// A relaxed atomic store; safe under the shared lock. Monotonicity is
    /// inherited from the caller's time source.
    #[inline]
    pub fn touch(&self, now: i64) {
        self.last_seen.store(now, Ordering::Relaxed);
    }

    /// Returns true if the flow has been idle longer than `timeout`.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: i64, timeout: i64) -> bool {
        now - self.last_seen.load(Ordering::Relaxed) > timeout
    }

    /// Returns true if the flow is marked for removal.
    #[inline]
    #[must_use]
    pub fn is_pending_sweep(&self) -> bool {
        self.pending_sweep.load(Ordering::Relaxed)
    }

    /// Marks the flow for removal on the next maintenance pass.
    #[inline]
    pub fn mark_pending_sweep(&self) {
        self.pending_sweep.store(true, Ordering::Relaxed);
    }
}

struct PairInner<A: NatIp> {
    out: HashMap<InternalKey<A>, Arc<Flow<A>>>,
    inbound: HashMap<ExternalKey<A>, Arc<Flow<A>>>,
    redirect_rules: Vec<RedirectRule<A>>,
    drop_rules: Vec<DropRule>,
}

/// Dual-indexed flow table for a single protocol.
pub struct Pair<A: NatIp> {
    inner: RwLock<PairInner<A>>,
}

impl<A: NatIp> Default for Pair<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: NatIp> Pair<A> {
    /// Creates an empty pair.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PairInner {
                out: HashMap::new(),
                inbound: HashMap::new(),
                redirect_rules: Vec::new(),
                drop_rules: Vec::new(),
            }),
        }
    }

    /// Looks up a flow by its internal key.
    pub fn lookup_outbound(&self, key: &InternalKey<A>) -> Option<Arc<Flow<A>>> {
        self.inner.read().out.get(key).cloned()
    }

    /// Looks up a flow by its external key.
    pub fn lookup_inbound(&self, key: &ExternalKey<A>) -> Option<Arc<Flow<A>>> {
        self.inner.read().inbound.get(key).cloned()
    }

    /// Inserts a flow into both indexes and returns the shared record.
    ///
    /// Returns `None` without inserting when another live flow already owns
    /// the external key; the caller allocates a fresh port and retries.
    ///
    /// When `max_per_namespace` is nonzero and the namespace already holds
    /// that many unswept flows, the least recently seen of them is evicted
    /// from both indexes first.
    pub fn add_connection(
        &self,
        flow: Flow<A>,
        max_per_namespace: usize,
    ) -> Option<Arc<Flow<A>>> {
        let mut inner = self.inner.write();

        let external_key = flow.external_key();
        if inner.inbound.contains_key(&external_key) {
            return None;
        }

        if max_per_namespace > 0 {
            let live = inner
                .out
                .values()
                .filter(|f| f.namespace == flow.namespace && !f.is_pending_sweep())
                .count();
            if live >= max_per_namespace {
                let oldest = inner
                    .out
                    .values()
                    .filter(|f| f.namespace == flow.namespace && !f.is_pending_sweep())
                    .min_by_key(|f| f.last_seen.load(Ordering::Relaxed))
                    .cloned();
                if let Some(oldest) = oldest {
                    tracing::debug!(
                        namespace = flow.namespace,
                        port = oldest.outside_src_port,
                        "namespace at capacity, evicting least recently seen flow"
                    );
                    inner.out.remove(&oldest.internal_key());
                    inner.inbound.remove(&oldest.external_key());
                }
            }
        }

        let flow = Arc::new(flow);
        inner.out.insert(flow.internal_key(), Arc::clone(&flow));
        inner.inbound.insert(external_key, Arc::clone(&flow));
        Some(flow)
    }

    /// Removes a flow from both indexes.
    pub fn remove_connection(&self, flow: &Flow<A>) {
        let mut inner = self.inner.write();
        inner.out.remove(&flow.internal_key());
        inner.inbound.remove(&flow.external_key());
    }

    /// Removes every flow marked for sweep or idle longer than `timeout`.
    ///
    /// Returns the number of flows removed. Idempotent: a second pass at the
    /// same `now` removes nothing.
    pub fn cleanup_expired(&self, now: i64, timeout: i64) -> usize {
        let mut inner = self.inner.write();

        let expired: Vec<Arc<Flow<A>>> = inner
            .out
            .values()
            .filter(|f| f.is_pending_sweep() || f.is_expired(now, timeout))
            .cloned()
            .collect();

        for flow in &expired {
            inner.out.remove(&flow.internal_key());
            inner.inbound.remove(&flow.external_key());
        }

        expired.len()
    }

    /// Returns true if a drop rule matches the destination port.
    pub fn check_drop_rule(&self, dst_port: u16) -> bool {
        self.inner
            .read()
            .drop_rules
            .iter()
            .any(|r| r.dst_port == dst_port)
    }

    /// Returns the rewrite target of the first redirect rule matching the
    /// destination, if any.
    pub fn check_redirect_rule(&self, dst_ip: A, dst_port: u16) -> Option<(A, u16)> {
        self.inner
            .read()
            .redirect_rules
            .iter()
            .find(|r| r.dst_ip == dst_ip && r.dst_port == dst_port)
            .map(|r| (r.new_dst_ip, r.new_dst_port))
    }

    /// Appends a redirect rule. Rules match in insertion order.
    pub fn add_redirect_rule(&self, rule: RedirectRule<A>) {
        self.inner.write().redirect_rules.push(rule);
    }

    /// Removes the first redirect rule matching the destination.
    ///
    /// Returns true if a rule was removed. Existing flows keep their
    /// rewrite.
    pub fn remove_redirect_rule(&self, dst_ip: A, dst_port: u16) -> bool {
        let mut inner = self.inner.write();
        let pos = inner
            .redirect_rules
            .iter()
            .position(|r| r.dst_ip == dst_ip && r.dst_port == dst_port);
        match pos {
            Some(i) => {
                inner.redirect_rules.remove(i);
                true
            }
            None => false,
        }
    }

    /// Appends a drop rule.
    pub fn add_drop_rule(&self, rule: DropRule) {
        self.inner.write().drop_rules.push(rule);
    }

    /// Removes the first drop rule matching the port.
    ///
    /// Returns true if a rule was removed.
    pub fn remove_drop_rule(&self, dst_port: u16) -> bool {
        let mut inner = self.inner.write();
        let pos = inner.drop_rules.iter().position(|r| r.dst_port == dst_port);
        match pos {
            Some(i) => {
                inner.drop_rules.remove(i);
                true
            }
            None => false,
        }
    }

    /// Number of tracked flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().out.len()
    }

    /// Returns true if no flows are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().out.is_empty()
    }
}
