//! In-flight request bookkeeping.
//!
//! Every request the proxy forwards gets a fresh internal id from a
//! per-table counter. The internal id is what goes on the wire, so two
//! downstream servers that both use `id: 1` never collide. A call leaves the
//! table exactly once: on its response, on expiry, on cancellation, or when
//! its peer or the session goes away.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::protocol::{ListKind, RpcId};
use crate::registry::ServerId;

/// One end of a forwarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Upstream,
    Server(ServerId),
}

/// Why the call exists.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOrigin {
    /// Relayed on behalf of `from`, whose own request id was `id`.
    Forwarded { from: Peer, id: RpcId },
    /// Issued by the proxy to re-list one category after `list_changed`.
    /// `collected` holds the entries of the pages fetched so far.
    Refresh {
        kind: ListKind,
        collected: Vec<Value>,
        page: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub internal_id: u64,
    pub target: Peer,
    pub method: String,
    pub created_at: Instant,
    pub deadline: Instant,
    pub origin: CallOrigin,
}

impl PendingCall {
    /// Id the originator used, for proxy-issued calls `None`.
    pub fn external_id(&self) -> Option<&RpcId> {
        match &self.origin {
            CallOrigin::Forwarded { id, .. } => Some(id),
            CallOrigin::Refresh { .. } => None,
        }
    }

    /// Wire id sent to the target.
    pub fn wire_id(&self) -> RpcId {
        internal_to_wire(self.internal_id)
    }

    /// Whether `peer` is either end of this call.
    pub fn involves(&self, peer: Peer) -> bool {
        self.target == peer
            || matches!(&self.origin, CallOrigin::Forwarded { from, .. } if *from == peer)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CorrelationError {
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(RpcId),

    #[error("no pending call for response id {id} from {from:?}")]
    Orphan { from: Peer, id: RpcId },
}

pub fn internal_to_wire(internal_id: u64) -> RpcId {
    RpcId::Number(internal_id as i64)
}

fn wire_to_internal(id: &RpcId) -> Option<u64> {
    match id {
        RpcId::Number(n) => u64::try_from(*n).ok(),
        RpcId::Str(_) => None,
    }
}

#[derive(Debug)]
pub struct CorrelationTable {
    calls: HashMap<u64, PendingCall>,
    external: HashMap<(Peer, RpcId), u64>,
    next_id: u64,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self {
            calls: HashMap::new(),
            external: HashMap::new(),
            next_id: 1,
        }
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record a request relayed from `from` (with its own id `external_id`)
    /// to `target`. Returns the internal id to put on the wire.
    pub fn register_outbound(
        &mut self,
        from: Peer,
        external_id: RpcId,
        target: Peer,
        method: &str,
        timeout: Duration,
        now: Instant,
    ) -> Result<u64, CorrelationError> {
        let key = (from, external_id);
        if self.external.contains_key(&key) {
            return Err(CorrelationError::DuplicateRequestId(key.1));
        }
        let internal_id = self.allocate();
        self.external.insert(key.clone(), internal_id);
        self.calls.insert(
            internal_id,
            PendingCall {
                internal_id,
                target,
                method: method.to_string(),
                created_at: now,
                deadline: now + timeout,
                origin: CallOrigin::Forwarded {
                    from: key.0,
                    id: key.1,
                },
            },
        );
        Ok(internal_id)
    }

    /// Record a call the proxy issues on its own behalf.
    pub fn register_internal(
        &mut self,
        target: Peer,
        method: &str,
        origin: CallOrigin,
        timeout: Duration,
        now: Instant,
    ) -> u64 {
        let internal_id = self.allocate();
        if let CallOrigin::Forwarded { from, id } = &origin {
            self.external.insert((*from, id.clone()), internal_id);
        }
        self.calls.insert(
            internal_id,
            PendingCall {
                internal_id,
                target,
                method: method.to_string(),
                created_at: now,
                deadline: now + timeout,
                origin,
            },
        );
        internal_id
    }

    /// Match a response from `from` carrying wire id `id`.
    ///
    /// A response for an unknown id, or from a peer other than the call's
    /// target, is an orphan and leaves the table untouched.
    pub fn resolve_inbound(&mut self, from: Peer, id: &RpcId) -> Result<PendingCall, CorrelationError> {
        let orphan = || CorrelationError::Orphan {
            from,
            id: id.clone(),
        };
        let internal_id = wire_to_internal(id).ok_or_else(orphan)?;
        match self.calls.get(&internal_id) {
            Some(call) if call.target == from => {}
            _ => return Err(orphan()),
        }
        self.take(internal_id).ok_or_else(orphan)
    }

    /// Remove the call `from` issued as `external_id`, if still pending.
    pub fn cancel(&mut self, from: Peer, external_id: &RpcId) -> Option<PendingCall> {
        let internal_id = self.external.get(&(from, external_id.clone())).copied()?;
        self.take(internal_id)
    }

    /// Remove every call whose deadline is at or before `now`, oldest first.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<PendingCall> {
        let expired: Vec<u64> = self
            .calls
            .values()
            .filter(|c| c.deadline <= now)
            .map(|c| c.internal_id)
            .collect();
        self.take_sorted(expired)
    }

    /// Remove every call that involves `server`, at either end.
    pub fn remove_for_server(&mut self, server: ServerId) -> Vec<PendingCall> {
        let ids: Vec<u64> = self
            .calls
            .values()
            .filter(|c| c.involves(Peer::Server(server)))
            .map(|c| c.internal_id)
            .collect();
        self.take_sorted(ids)
    }

    /// Empty the table, oldest call first.
    pub fn drain_all(&mut self) -> Vec<PendingCall> {
        let ids: Vec<u64> = self.calls.keys().copied().collect();
        self.take_sorted(ids)
    }

    /// Number of pending calls targeting `server`.
    pub fn in_flight(&self, server: ServerId) -> usize {
        self.calls
            .values()
            .filter(|c| c.target == Peer::Server(server))
            .count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().map(|c| c.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn take(&mut self, internal_id: u64) -> Option<PendingCall> {
        let call = self.calls.remove(&internal_id)?;
        if let CallOrigin::Forwarded { from, id } = &call.origin {
            self.external.remove(&(*from, id.clone()));
        }
        Some(call)
    }

    fn take_sorted(&mut self, mut ids: Vec<u64>) -> Vec<PendingCall> {
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn server(n: u32) -> Peer {
        Peer::Server(ServerId::from(n))
    }

    #[test]
    fn internal_ids_are_unique_across_servers() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let a = table
            .register_outbound(Peer::Upstream, RpcId::from(1), server(0), "tools/call", TIMEOUT, now)
            .unwrap();
        let b = table
            .register_outbound(Peer::Upstream, RpcId::from(2), server(1), "tools/call", TIMEOUT, now)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(table.in_flight(ServerId::from(0)), 1);

        let call = table.resolve_inbound(server(1), &internal_to_wire(b)).unwrap();
        assert_eq!(call.external_id(), Some(&RpcId::from(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn duplicate_external_id_is_rejected_until_resolved() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let id = RpcId::from("req-1");
        let internal = table
            .register_outbound(Peer::Upstream, id.clone(), server(0), "ping", TIMEOUT, now)
            .unwrap();
        assert_eq!(
            table.register_outbound(Peer::Upstream, id.clone(), server(0), "ping", TIMEOUT, now),
            Err(CorrelationError::DuplicateRequestId(id.clone()))
        );

        // Same id from a different originator is a different call.
        assert!(table
            .register_outbound(server(3), id.clone(), Peer::Upstream, "roots/list", TIMEOUT, now)
            .is_ok());

        table.resolve_inbound(server(0), &internal_to_wire(internal)).unwrap();
        assert!(table
            .register_outbound(Peer::Upstream, id, server(0), "ping", TIMEOUT, now)
            .is_ok());
    }

    #[test]
    fn response_from_wrong_server_is_orphan_and_keeps_entry() {
        let mut table = CorrelationTable::new();
        let internal = table
            .register_outbound(Peer::Upstream, RpcId::from(7), server(0), "tools/call", TIMEOUT, Instant::now())
            .unwrap();

        let err = table
            .resolve_inbound(server(1), &internal_to_wire(internal))
            .unwrap_err();
        assert!(matches!(err, CorrelationError::Orphan { .. }));
        assert!(table.resolve_inbound(server(0), &RpcId::from(999)).is_err());
        assert!(table.resolve_inbound(server(0), &RpcId::from("x")).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn every_call_terminates_exactly_once() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let short = Duration::from_millis(10);

        let responded = table
            .register_outbound(Peer::Upstream, RpcId::from(1), server(0), "a", TIMEOUT, now)
            .unwrap();
        table
            .register_outbound(Peer::Upstream, RpcId::from(2), server(0), "b", short, now)
            .unwrap();
        table
            .register_outbound(Peer::Upstream, RpcId::from(3), server(1), "c", TIMEOUT, now)
            .unwrap();
        table
            .register_outbound(Peer::Upstream, RpcId::from(4), server(2), "d", TIMEOUT, now)
            .unwrap();

        let mut terminal = Vec::new();
        terminal.push(table.resolve_inbound(server(0), &internal_to_wire(responded)).unwrap());
        terminal.extend(table.sweep_expired(now + short));
        terminal.extend(table.cancel(Peer::Upstream, &RpcId::from(3)));
        terminal.extend(table.drain_all());

        // A late response for an already-terminated call is an orphan.
        assert!(table.resolve_inbound(server(0), &internal_to_wire(responded)).is_err());
        assert!(table.cancel(Peer::Upstream, &RpcId::from(3)).is_none());

        let mut ids: Vec<_> = terminal.iter().map(|c| c.internal_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert!(table.is_empty());
    }

    #[test]
    fn remove_for_server_covers_both_directions() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        table
            .register_outbound(Peer::Upstream, RpcId::from(1), server(0), "tools/call", TIMEOUT, now)
            .unwrap();
        table
            .register_outbound(server(0), RpcId::from(1), Peer::Upstream, "sampling/createMessage", TIMEOUT, now)
            .unwrap();
        table
            .register_outbound(Peer::Upstream, RpcId::from(2), server(1), "tools/call", TIMEOUT, now)
            .unwrap();

        let removed = table.remove_for_server(ServerId::from(0));
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn refresh_calls_have_no_external_id() {
        let mut table = CorrelationTable::new();
        let now = Instant::now();
        let id = table.register_internal(
            server(0),
            "tools/list",
            CallOrigin::Refresh {
                kind: ListKind::Tools,
                collected: Vec::new(),
                page: 0,
            },
            Duration::from_secs(1),
            now,
        );
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(1)));
        let call = table.resolve_inbound(server(0), &internal_to_wire(id)).unwrap();
        assert_eq!(call.external_id(), None);
    }
}
