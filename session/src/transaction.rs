//! Pending transactions: correlation ids mapped to completions with
//! deadlines.
//!
//! Three kinds of call wait on a peer here. Requests wait for a response
//! routed by id, acknowledged sends wait for an ack receipt, and settings
//! negotiations wait for the peer's verdict. Each entry owns the oneshot
//! that resolves the caller's future, so dropping an entry for any reason
//! other than completion fails that caller instead of hanging it.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use tether_wire::{NegotiateRequest, RouteId, MAX_ROUTE_ID};

use crate::error::SessionError;
use crate::negotiate::NegotiationOutcome;

/// Key of a pending transaction.
///
/// Numeric keys are initiator-minted request ids. Opaque keys cover
/// acceptor-minted request ids plus every acknowledgement and negotiation
/// id on both sides. The two spaces never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TxnId {
    /// Initiator-side counter value
    Numeric(u64),
    /// Minted string id
    Opaque(String),
}

impl From<RouteId> for TxnId {
    fn from(route: RouteId) -> Self {
        match route {
            RouteId::Numeric(n) => TxnId::Numeric(n),
            RouteId::Opaque(s) => TxnId::Opaque(s),
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnId::Numeric(n) => write!(f, "{n}"),
            TxnId::Opaque(s) => f.write_str(s),
        }
    }
}

/// What a pending transaction resolves to.
pub(crate) enum Completion {
    /// Response payload for a request
    Response(oneshot::Sender<Result<Value, SessionError>>),
    /// Receipt for an acknowledged send
    Ack(oneshot::Sender<Result<(), SessionError>>),
    /// Peer verdict for a settings negotiation. Remembers what was asked
    /// so an approval can be applied locally.
    Negotiation {
        requested: NegotiateRequest,
        done: oneshot::Sender<Result<NegotiationOutcome, SessionError>>,
    },
}

impl Completion {
    fn kind(&self) -> &'static str {
        match self {
            Completion::Response(_) => "response",
            Completion::Ack(_) => "ack",
            Completion::Negotiation { .. } => "negotiation",
        }
    }

    fn fail(self, error: SessionError) {
        match self {
            Completion::Response(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Ack(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Negotiation { done, .. } => {
                let _ = done.send(Err(error));
            }
        }
    }
}

struct Pending {
    completion: Completion,
    deadline: Instant,
}

/// All in-flight transactions of one endpoint, plus the initiator-side id
/// counter.
pub(crate) struct TransactionTable {
    entries: HashMap<TxnId, Pending>,
    numeric_seed: u64,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            numeric_seed: 0,
        }
    }

    /// Next initiator-side id. Starts at 1 and wraps back to 1 after the
    /// largest integer the wire format can carry exactly.
    pub fn next_numeric(&mut self) -> u64 {
        if self.numeric_seed == MAX_ROUTE_ID {
            self.numeric_seed = 0;
        }
        self.numeric_seed += 1;
        self.numeric_seed
    }

    /// Mint an acceptor-side opaque id.
    pub fn mint_opaque(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Track a transaction until `deadline`.
    pub fn register(&mut self, id: TxnId, completion: Completion, deadline: Instant) {
        if let Some(previous) = self.entries.insert(
            id.clone(),
            Pending {
                completion,
                deadline,
            },
        ) {
            debug!(id = %id, "replaced pending transaction with duplicate id");
            previous.completion.fail(SessionError::ConnectionClosed);
        }
    }

    /// Resolve a request with the response payload. Returns false when no
    /// matching request is pending; a mismatched entry kind is removed and
    /// its caller failed, since the id can never complete correctly again.
    pub fn complete_response(&mut self, id: &TxnId, payload: Value) -> bool {
        match self.entries.remove(id) {
            Some(Pending {
                completion: Completion::Response(tx),
                ..
            }) => {
                let _ = tx.send(Ok(payload));
                true
            }
            Some(pending) => {
                self.drop_mismatched(id, pending, "response");
                false
            }
            None => false,
        }
    }

    /// Resolve an acknowledged send.
    pub fn complete_ack(&mut self, id: &TxnId) -> bool {
        match self.entries.remove(id) {
            Some(Pending {
                completion: Completion::Ack(tx),
                ..
            }) => {
                let _ = tx.send(Ok(()));
                true
            }
            Some(pending) => {
                self.drop_mismatched(id, pending, "ack");
                false
            }
            None => false,
        }
    }

    /// Resolve a negotiation with the peer's verdict. On success returns
    /// what was originally requested so the caller can apply an approved
    /// change.
    pub fn complete_negotiation(
        &mut self,
        id: &TxnId,
        outcome: NegotiationOutcome,
    ) -> Option<NegotiateRequest> {
        match self.entries.remove(id) {
            Some(Pending {
                completion: Completion::Negotiation { requested, done },
                ..
            }) => {
                let _ = done.send(Ok(outcome));
                Some(requested)
            }
            Some(pending) => {
                self.drop_mismatched(id, pending, "negotiation");
                None
            }
            None => None,
        }
    }

    fn drop_mismatched(&mut self, id: &TxnId, pending: Pending, wanted: &str) {
        debug!(
            id = %id,
            pending = pending.completion.kind(),
            wanted,
            "completion kind mismatch; dropping transaction"
        );
        pending.completion.fail(SessionError::ConnectionClosed);
    }

    /// Fail every pending transaction with `error` and clear the table.
    pub fn fail_all(&mut self, error: SessionError) {
        for (_, pending) in self.entries.drain() {
            pending.completion.fail(error.clone());
        }
    }

    /// Time out every transaction whose deadline has passed. Returns how
    /// many fired.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<TxnId> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            if let Some(pending) = self.entries.remove(id) {
                debug!(id = %id, kind = pending.completion.kind(), "transaction timed out");
                pending.completion.fail(SessionError::Timeout);
            }
        }
        due.len()
    }

    /// Earliest pending deadline, if any transaction is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|pending| pending.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_numeric_ids_increase_from_one() {
        let mut table = TransactionTable::new();
        let ids: Vec<u64> = (0..5).map(|_| table.next_numeric()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_numeric_id_wraps_past_limit() {
        let mut table = TransactionTable::new();
        table.numeric_seed = MAX_ROUTE_ID - 1;
        assert_eq!(table.next_numeric(), MAX_ROUTE_ID);
        assert_eq!(table.next_numeric(), 1);
    }

    #[tokio::test]
    async fn test_opaque_ids_are_distinct() {
        let table = TransactionTable::new();
        assert_ne!(table.mint_opaque(), table.mint_opaque());
    }

    #[tokio::test]
    async fn test_complete_response_resolves_caller() {
        let mut table = TransactionTable::new();
        let (tx, rx) = oneshot::channel();
        let id = TxnId::Numeric(1);
        table.register(id.clone(), Completion::Response(tx), far());

        assert!(table.complete_response(&id, serde_json::json!({"ok": true})));
        assert_eq!(rx.await.unwrap(), Ok(serde_json::json!({"ok": true})));
        assert!(!table.complete_response(&id, Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_id_completes_nothing() {
        let mut table = TransactionTable::new();
        assert!(!table.complete_response(&TxnId::Numeric(7), Value::Null));
        assert!(!table.complete_ack(&TxnId::Opaque("7".to_string())));
    }

    #[tokio::test]
    async fn test_kind_mismatch_drops_entry() {
        let mut table = TransactionTable::new();
        let (tx, rx) = oneshot::channel();
        let id = TxnId::Opaque("9".to_string());
        table.register(id.clone(), Completion::Ack(tx), far());

        assert!(!table.complete_response(&id, Value::Null));
        assert_eq!(rx.await.unwrap(), Err(SessionError::ConnectionClosed));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fails_with_timeout() {
        let mut table = TransactionTable::new();
        let (tx, rx) = oneshot::channel();
        let id = TxnId::Numeric(1);
        table.register(id.clone(), Completion::Response(tx), Instant::now() + Duration::from_secs(5));

        assert_eq!(table.expire_due(Instant::now() + Duration::from_secs(4)), 0);
        assert_eq!(table.expire_due(Instant::now() + Duration::from_secs(5)), 1);
        assert_eq!(rx.await.unwrap(), Err(SessionError::Timeout));
        assert!(!table.complete_response(&id, Value::Null));
    }

    #[tokio::test]
    async fn test_fail_all_reaches_every_kind() {
        let mut table = TransactionTable::new();
        let (response_tx, response_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let (negotiation_tx, negotiation_rx) = oneshot::channel();
        table.register(TxnId::Numeric(1), Completion::Response(response_tx), far());
        table.register(TxnId::Opaque("2".to_string()), Completion::Ack(ack_tx), far());
        table.register(
            TxnId::Opaque("3".to_string()),
            Completion::Negotiation {
                requested: NegotiateRequest {
                    id: "3".to_string(),
                    heartbeat_mode: None,
                    heartbeat_interval: None,
                },
                done: negotiation_tx,
            },
            far(),
        );

        table.fail_all(SessionError::ConnectionClosed);
        assert_eq!(table.len(), 0);
        assert_eq!(response_rx.await.unwrap(), Err(SessionError::ConnectionClosed));
        assert_eq!(ack_rx.await.unwrap(), Err(SessionError::ConnectionClosed));
        assert_eq!(
            negotiation_rx.await.unwrap(),
            Err(SessionError::ConnectionClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_is_earliest() {
        let mut table = TransactionTable::new();
        assert!(table.next_deadline().is_none());

        let (first_tx, _first_rx) = oneshot::channel();
        let (second_tx, _second_rx) = oneshot::channel();
        let near = Instant::now() + Duration::from_secs(1);
        table.register(
            TxnId::Numeric(1),
            Completion::Response(first_tx),
            Instant::now() + Duration::from_secs(9),
        );
        table.register(TxnId::Numeric(2), Completion::Response(second_tx), near);
        assert_eq!(table.next_deadline(), Some(near));
    }
}
