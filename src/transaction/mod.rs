//! Transaction layer seam
//!
//! The dialog engine does not retransmit individual requests or responses.
//! It creates transactions through a [`TransactionLayer`], reads their request
//! and state through [`Transaction`], and learns about responses, timeouts and
//! termination from [`TransactionEvent`]s delivered on the channels registered
//! when the transaction is created or attached.
use crate::Result;
use rsip::{Method, Request, Response};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod key;
pub use key::{TransactionKey, TransactionRole};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Calling => write!(f, "Calling"),
            TransactionState::Trying => write!(f, "Trying"),
            TransactionState::Proceeding => write!(f, "Proceeding"),
            TransactionState::Completed => write!(f, "Completed"),
            TransactionState::Confirmed => write!(f, "Confirmed"),
            TransactionState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// A client or server transaction owned by the transaction layer.
///
/// Methods returning `Result` may fail with [`crate::Error::TransactionError`]
/// once the transaction has been torn down; callers treat that as "already gone".
pub trait Transaction: Send + Sync {
    fn key(&self) -> &TransactionKey;

    fn request(&self) -> &Request;

    fn method(&self) -> &Method {
        &self.request().method
    }

    fn role(&self) -> TransactionRole {
        self.key().role
    }

    fn state(&self) -> Result<TransactionState>;

    /// Add a listener for this transaction's future events.
    ///
    /// Every attached listener gets every event: sibling early dialogs forked
    /// from one INVITE all listen on the same client transaction. A listener
    /// whose receiver is closed can be dropped.
    fn attach(&self, events: TransactionEventSender);

    /// Start a client transaction (send the request).
    fn begin(&self) -> Result<()>;

    /// Send a response on a server transaction.
    fn send_response(&self, response: Response) -> Result<()>;

    /// The final (>= 200) response sent or received, if any.
    fn final_response(&self) -> Result<Option<Response>>;

    /// Validate a PRACK against the last reliable provisional response sent on
    /// this INVITE server transaction (RFC 3262 3).
    fn process_prack(&self, prack: &Request) -> bool;
}

pub type TransactionRef = Arc<dyn Transaction>;

#[derive(Clone)]
pub enum TransactionEvent {
    ResponseReceived(TransactionRef, Response),
    ResponseSent(TransactionRef, Response),
    TimedOut(TransactionRef),
    Terminated(TransactionKey),
}

impl fmt::Debug for TransactionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionEvent::ResponseReceived(tx, resp) => {
                write!(f, "ResponseReceived({}, {})", tx.key(), resp.status_code)
            }
            TransactionEvent::ResponseSent(tx, resp) => {
                write!(f, "ResponseSent({}, {})", tx.key(), resp.status_code)
            }
            TransactionEvent::TimedOut(tx) => write!(f, "TimedOut({})", tx.key()),
            TransactionEvent::Terminated(key) => write!(f, "Terminated({})", key),
        }
    }
}

pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;

/// Creates transactions on behalf of dialogs.
pub trait TransactionLayer: Send + Sync {
    /// Create a client transaction that will send `request` to `target` once begun.
    fn create_client_transaction(
        &self,
        request: Request,
        target: rsip::Uri,
        events: Option<TransactionEventSender>,
    ) -> Result<TransactionRef>;

    fn create_server_transaction(
        &self,
        request: Request,
        events: Option<TransactionEventSender>,
    ) -> Result<TransactionRef>;
}

pub type TransactionLayerRef = Arc<dyn TransactionLayer>;
