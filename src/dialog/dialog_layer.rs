use super::{
    dialog::{Dialog, DialogEventReceiver, DialogEventSender},
    DialogId,
};
use crate::{
    transaction::{TransactionLayerRef, TransactionRef},
    transport::TransportRef,
    Error, Result,
};
use rand::Rng;
use rsip::{Request, Response};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

/// Protocol constants and local identity shared by every dialog of a layer.
///
/// # Fields
///
/// * `t1` / `t2` - RFC 3261 retransmission base and cap
/// * `t1x64` - window for 2xx retransmission and for re-ACKing 2xx retransmissions
/// * `early_dialog_timeout` - how long a dialog may stay early
/// * `session_expires` / `min_session_expires` - RFC 4028 defaults, in seconds
/// * `contact_host` - host\[:port\] used in the local Contact URI
/// * `retry_after` - fixed Retry-After seconds, random 0..=10 when `None`
#[derive(Clone, Debug)]
pub struct DialogOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t1x64: Duration,
    pub early_dialog_timeout: Duration,
    pub session_expires: u32,
    pub min_session_expires: u32,
    pub contact_host: String,
    pub user_agent: Option<String>,
    pub allow: String,
    pub supported: String,
    pub retry_after: Option<u32>,
}

impl Default for DialogOption {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t1x64: Duration::from_millis(64 * 500),
            early_dialog_timeout: Duration::from_secs(180),
            session_expires: 1800,
            min_session_expires: 90,
            contact_host: "127.0.0.1:5060".to_string(),
            user_agent: Some(crate::VERSION.to_string()),
            allow: "INVITE,ACK,OPTIONS,CANCEL,BYE,PRACK".to_string(),
            supported: "100rel,timer".to_string(),
            retry_after: None,
        }
    }
}

impl DialogOption {
    pub fn retry_after_value(&self) -> u32 {
        self.retry_after
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..=10))
    }
}

/// Internal Dialog Layer State
///
/// # Thread Safety
///
/// `dialogs` is behind a RwLock. It is never held while calling into a
/// dialog, so dialogs may remove themselves while holding their own lock.
pub struct DialogLayerInner {
    pub(super) option: DialogOption,
    pub(super) transaction_layer: TransactionLayerRef,
    pub(super) transport: TransportRef,
    pub(super) dialogs: RwLock<HashMap<DialogId, Dialog>>,
}
pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

impl DialogLayerInner {
    pub(super) fn remove_dialog(&self, id: &DialogId) {
        if self.dialogs.write().unwrap().remove(id).is_some() {
            debug!(%id, "dialog removed");
        }
    }
}

/// SIP Dialog Layer
///
/// Creates dialogs from the transaction and response that establish them,
/// keeps them in a registry, and routes in-dialog messages that no
/// transaction claimed to the right dialog. A terminated dialog removes
/// itself from its layer.
///
/// # Examples
///
/// ```rust,no_run
/// use rsipdialog::dialog::dialog_layer::DialogLayer;
/// use rsipdialog::transaction::TransactionRef;
///
/// # fn example(layer: DialogLayer, invite_tx: TransactionRef, ok: rsip::Response) -> rsipdialog::Result<()> {
/// let (event_sender, mut events) = layer.new_dialog_event_channel();
/// let dialog = layer.create_dialog(&invite_tx, &ok, event_sender)?;
/// assert!(layer.get_dialog(&dialog.id()).is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DialogLayer {
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn option(&self) -> &DialogOption {
        &self.inner.option
    }

    /// Create (or return the existing) dialog for a 101-299 `response` on
    /// `transaction`: UAC for client transactions, UAS for server ones.
    ///
    /// The response then goes through the regular pipeline, so a 2xx gets its
    /// ACK (UAC) or its retransmission timer (UAS) right away.
    pub fn create_dialog(
        &self,
        transaction: &TransactionRef,
        response: &Response,
        event_sender: DialogEventSender,
    ) -> Result<Dialog> {
        let id = match transaction.role() {
            crate::transaction::TransactionRole::Client => DialogId::from_uac_response(response)?,
            crate::transaction::TransactionRole::Server => DialogId::from_uas_response(response)?,
        };
        if let Some(dialog) = self.get_dialog(&id) {
            return Ok(dialog);
        }

        let dialog = Dialog::new(&self.inner, transaction, response, event_sender)?;
        self.inner
            .dialogs
            .write()
            .unwrap()
            .insert(id, dialog.clone());
        dialog.process_establishing(transaction, response);
        Ok(dialog)
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dialogs.read().unwrap().is_empty()
    }

    pub fn all_dialog_ids(&self) -> Vec<DialogId> {
        self.inner.dialogs.read().unwrap().keys().cloned().collect()
    }

    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.read().unwrap().get(id).cloned()
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        self.inner.remove_dialog(id)
    }

    /// Dialog an incoming request belongs to (its To tag is ours).
    pub fn match_request(&self, request: &Request) -> Option<Dialog> {
        let id = DialogId::from_uas_request(request).ok()?;
        self.get_dialog(&id)
    }

    /// Hand an in-dialog request no transaction claimed to its dialog.
    /// Returns `false` when no dialog matches.
    pub fn process_request(&self, request: Request) -> bool {
        match self.match_request(&request) {
            Some(dialog) => {
                dialog.process_request(request);
                true
            }
            None => {
                debug!(method = %request.method, "no dialog for request");
                false
            }
        }
    }

    pub fn match_response(&self, response: &Response) -> Option<Dialog> {
        let id = DialogId::from_uac_response(response).ok()?;
        self.get_dialog(&id)
    }

    /// Hand a response no transaction claimed to its dialog.
    /// Returns `false` when no dialog matches.
    pub fn process_response(&self, response: &Response) -> bool {
        match self.match_response(response) {
            Some(dialog) => {
                dialog.process_response(response);
                true
            }
            None => {
                debug!(status = %response.status_code, "no dialog for response");
                false
            }
        }
    }

    pub fn new_dialog_event_channel(&self) -> (DialogEventSender, DialogEventReceiver) {
        unbounded_channel()
    }
}

/// Builder for [`DialogLayer`]; the transaction layer and transport are required.
#[derive(Default)]
pub struct DialogLayerBuilder {
    option: Option<DialogOption>,
    transaction_layer: Option<TransactionLayerRef>,
    transport: Option<TransportRef>,
}

impl DialogLayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_option(mut self, option: DialogOption) -> Self {
        self.option = Some(option);
        self
    }

    pub fn with_transaction_layer(mut self, transaction_layer: TransactionLayerRef) -> Self {
        self.transaction_layer = Some(transaction_layer);
        self
    }

    pub fn with_transport(mut self, transport: TransportRef) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<DialogLayer> {
        let transaction_layer = self
            .transaction_layer
            .ok_or_else(|| Error::Error("transaction layer is required".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| Error::Error("transport is required".to_string()))?;
        Ok(DialogLayer {
            inner: Arc::new(DialogLayerInner {
                option: self.option.unwrap_or_default(),
                transaction_layer,
                transport,
                dialogs: RwLock::new(HashMap::new()),
            }),
        })
    }
}
