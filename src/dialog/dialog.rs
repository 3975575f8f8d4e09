use super::{
    dialog_layer::{DialogLayerInner, DialogLayerInnerRef, DialogOption},
    timer::{
        DialogTimer, ScheduledTimer, TimerReceiver, TimerScheduler, Uac2xxWait, Uas2xxRetransmit,
    },
    DialogId,
};
use crate::{
    rsip_ext::{contact_uri, record_route_entries, RouteEntry},
    transaction::{
        TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionKey,
        TransactionLayerRef, TransactionRef, TransactionRole,
    },
    transport::TransportRef,
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader},
    Request, Response, StatusCode, StatusCodeKind,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::SystemTime,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SIP Dialog State
///
/// A dialog moves `Early -> Confirmed -> Terminated`, or straight from `Early`
/// to `Terminated`. It never returns to `Early` and never leaves `Terminated`.
///
/// * `Early` - established by a provisional response, not confirmed yet
/// * `Confirmed` - a 2xx was received (UAC) or its ACK arrived (UAS)
/// * `Terminated` - the dialog is gone; timers are cancelled and input is ignored
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Early => write!(f, "Early"),
            DialogState::Confirmed => write!(f, "Confirmed"),
            DialogState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminatedReason {
    /// `terminate()` sent a BYE.
    LocalBye,
    /// The peer sent a BYE.
    RemoteBye,
    /// A client transaction of this dialog timed out.
    Timeout,
    /// The dialog stayed early for too long.
    EarlyTimeout,
    /// No session refresh within the session interval.
    SessionExpired,
    /// No ACK for the 2xx within 64*T1; a BYE was sent.
    AckTimeout,
    /// Final non-2xx response on the early dialog.
    Rejected(StatusCode),
    /// 481 or 408 to an in-dialog request.
    Failure(StatusCode),
    /// Disposed by the owner without a BYE.
    Disposed,
}

/// Notifications sent to the owner of a dialog.
///
/// `RequestReceived` carries the server transaction the request has to be
/// answered on.
#[derive(Clone)]
pub enum DialogEvent {
    RequestReceived(DialogId, Request, TransactionRef),
    StateChanged(DialogId, DialogState),
    Terminated(DialogId, TerminatedReason),
}

impl fmt::Debug for DialogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogEvent::RequestReceived(id, req, tx) => {
                write!(f, "RequestReceived({}, {}, {})", id, req.method, tx.key())
            }
            DialogEvent::StateChanged(id, state) => write!(f, "StateChanged({}, {})", id, state),
            DialogEvent::Terminated(id, reason) => write!(f, "Terminated({}, {:?})", id, reason),
        }
    }
}

pub type DialogEventSender = UnboundedSender<DialogEvent>;
pub type DialogEventReceiver = UnboundedReceiver<DialogEvent>;

/// Mutable dialog state, only touched while holding `DialogInner::core`.
///
/// Helpers that need it take `&mut DialogCore`, so work started while the
/// lock is held (sending a PRACK from response processing, a BYE from a timer)
/// never locks twice.
pub(super) struct DialogCore {
    pub state: DialogState,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub remote_target: rsip::Uri,
    pub transactions: Vec<TransactionRef>,
    pub local_session_body: Vec<u8>,
    /// Last acknowledged RSeq per INVITE client transaction.
    pub reliable_rseq: HashMap<TransactionKey, u32>,
    pub early_timer: Option<ScheduledTimer>,
    pub uas_2xx: Option<Uas2xxRetransmit>,
    pub session_timer: Option<ScheduledTimer>,
    pub refresh_timer: Option<ScheduledTimer>,
}

/// Internal Dialog State and Management
///
/// Identity, role and routing are fixed at creation and live directly on the
/// struct. Everything that changes lives in `core` behind the per-dialog lock.
/// The 2xx-wait entries have their own lock because stray responses are
/// matched against them without touching the rest of the dialog.
///
/// # Lock order
///
/// `core` -> `uac_2xx_waits` -> the layer's dialog registry. Transactions and
/// the transport are called with `core` held; they must not call back into
/// the dialog synchronously (they report through the event channel).
pub struct DialogInner {
    pub id: DialogId,
    pub role: TransactionRole,
    pub method: rsip::Method,
    pub local_uri: rsip::Uri,
    pub remote_uri: rsip::Uri,
    pub route_set: Vec<RouteEntry>,
    pub is_secure: bool,
    pub create_time: SystemTime,
    pub cancel_token: CancellationToken,

    pub(super) option: DialogOption,
    pub(super) transaction_layer: TransactionLayerRef,
    pub(super) transport: TransportRef,
    pub(super) event_sender: DialogEventSender,
    pub(super) tu_sender: TransactionEventSender,
    pub(super) timers: TimerScheduler,
    pub(super) core: Mutex<DialogCore>,
    pub(super) uac_2xx_waits: Mutex<Vec<Uac2xxWait>>,
    pub(super) layer: Weak<DialogLayerInner>,
}

pub(super) type DialogInnerRef = Arc<DialogInner>;

/// Everything observable about a dialog at one instant.
#[derive(Clone, Debug)]
pub struct DialogSnapshot {
    pub id: DialogId,
    pub state: DialogState,
    pub role: TransactionRole,
    pub method: rsip::Method,
    pub local_seq: u32,
    pub remote_seq: u32,
    pub local_uri: rsip::Uri,
    pub remote_uri: rsip::Uri,
    pub remote_target: rsip::Uri,
    pub route_set: Vec<RouteEntry>,
    pub is_secure: bool,
    pub create_time: SystemTime,
}

impl DialogInner {
    /// Build the dialog from the transaction and response that establish it.
    ///
    /// Client transactions give a UAC dialog, server transactions a UAS
    /// dialog. A 2xx must carry a Contact.
    fn new(
        layer: &DialogLayerInnerRef,
        transaction: &TransactionRef,
        response: &Response,
        event_sender: DialogEventSender,
    ) -> Result<(Self, TransactionEventReceiver, TimerReceiver)> {
        let status = u16::from(response.status_code.clone());
        if !(101..300).contains(&status) {
            return Err(Error::Error(format!(
                "{} response does not establish a dialog",
                status
            )));
        }
        let confirmed = matches!(response.status_code.kind(), StatusCodeKind::Successful);
        let contact = response.contact_header().ok();
        if confirmed && contact.is_none() {
            return Err(Error::Error("missing Contact in 2xx response".to_string()));
        }

        let role = transaction.role();
        let request = transaction.request();
        let (id, method, local_uri, remote_uri, route_set, remote_target, local_seq, remote_seq) =
            match role {
                TransactionRole::Client => {
                    let id = DialogId::from_uac_response(response)?;
                    let remote_uri = response.to_header()?.typed()?.uri;
                    let remote_target = match contact {
                        Some(contact) => contact_uri(contact)?,
                        None => remote_uri.clone(),
                    };
                    let mut route_set = record_route_entries(&response.headers)?;
                    route_set.reverse();
                    let cseq = response.cseq_header()?;
                    (
                        id,
                        cseq.method()?,
                        response.from_header()?.typed()?.uri,
                        remote_uri,
                        route_set,
                        remote_target,
                        cseq.seq()?,
                        0,
                    )
                }
                TransactionRole::Server => {
                    let id = DialogId::from_uas_response(response)?;
                    let remote_uri = request.from_header()?.typed()?.uri;
                    let remote_target = match request.contact_header() {
                        Ok(contact) => contact_uri(contact)?,
                        Err(_) if !confirmed => remote_uri.clone(),
                        Err(e) => return Err(e.into()),
                    };
                    (
                        id,
                        request.method.clone(),
                        request.to_header()?.typed()?.uri,
                        remote_uri,
                        record_route_entries(&request.headers)?,
                        remote_target,
                        0,
                        request.cseq_header()?.seq()?,
                    )
                }
            };

        let is_secure = request.uri.scheme == Some(rsip::Scheme::Sips);
        let state = if confirmed {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };

        let (tu_sender, tu_receiver) = unbounded_channel();
        let (timer_sender, timer_receiver) = unbounded_channel();
        let cancel_token = CancellationToken::new();
        let timers = TimerScheduler::new(timer_sender, cancel_token.clone());
        let early_timer = (state == DialogState::Early).then(|| {
            timers.schedule(DialogTimer::EarlyDialog, layer.option.early_dialog_timeout)
        });

        transaction.attach(tu_sender.clone());
        let core = DialogCore {
            state,
            local_seq,
            remote_seq,
            remote_target,
            transactions: vec![transaction.clone()],
            local_session_body: vec![],
            reliable_rseq: HashMap::new(),
            early_timer,
            uas_2xx: None,
            session_timer: None,
            refresh_timer: None,
        };

        let inner = Self {
            id,
            role,
            method,
            local_uri,
            remote_uri,
            route_set,
            is_secure,
            create_time: SystemTime::now(),
            cancel_token,
            option: layer.option.clone(),
            transaction_layer: layer.transaction_layer.clone(),
            transport: layer.transport.clone(),
            event_sender,
            tu_sender,
            timers,
            core: Mutex::new(core),
            uac_2xx_waits: Mutex::new(vec![]),
            layer: Arc::downgrade(layer),
        };
        Ok((inner, tu_receiver, timer_receiver))
    }

    pub(super) fn on_transaction_event(&self, event: TransactionEvent) {
        match event {
            TransactionEvent::ResponseReceived(tx, resp) => self.on_response_received(&tx, &resp),
            TransactionEvent::ResponseSent(tx, resp) => self.on_response_sent(&tx, &resp),
            TransactionEvent::TimedOut(tx) => self.on_transaction_timed_out(&tx),
            TransactionEvent::Terminated(key) => {
                let mut core = self.core.lock().unwrap();
                core.transactions.retain(|t| t.key() != &key);
                core.reliable_rseq.remove(&key);
            }
        }
    }

    pub(super) fn transition(&self, core: &mut DialogCore, state: DialogState) {
        if core.state == state {
            return;
        }
        if core.state == DialogState::Terminated {
            warn!(id = %self.id, to = %state, "dialog already terminated, ignoring transition");
            return;
        }
        debug!(id = %self.id, from = %core.state, to = %state, "dialog transition");
        core.state = state;
        if state != DialogState::Early {
            core.early_timer = None;
        }
        self.event_sender
            .send(DialogEvent::StateChanged(self.id.clone(), state))
            .ok();
    }

    /// Terminate without a BYE: cancel every timer and 2xx-wait, notify the
    /// owner and leave the layer. Idempotent.
    pub(super) fn dispose_locked(&self, core: &mut DialogCore, reason: TerminatedReason) {
        if core.state == DialogState::Terminated {
            return;
        }
        self.transition(core, DialogState::Terminated);
        core.early_timer = None;
        core.uas_2xx = None;
        core.session_timer = None;
        core.refresh_timer = None;
        self.uac_2xx_waits.lock().unwrap().clear();
        self.cancel_token.cancel();

        info!(id = %self.id, reason = ?reason, "dialog terminated");
        self.event_sender
            .send(DialogEvent::Terminated(self.id.clone(), reason))
            .ok();
        if let Some(layer) = self.layer.upgrade() {
            layer.remove_dialog(&self.id);
        }
    }

    /// Send a BYE on a new client transaction, then dispose.
    pub(super) fn terminate_locked(&self, core: &mut DialogCore, reason: TerminatedReason) {
        if core.state == DialogState::Terminated {
            return;
        }
        match self.send_bye(core) {
            Ok(_) => debug!(id = %self.id, "bye sent"),
            Err(e) => warn!(id = %self.id, error = %e, "failed to send bye"),
        }
        self.dispose_locked(core, reason);
    }

    fn send_bye(&self, core: &mut DialogCore) -> Result<()> {
        let bye = self.make_request(core, rsip::Method::Bye, vec![], None)?;
        let target = self.next_hop(&bye);
        let tx = self
            .transaction_layer
            .create_client_transaction(bye, target, None)?;
        tx.begin()
    }

    /// INVITE transactions, client or server, that are still running.
    ///
    /// A transaction that reports itself already gone counts as finished.
    fn running_invites<'a>(
        &'a self,
        core: &'a DialogCore,
    ) -> impl Iterator<Item = &'a TransactionRef> + 'a {
        core.transactions
            .iter()
            .filter(|tx| tx.method() == &rsip::Method::Invite)
            .filter(move |tx| match tx.state() {
                Ok(state) => state != crate::transaction::TransactionState::Terminated,
                Err(e) => {
                    debug!(id = %self.id, key = %tx.key(), error = %e, "transaction already gone");
                    false
                }
            })
    }

    pub(super) fn pending_invite(&self, core: &DialogCore) -> Option<TransactionRef> {
        self.running_invites(core).next().cloned()
    }

    /// The running INVITE server transaction, the only one a PRACK can match.
    pub(super) fn pending_server_invite(&self, core: &DialogCore) -> Option<TransactionRef> {
        self.running_invites(core)
            .find(|tx| tx.role() == TransactionRole::Server)
            .cloned()
    }

    /// An INVITE transaction is running, or a 2xx to INVITE still waits for its ACK.
    pub(super) fn has_pending_invite(&self, core: &DialogCore) -> bool {
        self.pending_invite(core).is_some() || core.uas_2xx.is_some()
    }

    /// An UPDATE transaction exists that has no final response yet.
    pub(super) fn has_pending_update(&self, core: &DialogCore) -> bool {
        core.transactions
            .iter()
            .filter(|tx| tx.method() == &rsip::Method::Update)
            .any(|tx| match tx.final_response() {
                Ok(final_response) => final_response.is_none(),
                Err(e) => {
                    debug!(id = %self.id, key = %tx.key(), error = %e, "transaction already gone");
                    false
                }
            })
    }

    pub(super) fn create_transaction_locked(
        &self,
        core: &mut DialogCore,
        request: Request,
    ) -> Result<TransactionRef> {
        if core.state == DialogState::Terminated {
            return Err(Error::DialogError(
                "dialog terminated".to_string(),
                self.id.clone(),
                StatusCode::from(481),
            ));
        }
        match request.method {
            rsip::Method::Invite if self.has_pending_invite(core) => {
                return Err(Error::DialogError(
                    "INVITE transaction already pending".to_string(),
                    self.id.clone(),
                    StatusCode::from(491),
                ));
            }
            rsip::Method::Update if self.has_pending_update(core) => {
                return Err(Error::DialogError(
                    "UPDATE transaction already pending".to_string(),
                    self.id.clone(),
                    StatusCode::from(491),
                ));
            }
            _ => {}
        }
        let target = self.next_hop(&request);
        let tx = self.transaction_layer.create_client_transaction(
            request,
            target,
            Some(self.tu_sender.clone()),
        )?;
        core.transactions.push(tx.clone());
        Ok(tx)
    }
}

/// Dialog inbox: transaction events and timer fires, handled one at a time.
async fn serve(
    inner: DialogInnerRef,
    mut tu_receiver: TransactionEventReceiver,
    mut timer_receiver: TimerReceiver,
) {
    let cancel_token = inner.cancel_token.clone();
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            Some(event) = tu_receiver.recv() => inner.on_transaction_event(event),
            Some(fired) = timer_receiver.recv() => inner.on_timer(fired),
            else => break,
        }
    }
    debug!(id = %inner.id, "dialog inbox closed");
}

/// SIP Dialog
///
/// A cheap, cloneable handle to one dialog. All clones share the same state.
///
/// The dialog keeps running on its own (timers, retransmissions, events from
/// its transactions) until it terminates; the owner learns about requests and
/// termination through the [`DialogEvent`] channel given at creation.
///
/// # Examples
///
/// ```rust,no_run
/// use rsipdialog::dialog::dialog::{Dialog, DialogState};
///
/// # fn example(dialog: Dialog) -> rsipdialog::Result<()> {
/// if dialog.state() == DialogState::Confirmed {
///     let info = dialog.create_request(rsip::Method::Info)?;
///     let tx = dialog.create_transaction(info)?;
///     tx.begin()?;
/// }
/// dialog.terminate();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dialog {
    pub(super) inner: DialogInnerRef,
}

impl Dialog {
    pub(super) fn new(
        layer: &DialogLayerInnerRef,
        transaction: &TransactionRef,
        response: &Response,
        event_sender: DialogEventSender,
    ) -> Result<Self> {
        let (inner, tu_receiver, timer_receiver) =
            DialogInner::new(layer, transaction, response, event_sender)?;
        let inner = Arc::new(inner);
        info!(
            id = %inner.id,
            role = %inner.role,
            method = %inner.method,
            state = %inner.core.lock().unwrap().state,
            "dialog created"
        );
        tokio::spawn(serve(inner.clone(), tu_receiver, timer_receiver));
        Ok(Self { inner })
    }

    /// Run the establishing response through the pipeline: received by a
    /// client transaction, or sent by a server transaction.
    pub(super) fn process_establishing(&self, transaction: &TransactionRef, response: &Response) {
        match self.inner.role {
            TransactionRole::Client => self.inner.on_response_received(transaction, response),
            TransactionRole::Server => self.inner.on_response_sent(transaction, response),
        }
    }

    pub fn id(&self) -> DialogId {
        self.inner.id.clone()
    }

    pub fn call_id(&self) -> &str {
        &self.inner.id.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.inner.id.local_tag
    }

    pub fn remote_tag(&self) -> &str {
        &self.inner.id.remote_tag
    }

    pub fn state(&self) -> DialogState {
        self.inner.core.lock().unwrap().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == DialogState::Terminated
    }

    pub fn role(&self) -> TransactionRole {
        self.inner.role
    }

    /// Whether this side is the UAS of the dialog.
    pub fn is_server(&self) -> bool {
        self.inner.role == TransactionRole::Server
    }

    /// Method of the request that created the dialog.
    pub fn method(&self) -> &rsip::Method {
        &self.inner.method
    }

    pub fn local_seq(&self) -> u32 {
        self.inner.core.lock().unwrap().local_seq
    }

    pub fn remote_seq(&self) -> u32 {
        self.inner.core.lock().unwrap().remote_seq
    }

    pub fn local_uri(&self) -> &rsip::Uri {
        &self.inner.local_uri
    }

    pub fn remote_uri(&self) -> &rsip::Uri {
        &self.inner.remote_uri
    }

    pub fn remote_target(&self) -> rsip::Uri {
        self.inner.core.lock().unwrap().remote_target.clone()
    }

    pub fn route_set(&self) -> &[RouteEntry] {
        &self.inner.route_set
    }

    /// First hop of a client transaction for an in-dialog `request`.
    pub fn next_hop(&self, request: &Request) -> rsip::Uri {
        self.inner.next_hop(request)
    }

    pub fn is_secure(&self) -> bool {
        self.inner.is_secure
    }

    pub fn create_time(&self) -> SystemTime {
        self.inner.create_time
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel_token
    }

    /// Transactions currently attached to the dialog.
    pub fn transactions(&self) -> Vec<TransactionRef> {
        self.inner.core.lock().unwrap().transactions.clone()
    }

    pub fn has_pending_invite(&self) -> bool {
        let core = self.inner.core.lock().unwrap();
        self.inner.has_pending_invite(&core)
    }

    /// Last session description this side sent.
    pub fn local_session_body(&self) -> Vec<u8> {
        self.inner.core.lock().unwrap().local_session_body.clone()
    }

    pub fn snapshot(&self) -> DialogSnapshot {
        let core = self.inner.core.lock().unwrap();
        DialogSnapshot {
            id: self.inner.id.clone(),
            state: core.state,
            role: self.inner.role,
            method: self.inner.method.clone(),
            local_seq: core.local_seq,
            remote_seq: core.remote_seq,
            local_uri: self.inner.local_uri.clone(),
            remote_uri: self.inner.remote_uri.clone(),
            remote_target: core.remote_target.clone(),
            route_set: self.inner.route_set.clone(),
            is_secure: self.inner.is_secure,
            create_time: self.inner.create_time,
        }
    }

    /// Build a new in-dialog request. Every method but ACK takes the next
    /// local CSeq. The dialog state is not checked.
    pub fn create_request(&self, method: rsip::Method) -> Result<Request> {
        let mut core = self.inner.core.lock().unwrap();
        self.inner.make_request(&mut core, method, vec![], None)
    }

    /// Build a new in-dialog request carrying extra headers and a body.
    /// Extra headers replace the generated ones with the same name.
    pub fn create_request_with(
        &self,
        method: rsip::Method,
        headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let mut core = self.inner.core.lock().unwrap();
        self.inner.make_request(&mut core, method, headers, body)
    }

    /// Create a client transaction for `request` and attach it to the dialog.
    /// The caller starts it with [`crate::transaction::Transaction::begin`].
    ///
    /// Fails on a terminated dialog and when an INVITE (or UPDATE) would
    /// overlap one that is still pending.
    pub fn create_transaction(&self, request: Request) -> Result<TransactionRef> {
        let mut core = self.inner.core.lock().unwrap();
        self.inner.create_transaction_locked(&mut core, request)
    }

    /// Send a BYE and terminate. Does nothing on a terminated dialog.
    pub fn terminate(&self) {
        let mut core = self.inner.core.lock().unwrap();
        self.inner
            .terminate_locked(&mut core, TerminatedReason::LocalBye);
    }

    /// Terminate without sending anything.
    pub fn dispose(&self) {
        let mut core = self.inner.core.lock().unwrap();
        self.inner.dispose_locked(&mut core, TerminatedReason::Disposed);
    }

    /// Handle an in-dialog request no transaction claimed.
    pub fn process_request(&self, request: Request) {
        self.inner.on_request(request)
    }

    /// Handle a response no transaction claimed (a retransmitted 2xx).
    pub fn process_response(&self, response: &Response) {
        self.inner.on_stray_response(response)
    }
}
