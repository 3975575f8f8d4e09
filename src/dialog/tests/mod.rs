use crate::{
    dialog::{
        dialog::{Dialog, DialogEvent, DialogEventReceiver, TerminatedReason},
        dialog_layer::{DialogLayer, DialogLayerBuilder, DialogOption},
    },
    rsip_ext::{parse_rack_header, parse_rseq_header},
    transaction::{
        Transaction, TransactionEvent, TransactionEventSender, TransactionKey, TransactionLayer,
        TransactionRef, TransactionRole, TransactionState,
    },
    transport::Transport,
    Error,
};
use rsip::{
    headers::*,
    prelude::{HeadersExt, UntypedHeader},
    Header, Method, Request, Response, StatusCode, Uri,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

mod test_request;

pub const CALL_ID: &str = "a84b4c76e66710@pc33.atlanta.example.com";
pub const ALICE_TAG: &str = "1928301774";
pub const BOB_TAG: &str = "a6c85cf";
pub const ALICE_CONTACT: &str = "sip:alice@192.0.2.10:5060";
pub const BOB_CONTACT: &str = "sip:bob@192.0.2.20:5060";
pub const SDP: &[u8] = b"v=0\r\no=alice 2890844526 2890844526 IN IP4 192.0.2.10\r\n";

/// In-memory transaction: records what the dialog does with it and reports
/// events the way a real transaction layer would.
pub struct MockTransaction {
    me: Weak<MockTransaction>,
    key: TransactionKey,
    request: Request,
    state: Mutex<TransactionState>,
    events: Mutex<Vec<TransactionEventSender>>,
    begun: AtomicBool,
    gone: AtomicBool,
    responses: Mutex<Vec<Response>>,
    reliable_rseq: Mutex<Option<u32>>,
}

impl MockTransaction {
    pub fn new(request: Request, role: TransactionRole) -> Arc<Self> {
        let key = TransactionKey::from_request(&request, role).expect("request with via branch");
        let state = match role {
            TransactionRole::Client => TransactionState::Calling,
            TransactionRole::Server => TransactionState::Proceeding,
        };
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            key,
            request,
            state: Mutex::new(state),
            events: Mutex::new(vec![]),
            begun: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            responses: Mutex::new(vec![]),
            reliable_rseq: Mutex::new(None),
        })
    }

    pub fn tx_ref(&self) -> TransactionRef {
        self.me.upgrade().expect("transaction alive")
    }

    pub fn is_begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self) -> bool {
        self.listeners() > 0
    }

    pub fn listeners(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> Option<u16> {
        self.responses
            .lock()
            .unwrap()
            .last()
            .map(|r| u16::from(r.status_code.clone()))
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_gone(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }

    /// Track a response as if it went over the wire, without notifying anyone.
    pub fn record_response(&self, response: &Response) {
        let code = u16::from(response.status_code.clone());
        if (101..200).contains(&code) {
            if let Some(rseq) = parse_rseq_header(&response.headers) {
                *self.reliable_rseq.lock().unwrap() = Some(rseq);
            }
        }
        let state = match code {
            100..=199 => TransactionState::Proceeding,
            200..=299 => TransactionState::Terminated,
            _ => TransactionState::Completed,
        };
        self.set_state(state);
        self.responses.lock().unwrap().push(response.clone());
    }

    fn emit(&self, event: TransactionEvent) {
        self.events
            .lock()
            .unwrap()
            .retain(|events| events.send(event.clone()).is_ok());
    }

    /// Client side: a response arrived from the network.
    pub fn receive_response(&self, response: Response) {
        self.record_response(&response);
        self.emit(TransactionEvent::ResponseReceived(self.tx_ref(), response));
    }

    pub fn time_out(&self) {
        self.set_state(TransactionState::Terminated);
        self.emit(TransactionEvent::TimedOut(self.tx_ref()));
    }

    pub fn terminate(&self) {
        self.set_state(TransactionState::Terminated);
        self.emit(TransactionEvent::Terminated(self.key.clone()));
    }
}

impl Transaction for MockTransaction {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn request(&self) -> &Request {
        &self.request
    }

    fn state(&self) -> crate::Result<TransactionState> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(Error::TransactionError(
                "transaction gone".to_string(),
                self.key.clone(),
            ));
        }
        Ok(*self.state.lock().unwrap())
    }

    fn attach(&self, events: TransactionEventSender) {
        self.events.lock().unwrap().push(events);
    }

    fn begin(&self) -> crate::Result<()> {
        self.begun.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send_response(&self, response: Response) -> crate::Result<()> {
        self.record_response(&response);
        self.emit(TransactionEvent::ResponseSent(self.tx_ref(), response));
        Ok(())
    }

    fn final_response(&self) -> crate::Result<Option<Response>> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(Error::TransactionError(
                "transaction gone".to_string(),
                self.key.clone(),
            ));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| u16::from(r.status_code.clone()) >= 200)
            .cloned())
    }

    fn process_prack(&self, prack: &Request) -> bool {
        let Some(rack) = parse_rack_header(&prack.headers) else {
            return false;
        };
        let Ok(cseq) = self.request.cseq_header().and_then(|c| c.seq()) else {
            return false;
        };
        *self.reliable_rseq.lock().unwrap() == Some(rack.rseq)
            && rack.cseq == cseq
            && rack.method.eq_ignore_ascii_case(&self.request.method.to_string())
    }
}

#[derive(Default)]
pub struct MockTransactionLayer {
    transactions: Mutex<Vec<Arc<MockTransaction>>>,
    targets: Mutex<Vec<Uri>>,
    last_branch: AtomicU32,
}

impl MockTransactionLayer {
    pub fn all(&self) -> Vec<Arc<MockTransaction>> {
        self.transactions.lock().unwrap().clone()
    }

    pub fn created(&self, method: Method, role: TransactionRole) -> Vec<Arc<MockTransaction>> {
        self.all()
            .into_iter()
            .filter(|tx| tx.request.method == method && tx.key.role == role)
            .collect()
    }

    pub fn last(&self, method: Method, role: TransactionRole) -> Option<Arc<MockTransaction>> {
        self.created(method, role).pop()
    }

    pub fn targets(&self) -> Vec<Uri> {
        self.targets.lock().unwrap().clone()
    }

    fn add(
        &self,
        request: Request,
        role: TransactionRole,
        events: Option<TransactionEventSender>,
    ) -> Arc<MockTransaction> {
        let tx = MockTransaction::new(request, role);
        if let Some(events) = events {
            tx.attach(events);
        }
        self.transactions.lock().unwrap().push(tx.clone());
        tx
    }
}

impl TransactionLayer for MockTransactionLayer {
    fn create_client_transaction(
        &self,
        mut request: Request,
        target: Uri,
        events: Option<TransactionEventSender>,
    ) -> crate::Result<TransactionRef> {
        if request.via_header().is_err() {
            let branch = self.last_branch.fetch_add(1, Ordering::SeqCst) + 1;
            let mut headers: Vec<Header> = vec![Via::new(format!(
                "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKmock{}",
                branch
            ))
            .into()];
            headers.extend(request.headers.iter().cloned());
            request.headers = headers.into();
        }
        self.targets.lock().unwrap().push(target);
        Ok(self.add(request, TransactionRole::Client, events))
    }

    fn create_server_transaction(
        &self,
        request: Request,
        events: Option<TransactionEventSender>,
    ) -> crate::Result<TransactionRef> {
        Ok(self.add(request, TransactionRole::Server, events))
    }
}

#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<Request>>,
    responses: Mutex<Vec<Response>>,
    pub fail: AtomicBool,
}

impl MockTransport {
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send_request(&self, request: Request) -> crate::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::TransportLayerError("connection refused".to_string()));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }

    fn send_response(&self, response: Response) -> crate::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::TransportLayerError("connection refused".to_string()));
        }
        self.responses.lock().unwrap().push(response);
        Ok(())
    }
}

pub struct TestEnv {
    pub layer: DialogLayer,
    pub transactions: Arc<MockTransactionLayer>,
    pub transport: Arc<MockTransport>,
}

pub fn test_option() -> DialogOption {
    DialogOption {
        retry_after: Some(5),
        contact_host: "192.0.2.99:5060".to_string(),
        ..Default::default()
    }
}

pub fn test_env() -> crate::Result<TestEnv> {
    test_env_with(test_option())
}

pub fn test_env_with(option: DialogOption) -> crate::Result<TestEnv> {
    let transactions = Arc::new(MockTransactionLayer::default());
    let transport = Arc::new(MockTransport::default());
    let layer = DialogLayerBuilder::new()
        .with_option(option)
        .with_transaction_layer(transactions.clone())
        .with_transport(transport.clone())
        .build()?;
    Ok(TestEnv {
        layer,
        transactions,
        transport,
    })
}

/// INVITE from Alice to Bob, as Alice sends it and as Bob receives it.
pub fn invite_request(branch: &str, extra: Vec<Header>) -> Request {
    let mut headers: Vec<Header> = vec![
        Via::new(format!("SIP/2.0/UDP 192.0.2.10:5060;branch={}", branch)).into(),
        MaxForwards::new("70").into(),
        From::new(format!("Alice <sip:alice@atlanta.example.com>;tag={}", ALICE_TAG)).into(),
        To::new("Bob <sip:bob@biloxi.example.com>").into(),
        CallId::new(CALL_ID).into(),
        CSeq::new("1 INVITE").into(),
        Contact::new(format!("<{}>", ALICE_CONTACT)).into(),
        ContentType::new("application/sdp").into(),
    ];
    headers.extend(extra);
    Request {
        method: Method::Invite,
        uri: Uri::try_from("sip:bob@biloxi.example.com").expect("uri"),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: SDP.to_vec(),
    }
}

/// Response to `request`; `to_tag` is added to To when it has none yet.
pub fn response_to(request: &Request, code: u16, to_tag: Option<&str>, extra: Vec<Header>) -> Response {
    let mut headers: Vec<Header> = vec![];
    for header in request.headers.iter() {
        match header {
            Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                headers.push(header.clone())
            }
            Header::To(to) => {
                let value = match to_tag {
                    Some(tag) if !to.value().contains(";tag=") => {
                        format!("{};tag={}", to.value(), tag)
                    }
                    _ => to.value().to_string(),
                };
                headers.push(To::new(value).into());
            }
            _ => {}
        }
    }
    headers.extend(extra);
    Response {
        status_code: StatusCode::from(code),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: vec![],
    }
}

pub fn contact(uri: &str) -> Header {
    Contact::new(format!("<{}>", uri)).into()
}

/// An in-dialog request sent by the peer: From carries `remote_tag`, To
/// carries `local_tag`.
pub fn in_dialog_request(
    method: Method,
    cseq: u32,
    local_tag: &str,
    remote_tag: &str,
    extra: Vec<Header>,
) -> Request {
    let mut headers: Vec<Header> = vec![
        Via::new(format!(
            "SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bK{}{}",
            method.to_string().to_lowercase(),
            cseq
        ))
        .into(),
        MaxForwards::new("70").into(),
        From::new(format!("<sip:peer@example.com>;tag={}", remote_tag)).into(),
        To::new(format!("<sip:local@example.com>;tag={}", local_tag)).into(),
        CallId::new(CALL_ID).into(),
        CSeq::new(format!("{} {}", cseq, method)).into(),
        Contact::new(format!("<{}>", ALICE_CONTACT)).into(),
    ];
    headers.extend(extra);
    Request {
        method,
        uri: Uri::try_from(BOB_CONTACT).expect("uri"),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

pub struct TestDialog {
    pub dialog: Dialog,
    pub invite: Arc<MockTransaction>,
    pub events: DialogEventReceiver,
}

/// Alice's dialog, established by Bob answering her INVITE with `code`.
pub fn create_uac_dialog(env: &TestEnv, code: u16, extra: Vec<Header>) -> crate::Result<TestDialog> {
    let invite = MockTransaction::new(invite_request("z9hG4bK74bf9", vec![]), TransactionRole::Client);
    let mut headers = vec![contact(BOB_CONTACT)];
    headers.extend(extra);
    let response = response_to(invite.request(), code, Some(BOB_TAG), headers);
    invite.record_response(&response);
    let (sender, events) = env.layer.new_dialog_event_channel();
    let dialog = env.layer.create_dialog(&invite.tx_ref(), &response, sender)?;
    Ok(TestDialog {
        dialog,
        invite,
        events,
    })
}

/// Bob's dialog, established by answering Alice's INVITE with `code`.
pub fn create_uas_dialog(env: &TestEnv, code: u16, extra: Vec<Header>) -> crate::Result<TestDialog> {
    let invite = MockTransaction::new(invite_request("z9hG4bK74bf9", vec![]), TransactionRole::Server);
    let mut headers = vec![contact(BOB_CONTACT)];
    headers.extend(extra);
    let response = response_to(invite.request(), code, Some(BOB_TAG), headers);
    invite.record_response(&response);
    let (sender, events) = env.layer.new_dialog_event_channel();
    let dialog = env.layer.create_dialog(&invite.tx_ref(), &response, sender)?;
    Ok(TestDialog {
        dialog,
        invite,
        events,
    })
}

/// Poll `check` until it holds, for up to a second.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Next termination event, skipping everything else.
pub async fn wait_terminated(events: &mut DialogEventReceiver) -> Option<TerminatedReason> {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let DialogEvent::Terminated(_, reason) = event {
                return Some(reason);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(1), wait)
        .await
        .ok()
        .flatten()
}

pub fn header_text(headers: &rsip::Headers, name: &str) -> Option<String> {
    crate::rsip_ext::header_value(headers, name)
}
