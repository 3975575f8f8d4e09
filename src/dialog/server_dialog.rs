//! UAS side of the processing pipeline
//!
//! In-dialog requests arrive here once no transaction claimed them. Peer
//! mistakes (overlapping INVITE/UPDATE, stale CSeq, unmatched PRACK) are
//! answered with a SIP status and never surface as errors.
use super::{
    dialog::{DialogCore, DialogEvent, DialogInner, DialogState, TerminatedReason},
    timer::{DialogTimer, Uas2xxRetransmit},
    DialogId,
};
use crate::{transaction::TransactionRef, Result};
use rsip::{prelude::HeadersExt, Header, Method, Request, Response, StatusCode, StatusCodeKind};
use tracing::{debug, info, warn};

impl DialogInner {
    pub(super) fn on_request(&self, request: Request) {
        let mut core = self.core.lock().unwrap();
        if core.state == DialogState::Terminated {
            debug!(id = %self.id, method = %request.method, "dialog terminated, request discarded");
            return;
        }
        match DialogId::from_uas_request(&request) {
            Ok(id) if id == self.id => {}
            Ok(id) => {
                debug!(id = %self.id, request_id = %id, "request belongs to another dialog, discarded");
                return;
            }
            Err(e) => {
                debug!(id = %self.id, error = %e, "request without dialog tags, discarded");
                return;
            }
        }
        debug!(id = %self.id, method = %request.method, state = %core.state, "handle request");

        let method = request.method.clone();
        let result = match method {
            Method::Bye => self.handle_bye(&mut core, request),
            Method::Ack => {
                self.handle_ack(&mut core);
                Ok(())
            }
            Method::PRack => self.handle_prack(&mut core, request),
            _ => self.handle_request(&mut core, request),
        };
        if let Err(e) = result {
            warn!(id = %self.id, method = %method, error = %e, "failed to handle request");
        }
    }

    fn handle_bye(&self, core: &mut DialogCore, request: Request) -> Result<()> {
        debug!(id = %self.id, uri = %request.uri, "received bye");
        let result = self
            .transaction_layer
            .create_server_transaction(request.clone(), None)
            .and_then(|tx| tx.send_response(self.make_response(&request, StatusCode::OK, vec![], None)));
        self.dispose_locked(core, TerminatedReason::RemoteBye);
        result
    }

    fn handle_ack(&self, core: &mut DialogCore) {
        if core.uas_2xx.take().is_some() {
            debug!(id = %self.id, "ACK received, 2xx retransmission stopped");
        }
        self.transition(core, DialogState::Confirmed);
    }

    fn handle_prack(&self, core: &mut DialogCore, request: Request) -> Result<()> {
        let tx = self
            .transaction_layer
            .create_server_transaction(request.clone(), None)?;
        let matched = self
            .pending_server_invite(core)
            .map(|invite| invite.process_prack(&request))
            .unwrap_or(false);
        let status = if matched {
            StatusCode::OK
        } else {
            info!(id = %self.id, "PRACK does not match any reliable provisional response");
            StatusCode::from(481)
        };
        tx.send_response(self.make_response(&request, status, vec![], None))
    }

    fn handle_request(&self, core: &mut DialogCore, request: Request) -> Result<()> {
        let cseq = request.cseq_header()?.seq()?;

        if request.method == Method::Invite {
            if let Some(pending) = self.pending_invite(core) {
                if cseq < pending.request().cseq_header()?.seq()? {
                    return self.reject(&request, 500, "INVITE older than the pending one", true);
                }
            }
            if self.has_pending_invite(core) {
                return self.reject(&request, 491, "INVITE already pending", false);
            }
        }
        if request.method == Method::Update && self.has_pending_update(core) {
            return self.reject(&request, 500, "UPDATE already pending", true);
        }
        if cseq <= core.remote_seq {
            return self.reject(&request, 500, "CSeq out of order", true);
        }
        core.remote_seq = cseq;

        let tx = self
            .transaction_layer
            .create_server_transaction(request.clone(), Some(self.tu_sender.clone()))?;
        core.transactions.push(tx.clone());
        self.event_sender
            .send(DialogEvent::RequestReceived(self.id.clone(), request, tx))
            .ok();
        Ok(())
    }

    fn reject(&self, request: &Request, code: u16, reason: &str, retry_after: bool) -> Result<()> {
        info!(
            id = %self.id,
            method = %request.method,
            code,
            reason,
            "rejecting in-dialog request"
        );
        let mut headers = vec![];
        if retry_after {
            headers.push(Header::RetryAfter(
                self.option.retry_after_value().to_string().into(),
            ));
        }
        let tx = self
            .transaction_layer
            .create_server_transaction(request.clone(), None)?;
        tx.send_response(self.make_response(request, StatusCode::from(code), headers, None))
    }

    /// A server transaction of this dialog sent `response`.
    pub(super) fn on_response_sent(&self, tx: &TransactionRef, response: &Response) {
        let mut core = self.core.lock().unwrap();
        if core.state == DialogState::Terminated {
            return;
        }
        if core.state == DialogState::Early {
            let to_tag = response
                .to_header()
                .ok()
                .and_then(|to| to.tag().ok().flatten())
                .map(|tag| tag.value().to_string());
            if to_tag.as_deref() != Some(self.id.local_tag.as_str()) {
                return;
            }
        }

        let method = tx.method().clone();
        let code = u16::from(response.status_code.clone());
        let success = matches!(response.status_code.kind(), StatusCodeKind::Successful);
        if success && matches!(method, Method::Invite | Method::Update) {
            core.local_session_body = response.body.clone();
            self.update_session_timer(&mut core, response, false);
        }
        if success && method == Method::Invite && core.uas_2xx.is_none() {
            debug!(id = %self.id, "2xx retransmission started");
            core.uas_2xx = Some(Uas2xxRetransmit {
                response: response.clone(),
                started: tokio::time::Instant::now(),
                timer: self.timers.schedule(DialogTimer::Uas2xxRetransmit, self.option.t1),
            });
        }
        if code >= 300 && method == Method::Invite && core.state == DialogState::Early {
            self.dispose_locked(&mut core, TerminatedReason::Rejected(response.status_code.clone()));
        }
    }

    /// Resend the stored 2xx, or give up once 64*T1 passed without an ACK:
    /// the dialog counts as confirmed and is closed with a BYE.
    pub(super) fn on_uas_2xx_retransmit(&self, core: &mut DialogCore, generation: u64) {
        let (response, interval, expired) = match core.uas_2xx.as_ref() {
            Some(pending) if pending.timer.generation == generation => (
                pending.response.clone(),
                pending.timer.interval,
                pending.started.elapsed() > self.option.t1x64,
            ),
            _ => return,
        };

        if expired {
            warn!(id = %self.id, "no ACK for 2xx, terminating session");
            core.uas_2xx = None;
            self.transition(core, DialogState::Confirmed);
            self.terminate_locked(core, TerminatedReason::AckTimeout);
            return;
        }

        debug!(id = %self.id, "2xx retransmitted");
        if let Err(e) = self.transport.send_response(response) {
            warn!(id = %self.id, error = %e, "failed to retransmit 2xx");
        }
        let next = (interval * 2).min(self.option.t2);
        if let Some(pending) = core.uas_2xx.as_mut() {
            pending.timer = self.timers.schedule(DialogTimer::Uas2xxRetransmit, next);
        }
    }
}
