//! UAC side of the processing pipeline
//!
//! Responses reported by the dialog's client transactions, and stray 2xx
//! retransmissions that arrive after the INVITE transaction is gone.
use super::{
    dialog::{DialogCore, DialogInner, DialogState, TerminatedReason},
    timer::{DialogTimer, Uac2xxWait},
};
use crate::{
    rsip_ext::{contact_uri, header_contains_token, parse_rseq_header, via_branch},
    transaction::{TransactionRef, TransactionRole},
    Result,
};
use rsip::{prelude::HeadersExt, Method, Response, StatusCodeKind};
use tracing::{debug, info, warn};

/// Key of a 2xx-wait entry: top Via branch and CSeq method of the 2xx.
fn uac_2xx_key(response: &Response) -> Result<String> {
    let branch = via_branch(response.via_header()?).unwrap_or_default();
    Ok(format!("{}-{}", branch, response.cseq_header()?.method()?))
}

fn cseq_seq(response: &Response) -> Option<u32> {
    response.cseq_header().ok()?.seq().ok()
}

impl DialogInner {
    pub(super) fn on_response_received(&self, tx: &TransactionRef, response: &Response) {
        let mut core = self.core.lock().unwrap();
        if core.state == DialogState::Terminated {
            return;
        }
        if let Err(e) = self.handle_response(&mut core, tx, response) {
            warn!(
                id = %self.id,
                status = %response.status_code,
                error = %e,
                "failed to handle response"
            );
        }
    }

    fn handle_response(
        &self,
        core: &mut DialogCore,
        tx: &TransactionRef,
        response: &Response,
    ) -> Result<()> {
        // forked dialogs share the INVITE transaction and all see its responses
        let to_tag = response.to_header()?.tag()?.map(|t| t.value().to_string());
        if to_tag.as_deref() != Some(self.id.remote_tag.as_str()) {
            debug!(id = %self.id, "response belongs to a sibling dialog, ignored");
            return Ok(());
        }

        let method = tx.method().clone();
        let code = u16::from(response.status_code.clone());
        let success = matches!(response.status_code.kind(), StatusCodeKind::Successful);

        if (101..200).contains(&code)
            && method == Method::Invite
            && header_contains_token(&response.headers, "Require", "100rel")
        {
            self.acknowledge_reliable_provisional(core, tx, response)?;
        }

        if success && matches!(method, Method::Invite | Method::Update) {
            core.local_session_body = tx.request().body.clone();
            self.update_session_timer(core, response, true);
            if let Ok(contact) = response.contact_header() {
                core.remote_target = contact_uri(contact)?;
            }
        }

        if code == 481 || code == 408 {
            info!(id = %self.id, method = %method, code, "in-dialog request failed");
            self.dispose_locked(core, TerminatedReason::Failure(response.status_code.clone()));
            return Ok(());
        }
        if core.state == DialogState::Early && code >= 300 {
            self.dispose_locked(core, TerminatedReason::Rejected(response.status_code.clone()));
            return Ok(());
        }
        if method == Method::Invite && success {
            self.acknowledge_2xx(core, tx, response)?;
            self.transition(core, DialogState::Confirmed);
        }
        Ok(())
    }

    /// PRACK a reliable provisional response, but only the next one in RSeq
    /// order (RFC 3262 4). Anything else is ignored.
    fn acknowledge_reliable_provisional(
        &self,
        core: &mut DialogCore,
        tx: &TransactionRef,
        response: &Response,
    ) -> Result<()> {
        let Some(rseq) = parse_rseq_header(&response.headers) else {
            warn!(id = %self.id, "received reliable provisional response without RSeq");
            return Ok(());
        };
        if let Some(last) = core.reliable_rseq.get(tx.key()) {
            if last.checked_add(1) != Some(rseq) {
                debug!(id = %self.id, rseq, last, "reliable provisional response out of order, ignored");
                return Ok(());
            }
        }

        let prack = self.make_prack(core, response, rseq)?;
        let prack_tx = self.create_transaction_locked(core, prack)?;
        core.reliable_rseq.insert(tx.key().clone(), rseq);
        prack_tx.begin()
    }

    /// Send the ACK straight to the transport and keep it for 64*T1 so
    /// retransmitted 2xx get the same ACK again.
    fn acknowledge_2xx(
        &self,
        core: &mut DialogCore,
        tx: &TransactionRef,
        response: &Response,
    ) -> Result<()> {
        let ack = self.make_ack(core, tx.request())?;
        if let Err(e) = self.transport.send_request(ack.clone()) {
            warn!(id = %self.id, error = %e, "failed to send ACK");
        }

        let key = uac_2xx_key(response)?;
        let timer = self
            .timers
            .schedule(DialogTimer::Uac2xxWait(key.clone()), self.option.t1x64);
        let mut waits = self.uac_2xx_waits.lock().unwrap();
        waits.retain(|w| w.key != key);
        waits.push(Uac2xxWait {
            key,
            response: response.clone(),
            ack,
            timer,
        });
        Ok(())
    }

    /// A response no transaction claimed. Only a retransmitted 2xx to INVITE
    /// matters: it gets the stored ACK again.
    pub(super) fn on_stray_response(&self, response: &Response) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        let is_invite_2xx = matches!(response.status_code.kind(), StatusCodeKind::Successful)
            && response
                .cseq_header()
                .ok()
                .and_then(|cseq| cseq.method().ok())
                .map(|method| method == Method::Invite)
                .unwrap_or(false);
        if !is_invite_2xx {
            debug!(id = %self.id, status = %response.status_code, "stray response discarded");
            return;
        }

        let key = match uac_2xx_key(response) {
            Ok(key) => key,
            Err(e) => {
                debug!(id = %self.id, error = %e, "stray 2xx discarded");
                return;
            }
        };
        let ack = self
            .uac_2xx_waits
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.key == key && cseq_seq(&w.response) == cseq_seq(response))
            .map(|w| w.ack.clone());
        match ack {
            Some(ack) => {
                debug!(id = %self.id, key = %key, "2xx retransmission, ACK resent");
                if let Err(e) = self.transport.send_request(ack) {
                    warn!(id = %self.id, error = %e, "failed to resend ACK");
                }
            }
            None => debug!(id = %self.id, key = %key, "unmatched 2xx discarded"),
        }
    }

    pub(super) fn on_transaction_timed_out(&self, tx: &TransactionRef) {
        if tx.role() != TransactionRole::Client {
            return;
        }
        let mut core = self.core.lock().unwrap();
        info!(id = %self.id, key = %tx.key(), "client transaction timed out");
        self.dispose_locked(&mut core, TerminatedReason::Timeout);
    }
}
