//! Dialog timers
//!
//! Every dialog owns at most one live handle per timer kind (2xx-wait entries
//! carry their own). A handle is a spawned sleep that posts a [`TimerFired`]
//! message into the dialog's inbox; dropping the handle cancels the sleep.
//! Each handle also carries a generation number, and the inbox ignores any
//! fire whose generation no longer matches the live handle, so a fire that was
//! already in flight when the timer got cancelled or replaced does nothing.
use super::dialog::{DialogCore, DialogInner, DialogState, TerminatedReason};
use crate::rsip_ext::{parse_session_expires, Refresher, SessionExpires};
use rsip::{Header, Method, Response};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DialogTimer {
    /// Early dialog never confirmed.
    EarlyDialog,
    /// Retransmit the 2xx to INVITE until the ACK arrives.
    Uas2xxRetransmit,
    /// Stop absorbing 2xx retransmissions for one ACKed 2xx, keyed by branch and method.
    Uac2xxWait(String),
    /// Session interval elapsed without a refresh.
    SessionExpires,
    /// Half the session interval elapsed, send a refresh.
    SessionRefresh,
}

impl fmt::Display for DialogTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogTimer::EarlyDialog => write!(f, "EarlyDialog"),
            DialogTimer::Uas2xxRetransmit => write!(f, "Uas2xxRetransmit"),
            DialogTimer::Uac2xxWait(key) => write!(f, "Uac2xxWait({})", key),
            DialogTimer::SessionExpires => write!(f, "SessionExpires"),
            DialogTimer::SessionRefresh => write!(f, "SessionRefresh"),
        }
    }
}

#[derive(Debug)]
pub struct TimerFired {
    pub timer: DialogTimer,
    pub generation: u64,
}

pub(super) type TimerSender = UnboundedSender<TimerFired>;
pub(super) type TimerReceiver = UnboundedReceiver<TimerFired>;

/// Live handle of an armed timer. Dropping it cancels the timer.
#[derive(Debug)]
pub(super) struct ScheduledTimer {
    pub generation: u64,
    pub interval: Duration,
    token: CancellationToken,
}

impl Drop for ScheduledTimer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(super) fn is_live(timer: Option<&ScheduledTimer>, generation: u64) -> bool {
    timer.map(|t| t.generation == generation).unwrap_or(false)
}

pub(super) struct TimerScheduler {
    sender: TimerSender,
    cancel_token: CancellationToken,
    last_generation: AtomicU64,
}

impl TimerScheduler {
    /// Timers are children of `cancel_token`: cancelling the dialog cancels them all.
    pub fn new(sender: TimerSender, cancel_token: CancellationToken) -> Self {
        Self {
            sender,
            cancel_token,
            last_generation: AtomicU64::new(0),
        }
    }

    pub fn schedule(&self, timer: DialogTimer, delay: Duration) -> ScheduledTimer {
        let generation = self.last_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.cancel_token.child_token();
        let sender = self.sender.clone();
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    sender.send(TimerFired { timer, generation }).ok();
                }
            }
        });
        ScheduledTimer {
            generation,
            interval: delay,
            token,
        }
    }
}

/// The 2xx to INVITE a UAS keeps resending until the ACK arrives.
pub(super) struct Uas2xxRetransmit {
    pub response: Response,
    pub started: tokio::time::Instant,
    pub timer: ScheduledTimer,
}

/// A 2xx the UAC has acknowledged, kept for 64*T1 to re-ACK retransmissions.
pub(super) struct Uac2xxWait {
    pub key: String,
    pub response: Response,
    pub ack: rsip::Request,
    pub timer: ScheduledTimer,
}

impl DialogInner {
    pub(super) fn on_timer(&self, fired: TimerFired) {
        let mut core = self.core.lock().unwrap();
        if core.state == DialogState::Terminated || self.cancel_token.is_cancelled() {
            return;
        }
        let generation = fired.generation;
        match fired.timer {
            DialogTimer::EarlyDialog => {
                if !is_live(core.early_timer.as_ref(), generation) {
                    return;
                }
                core.early_timer = None;
                if core.state == DialogState::Early {
                    info!(id = %self.id, "early dialog not confirmed in time");
                    self.dispose_locked(&mut core, TerminatedReason::EarlyTimeout);
                }
            }
            DialogTimer::Uas2xxRetransmit => self.on_uas_2xx_retransmit(&mut core, generation),
            DialogTimer::Uac2xxWait(key) => {
                let mut waits = self.uac_2xx_waits.lock().unwrap();
                let before = waits.len();
                waits.retain(|w| !(w.key == key && w.timer.generation == generation));
                if waits.len() != before {
                    debug!(id = %self.id, key = %key, "2xx retransmission wait finished");
                }
            }
            DialogTimer::SessionExpires => {
                if !is_live(core.session_timer.as_ref(), generation) {
                    return;
                }
                core.session_timer = None;
                info!(id = %self.id, "session expired without refresh");
                if core.state == DialogState::Confirmed {
                    self.terminate_locked(&mut core, TerminatedReason::SessionExpired);
                } else {
                    self.dispose_locked(&mut core, TerminatedReason::SessionExpired);
                }
            }
            DialogTimer::SessionRefresh => {
                let interval = match core.refresh_timer.as_ref() {
                    Some(timer) if timer.generation == generation => timer.interval,
                    _ => return,
                };
                self.refresh_session(&mut core);
                core.refresh_timer = Some(self.timers.schedule(DialogTimer::SessionRefresh, interval));
            }
        }
    }

    /// (Re)arm the session timers after a successful INVITE/UPDATE (RFC 4028).
    ///
    /// `uac` is true when this side sent the request the response answers.
    pub(super) fn update_session_timer(&self, core: &mut DialogCore, response: &Response, uac: bool) {
        let session = parse_session_expires(&response.headers);
        let delta_seconds = session
            .map(|s| s.delta_seconds)
            .filter(|d| *d > 0)
            .unwrap_or(self.option.session_expires);
        let we_refresh = match session.and_then(|s| s.refresher) {
            None => true,
            Some(Refresher::Uac) => uac,
            Some(Refresher::Uas) => !uac,
        };

        let interval = Duration::from_secs(delta_seconds as u64);
        core.session_timer = Some(self.timers.schedule(DialogTimer::SessionExpires, interval));
        core.refresh_timer = if we_refresh {
            Some(self.timers.schedule(DialogTimer::SessionRefresh, interval / 2))
        } else {
            None
        };
        debug!(
            id = %self.id,
            session_expires = delta_seconds,
            refresher = we_refresh,
            "session timer armed"
        );
    }

    /// Send a re-INVITE with the last local session body.
    fn refresh_session(&self, core: &mut DialogCore) {
        if self.has_pending_invite(core) {
            warn!(id = %self.id, "INVITE pending, session refresh skipped");
            return;
        }
        let headers = vec![
            SessionExpires::new(self.option.session_expires, Some(Refresher::Uas)).to_header(),
            Header::ContentType("application/sdp".into()),
        ];
        let body = core.local_session_body.clone();
        let result = self
            .make_request(core, Method::Invite, headers, Some(body))
            .and_then(|request| self.create_transaction_locked(core, request))
            .and_then(|tx| tx.begin());
        match result {
            Ok(_) => debug!(id = %self.id, "session refresh sent"),
            Err(e) => warn!(id = %self.id, error = %e, "session refresh failed"),
        }
    }
}
