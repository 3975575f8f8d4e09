//! Transport layer seam
//!
//! Used only for sends that bypass the transaction layer: the ACK for a 2xx
//! and retransmissions of a 2xx whose server transaction is already gone.
//! Both are fire-and-forget; a failure is reported but never retried here.
use crate::Result;
use rsip::{Request, Response};
use std::sync::Arc;

pub trait Transport: Send + Sync {
    fn send_request(&self, request: Request) -> Result<()>;

    /// Send `response` to the address derived from its top Via.
    fn send_response(&self, response: Response) -> Result<()>;
}

pub type TransportRef = Arc<dyn Transport>;
