//! rsipdialog: the dialog layer of a SIP user agent
//!
//! This crate owns everything that lives between individual SIP transactions
//! and the application: dialog identity, CSeq bookkeeping, route sets, the
//! early/confirmed/terminated state machine, 2xx retransmission and
//! re-acknowledgement, reliable provisional responses (RFC 3262) and session
//! timers (RFC 4028).
//!
//! Message parsing is delegated to [`rsip`]. The transaction and transport
//! layers are consumed through the [`transaction::TransactionLayer`] and
//! [`transport::Transport`] traits, so any SIP stack can host the engine.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Application                  │
//! └───────────────▲───────────────────┬───────────┘
//!   DialogEvent   │                   │ create_request / create_transaction / terminate
//! ┌───────────────┴───────────────────▼───────────┐
//! │     DialogLayer  ─────►  Dialog (inbox task)   │
//! │                          ├─ processing pipeline│
//! │                          ├─ request builder    │
//! │                          └─ timers             │
//! └───────┬──────────────────────────────┬────────┘
//!         │ TransactionLayer              │ Transport
//! ┌───────▼──────────────┐     ┌─────────▼─────────┐
//! │ client/server        │     │ fire-and-forget   │
//! │ transactions         │     │ ACK / 2xx resend  │
//! └──────────────────────┘     └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use rsipdialog::dialog::dialog_layer::{DialogLayerBuilder, DialogOption};
//! # use std::sync::Arc;
//! # fn example(
//! #     transactions: Arc<dyn rsipdialog::transaction::TransactionLayer>,
//! #     transport: Arc<dyn rsipdialog::transport::Transport>,
//! # ) -> rsipdialog::Result<()> {
//! let layer = DialogLayerBuilder::new()
//!     .with_option(DialogOption::default())
//!     .with_transaction_layer(transactions)
//!     .with_transport(transport)
//!     .build()?;
//! assert!(layer.is_empty());
//! # Ok(())
//! # }
//! ```
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;

pub mod dialog;
pub mod error;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub const VERSION: &str = concat!("rsipdialog/", env!("CARGO_PKG_VERSION"));
