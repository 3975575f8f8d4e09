use crate::{dialog::DialogId, transaction::TransactionKey};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(String),

    #[error("Dialog error: {0}: {1} ({2})")]
    DialogError(String, DialogId, rsip::StatusCode),

    #[error("Transaction error: {0}: {1}")]
    TransactionError(String, TransactionKey),

    #[error("Transport layer error: {0}")]
    TransportLayerError(String),

    #[error("Error: {0}")]
    Error(String),
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}
