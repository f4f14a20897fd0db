use crate::association::ProtocolViolation;
use crate::error::{CommandError, DatasetError, PduError};

/// Error which ends an association.
#[derive(thiserror::Error, Debug)]
pub enum AssociationError {
    #[error("transport error")]
    Io(#[from] std::io::Error),

    #[error("could not decode PDU")]
    Pdu(#[from] PduError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("invalid DIMSE command")]
    Command(#[from] CommandError),

    #[error("invalid data set")]
    Dataset(#[from] DatasetError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Missing presentation context {0}")]
    UnknownPresentationContext(u8),

    #[error("peer closed the connection in the middle of a PDU")]
    ConnectionClosed,

    #[error("connection closed with {0} incomplete messages")]
    IncompleteMessages(usize),

    #[error("{0}")]
    CannotRespond(&'static str),
}
