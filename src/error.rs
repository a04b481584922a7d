use std::fmt::{Display, Formatter};
use std::io;
use thiserror::Error;
use crate::packet::CodecError;
use crate::sender::SenderState;
use crate::sequence::SequenceBit;

/// The reason for a single failed attempt to get a packet acknowledged. These are retried, and
///  they become visible to the caller only as the last failure before the retry budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AckTimeout,
    /// a datagram other than the ack sentinel arrived while waiting for an ack
    InvalidAck,
    Receive(io::ErrorKind),
    Send(io::ErrorKind),
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::AckTimeout => write!(f, "timed out waiting for ack"),
            FailureKind::InvalidAck => write!(f, "received invalid ack"),
            FailureKind::Receive(kind) => write!(f, "receive error: {}", kind),
            FailureKind::Send(kind) => write!(f, "send error: {}", kind),
        }
    }
}

/// Terminal failures of a transfer, i.e. everything that is not retried (any further)
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to send packet with sequence {sequence} after {retries} attempts, last failure: {last_failure}")]
    RetriesExhausted {
        sequence: SequenceBit,
        retries: u32,
        last_failure: FailureKind,
    },

    #[error("sender is {0:?} - a new transfer requires a new sender")]
    InvalidState(SenderState),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("giving up after {consecutive_errors} consecutive receive errors: {source}")]
    ReceiveFailed {
        consecutive_errors: u32,
        #[source]
        source: io::Error,
    },

    /// The byte source or sink failed - this is fatal and never retried
    #[error("resource error: {0:#}")]
    Resource(anyhow::Error),
}
