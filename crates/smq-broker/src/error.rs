use smq_store::StoreError;
use smq_wire::{ConnectReturn, FrameError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("timed out")]
    Timeout,
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("authentication failed")]
    Auth,
    #[error("connection rejected: {}", .0.as_str())]
    Rejected(ConnectReturn),
    #[error("payload too large")]
    TooLarge,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("delivery queue full")]
    Backpressure,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Connection-fatal errors close the session; message-fatal ones only
    /// drop or retain the message in flight.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Tls(_)
            | Self::Timeout
            | Self::Frame(_)
            | Self::Protocol(_)
            | Self::Auth
            | Self::Rejected(_)
            | Self::PeerClosed => true,
            Self::TooLarge | Self::Backpressure | Self::Store(_) | Self::Config(_) => false,
        }
    }
}
