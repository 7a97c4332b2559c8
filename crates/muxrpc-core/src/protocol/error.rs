use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("connect timeout: expect connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("server handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    #[error("call timeout after {0:?}")]
    CallTimeout(Duration),

    #[error("call canceled")]
    Canceled,

    #[error("invalid magic value {0:#x}")]
    BadMagic(u32),

    #[error("unknown codec type: {0}")]
    UnknownCodec(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame too large: {0} bytes (max {1} bytes)")]
    FrameTooLarge(usize, usize),

    #[error("{0}")]
    Remote(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("service/method not found: {0}")]
    MethodNotFound(String),

    #[error("service already defined: {0}")]
    ServiceAlreadyDefined(String),

    #[error("invalid service method '{0}', expect Service.method")]
    BadServiceMethod(String),

    #[error("no available servers")]
    NoAvailableServers,

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid rpc address '{0}', expect protocol@addr")]
    BadAddress(String),

    #[error("unexpected HTTP response: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;
