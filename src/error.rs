use crate::types::AmsNetId;
use thiserror::Error;

/// Errors produced by the ADS router and its wire machinery.
///
/// Device-side failures surface as [`AdsError::Ads`] carrying the 32-bit ADS
/// result code unmodified; everything else is a local error.
#[derive(Debug, Error)]
pub enum AdsError {
    /// The given local port is not currently open on this router.
    #[error("local AMS port {0} is not open")]
    InvalidPort(u16),

    /// All local AMS ports are in use.
    #[error("no free local AMS port")]
    PortExhausted,

    /// No route maps the destination NetId to an IP address.
    #[error("no route to {0}")]
    NoRoute(AmsNetId),

    /// A caller-supplied argument was rejected before anything hit the wire.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The TCP connection carrying this request is gone.
    #[error("transport closed")]
    TransportClosed,

    /// No response arrived within the port's request timeout.
    #[error("request timed out after {0} ms")]
    Timeout(u32),

    /// The request was cancelled locally, e.g. by closing its port.
    #[error("request aborted")]
    Aborted,

    /// The device answered with a non-zero ADS result code.
    #[error("device returned ADS error 0x{0:x}")]
    Ads(u32),

    /// The peer sent bytes that do not parse as AMS/AoE.
    #[error("malformed frame: {0}")]
    Decode(&'static str),

    /// Socket-level failure while connecting or writing.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AdsError>;
