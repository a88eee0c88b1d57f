//! Control channel transports.
//!
//! One trait, two deployments: a subscriber that filters topic-framed
//! messages from a publisher endpoint (multi-tenant), and a reply listener
//! that acknowledges fixed binary records (single-tenant). The addressing
//! mode is chosen once per deployment and also fixes the payload format.

mod reply;
mod subscribe;

use std::io;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::time::Duration;

use clap::ValueEnum;
use control_wire::WireFormat;
use thiserror::Error;

pub use reply::ReplyChannel;
pub use reply::ACK_PAYLOAD;
pub use subscribe::SubscriberChannel;
pub(crate) use subscribe::write_message;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid control endpoint `{0}`")]
    BadEndpoint(String),

    #[error("failed to bind control endpoint `{endpoint}`: {source}")]
    Bind {
        endpoint: String,
        source: io::Error,
    },

    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Deployment addressing mode. Fixes both the transport and the payload
/// shape; daemon and client must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChannelMode {
    /// Multi-tenant publish/subscribe with topic filtering and text
    /// payloads.
    Subscribe,
    /// Single-tenant request/reply with binary record payloads.
    Reply,
}

impl ChannelMode {
    pub fn wire_format(&self) -> WireFormat {
        match self {
            ChannelMode::Subscribe => WireFormat::Text,
            ChannelMode::Reply => WireFormat::Record,
        }
    }

    /// Opens the daemon-side endpoint for this mode.
    pub fn open(
        &self,
        endpoint: &str,
        app_name: &str,
    ) -> Result<Box<dyn ControlChannel>, ChannelError> {
        match self {
            ChannelMode::Subscribe => Ok(Box::new(SubscriberChannel::connect(endpoint, app_name)?)),
            ChannelMode::Reply => Ok(Box::new(ReplyChannel::bind(endpoint)?)),
        }
    }
}

/// Daemon-side receive handle. One message per call, bounded wait, never
/// blocks indefinitely.
pub trait ControlChannel: Send {
    /// Waits up to `timeout` for one addressed payload. `Ok(None)` covers
    /// both "no traffic" and "message addressed to someone else".
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError>;

    /// Bound address, for channels that listen.
    fn local_endpoint(&self) -> Option<SocketAddr> {
        None
    }
}

pub(crate) fn resolve(endpoint: &str) -> Result<SocketAddr, ChannelError> {
    endpoint
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ChannelError::BadEndpoint(endpoint.to_string()))
}
