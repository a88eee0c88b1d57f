//! Single-tenant request/reply transport.
//!
//! The daemon binds a listener and serves one client at a time. Each
//! request is one 12-byte command record; the fixed acknowledgement is
//! written back as soon as the record is read, before any validation, so a
//! received ack only means "delivered", not "applied". That is a documented
//! protocol limitation, not something this layer may fix on its own.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::time::Duration;

use control_wire::RECORD_LEN;

use super::ChannelError;
use super::ControlChannel;

/// Fixed acknowledgement sent for every received record.
pub const ACK_PAYLOAD: &[u8] = b"success";

pub struct ReplyChannel {
    listener: TcpListener,
    local: SocketAddr,
    peer: Option<TcpStream>,
    pending: Vec<u8>,
}

impl ReplyChannel {
    /// Binds the endpoint. Unlike the subscriber, a bind failure here is
    /// fatal: the daemon cannot be addressed at all without it.
    pub fn bind(endpoint: &str) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(endpoint).map_err(|source| ChannelError::Bind {
            endpoint: endpoint.to_string(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        tracing::info!(%local, "control reply channel listening");

        Ok(Self {
            listener,
            local,
            peer: None,
            pending: Vec::new(),
        })
    }

    fn try_accept(&mut self) -> Result<bool, ChannelError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                // Accepted sockets do not inherit the listener's
                // non-blocking mode on every platform.
                stream.set_nonblocking(false)?;
                tracing::debug!(%peer_addr, "control client connected");
                self.pending.clear();
                self.peer = Some(stream);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(ChannelError::Io(err)),
        }
    }

    fn drop_peer(&mut self) {
        self.peer = None;
        self.pending.clear();
    }
}

impl ControlChannel for ReplyChannel {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        if self.peer.is_none() {
            if !self.try_accept()? {
                std::thread::sleep(timeout);
                if !self.try_accept()? {
                    return Ok(None);
                }
            }
        }

        let peer = self.peer.as_mut().expect("peer present");
        peer.set_read_timeout(Some(timeout))?;

        let need = RECORD_LEN - self.pending.len();
        let mut chunk = [0u8; RECORD_LEN];
        match peer.read(&mut chunk[..need]) {
            Ok(0) => {
                tracing::debug!("control client disconnected");
                self.drop_peer();
                Ok(None)
            }
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                if self.pending.len() < RECORD_LEN {
                    return Ok(None);
                }
                let record = std::mem::take(&mut self.pending);
                if let Err(err) = peer.write_all(ACK_PAYLOAD) {
                    tracing::warn!("failed to acknowledge control client: {err}");
                    self.drop_peer();
                }
                Ok(Some(record))
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => {
                tracing::warn!("control client read failed: {err}");
                self.drop_peer();
                Ok(None)
            }
        }
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        Some(self.local)
    }
}
