//! Multi-tenant subscriber transport.
//!
//! The daemon dials the publisher endpoint and receives topic-framed
//! messages: two length-prefixed frames (u32-LE length + bytes), topic
//! first, payload second. Messages whose topic is not our application name
//! are dropped without surfacing to the poll loop. The publisher may come
//! and go; the subscriber redials opportunistically on each poll tick.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::time::Duration;

use super::resolve;
use super::ChannelError;
use super::ControlChannel;

/// Upper bound on a single frame; anything larger is a corrupt stream.
const MAX_FRAME_LEN: usize = 4096;

const FRAME_HEADER_LEN: usize = 4;

pub struct SubscriberChannel {
    endpoint: SocketAddr,
    app_name: String,
    conn: Option<TcpStream>,
    buf: Vec<u8>,
}

impl SubscriberChannel {
    /// Resolves the endpoint and attempts a first connection. A refused
    /// connection is not fatal: the publisher may simply not be up yet and
    /// the channel redials while polling.
    pub fn connect(endpoint: &str, app_name: &str) -> Result<Self, ChannelError> {
        let addr = resolve(endpoint)?;
        let mut channel = Self {
            endpoint: addr,
            app_name: app_name.to_string(),
            conn: None,
            buf: Vec::new(),
        };
        if !channel.try_connect(Duration::from_millis(100)) {
            tracing::warn!(%addr, "publisher not reachable yet, will keep dialing");
        }
        Ok(channel)
    }

    fn try_connect(&mut self, timeout: Duration) -> bool {
        match TcpStream::connect_timeout(&self.endpoint, timeout) {
            Ok(stream) => {
                tracing::info!(endpoint = %self.endpoint, "connected to control publisher");
                self.buf.clear();
                self.conn = Some(stream);
                true
            }
            Err(_) => false,
        }
    }

    fn drop_connection(&mut self) {
        self.conn = None;
        self.buf.clear();
    }

    /// Pops the next complete message addressed to us out of the buffer.
    /// Messages for other topics are consumed and discarded here.
    fn take_buffered(&mut self) -> Option<Vec<u8>> {
        loop {
            match parse_message(&self.buf) {
                Parse::Incomplete => return None,
                Parse::Corrupt => {
                    tracing::warn!("corrupt frame on control channel, resetting connection");
                    self.drop_connection();
                    return None;
                }
                Parse::Complete {
                    topic,
                    payload,
                    consumed,
                } => {
                    self.buf.drain(..consumed);
                    if topic == self.app_name.as_bytes() {
                        return Some(payload);
                    }
                    tracing::debug!(
                        topic = %String::from_utf8_lossy(&topic),
                        "dropping message addressed to another consumer"
                    );
                }
            }
        }
    }
}

impl ControlChannel for SubscriberChannel {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        // Serve anything already buffered first so each poll delivers at
        // most one message, in arrival order.
        if let Some(payload) = self.take_buffered() {
            return Ok(Some(payload));
        }

        if self.conn.is_none() && !self.try_connect(timeout) {
            // Bound the retry cadence so a missing publisher does not spin
            // the poll loop.
            std::thread::sleep(timeout);
            return Ok(None);
        }

        let conn = self.conn.as_mut().expect("connection present");
        conn.set_read_timeout(Some(timeout))?;

        let mut chunk = [0u8; 1024];
        match conn.read(&mut chunk) {
            Ok(0) => {
                tracing::info!("control publisher closed the connection");
                self.drop_connection();
                Ok(None)
            }
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(self.take_buffered())
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => {
                tracing::warn!("control channel read failed: {err}");
                self.drop_connection();
                Ok(None)
            }
        }
    }
}

enum Parse {
    Incomplete,
    Corrupt,
    Complete {
        topic: Vec<u8>,
        payload: Vec<u8>,
        consumed: usize,
    },
}

fn parse_message(buf: &[u8]) -> Parse {
    let (topic, after_topic) = match parse_frame(buf, 0) {
        FrameParse::Incomplete => return Parse::Incomplete,
        FrameParse::Corrupt => return Parse::Corrupt,
        FrameParse::Complete(frame, end) => (frame, end),
    };
    match parse_frame(buf, after_topic) {
        FrameParse::Incomplete => Parse::Incomplete,
        FrameParse::Corrupt => Parse::Corrupt,
        FrameParse::Complete(payload, end) => Parse::Complete {
            topic,
            payload,
            consumed: end,
        },
    }
}

enum FrameParse {
    Incomplete,
    Corrupt,
    Complete(Vec<u8>, usize),
}

fn parse_frame(buf: &[u8], offset: usize) -> FrameParse {
    if buf.len() < offset + FRAME_HEADER_LEN {
        return FrameParse::Incomplete;
    }
    let len = u32::from_le_bytes(
        buf[offset..offset + FRAME_HEADER_LEN]
            .try_into()
            .expect("4-byte slice"),
    ) as usize;
    if len > MAX_FRAME_LEN {
        return FrameParse::Corrupt;
    }
    let start = offset + FRAME_HEADER_LEN;
    if buf.len() < start + len {
        return FrameParse::Incomplete;
    }
    FrameParse::Complete(buf[start..start + len].to_vec(), start + len)
}

/// Publisher-side framing: one topic frame, one payload frame, one write.
pub(crate) fn write_message(
    stream: &mut TcpStream,
    topic: &[u8],
    payload: &[u8],
) -> io::Result<()> {
    let mut msg = Vec::with_capacity(2 * FRAME_HEADER_LEN + topic.len() + payload.len());
    msg.extend_from_slice(&(topic.len() as u32).to_le_bytes());
    msg.extend_from_slice(topic);
    msg.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    msg.extend_from_slice(payload);
    stream.write_all(&msg)?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;

    const POLL: Duration = Duration::from_millis(50);

    fn recv_until(
        channel: &mut SubscriberChannel,
        attempts: u32,
    ) -> Option<Vec<u8>> {
        for _ in 0..attempts {
            if let Some(payload) = channel.recv_timeout(POLL).unwrap() {
                return Some(payload);
            }
        }
        None
    }

    #[test_log::test]
    fn delivers_matching_topic() {
        let publisher = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = publisher.local_addr().unwrap().to_string();

        let mut channel = SubscriberChannel::connect(&endpoint, "app-a").unwrap();
        let (mut peer, _) = publisher.accept().unwrap();
        write_message(&mut peer, b"app-a", b"RESET_FREQ:0").unwrap();

        assert_eq!(recv_until(&mut channel, 20), Some(b"RESET_FREQ:0".to_vec()));
    }

    #[test_log::test]
    fn filters_foreign_topic() {
        let publisher = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = publisher.local_addr().unwrap().to_string();

        let mut channel = SubscriberChannel::connect(&endpoint, "app-a").unwrap();
        let (mut peer, _) = publisher.accept().unwrap();
        write_message(&mut peer, b"app-b", b"RESET_FREQ:0").unwrap();
        write_message(&mut peer, b"app-a", b"RESET_FREQ:1").unwrap();

        // The foreign message is silently skipped.
        assert_eq!(recv_until(&mut channel, 20), Some(b"RESET_FREQ:1".to_vec()));
    }

    #[test_log::test]
    fn one_message_per_poll_in_arrival_order() {
        let publisher = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = publisher.local_addr().unwrap().to_string();

        let mut channel = SubscriberChannel::connect(&endpoint, "app-a").unwrap();
        let (mut peer, _) = publisher.accept().unwrap();
        write_message(&mut peer, b"app-a", b"first").unwrap();
        write_message(&mut peer, b"app-a", b"second").unwrap();

        assert_eq!(recv_until(&mut channel, 20), Some(b"first".to_vec()));
        assert_eq!(recv_until(&mut channel, 20), Some(b"second".to_vec()));
        assert_eq!(channel.recv_timeout(POLL).unwrap(), None);
    }

    #[test_log::test]
    fn survives_publisher_restart() {
        let publisher = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = publisher.local_addr().unwrap().to_string();

        let mut channel = SubscriberChannel::connect(&endpoint, "app-a").unwrap();
        let (peer, _) = publisher.accept().unwrap();
        drop(peer);

        // Subscriber notices the close and redials the same listener.
        for _ in 0..20 {
            let _ = channel.recv_timeout(POLL).unwrap();
            if let Ok((mut peer, _)) = {
                publisher.set_nonblocking(true).unwrap();
                publisher.accept()
            } {
                write_message(&mut peer, b"app-a", b"back").unwrap();
                assert_eq!(recv_until(&mut channel, 20), Some(b"back".to_vec()));
                return;
            }
        }
        panic!("subscriber never redialed");
    }

    #[test]
    fn oversized_frame_is_corrupt() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        assert!(matches!(parse_frame(&buf, 0), FrameParse::Corrupt));
    }

    #[test]
    fn partial_frames_are_incomplete() {
        assert!(matches!(parse_frame(&[1, 0], 0), FrameParse::Incomplete));
        let mut buf = Vec::new();
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(b"ab");
        assert!(matches!(parse_frame(&buf, 0), FrameParse::Incomplete));
    }

    #[test]
    fn connect_without_publisher_is_not_fatal() {
        // Port 9 on localhost is almost certainly closed; connect must
        // still construct the channel.
        let channel = SubscriberChannel::connect("127.0.0.1:9", "app-a");
        assert!(channel.is_ok());
    }
}
