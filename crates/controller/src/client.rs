//! Client side of the control channel.
//!
//! In subscribe mode the client plays publisher: it binds the endpoint,
//! waits for the daemon's subscriber to dial in, and pushes one
//! topic-framed text payload. In reply mode it dials the daemon's
//! listener, sends one binary record, and waits for the fixed
//! acknowledgement.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::time::Duration;
use std::time::Instant;

use control_wire::Command;
use thiserror::Error;

use crate::channel::resolve;
use crate::channel::write_message;
use crate::channel::ChannelError;
use crate::channel::ChannelMode;
use crate::channel::ACK_PAYLOAD;

/// How long the client waits for the other side before giving up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("control I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("no subscriber connected within {HANDSHAKE_TIMEOUT:?}")]
    NoSubscriber,

    #[error("daemon replied {0:?} instead of an acknowledgement")]
    BadAck(Vec<u8>),

    #[error("the binary record carries one mask word, high word {0:08x} cannot travel")]
    MaskNotPortable(u32),
}

/// Sends one command using the deployment's addressing mode.
pub fn send_command(
    mode: ChannelMode,
    endpoint: &str,
    app_name: &str,
    command: &Command,
) -> Result<(), ClientError> {
    match mode {
        ChannelMode::Subscribe => publish(endpoint, app_name, command),
        ChannelMode::Reply => request(endpoint, command),
    }
}

fn publish(endpoint: &str, app_name: &str, command: &Command) -> Result<(), ClientError> {
    let payload = ChannelMode::Subscribe.wire_format().encode(command);

    let listener = TcpListener::bind(endpoint).map_err(|source| ChannelError::Bind {
        endpoint: endpoint.to_string(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    tracing::info!(endpoint = %listener.local_addr()?, "waiting for the daemon subscriber");

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut subscriber = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(ClientError::NoSubscriber);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    };
    subscriber.set_nonblocking(false)?;

    write_message(&mut subscriber, app_name.as_bytes(), &payload)?;
    tracing::info!(%command, topic = app_name, "published control command");
    Ok(())
}

fn request(endpoint: &str, command: &Command) -> Result<(), ClientError> {
    // The record format only carries the low mask word; refuse to send a
    // mask that would silently lose its high bits.
    if let Command::SetCuMask { word1, .. } = *command {
        if word1 != 0 {
            return Err(ClientError::MaskNotPortable(word1));
        }
    }
    let payload = ChannelMode::Reply.wire_format().encode(command);

    let addr = resolve(endpoint)?;
    let mut stream = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.write_all(&payload)?;

    let mut ack = [0u8; ACK_PAYLOAD.len()];
    stream.read_exact(&mut ack)?;
    if ack != ACK_PAYLOAD {
        return Err(ClientError::BadAck(ack.to_vec()));
    }
    tracing::info!(%command, "command delivered and acknowledged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::channel::ControlChannel;
    use crate::channel::ReplyChannel;
    use crate::channel::SubscriberChannel;

    use super::*;

    #[test_log::test]
    fn publish_reaches_a_subscriber() {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = probe.local_addr().unwrap().to_string();
        drop(probe);

        let command = Command::ResetPowerCap { gpu_index: 0 };
        let publisher = std::thread::spawn({
            let endpoint = endpoint.clone();
            move || publish(&endpoint, "app-a", &command)
        });

        let mut channel = SubscriberChannel::connect(&endpoint, "app-a").unwrap();
        let mut received = None;
        for _ in 0..100 {
            if let Some(payload) = channel.recv_timeout(Duration::from_millis(50)).unwrap() {
                received = Some(payload);
                break;
            }
        }

        publisher.join().unwrap().unwrap();
        assert_eq!(received, Some(b"RESET_FREQ:0".to_vec()));
    }

    #[test_log::test]
    fn publish_without_subscriber_times_out() {
        // Rides the full handshake timeout; nobody dials the endpoint.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = Instant::now();
        let result = publish(&endpoint, "app-a", &Command::NoOp);
        assert!(matches!(result, Err(ClientError::NoSubscriber)));
        assert!(started.elapsed() >= HANDSHAKE_TIMEOUT);
    }

    #[test_log::test]
    fn request_round_trips_through_a_reply_channel() {
        let mut channel = ReplyChannel::bind("127.0.0.1:0").unwrap();
        let endpoint = channel.local_endpoint().unwrap().to_string();

        let requester = std::thread::spawn(move || {
            request(
                &endpoint,
                &Command::SetPowerCap {
                    gpu_index: 0,
                    watts: 150,
                },
            )
        });

        let mut record = None;
        for _ in 0..100 {
            if let Some(payload) = channel.recv_timeout(Duration::from_millis(50)).unwrap() {
                record = Some(payload);
                break;
            }
        }

        requester.join().unwrap().unwrap();
        assert_eq!(
            record.map(|payload| ChannelMode::Reply.wire_format().decode(&payload)),
            Some(Ok(Command::SetPowerCap {
                gpu_index: 0,
                watts: 150,
            }))
        );
    }

    #[test]
    fn request_refuses_two_word_masks() {
        let result = request(
            "127.0.0.1:9",
            &Command::SetCuMask {
                gpu_index: 0,
                word0: 0xffff_ffff,
                word1: 0x0fff_ffff,
            },
        );
        assert!(matches!(
            result,
            Err(ClientError::MaskNotPortable(0x0fff_ffff))
        ));
    }

    #[test]
    fn request_without_daemon_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(matches!(
            request(&endpoint, &Command::NoOp),
            Err(ClientError::Io(_))
        ));
    }
}
