//! Byte-level MQTT connection used to observe exactly what the broker sends.
//!
//! [`RawMqttClient`] writes pre-encoded packets and compares incoming bytes
//! against an expected frame. Reads are buffered, so a frame split across TCP
//! segments still matches and bytes beyond a matched frame are kept for the
//! next expectation.

use crate::error::{HarnessError, MatchFailure, Result, WireDiff};
use bytes::{Buf, BytesMut};
use mqtt_wire::{frame_length, ProtocolVersion, PINGREQ, PINGRESP};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// A raw TCP connection to the broker under test.
#[derive(Debug)]
pub struct RawMqttClient {
    stream: Option<TcpStream>,
    buffer: BytesMut,
    peer: SocketAddr,
    protocol_version: ProtocolVersion,
}

impl RawMqttClient {
    /// Opens the TCP connection without sending anything.
    pub async fn connect_tcp(addr: SocketAddr, protocol_version: ProtocolVersion) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|err| {
            if err.kind() == ErrorKind::ConnectionRefused {
                HarnessError::ConnectionRefused { addr, attempts: 1 }
            } else {
                HarnessError::ConnectionIo { source: err }
            }
        })?;
        stream
            .set_nodelay(true)
            .map_err(|source| HarnessError::ConnectionIo { source })?;
        debug!(%addr, "tcp connected");
        Ok(Self {
            stream: Some(stream),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            peer: addr,
            protocol_version,
        })
    }

    /// Connects, sends `connect` and requires the broker to answer with
    /// exactly `expected_connack` within `timeout`.
    pub async fn connect(
        addr: SocketAddr,
        protocol_version: ProtocolVersion,
        connect: &[u8],
        expected_connack: &[u8],
        timeout: Duration,
    ) -> Result<Self> {
        let mut client = Self::connect_tcp(addr, protocol_version).await?;
        client.send_raw(connect).await?;
        match client.match_bytes(expected_connack, timeout).await? {
            Ok(()) => {
                debug!(%addr, "handshake complete");
                Ok(client)
            }
            Err(MatchFailure::TimedOut) => Err(HarnessError::HandshakeTimeout {
                timeout,
                diff: client.diff(expected_connack),
            }),
            Err(reason) => Err(HarnessError::HandshakeMismatch {
                reason,
                diff: client.diff(expected_connack),
            }),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Bytes received but not yet consumed by an expectation.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| HarnessError::ConnectionIo {
            source: std::io::Error::new(ErrorKind::NotConnected, "connection already closed"),
        })?;
        stream
            .write_all(data)
            .await
            .map_err(|source| HarnessError::ConnectionIo { source })?;
        trace!(bytes = data.len(), "sent");
        Ok(())
    }

    /// Requires the next bytes on the connection to be exactly `expected`.
    /// `label` names the awaited message in the resulting error.
    pub async fn expect(&mut self, expected: &[u8], timeout: Duration, label: &str) -> Result<()> {
        match self.match_bytes(expected, timeout).await? {
            Ok(()) => {
                debug!(label, "expected message received");
                Ok(())
            }
            Err(reason) => Err(HarnessError::UnexpectedMessage {
                label: label.to_owned(),
                reason,
                diff: self.diff(expected),
            }),
        }
    }

    /// Sends PINGREQ and requires PINGRESP.
    pub async fn ping(&mut self, timeout: Duration) -> Result<()> {
        self.send_raw(&PINGREQ).await?;
        self.expect(&PINGRESP, timeout, "pingresp").await
    }

    /// Shuts the connection down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(peer = %self.peer, "connection closed");
        }
    }

    /// Reads until `expected` is fully buffered, a byte diverges, the peer
    /// closes or `timeout` elapses. Matched bytes are consumed; on failure the
    /// buffer is left intact for the diff.
    async fn match_bytes(
        &mut self,
        expected: &[u8],
        timeout: Duration,
    ) -> Result<std::result::Result<(), MatchFailure>> {
        let deadline = Instant::now() + timeout;
        loop {
            let compared = self.buffer.len().min(expected.len());
            if self.buffer[..compared] != expected[..compared] {
                return Ok(Err(MatchFailure::Mismatch));
            }
            if compared == expected.len() {
                self.buffer.advance(expected.len());
                return Ok(Ok(()));
            }

            let Some(stream) = self.stream.as_mut() else {
                return Ok(Err(MatchFailure::Closed));
            };
            self.buffer.reserve(READ_CHUNK);
            match tokio::time::timeout_at(deadline, stream.read_buf(&mut self.buffer)).await {
                Err(_) => return Ok(Err(MatchFailure::TimedOut)),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Ok(Err(MatchFailure::Closed));
                }
                Ok(Ok(n)) => trace!(bytes = n, buffered = self.buffer.len(), "received"),
                Ok(Err(err))
                    if matches!(
                        err.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                    ) =>
                {
                    self.stream = None;
                    return Ok(Err(MatchFailure::Closed));
                }
                Ok(Err(source)) => return Err(HarnessError::ConnectionIo { source }),
            }
        }
    }

    /// Expected bytes against what was received: the first buffered frame
    /// when one is complete, everything buffered otherwise.
    fn diff(&self, expected: &[u8]) -> Box<WireDiff> {
        let received = match frame_length(&self.buffer) {
            Ok(Some(len)) if len <= self.buffer.len() => &self.buffer[..len],
            _ => &self.buffer[..],
        };
        Box::new(WireDiff {
            expected: expected.to_vec(),
            received: received.to_vec(),
            protocol_version: self.protocol_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_wire::{ConnAckPacket, ConnectPacket};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const NOTIFICATION: &[u8] = &[
        0x30, 0x1B, 0x00, 0x0C, b't', b'o', b'p', b'i', b'c', b'/', b'r', b'e', b'l', b'o', b'a',
        b'd', 0x00, b't', b'e', b's', b't', b'-', b'm', b'e', b's', b's', b'a', b'g', b'e',
    ];

    async fn pair() -> (RawMqttClient, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            RawMqttClient::connect_tcp(addr, ProtocolVersion::V5),
            listener.accept()
        );
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_expect_exact_frame() {
        let (mut client, mut server) = pair().await;
        server.write_all(NOTIFICATION).await.unwrap();
        client
            .expect(NOTIFICATION, Duration::from_secs(2), "publish")
            .await
            .unwrap();
        assert!(client.pending().is_empty());
    }

    #[tokio::test]
    async fn test_expect_reassembles_split_frame() {
        let (mut client, mut server) = pair().await;
        tokio::spawn(async move {
            for chunk in NOTIFICATION.chunks(5) {
                server.write_all(chunk).await.unwrap();
                server.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        client
            .expect(NOTIFICATION, Duration::from_secs(2), "publish")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_flipped_byte_is_mismatch() {
        let (mut client, mut server) = pair().await;
        let mut corrupted = NOTIFICATION.to_vec();
        corrupted[20] ^= 0x01;
        server.write_all(&corrupted).await.unwrap();

        let err = client
            .expect(NOTIFICATION, Duration::from_secs(2), "publish")
            .await
            .unwrap_err();
        match err {
            HarnessError::UnexpectedMessage {
                label,
                reason,
                diff,
            } => {
                assert_eq!(label, "publish");
                assert_eq!(reason, MatchFailure::Mismatch);
                assert_eq!(diff.first_difference(), Some(20));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_packet_type_fails_before_deadline() {
        let (mut client, mut server) = pair().await;
        server.write_all(&PINGRESP).await.unwrap();
        let started = Instant::now();
        let err = client
            .expect(NOTIFICATION, Duration::from_secs(10), "publish")
            .await
            .unwrap_err();
        assert!(!err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.to_string().contains("PINGRESP"));
    }

    #[tokio::test]
    async fn test_silence_times_out() {
        let (mut client, _server) = pair().await;
        let err = client
            .expect(NOTIFICATION, Duration::from_millis(100), "publish")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_truncated_frame_times_out_with_partial_bytes() {
        let (mut client, mut server) = pair().await;
        server.write_all(&NOTIFICATION[..10]).await.unwrap();
        let err = client
            .expect(NOTIFICATION, Duration::from_millis(150), "publish")
            .await
            .unwrap_err();
        match err {
            HarnessError::UnexpectedMessage { reason, diff, .. } => {
                assert_eq!(reason, MatchFailure::TimedOut);
                assert_eq!(diff.received, &NOTIFICATION[..10]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (mut client, server) = pair().await;
        drop(server);
        let err = client
            .expect(NOTIFICATION, Duration::from_secs(2), "publish")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::UnexpectedMessage {
                reason: MatchFailure::Closed,
                ..
            }
        ));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_leftover_bytes_feed_next_expectation() {
        let (mut client, mut server) = pair().await;
        let mut both = NOTIFICATION.to_vec();
        both.extend_from_slice(&PINGRESP);
        server.write_all(&both).await.unwrap();

        client
            .expect(NOTIFICATION, Duration::from_secs(2), "publish")
            .await
            .unwrap();
        client
            .expect(&PINGRESP, Duration::from_secs(2), "pingresp")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_notification_fails_ping() {
        let (mut client, mut server) = pair().await;
        let responder = tokio::spawn(async move {
            server.write_all(NOTIFICATION).await.unwrap();
            server.write_all(NOTIFICATION).await.unwrap();
            let mut req = [0u8; 2];
            server.read_exact(&mut req).await.unwrap();
            assert_eq!(req, PINGREQ);
            server.write_all(&PINGRESP).await.unwrap();
            server
        });

        client
            .expect(NOTIFICATION, Duration::from_secs(2), "publish")
            .await
            .unwrap();
        let err = client.ping(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("pingresp"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_against_scripted_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = ConnectPacket::new("plugin-reload-test", ProtocolVersion::V5)
            .with_keep_alive(10)
            .with_clean_start(false)
            .encode()
            .unwrap();
        let connack = ConnAckPacket::new(0, ProtocolVersion::V5).encode().unwrap();

        let expected_connect = connect.clone();
        let reply = connack.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; expected_connect.len()];
            socket.read_exact(&mut received).await.unwrap();
            assert_eq!(received, expected_connect);
            socket.write_all(&reply).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut client = RawMqttClient::connect(
            addr,
            ProtocolVersion::V5,
            &connect,
            &connack,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        client.close().await;
        client.close().await;
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_handshake_silence_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keep = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(socket);
        });
        let err = RawMqttClient::connect(
            addr,
            ProtocolVersion::V5,
            &[0x10, 0x00],
            &[0x20, 0x02, 0x00, 0x00],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::HandshakeTimeout { .. }));
        keep.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = RawMqttClient::connect_tcp(addr, ProtocolVersion::V5)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ConnectionRefused { .. }));
    }
}
