//! Push-notification channel for new-block announcements
//!
//! Speaks the minimal subset of the ZMTP 3.x pub/sub wire protocol needed to
//! subscribe to a node's block feed over a raw TCP connection: the split
//! greeting, the NULL-mechanism READY exchange, and length-prefixed frame
//! assembly across arbitrary partial reads. The payload of a notification is
//! never interpreted beyond "non-empty"; every notification means only that
//! a new block may exist.

use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, trace};

/// 10-byte protocol signature exchanged first
const SIGNATURE: [u8; 10] = [0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0x7f];

/// Remainder of the greeting: version, mechanism, as-server, filler
const GREETING_REMAINDER_LEN: usize = 54;

/// Frames above this declared length are a protocol violation
const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

/// Subscription opcodes sent as message payloads on a SUB socket
const SUBSCRIBE: u8 = 0x01;
const UNSUBSCRIBE: u8 = 0x00;

/// Push-channel handshake state
///
/// Linear progression on success; any error at any state returns to
/// `NotConnected` after a best-effort shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotConnected,
    Greeting1,
    Greeting2,
    Handshake,
    Connected,
    Disconnecting,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::NotConnected => write!(f, "not connected"),
            ChannelState::Greeting1 => write!(f, "greeting 1"),
            ChannelState::Greeting2 => write!(f, "greeting 2"),
            ChannelState::Handshake => write!(f, "handshake"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// One wire frame: flags byte plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Command frames carry protocol metadata, not messages
    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }

    /// More parts of the same multipart message follow
    pub fn has_more(&self) -> bool {
        self.flags & FLAG_MORE != 0
    }
}

/// Assembles length-prefixed frames from arbitrary-sized reads.
///
/// A frame is only produced once its full declared length has arrived;
/// leftover bytes stay buffered for the next frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer bytes received from the transport
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(None)` while the buffered bytes are still a partial
    /// frame. Length prefix is short form (1 byte) or long form (8 bytes
    /// big-endian) depending on the flags byte.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let flags = self.buf[0];
        if flags & !(FLAG_MORE | FLAG_LONG | FLAG_COMMAND) != 0 {
            return Err(Error::handshake(format!("invalid frame flags {flags:#04x}")));
        }

        let (header_len, payload_len) = if flags & FLAG_LONG != 0 {
            if self.buf.len() < 9 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&self.buf[1..9]);
            (9usize, u64::from_be_bytes(len_bytes))
        } else {
            if self.buf.len() < 2 {
                return Ok(None);
            }
            (2usize, u64::from(self.buf[1]))
        };

        if payload_len > MAX_FRAME_LEN {
            return Err(Error::handshake(format!(
                "frame length {payload_len} exceeds limit"
            )));
        }

        let total = header_len + payload_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(header_len);
        let payload = self.buf.split_to(payload_len as usize).to_vec();
        Ok(Some(Frame { flags, payload }))
    }
}

/// Subscription channel to a node's block-notification publisher.
///
/// Generic over the stream so the handshake and frame assembly can be
/// exercised against scripted in-memory peers.
pub struct NotifyChannel<S> {
    stream: S,
    state: ChannelState,
    decoder: FrameDecoder,
}

impl NotifyChannel<TcpStream> {
    /// Resolve `host`, open the TCP connection, and complete the handshake.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let mut addrs = lookup_host((host, port))
            .await
            .map_err(|e| Error::resolution(format!("{host}: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::resolution(format!("{host}: no addresses returned")))?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::connection(format!("{addr}: {e}")))?;
        debug!("notification channel connected to {addr}");

        let mut channel = Self::new(stream);
        channel.handshake().await?;
        Ok(channel)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> NotifyChannel<S> {
    /// Wrap an established stream; the handshake has not run yet.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ChannelState::NotConnected,
            decoder: FrameDecoder::new(),
        }
    }

    /// Current handshake state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Run the full handshake and subscribe to all topics.
    ///
    /// Each step is gated on the peer's expected reply; any malformed byte
    /// sequence or read error aborts and resets the state to
    /// `NotConnected`, leaving the caller to drop the channel and retry.
    pub async fn handshake(&mut self) -> Result<()> {
        match self.handshake_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = ChannelState::NotConnected;
                Err(e)
            }
        }
    }

    async fn handshake_inner(&mut self) -> Result<()> {
        self.state = ChannelState::Greeting1;
        self.write_all(&SIGNATURE).await?;
        let mut signature = [0u8; SIGNATURE.len()];
        self.read_exact(&mut signature).await?;
        if signature[0] != 0xff || signature[9] != 0x7f {
            return Err(Error::handshake(format!(
                "unexpected signature {signature:02x?}"
            )));
        }

        self.state = ChannelState::Greeting2;
        self.write_all(&greeting_remainder()).await?;
        let mut remainder = [0u8; GREETING_REMAINDER_LEN];
        self.read_exact(&mut remainder).await?;
        if remainder[0] < 3 {
            return Err(Error::handshake(format!(
                "unsupported protocol version {}.{}",
                remainder[0], remainder[1]
            )));
        }
        if &remainder[2..6] != b"NULL" || remainder[6..22].iter().any(|b| *b != 0) {
            return Err(Error::handshake("unsupported security mechanism"));
        }

        self.state = ChannelState::Handshake;
        self.write_all(&ready_command()).await?;
        let frame = loop {
            if let Some(frame) = self.decoder.next_frame()? {
                if !frame.is_command() {
                    return Err(Error::handshake("message frame before READY"));
                }
                break frame;
            }
            self.fill_decoder().await?;
        };
        if !frame.payload.starts_with(b"\x05READY") {
            return Err(Error::handshake("peer sent a command other than READY"));
        }

        self.state = ChannelState::Connected;
        debug!("notification channel handshake complete, subscribing");
        self.send_message(&[SUBSCRIBE]).await
    }

    /// Wait for the next notification.
    ///
    /// Consumes complete (possibly multipart) messages from the peer and
    /// returns once one carries any non-empty payload. Command frames
    /// between messages are ignored.
    pub async fn next_notification(&mut self) -> Result<()> {
        loop {
            let first = self.next_frame_blocking().await?;
            if first.is_command() {
                trace!("ignoring command frame ({} bytes)", first.payload.len());
                continue;
            }

            let mut interesting = !first.payload.is_empty();
            let mut more = first.has_more();
            while more {
                let part = self.next_frame_blocking().await?;
                if part.is_command() {
                    return Err(Error::handshake("command frame inside multipart message"));
                }
                interesting |= !part.payload.is_empty();
                more = part.has_more();
            }

            if interesting {
                return Ok(());
            }
        }
    }

    /// Close the channel, freeing the socket.
    ///
    /// The graceful path best-effort unsubscribes and shuts the stream down
    /// first; it is safe to call from an error path mid-handshake, where it
    /// degrades to a plain drop.
    pub async fn close(mut self, graceful: bool) {
        if graceful && self.state == ChannelState::Connected {
            self.state = ChannelState::Disconnecting;
            let _ = self.send_message(&[UNSUBSCRIBE]).await;
            let _ = self.stream.shutdown().await;
        }
        self.state = ChannelState::NotConnected;
    }

    async fn next_frame_blocking(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            self.fill_decoder().await?;
        }
    }

    async fn fill_decoder(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::connection(e.to_string()))?;
        if n == 0 {
            return Err(Error::connection("notification channel closed by peer"));
        }
        self.decoder.extend(&chunk[..n]);
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|e| Error::connection(e.to_string()))
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| Error::connection(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::connection(e.to_string()))
    }

    async fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() < 256);
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.push(0x00);
        frame.push(payload.len() as u8);
        frame.extend_from_slice(payload);
        self.write_all(&frame).await
    }
}

/// Greeting bytes after the signature: version 3.0, NULL mechanism,
/// as-server flag, filler.
fn greeting_remainder() -> [u8; GREETING_REMAINDER_LEN] {
    let mut greeting = [0u8; GREETING_REMAINDER_LEN];
    greeting[0] = 3;
    greeting[2..6].copy_from_slice(b"NULL");
    greeting
}

/// READY command announcing socket type SUB with an empty identity.
fn ready_command() -> Vec<u8> {
    let mut body = Vec::new();
    body.push(5);
    body.extend_from_slice(b"READY");
    body.push(11);
    body.extend_from_slice(b"Socket-Type");
    body.extend_from_slice(&3u32.to_be_bytes());
    body.extend_from_slice(b"SUB");
    body.push(8);
    body.extend_from_slice(b"Identity");
    body.extend_from_slice(&0u32.to_be_bytes());

    let mut frame = Vec::with_capacity(2 + body.len());
    frame.push(FLAG_COMMAND);
    frame.push(body.len() as u8);
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio_test::io::Builder;

    fn peer_ready() -> Vec<u8> {
        // Any READY is acceptable regardless of the peer's metadata
        let body = b"\x05READY\x0bSocket-Type\x00\x00\x00\x03PUB";
        let mut frame = vec![FLAG_COMMAND, body.len() as u8];
        frame.extend_from_slice(body);
        frame
    }

    fn peer_greeting_remainder() -> [u8; GREETING_REMAINDER_LEN] {
        greeting_remainder()
    }

    #[test]
    fn test_decoder_short_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x00, 0x03, 0xaa, 0xbb, 0xcc]);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(!frame.is_command());
        assert!(!frame.has_more());
        assert_eq!(frame.payload, vec![0xaa, 0xbb, 0xcc]);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_decoder_long_frame() {
        let payload = vec![0x5au8; 300];
        let mut wire = vec![FLAG_LONG];
        wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        wire.extend_from_slice(&payload);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_decoder_withholds_partial_frame() {
        let mut decoder = FrameDecoder::new();

        decoder.extend(&[0x00]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&[0x04, 0x01, 0x02]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&[0x03, 0x04]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decoder_keeps_leftover_for_next_frame() {
        let mut decoder = FrameDecoder::new();
        // One complete frame plus the start of a second
        decoder.extend(&[0x00, 0x01, 0xaa, 0x00, 0x02, 0xbb]);

        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, vec![0xaa]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&[0xcc]);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().payload,
            vec![0xbb, 0xcc]
        );
    }

    #[test]
    fn test_decoder_rejects_invalid_flags() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xf0, 0x00]);
        assert_matches!(decoder.next_frame(), Err(Error::Handshake { .. }));
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new();
        let mut wire = vec![FLAG_LONG];
        wire.extend_from_slice(&u64::MAX.to_be_bytes());
        decoder.extend(&wire);
        assert_matches!(decoder.next_frame(), Err(Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_handshake_completes() {
        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&peer_greeting_remainder())
            .write(&ready_command())
            .read(&peer_ready())
            .write(&[0x00, 0x01, SUBSCRIBE])
            .build();

        let mut channel = NotifyChannel::new(stream);
        channel.handshake().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_tolerates_partial_reads() {
        let ready = peer_ready();
        let remainder = peer_greeting_remainder();
        let stream = Builder::new()
            .write(&SIGNATURE)
            // Signature dribbles in byte by byte
            .read(&SIGNATURE[..1])
            .read(&SIGNATURE[1..4])
            .read(&SIGNATURE[4..])
            .write(&greeting_remainder())
            .read(&remainder[..20])
            .read(&remainder[20..])
            .write(&ready_command())
            // READY split mid-payload
            .read(&ready[..5])
            .read(&ready[5..])
            .write(&[0x00, 0x01, SUBSCRIBE])
            .build();

        let mut channel = NotifyChannel::new(stream);
        channel.handshake().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_signature() {
        let mut bad = SIGNATURE;
        bad[0] = 0x00;
        let stream = Builder::new().write(&SIGNATURE).read(&bad).build();

        let mut channel = NotifyChannel::new(stream);
        assert_matches!(channel.handshake().await, Err(Error::Handshake { .. }));
        assert_eq!(channel.state(), ChannelState::NotConnected);
    }

    #[tokio::test]
    async fn test_handshake_rejects_corrupted_greeting2() {
        let mut corrupted = peer_greeting_remainder();
        corrupted[2..7].copy_from_slice(b"PLAIN");
        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&corrupted)
            .build();

        let mut channel = NotifyChannel::new(stream);
        assert_matches!(channel.handshake().await, Err(Error::Handshake { .. }));
        assert_eq!(channel.state(), ChannelState::NotConnected);
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_ready_command() {
        let error_cmd = {
            let body = b"\x05ERROR\x00some failure";
            let mut frame = vec![FLAG_COMMAND, body.len() as u8];
            frame.extend_from_slice(body);
            frame
        };
        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&peer_greeting_remainder())
            .write(&ready_command())
            .read(&error_cmd)
            .build();

        let mut channel = NotifyChannel::new(stream);
        assert_matches!(channel.handshake().await, Err(Error::Handshake { .. }));
        assert_eq!(channel.state(), ChannelState::NotConnected);
    }

    #[tokio::test]
    async fn test_notification_waits_for_full_frame() {
        let ready = peer_ready();
        // Multipart notification: topic frame, then a 32-byte body that
        // arrives in two chunks
        let body = [0x07u8; 32];
        let mut notification = vec![FLAG_MORE, 0x09];
        notification.extend_from_slice(b"hashblock");
        notification.extend_from_slice(&[0x00, 0x20]);
        notification.extend_from_slice(&body);

        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&peer_greeting_remainder())
            .write(&ready_command())
            .read(&ready)
            .write(&[0x00, 0x01, SUBSCRIBE])
            .read(&notification[..15])
            .read(&notification[15..])
            .build();

        let mut channel = NotifyChannel::new(stream);
        channel.handshake().await.unwrap();
        channel.next_notification().await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_skips_empty_messages_and_commands() {
        let ready = peer_ready();
        let ping = {
            let body = b"\x04PING";
            let mut frame = vec![FLAG_COMMAND, body.len() as u8];
            frame.extend_from_slice(body);
            frame
        };
        let mut wire = Vec::new();
        wire.extend_from_slice(&ping);
        // Empty single-frame message: not a notification
        wire.extend_from_slice(&[0x00, 0x00]);
        // Real notification
        wire.extend_from_slice(&[0x00, 0x05]);
        wire.extend_from_slice(b"block");

        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&peer_greeting_remainder())
            .write(&ready_command())
            .read(&ready)
            .write(&[0x00, 0x01, SUBSCRIBE])
            .read(&wire)
            .build();

        let mut channel = NotifyChannel::new(stream);
        channel.handshake().await.unwrap();
        channel.next_notification().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_error() {
        let ready = peer_ready();
        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&peer_greeting_remainder())
            .write(&ready_command())
            .read(&ready)
            .write(&[0x00, 0x01, SUBSCRIBE])
            .build();

        let mut channel = NotifyChannel::new(stream);
        channel.handshake().await.unwrap();
        assert_matches!(
            channel.next_notification().await,
            Err(Error::Connection { .. })
        );
    }

    #[tokio::test]
    async fn test_graceful_close_unsubscribes() {
        let ready = peer_ready();
        let stream = Builder::new()
            .write(&SIGNATURE)
            .read(&SIGNATURE)
            .write(&greeting_remainder())
            .read(&peer_greeting_remainder())
            .write(&ready_command())
            .read(&ready)
            .write(&[0x00, 0x01, SUBSCRIBE])
            .write(&[0x00, 0x01, UNSUBSCRIBE])
            .build();

        let mut channel = NotifyChannel::new(stream);
        channel.handshake().await.unwrap();
        channel.close(true).await;
    }
}
