// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `PeerIO`: owns the downstream transport, runs the hello handshake, sends
//! commands with sequence numbers, and dispatches incoming frames to the
//! registered callback (C4, §4.4).

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    KNOWN_API_PROTOCOL_VERSIONS, PICARD_HELLO_INTERVAL_SECS,
    downstream::{self, Control, DownstreamEvent, FrameHeader},
    downstream_type,
    hdlc::{self, Decoder as HdlcDecoder},
    mux::MuxMessage,
};

use super::transport::{Transport, TransportKind};

/// Callback capability injected into `PeerIO` at construction, broken out of
/// the C4<->C7 reference cycle per the design note in §9: C4 holds this, C7
/// owns both from the supervisor.
pub trait PeerCallback: Send + Sync {
    /// A (possibly reliable) notification arrived. The ACK, if any, has
    /// already been sent downstream before this is invoked (§4.4).
    fn on_notification(&self, reliable: bool, notif_type: u8, rest: Bytes);

    /// A command response matching some in-flight command arrived.
    fn on_command_response(&self, ty: u8, seq: u8, resp_code: u8, rest: Bytes);

    /// The manager re-introduced itself while we thought we were already
    /// connected, or the read loop hit a transport error: the whole session
    /// must be torn down and rebuilt (§4.4, §7).
    fn on_reset(&self);
}

#[derive(Debug, Default)]
struct SeqState {
    /// Next sequence number this side will use when sending a request.
    client_seq: u8,
    /// Last sequence number accepted from the manager.
    mgr_seq: u8,
}

pub struct PeerIO {
    transport: Arc<dyn Transport>,
    callback: Arc<dyn PeerCallback>,
    read_timeout_ms: u64,

    connected: AtomicBool,
    protocol_version: AtomicU8,
    seq: Mutex<SeqState>,
    hello_waiters: Notify,
}

impl PeerIO {
    pub fn new(
        transport: Arc<dyn Transport>,
        callback: Arc<dyn PeerCallback>,
        read_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            callback,
            read_timeout_ms,
            connected: AtomicBool::new(false),
            protocol_version: AtomicU8::new(0),
            seq: Mutex::new(SeqState::default()),
            hello_waiters: Notify::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version.load(Ordering::SeqCst)
    }

    /// Builds `{control=0x02 (request|reliable), type, seq=client_seq,
    /// len}` || payload, and writes it. Does not advance `client_seq` — the
    /// protocol advances it on response (§4.4).
    pub async fn send_command(&self, cmd: &MuxMessage, is_retransmit: bool) -> std::io::Result<u8> {
        let seq = {
            let guard = self.seq.lock().await;
            guard.client_seq
        };

        debug!(ty = cmd.ty, seq, is_retransmit, "send_command");

        let header = FrameHeader {
            control: Control::REQUEST_RELIABLE,
            ty: cmd.ty,
            seq,
            len: cmd.payload.len() as u8,
        };
        self.write_frame(header, &cmd.payload).await?;
        Ok(seq)
    }

    /// Builds `{control=0x03 (response|reliable), type, seq, len=1,
    /// payload=[0]}`, writes it, and sets `mgr_seq := seq+1` (§4.4).
    pub async fn send_ack(&self, ty: u8, seq: u8) -> std::io::Result<()> {
        let header = FrameHeader {
            control: Control::RESPONSE_RELIABLE,
            ty,
            seq,
            len: 1,
        };
        self.write_frame(header, &[0u8]).await?;
        self.seq.lock().await.mgr_seq = seq.wrapping_add(1);
        Ok(())
    }

    async fn send_hello(&self) -> std::io::Result<()> {
        let client_seq = self.seq.lock().await.client_seq;
        let requested_version = KNOWN_API_PROTOCOL_VERSIONS[0];
        let payload = [requested_version, client_seq, 0u8 /* mode */];
        let header = FrameHeader {
            control: Control::empty(),
            ty: downstream_type::HELLO,
            seq: client_seq,
            len: payload.len() as u8,
        };
        debug!(requested_version, "sending HELLO");
        self.write_frame(header, &payload).await
    }

    async fn write_frame(&self, header: FrameHeader, payload: &[u8]) -> std::io::Result<()> {
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(payload);

        match self.transport.kind() {
            TransportKind::Serial => {
                let encoded = hdlc::encode(&frame);
                self.transport.send(&encoded).await
            },
            TransportKind::Udp => {
                let mut datagram = Vec::with_capacity(frame.len() + 1);
                datagram.push(0u8);
                datagram.extend_from_slice(&frame);
                self.transport.send(&datagram).await
            },
        }
    }

    /// Blocks until `connected` becomes true or a reset occurs (§4.4).
    pub async fn wait_for_hello(&self) -> bool {
        loop {
            if self.connected.load(Ordering::SeqCst) {
                return true;
            }
            self.hello_waiters.notified().await;
            // Either connected flipped true, or reset() fired: either way
            // the caller's next loop iteration observes the final state.
            if self.connected.load(Ordering::SeqCst) {
                return true;
            }
            return false;
        }
    }

    /// Wakes all waiters without setting `connected` (§4.4).
    pub fn reset(&self) {
        self.hello_waiters.notify_waiters();
    }

    /// The read loop: periodic HELLO while disconnected, continuous frame
    /// dispatch otherwise (§4.4, §5). Stops without treating it as a reset
    /// once `cancel` fires — that's the supervisor tearing this epoch down
    /// deliberately, not a transport failure (§4.8 step 6).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let hello_interval = std::time::Duration::from_secs(PICARD_HELLO_INTERVAL_SECS);
        let read_timeout = std::time::Duration::from_millis(self.read_timeout_ms);

        let mut next_hello = tokio::time::Instant::now();
        let mut decoder = HdlcDecoder::new();
        let mut buf = vec![0u8; 2048];

        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !self.is_connected() && tokio::time::Instant::now() >= next_hello {
                if let Err(e) = self.send_hello().await {
                    warn!("hello send failed: {e}");
                }
                next_hello = tokio::time::Instant::now() + hello_interval;
            }

            let wait = if self.is_connected() {
                read_timeout
            } else {
                next_hello.saturating_duration_since(tokio::time::Instant::now())
            };

            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = tokio::time::timeout(
                    wait.max(std::time::Duration::from_millis(1)),
                    self.transport.recv(&mut buf),
                ) => read,
            };

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("downstream transport error: {e}");
                    self.callback.on_reset();
                    return;
                },
                Err(_elapsed) => continue,
            };

            if n == 0 {
                warn!("downstream transport returned EOF");
                self.callback.on_reset();
                return;
            }

            let mut frames: Vec<Vec<u8>> = Vec::new();
            match self.transport.kind() {
                TransportKind::Serial => {
                    decoder.feed(&buf[..n], |frame| frames.push(frame.to_vec()));
                },
                TransportKind::Udp => {
                    // Strip the leading dummy byte (§6).
                    if n > 1 {
                        frames.push(buf[1..n].to_vec());
                    }
                },
            }
            for frame in frames {
                self.dispatch_frame(&frame).await;
            }
        }
    }

    async fn dispatch_frame(&self, frame: &[u8]) {
        let header = match FrameHeader::decode(frame) {
            Ok(h) => h,
            Err(e) => {
                debug!("bad downstream header: {e}");
                return;
            },
        };
        let payload = &frame[downstream::HEADER_LEN..];
        if payload.len() != header.len as usize {
            debug!(
                expected = header.len,
                got = payload.len(),
                "downstream payload length mismatch"
            );
            return;
        }

        match downstream::classify(header, payload) {
            DownstreamEvent::HelloResponse {
                success,
                version,
                mgr_seq,
                cli_seq,
                mode: _,
            } => {
                self.handle_hello_response(header, success, version, mgr_seq, cli_seq).await;
            },
            DownstreamEvent::MgrHello { version } => {
                self.handle_mgr_hello(version);
            },
            DownstreamEvent::Notification {
                reliable,
                seq,
                notif_type,
                rest,
            } => {
                self.handle_notification(reliable, seq, notif_type, rest).await;
            },
            DownstreamEvent::CommandResponse {
                ty,
                seq,
                resp_code,
                rest,
            } => {
                self.handle_command_response(ty, seq, resp_code, rest).await;
            },
            DownstreamEvent::Discard => {},
        }
    }

    async fn handle_hello_response(&self, header: FrameHeader, success: u8, version: u8, mgr_seq: u8, cli_seq: u8) {
        if !KNOWN_API_PROTOCOL_VERSIONS.contains(&version) {
            warn!(version, "manager offered an unknown protocol version");
            return;
        }
        self.protocol_version.store(version, Ordering::SeqCst);

        if header.control.is_response() {
            return;
        }

        // Only `control=0, success=0` completes the handshake; any other
        // success code is a rejection, not a connection.
        if success != 0 {
            warn!(success, "manager rejected hello");
            return;
        }

        let next_client_seq = cli_seq.wrapping_add(1);
        {
            let mut guard = self.seq.lock().await;
            guard.mgr_seq = mgr_seq;
            guard.client_seq = next_client_seq;
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(version, "downstream hello accepted");
        self.hello_waiters.notify_waiters();
    }

    fn handle_mgr_hello(&self, version: u8) {
        if KNOWN_API_PROTOCOL_VERSIONS.contains(&version) {
            self.protocol_version.store(version, Ordering::SeqCst);
        }
        if self.is_connected() {
            info!("MGR_HELLO received while connected: resetting session");
            self.callback.on_reset();
        }
    }

    async fn handle_notification(&self, reliable: bool, seq: u8, notif_type: u8, rest: Bytes) {
        let duplicate = reliable && { self.seq.lock().await.mgr_seq == seq };

        if reliable {
            // ACK before the callback fires: prevents the manager from
            // retransmitting faster than fan-out can drain (§5).
            if let Err(e) = self.send_ack(downstream_type::NOTIFICATION, seq).await {
                warn!("notification ack failed: {e}");
            }
        }

        if duplicate {
            debug!(seq, notif_type, "dropping duplicate reliable notification");
        } else {
            self.callback.on_notification(reliable, notif_type, rest);
        }

        // Table's final instruction for this row: `mgr_seq := seq`,
        // unconditionally — this, not `send_ack`'s `seq+1`, is what "same
        // seq as the last received" in the duplicate check means (§3, §4.4).
        self.seq.lock().await.mgr_seq = seq;
    }

    async fn handle_command_response(&self, ty: u8, seq: u8, resp_code: u8, rest: Bytes) {
        self.seq.lock().await.client_seq = seq.wrapping_add(1);
        self.callback.on_command_response(ty, seq, resp_code, rest);
    }
}
