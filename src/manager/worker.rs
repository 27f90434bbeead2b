// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The worker loop (T2, §4.7 "Worker loop") and the [`PeerCallback`]
//! implementation that lets C4 call back into C7 on the reader task.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    manager::{ClientManager, InFlight, InFlightResult},
    peer::{PeerCallback, PeerIO},
    protocol::{
        downstream_type, mux::MuxMessage, mux::MuxOutput, prefix,
        subscription::SubscriptionParams,
    },
};

/// Crate version info reported by `MUX_INFO` (§4.7 step 3, §6).
const BUILD_MAJOR: u8 = 0;
const BUILD_MINOR: u8 = 1;
const BUILD_RELEASE: u8 = 0;
const BUILD_NUMBER: u16 = 1;

impl ClientManager {
    /// Runs until `cancel` fires. Borrows `peer` for the duration of one
    /// connection epoch — C7 never stores an `Arc<PeerIO>` field (§9).
    pub async fn run_worker(&self, peer: &PeerIO, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let item = {
                let mut rx = self.queue_rx.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = timeout(Duration::from_secs(1), rx.recv()) => item,
                }
            };

            let item = match item {
                Ok(Some(item)) => item,
                Ok(None) => return, // queue closed: manager is shutting down
                Err(_elapsed) => continue,
            };

            self.process_command(peer, item).await;
        }
    }

    async fn process_command(&self, peer: &PeerIO, item: super::CommandMsg) {
        let super::CommandMsg { client, mut msg } = item;

        // Step 2: drop commands for clients that already left.
        if let Some(handle) = client {
            if !self.clients.contains_key(&handle) {
                return;
            }
        }

        // Step 3: MUX_INFO short-circuit.
        if msg.ty == crate::protocol::mux_type::MUX_INFO {
            let payload = [
                peer.protocol_version(),
                BUILD_MAJOR,
                BUILD_MINOR,
                BUILD_RELEASE,
                (BUILD_NUMBER >> 8) as u8,
                (BUILD_NUMBER & 0xFF) as u8,
            ];
            self.reply(client, msg.ty, prefix::OK, Bytes::copy_from_slice(&payload))
                .await;
            return;
        }

        // Step 4: validation.
        if !downstream_type::is_api_command(msg.ty) || msg.payload.len() > crate::protocol::MAX_SERIAL_API_CMD_LEN {
            self.reply(client, msg.ty, prefix::ERR_INVALID_CMD, Bytes::new())
                .await;
            return;
        }

        // Step 5: subscribe pre-processing.
        let mut is_subscribe = false;
        if msg.ty == downstream_type::SUBSCRIBE {
            is_subscribe = true;
            if let Some(handle) = client {
                let session = self.clients.get(&handle).map(|e| e.value().clone());
                if let Some(session) = session {
                    if let Some(params) = SubscriptionParams::from_bytes(&msg.payload) {
                        session.filter.lock().await.set(params);
                    } else {
                        self.reply(client, msg.ty, prefix::ERR_INVALID_ARG, Bytes::new())
                            .await;
                        return;
                    }
                }
            }
            self.recompute_union().await;
            let union = self.filter.lock().await.union;
            msg = MuxMessage {
                id: msg.id,
                ty: msg.ty,
                payload: Bytes::copy_from_slice(&union.to_bytes()),
            };
        }

        // Step 6: send-and-wait.
        {
            let mut guard = self.in_flight.lock().await;
            *guard = Some(InFlight {
                client,
                ty: msg.ty,
                seq: 0,
                result: InFlightResult::Pending,
            });
        }

        let mut final_result = InFlightResult::Pending;
        for attempt in 0..self.cfg.retries {
            let seq = match peer.send_command(&msg, attempt > 0).await {
                Ok(seq) => seq,
                Err(e) => {
                    warn!("downstream send failed: {e}");
                    break;
                },
            };
            {
                let mut guard = self.in_flight.lock().await;
                if let Some(inflight) = guard.as_mut() {
                    inflight.seq = seq;
                }
            }

            final_result = self.wait_for_in_flight(self.cfg.timeout_ms).await;
            if final_result != InFlightResult::Pending {
                break;
            }
            debug!(attempt, ty = msg.ty, "in-flight command timed out, retrying");
        }

        // Step 7: failure handling.
        if final_result == InFlightResult::Pending {
            if is_subscribe {
                self.rollback_subscribe(client).await;
            }
            self.reply(client, msg.ty, prefix::ERR_COMMAND_TIMEOUT, Bytes::new())
                .await;
            info!("downstream command exhausted retries, resetting connection");
            self.trigger_reset();
        }

        // Step 8.
        *self.in_flight.lock().await = None;
    }

    async fn rollback_subscribe(&self, client: Option<crate::client::session::ClientHandle>) {
        {
            let mut f = self.filter.lock().await;
            f.union = f.prev;
        }
        if let Some(handle) = client {
            let session = self.clients.get(&handle).map(|e| e.value().clone());
            if let Some(session) = session {
                session.filter.lock().await.reset();
            }
        }
    }

    /// Waits for the worker's own `in_flight` slot to resolve, up to
    /// `timeout_ms`. Returns `Pending` on timeout.
    async fn wait_for_in_flight(&self, timeout_ms: u64) -> InFlightResult {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let guard = self.in_flight.lock().await;
                match guard.as_ref().map(|f| f.result) {
                    Some(InFlightResult::Pending) | None => {},
                    Some(other) => return other,
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return InFlightResult::Pending;
            }
            let _ = timeout(remaining, self.in_flight_notify.notified()).await;
        }
    }

    async fn reply(
        &self,
        client: Option<crate::client::session::ClientHandle>,
        ty: u8,
        prefix: u8,
        payload: Bytes,
    ) {
        let Some(handle) = client else { return };
        let Some(session) = self.clients.get(&handle).map(|e| e.value().clone()) else {
            return;
        };
        let out = MuxOutput {
            id: 0,
            ty,
            prefix,
            payload,
        };
        if let Err(e) = session.send_output(&out).await {
            debug!(handle = handle.0, "failed to deliver reply: {e}");
        }
    }

    /// §4.7 "Notification path": fan out to every authenticated client whose
    /// committed filter matches.
    async fn fan_out_notification(&self, notif_type: u8, payload: Bytes) {
        let sessions: Vec<_> = self.clients.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            if !session.is_authenticated().await {
                continue;
            }
            let matches = session.filter.lock().await.is_subscribed(notif_type);
            if !matches {
                continue;
            }
            let out = MuxOutput {
                id: 0,
                ty: downstream_type::NOTIFICATION,
                prefix: notif_type,
                payload: payload.clone(),
            };
            if let Err(e) = session.send_output(&out).await {
                debug!("failed to deliver notification: {e}");
            }
        }
    }

    /// §4.7 "Response path".
    async fn handle_command_response(&self, ty: u8, seq: u8, resp_code: u8, rest: Bytes) {
        let (client, matched) = {
            let guard = self.in_flight.lock().await;
            match guard.as_ref() {
                Some(inflight) if inflight.ty == ty && inflight.seq == seq => {
                    (inflight.client, true)
                },
                Some(inflight) if inflight.ty == ty => {
                    let err = crate::error::ProtocolError::SequenceMismatch {
                        expected: inflight.seq,
                        got: seq,
                    };
                    debug!("dropping response: {err}");
                    (None, false)
                },
                Some(_) => {
                    debug!(ty, seq, "dropping response for an unrelated command type");
                    (None, false)
                },
                None => (None, false),
            }
        };

        if !matched {
            return;
        }

        if ty == downstream_type::SUBSCRIBE && resp_code != prefix::OK {
            self.rollback_subscribe(client).await;
        }

        self.reply(client, ty, resp_code, rest).await;

        if ty == downstream_type::SUBSCRIBE && resp_code == prefix::OK {
            if let Some(handle) = client {
                let session = self.clients.get(&handle).map(|e| e.value().clone());
                if let Some(session) = session {
                    session.filter.lock().await.commit();
                }
            }
        }

        {
            let mut guard = self.in_flight.lock().await;
            if let Some(inflight) = guard.as_mut() {
                inflight.result = InFlightResult::Ok;
            }
        }
        self.in_flight_notify.notify_waiters();
    }
}

/// C4's view of C7: a thin, `Send + Sync` capability handed to [`PeerIO`] at
/// construction so neither side owns the other directly (§9).
pub struct ManagerCallback(pub std::sync::Arc<ClientManager>);

impl PeerCallback for ManagerCallback {
    fn on_notification(&self, reliable: bool, notif_type: u8, rest: Bytes) {
        let _ = reliable;
        let manager = self.0.clone();
        tokio::spawn(async move {
            manager.fan_out_notification(notif_type, rest).await;
        });
    }

    fn on_command_response(&self, ty: u8, seq: u8, resp_code: u8, rest: Bytes) {
        let manager = self.0.clone();
        tokio::spawn(async move {
            manager.handle_command_response(ty, seq, resp_code, rest).await;
        });
    }

    fn on_reset(&self) {
        self.0.trigger_reset();
    }
}
