// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client manager (C7, §4.7) — the heart of the multiplexer: the global
//! command queue, single-in-flight scheduler, notification fan-out, and
//! subscription-union bookkeeping.
//!
//! C7 never holds a strong reference to C4; `run_worker` borrows the peer for
//! the duration of one connection epoch instead (§9 "no shared ownership
//! between C4 and C7"). C4 reaches back into C7 only through the
//! [`crate::peer::PeerCallback`] capability registered at construction.

pub mod queue;
pub mod worker;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    client::session::{ClientHandle, ClientSession},
    protocol::subscription::SubscriptionParams,
};

pub use queue::CommandMsg;
use queue::CommandQueue;

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub retries: u32,
    pub timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retries: crate::protocol::DEFAULT_COMMAND_RETRIES,
            timeout_ms: crate::protocol::DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightResult {
    Pending,
    Ok,
    Disconnect,
}

#[derive(Debug)]
pub(crate) struct InFlight {
    pub client: Option<ClientHandle>,
    pub ty: u8,
    pub seq: u8,
    pub result: InFlightResult,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FilterState {
    pub union: SubscriptionParams,
    pub prev: SubscriptionParams,
}

pub struct ClientManager {
    pub(crate) clients: DashMap<ClientHandle, Arc<ClientSession>>,
    next_handle: AtomicU64,
    pub(crate) queue: CommandQueue,
    pub(crate) queue_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<CommandMsg>>,
    pub(crate) in_flight: Mutex<Option<InFlight>>,
    pub(crate) in_flight_notify: Notify,
    pub(crate) filter: Mutex<FilterState>,
    /// The current epoch's reset signal. Replaced (not recreated-alongside)
    /// on every new connection epoch — the manager itself is a
    /// process-lifetime singleton (§3 "Lifecycle": "The client manager …
    /// live across the whole process").
    reset_signal: std::sync::Mutex<CancellationToken>,
    pub(crate) cfg: ManagerConfig,
}

impl ClientManager {
    pub fn new(cfg: ManagerConfig) -> Arc<Self> {
        let (queue, queue_rx) = CommandQueue::new();
        Arc::new(Self {
            clients: DashMap::new(),
            next_handle: AtomicU64::new(1),
            queue,
            queue_rx: Mutex::new(queue_rx),
            in_flight: Mutex::new(None),
            in_flight_notify: Notify::new(),
            filter: Mutex::new(FilterState::default()),
            reset_signal: std::sync::Mutex::new(CancellationToken::new()),
            cfg,
        })
    }

    /// Starts a fresh connection epoch: a new reset token (the old one may
    /// already be cancelled) and an empty client set (§3 "the set of
    /// clients is emptied on reset"). Drains whatever commands were still
    /// queued from the previous epoch.
    pub async fn begin_epoch(&self) -> CancellationToken {
        self.clients.clear();
        *self.in_flight.lock().await = None;
        {
            let mut rx = self.queue_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
        let fresh = CancellationToken::new();
        *self.reset_signal.lock().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        fresh
    }

    /// Cancels the current epoch's reset signal (§4.7 step 7, §4.4 MGR_HELLO
    /// handling, §7 "any error that leaves the downstream session in an
    /// unknown state escalates to `resetConnection()`").
    pub fn trigger_reset(&self) {
        self.reset_signal.lock().unwrap_or_else(|e| e.into_inner()).cancel();
    }

    pub fn alloc_handle(&self) -> ClientHandle {
        ClientHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, handle: ClientHandle, session: Arc<ClientSession>) {
        self.clients.insert(handle, session);
    }

    /// §4.7 "Client removal": erase, resolve a pending in-flight command
    /// owned by this client as `Disconnect`, recompute the union, and — if
    /// it changed — enqueue a synthetic SUBSCRIBE so the peer learns about
    /// it.
    pub async fn remove_client(&self, handle: ClientHandle) {
        if self.clients.remove(&handle).is_none() {
            return;
        }

        {
            let mut guard = self.in_flight.lock().await;
            if let Some(inflight) = guard.as_mut() {
                if inflight.client == Some(handle) {
                    inflight.result = InFlightResult::Disconnect;
                    self.in_flight_notify.notify_waiters();
                }
            }
        }

        debug!(handle = handle.0, "client removed");

        let changed = self.recompute_union().await;
        if changed {
            let union = self.filter.lock().await.union;
            let msg = crate::protocol::mux::MuxMessage {
                id: 0,
                ty: crate::protocol::downstream_type::SUBSCRIBE,
                payload: bytes::Bytes::copy_from_slice(&union.to_bytes()),
            };
            self.queue.add_command(None, msg);
        }
    }

    pub fn enqueue(&self, client: Option<ClientHandle>, msg: crate::protocol::mux::MuxMessage) {
        self.queue.add_command(client, msg);
    }

    /// Recomputes the union over every client's *effective* filter (proposed
    /// if mid-subscribe, else committed) so a pending SUBSCRIBE is already
    /// reflected in the aggregate the instant it's proposed (§3 invariant on
    /// C7 state).
    pub(crate) async fn recompute_union(&self) -> bool {
        let sessions: Vec<_> = self.clients.iter().map(|e| e.value().clone()).collect();

        let mut acc = SubscriptionParams::default();
        for session in &sessions {
            let filter = session.filter.lock().await;
            acc = SubscriptionParams::union(
                acc,
                SubscriptionParams {
                    filter: filter.get(),
                    unreliable: filter.get_unreliable(),
                },
            );
        }

        let mut f = self.filter.lock().await;
        let changed = acc.filter != f.union.filter || acc.unreliable != f.union.unreliable;
        f.prev = f.union;
        f.union = acc;
        changed
    }
}
