// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `Transport` capability: the seam between the mux's framing/session
//! logic and however bytes actually reach the manager.
//!
//! Transport open/close mechanics (serial device setup, UDP socket creation)
//! are out of scope for this crate (§1) — callers construct a `Transport`
//! however they like (a real serial port, a test double, …) and hand it to
//! [`crate::peer::PeerIO`].

use std::{io, pin::Pin, sync::Arc};

use tokio::net::UdpSocket;

/// Distinguishes the two downstream framing conventions (§6): serial is
/// HDLC-framed, UDP is one complete frame per datagram with a leading dummy
/// byte stripped/prepended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Udp,
}

type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// An object-safe byte transport. Boxes its async step, the same way a
/// hand-rolled state machine's step result gets boxed, so the trait can be
/// used as `Arc<dyn Transport>` without `async_trait`.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Sends one complete unit: a raw byte stream chunk for serial, or one
    /// datagram for UDP. Callers are responsible for HDLC-encoding (serial)
    /// or dummy-byte-prefixing (UDP) before calling this.
    fn send<'a>(&'a self, bytes: &'a [u8]) -> IoFuture<'a, ()>;

    /// Reads whatever is available into `buf`: for serial, an arbitrary
    /// chunk of the byte stream (`Ok(n)` bytes written); for UDP, exactly
    /// one datagram.
    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize>;
}

/// UDP transport: one send/recv = one datagram, no HDLC.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn send<'a>(&'a self, bytes: &'a [u8]) -> IoFuture<'a, ()> {
        Box::pin(async move {
            self.socket.send(bytes).await?;
            Ok(())
        })
    }

    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move { self.socket.recv(buf).await })
    }
}

/// Serial transport: a continuous byte stream, HDLC-framed at a higher
/// layer. Generic over anything implementing `AsyncRead + AsyncWrite` so the
/// concrete serial-port crate is a detail left to the caller (§1 "Transport
/// open/close mechanics … are out of scope").
pub struct SerialTransport<S> {
    inner: tokio::sync::Mutex<S>,
}

impl<S> SerialTransport<S>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(stream),
        }
    }
}

impl<S> Transport for SerialTransport<S>
where S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send
{
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn send<'a>(&'a self, bytes: &'a [u8]) -> IoFuture<'a, ()> {
        use tokio::io::AsyncWriteExt;
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            guard.write_all(bytes).await
        })
    }

    fn recv<'a>(&'a self, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        use tokio::io::AsyncReadExt;
        Box::pin(async move {
            let mut guard = self.inner.lock().await;
            guard.read(buf).await
        })
    }
}
