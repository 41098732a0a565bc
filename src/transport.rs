// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The byte-pipe contract between a connection and its dispatcher.
//!
//! The core makes no assumption about the underlying socket library,
//! TLS stack or serial driver. It requires exactly three things from a
//! binding: a way to enqueue outbound bytes, an ordered stream of
//! inbound bytes and notification of connect/disconnect events. The
//! [`spawn_io`] adapter provides all three on top of any
//! `AsyncRead + AsyncWrite` pair.

use std::{fmt, io, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::mpsc,
};

/// Outbound half of the byte pipe.
pub trait Transport: fmt::Debug + Send {
    /// Enqueue bytes for transmission.
    ///
    /// Enqueueing never blocks; backpressure is the binding's concern.
    /// Fails fast with [`io::ErrorKind::NotConnected`] once the
    /// connection is gone.
    fn send(&mut self, bytes: Bytes) -> io::Result<()>;
}

/// Why the transport went away.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    /// The byte stream reached its end.
    Closed,
    /// An I/O error terminated the connection.
    Io(Arc<io::Error>),
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("connection closed"),
            Self::Io(err) => err.fmt(f),
        }
    }
}

/// Inbound byte deliveries and connection events, merged into a single
/// ordered stream so the dispatcher has one serialization point.
#[derive(Debug)]
pub enum TransportEvent {
    /// The binding is ready to exchange bytes.
    Connected,
    /// The binding is gone; no further bytes will be delivered.
    Disconnected(DisconnectCause),
    /// A chunk of inbound bytes, in arrival order.
    Bytes(Bytes),
}

/// [`Transport`] half handed to the dispatcher by [`spawn_io`].
#[derive(Debug)]
pub(crate) struct StreamTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Transport for StreamTransport {
    fn send(&mut self, bytes: Bytes) -> io::Result<()> {
        self.tx
            .send(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }
}

/// Pump a bidirectional byte stream through a pair of tasks and expose
/// it through the transport contract.
///
/// Dropping the returned [`StreamTransport`] shuts the write half down;
/// dropping the event receiver stops the reader at the next delivery.
pub(crate) fn spawn_io<T>(io: T) -> (StreamTransport, mpsc::Receiver<TransportEvent>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel(32);
    let (byte_tx, mut byte_rx) = mpsc::unbounded_channel::<Bytes>();
    let (mut rd, mut wr) = tokio::io::split(io);

    tokio::spawn(async move {
        while let Some(bytes) = byte_rx.recv().await {
            if wr.write_all(&bytes).await.is_err() || wr.flush().await.is_err() {
                // The reader half observes and reports the failure.
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    tokio::spawn(async move {
        let _ = event_tx.send(TransportEvent::Connected).await;
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match rd.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected(DisconnectCause::Closed))
                        .await;
                    break;
                }
                Ok(_) => {
                    if event_tx
                        .send(TransportEvent::Bytes(buf.split().freeze()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    let _ = event_tx
                        .send(TransportEvent::Disconnected(DisconnectCause::Io(Arc::new(
                            err,
                        ))))
                        .await;
                    break;
                }
            }
        }
    });

    (StreamTransport { tx: byte_tx }, event_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pumps_bytes_both_ways() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (mut transport, mut events) = spawn_io(ours);
        let (mut peer_rd, mut peer_wr) = tokio::io::split(theirs);

        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Connected
        ));

        transport.send(Bytes::from_static(b"ping")).unwrap();
        let mut buf = [0u8; 4];
        peer_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer_wr.write_all(b"pong").await.unwrap();
        let TransportEvent::Bytes(bytes) = events.recv().await.unwrap() else {
            panic!("expected bytes");
        };
        assert_eq!(&bytes[..], b"pong");
    }

    #[tokio::test]
    async fn reports_closed_stream() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (_transport, mut events) = spawn_io(ours);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Connected
        ));
        drop(theirs);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Disconnected(DisconnectCause::Closed)
        ));
    }
}
