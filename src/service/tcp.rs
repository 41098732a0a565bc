// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP request dispatching.
//!
//! Multiple transactions may be in flight concurrently; responses are
//! correlated by the transaction identifier stamped into the MBAP
//! header and may arrive in any order.

use std::{collections::HashMap, fmt, future::poll_fn, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{Decoder as _, Encoder as _},
    time::delay_queue::{DelayQueue, Key},
};

use crate::{
    codec,
    error::{Error, Result},
    frame::{tcp::*, FunctionCode, RequestPdu, Response},
    service::{complete, decode_response, Call, CallId, Command, Handle, TransactionIds},
    slave::{Slave, SlaveContext},
    transport::{spawn_io, DisconnectCause, Transport, TransportEvent},
};

/// Modbus TCP client
#[derive(Debug, Clone)]
pub(crate) struct Client {
    handle: Handle,
    slave: Slave,
}

impl Client {
    pub(crate) fn new<T>(transport: T, slave: Slave, request_timeout: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handle = spawn(transport, request_timeout);
        Self { handle, slave }
    }
}

impl SlaveContext for Client {
    fn set_slave(&mut self, slave: Slave) {
        self.slave = slave;
    }
}

#[async_trait::async_trait]
impl crate::client::Client for Client {
    async fn call(&mut self, request: crate::frame::Request) -> Result<Response> {
        log::debug!("Call {request:?}");
        self.handle.call(self.slave, request).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.handle.disconnect();
        Ok(())
    }

    fn clone_boxed(&self) -> Box<dyn crate::client::Client> {
        Box::new(self.clone())
    }
}

/// Spawn a dispatcher task serving the given transport.
pub(crate) fn spawn<T>(io: T, request_timeout: Duration) -> Handle
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (transport, events) = spawn_io(io);
    let (command_tx, commands) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher {
        transport: Some(transport),
        events,
        commands,
        codec: codec::tcp::ClientCodec,
        rx_buf: BytesMut::new(),
        transaction_ids: TransactionIds::default(),
        pending: HashMap::new(),
        calls: HashMap::new(),
        timeouts: DelayQueue::new(),
        request_timeout,
        connected: true,
        last_disconnect: DisconnectCause::Closed,
        events_closed: false,
        unmatched_frames: 0,
    };
    tokio::spawn(dispatcher.run());
    Handle::new(command_tx)
}

struct Pending {
    call_id: CallId,
    unit_id: UnitId,
    function_code: FunctionCode,
    reply: oneshot::Sender<Result<Response>>,
    timeout: Key,
}

struct Dispatcher<T> {
    transport: Option<T>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    codec: codec::tcp::ClientCodec,
    rx_buf: BytesMut,
    transaction_ids: TransactionIds,
    pending: HashMap<TransactionId, Pending>,
    calls: HashMap<CallId, TransactionId>,
    timeouts: DelayQueue<TransactionId>,
    request_timeout: Duration,
    connected: bool,
    last_disconnect: DisconnectCause,
    events_closed: bool,
    unmatched_frames: u64,
}

impl<T> Dispatcher<T>
where
    T: Transport,
{
    async fn run(mut self) {
        loop {
            // Hoisted out of the select: the branch future itself
            // borrows the delay queue.
            let timeouts_armed = !self.timeouts.is_empty();
            let events_open = !self.events_closed;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Call(call)) => self.begin_call(call),
                    Some(Command::Cancel(id)) => self.cancel_call(id),
                    Some(Command::Disconnect) => {
                        self.on_disconnect(DisconnectCause::Closed);
                        break;
                    }
                    // All handles are gone.
                    None => break,
                },
                event = self.events.recv(), if events_open => match event {
                    Some(TransportEvent::Bytes(bytes)) => self.on_bytes(bytes),
                    Some(TransportEvent::Connected) => self.connected = true,
                    Some(TransportEvent::Disconnected(cause)) => self.on_disconnect(cause),
                    None => self.events_closed = true,
                },
                expired = poll_fn(|cx| self.timeouts.poll_expired(cx)), if timeouts_armed => {
                    if let Some(expired) = expired {
                        self.on_timeout(expired.into_inner());
                    }
                }
            }
        }
    }

    fn begin_call(&mut self, call: Call) {
        let Call {
            id,
            slave,
            request,
            reply,
        } = call;

        if !self.connected {
            complete(
                reply,
                Err(Error::ConnectionLost(self.last_disconnect.clone())),
            );
            return;
        }
        let Some(transaction_id) = self
            .transaction_ids
            .next_free(|id| self.pending.contains_key(&id))
        else {
            complete(reply, Err(Error::TooManyOutstanding));
            return;
        };

        let function_code = request.function_code();
        let unit_id = slave.into();
        let adu = RequestAdu {
            hdr: Header {
                transaction_id,
                unit_id,
            },
            pdu: RequestPdu(request),
        };
        let mut buf = BytesMut::new();
        if let Err(err) = self.codec.encode(adu, &mut buf) {
            complete(
                reply,
                Err(Error::ConnectionLost(DisconnectCause::Io(Arc::new(err)))),
            );
            return;
        }
        if let Err(err) = self.send_bytes(buf.freeze()) {
            complete(
                reply,
                Err(Error::ConnectionLost(DisconnectCause::Io(Arc::new(err)))),
            );
            return;
        }

        log::debug!("Sent function {function_code} to unit {unit_id} as transaction {transaction_id}");
        let timeout = self.timeouts.insert(transaction_id, self.request_timeout);
        self.pending.insert(
            transaction_id,
            Pending {
                call_id: id,
                unit_id,
                function_code,
                reply,
                timeout,
            },
        );
        self.calls.insert(id, transaction_id);
    }

    fn send_bytes(&mut self, bytes: Bytes) -> std::io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        transport.send(bytes)
    }

    fn cancel_call(&mut self, id: CallId) {
        let Some(transaction_id) = self.calls.remove(&id) else {
            return;
        };
        let Some(pending) = self.pending.remove(&transaction_id) else {
            return;
        };
        self.timeouts.remove(&pending.timeout);
        log::debug!("Cancelled transaction {transaction_id}");
        complete(pending.reply, Err(Error::Cancelled));
    }

    fn on_bytes(&mut self, bytes: Bytes) {
        self.rx_buf.extend_from_slice(&bytes);
        loop {
            match self.codec.decode(&mut self.rx_buf) {
                Ok(Some((hdr, pdu_data))) => self.on_frame(hdr, pdu_data),
                Ok(None) => break,
                Err(err) => {
                    // Desynchronized byte stream: frames can no longer
                    // be attributed to transactions.
                    log::error!("Failed to decode MBAP frame, dropping the connection: {err}");
                    self.on_disconnect(DisconnectCause::Io(Arc::new(err)));
                    break;
                }
            }
        }
    }

    fn on_frame(&mut self, hdr: Header, pdu_data: Bytes) {
        let matches = self
            .pending
            .get(&hdr.transaction_id)
            .map_or(false, |pending| pending.unit_id == hdr.unit_id);
        if !matches {
            self.unmatched_frames += 1;
            log::debug!(
                "Dropping unmatched frame (transaction {}, unit {}), {} so far",
                hdr.transaction_id,
                hdr.unit_id,
                self.unmatched_frames
            );
            return;
        }
        let Some(pending) = self.pending.remove(&hdr.transaction_id) else {
            return;
        };
        self.timeouts.remove(&pending.timeout);
        self.calls.remove(&pending.call_id);
        complete(pending.reply, decode_response(pending.function_code, pdu_data));
    }

    fn on_timeout(&mut self, transaction_id: TransactionId) {
        let Some(pending) = self.pending.remove(&transaction_id) else {
            return;
        };
        self.calls.remove(&pending.call_id);
        log::debug!("Transaction {transaction_id} timed out");
        complete(pending.reply, Err(Error::Timeout));
    }

    fn on_disconnect(&mut self, cause: DisconnectCause) {
        self.connected = false;
        self.last_disconnect = cause.clone();
        self.transport = None;
        self.rx_buf.clear();
        self.timeouts.clear();
        self.calls.clear();
        if !self.pending.is_empty() {
            log::warn!(
                "Connection lost, failing {} pending transaction(s): {cause}",
                self.pending.len()
            );
        }
        for (_, pending) in self.pending.drain() {
            complete(pending.reply, Err(Error::ConnectionLost(cause.clone())));
        }
    }
}

impl<T> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending.len())
            .field("connected", &self.connected)
            .field("unmatched_frames", &self.unmatched_frames)
            .finish_non_exhaustive()
    }
}
