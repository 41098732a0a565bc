// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU request dispatching.
//!
//! The serial line is half duplex, so exactly one transaction may be in
//! flight; further requests queue in submission order and are admitted
//! as their predecessors resolve. Transmission is additionally gated on
//! the line having been silent for at least 3.5 character times.

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::Encoder as _;

use crate::{
    codec::{
        self,
        rtu::{CharTiming, SilenceFramer},
    },
    error::{DecodeError, Error, Result},
    frame::{rtu::*, FunctionCode, Request, RequestPdu, Response},
    service::{complete, decode_response, Call, CallId, Command, Handle},
    slave::{Slave, SlaveContext, SlaveId},
    transport::{spawn_io, DisconnectCause, Transport, TransportEvent},
};

/// Modbus RTU client
#[derive(Debug, Clone)]
pub(crate) struct Client {
    handle: Handle,
    slave: Slave,
}

impl Client {
    pub(crate) fn new<T>(
        transport: T,
        slave: Slave,
        baud_rate: u32,
        request_timeout: Duration,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handle = spawn(transport, baud_rate, request_timeout);
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
    async fn call(&mut self, request: Request) -> Result<Response> {
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

/// Spawn a dispatcher task serving the given serial transport.
pub(crate) fn spawn<T>(io: T, baud_rate: u32, request_timeout: Duration) -> Handle
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (transport, events) = spawn_io(io);
    let (command_tx, commands) = mpsc::unbounded_channel();
    let timing = CharTiming::from_baud_rate(baud_rate);
    let dispatcher = Dispatcher {
        transport: Some(transport),
        events,
        commands,
        codec: codec::rtu::ClientCodec,
        framer: SilenceFramer::new(timing),
        t_3_5: timing.t_3_5,
        request_timeout,
        current: None,
        queue: VecDeque::new(),
        // Attaching mid-frame must not trigger a transmission before
        // the line has settled.
        last_activity: Instant::now(),
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
    slave_id: SlaveId,
    function_code: FunctionCode,
    reply: oneshot::Sender<Result<Response>>,
    deadline: Instant,
}

struct Dispatcher<T> {
    transport: Option<T>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    codec: codec::rtu::ClientCodec,
    framer: SilenceFramer,
    t_3_5: Duration,
    request_timeout: Duration,
    current: Option<Pending>,
    queue: VecDeque<Call>,
    /// Last inbound byte or own transmission, whichever is later.
    last_activity: Instant,
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
            let silence_deadline = self.framer.silence_deadline();
            let request_deadline = self.current.as_ref().map(|pending| pending.deadline);
            let events_open = !self.events_closed;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Call(call)) => self.submit(call).await,
                    Some(Command::Cancel(id)) => self.cancel_call(id).await,
                    Some(Command::Disconnect) => {
                        self.on_disconnect(DisconnectCause::Closed);
                        break;
                    }
                    // All handles are gone.
                    None => break,
                },
                event = self.events.recv(), if events_open => match event {
                    Some(TransportEvent::Bytes(bytes)) => self.on_bytes(bytes).await,
                    Some(TransportEvent::Connected) => self.connected = true,
                    Some(TransportEvent::Disconnected(cause)) => self.on_disconnect(cause),
                    None => self.events_closed = true,
                },
                _ = sleep_until_opt(silence_deadline), if silence_deadline.is_some() => {
                    let completed = self.framer.poll_silence(Instant::now());
                    self.on_framer_result(completed).await;
                }
                _ = sleep_until_opt(request_deadline), if request_deadline.is_some() => {
                    self.on_timeout().await;
                }
            }
        }
    }

    async fn submit(&mut self, call: Call) {
        if self.current.is_some() {
            self.queue.push_back(call);
            return;
        }
        self.start_calls(call).await;
    }

    /// Issue a call; whenever one resolves without leaving a pending
    /// transaction behind, the next queued call follows immediately.
    async fn start_calls(&mut self, mut call: Call) {
        loop {
            let Call {
                id,
                slave,
                request,
                reply,
            } = call;

            let done = self.start_one(id, slave, request, reply).await;
            if !done {
                // A transaction is now pending; the loop resumes when
                // it resolves.
                return;
            }
            match self.pop_queue() {
                Some(next) => call = next,
                None => return,
            }
        }
    }

    /// Returns `true` if the call resolved on the spot (error or
    /// broadcast) and the next queued call may proceed.
    async fn start_one(
        &mut self,
        call_id: CallId,
        slave: Slave,
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    ) -> bool {
        if !self.connected {
            complete(
                reply,
                Err(Error::ConnectionLost(self.last_disconnect.clone())),
            );
            return true;
        }

        let broadcast = slave.is_broadcast();
        if broadcast && request.is_read() {
            complete(
                reply,
                Err(Error::InvalidArgument(
                    "read requests cannot be broadcast",
                )),
            );
            return true;
        }
        let echo = broadcast.then(|| broadcast_echo(&request));
        let function_code = request.function_code();
        let slave_id: SlaveId = slave.into();

        let adu = RequestAdu {
            hdr: Header { slave_id },
            pdu: RequestPdu(request),
        };
        let mut buf = BytesMut::new();
        if let Err(err) = self.codec.encode(adu, &mut buf) {
            complete(
                reply,
                Err(Error::ConnectionLost(DisconnectCause::Io(Arc::new(err)))),
            );
            return true;
        }

        // Hold off transmission until the line has been idle for t3.5
        // since the last inbound byte or our own last transmission.
        let earliest = self.last_activity + self.t_3_5;
        let now = Instant::now();
        if earliest > now {
            tokio::time::sleep(earliest - now).await;
        }

        if let Err(err) = self.send_bytes(buf.freeze()) {
            complete(
                reply,
                Err(Error::ConnectionLost(DisconnectCause::Io(Arc::new(err)))),
            );
            return true;
        }
        self.last_activity = Instant::now();
        log::debug!("Sent function {function_code} to slave {slave_id}");

        if let Some(echo) = echo {
            // Broadcasts are never answered. The call completes once
            // the turnaround silence has passed.
            tokio::time::sleep(self.t_3_5).await;
            complete(reply, Ok(echo));
            return true;
        }

        self.current = Some(Pending {
            call_id,
            slave_id,
            function_code,
            reply,
            deadline: Instant::now() + self.request_timeout,
        });
        false
    }

    fn send_bytes(&mut self, bytes: Bytes) -> std::io::Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        transport.send(bytes)
    }

    fn pop_queue(&mut self) -> Option<Call> {
        while let Some(call) = self.queue.pop_front() {
            if call.reply.is_closed() {
                log::debug!("Skipping an abandoned queued request");
                continue;
            }
            return Some(call);
        }
        None
    }

    async fn admit_next(&mut self) {
        debug_assert!(self.current.is_none());
        if let Some(call) = self.pop_queue() {
            self.start_calls(call).await;
        }
    }

    async fn on_bytes(&mut self, bytes: Bytes) {
        let now = Instant::now();
        self.last_activity = now;
        let completed = self.framer.feed(now, &bytes);
        self.on_framer_result(completed).await;
    }

    async fn on_framer_result(
        &mut self,
        completed: Option<std::result::Result<(SlaveId, Bytes), DecodeError>>,
    ) {
        match completed {
            None => {}
            Some(Ok((slave_id, pdu_data))) => self.on_frame(slave_id, pdu_data).await,
            Some(Err(err)) => {
                if let Some(pending) = self.current.take() {
                    log::warn!("Corrupt frame: {err}");
                    complete(pending.reply, Err(Error::Decode(err)));
                    self.admit_next().await;
                } else {
                    self.unmatched_frames += 1;
                    log::debug!("Dropping a corrupt frame with no pending request: {err}");
                }
            }
        }
    }

    async fn on_frame(&mut self, slave_id: SlaveId, pdu_data: Bytes) {
        let matches = self
            .current
            .as_ref()
            .map_or(false, |pending| pending.slave_id == slave_id);
        if !matches {
            self.unmatched_frames += 1;
            log::debug!(
                "Dropping unmatched frame from slave {slave_id}, {} so far",
                self.unmatched_frames
            );
            return;
        }
        let Some(pending) = self.current.take() else {
            return;
        };
        complete(pending.reply, decode_response(pending.function_code, pdu_data));
        self.admit_next().await;
    }

    async fn on_timeout(&mut self) {
        let Some(pending) = self.current.take() else {
            return;
        };
        log::debug!("Request to slave {} timed out", pending.slave_id);
        complete(pending.reply, Err(Error::Timeout));
        self.admit_next().await;
    }

    async fn cancel_call(&mut self, id: CallId) {
        if self
            .current
            .as_ref()
            .map_or(false, |pending| pending.call_id == id)
        {
            let Some(pending) = self.current.take() else {
                return;
            };
            complete(pending.reply, Err(Error::Cancelled));
            self.admit_next().await;
            return;
        }
        if let Some(pos) = self.queue.iter().position(|call| call.id == id) {
            if let Some(call) = self.queue.remove(pos) {
                complete(call.reply, Err(Error::Cancelled));
            }
        }
    }

    fn on_disconnect(&mut self, cause: DisconnectCause) {
        self.connected = false;
        self.last_disconnect = cause.clone();
        self.transport = None;
        self.framer.reset();
        let drained = self
            .current
            .take()
            .map(|pending| pending.reply)
            .into_iter()
            .chain(self.queue.drain(..).map(|call| call.reply))
            .collect::<Vec<_>>();
        if !drained.is_empty() {
            log::warn!(
                "Connection lost, failing {} pending request(s): {cause}",
                drained.len()
            );
        }
        for reply in drained {
            complete(reply, Err(Error::ConnectionLost(cause.clone())));
        }
    }
}

impl<T> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.current.is_some())
            .field("queued", &self.queue.len())
            .field("connected", &self.connected)
            .field("unmatched_frames", &self.unmatched_frames)
            .finish_non_exhaustive()
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> tokio::time::Sleep {
    // The fallback deadline is never awaited: branches using this are
    // guarded on `deadline.is_some()`.
    let deadline = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
}

/// The response shape a unicast write would have echoed back.
#[allow(clippy::cast_possible_truncation)]
fn broadcast_echo(request: &Request) -> Response {
    match request {
        Request::WriteSingleCoil(addr, state) => Response::WriteSingleCoil(*addr, *state),
        Request::WriteMultipleCoils(addr, coils) => {
            Response::WriteMultipleCoils(*addr, coils.len() as u16)
        }
        Request::WriteSingleRegister(addr, word) => Response::WriteSingleRegister(*addr, *word),
        Request::WriteMultipleRegisters(addr, words) => {
            Response::WriteMultipleRegisters(*addr, words.len() as u16)
        }
        Request::MaskWriteRegister(addr, and_mask, or_mask) => {
            Response::MaskWriteRegister(*addr, *and_mask, *or_mask)
        }
        // Read requests are rejected before reaching this point.
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_echoes_mirror_requests() {
        assert_eq!(
            broadcast_echo(&Request::WriteSingleCoil(0x12, true)),
            Response::WriteSingleCoil(0x12, true)
        );
        assert_eq!(
            broadcast_echo(&Request::WriteMultipleCoils(0x03, vec![true, false, true])),
            Response::WriteMultipleCoils(0x03, 3)
        );
        assert_eq!(
            broadcast_echo(&Request::WriteMultipleRegisters(0x10, vec![1, 2])),
            Response::WriteMultipleRegisters(0x10, 2)
        );
        assert_eq!(
            broadcast_echo(&Request::MaskWriteRegister(0x04, 0x00F2, 0x0025)),
            Response::MaskWriteRegister(0x04, 0x00F2, 0x0025)
        );
    }
}
