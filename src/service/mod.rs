// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request dispatching.
//!
//! Every connection is served by a dispatcher task that owns all of the
//! transaction state: inbound bytes, timer expirations, disconnects and
//! caller commands funnel through its single select loop, so response
//! arrival can never race timeout handling. Callers talk to the task
//! through a clonable [`Handle`].

#[cfg(feature = "rtu")]
pub(crate) mod rtu;

#[cfg(feature = "tcp")]
pub(crate) mod tcp;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{DecodeError, Error, Result},
    frame::{FunctionCode, Request, Response, ResponsePdu},
    slave::Slave,
    transport::DisconnectCause,
};

#[cfg(feature = "tcp")]
use crate::frame::tcp::TransactionId;

/// Identifies a submitted call across the command channel, e.g. for
/// cancelling it again.
pub(crate) type CallId = u64;

#[derive(Debug)]
pub(crate) struct Call {
    pub(crate) id: CallId,
    pub(crate) slave: Slave,
    pub(crate) request: Request,
    pub(crate) reply: oneshot::Sender<Result<Response>>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Call(Call),
    Cancel(CallId),
    Disconnect,
}

/// Caller-side handle of a dispatcher task.
#[derive(Debug, Clone)]
pub(crate) struct Handle {
    commands: mpsc::UnboundedSender<Command>,
    next_call_id: Arc<AtomicU64>,
}

impl Handle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            commands,
            next_call_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Submit a request and await its completion.
    ///
    /// Dropping the returned future notifies the dispatcher so the
    /// transaction is removed promptly instead of lingering until its
    /// deadline.
    pub(crate) async fn call(&self, slave: Slave, request: Request) -> Result<Response> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Call(Call {
                id,
                slave,
                request,
                reply,
            }))
            .map_err(|_| Error::ConnectionLost(DisconnectCause::Closed))?;
        let guard = CancelOnDrop {
            id,
            commands: &self.commands,
            armed: true,
        };
        let result = response.await;
        guard.disarm();
        result.map_err(|_| Error::ConnectionLost(DisconnectCause::Closed))?
    }

    /// Ask the dispatcher to drop the transport and fail everything
    /// that is still outstanding.
    pub(crate) fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

struct CancelOnDrop<'a> {
    id: CallId,
    commands: &'a mpsc::UnboundedSender<Command>,
    armed: bool,
}

impl CancelOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Cancel(self.id));
        }
    }
}

/// Transaction identifier sequence for Modbus/TCP.
///
/// Identifiers are allocated by pure increment with wraparound, probing
/// past identifiers that are still bound to an in-flight transaction.
/// After an unsuccessful full revolution the allocation fails.
#[cfg(feature = "tcp")]
#[derive(Debug, Default)]
pub(crate) struct TransactionIds {
    next: TransactionId,
}

#[cfg(feature = "tcp")]
impl TransactionIds {
    pub(crate) fn next_free(
        &mut self,
        is_pending: impl Fn(TransactionId) -> bool,
    ) -> Option<TransactionId> {
        for _ in 0..=u16::MAX {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !is_pending(id) {
                return Some(id);
            }
        }
        None
    }
}

/// Decode a response PDU against the function code of the request it
/// answers.
///
/// Exception responses complete the call with [`Error::Exception`]; a
/// well-formed response to a different function code is a decode error.
pub(crate) fn decode_response(function_code: FunctionCode, pdu_data: Bytes) -> Result<Response> {
    let ResponsePdu(pdu) = ResponsePdu::try_from(pdu_data)?;
    match pdu {
        Ok(rsp) => {
            let actual = rsp.function_code();
            if actual != function_code {
                return Err(Error::Decode(DecodeError::FunctionCodeMismatch {
                    expected: function_code.value(),
                    actual: actual.value(),
                }));
            }
            Ok(rsp)
        }
        Err(ex) => Err(Error::Exception(ex.exception)),
    }
}

/// Complete an awaiting caller, tolerating that it may be gone.
pub(crate) fn complete(reply: oneshot::Sender<Result<Response>>, result: Result<Response>) {
    if reply.send(result).is_err() {
        log::debug!("Discarding the result of an abandoned call");
    }
}
