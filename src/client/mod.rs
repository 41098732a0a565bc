// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Asynchronous Modbus client API

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

use std::fmt;

use async_trait::async_trait;

use crate::{
    codec::{MAX_READ_BITS, MAX_READ_WORDS, MAX_RW_WRITE_WORDS, MAX_WRITE_BITS, MAX_WRITE_WORDS},
    error::{DecodeError, Error, Result},
    frame::{Address, Coil, Quantity, Request, Response, Word},
    slave::{Slave, SlaveContext},
};

/// A transport independent asynchronous client trait.
#[async_trait]
pub trait Client: SlaveContext + fmt::Debug + Send {
    /// Submit a request to the currently selected slave device and
    /// await the matching response.
    async fn call(&mut self, request: Request) -> Result<Response>;

    /// Disconnect and release the underlying transport. Pending
    /// requests fail with [`Error::ConnectionLost`].
    async fn disconnect(&mut self) -> Result<()>;

    /// Duplicate the client handle.
    ///
    /// Clones share the connection and its dispatcher, so multiple
    /// requests can be awaited concurrently. On TCP they are in flight
    /// simultaneously; on RTU they queue in submission order.
    fn clone_boxed(&self) -> Box<dyn Client>;
}

/// An asynchronous Modbus reader.
#[async_trait]
pub trait Reader: Client {
    async fn read_coils(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>>;

    async fn read_discrete_inputs(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>>;

    async fn read_holding_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>>;

    async fn read_input_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>>;

    async fn read_write_multiple_registers(
        &mut self,
        read_addr: Address,
        read_count: Quantity,
        write_addr: Address,
        write_data: &'_ [Word],
    ) -> Result<Vec<Word>>;
}

/// An asynchronous Modbus writer.
#[async_trait]
pub trait Writer: Client {
    async fn write_single_coil(&mut self, addr: Address, coil: Coil) -> Result<()>;

    async fn write_multiple_coils(&mut self, addr: Address, coils: &'_ [Coil]) -> Result<()>;

    async fn write_single_register(&mut self, addr: Address, word: Word) -> Result<()>;

    async fn write_multiple_registers(&mut self, addr: Address, words: &'_ [Word]) -> Result<()>;

    async fn masked_write_register(
        &mut self,
        addr: Address,
        and_mask: Word,
        or_mask: Word,
    ) -> Result<()>;
}

/// An asynchronous Modbus client context.
///
/// Argument constraints are validated here, before anything touches
/// the wire, and response payloads are verified against the request.
#[derive(Debug)]
pub struct Context {
    client: Box<dyn Client>,
}

impl Context {
    /// Disconnect and release the underlying transport.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.client.disconnect().await
    }
}

impl From<Box<dyn Client>> for Context {
    fn from(client: Box<dyn Client>) -> Self {
        Self { client }
    }
}

impl From<Context> for Box<dyn Client> {
    fn from(from: Context) -> Self {
        from.client
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone_boxed(),
        }
    }
}

#[async_trait]
impl Client for Context {
    async fn call(&mut self, request: Request) -> Result<Response> {
        self.client.call(request).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.client.disconnect().await
    }

    fn clone_boxed(&self) -> Box<dyn Client> {
        self.client.clone_boxed()
    }
}

impl SlaveContext for Context {
    fn set_slave(&mut self, slave: Slave) {
        self.client.set_slave(slave);
    }
}

#[async_trait]
impl Reader for Context {
    async fn read_coils(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>> {
        check_count(cnt, MAX_READ_BITS)?;
        check_address_range(addr, cnt)?;
        let rsp = self.client.call(Request::ReadCoils(addr, cnt)).await?;
        let Response::ReadCoils(coils) = rsp else {
            return Err(unexpected_response());
        };
        truncate_bits(coils, cnt)
    }

    async fn read_discrete_inputs(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>> {
        check_count(cnt, MAX_READ_BITS)?;
        check_address_range(addr, cnt)?;
        let rsp = self
            .client
            .call(Request::ReadDiscreteInputs(addr, cnt))
            .await?;
        let Response::ReadDiscreteInputs(inputs) = rsp else {
            return Err(unexpected_response());
        };
        truncate_bits(inputs, cnt)
    }

    async fn read_holding_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>> {
        check_count(cnt, MAX_READ_WORDS)?;
        check_address_range(addr, cnt)?;
        let rsp = self
            .client
            .call(Request::ReadHoldingRegisters(addr, cnt))
            .await?;
        let Response::ReadHoldingRegisters(words) = rsp else {
            return Err(unexpected_response());
        };
        check_word_count(&words, cnt)?;
        Ok(words)
    }

    async fn read_input_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>> {
        check_count(cnt, MAX_READ_WORDS)?;
        check_address_range(addr, cnt)?;
        let rsp = self
            .client
            .call(Request::ReadInputRegisters(addr, cnt))
            .await?;
        let Response::ReadInputRegisters(words) = rsp else {
            return Err(unexpected_response());
        };
        check_word_count(&words, cnt)?;
        Ok(words)
    }

    async fn read_write_multiple_registers(
        &mut self,
        read_addr: Address,
        read_count: Quantity,
        write_addr: Address,
        write_data: &[Word],
    ) -> Result<Vec<Word>> {
        check_count(read_count, MAX_READ_WORDS)?;
        check_address_range(read_addr, read_count)?;
        let write_count = quantity_of(write_data.len())?;
        check_count(write_count, MAX_RW_WRITE_WORDS)?;
        check_address_range(write_addr, write_count)?;
        let rsp = self
            .client
            .call(Request::ReadWriteMultipleRegisters(
                read_addr,
                read_count,
                write_addr,
                write_data.to_vec(),
            ))
            .await?;
        let Response::ReadWriteMultipleRegisters(words) = rsp else {
            return Err(unexpected_response());
        };
        check_word_count(&words, read_count)?;
        Ok(words)
    }
}

#[async_trait]
impl Writer for Context {
    async fn write_single_coil(&mut self, addr: Address, coil: Coil) -> Result<()> {
        let rsp = self.client.call(Request::WriteSingleCoil(addr, coil)).await?;
        let Response::WriteSingleCoil(rsp_addr, rsp_coil) = rsp else {
            return Err(unexpected_response());
        };
        if rsp_addr != addr || rsp_coil != coil {
            return Err(unexpected_response());
        }
        Ok(())
    }

    async fn write_multiple_coils(&mut self, addr: Address, coils: &[Coil]) -> Result<()> {
        let cnt = quantity_of(coils.len())?;
        check_count(cnt, MAX_WRITE_BITS)?;
        check_address_range(addr, cnt)?;
        let rsp = self
            .client
            .call(Request::WriteMultipleCoils(addr, coils.to_vec()))
            .await?;
        let Response::WriteMultipleCoils(rsp_addr, rsp_cnt) = rsp else {
            return Err(unexpected_response());
        };
        if rsp_addr != addr || rsp_cnt != cnt {
            return Err(unexpected_response());
        }
        Ok(())
    }

    async fn write_single_register(&mut self, addr: Address, word: Word) -> Result<()> {
        let rsp = self
            .client
            .call(Request::WriteSingleRegister(addr, word))
            .await?;
        let Response::WriteSingleRegister(rsp_addr, rsp_word) = rsp else {
            return Err(unexpected_response());
        };
        if rsp_addr != addr || rsp_word != word {
            return Err(unexpected_response());
        }
        Ok(())
    }

    async fn write_multiple_registers(&mut self, addr: Address, words: &[Word]) -> Result<()> {
        let cnt = quantity_of(words.len())?;
        check_count(cnt, MAX_WRITE_WORDS)?;
        check_address_range(addr, cnt)?;
        let rsp = self
            .client
            .call(Request::WriteMultipleRegisters(addr, words.to_vec()))
            .await?;
        let Response::WriteMultipleRegisters(rsp_addr, rsp_cnt) = rsp else {
            return Err(unexpected_response());
        };
        if rsp_addr != addr || rsp_cnt != cnt {
            return Err(unexpected_response());
        }
        Ok(())
    }

    async fn masked_write_register(
        &mut self,
        addr: Address,
        and_mask: Word,
        or_mask: Word,
    ) -> Result<()> {
        let rsp = self
            .client
            .call(Request::MaskWriteRegister(addr, and_mask, or_mask))
            .await?;
        let Response::MaskWriteRegister(rsp_addr, rsp_and, rsp_or) = rsp else {
            return Err(unexpected_response());
        };
        if rsp_addr != addr || rsp_and != and_mask || rsp_or != or_mask {
            return Err(unexpected_response());
        }
        Ok(())
    }
}

fn unexpected_response() -> Error {
    Error::Decode(DecodeError::UnexpectedResponse)
}

fn check_count(cnt: Quantity, max: Quantity) -> Result<()> {
    if cnt == 0 {
        return Err(Error::InvalidArgument("quantity must not be zero"));
    }
    if cnt > max {
        return Err(Error::InvalidArgument("quantity exceeds the protocol limit"));
    }
    Ok(())
}

/// The addressed range must not run past the 16 bit address space.
fn check_address_range(addr: Address, cnt: Quantity) -> Result<()> {
    debug_assert!(cnt > 0);
    if u32::from(addr) + u32::from(cnt) > 0x1_0000 {
        return Err(Error::InvalidArgument(
            "address range exceeds the address space",
        ));
    }
    Ok(())
}

fn quantity_of(len: usize) -> Result<Quantity> {
    Quantity::try_from(len).map_err(|_| Error::InvalidArgument("too many data items"))
}

/// The wire carries whole bytes; cut the padding bits off.
fn truncate_bits(mut bits: Vec<Coil>, cnt: Quantity) -> Result<Vec<Coil>> {
    if bits.len() < usize::from(cnt) {
        return Err(Error::Decode(DecodeError::ByteCountMismatch));
    }
    bits.truncate(usize::from(cnt));
    Ok(bits)
}

fn check_word_count(words: &[Word], cnt: Quantity) -> Result<()> {
    if words.len() != usize::from(cnt) {
        return Err(Error::Decode(DecodeError::ByteCountMismatch));
    }
    Ok(())
}
