// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw-byte peer stubs shared by the integration tests.
//!
//! The stubs deliberately speak bytes assembled by hand instead of
//! reusing the library codecs, so the tests pin the wire format
//! independently.

#![allow(dead_code)]

use anyhow::ensure;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Read one MBAP frame and return (transaction id, unit id, PDU).
pub async fn read_mbap_frame<T>(io: &mut T) -> anyhow::Result<(u16, u8, Vec<u8>)>
where
    T: AsyncRead + Unpin,
{
    let mut header = [0u8; 7];
    io.read_exact(&mut header).await?;
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    ensure!(protocol_id == 0, "unexpected protocol id {protocol_id}");
    let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    ensure!(len >= 2, "unexpected MBAP length {len}");
    let unit_id = header[6];
    let mut pdu = vec![0u8; len - 1];
    io.read_exact(&mut pdu).await?;
    Ok((transaction_id, unit_id, pdu))
}

/// Frame and send one PDU over MBAP.
pub async fn write_mbap_frame<T>(
    io: &mut T,
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> anyhow::Result<()>
where
    T: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&u16::try_from(pdu.len() + 1)?.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    io.write_all(&frame).await?;
    Ok(())
}

/// CRC-16/Modbus as used for RTU frame trailers.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Assemble an RTU frame: slave id, PDU, CRC (little endian).
pub fn rtu_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Read one RTU frame of known total length and return (slave id, PDU)
/// after checking the CRC.
pub async fn read_rtu_frame<T>(io: &mut T, frame_len: usize) -> anyhow::Result<(u8, Vec<u8>)>
where
    T: AsyncRead + Unpin,
{
    ensure!(frame_len >= 4);
    let mut frame = vec![0u8; frame_len];
    io.read_exact(&mut frame).await?;
    let (adu, crc_bytes) = frame.split_at(frame_len - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    ensure!(crc16(adu) == expected, "CRC mismatch in request frame");
    Ok((adu[0], adu[1..].to_vec()))
}
