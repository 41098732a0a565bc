// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU framing for the Modbus serial line.
//!
//! RTU frames carry no length field. Frame boundaries are defined by
//! line silence: a gap of at least 3.5 character times ends a frame, a
//! gap between 1.5 and 3.5 character times invalidates it. The framer
//! therefore consumes bytes together with their arrival time and never
//! arms a timer itself; the dispatcher polls it when the line has been
//! quiet long enough.

use std::{
    io::Result,
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use tokio_util::codec::Encoder;

use crate::{error::DecodeError, frame::rtu::*, slave::SlaveId};

// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
// "The maximum size of a Modbus RTU frame is 256 bytes."
const MAX_FRAME_LEN: usize = 256;

// Unit id, at least one PDU byte and the CRC.
const MIN_FRAME_LEN: usize = 4;

/// The inter-character silence thresholds at the configured baud rate.
///
/// A character occupies 11 bit times on the line (start bit, 8 data
/// bits, parity or second stop bit, stop bit); configurations without
/// parity are treated the same for timing purposes. Above 19200 baud
/// the serial line specification fixes the thresholds instead of
/// scaling them further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CharTiming {
    pub(crate) t_1_5: Duration,
    pub(crate) t_3_5: Duration,
}

impl CharTiming {
    pub(crate) fn from_baud_rate(baud_rate: u32) -> Self {
        if baud_rate >= 19_200 {
            return Self {
                t_1_5: Duration::from_micros(750),
                t_3_5: Duration::from_micros(1_750),
            };
        }
        let char_micros = 11_000_000_u64 / u64::from(baud_rate.max(1));
        Self {
            t_1_5: Duration::from_micros(char_micros * 3 / 2),
            t_3_5: Duration::from_micros(char_micros * 7 / 2),
        }
    }
}

/// Silence-delimited RTU frame assembler.
///
/// States: idle (no buffered bytes) and receiving. A completed buffer
/// shorter than the minimal frame or failing its CRC check is reported
/// as a corrupt frame; the distinction matters because the dispatcher
/// attributes corruption to the in-flight transaction.
#[derive(Debug)]
pub(crate) struct SilenceFramer {
    timing: CharTiming,
    buf: SmallVec<[u8; MAX_FRAME_LEN]>,
    last_byte_at: Option<Instant>,
    oversized: bool,
}

impl SilenceFramer {
    pub(crate) fn new(timing: CharTiming) -> Self {
        Self {
            timing,
            buf: SmallVec::new(),
            last_byte_at: None,
            oversized: false,
        }
    }

    /// Consume bytes that arrived at `now`.
    ///
    /// May yield the preceding frame when the arrival gap shows that it
    /// was already terminated by silence.
    pub(crate) fn feed(
        &mut self,
        now: Instant,
        bytes: &[u8],
    ) -> Option<std::result::Result<(SlaveId, Bytes), DecodeError>> {
        let mut completed = None;
        if let Some(last) = self.last_byte_at {
            let gap = now.saturating_duration_since(last);
            if gap >= self.timing.t_3_5 {
                completed = self.complete();
            } else if gap >= self.timing.t_1_5 {
                log::warn!(
                    "Discarding {} byte(s) after an intra-frame gap of {gap:?}",
                    self.buf.len()
                );
                self.buf.clear();
                self.oversized = false;
            }
        }
        if bytes.is_empty() {
            return completed;
        }
        if self.buf.len() + bytes.len() > MAX_FRAME_LEN {
            self.oversized = true;
            self.buf.clear();
        } else {
            self.buf.extend_from_slice(bytes);
        }
        self.last_byte_at = Some(now);
        completed
    }

    /// Check whether the line has been silent long enough to terminate
    /// the frame under construction.
    pub(crate) fn poll_silence(
        &mut self,
        now: Instant,
    ) -> Option<std::result::Result<(SlaveId, Bytes), DecodeError>> {
        let last = self.last_byte_at?;
        if now.saturating_duration_since(last) < self.timing.t_3_5 {
            return None;
        }
        self.complete()
    }

    /// The point in time at which the current frame completes if no
    /// further byte arrives, or `None` while idle.
    pub(crate) fn silence_deadline(&self) -> Option<Instant> {
        self.last_byte_at.map(|last| last + self.timing.t_3_5)
    }

    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.last_byte_at = None;
        self.oversized = false;
    }

    fn complete(&mut self) -> Option<std::result::Result<(SlaveId, Bytes), DecodeError>> {
        self.last_byte_at = None;
        let oversized = std::mem::take(&mut self.oversized);
        let frame = std::mem::take(&mut self.buf);
        if frame.is_empty() {
            return None;
        }
        if oversized {
            return Some(Err(DecodeError::OversizedFrame));
        }
        if frame.len() < MIN_FRAME_LEN {
            return Some(Err(DecodeError::Truncated));
        }
        let (adu, crc_bytes) = frame.split_at(frame.len() - 2);
        let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let actual = calc_crc(adu);
        if expected != actual {
            return Some(Err(DecodeError::CrcMismatch { expected, actual }));
        }
        Some(Ok((adu[0], Bytes::copy_from_slice(&adu[1..]))))
    }
}

/// RTU client codec; only encoding, see [`SilenceFramer`] for inbound.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ClientCodec;

impl Encoder<RequestAdu> for ClientCodec {
    type Error = std::io::Error;

    fn encode(&mut self, adu: RequestAdu, buf: &mut BytesMut) -> Result<()> {
        let RequestAdu { hdr, pdu } = adu;
        let pdu_data: Bytes = pdu.into();
        buf.reserve(pdu_data.len() + 3);
        let start = buf.len();
        buf.put_u8(hdr.slave_id);
        buf.put_slice(&pdu_data);
        let crc = calc_crc(&buf[start..]);
        buf.put_u16_le(crc);
        Ok(())
    }
}

/// CRC-16/Modbus: polynomial 0xA001 (reversed 0x8005), initial value
/// 0xFFFF, reflected, no final xor. Transmitted low byte first.
pub(crate) fn calc_crc(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Request, RequestPdu};

    const TIMING: CharTiming = CharTiming {
        t_1_5: Duration::from_micros(750),
        t_3_5: Duration::from_micros(1_750),
    };

    const SILENCE: Duration = Duration::from_millis(2);

    #[test]
    fn crc_values() {
        let msg = [0x01, 0x03, 0x08, 0x2B, 0x00, 0x02];
        assert_eq!(calc_crc(&msg), 0x63B6);

        let msg = [0x01, 0x03, 0x04, 0x00, 0x20, 0x00, 0x00];
        assert_eq!(calc_crc(&msg), 0xF9FB);

        let msg = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(calc_crc(&msg), 0xCDC5);
    }

    #[test]
    fn crc_over_trailed_message_is_zero() {
        for msg in [
            &[0x01u8, 0x03, 0x00, 0x00, 0x00, 0x0A][..],
            &[0x11, 0x06, 0x00, 0x01, 0x00, 0x03],
            &[0xFF],
            &[],
        ] {
            let crc = calc_crc(msg);
            let mut trailed = msg.to_vec();
            trailed.extend_from_slice(&crc.to_le_bytes());
            assert_eq!(calc_crc(&trailed), 0);
        }
    }

    #[test]
    fn timing_from_baud_rate() {
        let fast = CharTiming::from_baud_rate(19_200);
        assert_eq!(fast.t_1_5, Duration::from_micros(750));
        assert_eq!(fast.t_3_5, Duration::from_micros(1_750));
        assert_eq!(CharTiming::from_baud_rate(115_200), fast);

        // 9600 baud: 11 bits per character = 1145 us
        let slow = CharTiming::from_baud_rate(9_600);
        assert_eq!(slow.t_1_5, Duration::from_micros(1_717));
        assert_eq!(slow.t_3_5, Duration::from_micros(4_007));
    }

    #[test]
    fn encode_read_request() {
        let mut codec = ClientCodec;
        let mut buf = BytesMut::new();
        let adu = RequestAdu {
            hdr: Header { slave_id: 0x01 },
            pdu: RequestPdu(Request::ReadHoldingRegisters(0x082B, 2)),
        };
        codec.encode(adu, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02, 0xB6, 0x63]
        );
    }

    #[test]
    fn decode_frame_after_silence() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        assert!(framer
            .feed(t0, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD])
            .is_none());
        assert_eq!(framer.silence_deadline(), Some(t0 + TIMING.t_3_5));
        // Not yet silent for t3.5
        assert!(framer.poll_silence(t0 + Duration::from_micros(1_000)).is_none());
        let (slave_id, pdu_data) = framer.poll_silence(t0 + SILENCE).unwrap().unwrap();
        assert_eq!(slave_id, 0x01);
        assert_eq!(&pdu_data[..], &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert!(framer.silence_deadline().is_none());
    }

    #[test]
    fn corrupt_crc_in_any_position() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        for i in 0..frame.len() {
            let mut corrupted = frame;
            corrupted[i] ^= 0x01;
            let t0 = Instant::now();
            let mut framer = SilenceFramer::new(TIMING);
            framer.feed(t0, &corrupted);
            let err = framer.poll_silence(t0 + SILENCE).unwrap().unwrap_err();
            assert!(matches!(err, DecodeError::CrcMismatch { .. }));
        }
    }

    #[test]
    fn frame_split_across_arrivals() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        // Gaps below t1.5 keep the frame intact.
        framer.feed(t0, &[0x01, 0x03, 0x00]);
        framer.feed(t0 + Duration::from_micros(500), &[0x00, 0x00, 0x0A]);
        framer.feed(t0 + Duration::from_micros(1_000), &[0xC5, 0xCD]);
        let (slave_id, pdu_data) = framer
            .poll_silence(t0 + Duration::from_micros(1_000) + SILENCE)
            .unwrap()
            .unwrap();
        assert_eq!(slave_id, 0x01);
        assert_eq!(&pdu_data[..], &[0x03, 0x00, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn intra_frame_gap_discards_partial_frame() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        // Garbage, then a gap within [t1.5, t3.5), then a valid frame.
        framer.feed(t0, &[0x42, 0x43]);
        assert!(framer
            .feed(
                t0 + Duration::from_micros(1_000),
                &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD],
            )
            .is_none());
        let (slave_id, _) = framer
            .poll_silence(t0 + Duration::from_micros(1_000) + SILENCE)
            .unwrap()
            .unwrap();
        assert_eq!(slave_id, 0x01);
    }

    #[test]
    fn inter_frame_silence_separates_frames() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        framer.feed(t0, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
        // The next arrival after >= t3.5 completes the previous frame.
        let completed = framer
            .feed(t0 + SILENCE, &[0x11, 0x06, 0x00, 0x01, 0x00, 0x03])
            .unwrap()
            .unwrap();
        assert_eq!(completed.0, 0x01);
        assert_eq!(&completed.1[..], &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        // The second frame is still being received.
        assert!(framer.silence_deadline().is_some());
    }

    #[test]
    fn short_frame_is_corrupt() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        framer.feed(t0, &[0x01, 0x83]);
        let err = framer.poll_silence(t0 + SILENCE).unwrap().unwrap_err();
        assert_eq!(err, DecodeError::Truncated);
    }

    #[test]
    fn oversized_frame_is_corrupt() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        framer.feed(t0, &[0u8; 200]);
        framer.feed(t0 + Duration::from_micros(500), &[0u8; 100]);
        let err = framer.poll_silence(t0 + SILENCE).unwrap().unwrap_err();
        assert_eq!(err, DecodeError::OversizedFrame);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let t0 = Instant::now();
        let mut framer = SilenceFramer::new(TIMING);
        framer.feed(t0, &[0x01, 0x02, 0x03]);
        framer.reset();
        assert!(framer.silence_deadline().is_none());
        assert!(framer.poll_silence(t0 + SILENCE).is_none());
    }
}
