//! Modbus codec, RTU and TCP framings
//!
//! Register types map to the standard function codes: coils (FC 01/05),
//! discrete inputs (FC 02), holding registers (FC 03/06/16) and input
//! registers (FC 04). An exception response still proves the device is
//! alive; exception code 2 (illegal data address) settles the addressed
//! registers as permanently unsupported, every other code is a transient
//! protocol fault.
//!
//! The event mechanism uses the vendor extension function 0x46: subcommand
//! 0x18 arms event reporting for the device's sporadic registers, 0x10
//! drains the device-side event queue.

use std::sync::atomic::{AtomicU16, Ordering};

use crc::{Crc, CRC_16_MODBUS};

use super::{EventRecord, FrameChecker, ProtocolCodec};
use crate::core::device::Device;
use crate::core::register::{raw_from_words, words_from_raw, Register, SporadicMode};
use crate::core::scheduler::ReadRange;
use crate::error::TransactionError;

pub const REG_COIL: u8 = 1;
pub const REG_DISCRETE: u8 = 2;
pub const REG_HOLDING: u8 = 3;
pub const REG_INPUT: u8 = 4;

const FN_WRITE_SINGLE_COIL: u8 = 0x05;
const FN_WRITE_SINGLE_REGISTER: u8 = 0x06;
const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
const FN_EVENTS: u8 = 0x46;
const EVENTS_SUB_POLL: u8 = 0x10;
const EVENTS_SUB_ENABLE: u8 = 0x18;
const EVENT_RECORD_LEN: usize = 5;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus CRC-16 over a frame body, appended little-endian on the wire.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Wire framing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusMode {
    /// CRC-terminated frames on a serial line.
    Rtu,
    /// MBAP-prefixed frames on a TCP stream.
    Tcp,
}

#[derive(Debug)]
pub struct ModbusCodec {
    mode: ModbusMode,
    transaction_id: AtomicU16,
}

impl ModbusCodec {
    pub fn new(mode: ModbusMode) -> Self {
        Self {
            mode,
            transaction_id: AtomicU16::new(0),
        }
    }

    fn is_bit_type(reg_type: u8) -> bool {
        reg_type == REG_COIL || reg_type == REG_DISCRETE
    }

    /// Frame a PDU for the wire.
    fn wrap(&self, slave: u8, pdu: &[u8]) -> Vec<u8> {
        match self.mode {
            ModbusMode::Rtu => {
                let mut frame = Vec::with_capacity(pdu.len() + 3);
                frame.push(slave);
                frame.extend_from_slice(pdu);
                let crc = crc16(&frame);
                frame.extend_from_slice(&crc.to_le_bytes());
                frame
            }
            ModbusMode::Tcp => {
                let txn = self.transaction_id.fetch_add(1, Ordering::Relaxed);
                let len = (pdu.len() + 1) as u16;
                let mut frame = Vec::with_capacity(pdu.len() + 7);
                frame.extend_from_slice(&txn.to_be_bytes());
                frame.extend_from_slice(&0u16.to_be_bytes());
                frame.extend_from_slice(&len.to_be_bytes());
                frame.push(slave);
                frame.extend_from_slice(pdu);
                frame
            }
        }
    }

    /// Strip and verify the framing, returning the PDU.
    fn unwrap<'a>(&self, slave: u8, frame: &'a [u8]) -> Result<&'a [u8], TransactionError> {
        match self.mode {
            ModbusMode::Rtu => {
                if frame.len() < 4 {
                    return Err(TransactionError::protocol(format!(
                        "short rtu frame: {} bytes",
                        frame.len()
                    )));
                }
                let (body, tail) = frame.split_at(frame.len() - 2);
                let expected = crc16(body);
                let received = u16::from_le_bytes([tail[0], tail[1]]);
                if expected != received {
                    return Err(TransactionError::protocol(format!(
                        "crc mismatch: expected {expected:#06x}, got {received:#06x}"
                    )));
                }
                if body[0] != slave {
                    return Err(TransactionError::protocol(format!(
                        "response from slave {}, expected {slave}",
                        body[0]
                    )));
                }
                Ok(&body[1..])
            }
            ModbusMode::Tcp => {
                if frame.len() < 8 {
                    return Err(TransactionError::protocol(format!(
                        "short mbap frame: {} bytes",
                        frame.len()
                    )));
                }
                let proto = u16::from_be_bytes([frame[2], frame[3]]);
                if proto != 0 {
                    return Err(TransactionError::protocol(format!(
                        "unexpected mbap protocol id {proto}"
                    )));
                }
                let len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
                if frame.len() < 6 + len {
                    return Err(TransactionError::protocol("truncated mbap frame"));
                }
                if frame[6] != slave {
                    return Err(TransactionError::protocol(format!(
                        "response from unit {}, expected {slave}",
                        frame[6]
                    )));
                }
                Ok(&frame[7..6 + len])
            }
        }
    }
}

/// Check the PDU function byte, turning exceptions into errors.
fn check_function(pdu: &[u8], function: u8) -> Result<(), TransactionError> {
    if pdu.is_empty() {
        return Err(TransactionError::protocol("empty pdu"));
    }
    if pdu[0] == function | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return if code == 0x02 {
            Err(TransactionError::permanent(
                "device reports illegal data address",
            ))
        } else {
            Err(TransactionError::protocol(format!(
                "modbus exception {code} for function {function:#04x}"
            )))
        };
    }
    if pdu[0] != function {
        return Err(TransactionError::protocol(format!(
            "unexpected function {:#04x}, expected {function:#04x}",
            pdu[0]
        )));
    }
    Ok(())
}

impl ProtocolCodec for ModbusCodec {
    fn name(&self) -> &str {
        match self.mode {
            ModbusMode::Rtu => "modbus_rtu",
            ModbusMode::Tcp => "modbus_tcp",
        }
    }

    fn max_frame_len(&self) -> usize {
        match self.mode {
            ModbusMode::Rtu => 256,
            ModbusMode::Tcp => 260,
        }
    }

    fn reg_type_from_str(&self, name: &str) -> Option<u8> {
        match name {
            "coil" => Some(REG_COIL),
            "discrete" => Some(REG_DISCRETE),
            "holding" => Some(REG_HOLDING),
            "input" => Some(REG_INPUT),
            _ => None,
        }
    }

    fn validate_register(
        &self,
        _reg_type: u8,
        address: u32,
        width_words: u8,
    ) -> Result<(), String> {
        // Addresses ride in a 16-bit PDU field; the whole value must fit.
        if u64::from(address) + u64::from(width_words) > 0x1_0000 {
            return Err(format!(
                "address {address} with {width_words} word(s) does not fit the 16-bit address space"
            ));
        }
        Ok(())
    }

    fn max_read_count(&self, reg_type: u8) -> usize {
        if Self::is_bit_type(reg_type) {
            0x7D0
        } else {
            0x7D
        }
    }

    fn encode_read_request(
        &self,
        device: &Device,
        range: &ReadRange,
    ) -> Result<Vec<u8>, TransactionError> {
        if range.count == 0 || range.count as usize > self.max_read_count(range.reg_type) {
            return Err(TransactionError::protocol(format!(
                "invalid read count {}",
                range.count
            )));
        }
        if !(REG_COIL..=REG_INPUT).contains(&range.reg_type) {
            return Err(TransactionError::protocol(format!(
                "unknown register type {}",
                range.reg_type
            )));
        }
        let start = range.start as u16;
        let count = range.count as u16;
        let pdu = [
            range.reg_type,
            (start >> 8) as u8,
            start as u8,
            (count >> 8) as u8,
            count as u8,
        ];
        Ok(self.wrap(device.slave_id(), &pdu))
    }

    fn decode_read_response(
        &self,
        device: &Device,
        range: &ReadRange,
        frame: &[u8],
    ) -> Result<Vec<u64>, TransactionError> {
        let pdu = self.unwrap(device.slave_id(), frame)?;
        check_function(pdu, range.reg_type)?;
        if pdu.len() < 2 {
            return Err(TransactionError::protocol("truncated read response"));
        }
        let byte_count = pdu[1] as usize;
        let data = &pdu[2..];
        if data.len() < byte_count {
            return Err(TransactionError::protocol(format!(
                "read response carries {} bytes, header says {byte_count}",
                data.len()
            )));
        }
        let data = &data[..byte_count];

        if Self::is_bit_type(range.reg_type) {
            let expected = (range.count as usize).div_ceil(8);
            if byte_count != expected {
                return Err(TransactionError::protocol(format!(
                    "expected {expected} bit bytes, got {byte_count}"
                )));
            }
            range
                .registers
                .iter()
                .map(|reg| {
                    let bit = (reg.key().address - range.start) as usize;
                    Ok(u64::from((data[bit / 8] >> (bit % 8)) & 1))
                })
                .collect()
        } else {
            let expected = range.count as usize * 2;
            if byte_count != expected {
                return Err(TransactionError::protocol(format!(
                    "expected {expected} data bytes, got {byte_count}"
                )));
            }
            let words: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            range
                .registers
                .iter()
                .map(|reg| {
                    let off = (reg.key().address - range.start) as usize;
                    let width = usize::from(reg.format().width_words());
                    let slice = words.get(off..off + width).ok_or_else(|| {
                        TransactionError::protocol(format!(
                            "register {} outside response window",
                            reg.key()
                        ))
                    })?;
                    Ok(raw_from_words(slice, reg.word_order()))
                })
                .collect()
        }
    }

    fn encode_write_request(
        &self,
        device: &Device,
        register: &Register,
        raw: u64,
    ) -> Result<Vec<u8>, TransactionError> {
        let key = register.key();
        let addr = key.address as u16;
        let pdu = match key.reg_type {
            REG_COIL => {
                let value: u16 = if raw != 0 { 0xFF00 } else { 0x0000 };
                vec![
                    FN_WRITE_SINGLE_COIL,
                    (addr >> 8) as u8,
                    addr as u8,
                    (value >> 8) as u8,
                    value as u8,
                ]
            }
            REG_HOLDING => {
                let width = register.format().width_words();
                if width == 1 {
                    let value = raw as u16;
                    vec![
                        FN_WRITE_SINGLE_REGISTER,
                        (addr >> 8) as u8,
                        addr as u8,
                        (value >> 8) as u8,
                        value as u8,
                    ]
                } else {
                    let words = words_from_raw(raw, width, register.word_order());
                    let count = words.len() as u16;
                    let mut pdu = vec![
                        FN_WRITE_MULTIPLE_REGISTERS,
                        (addr >> 8) as u8,
                        addr as u8,
                        (count >> 8) as u8,
                        count as u8,
                        (count * 2) as u8,
                    ];
                    for w in words {
                        pdu.extend_from_slice(&w.to_be_bytes());
                    }
                    pdu
                }
            }
            other => {
                return Err(TransactionError::protocol(format!(
                    "register type {other} is read-only"
                )))
            }
        };
        Ok(self.wrap(device.slave_id(), &pdu))
    }

    fn decode_write_response(
        &self,
        device: &Device,
        register: &Register,
        frame: &[u8],
    ) -> Result<(), TransactionError> {
        let pdu = self.unwrap(device.slave_id(), frame)?;
        let function = match register.key().reg_type {
            REG_COIL => FN_WRITE_SINGLE_COIL,
            _ if register.format().width_words() == 1 => FN_WRITE_SINGLE_REGISTER,
            _ => FN_WRITE_MULTIPLE_REGISTERS,
        };
        check_function(pdu, function)
    }

    fn supports_events(&self) -> bool {
        self.mode == ModbusMode::Rtu
    }

    fn encode_enable_events(&self, device: &Device) -> Result<Vec<u8>, TransactionError> {
        let mut payload = Vec::new();
        for reg in device.registers() {
            if reg.sporadic() == SporadicMode::Disabled {
                continue;
            }
            let key = reg.key();
            let addr = key.address as u16;
            payload.extend_from_slice(&[
                key.reg_type,
                (addr >> 8) as u8,
                addr as u8,
                reg.format().width_words(),
                1,
            ]);
        }
        if payload.is_empty() {
            return Err(TransactionError::protocol(
                "device has no event-capable registers",
            ));
        }
        let mut pdu = vec![FN_EVENTS, EVENTS_SUB_ENABLE, payload.len() as u8];
        pdu.extend_from_slice(&payload);
        Ok(self.wrap(device.slave_id(), &pdu))
    }

    fn decode_enable_events_response(
        &self,
        device: &Device,
        frame: &[u8],
    ) -> Result<(), TransactionError> {
        let pdu = self.unwrap(device.slave_id(), frame)?;
        check_function(pdu, FN_EVENTS)?;
        if pdu.get(2) != Some(&EVENTS_SUB_ENABLE) {
            return Err(TransactionError::protocol("malformed enable-events ack"));
        }
        Ok(())
    }

    fn encode_events_poll(&self, device: &Device) -> Result<Vec<u8>, TransactionError> {
        // Bound the response so it fits one RTU frame.
        let pdu = [FN_EVENTS, EVENTS_SUB_POLL, 0xF8];
        Ok(self.wrap(device.slave_id(), &pdu))
    }

    fn decode_events_response(
        &self,
        device: &Device,
        frame: &[u8],
    ) -> Result<Vec<EventRecord>, TransactionError> {
        let pdu = self.unwrap(device.slave_id(), frame)?;
        check_function(pdu, FN_EVENTS)?;
        if pdu.len() < 2 {
            return Err(TransactionError::protocol("truncated events response"));
        }
        let len = pdu[1] as usize;
        let payload = &pdu[2..];
        if payload.len() < len || len % EVENT_RECORD_LEN != 0 {
            return Err(TransactionError::protocol(format!(
                "malformed events payload of {len} bytes"
            )));
        }
        Ok(payload[..len]
            .chunks_exact(EVENT_RECORD_LEN)
            .map(|rec| EventRecord {
                reg_type: rec[0],
                address: u32::from(u16::from_be_bytes([rec[1], rec[2]])),
                raw: u64::from(u16::from_be_bytes([rec[3], rec[4]])),
            })
            .collect())
    }

    fn response_complete(&self, request: &[u8]) -> Option<FrameChecker> {
        match self.mode {
            ModbusMode::Rtu => {
                let function = *request.get(1)?;
                Some(Box::new(move |frame| rtu_frame_complete(frame, function)))
            }
            ModbusMode::Tcp => Some(Box::new(tcp_frame_complete)),
        }
    }
}

fn rtu_frame_complete(frame: &[u8], function: u8) -> bool {
    if frame.len() < 3 {
        return false;
    }
    if frame[1] == function | 0x80 {
        return frame.len() >= 5;
    }
    match frame[1] {
        // Responses carrying a byte count at offset 2.
        0x01..=0x04 | FN_EVENTS => frame.len() >= 3 + frame[2] as usize + 2,
        FN_WRITE_SINGLE_COIL | FN_WRITE_SINGLE_REGISTER | FN_WRITE_MULTIPLE_REGISTERS => {
            frame.len() >= 8
        }
        _ => false,
    }
}

fn tcp_frame_complete(frame: &[u8]) -> bool {
    if frame.len() < 6 {
        return false;
    }
    let len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    frame.len() >= 6 + len
}
