//! # Modbus Codec
//!
//! Wire framing for the two device protocols, CRC16 and payload decoding.
//!
//! ## Framings
//!
//! | Protocol | Request | Response header | Trailer |
//! |----------|---------|-----------------|---------|
//! | RTU | `unit fc addr qty` | `unit fc byte_count` | CRC16, low byte first |
//! | TCP | `tid pid len unit fc addr qty` | `tid pid len unit fc byte_count` | none |
//!
//! Both framings wrap the same [`ModbusPdu`]; the [`Framing`] trait carries
//! the protocol-specific part (build request, parse response, validate
//! checksum) and [`DeviceFraming`] dispatches on the configured [`Protocol`].
//!
//! ## Batches
//!
//! A [`CollectionRequest`] is encoded into one wire message per block, or
//! several when a block is larger than the device's read limit. Replies are
//! decoded as a whole: any CRC, framing or exception error discards the batch.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike};
use crc::{Crc, CRC_16_MODBUS};
use half::f16;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytes::{bytes_to_regs, reg_to_u16, regs_to_bytes_4, regs_to_bytes_8, ByteOrder};
use crate::constants::{FC_WRITE_MULTIPLE_REGISTERS, MBAP_HEADER_LEN, RTU_CRC_LEN};
use crate::device_limits::DEFAULT_MAX_READ_REGISTERS;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::format_hex_packet;
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::planner::{CollectionRequest, RegisterBlock};
use crate::register_map::RegisterType;
use crate::value::{DecodedMeasurement, ModbusValue};

/// CRC16-Modbus: polynomial 0xA001 (reflected 0x8005), initial value 0xFFFF.
pub const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC16-Modbus of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC of `frame`, low byte first.
pub fn append_crc(frame: &mut BytesMut) {
    let crc = crc16(frame);
    frame.put_u16_le(crc);
}

/// Recompute the CRC over all but the trailing two bytes and compare.
pub fn verify_crc(frame: &[u8]) -> bool {
    check_crc(frame).is_ok()
}

/// Like [`verify_crc`], reporting the mismatch.
pub fn check_crc(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < RTU_CRC_LEN + 1 {
        return Err(ModbusError::protocol(format!(
            "frame too short for CRC: {} bytes",
            frame.len()
        )));
    }
    let (body, trailer) = frame.split_at(frame.len() - RTU_CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let expected = crc16(body);
    if expected != received {
        return Err(ModbusError::CrcInvalid { expected, received });
    }
    Ok(())
}

// ============================================================================
// Protocol selection
// ============================================================================

/// Device wire protocol, resolved once when a device is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtu,
    Tcp,
}

impl Protocol {
    /// Fresh framing state for one device.
    pub fn framing(self) -> DeviceFraming {
        match self {
            Protocol::Rtu => DeviceFraming::Rtu(RtuFraming),
            Protocol::Tcp => DeviceFraming::Tcp(TcpFraming::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rtu => "rtu",
            Protocol::Tcp => "tcp",
        }
    }
}

impl FromStr for Protocol {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtu" => Ok(Protocol::Rtu),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ModbusError::configuration(format!(
                "unknown device protocol '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Protocol-specific half of the codec.
pub trait Framing: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Wrap a PDU into a wire message for `unit_id`.
    fn build_request(&self, unit_id: u8, pdu: &ModbusPdu) -> Bytes;

    /// Strip header and trailer from `response`, returning its PDU.
    ///
    /// When `request` is not empty, identifiers it carries (unit id,
    /// transaction id) must be echoed by the response.
    fn parse_response<'a>(&self, request: &[u8], response: &'a [u8]) -> ModbusResult<&'a [u8]>;

    /// Check the integrity of one received frame.
    fn validate_checksum(&self, frame: &[u8]) -> ModbusResult<()>;

    /// Interpret a register map `byteorder` column for this protocol.
    fn byte_order(&self, column: &str) -> ByteOrder;

    /// Validate every reply of a batch; the first failure rejects them all.
    fn validate_batch(&self, frames: &[Bytes]) -> ModbusResult<()> {
        for (index, frame) in frames.iter().enumerate() {
            if let Err(err) = self.validate_checksum(frame) {
                debug!(
                    "Reply {} of {} rejected: {} [{}]",
                    index + 1,
                    frames.len(),
                    err,
                    format_hex_packet(frame)
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Modbus RTU framing (serial line encapsulated in UDP datagrams).
#[derive(Debug, Clone, Copy, Default)]
pub struct RtuFraming;

impl Framing for RtuFraming {
    fn protocol(&self) -> Protocol {
        Protocol::Rtu
    }

    fn build_request(&self, unit_id: u8, pdu: &ModbusPdu) -> Bytes {
        let mut frame = BytesMut::with_capacity(1 + pdu.len() + RTU_CRC_LEN);
        frame.put_u8(unit_id);
        frame.put_slice(pdu.as_slice());
        append_crc(&mut frame);
        frame.freeze()
    }

    fn parse_response<'a>(&self, request: &[u8], response: &'a [u8]) -> ModbusResult<&'a [u8]> {
        // unit + fc + at least one byte + CRC
        if response.len() < 3 + RTU_CRC_LEN {
            return Err(ModbusError::protocol(format!(
                "RTU frame too short: {} bytes",
                response.len()
            )));
        }
        self.validate_checksum(response)?;

        if let Some(&unit_id) = request.first() {
            if response[0] != unit_id {
                return Err(ModbusError::protocol(format!(
                    "unit id mismatch: sent {}, got {}",
                    unit_id, response[0]
                )));
            }
        }
        Ok(&response[1..response.len() - RTU_CRC_LEN])
    }

    fn validate_checksum(&self, frame: &[u8]) -> ModbusResult<()> {
        check_crc(frame)
    }

    fn byte_order(&self, column: &str) -> ByteOrder {
        ByteOrder::for_rtu_column(column)
    }
}

/// Modbus TCP framing with an MBAP header.
#[derive(Debug)]
pub struct TcpFraming {
    next_transaction: AtomicU16,
}

impl TcpFraming {
    pub fn new() -> Self {
        Self {
            next_transaction: AtomicU16::new(1),
        }
    }

    /// Next transaction id: increasing, wrapping, never 0.
    fn next_transaction_id(&self) -> u16 {
        loop {
            let id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// MBAP header check; returns the PDU (after the unit id).
    fn split_mbap<'a>(&self, frame: &'a [u8]) -> ModbusResult<(u16, u8, &'a [u8])> {
        if frame.len() < MBAP_HEADER_LEN + 2 {
            return Err(ModbusError::protocol(format!(
                "TCP frame too short: {} bytes",
                frame.len()
            )));
        }
        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
        let length = usize::from(u16::from_be_bytes([frame[4], frame[5]]));

        if protocol_id != 0 {
            return Err(ModbusError::protocol(format!(
                "invalid protocol id {}",
                protocol_id
            )));
        }
        let available = frame.len() - MBAP_HEADER_LEN;
        if length < 2 || length > available {
            return Err(ModbusError::protocol(format!(
                "MBAP length {} does not match {} received bytes",
                length, available
            )));
        }
        let unit_id = frame[MBAP_HEADER_LEN];
        Ok((
            transaction_id,
            unit_id,
            &frame[MBAP_HEADER_LEN + 1..MBAP_HEADER_LEN + length],
        ))
    }
}

impl Default for TcpFraming {
    fn default() -> Self {
        Self::new()
    }
}

impl Framing for TcpFraming {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn build_request(&self, unit_id: u8, pdu: &ModbusPdu) -> Bytes {
        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        frame.put_u16(self.next_transaction_id());
        frame.put_u16(0);
        frame.put_u16((pdu.len() + 1) as u16);
        frame.put_u8(unit_id);
        frame.put_slice(pdu.as_slice());
        frame.freeze()
    }

    fn parse_response<'a>(&self, request: &[u8], response: &'a [u8]) -> ModbusResult<&'a [u8]> {
        let (transaction_id, _unit_id, pdu) = self.split_mbap(response)?;
        if request.len() >= 2 {
            let sent = u16::from_be_bytes([request[0], request[1]]);
            if sent != transaction_id {
                return Err(ModbusError::protocol(format!(
                    "transaction id mismatch: sent {}, got {}",
                    sent, transaction_id
                )));
            }
        }
        Ok(pdu)
    }

    /// TCP carries no CRC; only the MBAP header is checked.
    fn validate_checksum(&self, frame: &[u8]) -> ModbusResult<()> {
        self.split_mbap(frame).map(|_| ())
    }

    fn byte_order(&self, column: &str) -> ByteOrder {
        ByteOrder::for_tcp_column(column)
    }
}

/// Framing selected by [`Protocol`].
#[derive(Debug)]
pub enum DeviceFraming {
    Rtu(RtuFraming),
    Tcp(TcpFraming),
}

impl Framing for DeviceFraming {
    fn protocol(&self) -> Protocol {
        match self {
            DeviceFraming::Rtu(f) => f.protocol(),
            DeviceFraming::Tcp(f) => f.protocol(),
        }
    }

    fn build_request(&self, unit_id: u8, pdu: &ModbusPdu) -> Bytes {
        match self {
            DeviceFraming::Rtu(f) => f.build_request(unit_id, pdu),
            DeviceFraming::Tcp(f) => f.build_request(unit_id, pdu),
        }
    }

    fn parse_response<'a>(&self, request: &[u8], response: &'a [u8]) -> ModbusResult<&'a [u8]> {
        match self {
            DeviceFraming::Rtu(f) => f.parse_response(request, response),
            DeviceFraming::Tcp(f) => f.parse_response(request, response),
        }
    }

    fn validate_checksum(&self, frame: &[u8]) -> ModbusResult<()> {
        match self {
            DeviceFraming::Rtu(f) => f.validate_checksum(frame),
            DeviceFraming::Tcp(f) => f.validate_checksum(frame),
        }
    }

    fn byte_order(&self, column: &str) -> ByteOrder {
        match self {
            DeviceFraming::Rtu(f) => f.byte_order(column),
            DeviceFraming::Tcp(f) => f.byte_order(column),
        }
    }
}

// ============================================================================
// Decoding Functions
// ============================================================================

/// Extract the register payload of a read response PDU.
///
/// Exception responses become [`ModbusError::Device`].
pub fn parse_read_payload(pdu: &[u8], function_code: u8, quantity: u16) -> ModbusResult<&[u8]> {
    let parsed = ModbusPdu::from_slice(pdu)?;
    parsed.check_exception()?;
    let fc = parsed
        .function_code()
        .ok_or_else(|| ModbusError::protocol("empty response PDU"))?;
    if fc != function_code {
        return Err(ModbusError::protocol(format!(
            "function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            function_code, fc
        )));
    }

    let expected = usize::from(quantity) * 2;
    let byte_count = pdu.get(1).copied().map(usize::from).unwrap_or(0);
    let data = pdu.get(2..).unwrap_or(&[]);
    if byte_count != expected || data.len() < expected {
        return Err(ModbusError::protocol(format!(
            "expected {} data bytes, byte count {} with {} received",
            expected,
            byte_count,
            data.len()
        )));
    }
    Ok(&data[..expected])
}

/// Decode one value of `register_type` from `registers`.
///
/// # Example
///
/// ```rust
/// use voltage_collector::{decode_register_value, ByteOrder, ModbusValue, RegisterType};
///
/// let registers = [0x1234, 0x5678];
/// let value = decode_register_value(&registers, RegisterType::Uint32, ByteOrder::BigEndian).unwrap();
/// assert_eq!(value, ModbusValue::U32(0x12345678));
/// ```
pub fn decode_register_value(
    registers: &[u16],
    register_type: RegisterType,
    byte_order: ByteOrder,
) -> ModbusResult<ModbusValue> {
    let needed = register_type
        .register_count()
        .map(usize::from)
        .unwrap_or(registers.len().clamp(1, 4));
    if registers.len() < needed {
        return Err(ModbusError::protocol(format!(
            "not enough registers for {}: {} < {}",
            register_type,
            registers.len(),
            needed
        )));
    }

    let value = match register_type {
        RegisterType::Uint8 => ModbusValue::U8(reg_to_u16(registers[0], byte_order) as u8),
        RegisterType::Int8 => ModbusValue::I8(reg_to_u16(registers[0], byte_order) as u8 as i8),
        RegisterType::Uint16 => ModbusValue::U16(reg_to_u16(registers[0], byte_order)),
        RegisterType::Int16 => ModbusValue::I16(reg_to_u16(registers[0], byte_order) as i16),
        RegisterType::Float16 => {
            ModbusValue::F16(f16::from_bits(reg_to_u16(registers[0], byte_order)))
        }
        RegisterType::Uint32 | RegisterType::Int32 | RegisterType::Float32 => {
            let bytes = regs_to_bytes_4(&[registers[0], registers[1]], byte_order);
            match register_type {
                RegisterType::Uint32 => ModbusValue::U32(u32::from_be_bytes(bytes)),
                RegisterType::Int32 => ModbusValue::I32(i32::from_be_bytes(bytes)),
                _ => ModbusValue::F32(f32::from_be_bytes(bytes)),
            }
        }
        RegisterType::Uint64 | RegisterType::Int64 | RegisterType::Float64 => {
            let regs = [registers[0], registers[1], registers[2], registers[3]];
            let bytes = regs_to_bytes_8(&regs, byte_order);
            match register_type {
                RegisterType::Uint64 => ModbusValue::U64(u64::from_be_bytes(bytes)),
                RegisterType::Int64 => ModbusValue::I64(i64::from_be_bytes(bytes)),
                _ => ModbusValue::F64(f64::from_be_bytes(bytes)),
            }
        }
        RegisterType::Bits => ModbusValue::Bits(decode_bits(&registers[..needed], byte_order)),
    };
    Ok(value)
}

/// Raw unsigned value of 1-4 registers under `byte_order`.
fn decode_bits(registers: &[u16], byte_order: ByteOrder) -> u64 {
    let words = registers.iter().map(|&r| reg_to_u16(r, byte_order));
    let reversed = matches!(
        byte_order,
        ByteOrder::LittleEndian | ByteOrder::BigEndianSwap
    );
    let fold = |acc: u64, word: u16| (acc << 16) | u64::from(word);
    if reversed {
        words.rev().fold(0, fold)
    } else {
        words.fold(0, fold)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// One wire message of an encoded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Index of the block in the collection request.
    pub block: usize,
    pub start_address: u16,
    pub quantity: u16,
    pub function_code: u8,
}

/// Wire messages for one collection request, in send order.
#[derive(Debug, Clone, Default)]
pub struct EncodedBatch {
    pub messages: Vec<Bytes>,
    pub chunks: Vec<Chunk>,
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Codec for one device: framing, unit id and read limit.
#[derive(Debug)]
pub struct ModbusCodec {
    framing: DeviceFraming,
    unit_id: u8,
    max_read_registers: u16,
}

impl ModbusCodec {
    pub fn new(protocol: Protocol, unit_id: u8) -> Self {
        Self {
            framing: protocol.framing(),
            unit_id,
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
        }
    }

    /// Set registers per message, clamped to `1..=125`.
    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count.clamp(1, DEFAULT_MAX_READ_REGISTERS);
        self
    }

    pub fn framing(&self) -> &DeviceFraming {
        &self.framing
    }

    pub fn protocol(&self) -> Protocol {
        self.framing.protocol()
    }

    /// Serialize every block, splitting blocks above the read limit.
    pub fn encode(&self, request: &CollectionRequest) -> ModbusResult<EncodedBatch> {
        let mut batch = EncodedBatch::default();

        for (index, block) in request.iter().enumerate() {
            let function_code = block.read_function.function_code();
            let mut offset: u16 = 0;
            while offset < block.size {
                let quantity = (block.size - offset).min(self.max_read_registers);
                let start_address = block.start_address.wrapping_add(offset);
                let pdu = PduBuilder::build_read_request(function_code, start_address, quantity)?;
                let message = self.framing.build_request(self.unit_id, &pdu);

                debug!(
                    "Encoded block {} chunk @{}+{}: {}",
                    index,
                    start_address,
                    quantity,
                    format_hex_packet(&message)
                );
                batch.messages.push(message);
                batch.chunks.push(Chunk {
                    block: index,
                    start_address,
                    quantity,
                    function_code,
                });
                offset += quantity;
            }
        }
        Ok(batch)
    }

    /// Decode all replies of a batch into one measurement.
    ///
    /// Replies must be in message order. Nothing is returned unless every
    /// reply decodes.
    pub fn decode(
        &self,
        request: &CollectionRequest,
        batch: &EncodedBatch,
        replies: &[Bytes],
    ) -> ModbusResult<DecodedMeasurement> {
        if replies.len() != batch.messages.len() {
            return Err(ModbusError::protocol(format!(
                "expected {} replies, got {}",
                batch.messages.len(),
                replies.len()
            )));
        }
        self.framing.validate_batch(replies)?;

        let mut payloads: Vec<Vec<u16>> = request
            .iter()
            .map(|b| Vec::with_capacity(usize::from(b.size)))
            .collect();

        for ((chunk, message), reply) in batch.chunks.iter().zip(&batch.messages).zip(replies) {
            let pdu = self.framing.parse_response(message, reply)?;
            let data = parse_read_payload(pdu, chunk.function_code, chunk.quantity)?;
            let target = payloads.get_mut(chunk.block).ok_or_else(|| {
                ModbusError::protocol(format!("chunk refers to missing block {}", chunk.block))
            })?;
            target.extend(bytes_to_regs(data));
        }

        let mut measurement = DecodedMeasurement::new();
        for (block, registers) in request.iter().zip(&payloads) {
            self.decode_block(block, registers, &mut measurement)?;
        }
        Ok(measurement)
    }

    fn decode_block(
        &self,
        block: &RegisterBlock,
        registers: &[u16],
        measurement: &mut DecodedMeasurement,
    ) -> ModbusResult<()> {
        let byte_order = self.framing.byte_order(&block.byte_order);
        let unit = usize::from(block.unit_size);

        for (index, name) in block.members.iter().enumerate() {
            let offset = block.member_offset(index);
            let slice = registers.get(offset..offset + unit).ok_or_else(|| {
                ModbusError::protocol(format!(
                    "payload of block @{} too short for '{}'",
                    block.start_address, name
                ))
            })?;
            let value = decode_register_value(slice, block.register_type, byte_order)?;
            measurement.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Write-multiple-registers frame setting the device clock.
    ///
    /// Six uint16 registers starting at `address`: year, month, day, hour,
    /// minute, second.
    pub fn build_clock_correction(&self, address: u16, at: NaiveDateTime) -> ModbusResult<Bytes> {
        let year = u16::try_from(at.year())
            .map_err(|_| ModbusError::protocol(format!("year {} out of range", at.year())))?;
        let registers = [
            year,
            at.month() as u16,
            at.day() as u16,
            at.hour() as u16,
            at.minute() as u16,
            at.second() as u16,
        ];
        let pdu = PduBuilder::build_write_multiple_registers(address, &registers)?;
        Ok(self.framing.build_request(self.unit_id, &pdu))
    }

    /// Check that `response` acknowledges the write in `request`.
    pub fn parse_write_ack(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        let sent = self.framing.parse_response(&[], request)?;
        let ack = self.framing.parse_response(request, response)?;

        let parsed = ModbusPdu::from_slice(ack)?;
        parsed.check_exception()?;
        let fc = parsed
            .function_code()
            .ok_or_else(|| ModbusError::protocol("empty write acknowledgement"))?;
        if fc != FC_WRITE_MULTIPLE_REGISTERS || ack.len() < 5 || sent.len() < 5 {
            return Err(ModbusError::protocol(format!(
                "unexpected write acknowledgement [{}]",
                format_hex_packet(ack)
            )));
        }
        // address and quantity are echoed
        if ack[1..5] != sent[1..5] {
            return Err(ModbusError::protocol(format!(
                "write acknowledgement does not echo request: [{}] vs [{}]",
                format_hex_packet(&ack[1..5]),
                format_hex_packet(&sent[1..5])
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
