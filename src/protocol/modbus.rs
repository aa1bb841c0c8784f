//! Modbus-TCP client codec.
//!
//! Requests are Modbus PDUs wrapped in an MBAP header:
//!
//! ```text
//! | transaction id (2) | protocol id (2) = 0 | length (2) | unit id (1) | function (1) | data |
//! ```
//!
//! All multi-byte fields are big endian. `length` counts the unit id, the
//! function code and the data.

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use phf::phf_map;
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::ModbusConfig,
    error::Result,
    interface::{Session, Transport},
    InstrumentError,
};

/// Length of the MBAP header, unit id included.
pub const MBAP_HEADER_LEN: usize = 7;
/// The only protocol id defined for Modbus.
pub const PROTOCOL_ID: u16 = 0x0000;
/// Maximum PDU size (function code and data).
pub const MAX_PDU_SIZE: usize = 253;

pub const MAX_READ_COILS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_COILS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Set in the echoed function code of an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// Coil values as encoded by "write single coil".
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

static EXCEPTION_NAMES: phf::Map<u8, &'static str> = phf_map! {
    0x01u8 => "illegal function",
    0x02u8 => "illegal data address",
    0x03u8 => "illegal data value",
    0x04u8 => "server device failure",
    0x05u8 => "acknowledge",
    0x06u8 => "server device busy",
    0x08u8 => "memory parity error",
    0x0Au8 => "gateway path unavailable",
    0x0Bu8 => "gateway target device failed to respond",
};

/// A human readable name for a Modbus exception code.
#[must_use]
pub fn exception_name(code: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(&code)
        .copied()
        .unwrap_or("unknown exception")
}

/// The function codes supported by [`ModbusTcp`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// The value "write single coil" sends for `on`.
#[must_use]
pub const fn coil_value(on: bool) -> u16 {
    if on {
        COIL_ON
    } else {
        COIL_OFF
    }
}

/// Pack coils 8 per byte, the first coil in bit 0 of the first byte. Unused
/// bits of the last byte are 0.
#[must_use]
pub fn pack_coils(coils: &[bool]) -> Vec<u8> {
    coils
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .filter(|(_, &on)| on)
                .fold(0u8, |byte, (bit, _)| byte | (1u8 << bit))
        })
        .collect()
}

/// Unpack `quantity` coils from `bytes`, least significant bit first.
#[must_use]
pub fn unpack_coils(bytes: &[u8], quantity: usize) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 0x01 == 0x01))
        .take(quantity)
        .collect()
}

/// Encode registers as consecutive big endian words.
#[must_use]
pub fn pack_registers(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Decode consecutive big endian words. A trailing odd byte is ignored.
#[must_use]
pub fn unpack_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect()
}

fn check_quantity(quantity: usize, max: u16) -> Result<u16> {
    match u16::try_from(quantity) {
        Ok(q) if (1..=max).contains(&q) => Ok(q),
        _ => Err(InstrumentError::InvalidArgument {
            details: format!("quantity {quantity} outside of 1..={max}"),
        }),
    }
}

fn address_and_value(address: u16, value: u16) -> [u8; 4] {
    let [a0, a1] = address.to_be_bytes();
    let [v0, v1] = value.to_be_bytes();
    [a0, a1, v0, v1]
}

fn multiple_coils_payload(address: u16, coils: &[bool]) -> Result<Vec<u8>> {
    let quantity = u16::try_from(coils.len()).map_err(|_| InstrumentError::InvalidArgument {
        details: format!("{} coils cannot be addressed", coils.len()),
    })?;
    let packed = pack_coils(coils);
    let byte_count = u8::try_from(packed.len()).map_err(|_| InstrumentError::InvalidArgument {
        details: format!("{} coils do not fit in one request", coils.len()),
    })?;

    let mut payload = Vec::with_capacity(packed.len().saturating_add(5));
    payload.extend_from_slice(&address_and_value(address, quantity));
    payload.push(byte_count);
    payload.extend_from_slice(&packed);
    Ok(payload)
}

fn multiple_registers_payload(address: u16, registers: &[u16]) -> Result<Vec<u8>> {
    let quantity =
        u16::try_from(registers.len()).map_err(|_| InstrumentError::InvalidArgument {
            details: format!("{} registers cannot be addressed", registers.len()),
        })?;
    let packed = pack_registers(registers);
    let byte_count = u8::try_from(packed.len()).map_err(|_| InstrumentError::InvalidArgument {
        details: format!("{} registers do not fit in one request", registers.len()),
    })?;

    let mut payload = Vec::with_capacity(packed.len().saturating_add(5));
    payload.extend_from_slice(&address_and_value(address, quantity));
    payload.push(byte_count);
    payload.extend_from_slice(&packed);
    Ok(payload)
}

/// Split a `byte count, data...` response body, checking the count.
fn byte_counted(data: &[u8]) -> Result<&[u8]> {
    let Some((&count, rest)) = data.split_first() else {
        return Err(InstrumentError::BadProtocol {
            details: "response is missing its byte count".to_string(),
        });
    };
    if usize::from(count) != rest.len() {
        return Err(InstrumentError::BadProtocol {
            details: format!(
                "byte count {count} does not match {} data bytes",
                rest.len()
            ),
        });
    }
    Ok(rest)
}

/// A Modbus-TCP client.
///
/// The transaction id is owned by the client: it is incremented for every
/// request that is built (wrapping from 65535 to 0) and every response must echo
/// it.
#[derive(Debug)]
pub struct ModbusTcp<T: Transport> {
    session: Session<T>,
    transaction_id: u16,
    timeout: Duration,
}

impl<T: Transport> ModbusTcp<T> {
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, &ModbusConfig::default())
    }

    #[must_use]
    pub fn with_config(transport: T, config: &ModbusConfig) -> Self {
        Self {
            session: Session::new(transport),
            transaction_id: 0,
            timeout: config.timeout(),
        }
    }

    /// The id used by the most recently built request.
    #[must_use]
    pub const fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.session.into_inner()
    }

    /// Build a complete request frame and advance the transaction id.
    ///
    /// # Errors
    /// [`InstrumentError::InvalidArgument`] if `payload` does not fit in the
    /// MBAP length field.
    pub fn build_request(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        payload: &[u8],
    ) -> Result<Bytes> {
        let length = payload
            .len()
            .checked_add(2)
            .and_then(|len| u16::try_from(len).ok())
            .ok_or_else(|| InstrumentError::InvalidArgument {
                details: format!("{} byte payload does not fit in one frame", payload.len()),
            })?;

        self.transaction_id = self.transaction_id.wrapping_add(1);

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN.saturating_add(usize::from(length)));
        frame.put_u16(self.transaction_id);
        frame.put_u16(PROTOCOL_ID);
        frame.put_u16(length);
        frame.put_u8(unit_id);
        frame.put_u8(function.code());
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Function code 0x01.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn read_coils(&mut self, unit_id: u8, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.read_bits(unit_id, FunctionCode::ReadCoils, address, quantity)
    }

    /// Function code 0x02.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn read_discrete_inputs(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        self.read_bits(unit_id, FunctionCode::ReadDiscreteInputs, address, quantity)
    }

    /// Function code 0x03.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        self.read_words(unit_id, FunctionCode::ReadHoldingRegisters, address, quantity)
    }

    /// Function code 0x04.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn read_input_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        self.read_words(unit_id, FunctionCode::ReadInputRegisters, address, quantity)
    }

    /// Function code 0x05. `on` is sent as `0xFF00`, off as `0x0000`.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn write_single_coil(&mut self, unit_id: u8, address: u16, on: bool) -> Result<()> {
        let payload = address_and_value(address, coil_value(on));
        let echo = self.transact(unit_id, FunctionCode::WriteSingleCoil, &payload)?;
        Self::check_echo(&echo, &payload)
    }

    /// Function code 0x06.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn write_single_register(&mut self, unit_id: u8, address: u16, value: u16) -> Result<()> {
        let payload = address_and_value(address, value);
        let echo = self.transact(unit_id, FunctionCode::WriteSingleRegister, &payload)?;
        Self::check_echo(&echo, &payload)
    }

    /// Function code 0x0F.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn write_multiple_coils(&mut self, unit_id: u8, address: u16, coils: &[bool]) -> Result<()> {
        check_quantity(coils.len(), MAX_WRITE_COILS)?;
        let payload = multiple_coils_payload(address, coils)?;
        let echo = self.transact(unit_id, FunctionCode::WriteMultipleCoils, &payload)?;
        Self::check_echo(&echo, &payload[..4])
    }

    /// Function code 0x10.
    ///
    /// # Errors
    /// See [`ModbusTcp::transact`].
    pub fn write_multiple_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        registers: &[u16],
    ) -> Result<()> {
        check_quantity(registers.len(), MAX_WRITE_REGISTERS)?;
        let payload = multiple_registers_payload(address, registers)?;
        let echo = self.transact(unit_id, FunctionCode::WriteMultipleRegisters, &payload)?;
        Self::check_echo(&echo, &payload[..4])
    }

    fn read_bits(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        check_quantity(usize::from(quantity), MAX_READ_COILS)?;
        let data = self.transact(unit_id, function, &address_and_value(address, quantity))?;
        let bytes = byte_counted(&data)?;
        if bytes.len() != usize::from(quantity).div_ceil(8) {
            return Err(InstrumentError::BadProtocol {
                details: format!("expected {quantity} coils, received {} bytes", bytes.len()),
            });
        }
        Ok(unpack_coils(bytes, usize::from(quantity)))
    }

    fn read_words(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        check_quantity(usize::from(quantity), MAX_READ_REGISTERS)?;
        let data = self.transact(unit_id, function, &address_and_value(address, quantity))?;
        let bytes = byte_counted(&data)?;
        if bytes.len() != usize::from(quantity).saturating_mul(2) {
            return Err(InstrumentError::BadProtocol {
                details: format!("expected {quantity} registers, received {} bytes", bytes.len()),
            });
        }
        Ok(unpack_registers(bytes))
    }

    fn check_echo(echo: &[u8], expected: &[u8]) -> Result<()> {
        if echo == expected {
            Ok(())
        } else {
            Err(InstrumentError::BadProtocol {
                details: format!("write echo {echo:02X?} does not match request {expected:02X?}"),
            })
        }
    }

    /// Send one request and return the data following the function code of the
    /// validated response.
    ///
    /// # Errors
    /// - [`InstrumentError::InvalidArgument`] if the request cannot be encoded
    /// - [`InstrumentError::Timeout`] if no complete response arrives in time
    /// - [`InstrumentError::BadProtocol`] if the transaction id, protocol id,
    ///   length, unit id or function code of the response are wrong
    /// - [`InstrumentError::DeviceError`] if the device answers with an
    ///   exception
    /// - Any error reported by the transport
    #[instrument(skip(self, payload), fields(tid))]
    pub fn transact(
        &mut self,
        unit_id: u8,
        function: FunctionCode,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let request = self.build_request(unit_id, function, payload)?;
        let tid = self.transaction_id;
        tracing::Span::current().record("tid", tid);
        trace!("request: {:02X?}", &request[..]);

        let written = self.session.write_bytes(&request)?;
        if written != request.len() {
            return Err(InstrumentError::BadIo {
                details: format!("only {written} of {} request bytes were sent", request.len()),
            });
        }

        let frame = self.read_frame()?;
        trace!("response: {frame:02X?}");
        let data = Self::check_response(&frame, tid, unit_id, function)?;
        debug!("{function:?} completed with {} data bytes", data.len());
        Ok(data)
    }

    /// Read exactly one MBAP frame: the header first, then as many bytes as
    /// its length field announces.
    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN.saturating_add(MAX_PDU_SIZE));
        self.fill(&mut frame, MBAP_HEADER_LEN, start)?;

        let length = usize::from(u16::from_be_bytes([frame[4], frame[5]]));
        if !(2..=MAX_PDU_SIZE.saturating_add(1)).contains(&length) {
            warn!("MBAP length {length} out of range");
            return Err(InstrumentError::BadProtocol {
                details: format!("MBAP length {length} out of range"),
            });
        }
        // the unit id counted by `length` is already part of the header
        self.fill(&mut frame, MBAP_HEADER_LEN.saturating_add(length).saturating_sub(1), start)?;
        Ok(frame)
    }

    fn fill(&mut self, frame: &mut Vec<u8>, len: usize, start: Instant) -> Result<()> {
        while frame.len() < len {
            if start.elapsed() > self.timeout {
                return Err(InstrumentError::Timeout {
                    details: format!(
                        "received {} of {len} expected Modbus frame bytes",
                        frame.len()
                    ),
                });
            }
            let chunk = self
                .session
                .read_bytes(len.saturating_sub(frame.len()), self.timeout)?;
            frame.extend_from_slice(&chunk);
        }
        Ok(())
    }

    fn check_response(
        frame: &[u8],
        tid: u16,
        unit_id: u8,
        function: FunctionCode,
    ) -> Result<Vec<u8>> {
        let mut buf = frame;
        let rx_tid = buf.get_u16();
        let protocol = buf.get_u16();
        let _length = buf.get_u16();
        let rx_unit = buf.get_u8();
        let rx_function = buf.get_u8();

        if rx_tid != tid {
            return Err(InstrumentError::BadProtocol {
                details: format!("transaction id {rx_tid} does not match request {tid}"),
            });
        }
        if protocol != PROTOCOL_ID {
            return Err(InstrumentError::BadProtocol {
                details: format!("unexpected protocol id {protocol}"),
            });
        }
        if rx_unit != unit_id {
            return Err(InstrumentError::BadProtocol {
                details: format!("unit id {rx_unit} does not match request {unit_id}"),
            });
        }
        if rx_function == function.code() | EXCEPTION_FLAG {
            let Some(&code) = buf.first() else {
                return Err(InstrumentError::BadProtocol {
                    details: "exception response without exception code".to_string(),
                });
            };
            warn!("{function:?} raised exception 0x{code:02X}");
            return Err(InstrumentError::DeviceError {
                code,
                details: exception_name(code).to_string(),
            });
        }
        if rx_function != function.code() {
            return Err(InstrumentError::BadProtocol {
                details: format!(
                    "function code 0x{rx_function:02X} does not match request 0x{:02X}",
                    function.code()
                ),
            });
        }
        Ok(buf.to_vec())
    }
}
