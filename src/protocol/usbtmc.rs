//! USBTMC bulk message framing.
//!
//! Every bulk transfer starts with a 12 byte header:
//!
//! | byte  | content                                       |
//! |-------|-----------------------------------------------|
//! | 0     | `MsgID`                                       |
//! | 1     | `bTag`                                        |
//! | 2     | `bTagInverse` (`!bTag`)                       |
//! | 3     | reserved, `0x00`                              |
//! | 4..8  | transfer size, little endian                  |
//! | 8..12 | message specific (attributes, term char, ...) |
//!
//! The whole transfer (header, payload and zero padding) is always a multiple
//! of 4 bytes long.

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, instrument, trace, warn};

use crate::{
    config::{UsbTmcConfig, DEFAULT_BUFFER_SIZE, DEFAULT_TIMEOUT_MS},
    error::Result,
    interface::Transport,
    InstrumentError,
};

/// Size in bytes of the header of every bulk transfer.
pub const HEADER_LEN: usize = 12;

/// Bulk-OUT and bulk-IN `MsgID` values.
pub mod msg_id {
    pub const DEV_DEP_MSG_OUT: u8 = 1;
    pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
    pub const DEV_DEP_MSG_IN: u8 = 2;
    pub const VENDOR_SPECIFIC_OUT: u8 = 126;
    pub const REQUEST_VENDOR_SPECIFIC_IN: u8 = 127;
    pub const VENDOR_SPECIFIC_IN: u8 = 127;
}

/// `bmTransferAttributes` bit marking the last transfer of a message.
pub const EOM: u8 = 0x01;
/// `bmTransferAttributes` bit asking the device to stop at `TermChar`.
pub const TERM_CHAR_ENABLED: u8 = 0x02;

/// A decoded bulk transfer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_id: u8,
    pub tag: u8,
    pub transfer_size: u32,
    /// `bmTransferAttributes` (byte 8).
    pub attributes: u8,
    /// `TermChar` (byte 9), only meaningful for `REQUEST_DEV_DEP_MSG_IN`.
    pub term_char: u8,
}

impl Header {
    /// Write the 12 header bytes to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.msg_id);
        buf.put_u8(self.tag);
        buf.put_u8(!self.tag);
        buf.put_u8(0x00);
        buf.put_u32_le(self.transfer_size);
        buf.put_u8(self.attributes);
        buf.put_u8(self.term_char);
        buf.put_u16(0x0000);
    }

    /// Parse the header at the start of `packet`.
    ///
    /// # Errors
    /// [`InstrumentError::BadProtocol`] if the packet is shorter than a header,
    /// the tag and its inverse disagree, or the reserved byte is set.
    pub fn decode(mut packet: &[u8]) -> Result<Self> {
        if packet.len() < HEADER_LEN {
            return Err(InstrumentError::BadProtocol {
                details: format!(
                    "received {} bytes, shorter than a {HEADER_LEN} byte USBTMC header",
                    packet.len()
                ),
            });
        }
        let msg_id = packet.get_u8();
        let tag = packet.get_u8();
        let tag_inverse = packet.get_u8();
        let reserved = packet.get_u8();
        let transfer_size = packet.get_u32_le();
        let attributes = packet.get_u8();
        let term_char = packet.get_u8();

        if tag_inverse != !tag {
            return Err(InstrumentError::BadProtocol {
                details: format!(
                    "bTag 0x{tag:02X} does not match bTagInverse 0x{tag_inverse:02X}"
                ),
            });
        }
        if reserved != 0 {
            return Err(InstrumentError::BadProtocol {
                details: format!("reserved header byte is 0x{reserved:02X}"),
            });
        }

        Ok(Self {
            msg_id,
            tag,
            transfer_size,
            attributes,
            term_char,
        })
    }

    /// Build a complete transfer: this header, `payload` and zero padding up to
    /// the next multiple of 4.
    #[must_use]
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let len = padded_len(HEADER_LEN.saturating_add(payload.len()));
        let mut buf = BytesMut::with_capacity(len);
        self.encode(&mut buf);
        buf.put_slice(payload);
        buf.resize(len, 0x00);
        buf.freeze()
    }
}

/// `len` rounded up to the next multiple of 4.
#[must_use]
pub const fn padded_len(len: usize) -> usize {
    len.next_multiple_of(4)
}

/// A USBTMC framer on top of the bulk endpoints of a USB device.
///
/// The framer owns the `bTag` sequence. Tags run from 1 to 255 and wrap back
/// to 1, skipping 0. The tag only advances once a response has been received
/// and validated, so a rejected response leaves the sequence untouched.
#[derive(Debug)]
pub struct UsbTmc<T: Transport> {
    transport: T,
    tag: u8,
    term_char: Option<u8>,
    buffer_size: usize,
    timeout: Duration,
}

impl<T: Transport> UsbTmc<T> {
    #[must_use]
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            tag: 1,
            term_char: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    #[must_use]
    pub fn with_config(transport: T, config: &UsbTmcConfig) -> Self {
        Self {
            transport,
            tag: 1,
            term_char: config.term_char,
            buffer_size: config.buffer_size.max(1),
            timeout: config.timeout(),
        }
    }

    /// The tag the next exchange will use.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        self.tag
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask the device to end responses at `term_char`, or stop asking with `None`.
    pub fn set_term_char(&mut self, term_char: Option<u8>) {
        self.term_char = term_char;
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn advance_tag(&mut self) {
        self.tag = self.tag.checked_add(1).unwrap_or(1);
    }

    const fn header(&self, msg_id: u8, transfer_size: u32, attributes: u8, term_char: u8) -> Header {
        Header {
            msg_id,
            tag: self.tag,
            transfer_size,
            attributes,
            term_char,
        }
    }

    fn transfer_size(len: usize) -> Result<u32> {
        u32::try_from(len).map_err(|_| InstrumentError::InvalidArgument {
            details: format!("{len} bytes do not fit in a single USBTMC transfer"),
        })
    }

    /// Send `data` as one `DEV_DEP_MSG_OUT` transfer with EOM set.
    ///
    /// # Returns
    /// The number of bytes (header and padding included) accepted by the
    /// transport.
    ///
    /// # Errors
    /// Any error reported by the transport.
    #[instrument(skip(self, data), fields(tag = self.tag, len = data.len()))]
    pub fn send_message(&mut self, data: &[u8]) -> Result<usize> {
        let header = self.header(msg_id::DEV_DEP_MSG_OUT, Self::transfer_size(data.len())?, EOM, 0);
        let frame = header.frame(data);
        trace!("DEV_DEP_MSG_OUT: {:02X?}", &frame[..]);
        self.transport.write_raw(&frame)
    }

    /// Request a device dependent message and read it back, reassembling it
    /// from as many packets as the device needs.
    ///
    /// An empty result means the device did not answer within `timeout`.
    ///
    /// # Errors
    /// - [`InstrumentError::BadProtocol`] if the response has the wrong `MsgID`
    ///   or tag
    /// - [`InstrumentError::BadIo`] if the announced transfer exceeds `max_len`
    /// - [`InstrumentError::Timeout`] if the rest of an announced transfer does
    ///   not arrive within `timeout`
    /// - Any error reported by the transport
    #[instrument(skip(self), fields(tag = self.tag))]
    pub fn receive_message(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.receive(
            msg_id::REQUEST_DEV_DEP_MSG_IN,
            msg_id::DEV_DEP_MSG_IN,
            self.term_char,
            max_len,
            timeout,
        )
    }

    /// [`UsbTmc::receive_message`] bounded by the configured timeout.
    ///
    /// # Errors
    /// The same as [`UsbTmc::receive_message`].
    pub fn read_message(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.receive_message(max_len, self.timeout)
    }

    /// Send `text` as one `VENDOR_SPECIFIC_OUT` transfer.
    ///
    /// # Errors
    /// Any error reported by the transport.
    #[instrument(skip(self), fields(tag = self.tag))]
    pub fn send_vendor_specific(&mut self, text: &str) -> Result<usize> {
        let header = self.header(
            msg_id::VENDOR_SPECIFIC_OUT,
            Self::transfer_size(text.len())?,
            0x00,
            0x00,
        );
        let frame = header.frame(text.as_bytes());
        trace!("VENDOR_SPECIFIC_OUT: {:02X?}", &frame[..]);
        self.transport.write_raw(&frame)
    }

    /// Request a vendor specific message and read it back as text.
    ///
    /// # Errors
    /// The same as [`UsbTmc::receive_message`].
    #[instrument(skip(self), fields(tag = self.tag))]
    pub fn receive_vendor_specific(&mut self, timeout: Duration) -> Result<String> {
        let payload = self.receive(
            msg_id::REQUEST_VENDOR_SPECIFIC_IN,
            msg_id::VENDOR_SPECIFIC_IN,
            None,
            self.buffer_size,
            timeout,
        )?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    fn receive(
        &mut self,
        request_id: u8,
        response_id: u8,
        term_char: Option<u8>,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let start = Instant::now();

        let (attributes, term_char) = term_char.map_or((0x00, 0x00), |c| (TERM_CHAR_ENABLED, c));
        let announced = u32::try_from(self.buffer_size).unwrap_or(u32::MAX);
        let request = self.header(request_id, announced, attributes, term_char).frame(&[]);
        trace!("request 0x{request_id:02X}: {:02X?}", &request[..]);
        self.transport.write_raw(&request)?;

        let mut packet = vec![0u8; padded_len(HEADER_LEN.saturating_add(self.buffer_size))];
        let len = self.transport.read_raw(&mut packet, timeout)?;
        if len == 0 {
            debug!("no response to request 0x{request_id:02X}");
            return Ok(Vec::new());
        }
        let len = len.min(packet.len());

        let header = Header::decode(&packet[..len]).inspect_err(|e| warn!("{e}"))?;
        self.check_header(&header, response_id)?;

        let expected = usize::try_from(header.transfer_size).unwrap_or(usize::MAX);
        debug!(
            "MsgID 0x{:02X}, bTag 0x{:02X}, TransferSize {expected}",
            header.msg_id, header.tag
        );
        if expected > max_len {
            return Err(InstrumentError::BadIo {
                details: format!(
                    "buffer of {max_len} bytes is too small for a {expected} byte transfer"
                ),
            });
        }

        let mut payload = Vec::with_capacity(expected);
        payload.extend_from_slice(&packet[HEADER_LEN..len]);
        while payload.len() < expected {
            if start.elapsed() > timeout {
                return Err(InstrumentError::Timeout {
                    details: format!(
                        "received {} of {expected} announced bytes",
                        payload.len()
                    ),
                });
            }
            let len = self.transport.read_raw(&mut packet, timeout)?;
            payload.extend_from_slice(&packet[..len.min(packet.len())]);
        }
        // drop alignment padding
        payload.truncate(expected);
        trace!("received {} bytes: {:02X?}", payload.len(), payload);

        self.advance_tag();
        Ok(payload)
    }

    fn check_header(&self, header: &Header, response_id: u8) -> Result<()> {
        if header.msg_id != response_id {
            warn!(
                "wrong MsgID: expected 0x{response_id:02X}, received 0x{:02X}",
                header.msg_id
            );
            return Err(InstrumentError::BadProtocol {
                details: format!(
                    "wrong MsgID: expected 0x{response_id:02X}, received 0x{:02X}",
                    header.msg_id
                ),
            });
        }
        if header.tag != self.tag {
            warn!(
                "wrong bTag: expected 0x{:02X}, received 0x{:02X}",
                self.tag, header.tag
            );
            return Err(InstrumentError::BadProtocol {
                details: format!(
                    "wrong bTag/bTagInverse: expected 0x{:02X}/0x{:02X}, received 0x{:02X}/0x{:02X}",
                    self.tag, !self.tag, header.tag, !header.tag
                ),
            });
        }
        Ok(())
    }
}

/// Device dependent messages as a raw [`Transport`], so a
/// [`crate::interface::Session`] can run text exchanges over USBTMC.
impl<T: Transport> Transport for UsbTmc<T> {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let written = self.send_message(data)?;
        Ok(written.saturating_sub(HEADER_LEN).min(data.len()))
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let message = self.receive_message(buf.len(), timeout)?;
        buf[..message.len()].copy_from_slice(&message);
        Ok(message.len())
    }
}
