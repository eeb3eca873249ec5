//! USB test-and-measurement class (USBTMC) bulk transport.
//!
//! DS1000Z/MSO1000Z instruments expose SCPI on interface 0 with bulk-OUT
//! endpoint 3 and bulk-IN endpoint 1. Every bulk transfer starts with a
//! 12 byte header; a query's answer is fetched by sending a
//! `REQUEST_DEV_DEP_MSG_IN` and reading `DEV_DEP_MSG_IN` transfers until one
//! carries the end-of-message flag.

use crate::transport::{Transport, TransportError};
use rusb::{DeviceHandle, GlobalContext};
use std::time::Duration;

const HEADER_LEN: usize = 12;

mod msg_id {
    pub const DEV_DEP_MSG_OUT: u8 = 1;
    pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
    pub const DEV_DEP_MSG_IN: u8 = 2;
}

/// `bmTransferAttributes` bit marking the last transfer of a message.
const END_OF_MESSAGE: u8 = 0x01;

const TERM_CHAR: u8 = b'\n';

fn bulk_header(msg_id: u8, tag: u8, transfer_size: u32, attributes: u8) -> [u8; HEADER_LEN] {
    let size = transfer_size.to_le_bytes();
    [
        msg_id, tag, !tag, 0x00, size[0], size[1], size[2], size[3], attributes, 0x00, 0x00, 0x00,
    ]
}

/// `DEV_DEP_MSG_OUT` transfer carrying `data`, padded to a 4 byte boundary.
fn encode_message_out(tag: u8, data: &[u8]) -> Vec<u8> {
    let mut transfer =
        bulk_header(msg_id::DEV_DEP_MSG_OUT, tag, data.len() as u32, END_OF_MESSAGE).to_vec();
    transfer.extend_from_slice(data);
    transfer.resize(transfer.len().next_multiple_of(4), 0x00);
    transfer
}

fn encode_request_in(tag: u8, max_len: u32) -> [u8; HEADER_LEN] {
    bulk_header(msg_id::REQUEST_DEV_DEP_MSG_IN, tag, max_len, 0x00)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InHeader {
    tag: u8,
    transfer_size: usize,
    end_of_message: bool,
}

fn decode_in_header(data: &[u8]) -> Result<InHeader, TransportError> {
    let Some(header) = data.get(..HEADER_LEN) else {
        return Err(TransportError::Protocol(format!(
            "USBTMC header needs {} bytes, got {}",
            HEADER_LEN,
            data.len()
        )));
    };
    if header[0] != msg_id::DEV_DEP_MSG_IN || header[2] != !header[1] {
        return Err(TransportError::Protocol(format!(
            "unexpected USBTMC header {:02x?}",
            header
        )));
    }
    Ok(InHeader {
        tag: header[1],
        transfer_size: u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize,
        end_of_message: header[8] & END_OF_MESSAGE != 0,
    })
}

/// bTag runs 1..=255; zero is reserved.
fn next_tag(tag: u8) -> u8 {
    tag.checked_add(1).unwrap_or(1)
}

fn usb_error(error: rusb::Error, timeout: Duration) -> TransportError {
    match error {
        rusb::Error::Timeout => TransportError::Timeout(timeout),
        other => TransportError::Usb(other),
    }
}

/// SCPI over USBTMC bulk endpoints, the interface behind `USB::<vid>::<pid>::INSTR`.
pub struct UsbtmcTransport {
    handle: DeviceHandle<GlobalContext>,
    tag: u8,
    timeout: Duration,
}

impl UsbtmcTransport {
    pub const INTERFACE: u8 = 0;
    pub const BULK_OUT: u8 = 0x03;
    pub const BULK_IN: u8 = 0x81;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
    const TRANSFER_SIZE: u32 = 64 * 1024;

    /// Open the first device with `vendor_id:product_id`, optionally matching
    /// its serial number string.
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        serial: Option<&str>,
    ) -> Result<Self, TransportError> {
        for device in rusb::devices()?.iter() {
            let descriptor = device.device_descriptor()?;
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }
            let handle = device.open()?;
            if let Some(serial) = serial {
                let found = handle
                    .read_serial_number_string_ascii(&descriptor)
                    .unwrap_or_default();
                if !found.eq_ignore_ascii_case(serial) {
                    log::debug!("Skipping {:04x}:{:04x} with serial {}", vendor_id, product_id, found);
                    continue;
                }
            }
            log::debug!(
                "Opening USBTMC device {:04x}:{:04x} on bus {} address {}",
                vendor_id,
                product_id,
                device.bus_number(),
                device.address()
            );
            return Self::from_handle(handle);
        }
        Err(TransportError::Usb(rusb::Error::NoDevice))
    }

    pub fn from_handle(mut handle: DeviceHandle<GlobalContext>) -> Result<Self, TransportError> {
        // Linux binds the usbtmc kernel driver to the interface.
        if rusb::supports_detach_kernel_driver() {
            handle.set_auto_detach_kernel_driver(true)?;
        }
        handle.claim_interface(Self::INTERFACE)?;

        Ok(Self {
            handle,
            tag: 0,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    fn advance_tag(&mut self) -> u8 {
        self.tag = next_tag(self.tag);
        self.tag
    }

    fn read_bulk(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        match self.handle.read_bulk(Self::BULK_IN, buffer, self.timeout) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(usb_error(e, self.timeout)),
        }
    }

    /// Request and read one `DEV_DEP_MSG_IN` transfer.
    fn read_transfer(&mut self) -> Result<(InHeader, Vec<u8>), TransportError> {
        let tag = self.advance_tag();
        self.handle
            .write_bulk(
                Self::BULK_OUT,
                &encode_request_in(tag, Self::TRANSFER_SIZE),
                self.timeout,
            )
            .map_err(|e| usb_error(e, self.timeout))?;

        let mut buffer = vec![0u8; HEADER_LEN + Self::TRANSFER_SIZE as usize + 3];
        let mut received = 0;
        while received < HEADER_LEN {
            received += self.read_bulk(&mut buffer[received..])?;
        }

        let header = decode_in_header(&buffer[..received])?;
        if header.tag != tag {
            return Err(TransportError::Protocol(format!(
                "USBTMC answer tagged {} for request {}",
                header.tag, tag
            )));
        }
        let end = HEADER_LEN + header.transfer_size;
        if end > buffer.len() {
            return Err(TransportError::Protocol(format!(
                "USBTMC transfer of {} bytes exceeds the {} requested",
                header.transfer_size,
                Self::TRANSFER_SIZE
            )));
        }
        while received < end {
            received += self.read_bulk(&mut buffer[received..])?;
        }

        Ok((header, buffer[HEADER_LEN..end].to_vec()))
    }
}

impl std::fmt::Debug for UsbtmcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let device = self.handle.device();
        f.debug_struct("UsbtmcTransport")
            .field("bus", &device.bus_number())
            .field("address", &device.address())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Transport for UsbtmcTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut message = data.to_vec();
        message.push(TERM_CHAR);

        let tag = self.advance_tag();
        let transfer = encode_message_out(tag, &message);
        let written = self
            .handle
            .write_bulk(Self::BULK_OUT, &transfer, self.timeout)
            .map_err(|e| usb_error(e, self.timeout))?;

        Ok(written.saturating_sub(HEADER_LEN).min(data.len()))
    }

    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let mut response = Vec::new();
        loop {
            let (header, data) = self.read_transfer()?;
            response.extend_from_slice(&data);
            if header.end_of_message {
                break;
            }
        }

        log::trace!("Read {} byte USBTMC message", response.len());
        response.truncate(max_bytes);
        Ok(response)
    }
}

impl Drop for UsbtmcTransport {
    fn drop(&mut self) {
        log::debug!("Releasing USBTMC interface");
        let _ = self.handle.release_interface(Self::INTERFACE);
    }
}
