use crate::transport::{SerialTransport, SocketTransport, Transport, TransportError};
use crate::usbtmc::UsbtmcTransport;

/// USB vendor/product pairs of supported instruments.
const RIGOL_USB_IDS: [(u16, u16, &str); 2] = [
    (0x1ab1, 0x04ce, "DS1000Z/MSO1000Z"),
    (0x1ab1, 0x0588, "DS1000D/DS1000E"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigolDevice {
    pub name: String,
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl RigolDevice {
    /// A device at `bus`/`address`, if its IDs belong to a supported instrument.
    pub fn from_ids(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> Option<Self> {
        RIGOL_USB_IDS
            .iter()
            .find(|&&(vid, pid, _)| vid == vendor_id && pid == product_id)
            .map(|&(_, _, name)| Self {
                name: name.to_string(),
                bus,
                address,
                vendor_id,
                product_id,
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Unsupported resource string '{0}'")]
    InvalidResource(String),

    #[error("No Rigol instrument found. Please connect one or specify the resource manually")]
    DeviceNotFound,
}

/// Parsed VISA-style instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// `TCPIP[board]::<host>::INSTR` or `TCPIP[board]::<host>::<port>::SOCKET`.
    Tcp { host: String, port: u16 },
    /// `USB[board]::<vid>::<pid>[::<serial>]::INSTR`.
    Usb {
        vendor_id: u16,
        product_id: u16,
        serial: Option<String>,
    },
    /// `ASRL<device>::INSTR`, e.g. `ASRL/dev/ttyUSB0::INSTR` or `ASRLCOM3::INSTR`.
    Serial { port: String },
}

/// VISA USB IDs: hex with a `0x` prefix, decimal otherwise.
fn parse_usb_id(id: &str) -> Option<u16> {
    match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => id.parse().ok(),
    }
}

impl Resource {
    pub fn parse(resource: &str) -> Result<Self, ConnectorError> {
        let invalid = || ConnectorError::InvalidResource(resource.to_string());
        let parts: Vec<&str> = resource.trim().split("::").collect();
        let interface = parts.first().copied().ok_or_else(invalid)?.to_ascii_uppercase();
        let is_board = |board: &str| board.chars().all(|c| c.is_ascii_digit());

        if let Some(board) = interface.strip_prefix("TCPIP") {
            if !is_board(board) {
                return Err(invalid());
            }
            let host = parts.get(1).filter(|h| !h.is_empty()).ok_or_else(invalid)?;
            return match parts[2..] {
                [class] if class.eq_ignore_ascii_case("INSTR") => Ok(Self::Tcp {
                    host: host.to_string(),
                    port: SocketTransport::DEFAULT_PORT,
                }),
                [port, class] if class.eq_ignore_ascii_case("SOCKET") => Ok(Self::Tcp {
                    host: host.to_string(),
                    port: port.parse().map_err(|_| invalid())?,
                }),
                _ => Err(invalid()),
            };
        }

        if let Some(board) = interface.strip_prefix("USB") {
            if !is_board(board) {
                return Err(invalid());
            }
            let (vid, pid, serial) = match parts[1..] {
                [vid, pid, class] if class.eq_ignore_ascii_case("INSTR") => (vid, pid, None),
                [vid, pid, serial, class] if class.eq_ignore_ascii_case("INSTR") => {
                    (vid, pid, Some(serial.to_string()))
                }
                _ => return Err(invalid()),
            };
            return Ok(Self::Usb {
                vendor_id: parse_usb_id(vid).ok_or_else(invalid)?,
                product_id: parse_usb_id(pid).ok_or_else(invalid)?,
                serial,
            });
        }

        if interface.starts_with("ASRL") {
            // The device path is case sensitive.
            let port = &parts[0][4..];
            return match parts[1..] {
                [class] if class.eq_ignore_ascii_case("INSTR") && !port.is_empty() => {
                    Ok(Self::Serial {
                        port: port.to_string(),
                    })
                }
                _ => Err(invalid()),
            };
        }

        Err(invalid())
    }
}

pub struct RigolConnector;

impl RigolConnector {
    /// Open a transport for a resource string.
    pub fn open(resource: &str) -> Result<Box<dyn Transport>, ConnectorError> {
        match Resource::parse(resource)? {
            Resource::Tcp { host, port } => {
                log::debug!("Connecting to {} over LAN port {}", host, port);
                Ok(Box::new(SocketTransport::connect(&host, port)?))
            }
            Resource::Usb {
                vendor_id,
                product_id,
                serial,
            } => {
                log::debug!("Connecting to {:04x}:{:04x} over USBTMC", vendor_id, product_id);
                Ok(Box::new(UsbtmcTransport::open(
                    vendor_id,
                    product_id,
                    serial.as_deref(),
                )?))
            }
            Resource::Serial { port } => {
                log::debug!("Connecting to {} over serial", port);
                Ok(Box::new(SerialTransport::open(
                    &port,
                    SerialTransport::DEFAULT_BAUD_RATE,
                )?))
            }
        }
    }

    /// Open the first supported instrument found on the USB bus.
    pub fn open_first_usb() -> Result<Box<dyn Transport>, ConnectorError> {
        let device = Self::get_available_devices()?
            .into_iter()
            .next()
            .ok_or(ConnectorError::DeviceNotFound)?;
        log::debug!(
            "Connecting to {} on bus {} address {}",
            device.name,
            device.bus,
            device.address
        );
        Ok(Box::new(UsbtmcTransport::open(
            device.vendor_id,
            device.product_id,
            None,
        )?))
    }

    /// USB-attached instruments, matched by vendor and product ID.
    pub fn get_available_devices() -> Result<Vec<RigolDevice>, ConnectorError> {
        let devices = rusb::devices()?
            .iter()
            .filter_map(|device| {
                let descriptor = device.device_descriptor().ok()?;
                RigolDevice::from_ids(
                    device.bus_number(),
                    device.address(),
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                )
            })
            .collect();

        Ok(devices)
    }
}
