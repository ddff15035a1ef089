//! USB/IP wire protocol
//!
//! The framing follows the Linux kernel convention
//! (drivers/usb/usbip/usbip_common.h): all integers big-endian, a setup
//! phase of OP_* packets, then 48-byte URB headers with command-specific
//! payloads. One deviation from the stock usbipd: `OP_REQ_IMPORT` may block
//! on the exporter until the requested bus id is bound, instead of
//! answering `ST_NA`.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::UsbIpError;

pub const USBIP_VERSION: u16 = 0x0111;

pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;
pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;

/// Operation succeeded.
pub const ST_OK: u32 = 0;
/// Operation failed / device not available.
pub const ST_NA: u32 = 1;

pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
pub const USBIP_RET_UNLINK: u32 = 0x0004;

pub const USBIP_DIR_OUT: u32 = 0;
pub const USBIP_DIR_IN: u32 = 1;

const BUSID_LEN: usize = 32;
const PATH_LEN: usize = 256;
const ISO_DESC_LEN: usize = 16;

/// USB device speed codes as used on the wire and in sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown,
    Low,
    Full,
    High,
    Wireless,
    Super,
}

impl DeviceSpeed {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            _ => Self::Unknown,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Wireless => 4,
            Self::Super => 5,
        }
    }

    /// Map the content of a sysfs `speed` file ("480", "5000", ...).
    pub fn from_sysfs(s: &str) -> Self {
        match s.trim() {
            "1.5" => Self::Low,
            "12" => Self::Full,
            "480" => Self::High,
            "53.3-480" => Self::Wireless,
            "5000" => Self::Super,
            _ => Self::Unknown,
        }
    }

    /// SuperSpeed devices attach to the upper VHCI port range.
    pub fn is_super(self) -> bool {
        matches!(self, Self::Super)
    }
}

fn encode_fixed<const N: usize>(s: &str) -> Result<[u8; N], UsbIpError> {
    let bytes = s.as_bytes();
    if bytes.len() > N {
        return Err(UsbIpError::BusIdTooLong(s.to_owned()));
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn decode_fixed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Setup-phase packet header: version, op code, status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub const SIZE: usize = 8;

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, UsbIpError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf).await?;
        let mut cur = Cursor::new(&buf[..]);
        let version = ReadBytesExt::read_u16::<BigEndian>(&mut cur)?;
        if version != USBIP_VERSION {
            return Err(UsbIpError::BadVersion(version));
        }
        let code = ReadBytesExt::read_u16::<BigEndian>(&mut cur)?;
        let status = ReadBytesExt::read_u32::<BigEndian>(&mut cur)?;
        Ok(Self { code, status })
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = Vec::with_capacity(Self::SIZE);
        WriteBytesExt::write_u16::<BigEndian>(&mut buf, USBIP_VERSION).expect("vec write");
        WriteBytesExt::write_u16::<BigEndian>(&mut buf, self.code).expect("vec write");
        WriteBytesExt::write_u32::<BigEndian>(&mut buf, self.status).expect("vec write");
        buf.try_into().expect("op header size")
    }
}

/// The `usbip_usb_device` descriptor used by OP_REP_IMPORT and
/// OP_REP_DEVLIST, filled from sysfs attributes on the exporting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl UsbDevice {
    pub const SIZE: usize = PATH_LEN + BUSID_LEN + 3 * 4 + 3 * 2 + 6;

    /// Kernel device id: bus number in the upper 16 bits, device number in
    /// the lower.
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }

    pub fn speed_class(&self) -> DeviceSpeed {
        DeviceSpeed::from_code(self.speed)
    }

    pub fn write_bytes(&self, buf: &mut Vec<u8>) -> Result<(), UsbIpError> {
        buf.extend_from_slice(&encode_fixed::<PATH_LEN>(&self.path)?);
        buf.extend_from_slice(&encode_fixed::<BUSID_LEN>(&self.busid)?);
        WriteBytesExt::write_u32::<BigEndian>(&mut *buf, self.busnum)?;
        WriteBytesExt::write_u32::<BigEndian>(&mut *buf, self.devnum)?;
        WriteBytesExt::write_u32::<BigEndian>(&mut *buf, self.speed)?;
        WriteBytesExt::write_u16::<BigEndian>(&mut *buf, self.id_vendor)?;
        WriteBytesExt::write_u16::<BigEndian>(&mut *buf, self.id_product)?;
        WriteBytesExt::write_u16::<BigEndian>(&mut *buf, self.bcd_device)?;
        buf.push(self.device_class);
        buf.push(self.device_subclass);
        buf.push(self.device_protocol);
        buf.push(self.configuration_value);
        buf.push(self.num_configurations);
        buf.push(self.num_interfaces);
        Ok(())
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, UsbIpError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; Self::SIZE];
        reader.read_exact(&mut buf).await?;
        let path = decode_fixed(&buf[..PATH_LEN]);
        let busid = decode_fixed(&buf[PATH_LEN..PATH_LEN + BUSID_LEN]);
        let mut cur = Cursor::new(&buf[PATH_LEN + BUSID_LEN..]);
        Ok(Self {
            path,
            busid,
            busnum: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
            devnum: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
            speed: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
            id_vendor: ReadBytesExt::read_u16::<BigEndian>(&mut cur)?,
            id_product: ReadBytesExt::read_u16::<BigEndian>(&mut cur)?,
            bcd_device: ReadBytesExt::read_u16::<BigEndian>(&mut cur)?,
            device_class: ReadBytesExt::read_u8(&mut cur)?,
            device_subclass: ReadBytesExt::read_u8(&mut cur)?,
            device_protocol: ReadBytesExt::read_u8(&mut cur)?,
            configuration_value: ReadBytesExt::read_u8(&mut cur)?,
            num_configurations: ReadBytesExt::read_u8(&mut cur)?,
            num_interfaces: ReadBytesExt::read_u8(&mut cur)?,
        })
    }
}

/// Per-interface entry in OP_REP_DEVLIST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbInterface {
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

/// Send `OP_REQ_IMPORT <busid>` (client side).
pub async fn write_import_request<W>(writer: &mut W, busid: &str) -> Result<(), UsbIpError>
where
    W: AsyncWrite + Unpin,
{
    let header = OpHeader {
        code: OP_REQ_IMPORT,
        status: ST_OK,
    };
    let mut buf = Vec::with_capacity(OpHeader::SIZE + BUSID_LEN);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&encode_fixed::<BUSID_LEN>(busid)?);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the bus id of an `OP_REQ_IMPORT` whose header was already consumed.
pub async fn read_import_busid<R>(reader: &mut R) -> Result<String, UsbIpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; BUSID_LEN];
    reader.read_exact(&mut buf).await?;
    Ok(decode_fixed(&buf))
}

/// Send a successful `OP_REP_IMPORT` with the device descriptor.
pub async fn write_import_reply<W>(writer: &mut W, device: &UsbDevice) -> Result<(), UsbIpError>
where
    W: AsyncWrite + Unpin,
{
    let header = OpHeader {
        code: OP_REP_IMPORT,
        status: ST_OK,
    };
    let mut buf = Vec::with_capacity(OpHeader::SIZE + UsbDevice::SIZE);
    buf.extend_from_slice(&header.to_bytes());
    device.write_bytes(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Send a failed `OP_REP_IMPORT`.
pub async fn write_import_error<W>(writer: &mut W) -> Result<(), UsbIpError>
where
    W: AsyncWrite + Unpin,
{
    let header = OpHeader {
        code: OP_REP_IMPORT,
        status: ST_NA,
    };
    writer.write_all(&header.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an `OP_REP_IMPORT` (client side). A non-zero status means the
/// exporter refused the import.
pub async fn read_import_reply<R>(reader: &mut R) -> Result<UsbDevice, UsbIpError>
where
    R: AsyncRead + Unpin,
{
    let header = OpHeader::read_from(reader).await?;
    if header.code != OP_REP_IMPORT {
        return Err(UsbIpError::UnexpectedOpcode(header.code));
    }
    if header.status != ST_OK {
        return Err(UsbIpError::ImportRefused);
    }
    UsbDevice::read_from(reader).await
}

/// Send `OP_REP_DEVLIST` for the given devices.
pub async fn write_devlist_reply<W>(
    writer: &mut W,
    devices: &[(UsbDevice, Vec<UsbInterface>)],
) -> Result<(), UsbIpError>
where
    W: AsyncWrite + Unpin,
{
    let header = OpHeader {
        code: OP_REP_DEVLIST,
        status: ST_OK,
    };
    let mut buf = Vec::new();
    buf.extend_from_slice(&header.to_bytes());
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, devices.len() as u32)?;
    for (device, interfaces) in devices {
        device.write_bytes(&mut buf)?;
        for iface in interfaces {
            buf.push(iface.interface_class);
            buf.push(iface.interface_subclass);
            buf.push(iface.interface_protocol);
            buf.push(0); // padding
        }
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// 48-byte URB frame header: 20 bytes of routing information followed by a
/// 28-byte command-specific section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

pub const URB_HEADER_SIZE: usize = 48;

/// The command-specific section of a URB frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbBody {
    CmdSubmit(CmdSubmit),
    RetSubmit(RetSubmit),
    CmdUnlink { unlink_seqnum: u32 },
    RetUnlink { status: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
}

impl CmdSubmit {
    /// Bytes following the header: OUT data plus ISO descriptors.
    pub fn payload_len(&self, direction: u32) -> usize {
        let data = if direction == USBIP_DIR_OUT {
            self.transfer_buffer_length.max(0) as usize
        } else {
            0
        };
        data + iso_desc_bytes(self.number_of_packets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl RetSubmit {
    /// Bytes following the header: IN data plus ISO descriptors. The reply
    /// header carries no direction; callers pass the direction recorded
    /// from the matching submit.
    pub fn payload_len(&self, direction: u32) -> usize {
        let data = if direction == USBIP_DIR_IN {
            self.actual_length.max(0) as usize
        } else {
            0
        };
        data + iso_desc_bytes(self.number_of_packets)
    }
}

fn iso_desc_bytes(number_of_packets: i32) -> usize {
    // 0xffffffff marks "not an ISO transfer" in unlink replies.
    if number_of_packets > 0 {
        number_of_packets as usize * ISO_DESC_LEN
    } else {
        0
    }
}

/// Read one URB frame header plus its command-specific section.
pub async fn read_urb_header<R>(reader: &mut R) -> Result<(UrbHeader, UrbBody), UsbIpError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; URB_HEADER_SIZE];
    reader.read_exact(&mut buf).await?;
    let mut cur = Cursor::new(&buf[..]);

    let header = UrbHeader {
        command: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
        seqnum: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
        devid: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
        direction: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
        ep: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
    };

    let body = match header.command {
        USBIP_CMD_SUBMIT => {
            let transfer_flags = ReadBytesExt::read_u32::<BigEndian>(&mut cur)?;
            let transfer_buffer_length = ReadBytesExt::read_i32::<BigEndian>(&mut cur)?;
            let start_frame = ReadBytesExt::read_i32::<BigEndian>(&mut cur)?;
            let number_of_packets = ReadBytesExt::read_i32::<BigEndian>(&mut cur)?;
            let interval = ReadBytesExt::read_i32::<BigEndian>(&mut cur)?;
            let mut setup = [0u8; 8];
            std::io::Read::read_exact(&mut cur, &mut setup)?;
            UrbBody::CmdSubmit(CmdSubmit {
                transfer_flags,
                transfer_buffer_length,
                start_frame,
                number_of_packets,
                interval,
                setup,
            })
        }
        USBIP_RET_SUBMIT => UrbBody::RetSubmit(RetSubmit {
            status: ReadBytesExt::read_i32::<BigEndian>(&mut cur)?,
            actual_length: ReadBytesExt::read_i32::<BigEndian>(&mut cur)?,
            start_frame: ReadBytesExt::read_i32::<BigEndian>(&mut cur)?,
            number_of_packets: ReadBytesExt::read_i32::<BigEndian>(&mut cur)?,
            error_count: ReadBytesExt::read_i32::<BigEndian>(&mut cur)?,
        }),
        USBIP_CMD_UNLINK => UrbBody::CmdUnlink {
            unlink_seqnum: ReadBytesExt::read_u32::<BigEndian>(&mut cur)?,
        },
        USBIP_RET_UNLINK => UrbBody::RetUnlink {
            status: ReadBytesExt::read_i32::<BigEndian>(&mut cur)?,
        },
        other => return Err(UsbIpError::UnexpectedCommand(other)),
    };

    Ok((header, body))
}

/// Write one URB frame: header, command section, padding, payload.
pub async fn write_urb<W>(
    writer: &mut W,
    header: &UrbHeader,
    body: &UrbBody,
    payload: &[u8],
) -> Result<(), UsbIpError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(URB_HEADER_SIZE + payload.len());
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, header.command)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, header.seqnum)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, header.devid)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, header.direction)?;
    WriteBytesExt::write_u32::<BigEndian>(&mut buf, header.ep)?;

    match body {
        UrbBody::CmdSubmit(cmd) => {
            WriteBytesExt::write_u32::<BigEndian>(&mut buf, cmd.transfer_flags)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, cmd.transfer_buffer_length)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, cmd.start_frame)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, cmd.number_of_packets)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, cmd.interval)?;
            buf.extend_from_slice(&cmd.setup);
        }
        UrbBody::RetSubmit(ret) => {
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, ret.status)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, ret.actual_length)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, ret.start_frame)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, ret.number_of_packets)?;
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, ret.error_count)?;
            buf.extend_from_slice(&[0u8; 8]);
        }
        UrbBody::CmdUnlink { unlink_seqnum } => {
            WriteBytesExt::write_u32::<BigEndian>(&mut buf, *unlink_seqnum)?;
            buf.extend_from_slice(&[0u8; 24]);
        }
        UrbBody::RetUnlink { status } => {
            WriteBytesExt::write_i32::<BigEndian>(&mut buf, *status)?;
            buf.extend_from_slice(&[0u8; 24]);
        }
    }
    debug_assert_eq!(buf.len(), URB_HEADER_SIZE);

    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
