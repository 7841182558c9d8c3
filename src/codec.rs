// codec.rs - AMS/AoE wire format
// =========================================================================
//
// Everything on the wire is little-endian and packed. Headers are encoded
// and decoded field by field against byte slices; nothing is reinterpreted
// in place, so there are no alignment or endianness hazards.

use crate::error::{AdsError, Result};
use crate::frame::Frame;
use crate::types::{AdsNotificationAttrib, AmsAddr, AmsNetId};

/// Size of the AMS/TCP framing header.
pub const AMS_TCP_HEADER_SIZE: usize = 6;

/// Size of the AoE header that follows it.
pub const AOE_HEADER_SIZE: usize = 32;

/// ADS command ids carried in [`AoeHeader::cmd_id`].
pub mod cmd {
    pub const READ_DEVICE_INFO: u16 = 1;
    pub const READ: u16 = 2;
    pub const WRITE: u16 = 3;
    pub const READ_STATE: u16 = 4;
    pub const WRITE_CONTROL: u16 = 5;
    pub const ADD_DEVICE_NOTIFICATION: u16 = 6;
    pub const DEL_DEVICE_NOTIFICATION: u16 = 7;
    pub const DEVICE_NOTIFICATION: u16 = 8;
    pub const READ_WRITE: u16 = 9;
}

/// State flag values carried in [`AoeHeader::state_flags`].
pub mod state_flags {
    pub const AMS_REQUEST: u16 = 0x0004;
    pub const AMS_RESPONSE: u16 = 0x0005;
    pub const AMS_UDP: u16 = 0x0040;
}

// =========================================================================
// HEADERS
// =========================================================================

/// The 6-byte AMS/TCP header: a reserved word and the number of payload
/// bytes that follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsTcpHeader {
    pub length: u32,
}

impl AmsTcpHeader {
    pub fn encode(&self) -> [u8; AMS_TCP_HEADER_SIZE] {
        let mut buf = [0u8; AMS_TCP_HEADER_SIZE];
        // reserved u16 stays zero
        buf[2..6].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < AMS_TCP_HEADER_SIZE {
            return Err(AdsError::Decode("short AMS/TCP header"));
        }
        Ok(AmsTcpHeader {
            length: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }
}

/// The 32-byte AoE header addressing one AMS frame.
///
/// `length` counts the payload bytes after this header; the framing
/// invariant `length + 32 == AmsTcpHeader.length` is checked by the
/// receive loop before a frame is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AoeHeader {
    pub target: AmsAddr,
    pub source: AmsAddr,
    pub cmd_id: u16,
    pub state_flags: u16,
    pub length: u32,
    pub error_code: u32,
    pub invoke_id: u32,
}

impl AoeHeader {
    /// Header for an outbound request frame.
    pub fn request(target: AmsAddr, source: AmsAddr, cmd_id: u16, length: u32, invoke_id: u32) -> Self {
        AoeHeader {
            target,
            source,
            cmd_id,
            state_flags: state_flags::AMS_REQUEST,
            length,
            error_code: 0,
            invoke_id,
        }
    }

    pub fn encode(&self) -> [u8; AOE_HEADER_SIZE] {
        let mut buf = [0u8; AOE_HEADER_SIZE];
        buf[0..6].copy_from_slice(&self.target.net_id.0);
        buf[6..8].copy_from_slice(&self.target.port.to_le_bytes());
        buf[8..14].copy_from_slice(&self.source.net_id.0);
        buf[14..16].copy_from_slice(&self.source.port.to_le_bytes());
        buf[16..18].copy_from_slice(&self.cmd_id.to_le_bytes());
        buf[18..20].copy_from_slice(&self.state_flags.to_le_bytes());
        buf[20..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.error_code.to_le_bytes());
        buf[28..32].copy_from_slice(&self.invoke_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < AOE_HEADER_SIZE {
            return Err(AdsError::Decode("short AoE header"));
        }
        let mut target_id = [0u8; 6];
        target_id.copy_from_slice(&buf[0..6]);
        let mut source_id = [0u8; 6];
        source_id.copy_from_slice(&buf[8..14]);
        Ok(AoeHeader {
            target: AmsAddr::new(AmsNetId(target_id), u16::from_le_bytes([buf[6], buf[7]])),
            source: AmsAddr::new(AmsNetId(source_id), u16::from_le_bytes([buf[14], buf[15]])),
            cmd_id: u16::from_le_bytes([buf[16], buf[17]]),
            state_flags: u16::from_le_bytes([buf[18], buf[19]]),
            length: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            error_code: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            invoke_id: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
        })
    }
}

// =========================================================================
// REQUEST BODIES
// =========================================================================

/// `READ` body: index group, index offset, number of bytes to read.
pub fn read_request(group: u32, offset: u32, length: u32) -> Frame {
    let mut frame = Frame::new();
    frame.append(&group.to_le_bytes());
    frame.append(&offset.to_le_bytes());
    frame.append(&length.to_le_bytes());
    frame
}

/// `WRITE` body: index group, index offset, length, then the data.
pub fn write_request(group: u32, offset: u32, data: &[u8]) -> Frame {
    let mut frame = read_request(group, offset, data.len() as u32);
    frame.append(data);
    frame
}

/// `READ_WRITE` body: read length comes before write length, then the data
/// to write.
pub fn read_write_request(group: u32, offset: u32, read_length: u32, data: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.append(&group.to_le_bytes());
    frame.append(&offset.to_le_bytes());
    frame.append(&read_length.to_le_bytes());
    frame.append(&(data.len() as u32).to_le_bytes());
    frame.append(data);
    frame
}

/// `WRITE_CONTROL` body: the two target states, length, then the data.
pub fn write_control_request(ads_state: u16, dev_state: u16, data: &[u8]) -> Frame {
    let mut frame = Frame::new();
    frame.append(&ads_state.to_le_bytes());
    frame.append(&dev_state.to_le_bytes());
    frame.append(&(data.len() as u32).to_le_bytes());
    frame.append(data);
    frame
}

/// `ADD_DEVICE_NOTIFICATION` body: target variable, subscription attributes
/// and 16 reserved bytes.
pub fn add_notification_request(group: u32, offset: u32, attrib: &AdsNotificationAttrib) -> Frame {
    let mut frame = Frame::new();
    frame.append(&group.to_le_bytes());
    frame.append(&offset.to_le_bytes());
    frame.append(&attrib.length.to_le_bytes());
    frame.append(&attrib.trans_mode.to_le_bytes());
    frame.append(&attrib.max_delay.to_le_bytes());
    frame.append(&attrib.cycle_time.to_le_bytes());
    frame.append(&[0u8; 16]);
    frame
}

/// `DEL_DEVICE_NOTIFICATION` body: just the handle.
pub fn del_notification_request(handle: u32) -> Frame {
    let mut frame = Frame::new();
    frame.append(&handle.to_le_bytes());
    frame
}

// =========================================================================
// RESPONSE BODIES
// =========================================================================

/// Bounds-checked little-endian cursor over a response payload.
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BodyReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(AdsError::Decode("response body truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }
}

// =========================================================================
// NOTIFICATION STREAM
// =========================================================================

/// One decoded notification sample: the device-side handle and its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSample {
    pub handle: u32,
    pub data: Vec<u8>,
}

/// One stamp block: a timestamp shared by a run of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationStamp {
    pub timestamp: u64,
    pub samples: Vec<NotificationSample>,
}

/// Decodes a `DEVICE_NOTIFICATION` payload into its stamp blocks.
///
/// The outer `length` field may overshoot the decoded contents; decoding is
/// driven by the stamp and sample counts and trailing bytes are treated as
/// padding. Advertised sample lengths that do not fit the payload are a
/// [`AdsError::Decode`] error.
pub fn parse_notification(payload: &[u8]) -> Result<Vec<NotificationStamp>> {
    let mut reader = BodyReader::new(payload);
    let _length = reader.u32()?;
    let stamp_count = reader.u32()?;
    let mut stamps = Vec::with_capacity(stamp_count.min(64) as usize);
    for _ in 0..stamp_count {
        let timestamp = reader.u64()?;
        let sample_count = reader.u32()?;
        let mut samples = Vec::with_capacity(sample_count.min(64) as usize);
        for _ in 0..sample_count {
            let handle = reader.u32()?;
            let size = reader.u32()? as usize;
            let data = reader.bytes(size)?.to_vec();
            samples.push(NotificationSample { handle, data });
        }
        stamps.push(NotificationStamp { timestamp, samples });
    }
    Ok(stamps)
}
