use arrayvec::ArrayVec;
use thiserror::Error;

/// Largest payload a peer may declare before the connection is dropped.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Largest possible server header: 2 fixed bytes + 8 bytes of extended length.
pub const MAX_HEADER_LEN: usize = 10;

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: {available} bytes available")]
    Truncated { available: usize },
    #[error("frame declares {0} payload bytes")]
    TooLarge(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(bits: u8) -> Self {
        match bits & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(bits) => bits & 0x0F,
        }
    }
}

/// A decoded frame. `payload` is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    pub payload: Vec<u8>,
}

/// XORs `payload` in place with the rotating 4-byte key.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Builds the FIN|text header for a payload of `len` bytes, picking the
/// shortest length form. The 64-bit form always writes all 8 bytes.
pub fn encode_header(len: usize, mask_flag: bool) -> ArrayVec<u8, MAX_HEADER_LEN> {
    let mut header = ArrayVec::new();
    let mask_flag = if mask_flag { MASK_BIT } else { 0 };

    header.push(FIN | Opcode::Text.as_u8());

    if len <= 125 {
        header.push(mask_flag | len as u8);
    } else if len <= u16::MAX as usize {
        header.push(mask_flag | LEN_16);
        header.extend((len as u16).to_be_bytes());
    } else {
        header.push(mask_flag | LEN_64);
        header.extend((len as u64).to_be_bytes());
    }

    header
}

/// Encodes a server -> client text frame. Servers never mask.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let header = encode_header(payload.len(), false);
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    frame
}

pub fn encode_text(text: &str) -> Vec<u8> {
    encode(text.as_bytes())
}

/// Encodes a client -> server text frame masked with `mask_key`.
pub fn encode_masked(payload: &[u8], mask_key: [u8; 4]) -> Vec<u8> {
    let header = encode_header(payload.len(), true);
    let mut frame = Vec::with_capacity(header.len() + 4 + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&mask_key);

    let offset = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[offset..], mask_key);
    frame
}

/// Decodes one frame from the start of `buf`.
///
/// Returns `Ok(Some((bytes_consumed, frame)))` once a whole frame is buffered
/// and `Ok(None)` while more bytes are needed. Oversized declarations are an
/// error so the caller can stop buffering.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(usize, Frame)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first_byte = buf[0];
    let second_byte = buf[1];

    let fin = first_byte & FIN != 0;
    let opcode = Opcode::from_u8(first_byte);
    let masked = second_byte & MASK_BIT != 0;

    let mut header_len = 2;
    let payload_len = match second_byte & 0x7F {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            header_len += 2;
            u16::from_be_bytes([buf[2], buf[3]]) as u64
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&buf[2..10]);
            header_len += 8;
            u64::from_be_bytes(len_bytes)
        }
        short => short as u64,
    };

    if payload_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload_len));
    }

    let mask = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    // Bounded by MAX_FRAME_LEN above, so this fits in usize.
    let total_len = header_len + payload_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let mut payload = buf[header_len..total_len].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        total_len,
        Frame {
            fin,
            opcode,
            mask,
            payload_len,
            payload,
        },
    )))
}

/// Decodes a single complete frame and returns its unmasked payload.
pub fn decode(buf: &[u8]) -> Result<Vec<u8>, FrameError> {
    match decode_frame(buf)? {
        Some((_, frame)) => Ok(frame.payload),
        None => Err(FrameError::Truncated {
            available: buf.len(),
        }),
    }
}
