use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::flags;
use super::{NtlmError, NtlmVersion, NTLM_SIGNATURE};

const AV_EOL: u16 = 0x00;
const AV_TIMESTAMP: u16 = 0x07;

/// How strings are encoded in the Type3 message, chosen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Oem,
    Unicode,
}

/// Decoded NTLM challenge (Type2) message.
#[derive(Debug, Clone)]
pub struct Type2Message {
    pub raw: Vec<u8>,
    pub flags: u32,
    pub encoding: Encoding,
    pub version: NtlmVersion,
    pub challenge: [u8; 8],
    pub target_name: String,
    /// Raw AV pair block, empty when the server sent none.
    pub target_info: Vec<u8>,
    /// `MsvAvTimestamp` as sent by the server.
    pub server_timestamp: Option<[u8; 8]>,
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, NtlmError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(NtlmError::Truncated)
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, NtlmError> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(NtlmError::Truncated)
}

/// Slice described by the security buffer at `pos` (length, allocated, offset).
fn security_buffer(buf: &[u8], pos: usize) -> Result<&[u8], NtlmError> {
    let len = read_u16(buf, pos)? as usize;
    let offset = read_u32(buf, pos + 4)? as usize;
    if len == 0 {
        return Ok(&[]);
    }
    if offset < 32 || offset + len > buf.len() {
        return Err(NtlmError::BadType2);
    }
    Ok(&buf[offset..offset + len])
}

fn decode_string(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Oem => bytes.iter().map(|&b| b as char).collect(),
        Encoding::Unicode => {
            let units: Vec<u16> =
                bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
            String::from_utf16_lossy(&units)
        }
    }
}

impl Type2Message {
    pub fn parse(buf: &[u8]) -> Result<Self, NtlmError> {
        if buf.len() < 32 {
            return Err(NtlmError::Truncated);
        }
        if &buf[..8] != NTLM_SIGNATURE {
            return Err(NtlmError::InvalidSignature);
        }
        let msg_type = read_u32(buf, 8)?;
        if msg_type != 2 {
            return Err(NtlmError::UnexpectedMessageType(msg_type));
        }

        let negotiated = read_u32(buf, 20)?;
        let encoding =
            if negotiated & flags::NEGOTIATE_OEM != 0 { Encoding::Oem } else { Encoding::Unicode };
        let version =
            if negotiated & flags::NEGOTIATE_NTLM2_KEY != 0 { NtlmVersion::V2 } else { NtlmVersion::V1 };

        let mut challenge = [0u8; 8];
        challenge.copy_from_slice(&buf[24..32]);

        let target_name = decode_string(security_buffer(buf, 12)?, encoding);

        let mut target_info = Vec::new();
        let mut server_timestamp = None;
        if negotiated & flags::NEGOTIATE_TARGET_INFO != 0 {
            target_info = security_buffer(buf, 40)?.to_vec();
            server_timestamp = find_timestamp(&target_info)?;
        }

        Ok(Self {
            raw: buf.to_vec(),
            flags: negotiated,
            encoding,
            version,
            challenge,
            target_name,
            target_info,
            server_timestamp,
        })
    }
}

fn find_timestamp(info: &[u8]) -> Result<Option<[u8; 8]>, NtlmError> {
    let mut pos = 0;
    while pos + 4 <= info.len() {
        let av_id = read_u16(info, pos)?;
        let av_len = read_u16(info, pos + 2)? as usize;
        pos += 4;
        if av_id == AV_EOL {
            break;
        }
        let value = info.get(pos..pos + av_len).ok_or(NtlmError::BadType2)?;
        if av_id == AV_TIMESTAMP && av_len == 8 {
            let mut ts = [0u8; 8];
            ts.copy_from_slice(value);
            return Ok(Some(ts));
        }
        pos += av_len;
    }
    Ok(None)
}

/// Decode the Type2 message carried in a `WWW-Authenticate` value, with or
/// without the leading `NTLM ` scheme.
pub fn decode_type2_message(header: &str) -> Result<Type2Message, NtlmError> {
    let token = match header.strip_prefix("NTLM ") {
        Some(rest) => rest.split(|c: char| c == ',' || c.is_whitespace()).next().unwrap_or(rest),
        None => header.trim(),
    };
    let raw = STANDARD.decode(token)?;
    Type2Message::parse(&raw)
}
