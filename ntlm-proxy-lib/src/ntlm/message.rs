use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::flags;
use super::hash;
use super::type2::{Encoding, Type2Message};
use super::{NtlmVersion, NTLM_SIGNATURE};

const TYPE1_PAYLOAD_OFFSET: usize = 40;
const TYPE3_PAYLOAD_OFFSET: usize = 72;
const MIC_OFFSET: usize = 72;
const MIC_LEN: usize = 16;

/// Encoded NTLM message, ready to be sent in an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmMessage {
    raw: Vec<u8>,
}

impl NtlmMessage {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// `NTLM <base64>` header value.
    pub fn header(&self) -> String {
        format!("NTLM {}", STANDARD.encode(&self.raw))
    }
}

/// Workstation name reported when none is configured: the upper-cased OS hostname.
pub fn default_workstation() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.to_uppercase())
        .unwrap_or_default()
}

/// Windows 10.0 build 18362, NTLM revision 15.
fn write_version(buf: &mut [u8], pos: usize) {
    buf[pos] = 10;
    buf[pos + 1] = 0;
    buf[pos + 2..pos + 4].copy_from_slice(&18362u16.to_le_bytes());
    buf[pos + 4..pos + 8].copy_from_slice(&0x0f00_0000u32.to_le_bytes());
}

fn write_security_buffer(buf: &mut [u8], pos: usize, len: usize, offset: usize) {
    let len = len as u16;
    buf[pos..pos + 2].copy_from_slice(&len.to_le_bytes());
    buf[pos + 2..pos + 4].copy_from_slice(&len.to_le_bytes());
    buf[pos + 4..pos + 8].copy_from_slice(&(offset as u32).to_le_bytes());
}

/// Append `data` to the payload and point the security buffer at `pos` to it.
fn append_field(buf: &mut Vec<u8>, pos: usize, data: &[u8]) {
    let offset = buf.len();
    write_security_buffer(buf, pos, data.len(), offset);
    buf.extend_from_slice(data);
}

/// Build the negotiate message. `domain` and `workstation` are sent as OEM
/// strings and may be empty.
pub fn create_type1_message(version: NtlmVersion, workstation: &str, domain: &str) -> NtlmMessage {
    let domain = hash::to_oem(domain);
    let workstation = hash::to_oem(workstation);

    let mut negotiate =
        flags::NEGOTIATE_OEM | flags::NEGOTIATE_ALWAYS_SIGN | flags::NEGOTIATE_VERSION;
    negotiate |= match version {
        NtlmVersion::V1 => flags::NEGOTIATE_NTLM_KEY | flags::NEGOTIATE_LM_KEY,
        NtlmVersion::V2 => flags::NEGOTIATE_NTLM2_KEY,
    };
    if !domain.is_empty() {
        negotiate |= flags::NEGOTIATE_DOMAIN_SUPPLIED;
    }
    if !workstation.is_empty() {
        negotiate |= flags::NEGOTIATE_WORKSTATION_SUPPLIED;
    }

    let mut buf = vec![0u8; TYPE1_PAYLOAD_OFFSET];
    buf[..8].copy_from_slice(NTLM_SIGNATURE);
    buf[8..12].copy_from_slice(&1u32.to_le_bytes());
    buf[12..16].copy_from_slice(&negotiate.to_le_bytes());
    write_security_buffer(&mut buf, 16, domain.len(), TYPE1_PAYLOAD_OFFSET);
    write_security_buffer(&mut buf, 24, workstation.len(), TYPE1_PAYLOAD_OFFSET + domain.len());
    write_version(&mut buf, 32);
    buf.extend_from_slice(&domain);
    buf.extend_from_slice(&workstation);
    NtlmMessage::new(buf)
}

/// Credentials and optional fixed values used to build a Type3 message.
///
/// `client_nonce` and `timestamp` are generated when absent; they exist so the
/// output can be reproduced.
#[derive(Debug, Clone, Default)]
pub struct Type3Input<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub workstation: &'a str,
    /// Empty means the target name announced in the challenge.
    pub domain: &'a str,
    pub client_nonce: Option<[u8; 8]>,
    pub timestamp: Option<[u8; 8]>,
}

fn encode(s: &str, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Oem => hash::to_oem(s),
        Encoding::Unicode => hash::to_utf16le(s),
    }
}

/// Build the authenticate message answering `type2`.
///
/// The NTLM version follows the challenge: NTLMv2 when the server negotiated
/// extended session security, NTLMv1 otherwise. When the server sent a
/// timestamp the message carries a MIC over all three messages.
pub fn create_type3_message(type1: &NtlmMessage, type2: &Type2Message, input: &Type3Input<'_>) -> NtlmMessage {
    let target = if input.domain.is_empty() { type2.target_name.as_str() } else { input.domain };

    let target_bytes = encode(target, type2.encoding);
    let user_bytes = encode(input.username, type2.encoding);
    let workstation_bytes = encode(input.workstation, type2.encoding);

    let with_mic = type2.version == NtlmVersion::V2 && type2.server_timestamp.is_some();
    let mut data_pos = TYPE3_PAYLOAD_OFFSET;
    if with_mic {
        data_pos += MIC_LEN;
    }

    let nt_hash = hash::nt_hash(input.password);
    let (lm_response, nt_response, v2_hash) = match type2.version {
        NtlmVersion::V2 => {
            let nonce = input.client_nonce.unwrap_or_else(hash::client_nonce);
            let timestamp = match type2.server_timestamp {
                Some(ts) => ts,
                None => input.timestamp.unwrap_or_else(hash::timestamp_now),
            };
            let v2_hash = hash::ntlmv2_hash(&nt_hash, input.username, target);
            let lm = if type2.server_timestamp.is_some() {
                vec![0u8; 24]
            } else {
                hash::lmv2_response(&v2_hash, &type2.challenge, &nonce).to_vec()
            };
            let nt = hash::ntlmv2_response(
                &v2_hash,
                &type2.challenge,
                &nonce,
                &timestamp,
                &type2.target_info,
                with_mic,
            );
            (lm, nt, Some(v2_hash))
        }
        NtlmVersion::V1 => {
            let lm = hash::des_response(&type2.challenge, &hash::lm_hash(input.password));
            let nt = hash::des_response(&type2.challenge, &nt_hash);
            (lm.to_vec(), nt.to_vec(), None)
        }
    };

    let mut buf = vec![0u8; data_pos];
    buf[..8].copy_from_slice(NTLM_SIGNATURE);
    buf[8..12].copy_from_slice(&3u32.to_le_bytes());

    // strings first, then the responses
    append_field(&mut buf, 28, &target_bytes);
    append_field(&mut buf, 36, &user_bytes);
    append_field(&mut buf, 44, &workstation_bytes);
    append_field(&mut buf, 12, &lm_response);
    append_field(&mut buf, 20, &nt_response);
    // empty session key
    append_field(&mut buf, 52, &[]);

    buf[60..64].copy_from_slice(&type2.flags.to_le_bytes());
    write_version(&mut buf, 64);

    if let (true, Some(v2_hash)) = (with_mic, v2_hash) {
        let nt_proof = &nt_response[..16];
        let mic = hash::mic(&v2_hash, nt_proof, type1.raw(), &type2.raw, &buf);
        buf[MIC_OFFSET..MIC_OFFSET + MIC_LEN].copy_from_slice(&mic);
    }

    NtlmMessage::new(buf)
}
