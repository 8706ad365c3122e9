//! Hash and response computations for NTLMv1 and NTLMv2.

use std::time::{SystemTime, UNIX_EPOCH};

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

/// Milliseconds between 1601-01-01 and 1970-01-01.
const EPOCH_DIFF_MS: u64 = 11_644_473_600_000;

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

pub(crate) fn to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Single-byte OEM encoding; characters outside ASCII become `?`.
pub(crate) fn to_oem(s: &str) -> Vec<u8> {
    s.chars().map(|c| if c.is_ascii() { c as u8 } else { b'?' }).collect()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    // HMAC accepts keys of any length
    let mut mac = match <HmacMd5 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 16],
    };
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Expand a 7-byte key to a DES key with odd parity.
fn expand_des_key(key: &[u8]) -> [u8; 8] {
    let k = |i: usize| key.get(i).copied().unwrap_or(0);
    let mut out = [
        k(0) & 0xfe,
        (k(0) << 7) | (k(1) >> 1),
        (k(1) << 6) | (k(2) >> 2),
        (k(2) << 5) | (k(3) >> 3),
        (k(3) << 4) | (k(4) >> 4),
        (k(4) << 3) | (k(5) >> 5),
        (k(5) << 2) | (k(6) >> 6),
        k(6) << 1,
    ];
    for b in out.iter_mut() {
        if (*b >> 1).count_ones() % 2 == 0 {
            *b |= 1;
        } else {
            *b &= 0xfe;
        }
    }
    out
}

fn des_encrypt(key7: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let key = expand_des_key(key7);
    let cipher = match Des::new_from_slice(&key) {
        Ok(c) => c,
        Err(_) => return [0u8; 8],
    };
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf);
    out
}

/// NT hash: MD4 over the UTF-16LE password.
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md4::digest(to_utf16le(password)));
    out
}

/// LM hash. Passwords longer than 14 characters yield an all-zero hash.
pub fn lm_hash(password: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    if password.chars().count() > 14 {
        return out;
    }
    let mut pw = [0u8; 14];
    for (dst, src) in pw.iter_mut().zip(to_oem(&password.to_uppercase())) {
        *dst = src;
    }
    out[..8].copy_from_slice(&des_encrypt(&pw[..7], LM_MAGIC));
    out[8..].copy_from_slice(&des_encrypt(&pw[7..], LM_MAGIC));
    out
}

/// 24-byte DES response used by both LM and NTLMv1.
pub fn des_response(challenge: &[u8; 8], hash: &[u8; 16]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(hash);
    let mut out = [0u8; 24];
    out[..8].copy_from_slice(&des_encrypt(&padded[..7], challenge));
    out[8..16].copy_from_slice(&des_encrypt(&padded[7..14], challenge));
    out[16..].copy_from_slice(&des_encrypt(&padded[14..], challenge));
    out
}

/// NTLMv2 hash: HMAC-MD5 keyed with the NT hash over `UPPER(user) + target`.
pub fn ntlmv2_hash(nt_hash: &[u8; 16], username: &str, target: &str) -> [u8; 16] {
    let identity = to_utf16le(&format!("{}{}", username.to_uppercase(), target));
    hmac_md5(nt_hash, &[&identity])
}

pub fn lmv2_response(v2_hash: &[u8; 16], challenge: &[u8; 8], nonce: &[u8; 8]) -> [u8; 24] {
    let proof = hmac_md5(v2_hash, &[challenge, nonce]);
    let mut out = [0u8; 24];
    out[..16].copy_from_slice(&proof);
    out[16..].copy_from_slice(nonce);
    out
}

/// NTLMv2 response: NTProofStr followed by the client blob.
///
/// With `with_mic` the terminating AV pair of `target_info` is replaced by
/// `MsvAvFlags = 0x2` (MIC present) and a new terminator.
pub fn ntlmv2_response(
    v2_hash: &[u8; 16],
    challenge: &[u8; 8],
    nonce: &[u8; 8],
    timestamp: &[u8; 8],
    target_info: &[u8],
    with_mic: bool,
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(40 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(timestamp);
    blob.extend_from_slice(nonce);
    blob.extend_from_slice(&[0u8; 4]);
    if with_mic {
        let without_eol = target_info.len().saturating_sub(4);
        blob.extend_from_slice(&target_info[..without_eol]);
        blob.extend_from_slice(&0x06u16.to_le_bytes());
        blob.extend_from_slice(&0x04u16.to_le_bytes());
        blob.extend_from_slice(&0x02u32.to_le_bytes());
        blob.extend_from_slice(&[0u8; 4]);
    } else {
        blob.extend_from_slice(target_info);
    }
    blob.extend_from_slice(&[0u8; 4]);

    let proof = hmac_md5(v2_hash, &[challenge, &blob]);
    let mut out = Vec::with_capacity(16 + blob.len());
    out.extend_from_slice(&proof);
    out.extend_from_slice(&blob);
    out
}

/// Message integrity code over the three handshake messages.
pub fn mic(v2_hash: &[u8; 16], nt_proof: &[u8], type1: &[u8], type2: &[u8], type3: &[u8]) -> [u8; 16] {
    let session_base_key = hmac_md5(v2_hash, &[nt_proof]);
    hmac_md5(&session_base_key, &[type1, type2, type3])
}

/// Current time as 100ns ticks since 1601-01-01, little endian.
pub fn timestamp_now() -> [u8; 8] {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ms.saturating_add(EPOCH_DIFF_MS).saturating_mul(10_000).to_le_bytes()
}

pub fn client_nonce() -> [u8; 8] {
    rand::random()
}
