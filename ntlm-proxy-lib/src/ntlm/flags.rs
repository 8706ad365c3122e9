// NTLM negotiate flag bits (MS-NLMP 2.2.2.5)
pub const NEGOTIATE_UNICODE: u32 = 1 << 0;
pub const NEGOTIATE_OEM: u32 = 1 << 1;
pub const REQUEST_TARGET: u32 = 1 << 2;
pub const NEGOTIATE_SIGN: u32 = 1 << 4;
pub const NEGOTIATE_SEAL: u32 = 1 << 5;
pub const NEGOTIATE_LM_KEY: u32 = 1 << 7;
pub const NEGOTIATE_NTLM_KEY: u32 = 1 << 9;
pub const NEGOTIATE_ANONYMOUS: u32 = 1 << 11;
pub const NEGOTIATE_DOMAIN_SUPPLIED: u32 = 1 << 12;
pub const NEGOTIATE_WORKSTATION_SUPPLIED: u32 = 1 << 13;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 1 << 15;
pub const TARGET_TYPE_DOMAIN: u32 = 1 << 16;
pub const TARGET_TYPE_SERVER: u32 = 1 << 17;
/// Extended session security, selects NTLMv2 in this implementation.
pub const NEGOTIATE_NTLM2_KEY: u32 = 1 << 19;
pub const NEGOTIATE_TARGET_INFO: u32 = 1 << 23;
pub const NEGOTIATE_VERSION: u32 = 1 << 25;
pub const NEGOTIATE_128: u32 = 1 << 29;
pub const NEGOTIATE_KEY_EXCHANGE: u32 = 1 << 30;
pub const NEGOTIATE_56: u32 = 1 << 31;
