//! NTLMv2 challenge/response messages.
//!
//! # Design
//! - The negotiate message is a fixed token; only the challenge is parsed and
//!   only the authenticate message is generated.
//! - Sessions hold the user, password, and uppercased domain; they are cached
//!   per domain, so a later user in the same domain reuses the first session.
//! - No key exchange is negotiated; HTTP authentication needs neither signing
//!   nor sealing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use blobwire_creds::Creds;
use blobwire_creds::creds::{PASSWORD, USERNAME};
use chrono::Utc;
use hmac::digest::generic_array::GenericArray;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use crate::error::{ApiError, ApiResult};

/// Base64 type 1 message sent to start every exchange.
pub const NEGOTIATE_MESSAGE: &str =
    "TlRMTVNTUAABAAAAB7IIogwADAAzAAAACwALACgAAAAKAAAoAAAAD1dJTExISS1NQUlOTk9SVEhBTUVSSUNB";

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const CHALLENGE_TYPE: u32 = 2;
const AUTHENTICATE_TYPE: u32 = 3;
const AUTHENTICATE_HEADER_LEN: usize = 64;

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_VERSION: u32 = 0x0200_0000;
const NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Parsed type 2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    /// Flags the server negotiated.
    pub flags: u32,
    /// Eight-byte server nonce.
    pub server_challenge: [u8; 8],
    /// Raw target name.
    pub target_name: Vec<u8>,
    /// Raw AV pair list.
    pub target_info: Vec<u8>,
}

impl ChallengeMessage {
    /// Parse a decoded type 2 message.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NtlmMessage`] for truncated or mistyped messages.
    pub fn parse(bytes: &[u8]) -> ApiResult<Self> {
        if bytes.len() < 32 || &bytes[..8] != SIGNATURE {
            return Err(malformed("missing NTLMSSP signature"));
        }
        if read_u32(bytes, 8)? != CHALLENGE_TYPE {
            return Err(malformed("not a challenge message"));
        }
        let target_name = security_buffer(bytes, 12)?.to_vec();
        let flags = read_u32(bytes, 20)?;
        let mut server_challenge = [0; 8];
        server_challenge.copy_from_slice(&bytes[24..32]);
        let target_info = if flags & NEGOTIATE_TARGET_INFO != 0 && bytes.len() >= 48 {
            security_buffer(bytes, 40)?.to_vec()
        } else {
            Vec::new()
        };
        Ok(Self {
            flags,
            server_challenge,
            target_name,
            target_info,
        })
    }

    /// Decode a base64 challenge token and parse it.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NtlmChallenge`] when the token is not base64 and
    /// [`ApiError::NtlmMessage`] when the message is malformed.
    pub fn from_base64(token: &str) -> ApiResult<Self> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|_| ApiError::NtlmChallenge {
                header: token.to_string(),
            })?;
        Self::parse(&bytes)
    }

    fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut offset = 0;
        while offset + 4 <= info.len() {
            let id = u16::from_le_bytes([info[offset], info[offset + 1]]);
            let len = usize::from(u16::from_le_bytes([info[offset + 2], info[offset + 3]]));
            let value = info.get(offset + 4..offset + 4 + len)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP if len == 8 => {
                    let mut raw = [0; 8];
                    raw.copy_from_slice(value);
                    return Some(u64::from_le_bytes(raw));
                }
                _ => offset += 4 + len,
            }
        }
        None
    }
}

/// User credentials for one NTLM domain.
#[derive(Clone, PartialEq, Eq)]
pub struct NtlmSession {
    user: String,
    password: String,
    domain: String,
}

impl std::fmt::Debug for NtlmSession {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NtlmSession")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl NtlmSession {
    /// Session for `user` in `domain`; the domain is uppercased.
    #[must_use]
    pub fn new(user: impl Into<String>, password: impl Into<String>, domain: &str) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            domain: domain.to_uppercase(),
        }
    }

    /// User name without the domain.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Uppercased domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Base64 type 3 message answering `challenge`.
    ///
    /// # Errors
    ///
    /// Returns an error when a field does not fit the message layout.
    pub fn authenticate(&self, challenge: &ChallengeMessage) -> ApiResult<String> {
        let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);
        let message = self.authenticate_with(challenge, rand::random(), timestamp)?;
        Ok(STANDARD.encode(message))
    }

    fn authenticate_with(
        &self,
        challenge: &ChallengeMessage,
        client_challenge: [u8; 8],
        timestamp: u64,
    ) -> ApiResult<Vec<u8>> {
        let key = ntowf_v2(&self.user, &self.password, &self.domain);
        let (nt_response, _) = ntlmv2_response(
            &key,
            &challenge.server_challenge,
            &client_challenge,
            timestamp,
            &challenge.target_info,
        );
        let lm_response = if challenge.timestamp().is_some() {
            vec![0; 24]
        } else {
            lmv2_response(&key, &challenge.server_challenge, &client_challenge)
        };
        let flags = (challenge.flags | NEGOTIATE_UNICODE | NEGOTIATE_NTLM)
            & !(NEGOTIATE_OEM | NEGOTIATE_VERSION | NEGOTIATE_KEY_EXCH);
        authenticate_message(
            &[
                &lm_response,
                &nt_response,
                &utf16le(&self.domain),
                &utf16le(&self.user),
                &[],
                &[],
            ],
            flags,
        )
    }
}

/// Sessions keyed by uppercased domain.
#[derive(Debug, Default)]
pub struct NtlmSessions {
    sessions: Mutex<HashMap<String, Arc<NtlmSession>>>,
}

impl NtlmSessions {
    /// Empty session cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for the `DOMAIN\user` in `creds`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NtlmUsername`] when the user name has no domain.
    pub fn session_for(&self, creds: &Creds) -> ApiResult<Arc<NtlmSession>> {
        let username = creds.first(USERNAME);
        let Some((domain, user)) = username.split_once('\\').filter(|(_, user)| !user.contains('\\'))
        else {
            return Err(ApiError::NtlmUsername {
                username: username.to_string(),
            });
        };
        let key = domain.to_uppercase();
        let mut sessions = self.lock();
        let session = sessions
            .entry(key)
            .or_insert_with(|| Arc::new(NtlmSession::new(user, creds.first(PASSWORD), domain)))
            .clone();
        drop(sessions);
        Ok(session)
    }

    /// Number of cached domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no session was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<NtlmSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Challenge token from a `WWW-Authenticate` value such as `NTLM <base64>`.
///
/// # Errors
///
/// Returns [`ApiError::NtlmChallenge`] when the value carries no token.
pub fn challenge_token(header: &str) -> ApiResult<&str> {
    let invalid = || ApiError::NtlmChallenge {
        header: header.to_string(),
    };
    if header.len() < 6 {
        return Err(invalid());
    }
    header
        .split_once(' ')
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or_else(invalid)
}

/// MD4 of the UTF-16LE password.
#[must_use]
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut out = [0; 16];
    out.copy_from_slice(&Md4::digest(utf16le(password)));
    out
}

/// NTLMv2 response key for `user` in `domain`.
#[must_use]
pub fn ntowf_v2(user: &str, password: &str, domain: &str) -> [u8; 16] {
    let identity = format!("{}{domain}", user.to_uppercase());
    hmac_md5(&nt_hash(password), &[&utf16le(&identity)])
}

fn ntlmv2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> (Vec<u8>, [u8; 16]) {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(key, &[server_challenge, &blob]);
    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    (response, proof)
}

fn lmv2_response(key: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Vec<u8> {
    let mut response = hmac_md5(key, &[server_challenge, client_challenge]).to_vec();
    response.extend_from_slice(client_challenge);
    response
}

fn authenticate_message(fields: &[&[u8]; 6], flags: u32) -> ApiResult<Vec<u8>> {
    let payload: usize = fields.iter().map(|field| field.len()).sum();
    let mut message = Vec::with_capacity(AUTHENTICATE_HEADER_LEN + payload);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&AUTHENTICATE_TYPE.to_le_bytes());

    let mut offset = AUTHENTICATE_HEADER_LEN;
    for field in fields {
        let len = u16::try_from(field.len()).map_err(|_| malformed("field too long"))?;
        let at = u32::try_from(offset).map_err(|_| malformed("message too long"))?;
        message.extend_from_slice(&len.to_le_bytes());
        message.extend_from_slice(&len.to_le_bytes());
        message.extend_from_slice(&at.to_le_bytes());
        offset += field.len();
    }
    message.extend_from_slice(&flags.to_le_bytes());
    for field in fields {
        message.extend_from_slice(field);
    }
    Ok(message)
}

fn hmac_md5(key: &[u8; 16], parts: &[&[u8]]) -> [u8; 16] {
    let mut block = [0; 64];
    block[..key.len()].copy_from_slice(key);
    let mut mac = <Hmac<Md5> as Mac>::new(GenericArray::from_slice(&block));
    for part in parts {
        mac.update(part);
    }
    let mut out = [0; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn filetime_now() -> u64 {
    let now = Utc::now();
    let seconds = now.timestamp().saturating_add(FILETIME_EPOCH_OFFSET);
    u64::try_from(seconds)
        .unwrap_or_default()
        .saturating_mul(10_000_000)
        .saturating_add(u64::from(now.timestamp_subsec_nanos() / 100))
}

fn read_u32(bytes: &[u8], offset: usize) -> ApiResult<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .ok_or_else(|| malformed("truncated message"))
}

fn security_buffer(bytes: &[u8], offset: usize) -> ApiResult<&[u8]> {
    let header = bytes
        .get(offset..offset + 8)
        .ok_or_else(|| malformed("truncated message"))?;
    let len = usize::from(u16::from_le_bytes([header[0], header[1]]));
    let start = usize::try_from(u32::from_le_bytes([header[4], header[5], header[6], header[7]]))
        .map_err(|_| malformed("buffer offset out of range"))?;
    bytes
        .get(start..start.saturating_add(len))
        .ok_or_else(|| malformed("buffer out of range"))
}

const fn malformed(reason: &'static str) -> ApiError {
    ApiError::NtlmMessage { reason }
}
