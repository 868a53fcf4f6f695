use crate::token::TokenError;
use chrono::{DateTime, Utc};

pub const KIND_SESSION: u8 = 1;
pub const KIND_OBJECT: u8 = 2;

/// A payload that can be sealed into a token.
///
/// `KIND` is written into the authenticated header, so a token sealed for
/// one payload type never opens as another.
pub trait SealedPayload: Sized {
    const KIND: u8;

    fn encode(&self) -> Result<Vec<u8>, TokenError>;
    fn decode(data: &[u8]) -> Result<Self, TokenError>;
}

/// Viewer session: who the bearer is and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub principal_id: String,
    pub expires_at_ms: i64,
}

impl SessionClaims {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.expires_at_ms
    }
}

impl SealedPayload for SessionClaims {
    const KIND: u8 = KIND_SESSION;

    fn encode(&self) -> Result<Vec<u8>, TokenError> {
        encode_keyed(self.expires_at_ms, &self.principal_id)
    }

    fn decode(data: &[u8]) -> Result<Self, TokenError> {
        let (expires_at_ms, principal_id) = decode_keyed(data)?;
        Ok(Self {
            principal_id,
            expires_at_ms,
        })
    }
}

/// Grant to read one stored object until `expires_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectGrant {
    pub storage_key: String,
    pub expires_at_ms: i64,
}

impl ObjectGrant {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.expires_at_ms
    }
}

impl SealedPayload for ObjectGrant {
    const KIND: u8 = KIND_OBJECT;

    fn encode(&self) -> Result<Vec<u8>, TokenError> {
        encode_keyed(self.expires_at_ms, &self.storage_key)
    }

    fn decode(data: &[u8]) -> Result<Self, TokenError> {
        let (expires_at_ms, storage_key) = decode_keyed(data)?;
        Ok(Self {
            storage_key,
            expires_at_ms,
        })
    }
}

// expires_at_ms(8) + len(2) + utf8 bytes
fn encode_keyed(expires_at_ms: i64, value: &str) -> Result<Vec<u8>, TokenError> {
    let value_bytes = value.as_bytes();
    let len = u16::try_from(value_bytes.len())
        .map_err(|_| TokenError::InvalidPayload("Value too long".to_string()))?;

    let mut bytes = Vec::with_capacity(10 + value_bytes.len());
    bytes.extend_from_slice(&expires_at_ms.to_le_bytes());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(value_bytes);
    Ok(bytes)
}

fn decode_keyed(bytes: &[u8]) -> Result<(i64, String), TokenError> {
    if bytes.len() < 10 {
        return Err(TokenError::InvalidPayload("Payload too short".to_string()));
    }

    let expires_at_ms = i64::from_le_bytes(
        bytes[0..8]
            .try_into()
            .map_err(|_| TokenError::InvalidPayload("Failed to read expiry".to_string()))?,
    );
    let len = u16::from_le_bytes(
        bytes[8..10]
            .try_into()
            .map_err(|_| TokenError::InvalidPayload("Failed to read length".to_string()))?,
    ) as usize;

    if bytes.len() != 10 + len {
        return Err(TokenError::InvalidPayload(
            "Invalid payload size".to_string(),
        ));
    }

    let value = String::from_utf8(bytes[10..].to_vec())
        .map_err(|_| TokenError::InvalidPayload("Invalid UTF-8".to_string()))?;

    Ok((expires_at_ms, value))
}
