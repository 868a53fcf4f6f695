use crate::token::TokenError;
use chrono::Utc;

// Constants for token format
pub(crate) const MAGIC: &[u8; 4] = b"VAT1";
pub(crate) const VERSION: u8 = 1;
pub(crate) const ALG_AES_256_GCM: u8 = 1;

// Header size: magic(4) + ver(1) + kid(1) + alg(1) + kind(1) + nonce(12) + issued_at(8) = 28 bytes
pub(crate) const HEADER_SIZE: usize = 28;
pub(crate) const TAG_SIZE: usize = 16;

/// Binary header structure (plaintext, authenticated as AAD)
#[derive(Debug, Clone)]
pub struct TokenHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub kid: u8,
    pub alg: u8,
    /// Payload kind the token was sealed for
    pub kind: u8,
    pub nonce: [u8; 12],
    // Seal time in milliseconds since UNIX_EPOCH
    pub issued_at_ms: i64,
}

impl TokenHeader {
    pub fn new(kid: u8, alg: u8, kind: u8) -> Self {
        let mut nonce = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce);

        Self {
            magic: *MAGIC,
            version: VERSION,
            kid,
            alg,
            kind,
            nonce,
            issued_at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(&self.magic);
        bytes.push(self.version);
        bytes.push(self.kid);
        bytes.push(self.alg);
        bytes.push(self.kind);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.issued_at_ms.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() < HEADER_SIZE {
            return Err(TokenError::InvalidHeader("Invalid header size".to_string()));
        }

        let magic: [u8; 4] = bytes[0..4]
            .try_into()
            .map_err(|_| TokenError::InvalidHeader("Failed to read magic bytes".to_string()))?;
        if magic != *MAGIC {
            return Err(TokenError::InvalidHeader("Invalid magic bytes".to_string()));
        }

        let version = bytes[4];
        if version != VERSION {
            return Err(TokenError::InvalidHeader(format!(
                "Unsupported version: {version}",
            )));
        }

        let kid = bytes[5];
        let alg = bytes[6];
        let kind = bytes[7];
        let nonce: [u8; 12] = bytes[8..20]
            .try_into()
            .map_err(|_| TokenError::InvalidHeader("Failed to read nonce".to_string()))?;

        let issued_at_bytes: [u8; 8] = bytes[20..28]
            .try_into()
            .map_err(|_| TokenError::InvalidHeader("Failed to read issued_at".to_string()))?;
        let issued_at_ms = i64::from_le_bytes(issued_at_bytes);

        Ok(Self {
            magic,
            version,
            kid,
            alg,
            kind,
            nonce,
            issued_at_ms,
        })
    }
}
