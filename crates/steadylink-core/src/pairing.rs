//! Pairing codes for linking a device without scanning a QR code.

use rand::Rng;
use thiserror::Error;

use crate::traits::EngineError;

/// Length of a pairing code.
pub const PAIRING_CODE_LEN: usize = 8;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Pairing error.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Session is already registered")]
    AlreadyRegistered,
    #[error("No connection to request a pairing code on")]
    NotConnected,
    #[error("Invalid pairing code: {0:?}")]
    InvalidCode(String),
    #[error("Invalid phone number: {0:?}")]
    InvalidPhoneNumber(String),
    #[error("Pairing request failed: {0}")]
    Request(#[from] EngineError),
}

/// Generates random `[A-Z0-9]{8}` pairing codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairingCodeGenerator;

impl PairingCodeGenerator {
    /// Create a generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Generate a code from the thread-local RNG.
    #[must_use]
    pub fn generate(&self) -> String {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Generate a code from the given RNG.
    pub fn generate_with<R: Rng>(&self, rng: &mut R) -> String {
        (0..PAIRING_CODE_LEN)
            .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
            .collect()
    }
}

/// Validate a caller-supplied code and upper-case it.
///
/// # Errors
/// Returns [`PairingError::InvalidCode`] unless the code is exactly
/// eight ASCII letters or digits.
pub fn normalize_custom_code(code: &str) -> Result<String, PairingError> {
    let code = code.trim();
    if code.len() == PAIRING_CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(PairingError::InvalidCode(code.to_string()))
    }
}

/// Strip a phone number down to its digits (`+62 812-3456` -> `628123456`).
///
/// # Errors
/// Returns [`PairingError::InvalidPhoneNumber`] when no digits remain.
pub fn normalize_phone(number: &str) -> Result<String, PairingError> {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        Err(PairingError::InvalidPhoneNumber(number.to_string()))
    } else {
        Ok(digits)
    }
}
