use std::fmt;
use std::str::FromStr;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use serde_with::DeserializeFromStr;
use thiserror::Error;

/// Length of the raw device key in bytes.
pub const DEVICE_KEY_LEN: usize = 16;
/// Length of the handshake nonce in bytes.
pub const NONCE_LEN: usize = 16;

const DEVICE_KEY_HEX_LEN: usize = DEVICE_KEY_LEN * 2;
const RESPONSE_MARKER: u8 = 0x01;
const SESSION_KEY_MARKER: u8 = 0x02;
const SESSION_IV_MARKER: u8 = 0x03;

/// Errors returned when parsing a device key.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum InvalidKeyFormat {
    /// The key does not have exactly 32 characters.
    #[error("device key must be 32 hex characters, got {actual}")]
    Length { actual: usize },
    /// The key contains a character outside `0-9a-f`.
    #[error("device key contains non-hex character `{character}` at position {position}")]
    Character { character: char, position: usize },
}

/// Handshake nonce sent by the appliance.
pub type Nonce = [u8; NONCE_LEN];

/// The 128-bit key shared with one appliance.
#[derive(Clone, Eq, PartialEq, DeserializeFromStr)]
pub struct DeviceKey([u8; DEVICE_KEY_LEN]);

impl DeviceKey {
    /// Parses a device key from 32 hexadecimal characters.
    ///
    /// Upper-case input is accepted and normalised.
    ///
    /// ```
    /// use boneco::DeviceKey;
    ///
    /// let key = DeviceKey::parse("00112233445566778899AABBCCDDEEFF")?;
    /// assert_eq!(0xFF, key.as_bytes()[15]);
    /// assert!(DeviceKey::parse("00112233445566778899aabbccddeef").is_err());
    /// # Ok::<(), boneco::InvalidKeyFormat>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when the input is not exactly 32 hex characters.
    pub fn parse(value: &str) -> Result<Self, InvalidKeyFormat> {
        let actual = value.chars().count();
        if actual != DEVICE_KEY_HEX_LEN {
            return Err(InvalidKeyFormat::Length { actual });
        }
        if let Some((position, character)) = value
            .chars()
            .enumerate()
            .find(|(_, character)| !character.is_ascii_hexdigit())
        {
            return Err(InvalidKeyFormat::Character {
                character,
                position,
            });
        }

        let normalised = value.to_ascii_lowercase();
        let mut bytes = [0_u8; DEVICE_KEY_LEN];
        hex::decode_to_slice(normalised, &mut bytes).map_err(|_error| {
            InvalidKeyFormat::Length { actual }
        })?;
        Ok(Self(bytes))
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DEVICE_KEY_LEN] {
        &self.0
    }

    /// Returns a short identifier of the key that does not reveal it.
    ///
    /// The appliance uses it to pick the key slot for the handshake.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 4] {
        let block = self.encrypt_block([0_u8; 16]);
        [block[0], block[1], block[2], block[3]]
    }

    /// Computes the proof sent back for one handshake challenge.
    ///
    /// The last nonce byte is replaced with `0x01` before encryption, which
    /// is what the appliance firmware does on its side.
    #[must_use]
    pub fn challenge_response(&self, nonce: &Nonce) -> [u8; 16] {
        self.encrypt_block(marked_nonce(nonce, RESPONSE_MARKER))
    }

    /// Derives the per-connection session key material for one nonce.
    ///
    /// ```
    /// use boneco::DeviceKey;
    ///
    /// let key = DeviceKey::parse("00112233445566778899aabbccddeeff")?;
    /// let nonce = [7_u8; 16];
    /// assert_eq!(key.derive_session_key(&nonce), key.derive_session_key(&nonce));
    /// # Ok::<(), boneco::InvalidKeyFormat>(())
    /// ```
    #[must_use]
    pub fn derive_session_key(&self, nonce: &Nonce) -> SessionKeyMaterial {
        SessionKeyMaterial {
            key: self.encrypt_block(marked_nonce(nonce, SESSION_KEY_MARKER)),
            iv: self.encrypt_block(marked_nonce(nonce, SESSION_IV_MARKER)),
        }
    }

    fn encrypt_block(&self, input: [u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(&self.0));
        let mut block = GenericArray::clone_from_slice(&input);
        cipher.encrypt_block(&mut block);

        let mut output = [0_u8; 16];
        output.copy_from_slice(&block);
        output
    }
}

impl FromStr for DeviceKey {
    type Err = InvalidKeyFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceKey")
            .field(&format_args!("fingerprint={}", hex::encode(self.fingerprint())))
            .finish()
    }
}

fn marked_nonce(nonce: &Nonce, marker: u8) -> [u8; 16] {
    let mut input = *nonce;
    input[NONCE_LEN - 1] = marker;
    input
}

/// Symmetric material protecting post-handshake traffic on one connection.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKeyMaterial {
    key: [u8; 16],
    iv: [u8; 16],
}

impl SessionKeyMaterial {
    /// Returns the session cipher key.
    #[must_use]
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// Returns the session initialisation vector.
    #[must_use]
    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }
}

impl fmt::Debug for SessionKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeyMaterial(<redacted>)")
    }
}

impl Drop for SessionKeyMaterial {
    fn drop(&mut self) {
        self.key.fill(0);
        self.iv.fill(0);
    }
}
