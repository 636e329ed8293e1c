use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use thiserror::Error;
use tracing::instrument;

use crate::key::SessionKeyMaterial;
use crate::protocol::Opcode;

type SessionEncryptor = cbc::Encryptor<Aes128>;
type SessionDecryptor = cbc::Decryptor<Aes128>;

const HEADER_LEN: usize = 3;
const CHECKSUM_LEN: usize = 4;
const MIN_FRAME_LEN: usize = HEADER_LEN + CHECKSUM_LEN;
const MAX_BODY_LEN: usize = u8::MAX as usize;
const CIPHER_BLOCK_LEN: usize = 16;
const FLAG_ENCRYPTED: u8 = 0b0000_0001;

static FRAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Errors returned by frame encoding and decoding.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FrameCodecError {
    /// The trailing CRC-32 does not match the frame contents.
    #[error("frame checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    /// The encrypted body could not be decrypted with the current session material.
    #[error("frame body could not be decrypted: {reason}")]
    DecryptionFailure { reason: DecryptionFailureReason },
    /// The frame structure is invalid.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: MalformedFrameReason },
    /// The payload does not fit the 8-bit body length field.
    #[error("frame payload is too large: {payload_len} bytes exceeds max {max_payload_len}")]
    PayloadTooLarge {
        payload_len: usize,
        max_payload_len: usize,
    },
}

impl FrameCodecError {
    fn malformed(reason: MalformedFrameReason) -> Self {
        Self::MalformedFrame { reason }
    }

    fn decryption(reason: DecryptionFailureReason) -> Self {
        Self::DecryptionFailure { reason }
    }
}

/// Why an encrypted body was rejected.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum DecryptionFailureReason {
    #[display("frame is encrypted but no session key is established")]
    NoSessionKey,
    #[display("ciphertext length {_0} is not a multiple of the cipher block")]
    UnalignedCiphertext(usize),
    #[display("encrypted body of {_0} bytes has no room for an IV and a cipher block")]
    Truncated(usize),
    #[display("padding is invalid")]
    InvalidPadding,
}

/// Why a frame was rejected as structurally invalid.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum MalformedFrameReason {
    #[display("expected at least 7 bytes, got {_0}")]
    TooShort(usize),
    #[display("declared body length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[display("reserved flag bits are set ({_0:#04x})")]
    ReservedFlags(u8),
}

/// One decoded protocol frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    opcode: u8,
    payload: Vec<u8>,
    encrypted: bool,
}

impl Frame {
    /// Creates a plaintext frame.
    #[must_use]
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            payload,
            encrypted: false,
        }
    }

    /// Marks whether the frame arrived encrypted.
    #[must_use]
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Raw opcode byte.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Opcode when it is one the appliance protocol defines.
    #[must_use]
    pub fn known_opcode(&self) -> Option<Opcode> {
        Opcode::from_repr(self.opcode)
    }

    /// Decrypted payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the payload travelled encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

/// Wire codec used by the controller.
///
/// Implementations must not hold session state. Passing session material switches the
/// codec into its encrypted mode for that one call, so the same codec serves
/// the plaintext handshake and the protected traffic that follows it.
pub trait FrameCodec: fmt::Debug + Send + Sync {
    /// Encodes one frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload does not fit a frame.
    fn encode(
        &self,
        opcode: u8,
        payload: &[u8],
        session: Option<&SessionKeyMaterial>,
    ) -> Result<Vec<u8>, FrameCodecError>;

    /// Decodes and, when needed, decrypts one frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the checksum, structure or ciphertext is invalid.
    fn decode(
        &self,
        bytes: &[u8],
        session: Option<&SessionKeyMaterial>,
    ) -> Result<Frame, FrameCodecError>;
}

/// Default Boneco framing: `opcode | flags | len | body | crc32`.
///
/// The CRC-32 (little endian) covers every byte before it and is checked
/// before any header field is trusted. Encrypted bodies are a 16-byte frame IV
/// followed by AES-128-CBC ciphertext with PKCS#7 padding under the session
/// key. The frame IV is the session IV mixed with a process-wide frame counter
/// and encrypted under the session key, so repeated payloads never repeat
/// ciphertext.
#[derive(Debug, Clone, Copy, Default)]
pub struct BonecoFrameCodec;

impl BonecoFrameCodec {
    /// Largest plaintext payload accepted in the given mode.
    ///
    /// ```
    /// use boneco::BonecoFrameCodec;
    ///
    /// assert_eq!(255, BonecoFrameCodec::max_payload_len(false));
    /// assert_eq!(223, BonecoFrameCodec::max_payload_len(true));
    /// ```
    #[must_use]
    pub const fn max_payload_len(encrypted: bool) -> usize {
        if encrypted {
            // PKCS#7 always adds at least one byte of padding.
            (MAX_BODY_LEN / CIPHER_BLOCK_LEN) * CIPHER_BLOCK_LEN - CIPHER_BLOCK_LEN - 1
        } else {
            MAX_BODY_LEN
        }
    }
}

impl FrameCodec for BonecoFrameCodec {
    #[instrument(skip(self, payload, session), level = "trace", fields(payload_len = payload.len(), encrypted = session.is_some()))]
    fn encode(
        &self,
        opcode: u8,
        payload: &[u8],
        session: Option<&SessionKeyMaterial>,
    ) -> Result<Vec<u8>, FrameCodecError> {
        let max_payload_len = Self::max_payload_len(session.is_some());
        if payload.len() > max_payload_len {
            return Err(FrameCodecError::PayloadTooLarge {
                payload_len: payload.len(),
                max_payload_len,
            });
        }

        let (flags, body) = match session {
            Some(session) => {
                let iv = frame_iv(session, FRAME_COUNTER.fetch_add(1, Ordering::Relaxed));
                let mut body = iv.to_vec();
                body.extend(
                    SessionEncryptor::new(session.key().into(), &iv.into())
                        .encrypt_padded_vec_mut::<Pkcs7>(payload),
                );
                (FLAG_ENCRYPTED, body)
            }
            None => (0, payload.to_vec()),
        };
        let body_len = u8::try_from(body.len()).map_err(|_error| {
            FrameCodecError::PayloadTooLarge {
                payload_len: payload.len(),
                max_payload_len,
            }
        })?;

        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + body.len());
        frame.push(opcode);
        frame.push(flags);
        frame.push(body_len);
        frame.extend_from_slice(&body);
        let checksum = crc32fast::hash(&frame);
        frame.extend_from_slice(&checksum.to_le_bytes());
        Ok(frame)
    }

    #[instrument(skip(self, bytes, session), level = "trace", fields(frame_len = bytes.len()))]
    fn decode(
        &self,
        bytes: &[u8],
        session: Option<&SessionKeyMaterial>,
    ) -> Result<Frame, FrameCodecError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameCodecError::malformed(MalformedFrameReason::TooShort(
                bytes.len(),
            )));
        }

        let (covered, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(covered);
        if expected != computed {
            return Err(FrameCodecError::ChecksumMismatch { expected, computed });
        }

        let opcode = covered[0];
        let flags = covered[1];
        let declared = usize::from(covered[2]);
        let body = &covered[HEADER_LEN..];
        if declared != body.len() {
            return Err(FrameCodecError::malformed(
                MalformedFrameReason::LengthMismatch {
                    declared,
                    actual: body.len(),
                },
            ));
        }
        if flags & !FLAG_ENCRYPTED != 0 {
            return Err(FrameCodecError::malformed(
                MalformedFrameReason::ReservedFlags(flags),
            ));
        }

        if flags & FLAG_ENCRYPTED == 0 {
            return Ok(Frame::new(opcode, body.to_vec()));
        }

        let Some(session) = session else {
            return Err(FrameCodecError::decryption(
                DecryptionFailureReason::NoSessionKey,
            ));
        };
        if body.len() % CIPHER_BLOCK_LEN != 0 {
            return Err(FrameCodecError::decryption(
                DecryptionFailureReason::UnalignedCiphertext(body.len()),
            ));
        }
        if body.len() < 2 * CIPHER_BLOCK_LEN {
            return Err(FrameCodecError::decryption(
                DecryptionFailureReason::Truncated(body.len()),
            ));
        }
        let (iv, ciphertext) = body.split_at(CIPHER_BLOCK_LEN);
        let payload = SessionDecryptor::new(session.key().into(), GenericArray::from_slice(iv))
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_error| FrameCodecError::decryption(DecryptionFailureReason::InvalidPadding))?;

        Ok(Frame::new(opcode, payload).with_encrypted(true))
    }
}

fn frame_iv(session: &SessionKeyMaterial, counter: u64) -> [u8; CIPHER_BLOCK_LEN] {
    let mut block = *session.iv();
    for (byte, count) in block.iter_mut().zip(counter.to_le_bytes()) {
        *byte ^= count;
    }
    let mut block = GenericArray::from(block);
    Aes128::new(session.key().into()).encrypt_block(&mut block);

    let mut iv = [0_u8; CIPHER_BLOCK_LEN];
    iv.copy_from_slice(&block);
    iv
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::{assert_eq, assert_ne};
    use rstest::rstest;

    use super::*;
    use crate::key::DeviceKey;

    fn session(nonce_byte: u8) -> SessionKeyMaterial {
        DeviceKey::parse("00112233445566778899aabbccddeeff")
            .expect("test key should parse")
            .derive_session_key(&[nonce_byte; 16])
    }

    #[test]
    fn encode_plaintext_writes_header_body_and_checksum() {
        let frame = BonecoFrameCodec
            .encode(0x01, &[0xAA, 0xBB], None)
            .expect("small payload should encode");

        assert_eq!(&[0x01, 0x00, 0x02, 0xAA, 0xBB], &frame[..5]);
        let checksum = crc32fast::hash(&frame[..5]).to_le_bytes();
        assert_eq!(&checksum, &frame[5..]);
    }

    #[rstest]
    #[case(0x01, vec![])]
    #[case(0x11, vec![0x05, 0x08, 0x00])]
    #[case(0xFE, (0..=254).collect())]
    fn plaintext_round_trip_preserves_frame(#[case] opcode: u8, #[case] payload: Vec<u8>) {
        let bytes = BonecoFrameCodec
            .encode(opcode, &payload, None)
            .expect("payload should encode");
        let frame = BonecoFrameCodec
            .decode(&bytes, None)
            .expect("encoded frame should decode");

        assert_eq!(Frame::new(opcode, payload), frame);
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![0x42; 15])]
    #[case(vec![0x42; 16])]
    #[case(vec![0x24; 223])]
    fn encrypted_round_trip_preserves_frame(#[case] payload: Vec<u8>) {
        let session = session(1);
        let bytes = BonecoFrameCodec
            .encode(0x10, &payload, Some(&session))
            .expect("payload should encode");
        let frame = BonecoFrameCodec
            .decode(&bytes, Some(&session))
            .expect("encoded frame should decode");

        assert_eq!(0x01, bytes[1]);
        assert_eq!(Frame::new(0x10, payload).with_encrypted(true), frame);
    }

    #[test]
    fn encrypted_body_hides_payload() {
        let session = session(1);
        let payload = [0x11_u8; 20];
        let bytes = BonecoFrameCodec
            .encode(0x10, &payload, Some(&session))
            .expect("payload should encode");

        assert_eq!(48, usize::from(bytes[2]));
        assert!(!bytes.windows(payload.len()).any(|window| window == payload));
    }

    #[test]
    fn repeated_payloads_never_repeat_ciphertext() {
        let session = session(3);
        let payload = [0x0C_u8, 0x08, 0x00, 0x00];
        let first = BonecoFrameCodec
            .encode(0x11, &payload, Some(&session))
            .expect("payload should encode");
        let second = BonecoFrameCodec
            .encode(0x11, &payload, Some(&session))
            .expect("payload should encode");

        assert_ne!(
            first[HEADER_LEN..first.len() - CHECKSUM_LEN],
            second[HEADER_LEN..second.len() - CHECKSUM_LEN]
        );
        for bytes in [first, second] {
            assert_eq!(
                payload,
                BonecoFrameCodec
                    .decode(&bytes, Some(&session))
                    .expect("frame should decode")
                    .payload()
            );
        }
    }

    #[test]
    fn frame_iv_depends_on_counter_and_session() {
        assert_ne!(frame_iv(&session(1), 0), frame_iv(&session(1), 1));
        assert_ne!(frame_iv(&session(1), 0), frame_iv(&session(2), 0));
        assert_ne!(*session(1).iv(), frame_iv(&session(1), 0));
    }

    #[test]
    fn every_single_bit_flip_is_a_checksum_mismatch() {
        let session = session(9);
        for bytes in [
            BonecoFrameCodec
                .encode(0x11, &[0x0C, 0x08, 0x00, 0x00], None)
                .expect("plaintext frame should encode"),
            BonecoFrameCodec
                .encode(0x12, &[0x07], Some(&session))
                .expect("encrypted frame should encode"),
        ] {
            for bit in 0..bytes.len() * 8 {
                let mut corrupted = bytes.clone();
                corrupted[bit / 8] ^= 1 << (bit % 8);
                assert_matches!(
                    BonecoFrameCodec.decode(&corrupted, Some(&session)),
                    Err(FrameCodecError::ChecksumMismatch { .. }),
                    "bit {bit} flip should be caught"
                );
            }
        }
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(
            Err(FrameCodecError::MalformedFrame {
                reason: MalformedFrameReason::TooShort(3)
            }),
            BonecoFrameCodec.decode(&[0x01, 0x00, 0x00], None)
        );
    }

    #[test]
    fn decode_rejects_length_mismatch_with_valid_checksum() {
        let mut frame = vec![0x11, 0x00, 0x05, 0xAA];
        frame.extend_from_slice(&crc32fast::hash(&frame).to_le_bytes());

        assert_eq!(
            Err(FrameCodecError::MalformedFrame {
                reason: MalformedFrameReason::LengthMismatch {
                    declared: 5,
                    actual: 1
                }
            }),
            BonecoFrameCodec.decode(&frame, None)
        );
    }

    #[test]
    fn decode_rejects_reserved_flags() {
        let mut frame = vec![0x11, 0x80, 0x00];
        frame.extend_from_slice(&crc32fast::hash(&frame).to_le_bytes());

        assert_matches!(
            BonecoFrameCodec.decode(&frame, None),
            Err(FrameCodecError::MalformedFrame {
                reason: MalformedFrameReason::ReservedFlags(0x80)
            })
        );
    }

    #[test]
    fn encrypted_frame_without_session_fails_decryption() {
        let bytes = BonecoFrameCodec
            .encode(0x11, &[0x01], Some(&session(1)))
            .expect("payload should encode");

        assert_matches!(
            BonecoFrameCodec.decode(&bytes, None),
            Err(FrameCodecError::DecryptionFailure {
                reason: DecryptionFailureReason::NoSessionKey
            })
        );
    }

    #[test]
    fn encrypted_frame_with_stale_session_is_rejected() {
        let payload = [0x05, 0x08];
        let bytes = BonecoFrameCodec
            .encode(0x11, &payload, Some(&session(1)))
            .expect("payload should encode");

        // A wrong key either breaks the padding or yields garbage; it must
        // never yield the original payload.
        let decoded = BonecoFrameCodec.decode(&bytes, Some(&session(2)));
        match decoded {
            Err(error) => assert_matches!(error, FrameCodecError::DecryptionFailure { .. }),
            Ok(frame) => assert!(frame.payload() != payload),
        }
    }

    #[rstest]
    #[case(0)]
    #[case(16)]
    fn decode_rejects_body_without_iv_and_block(#[case] body_len: u8) {
        let mut frame = vec![0x11, 0x01, body_len];
        frame.extend(std::iter::repeat_n(0x5A, usize::from(body_len)));
        frame.extend_from_slice(&crc32fast::hash(&frame).to_le_bytes());

        assert_eq!(
            Err(FrameCodecError::DecryptionFailure {
                reason: DecryptionFailureReason::Truncated(usize::from(body_len))
            }),
            BonecoFrameCodec.decode(&frame, Some(&session(1)))
        );
    }

    #[test]
    fn decode_rejects_unaligned_ciphertext() {
        let mut frame = vec![0x11, 0x01, 0x03, 0x01, 0x02, 0x03];
        frame.extend_from_slice(&crc32fast::hash(&frame).to_le_bytes());

        assert_matches!(
            BonecoFrameCodec.decode(&frame, Some(&session(1))),
            Err(FrameCodecError::DecryptionFailure {
                reason: DecryptionFailureReason::UnalignedCiphertext(3)
            })
        );
    }

    #[rstest]
    #[case(None, 256)]
    #[case(Some(session(1)), 224)]
    fn encode_rejects_oversized_payload(
        #[case] session: Option<SessionKeyMaterial>,
        #[case] payload_len: usize,
    ) {
        let payload = vec![0_u8; payload_len];
        assert_matches!(
            BonecoFrameCodec.encode(0x10, &payload, session.as_ref()),
            Err(FrameCodecError::PayloadTooLarge { payload_len: rejected, .. }) if rejected == payload_len
        );
    }
}
