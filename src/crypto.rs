//! Key material and the per-session AEAD.
//!
//! [`AppKey`] is the host side of the handshake: an ephemeral P-256 keypair
//! plus a 4-byte app token, generated once per process and shared by every
//! session (or pinned explicitly for reproducible handshakes).
//! [`SessionCipher`] is the post-handshake AES-CCM-128 channel with one
//! monotonic nonce counter per direction.

use std::sync::{Arc, LazyLock};

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use p256::ecdh;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePublicKey;
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};

use crate::error::{Error, Result};

/// AES-CCM with a 4-byte tag and a 13-byte nonce, as used on the wire.
type SessionCcm = Ccm<Aes128, U4, U13>;

/// Fixed associated data on every frame.
const ASSOCIATED_DATA: &[u8] = &[0x00];

/// Top bit of the 5-byte nonce counter field, set on host → device frames.
const ENCRYPT_DIRECTION_BIT: u64 = 1 << 39;

/// Mask keeping device → host counters inside the low 2^39 range.
const DECRYPT_COUNTER_MASK: u64 = ENCRYPT_DIRECTION_BIT - 1;

/// DER SubjectPublicKeyInfo header for an uncompressed P-256 point; the wire
/// protocol exchanges only the 64 bytes that follow it.
const P256_SPKI_PREFIX: [u8; 27] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00, 0x04,
];

static SHARED_APP_KEY: LazyLock<Arc<AppKey>> = LazyLock::new(|| Arc::new(AppKey::generate()));

/// The host's handshake identity: an ephemeral P-256 keypair and app token.
pub struct AppKey {
    secret: SecretKey,
    app_token: [u8; 4],
}

impl AppKey {
    /// Generate a fresh keypair and app token.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let mut app_token = [0u8; 4];
        OsRng.fill_bytes(&mut app_token);
        AppKey { secret, app_token }
    }

    /// Build from fixed material, for reproducible handshakes in tests and
    /// embedders that persist their identity.
    pub fn from_secret(secret: SecretKey, app_token: [u8; 4]) -> Self {
        AppKey { secret, app_token }
    }

    /// The process-wide instance, created on first use and reused by every
    /// session thereafter.
    pub fn shared() -> Arc<AppKey> {
        SHARED_APP_KEY.clone()
    }

    pub fn app_token(&self) -> [u8; 4] {
        self.app_token
    }

    /// The public key as the raw 64-byte `X || Y` the protocol carries.
    pub fn public_key(&self) -> [u8; 64] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut raw = [0u8; 64];
        // Skip the uncompressed-point tag byte.
        raw.copy_from_slice(&point.as_bytes()[1..]);
        raw
    }

    /// ECDH against the device's long-term public key (raw `X || Y`),
    /// returning the 32-byte shared secret.
    pub fn ecdh(&self, device_public_key: &[u8; 64]) -> Result<[u8; 32]> {
        let mut der = Vec::with_capacity(P256_SPKI_PREFIX.len() + device_public_key.len());
        der.extend_from_slice(&P256_SPKI_PREFIX);
        der.extend_from_slice(device_public_key);
        let remote = PublicKey::from_public_key_der(&der)
            .map_err(|e| Error::InvalidArgument(format!("invalid device public key: {e}")))?;

        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), remote.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

fn aes_cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Session key for the handshake: `AES-CMAC(shared_secret[..16], tokens)`.
pub fn derive_session_key(shared_secret: &[u8; 32], tokens: &[u8; 8]) -> [u8; 16] {
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&shared_secret[..16]);
    aes_cmac(&truncated, tokens)
}

/// Authentication tag the device expects in the login payload:
/// `AES-CMAC(secret_key, key_index || local_public_key || tokens)[..4]`.
pub fn login_response_tag(
    secret_key: &[u8; 16],
    key_index: &[u8; 2],
    local_public_key: &[u8; 64],
    tokens: &[u8; 8],
) -> [u8; 4] {
    let mut message = Vec::with_capacity(key_index.len() + local_public_key.len() + tokens.len());
    message.extend_from_slice(key_index);
    message.extend_from_slice(local_public_key);
    message.extend_from_slice(tokens);

    let tag = aes_cmac(secret_key, &message);
    let mut out = [0u8; 4];
    out.copy_from_slice(&tag[..4]);
    out
}

fn build_nonce(counter_field: u64, session_token: &[u8; 8]) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[..5].copy_from_slice(&counter_field.to_le_bytes()[..5]);
    nonce[5..].copy_from_slice(session_token);
    nonce
}

/// The per-session AEAD. Owned by exactly one device session; dropped with it.
///
/// Each direction has its own counter, kept in disjoint 2^39 ranges by the
/// direction bit, so the two ends can never collide on a nonce under the same
/// session token.
pub struct SessionCipher {
    cipher: SessionCcm,
    session_token: [u8; 8],
    encrypt_counter: u64,
    decrypt_counter: u64,
}

impl SessionCipher {
    pub fn new(session_key: [u8; 16], session_token: [u8; 8]) -> Self {
        SessionCipher {
            cipher: SessionCcm::new((&session_key).into()),
            session_token,
            encrypt_counter: 0,
            decrypt_counter: 0,
        }
    }

    /// Encrypt one host → device frame, consuming one nonce.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = build_nonce(
            self.encrypt_counter | ENCRYPT_DIRECTION_BIT,
            &self.session_token,
        );
        self.encrypt_counter += 1;

        self.cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: ASSOCIATED_DATA,
                },
            )
            .map_err(|_| Error::Protocol("frame too large for AES-CCM".into()))
    }

    /// Decrypt one device → host frame.
    ///
    /// The counter advances whether or not the tag verifies: the device's
    /// counter moved when it sent the frame, so staying aligned after a
    /// corrupted frame requires consuming the nonce regardless.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = build_nonce(
            self.decrypt_counter & DECRYPT_COUNTER_MASK,
            &self.session_token,
        );
        self.decrypt_counter += 1;

        self.cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: ASSOCIATED_DATA,
                },
            )
            .map_err(|_| Error::Auth)
    }
}
