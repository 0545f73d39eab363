//! Cryptographic primitives for the Sesame login handshake and session cipher
//!
//! - AES-CMAC authenticates the login request with the device secret key and derives
//!   the session key from the P-256 ECDH shared secret.
//! - AES-128-CCM (4-byte tag, 13-byte nonce) protects every message once logged in.
//!   The nonce is a 5-byte little-endian message counter followed by the 8-byte
//!   session token; host-to-device counters carry bit 39.

use core::fmt;

use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand_core::{CryptoRng, OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{AuthFailure, CryptographicError, Result, SesameError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Raw (x || y) public key length
pub const PUBLIC_KEY_LEN: usize = 64;
/// Device secret key length
pub const SECRET_KEY_LEN: usize = 16;
/// Length of each side's login token
pub const TOKEN_LEN: usize = 4;
/// Truncated CMAC carried in the login request
pub const LOGIN_TAG_LEN: usize = 4;
/// Index of the key slot used for login
pub const KEY_INDEX: [u8; 2] = [0x00, 0x00];

const DIRECTION_BIT: u64 = 1 << 39;
const COUNTER_MASK: u64 = DIRECTION_BIT - 1;
const AAD: [u8; 1] = [0x00];

type SessionCcm = Ccm<Aes128, U4, U13>;

// ----------------------------------------------------------------------------
// Long-term Key Material
// ----------------------------------------------------------------------------

/// Device secret and public key issued during vendor pairing
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    secret_key: [u8; SECRET_KEY_LEN],
    device_public_key: [u8; PUBLIC_KEY_LEN],
    key_index: [u8; 2],
}

impl KeyMaterial {
    pub fn new(
        secret_key: [u8; SECRET_KEY_LEN],
        device_public_key: [u8; PUBLIC_KEY_LEN],
    ) -> Result<Self> {
        decode_public_key(&device_public_key)?;
        Ok(Self {
            secret_key,
            device_public_key,
            key_index: KEY_INDEX,
        })
    }

    /// Parse the hex strings exported from the vendor app
    pub fn from_hex(secret_key: &str, device_public_key: &str) -> Result<Self> {
        let secret = hex::decode(secret_key.trim()).map_err(|_| invalid_key("secret key is not hex"))?;
        let public = hex::decode(device_public_key.trim())
            .map_err(|_| invalid_key("public key is not hex"))?;

        let secret: [u8; SECRET_KEY_LEN] = secret
            .as_slice()
            .try_into()
            .map_err(|_| invalid_key("secret key must be 16 bytes"))?;
        let public: [u8; PUBLIC_KEY_LEN] = public
            .as_slice()
            .try_into()
            .map_err(|_| invalid_key("public key must be 64 bytes"))?;
        Self::new(secret, public)
    }

    pub fn device_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.device_public_key
    }

    pub fn key_index(&self) -> [u8; 2] {
        self.key_index
    }

    pub(crate) fn secret_key(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.secret_key
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("secret_key", &"<redacted>")
            .field("device_public_key", &hex::encode(&self.device_public_key[..8]))
            .finish()
    }
}

fn invalid_key(reason: &str) -> SesameError {
    CryptographicError::InvalidKeyFormat {
        reason: reason.to_string(),
    }
    .into()
}

// ----------------------------------------------------------------------------
// ECDH Key Pair
// ----------------------------------------------------------------------------

/// P-256 key pair used for the login key agreement
pub struct EcdhKeyPair {
    secret: SecretKey,
    public: [u8; PUBLIC_KEY_LEN],
}

impl EcdhKeyPair {
    /// Generate a fresh key pair
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = SecretKey::random(rng);
        let public = encode_public_key(&secret.public_key());
        Self { secret, public }
    }

    /// Restore a key pair from a 32-byte scalar
    pub fn from_scalar_bytes(scalar: &[u8; 32]) -> Result<Self> {
        let secret = SecretKey::from_slice(scalar).map_err(|_| invalid_key("invalid P-256 scalar"))?;
        let public = encode_public_key(&secret.public_key());
        Ok(Self { secret, public })
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    /// X coordinate of the shared point
    pub fn diffie_hellman(&self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> Result<[u8; 32]> {
        let peer = decode_public_key(peer_public)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

impl fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdhKeyPair")
            .field("public", &hex::encode(&self.public[..8]))
            .finish()
    }
}

fn encode_public_key(key: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_LEN];
    // Uncompressed SEC1 point: 0x04 || x || y
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

fn decode_public_key(raw: &[u8; PUBLIC_KEY_LEN]) -> Result<PublicKey> {
    let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| invalid_key("public key is not on P-256"))
}

/// Random login token
pub fn generate_token() -> [u8; TOKEN_LEN] {
    let mut token = [0u8; TOKEN_LEN];
    OsRng.fill_bytes(&mut token);
    token
}

// ----------------------------------------------------------------------------
// Key Derivation
// ----------------------------------------------------------------------------

/// AES-CMAC over `data`
pub fn aes_cmac(key: &[u8], data: &[u8]) -> Result<[u8; 16]> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .map_err(|_| CryptographicError::KeyDerivationFailed)?;
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Session token: app token followed by device token
pub fn session_token(app_token: &[u8; TOKEN_LEN], device_token: &[u8; TOKEN_LEN]) -> [u8; 8] {
    let mut tokens = [0u8; 8];
    tokens[..TOKEN_LEN].copy_from_slice(app_token);
    tokens[TOKEN_LEN..].copy_from_slice(device_token);
    tokens
}

/// Truncated CMAC proving possession of the device secret key
pub fn login_tag(
    secret_key: &[u8; SECRET_KEY_LEN],
    key_index: [u8; 2],
    app_public: &[u8; PUBLIC_KEY_LEN],
    tokens: &[u8; 8],
) -> Result<[u8; LOGIN_TAG_LEN]> {
    let mut message = Vec::with_capacity(2 + PUBLIC_KEY_LEN + 8);
    message.extend_from_slice(&key_index);
    message.extend_from_slice(app_public);
    message.extend_from_slice(tokens);
    let mac = aes_cmac(secret_key, &message)?;
    let mut tag = [0u8; LOGIN_TAG_LEN];
    tag.copy_from_slice(&mac[..LOGIN_TAG_LEN]);
    Ok(tag)
}

/// Session key from the ECDH shared secret
pub fn derive_session_key(shared_secret: &[u8; 32], tokens: &[u8; 8]) -> Result<[u8; 16]> {
    aes_cmac(&shared_secret[..16], tokens)
}

// ----------------------------------------------------------------------------
// Login Exchange
// ----------------------------------------------------------------------------

/// Plaintext login request plus the keys it commits the host to
#[derive(Debug)]
pub struct LoginRequest {
    pub payload: Vec<u8>,
    pub session_keys: SessionKeys,
}

/// Build the host login request for a device token
pub fn prepare_login(
    keys: &KeyMaterial,
    app_keys: &EcdhKeyPair,
    app_token: [u8; TOKEN_LEN],
    device_token: [u8; TOKEN_LEN],
) -> Result<LoginRequest> {
    let tokens = session_token(&app_token, &device_token);
    let tag = login_tag(keys.secret_key(), keys.key_index(), app_keys.public_key_bytes(), &tokens)?;
    let shared = app_keys.diffie_hellman(keys.device_public_key())?;
    let session_key = derive_session_key(&shared, &tokens)?;

    let mut payload = Vec::with_capacity(2 + PUBLIC_KEY_LEN + TOKEN_LEN + LOGIN_TAG_LEN);
    payload.extend_from_slice(&keys.key_index());
    payload.extend_from_slice(app_keys.public_key_bytes());
    payload.extend_from_slice(&app_token);
    payload.extend_from_slice(&tag);

    Ok(LoginRequest {
        payload,
        session_keys: SessionKeys::new(session_key, tokens, CipherRole::App),
    })
}

/// Verify a login request on the device side and derive its session keys
pub fn accept_login(
    secret_key: &[u8; SECRET_KEY_LEN],
    device_keys: &EcdhKeyPair,
    device_token: [u8; TOKEN_LEN],
    payload: &[u8],
) -> Result<SessionKeys> {
    const LEN: usize = 2 + PUBLIC_KEY_LEN + TOKEN_LEN + LOGIN_TAG_LEN;
    if payload.len() != LEN {
        return Err(SesameError::auth_failed(AuthFailure::MalformedResponse));
    }
    let key_index = [payload[0], payload[1]];
    let mut app_public = [0u8; PUBLIC_KEY_LEN];
    app_public.copy_from_slice(&payload[2..2 + PUBLIC_KEY_LEN]);
    let mut app_token = [0u8; TOKEN_LEN];
    app_token.copy_from_slice(&payload[2 + PUBLIC_KEY_LEN..2 + PUBLIC_KEY_LEN + TOKEN_LEN]);
    let received_tag = &payload[LEN - LOGIN_TAG_LEN..];

    let tokens = session_token(&app_token, &device_token);
    let expected_tag = login_tag(secret_key, key_index, &app_public, &tokens)?;
    if expected_tag != received_tag {
        return Err(SesameError::auth_failed(AuthFailure::TagMismatch));
    }

    let shared = device_keys.diffie_hellman(&app_public)?;
    let session_key = derive_session_key(&shared, &tokens)?;
    Ok(SessionKeys::new(session_key, tokens, CipherRole::Device))
}

// ----------------------------------------------------------------------------
// Session Cipher
// ----------------------------------------------------------------------------

/// Which end of the link owns the cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherRole {
    App,
    Device,
}

/// Per-connection AES-CCM state; erased on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    key: [u8; 16],
    token: [u8; 8],
    encrypt_counter: u64,
    decrypt_counter: u64,
    #[zeroize(skip)]
    role: CipherRole,
}

impl SessionKeys {
    pub fn new(key: [u8; 16], token: [u8; 8], role: CipherRole) -> Self {
        Self {
            key,
            token,
            encrypt_counter: 0,
            decrypt_counter: 0,
            role,
        }
    }

    pub fn role(&self) -> CipherRole {
        self.role
    }

    /// Messages encrypted so far
    pub fn encrypt_counter(&self) -> u64 {
        self.encrypt_counter
    }

    /// Messages authenticated so far
    pub fn decrypt_counter(&self) -> u64 {
        self.decrypt_counter
    }

    fn nonce(&self, counter: u64, outbound: bool) -> Result<[u8; 13]> {
        if counter > COUNTER_MASK {
            return Err(CryptographicError::CounterExhausted.into());
        }
        let from_app = match self.role {
            CipherRole::App => outbound,
            CipherRole::Device => !outbound,
        };
        let value = if from_app { counter | DIRECTION_BIT } else { counter };

        let mut nonce = [0u8; 13];
        nonce[..5].copy_from_slice(&value.to_le_bytes()[..5]);
        nonce[5..].copy_from_slice(&self.token);
        Ok(nonce)
    }

    fn cipher(&self) -> SessionCcm {
        SessionCcm::new(GenericArray::from_slice(&self.key))
    }

    /// Encrypt the next outbound message
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(self.encrypt_counter, true)?;
        let ciphertext = self
            .cipher()
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &AAD,
                },
            )
            .map_err(|_| CryptographicError::EncryptionFailed)?;
        self.encrypt_counter += 1;
        Ok(ciphertext)
    }

    /// Authenticate and decrypt the next inbound message
    ///
    /// A frame that does not verify under the next expected counter, including a
    /// replay of an earlier frame, fails with `AuthenticationFailed` and leaves the
    /// counter unchanged.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(self.decrypt_counter, false)?;
        let plaintext = self
            .cipher()
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: &AAD,
                },
            )
            .map_err(|_| SesameError::auth_failed(AuthFailure::TagMismatch))?;
        self.decrypt_counter += 1;
        Ok(plaintext)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("role", &self.role)
            .field("encrypt_counter", &self.encrypt_counter)
            .field("decrypt_counter", &self.decrypt_counter)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
