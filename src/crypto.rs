//! Passphrase-based streaming encryption (AES-GCM).
//!
//! Sealed file layout (all integers little-endian):
//!
//! ```text
//! magic     8   b"BLZSEAL1"
//! suite     1   1 = AES-128-GCM, 2 = AES-256-GCM
//! kdf       1   1 = Argon2id, 2 = PBKDF2-HMAC-SHA256
//! params   12   3 x u32 (argon2: memory KiB, iterations, lanes; pbkdf2: rounds, 0, 0)
//! salt     16
//! nonce    12
//! check    16   HMAC-SHA256(mac key, header[..50]) truncated
//! body      n   ciphertext
//! tag      16   GCM tag
//! ```
//!
//! The key check lets the opener reject a wrong passphrase before producing
//! any plaintext. The header is fully self-describing, so opening never
//! depends on the configuration the file was sealed with.

use aes_gcm_stream::{
    Aes128GcmStreamDecryptor, Aes128GcmStreamEncryptor, Aes256GcmStreamDecryptor,
    Aes256GcmStreamEncryptor,
};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{ConfigError, TransformError};
use crate::stream::Transform;

type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: &[u8; 8] = b"BLZSEAL1";
const SALT_SIZE: usize = 16; // 128 bits
const NONCE_SIZE: usize = 12; // 96 bits for GCM
const MAC_KEY_SIZE: usize = 32;
const CHECK_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
const CHECKED_LEN: usize = 8 + 1 + 1 + 12 + SALT_SIZE + NONCE_SIZE;
/// Size of the fixed header preceding the ciphertext.
pub const HEADER_LEN: usize = CHECKED_LEN + CHECK_SIZE;

// Upper bounds accepted when reading a header; a forged header must not be
// able to make key derivation allocate or spin without limit.
const MAX_ARGON2_MEMORY_KIB: u32 = 4 * 1024 * 1024; // 4 GiB
const MAX_ARGON2_ITERATIONS: u32 = 64;
const MAX_ARGON2_LANES: u32 = 64;
const MAX_PBKDF2_ROUNDS: u32 = 50_000_000;

/// A concrete cipher, resolved from the configured (cipher, key size, mode) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherSuite {
    pub fn resolve(cipher: &str, key_size: u32, mode: &str) -> Result<Self, ConfigError> {
        let is_aes = cipher.eq_ignore_ascii_case("aes");
        let is_gcm = mode.eq_ignore_ascii_case("gcm");
        match (is_aes, key_size, is_gcm) {
            (true, 128, true) => Ok(CipherSuite::Aes128Gcm),
            (true, 256, true) => Ok(CipherSuite::Aes256Gcm),
            _ => Err(ConfigError::UnsupportedCipher {
                cipher: cipher.to_string(),
                key_size,
                mode: mode.to_string(),
            }),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128Gcm => 16,
            CipherSuite::Aes256Gcm => 32,
        }
    }

    fn id(self) -> u8 {
        match self {
            CipherSuite::Aes128Gcm => 1,
            CipherSuite::Aes256Gcm => 2,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CipherSuite::Aes128Gcm),
            2 => Some(CipherSuite::Aes256Gcm),
            _ => None,
        }
    }
}

/// Passphrase key derivation function and its cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Kdf {
    Argon2id {
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
    },
    Pbkdf2Sha256 {
        rounds: u32,
    },
}

impl Default for Kdf {
    fn default() -> Self {
        Kdf::Argon2id {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl Kdf {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            field: "kdf",
            reason,
        };
        match *self {
            Kdf::Argon2id {
                memory_kib,
                iterations,
                parallelism,
            } => {
                if memory_kib > MAX_ARGON2_MEMORY_KIB
                    || iterations > MAX_ARGON2_ITERATIONS
                    || parallelism > MAX_ARGON2_LANES
                {
                    return Err(invalid("argon2 cost parameters too large".to_string()));
                }
                Params::new(memory_kib, iterations, parallelism, None)
                    .map(|_| ())
                    .map_err(|e| invalid(e.to_string()))
            }
            Kdf::Pbkdf2Sha256 { rounds } => {
                if rounds == 0 || rounds > MAX_PBKDF2_ROUNDS {
                    Err(invalid(format!("pbkdf2 rounds out of range: {rounds}")))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn id(&self) -> u8 {
        match self {
            Kdf::Argon2id { .. } => 1,
            Kdf::Pbkdf2Sha256 { .. } => 2,
        }
    }

    fn params(&self) -> [u32; 3] {
        match *self {
            Kdf::Argon2id {
                memory_kib,
                iterations,
                parallelism,
            } => [memory_kib, iterations, parallelism],
            Kdf::Pbkdf2Sha256 { rounds } => [rounds, 0, 0],
        }
    }

    fn from_header(id: u8, params: [u32; 3]) -> Option<Self> {
        let kdf = match id {
            1 => Kdf::Argon2id {
                memory_kib: params[0],
                iterations: params[1],
                parallelism: params[2],
            },
            2 => Kdf::Pbkdf2Sha256 { rounds: params[0] },
            _ => return None,
        };
        kdf.validate().ok().map(|()| kdf)
    }

    /// Fills `out` with key material derived from `passphrase` and `salt`.
    fn derive(&self, passphrase: &[u8], salt: &[u8], out: &mut [u8]) -> Result<(), TransformError> {
        match *self {
            Kdf::Argon2id {
                memory_kib,
                iterations,
                parallelism,
            } => {
                let params = Params::new(memory_kib, iterations, parallelism, Some(out.len()))
                    .map_err(|e| TransformError::Kdf(e.to_string()))?;
                Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                    .hash_password_into(passphrase, salt, out)
                    .map_err(|e| TransformError::Kdf(e.to_string()))
            }
            Kdf::Pbkdf2Sha256 { rounds } => {
                pbkdf2_hmac::<Sha256>(passphrase, salt, rounds, out);
                Ok(())
            }
        }
    }
}

/// Cipher key plus the key used for the header check.
struct DerivedKeys {
    cipher: Vec<u8>,
    mac: [u8; MAC_KEY_SIZE],
}

fn derive_keys(
    suite: CipherSuite,
    kdf: &Kdf,
    passphrase: &[u8],
    salt: &[u8],
) -> Result<DerivedKeys, TransformError> {
    let key_len = suite.key_len();
    let mut material = vec![0u8; key_len + MAC_KEY_SIZE];
    kdf.derive(passphrase, salt, &mut material)?;

    let mut mac = [0u8; MAC_KEY_SIZE];
    mac.copy_from_slice(&material[key_len..]);
    material.truncate(key_len);
    Ok(DerivedKeys {
        cipher: material,
        mac,
    })
}

fn header_mac(mac_key: &[u8], checked: &[u8]) -> Result<HmacSha256, TransformError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| TransformError::Kdf(e.to_string()))?;
    mac.update(checked);
    Ok(mac)
}

fn key_array<const N: usize>(key: &[u8]) -> Result<[u8; N], TransformError> {
    key.try_into()
        .map_err(|_| TransformError::Kdf(format!("expected {N}-byte key, got {}", key.len())))
}

enum Encryptor {
    Aes128(Aes128GcmStreamEncryptor),
    Aes256(Aes256GcmStreamEncryptor),
}

impl Encryptor {
    fn new(suite: CipherSuite, key: &[u8], nonce: &[u8]) -> Result<Self, TransformError> {
        Ok(match suite {
            CipherSuite::Aes128Gcm => {
                Encryptor::Aes128(Aes128GcmStreamEncryptor::new(key_array(key)?, nonce))
            }
            CipherSuite::Aes256Gcm => {
                Encryptor::Aes256(Aes256GcmStreamEncryptor::new(key_array(key)?, nonce))
            }
        })
    }

    fn update(&mut self, input: &[u8]) -> Vec<u8> {
        match self {
            Encryptor::Aes128(enc) => enc.update(input),
            Encryptor::Aes256(enc) => enc.update(input),
        }
    }

    fn finalize(&mut self) -> (Vec<u8>, Vec<u8>) {
        match self {
            Encryptor::Aes128(enc) => enc.finalize(),
            Encryptor::Aes256(enc) => enc.finalize(),
        }
    }
}

enum Decryptor {
    Aes128(Aes128GcmStreamDecryptor),
    Aes256(Aes256GcmStreamDecryptor),
}

impl Decryptor {
    fn new(suite: CipherSuite, key: &[u8], nonce: &[u8]) -> Result<Self, TransformError> {
        Ok(match suite {
            CipherSuite::Aes128Gcm => {
                Decryptor::Aes128(Aes128GcmStreamDecryptor::new(key_array(key)?, nonce))
            }
            CipherSuite::Aes256Gcm => {
                Decryptor::Aes256(Aes256GcmStreamDecryptor::new(key_array(key)?, nonce))
            }
        })
    }

    fn update(&mut self, input: &[u8]) -> Vec<u8> {
        match self {
            Decryptor::Aes128(dec) => dec.update(input),
            Decryptor::Aes256(dec) => dec.update(input),
        }
    }

    fn finalize(&mut self) -> Result<Vec<u8>, String> {
        match self {
            Decryptor::Aes128(dec) => dec.finalize(),
            Decryptor::Aes256(dec) => dec.finalize(),
        }
    }
}

/// Encrypting transform. Writes the header in `begin`, the tag in `finish`.
pub struct Sealer {
    header: Vec<u8>,
    enc: Encryptor,
}

impl Sealer {
    /// Derives the key with a fresh random salt and nonce.
    pub fn new(suite: CipherSuite, kdf: &Kdf, passphrase: &str) -> Result<Self, TransformError> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let keys = derive_keys(suite, kdf, passphrase.as_bytes(), &salt)?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(suite.id());
        header.push(kdf.id());
        for param in kdf.params() {
            header.extend_from_slice(&param.to_le_bytes());
        }
        header.extend_from_slice(&salt);
        header.extend_from_slice(&nonce);
        let check = header_mac(&keys.mac, &header)?.finalize().into_bytes();
        header.extend_from_slice(&check[..CHECK_SIZE]);

        let enc = Encryptor::new(suite, &keys.cipher, &nonce)?;
        Ok(Self { header, enc })
    }
}

impl Transform for Sealer {
    fn begin(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        out.extend_from_slice(&self.header);
        Ok(())
    }

    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        out.extend_from_slice(&self.enc.update(input));
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        let (tail, tag) = self.enc.finalize();
        out.extend_from_slice(&tail);
        out.extend_from_slice(&tag);
        Ok(())
    }
}

/// Decrypting transform. Buffers the header until it is complete, verifies
/// the passphrase, then streams plaintext. The tag is checked in `finish`.
pub struct Opener {
    passphrase: Vec<u8>,
    pending: Vec<u8>,
    dec: Option<Decryptor>,
    /// Bytes handed to the decryptor after the header, tag included.
    body_len: u64,
}

impl Opener {
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: passphrase.as_bytes().to_vec(),
            pending: Vec::with_capacity(HEADER_LEN),
            dec: None,
            body_len: 0,
        }
    }

    fn open_header(&self, header: &[u8]) -> Result<Decryptor, TransformError> {
        if &header[..8] != MAGIC {
            return Err(TransformError::Format("not a sealed file".to_string()));
        }
        let suite = CipherSuite::from_id(header[8])
            .ok_or_else(|| TransformError::Format(format!("unknown cipher suite {}", header[8])))?;

        let mut params = [0u32; 3];
        for (i, param) in params.iter_mut().enumerate() {
            let at = 10 + i * 4;
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&header[at..at + 4]);
            *param = u32::from_le_bytes(raw);
        }
        let kdf = Kdf::from_header(header[9], params)
            .ok_or_else(|| TransformError::Format("invalid key derivation parameters".to_string()))?;

        let salt = &header[22..22 + SALT_SIZE];
        let nonce = &header[22 + SALT_SIZE..CHECKED_LEN];
        let keys = derive_keys(suite, &kdf, &self.passphrase, salt)?;

        header_mac(&keys.mac, &header[..CHECKED_LEN])?
            .verify_truncated_left(&header[CHECKED_LEN..HEADER_LEN])
            .map_err(|_| TransformError::Authentication)?;

        Decryptor::new(suite, &keys.cipher, nonce)
    }
}

impl Transform for Opener {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), TransformError> {
        if let Some(dec) = self.dec.as_mut() {
            self.body_len += input.len() as u64;
            out.extend_from_slice(&dec.update(input));
            return Ok(());
        }

        self.pending.extend_from_slice(input);
        if self.pending.len() < HEADER_LEN {
            return Ok(());
        }

        let mut dec = self.open_header(&self.pending[..HEADER_LEN])?;
        let body = &self.pending[HEADER_LEN..];
        self.body_len = body.len() as u64;
        out.extend_from_slice(&dec.update(body));
        self.pending = Vec::new();
        self.dec = Some(dec);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), TransformError> {
        let dec = self
            .dec
            .as_mut()
            .ok_or_else(|| TransformError::Format("truncated header".to_string()))?;
        // The decryptor slices the tag off its buffer unchecked.
        if self.body_len < TAG_SIZE as u64 {
            return Err(TransformError::Authentication);
        }
        let tail = dec.finalize().map_err(|_| TransformError::Authentication)?;
        out.extend_from_slice(&tail);
        Ok(())
    }
}
