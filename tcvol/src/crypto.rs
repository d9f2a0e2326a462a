//! Header cryptography
//!
//! A TrueCrypt header carries no indication of the key-derivation function
//! or cipher protecting it; the only way to identify the combination is to
//! try every supported pair in a fixed preference order and check each
//! decryption attempt for structural validity ([`recognize`]).
//!
//! PBKDF2 PRF support:
//! - [x] HMAC-RIPEMD160 (2000 and 1000 iterations)
//! - [x] HMAC-SHA512
//! - [x] HMAC-Whirlpool
//!
//! Cipher support:
//! - [x] AES-128-XTS
//! - [x] AES-256-XTS
//! - [ ] cascades
//! - [ ] LRW mode

use crate::hdr::{self, EncHdr, TcHdr};
use crate::safemem::SecureBuf;
use crate::VolumeError;
use aes::cipher::{generic_array::GenericArray, KeyInit};
use aes::{Aes128, Aes256};
use pbkdf2::pbkdf2_hmac;
use ripemd::Ripemd160;
use sha2::Sha512;
use tracing::debug;
use whirlpool::Whirlpool;
use xts_mode::{get_tweak_default, Xts128};

/// Derived key size; every cipher uses its leading `klen` bytes
pub const MAX_KEYSZ: usize = 192;

/// Hash underlying a PBKDF2 PRF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfHash {
    /// HMAC-RIPEMD160
    Ripemd160,
    /// HMAC-SHA512
    Sha512,
    /// HMAC-Whirlpool
    Whirlpool,
}

impl std::fmt::Display for PrfHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Self::Ripemd160 => "RIPEMD160",
                Self::Sha512 => "SHA512",
                Self::Whirlpool => "whirlpool",
            }
        )
    }
}

/// A password-based key derivation entry
#[derive(Debug)]
pub struct PbkdfPrf {
    /// The PRF hash
    pub hash: PrfHash,
    /// PBKDF2 iteration count
    pub iterations: u32,
}

/// Supported PRF entries; the order defines trial priority and must not be
/// rearranged
pub static PBKDF_PRF_ALGOS: [PbkdfPrf; 4] = [
    PbkdfPrf {
        hash: PrfHash::Ripemd160,
        iterations: 2000,
    },
    PbkdfPrf {
        hash: PrfHash::Ripemd160,
        iterations: 1000,
    },
    PbkdfPrf {
        hash: PrfHash::Sha512,
        iterations: 1000,
    },
    PbkdfPrf {
        hash: PrfHash::Whirlpool,
        iterations: 1000,
    },
];

/// Bulk cipher variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-128 in XTS mode (two 16 byte keys)
    Aes128Xts,
    /// AES-256 in XTS mode (two 32 byte keys)
    Aes256Xts,
}

/// A bulk cipher entry
#[derive(Debug)]
pub struct CryptoAlgo {
    /// Cipher dispatch
    pub kind: CipherKind,
    /// Display name
    pub name: &'static str,
    /// dm-crypt mode string
    pub dm_crypt_str: &'static str,
    /// Key material length in bytes (XTS: twice the block-key size)
    pub klen: usize,
    /// IV length in bytes
    pub ivlen: usize,
}

/// Supported cipher entries, in trial order
pub static CRYPTO_ALGOS: [CryptoAlgo; 2] = [
    CryptoAlgo {
        kind: CipherKind::Aes128Xts,
        name: "AES-128-XTS",
        dm_crypt_str: "aes-xts-plain",
        klen: 32,
        ivlen: 8,
    },
    CryptoAlgo {
        kind: CipherKind::Aes256Xts,
        name: "AES-256-XTS",
        dm_crypt_str: "aes-xts-plain",
        klen: 64,
        ivlen: 8,
    },
];

/// Fills `out` with PBKDF2-HMAC key material for the given PRF entry
pub fn derive_key(prf: &PbkdfPrf, pass: &[u8], salt: &[u8], out: &mut [u8]) {
    match prf.hash {
        PrfHash::Ripemd160 => pbkdf2_hmac::<Ripemd160>(pass, salt, prf.iterations, out),
        PrfHash::Sha512 => pbkdf2_hmac::<Sha512>(pass, salt, prf.iterations, out),
        PrfHash::Whirlpool => pbkdf2_hmac::<Whirlpool>(pass, salt, prf.iterations, out),
    }
}

/// Decrypts `buf` in place as a single XTS unit with a zero tweak
///
/// `key` must provide at least `cipher.klen` leading bytes; the XTS block
/// key comes first, the tweak key second.
pub fn decrypt_region(cipher: &CryptoAlgo, key: &[u8], buf: &mut [u8]) {
    let tweak = get_tweak_default(0);
    match cipher.kind {
        CipherKind::Aes128Xts => {
            let cipher_1 = Aes128::new(GenericArray::from_slice(&key[..16]));
            let cipher_2 = Aes128::new(GenericArray::from_slice(&key[16..32]));
            Xts128::new(cipher_1, cipher_2).decrypt_sector(buf, tweak);
        }
        CipherKind::Aes256Xts => {
            let cipher_1 = Aes256::new(GenericArray::from_slice(&key[..32]));
            let cipher_2 = Aes256::new(GenericArray::from_slice(&key[32..64]));
            Xts128::new(cipher_1, cipher_2).decrypt_sector(buf, tweak);
        }
    }
}

/// Inverse of [`decrypt_region`]; used by header round-trip tests and
/// fixture builders
pub fn encrypt_region(cipher: &CryptoAlgo, key: &[u8], buf: &mut [u8]) {
    let tweak = get_tweak_default(0);
    match cipher.kind {
        CipherKind::Aes128Xts => {
            let cipher_1 = Aes128::new(GenericArray::from_slice(&key[..16]));
            let cipher_2 = Aes128::new(GenericArray::from_slice(&key[16..32]));
            Xts128::new(cipher_1, cipher_2).encrypt_sector(buf, tweak);
        }
        CipherKind::Aes256Xts => {
            let cipher_1 = Aes256::new(GenericArray::from_slice(&key[..32]));
            let cipher_2 = Aes256::new(GenericArray::from_slice(&key[32..64]));
            Xts128::new(cipher_1, cipher_2).encrypt_sector(buf, tweak);
        }
    }
}

/// Identifies the combination protecting a header slot by trial decryption
///
/// For each PRF entry a [`MAX_KEYSZ`] byte key is derived over the slot
/// salt, then each cipher entry attempts decrypt and verify. The first
/// acceptable header wins and the accepting pair is captured on the spot;
/// individual attempt failures are logged at debug level only. Exhaustion
/// yields [`VolumeError::NotRecognized`].
pub fn recognize(
    pass: &[u8],
    ehdr: &EncHdr,
) -> Result<(TcHdr, &'static CryptoAlgo, &'static PbkdfPrf), VolumeError> {
    let mut key = SecureBuf::new(MAX_KEYSZ)?;
    for prf in &PBKDF_PRF_ALGOS {
        debug!("trying PRF {} ({} iterations)", prf.hash, prf.iterations);
        derive_key(prf, pass, ehdr.salt(), &mut key);
        for cipher in &CRYPTO_ALGOS {
            debug!("trying cipher {}", cipher.name);
            let mut dhdr = match hdr::decrypt_hdr(ehdr, cipher, &key) {
                Ok(dhdr) => dhdr,
                Err(e) => {
                    debug!("header decryption failed: {e}");
                    continue;
                }
            };
            if dhdr.verify() {
                debug!(
                    "header accepted: version {}, min reader version {:#06x}, \
                     volume size {}, mk scope {}@{}, flags {:#x}",
                    dhdr.tc_ver,
                    dhdr.tc_min_ver,
                    dhdr.sz_vol,
                    dhdr.sz_mk_scope,
                    dhdr.off_mk_scope,
                    dhdr.flags
                );
                return Ok((dhdr, cipher, prf));
            }
        }
    }
    Err(VolumeError::NotRecognized)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trial_order_is_fixed() {
        let order: Vec<(PrfHash, u32)> = PBKDF_PRF_ALGOS
            .iter()
            .map(|p| (p.hash, p.iterations))
            .collect();
        assert_eq!(
            order,
            vec![
                (PrfHash::Ripemd160, 2000),
                (PrfHash::Ripemd160, 1000),
                (PrfHash::Sha512, 1000),
                (PrfHash::Whirlpool, 1000),
            ]
        );
        assert_eq!(CRYPTO_ALGOS[0].name, "AES-128-XTS");
        assert_eq!(CRYPTO_ALGOS[1].name, "AES-256-XTS");
    }

    #[test]
    fn xts_round_trip_both_ciphers() {
        let key: Vec<u8> = (0u8..=191).map(|b| b.wrapping_mul(251)).collect();
        for cipher in &CRYPTO_ALGOS {
            let mut buf = [0u8; 448];
            for (i, b) in buf.iter_mut().enumerate() {
                *b = (i % 251) as u8;
            }
            let plain = buf;
            encrypt_region(cipher, &key, &mut buf);
            assert_ne!(buf, plain);
            decrypt_region(cipher, &key, &mut buf);
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn derived_keys_differ_per_prf() {
        let salt = [0x5au8; 64];
        let mut keys: Vec<[u8; 32]> = Vec::new();
        for prf in &PBKDF_PRF_ALGOS {
            let mut out = [0u8; 32];
            derive_key(prf, b"swordfish", &salt, &mut out);
            keys.push(out);
        }
        for i in 0..keys.len() {
            for j in i + 1..keys.len() {
                assert_ne!(keys[i], keys[j], "PRF entries {i} and {j} collided");
            }
        }
    }

    #[test]
    fn empty_passphrase_derives_deterministically() {
        let salt = [0x17u8; 64];
        let prf = &PBKDF_PRF_ALGOS[2];
        let mut one = [0u8; 64];
        let mut two = [0u8; 64];
        derive_key(prf, b"", &salt, &mut one);
        derive_key(prf, b"", &salt, &mut two);
        assert_eq!(one, two);
        assert_ne!(one, [0u8; 64]);
    }
}
