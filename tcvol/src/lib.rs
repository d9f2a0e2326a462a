//! # TrueCrypt volume unlocking
//!
//! This crate recognizes and unlocks encrypted volumes following the
//! TrueCrypt on-disk format:
//! - guarded, page-locked buffers for everything that transiently holds
//!   secrets ([`safemem`])
//! - keyfile folding into the passphrase ([`keyfile`])
//! - the 512 byte volume header codec ([`hdr`])
//! - recognition of the key-derivation and cipher combination protecting a
//!   header by trial decryption ([`crypto`])
//!
//! Volume format support:
//! - [x] header versions 3 and 4
//! - [x] hidden volumes
//! - [x] system encryption (header on a separate disk)
//! - [ ] header versions 1 and 2
//! - [ ] cascaded ciphers
//! - [ ] LRW mode
//!
//! On success [`open_volume`] yields a [`VolumeInfo`] carrying everything a
//! dm-crypt mapping needs: sector counts, IV and block offsets and the hex
//! encoded master key.

pub mod crypto;
pub mod hdr;
pub mod keyfile;
pub mod safemem;

use crypto::{CryptoAlgo, PbkdfPrf};
use hdr::{EncHdr, TcHdr, HDR_OFFSET_HIDDEN, HDR_OFFSET_SYS};
use keyfile::MAX_PASSSZ;
use safemem::SecureBuf;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum VolumeError {
    /// Wrapper for [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html)
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),

    /// Secure memory could not be allocated or locked against paging
    #[error("failed to allocate locked secure memory")]
    OutOfMemory,

    /// The recognition loop was exhausted without a match
    ///
    /// Deliberately ambiguous: a wrong passphrase and a medium that never was
    /// a TrueCrypt volume are indistinguishable by design.
    #[error("Incorrect password or not a TrueCrypt volume")]
    NotRecognized,
}

/// Everything needed to present an unlocked volume through dm-crypt
#[derive(Debug)]
pub struct VolumeInfo {
    dev: PathBuf,
    cipher: &'static CryptoAlgo,
    prf: &'static PbkdfPrf,
    hdr: TcHdr,
    start: u64,
    size: u64,
    skip: u64,
    offset: u64,
    key_hex: SecureBuf,
}

impl VolumeInfo {
    fn new(
        dev: &Path,
        cipher: &'static CryptoAlgo,
        prf: &'static PbkdfPrf,
        hdr: TcHdr,
    ) -> Result<Self, VolumeError> {
        let sec_sz = u64::from(hdr.sec_sz);
        let size = hdr.sz_mk_scope / sec_sz;
        let skip = hdr.off_mk_scope / sec_sz;
        let offset = hdr.off_mk_scope / sec_sz;
        const HEXDIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut key_hex = SecureBuf::new(cipher.klen * 2)?;
        for (i, b) in hdr.keys()[..cipher.klen].iter().enumerate() {
            key_hex[i * 2] = HEXDIGITS[usize::from(b >> 4)];
            key_hex[i * 2 + 1] = HEXDIGITS[usize::from(b & 0xf)];
        }
        Ok(Self {
            dev: dev.to_path_buf(),
            cipher,
            prf,
            hdr,
            start: 0,
            size,
            skip,
            offset,
            key_hex,
        })
    }

    /// Path of the device holding the volume data
    pub fn dev(&self) -> &Path {
        &self.dev
    }

    /// The cipher the header was accepted under
    pub fn cipher(&self) -> &'static CryptoAlgo {
        self.cipher
    }

    /// The PBKDF2 PRF the header was accepted under
    pub fn prf(&self) -> &'static PbkdfPrf {
        self.prf
    }

    /// The accepted decrypted header
    pub fn hdr(&self) -> &TcHdr {
        &self.hdr
    }

    /// Mapping start sector (always 0)
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Mapping length in sectors
    pub fn size(&self) -> u64 {
        self.size
    }

    /// IV offset in sectors
    pub fn skip(&self) -> u64 {
        self.skip
    }

    /// Data offset in sectors on the underlying device
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The master key as lowercase hex (2 characters per key byte)
    pub fn key_hex(&self) -> &str {
        std::str::from_utf8(&self.key_hex).unwrap() // always ASCII hex digits
    }

    /// The dm-crypt target parameter line
    ///
    /// Format: `«cipher» «hex-key» «iv-offset» «device» «block-offset»`.
    /// The line embeds the master key, hence the secure buffer.
    pub fn dm_params(&self) -> Result<SecureBuf, VolumeError> {
        let head = self.cipher.dm_crypt_str.as_bytes();
        let tail = format!(
            " {} {} {}",
            self.skip,
            self.dev.to_string_lossy(),
            self.offset
        );
        let mut params =
            SecureBuf::new(head.len() + 1 + self.key_hex.len() + tail.len())?;
        let mut at = 0;
        for part in [head, b" ".as_slice(), &self.key_hex, tail.as_bytes()] {
            params[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        Ok(params)
    }
}

/// Unlocks a TrueCrypt volume
///
/// Applies the keyfiles (if any) to the passphrase buffer, reads the primary
/// header (offset 0, or [`hdr::HDR_OFFSET_SYS`] on the separate disk when the
/// volume is part of whole-system encryption) and the hidden volume header
/// ([`hdr::HDR_OFFSET_HIDDEN`], skipped in system encryption mode), then runs
/// the recognition loop against each slot in turn, primary first.
///
/// `pass` must be at least [`MAX_PASSSZ`] bytes; whenever keyfiles are
/// present, the full [`MAX_PASSSZ`] buffer is the effective passphrase
/// regardless of the NUL terminated prefix.
pub fn open_volume<P: AsRef<Path>>(
    dev: &Path,
    sys_dev: Option<&Path>,
    pass: &mut SecureBuf,
    keyfiles: &[P],
) -> Result<VolumeInfo, VolumeError> {
    let passlen = if keyfiles.is_empty() {
        keyfile::strlen(pass)
    } else {
        keyfile::apply_keyfiles(pass, keyfiles)?;
        MAX_PASSSZ
    };

    let ehdr = match sys_dev {
        Some(disk) => EncHdr::read_at(disk, HDR_OFFSET_SYS)?,
        None => EncHdr::read_at(dev, 0)?,
    };
    let hidden_ehdr = match sys_dev {
        Some(_) => None,
        None => Some(EncHdr::read_at(dev, HDR_OFFSET_HIDDEN)?),
    };

    match crypto::recognize(&pass[..passlen], &ehdr) {
        Ok((dhdr, cipher, prf)) => return VolumeInfo::new(dev, cipher, prf, dhdr),
        Err(VolumeError::NotRecognized) => debug!("primary header slot not recognized"),
        Err(e) => return Err(e),
    }
    if let Some(hehdr) = hidden_ehdr {
        match crypto::recognize(&pass[..passlen], &hehdr) {
            Ok((dhdr, cipher, prf)) => return VolumeInfo::new(dev, cipher, prf, dhdr),
            Err(VolumeError::NotRecognized) => debug!("hidden header slot not recognized"),
            Err(e) => return Err(e),
        }
    }
    Err(VolumeError::NotRecognized)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::CRYPTO_ALGOS;

    fn synthetic_hdr(sz_mk_scope: u64, off_mk_scope: u64) -> TcHdr {
        let mut image = [0u8; hdr::HDR_ENCSZ];
        image[0..4].copy_from_slice(b"TRUE");
        image[4..6].copy_from_slice(&4u16.to_be_bytes());
        image[6..8].copy_from_slice(&0x0600u16.to_le_bytes());
        for (i, b) in image[192..448].iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(13).wrapping_add(7);
        }
        let crc = crc32fast::hash(&image[192..448]);
        image[8..12].copy_from_slice(&crc.to_be_bytes());
        image[36..44].copy_from_slice(&(sz_mk_scope + off_mk_scope).to_be_bytes());
        image[44..52].copy_from_slice(&off_mk_scope.to_be_bytes());
        image[52..60].copy_from_slice(&sz_mk_scope.to_be_bytes());
        image[64..68].copy_from_slice(&512u32.to_be_bytes());
        let mut h = TcHdr::parse(&image).unwrap();
        assert!(h.verify());
        h
    }

    #[test]
    fn descriptor_arithmetic() {
        let h = synthetic_hdr(261632 * 512, 256 * 512);
        let cipher = &CRYPTO_ALGOS[1];
        let prf = &crypto::PBKDF_PRF_ALGOS[0];
        let info =
            VolumeInfo::new(Path::new("/dev/loop7"), cipher, prf, h).unwrap();
        assert_eq!(info.start(), 0);
        assert_eq!(info.size(), 261632);
        assert_eq!(info.skip(), 256);
        assert_eq!(info.offset(), 256);
        let key = info.key_hex();
        assert_eq!(key.len(), 2 * cipher.klen);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn dm_parameter_line() {
        let h = synthetic_hdr(261632 * 512, 256 * 512);
        let cipher = &CRYPTO_ALGOS[1];
        let prf = &crypto::PBKDF_PRF_ALGOS[0];
        let info =
            VolumeInfo::new(Path::new("/dev/loop7"), cipher, prf, h).unwrap();
        let params = info.dm_params().unwrap();
        let expected = format!(
            "aes-xts-plain {} 256 /dev/loop7 256",
            info.key_hex()
        );
        assert_eq!(std::str::from_utf8(&params).unwrap(), expected);
    }
}
