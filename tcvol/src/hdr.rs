//! Volume header codec
//!
//! A volume header occupies 512 bytes on disk: a 64 byte plaintext salt
//! followed by 448 bytes of ciphertext under AES-XTS with a zero tweak. The
//! decrypted layout is big-endian except for the minimum-reader version,
//! which is little-endian.

use crate::crypto::{self, CryptoAlgo};
use crate::safemem::SecureBuf;
use crate::VolumeError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, warn};

/// On-disk header size
pub const HDRSZ: usize = 512;
/// Plaintext salt bytes leading the header
pub const SALTSZ: usize = 64;
/// Encrypted header region size
pub const HDR_ENCSZ: usize = HDRSZ - SALTSZ;
/// Primary header offset on the system disk under whole-system encryption
pub const HDR_OFFSET_SYS: u64 = 31744;
/// Hidden volume header offset
pub const HDR_OFFSET_HIDDEN: u64 = 65536;

const TC_SIG: [u8; 4] = *b"TRUE";
const KEYSSZ: usize = 256;
const KEYS_OFFSET: usize = 192;
const CRC_DHDR_OFFSET: usize = 188;

/// Big endian `u16` reader
#[inline]
fn rdu16be<R: Read>(r: &mut R) -> Result<u16, std::io::Error> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Little endian `u16` reader
#[inline]
fn rdu16le<R: Read>(r: &mut R) -> Result<u16, std::io::Error> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

/// Big endian `u32` reader
#[inline]
fn rdu32be<R: Read>(r: &mut R) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Big endian `u64` reader
#[inline]
fn rdu64be<R: Read>(r: &mut R) -> Result<u64, std::io::Error> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// A raw encrypted header slot
#[derive(Debug)]
pub struct EncHdr {
    raw: SecureBuf,
}

impl EncHdr {
    /// Reads the header slot at `offset` of `dev` into secure memory
    pub fn read_at(dev: &Path, offset: u64) -> Result<Self, VolumeError> {
        let mut f = File::open(dev)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut raw = SecureBuf::new(HDRSZ)?;
        f.read_exact(&mut raw)?;
        Ok(Self { raw })
    }

    /// Wraps an in-memory header slot (fixtures, tests)
    pub fn from_raw(raw: SecureBuf) -> Result<Self, VolumeError> {
        if raw.len() != HDRSZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid header slot size ({})", raw.len()),
            )
            .into());
        }
        Ok(Self { raw })
    }

    /// The plaintext PBKDF2 salt
    pub fn salt(&self) -> &[u8] {
        &self.raw[..SALTSZ]
    }

    /// The encrypted header region
    pub fn ciphertext(&self) -> &[u8] {
        &self.raw[SALTSZ..]
    }
}

/// A decrypted volume header
///
/// All multibyte fields are converted to host order on parse; `keys` stays
/// in secure memory.
#[derive(Debug)]
pub struct TcHdr {
    sig: [u8; 4],
    /// Header version; only 3 and 4 pass verification
    pub tc_ver: u16,
    /// Minimum reader version, informational
    pub tc_min_ver: u16,
    /// CRC32 over the keys region
    pub crc_keys: u32,
    /// Volume creation time, informational
    pub vol_ctime: u64,
    /// Header creation time, informational
    pub hdr_ctime: u64,
    /// Hidden volume size in bytes, 0 when absent
    pub sz_hidvol: u64,
    /// Volume data size in bytes
    pub sz_vol: u64,
    /// Byte offset of the master-key scope
    pub off_mk_scope: u64,
    /// Byte length of the master-key scope
    pub sz_mk_scope: u64,
    /// Volume flags
    pub flags: u32,
    /// Sector size; forced to 512 on acceptance of a version 3 or 4 header
    pub sec_sz: u32,
    /// CRC32 over the decrypted fields, informational
    pub crc_dhdr: u32,
    keys: SecureBuf,
}

impl TcHdr {
    /// Parses a decrypted header region
    pub(crate) fn parse(dec: &[u8]) -> Result<Self, VolumeError> {
        if dec.len() != HDR_ENCSZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid decrypted header size ({})", dec.len()),
            )
            .into());
        }
        let mut r = &dec[..];
        let mut sig = [0u8; 4];
        r.read_exact(&mut sig)?;
        let tc_ver = rdu16be(&mut r)?;
        let tc_min_ver = rdu16le(&mut r)?;
        let crc_keys = rdu32be(&mut r)?;
        let vol_ctime = rdu64be(&mut r)?;
        let hdr_ctime = rdu64be(&mut r)?;
        let sz_hidvol = rdu64be(&mut r)?;
        let sz_vol = rdu64be(&mut r)?;
        let off_mk_scope = rdu64be(&mut r)?;
        let sz_mk_scope = rdu64be(&mut r)?;
        let flags = rdu32be(&mut r)?;
        let sec_sz = rdu32be(&mut r)?;
        let crc_dhdr = rdu32be(&mut &dec[CRC_DHDR_OFFSET..])?;
        let mut keys = SecureBuf::new(KEYSSZ)?;
        keys.copy_from_slice(&dec[KEYS_OFFSET..KEYS_OFFSET + KEYSSZ]);
        Ok(Self {
            sig,
            tc_ver,
            tc_min_ver,
            crc_keys,
            vol_ctime,
            hdr_ctime,
            sz_hidvol,
            sz_vol,
            off_mk_scope,
            sz_mk_scope,
            flags,
            sec_sz,
            crc_dhdr,
            keys,
        })
    }

    /// The raw master-key material
    pub fn keys(&self) -> &[u8] {
        &self.keys
    }

    /// Structural validation of a candidate header
    ///
    /// The header is acceptable iff the signature matches, the CRC32 of the
    /// keys region matches `crc_keys` and the version is 3 or 4. The
    /// advertised sector size of an accepted header is overridden to 512.
    pub fn verify(&mut self) -> bool {
        if self.sig != TC_SIG {
            debug!("header signature mismatch");
            return false;
        }
        if crc32fast::hash(&self.keys) != self.crc_keys {
            debug!("keys region crc32 mismatch");
            return false;
        }
        match self.tc_ver {
            1 | 2 => {
                warn!("header version {} is not supported", self.tc_ver);
                false
            }
            3 | 4 => {
                self.sec_sz = 512;
                true
            }
            v => {
                debug!("unrecognized header version {v}");
                false
            }
        }
    }
}

/// Decrypts a header slot with the given cipher and key material
///
/// Only the 448 byte ciphertext region is decrypted; the salt bytes are
/// never interpreted. The decrypted image transits through secure memory
/// and only the parsed [`TcHdr`] survives.
pub fn decrypt_hdr(ehdr: &EncHdr, cipher: &CryptoAlgo, key: &[u8]) -> Result<TcHdr, VolumeError> {
    let mut dec = SecureBuf::new(HDR_ENCSZ)?;
    dec.copy_from_slice(ehdr.ciphertext());
    crypto::decrypt_region(cipher, key, &mut dec);
    TcHdr::parse(&dec)
}
