//! Keyfile mixing
//!
//! Keyfiles are folded into a fixed 64 byte key pool which is then added
//! byte-wise into the passphrase buffer. The fold is driven by the running
//! (intermediate) CRC32 state over the keyfile content: the raw LFSR state
//! without the final XOR, which is why the step is table-driven here instead
//! of going through `crc32fast`.

use crate::safemem::SecureBuf;
use crate::VolumeError;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Passphrase buffer size; also the effective passphrase length whenever
/// keyfiles are in use
pub const MAX_PASSSZ: usize = 64;
/// Key pool size
pub const KPOOL_SZ: usize = 64;
/// Keyfile bytes beyond this limit do not influence the pool
pub const MAX_KFILE_SZ: u64 = 1024 * 1024;
/// Upper bound on the number of keyfiles
pub const MAX_KEYFILES: usize = 256;

const fn make_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut b = 0;
    while b < 256 {
        let mut rmd = b as u32;
        let mut bit = 0;
        while bit < 8 {
            rmd = if rmd & 1 != 0 {
                (rmd >> 1) ^ 0xedb88320
            } else {
                rmd >> 1
            };
            bit += 1;
        }
        table[b] = rmd;
        b += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = make_crc32_table();

/// One CRC32 step over the raw LFSR state (no final XOR)
#[inline]
fn crc32_step(crc: u32, b: u8) -> u32 {
    CRC32_TABLE[((crc as u8) ^ b) as usize] ^ (crc >> 8)
}

/// Index of the first NUL, or the full length when none is present
pub(crate) fn strlen(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == 0).unwrap_or(buf.len())
}

/// Keyfile content, capped at `limit` bytes, in secure memory
fn read_keyfile(path: &Path, limit: u64) -> Result<SecureBuf, VolumeError> {
    let f = File::open(path)?;
    let sz = f.metadata()?.len().min(limit);
    let mut data = SecureBuf::new(usize::try_from(sz).map_err(|_| VolumeError::OutOfMemory)?)?;
    let mut r = f.take(sz);
    let mut filled = 0;
    while filled < data.len() {
        let n = r.read(&mut data[filled..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("keyfile {} shrank while being read", path.display()),
            )
            .into());
        }
        filled += n;
    }
    Ok(data)
}

/// Folds the keyfiles into the passphrase buffer, in place
///
/// The passphrase is NUL padded past its terminator, each keyfile is folded
/// into the key pool through the intermediate CRC32 state (the four
/// big-endian state bytes are added mod 256 at a pool cursor advancing by 4
/// per content byte, wrapping at [`KPOOL_SZ`]), and the pool is finally
/// added mod 256 into the first [`KPOOL_SZ`] passphrase bytes.
///
/// An empty keyfile list leaves the buffer untouched.
pub fn apply_keyfiles<P: AsRef<Path>>(
    pass: &mut SecureBuf,
    keyfiles: &[P],
) -> Result<(), VolumeError> {
    apply_keyfiles_capped(pass, keyfiles, MAX_KFILE_SZ)
}

fn apply_keyfiles_capped<P: AsRef<Path>>(
    pass: &mut SecureBuf,
    keyfiles: &[P],
    kfile_cap: u64,
) -> Result<(), VolumeError> {
    if keyfiles.is_empty() {
        return Ok(());
    }
    if pass.len() < MAX_PASSSZ {
        return Err(VolumeError::OutOfMemory);
    }
    let pl = strlen(&pass[..MAX_PASSSZ]);
    pass[pl..MAX_PASSSZ].fill(0);

    let mut kpool = SecureBuf::new(KPOOL_SZ)?;
    for kf in keyfiles {
        let kf = kf.as_ref();
        debug!("loading keyfile {} into the key pool", kf.display());
        let kdata = read_keyfile(kf, kfile_cap)?;
        let mut crc: u32 = !0;
        let mut idx = 0;
        for &b in kdata.iter() {
            crc = crc32_step(crc, b);
            for s in crc.to_be_bytes() {
                kpool[idx] = kpool[idx].wrapping_add(s);
                idx += 1;
            }
            if idx == KPOOL_SZ {
                idx = 0;
            }
        }
    }

    debug!("applying the key pool to the passphrase");
    for i in 0..KPOOL_SZ {
        pass[i] = pass[i].wrapping_add(kpool[i]);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn passbuf(pass: &[u8]) -> SecureBuf {
        let mut buf = SecureBuf::new(MAX_PASSSZ).unwrap();
        buf[..pass.len()].copy_from_slice(pass);
        buf
    }

    fn keyfile_fixture(dir: &std::path::Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    /// Independent model of the fold: the intermediate CRC32 state after a
    /// prefix equals the bit-inverse of the finalized CRC32 of that prefix
    fn model_pool(files: &[&[u8]]) -> [u8; KPOOL_SZ] {
        let mut pool = [0u8; KPOOL_SZ];
        for data in files {
            let mut idx = 0;
            for i in 0..data.len() {
                let state = !crc32fast::hash(&data[..=i]);
                for s in state.to_be_bytes() {
                    pool[idx] = pool[idx].wrapping_add(s);
                    idx += 1;
                }
                if idx == KPOOL_SZ {
                    idx = 0;
                }
            }
        }
        pool
    }

    #[test]
    fn empty_list_is_a_no_op() {
        let mut pass = passbuf(b"secret");
        apply_keyfiles(&mut pass, &[] as &[&Path]).unwrap();
        assert_eq!(&pass[..6], b"secret");
        assert!(pass[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn two_keyfiles_match_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let a = keyfile_fixture(dir.path(), "a.key", &[0x00; 10]);
        let b = keyfile_fixture(dir.path(), "b.key", &[0xff; 10]);

        let mut pass = passbuf(b"p");
        apply_keyfiles(&mut pass, &[&a, &b]).unwrap();

        let pool = model_pool(&[&[0x00; 10], &[0xff; 10]]);
        let mut expected = [0u8; MAX_PASSSZ];
        expected[0] = b'p';
        for i in 0..KPOOL_SZ {
            expected[i] = expected[i].wrapping_add(pool[i]);
        }
        assert_eq!(&pass[..], &expected[..]);
    }

    #[test]
    fn pool_cursor_wraps() {
        // 16 content bytes fill the pool exactly; 68 wrap the cursor four times
        let content: Vec<u8> = (0u8..68).collect();
        let dir = tempfile::tempdir().unwrap();
        let kf = keyfile_fixture(dir.path(), "wrap.key", &content);

        let mut pass = passbuf(b"wrap");
        apply_keyfiles(&mut pass, &[&kf]).unwrap();

        let pool = model_pool(&[&content]);
        let mut expected = [0u8; MAX_PASSSZ];
        expected[..4].copy_from_slice(b"wrap");
        for i in 0..KPOOL_SZ {
            expected[i] = expected[i].wrapping_add(pool[i]);
        }
        assert_eq!(&pass[..], &expected[..]);
    }

    #[test]
    fn oversized_keyfile_is_truncated() {
        let content: Vec<u8> = (0u8..32).map(|b| b.wrapping_mul(11)).collect();
        let dir = tempfile::tempdir().unwrap();
        let long = keyfile_fixture(dir.path(), "long.key", &content);
        let short = keyfile_fixture(dir.path(), "short.key", &content[..16]);

        let mut capped = passbuf(b"k");
        apply_keyfiles_capped(&mut capped, &[&long], 16).unwrap();
        let mut reference = passbuf(b"k");
        apply_keyfiles(&mut reference, &[&short]).unwrap();
        assert_eq!(&capped[..], &reference[..]);
    }

    #[test]
    fn deterministic_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let kf = keyfile_fixture(dir.path(), "det.key", b"some keyfile material");
        let mut one = passbuf(b"fixed");
        let mut two = passbuf(b"fixed");
        apply_keyfiles(&mut one, &[&kf]).unwrap();
        apply_keyfiles(&mut two, &[&kf]).unwrap();
        assert_eq!(&one[..], &two[..]);
    }

    #[test]
    fn missing_keyfile_is_an_io_error() {
        let mut pass = passbuf(b"x");
        let missing = Path::new("/nonexistent/keyfile");
        match apply_keyfiles(&mut pass, &[missing]) {
            Err(VolumeError::Io(_)) => {}
            other => panic!("expected an IO error, got {other:?}"),
        }
    }
}
