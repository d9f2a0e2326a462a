//! Guarded, page-locked buffers for secrets
//!
//! Every buffer that transiently holds a passphrase, keyfile content, a
//! derived key, a decrypted header or mapping parameters is a [`SecureBuf`]:
//! a single zero-initialized heap region, locked against paging, bracketed
//! by guard signatures. The destructor verifies both guards, wipes the whole
//! region and unlocks it; a damaged guard means an under- or overflow wrote
//! through a secret buffer, which aborts the process.

use crate::VolumeError;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use tracing::error;
use zeroize::Zeroize;

const GUARD_SIG: [u8; 8] = *b"SAFEMEM\0";
/// Guard signature plus the total allocation size
const GUARD_HDRSZ: usize = GUARD_SIG.len() + std::mem::size_of::<u64>();
const GUARD_TAILSZ: usize = GUARD_SIG.len();

/// A page-locked buffer which is zeroed on allocation and on release
pub struct SecureBuf {
    base: NonNull<u8>,
    layout: Layout,
    len: usize,
}

impl SecureBuf {
    /// Allocates a zeroed, guarded, page-locked buffer of `len` bytes
    pub fn new(len: usize) -> Result<Self, VolumeError> {
        let total = GUARD_HDRSZ + len + GUARD_TAILSZ;
        let layout = Layout::from_size_align(total, 8).map_err(|_| VolumeError::OutOfMemory)?;
        // Safety: total is never 0 thanks to the guard regions
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(VolumeError::OutOfMemory)?;
        if unsafe { libc::mlock(base.as_ptr().cast(), total) } != 0 {
            unsafe { dealloc(base.as_ptr(), layout) };
            return Err(VolumeError::OutOfMemory);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(GUARD_SIG.as_ptr(), base.as_ptr(), GUARD_SIG.len());
            std::ptr::copy_nonoverlapping(
                (total as u64).to_ne_bytes().as_ptr(),
                base.as_ptr().add(GUARD_SIG.len()),
                std::mem::size_of::<u64>(),
            );
            std::ptr::copy_nonoverlapping(
                GUARD_SIG.as_ptr(),
                base.as_ptr().add(GUARD_HDRSZ + len),
                GUARD_SIG.len(),
            );
        }
        Ok(Self { base, layout, len })
    }

    fn total(&self) -> usize {
        self.layout.size()
    }

    /// Both guard signatures and the recorded size are undamaged
    fn guards_intact(&self) -> bool {
        let whole = unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.total()) };
        let mut stored = [0u8; 8];
        stored.copy_from_slice(&whole[GUARD_SIG.len()..GUARD_HDRSZ]);
        whole[..GUARD_SIG.len()] == GUARD_SIG
            && u64::from_ne_bytes(stored) == self.total() as u64
            && whole[GUARD_HDRSZ + self.len..] == GUARD_SIG
    }
}

impl Deref for SecureBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(GUARD_HDRSZ), self.len) }
    }
}

impl DerefMut for SecureBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(GUARD_HDRSZ), self.len) }
    }
}

impl Drop for SecureBuf {
    fn drop(&mut self) {
        if !self.guards_intact() {
            error!("secure buffer under- or overflow detected");
            std::process::abort();
        }
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr(), self.total()).zeroize();
            libc::munlock(self.base.as_ptr().cast(), self.total());
            dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for SecureBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "SecureBuf({} bytes)", self.len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zeroed_on_allocation() {
        let buf = SecureBuf::new(128).unwrap();
        assert_eq!(buf.len(), 128);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(buf.guards_intact());
    }

    #[test]
    fn payload_read_write() {
        let mut buf = SecureBuf::new(32).unwrap();
        buf[0] = 0xa5;
        buf[31] = 0x5a;
        buf[1..31].fill(0x42);
        assert_eq!(buf[0], 0xa5);
        assert_eq!(buf[31], 0x5a);
        assert!(buf.guards_intact());
    }

    #[test]
    fn tail_overflow_detected() {
        let buf = SecureBuf::new(16).unwrap();
        unsafe {
            *buf.base.as_ptr().add(GUARD_HDRSZ + buf.len) ^= 0xff;
        }
        assert!(!buf.guards_intact());
        // the destructor would (rightfully) abort the test runner
        std::mem::forget(buf);
    }

    #[test]
    fn header_underflow_detected() {
        let buf = SecureBuf::new(16).unwrap();
        unsafe {
            *buf.base.as_ptr() ^= 0xff;
        }
        assert!(!buf.guards_intact());
        std::mem::forget(buf);
    }
}
