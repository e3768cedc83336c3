//! Minimal `fd_set` wrapper for building the read/write/exception
//! descriptor sets covering TUN and every live flow's socket. The
//! `libc` crate exposes
//! the C `fd_set` type but, since its bit storage is a private field, not
//! the `FD_SET`/`FD_CLR`/`FD_ISSET` macros; this reimplements the same
//! bit layout glibc uses (an array of `FD_SETSIZE` bits) so the pointer
//! can be handed straight to `pselect`.

use std::os::unix::io::RawFd;

const FD_SETSIZE: usize = 1024;
const BITS_PER_WORD: usize = 64;
const WORDS: usize = FD_SETSIZE / BITS_PER_WORD;

#[repr(C)]
pub struct FdSet {
    bits: [u64; WORDS],
}

impl FdSet {
    pub fn empty() -> Self {
        FdSet { bits: [0; WORDS] }
    }

    pub fn set(&mut self, fd: RawFd) {
        debug_assert!((fd as usize) < FD_SETSIZE);
        let fd = fd as usize;
        self.bits[fd / BITS_PER_WORD] |= 1u64 << (fd % BITS_PER_WORD);
    }

    pub fn is_set(&self, fd: RawFd) -> bool {
        let fd = fd as usize;
        fd < FD_SETSIZE && self.bits[fd / BITS_PER_WORD] & (1u64 << (fd % BITS_PER_WORD)) != 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.bits as *mut [u64; WORDS] as *mut libc::fd_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_fds_are_reported_as_set_and_others_are_not() {
        let mut set = FdSet::empty();
        set.set(3);
        set.set(17);
        assert!(set.is_set(3));
        assert!(set.is_set(17));
        assert!(!set.is_set(4));
        assert!(!set.is_set(0));
    }
}
