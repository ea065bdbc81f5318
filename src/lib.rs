//! asymmetricfs: an encrypting overlay filesystem in userspace
//!
//! Files written through the mount accumulate in memory as plaintext and are
//! persisted to the backing directory only as armored ciphertext produced by
//! an external public-key encryption tool (gpg by default). Reads decrypt on
//! demand when the mount is read-write, and are refused when it is
//! write-only.

#![warn(missing_debug_implementations, rust_2018_idioms)]

use std::io;

use nix::errno::Errno;

pub use crate::config::AccessMode;
pub use crate::config::MemoryLock;
pub use crate::fs::AsymmetricFs;
pub use crate::fuse::AsymmetricFuse;
pub use crate::gpg::Gpg;
pub use crate::gpg::Recipient;
pub use crate::open_flags::OpenFlags;

pub mod config;
pub mod file;
pub mod fs;
pub mod fuse;
pub mod gpg;
pub mod open_flags;
pub mod pages;
pub mod subprocess;

/// Maps an I/O error onto the errno it carries. Synthetic errors without an
/// OS code collapse to `EIO`.
pub(crate) fn errno_of(err: &io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}
