//! Mount-time configuration shared across the filesystem core.

use std::str::FromStr;

/// Whether the mount may decrypt at all.
///
/// The mode is fixed for the lifetime of the mount: `ReadWrite` decrypts the
/// backing ciphertext on first read, `WriteOnly` never invokes the decryptor
/// and denies read access except to files created through the mount itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// Decrypt on demand; the full POSIX surface is available.
    ReadWrite,
    /// Never decrypt; reads are denied except on freshly created files.
    WriteOnly,
}

impl AccessMode {
    /// True when decryption (and therefore general read access) is allowed.
    pub fn read_allowed(self) -> bool {
        self == AccessMode::ReadWrite
    }
}

/// Policy for pinning plaintext pages into RAM.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MemoryLock {
    /// `mlockall(MCL_CURRENT | MCL_FUTURE)` at startup; failure is fatal.
    All,
    /// Each page allocation is `mlock`ed individually; quota exhaustion
    /// surfaces as an out-of-memory condition on the failing operation.
    Buffers,
    /// No locking.
    #[default]
    None,
}

impl MemoryLock {
    /// Whether individual page allocations must be locked at creation.
    ///
    /// Under `All` the startup-wide `mlockall` already covers future
    /// mappings, so per-allocation locking is only needed for `Buffers`.
    pub fn lock_buffers(self) -> bool {
        self == MemoryLock::Buffers
    }
}

impl FromStr for MemoryLock {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "all" => Ok(MemoryLock::All),
            "buffers" => Ok(MemoryLock::Buffers),
            "none" => Ok(MemoryLock::None),
            other => Err(format!("unknown memory-lock policy {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_lock_parses() {
        assert_eq!("all".parse(), Ok(MemoryLock::All));
        assert_eq!("buffers".parse(), Ok(MemoryLock::Buffers));
        assert_eq!("none".parse(), Ok(MemoryLock::None));
        assert!(MemoryLock::from_str("everything").is_err());
    }

    #[test]
    fn only_read_write_mode_may_decrypt() {
        assert!(AccessMode::ReadWrite.read_allowed());
        assert!(!AccessMode::WriteOnly.read_allowed());
    }

    #[test]
    fn only_buffers_locks_allocations() {
        assert!(!MemoryLock::All.lock_buffers());
        assert!(MemoryLock::Buffers.lock_buffers());
        assert!(!MemoryLock::None.lock_buffers());
    }
}
