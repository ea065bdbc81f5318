use std::fmt;
use std::fmt::Formatter;
use std::fmt::LowerHex;
use std::fmt::UpperHex;

/// How the file should be opened: read-only, write-only, or read-write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    /// Open file for reading only.
    O_RDONLY = libc::O_RDONLY,
    /// Open file for writing only.
    O_WRONLY = libc::O_WRONLY,
    /// Open file for reading and writing.
    O_RDWR = libc::O_RDWR,
}

/// Open flags as passed to the open and create operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl LowerHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

impl UpperHex for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        UpperHex::fmt(&self.0, f)
    }
}

impl OpenFlags {
    /// File access mode.
    pub fn acc_mode(self) -> OpenAccMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_RDONLY => OpenAccMode::O_RDONLY,
            libc::O_WRONLY => OpenAccMode::O_WRONLY,
            libc::O_RDWR => OpenAccMode::O_RDWR,
            _ => {
                // Impossible combination of flags.
                // Do not panic because the field is public.
                OpenAccMode::O_RDONLY
            }
        }
    }

    /// Whether the caller asked for read access.
    pub fn read_requested(self) -> bool {
        self.acc_mode() != OpenAccMode::O_WRONLY
    }

    /// `O_APPEND` was given.
    pub fn append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }

    /// `O_CREAT` was given.
    pub fn create(self) -> bool {
        self.0 & libc::O_CREAT != 0
    }

    /// `O_EXCL` was given.
    pub fn excl(self) -> bool {
        self.0 & libc::O_EXCL != 0
    }

    /// `O_TRUNC` was given.
    pub fn truncate(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    /// Returns the flags with the given bits added.
    pub fn with(self, bits: i32) -> OpenFlags {
        OpenFlags(self.0 | bits)
    }

    /// Returns the flags with the access mode replaced.
    pub fn acc_replaced(self, acc: OpenAccMode) -> OpenFlags {
        OpenFlags((self.0 & !libc::O_ACCMODE) | acc as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acc_mode_decodes() {
        assert_eq!(OpenFlags(libc::O_RDONLY).acc_mode(), OpenAccMode::O_RDONLY);
        assert_eq!(OpenFlags(libc::O_WRONLY).acc_mode(), OpenAccMode::O_WRONLY);
        assert_eq!(OpenFlags(libc::O_RDWR).acc_mode(), OpenAccMode::O_RDWR);
    }

    #[test]
    fn read_requested_excludes_write_only() {
        assert!(OpenFlags(libc::O_RDONLY).read_requested());
        assert!(OpenFlags(libc::O_RDWR).read_requested());
        assert!(!OpenFlags(libc::O_WRONLY).read_requested());
    }

    #[test]
    fn acc_replaced_keeps_other_bits() {
        let flags = OpenFlags(libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT);
        let upgraded = flags.acc_replaced(OpenAccMode::O_RDWR);
        assert_eq!(upgraded.acc_mode(), OpenAccMode::O_RDWR);
        assert!(upgraded.append());
        assert!(upgraded.create());
    }
}
