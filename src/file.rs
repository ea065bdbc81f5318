//! Per-open-file state: the bridge between ciphertext on disk and plaintext
//! in memory.

use std::fs::File;
use std::io::Seek;
use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use libc::c_void;
use log::debug;
use log::warn;
use memchr::memmem;
use nix::errno::Errno;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;

use crate::config::AccessMode;
use crate::config::MemoryLock;
use crate::errno_of;
use crate::fs::Attributes;
use crate::gpg::ARMOR_END;
use crate::gpg::Gpg;
use crate::open_flags::OpenFlags;
use crate::pages::PageBuffer;
use crate::subprocess::Wire;

/// State shared by every handle open on one logical path.
///
/// The plaintext lives in `buffer` once populated; `dirty` records that the
/// buffer diverged from the ciphertext and must be re-encrypted when the
/// last handle goes away.
#[derive(Debug)]
pub struct OpenFile {
    fd: File,
    flags: OpenFlags,
    refs: u64,
    path: PathBuf,
    buffer: PageBuffer,
    /// The buffer currently holds the file's contents.
    populated: bool,
    /// The buffer was populated-empty at open time, i.e. this state created
    /// the file (or opened it at zero bytes). Gates reads in write-only
    /// mode.
    created: bool,
    dirty: bool,
    mode: AccessMode,
    crypto: Arc<Gpg>,
}

impl OpenFile {
    /// Wraps a freshly opened backing descriptor. The buffer starts
    /// populated-empty exactly when the backing file is zero bytes long.
    pub fn new(
        fd: File,
        flags: OpenFlags,
        path: PathBuf,
        mode: AccessMode,
        mlock: MemoryLock,
        crypto: Arc<Gpg>,
    ) -> Result<OpenFile, Errno> {
        let len = fd.metadata().map_err(|err| errno_of(&err))?.len();
        let created = len == 0;
        Ok(OpenFile {
            fd,
            flags,
            refs: 1,
            path,
            buffer: PageBuffer::new(mlock.lock_buffers()),
            populated: created,
            created,
            dirty: false,
            mode,
            crypto,
        })
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    /// Drops one reference and returns how many remain.
    pub fn drop_ref(&mut self) -> u64 {
        self.refs -= 1;
        self.refs
    }

    /// Backing-descriptor attributes with the size substituted from the
    /// plaintext buffer: append handles report the on-disk size plus the
    /// buffer, others the buffer's logical size (loading it first in
    /// read-write mode).
    pub fn attributes(&mut self) -> Result<Attributes, Errno> {
        let meta = self.fd.metadata().map_err(|err| errno_of(&err))?;
        let mut attr = Attributes::from(&meta);
        if self.flags.append() {
            attr.size = meta.len() + self.buffer.size();
        } else {
            if self.mode.read_allowed() {
                self.load()?;
            }
            if self.populated {
                attr.size = self.buffer.size();
            }
        }
        Ok(attr)
    }

    /// Reads up to `size` bytes of plaintext at `offset`.
    ///
    /// In read-write mode this forces a load. In write-only mode reads are
    /// permitted only on states that created their file; append handles are
    /// write-only by construction.
    pub fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, Errno> {
        if self.flags.append() {
            return Err(Errno::EACCES);
        }
        if self.mode.read_allowed() {
            self.load()?;
        } else if !self.created {
            return Err(Errno::EACCES);
        }
        let mut out = vec![0u8; size];
        let n = self.buffer.read(offset, &mut out);
        out.truncate(n);
        Ok(out)
    }

    /// Writes plaintext into the buffer and marks the state dirty. Append
    /// handles always write at the buffer's tail. Zero-length writes change
    /// nothing.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        if data.is_empty() {
            return Ok(0);
        }
        let offset = if self.flags.append() {
            self.buffer.size()
        } else {
            // Overwriting without the rest of the plaintext in memory would
            // lose it at flush time.
            if self.mode.read_allowed() {
                self.load()?;
            }
            offset
        };
        self.buffer.write(offset, data)?;
        self.populated = true;
        self.dirty = true;
        Ok(data.len() as u32)
    }

    /// Resizes the plaintext. Refused in write-only mode (even on freshly
    /// created files) and on append handles.
    pub fn truncate(&mut self, size: u64) -> Result<(), Errno> {
        if !self.mode.read_allowed() {
            // TODO: allow truncating a file this state created; gating on
            // the mode alone is stricter than necessary.
            return Err(Errno::EACCES);
        }
        if self.flags.append() {
            return Err(Errno::EACCES);
        }
        self.load()?;
        self.buffer.resize(size);
        self.dirty = true;
        Ok(())
    }

    pub fn sync(&self, datasync: bool) -> Result<(), Errno> {
        if datasync {
            self.fd.sync_data()
        } else {
            self.fd.sync_all()
        }
        .map_err(|err| errno_of(&err))
    }

    /// Decrypts the backing ciphertext into the buffer. A no-op once the
    /// buffer is populated; an empty backing file populates empty.
    ///
    /// A failed decryption clears the buffer and leaves it unpopulated so
    /// the operation can be retried.
    pub fn load(&mut self) -> Result<(), Errno> {
        if self.populated {
            return Ok(());
        }
        let len = self.fd.metadata().map_err(|err| errno_of(&err))?.len();
        if len == 0 {
            self.populated = true;
            return Ok(());
        }
        match self.load_blocks(len as usize) {
            Ok(blocks) => {
                debug!(
                    "loaded {} plaintext bytes from {} block(s) of {:?}",
                    self.buffer.size(),
                    blocks,
                    self.path
                );
                self.populated = true;
                Ok(())
            }
            Err(err) => {
                self.buffer.clear();
                self.populated = false;
                Err(err)
            }
        }
    }

    fn load_blocks(&mut self, len: usize) -> Result<usize, Errno> {
        let crypto = self.crypto.clone();
        let map = FileMap::new(&self.fd, len)?;
        let data = map.as_slice();
        let mut consumed = 0usize;
        let mut blocks = 0usize;
        for hit in memmem::find_iter(data, ARMOR_END) {
            let end = hit + ARMOR_END.len();
            if end <= consumed {
                continue;
            }
            let whole_file = consumed == 0 && end == data.len();
            let mut child = if whole_file {
                // A single block spanning the file feeds the decryptor
                // straight from the rewound backing descriptor.
                (&self.fd)
                    .seek(SeekFrom::Start(0))
                    .map_err(|err| errno_of(&err))?;
                let dup = self.fd.try_clone().map_err(|err| errno_of(&err))?;
                crypto
                    .spawn_decryptor(Wire::Fd(dup.into()))
                    .map_err(|err| errno_of(&err))?
            } else {
                crypto
                    .spawn_decryptor(Wire::Pipe)
                    .map_err(|err| errno_of(&err))?
            };
            let input = if whole_file {
                None
            } else {
                Some(&data[consumed..end])
            };
            let buffer = &mut self.buffer;
            let mut tail = buffer.size();
            child.communicate(input, |chunk| {
                buffer.write(tail, chunk)?;
                tail += chunk.len() as u64;
                Ok(())
            })?;
            if child.wait() != 0 {
                return Err(Errno::EIO);
            }
            consumed = end;
            blocks += 1;
        }
        if blocks == 0 {
            warn!("{:?}: no armored message found in backing file", self.path);
            return Err(Errno::EIO);
        }
        if consumed != data.len() {
            warn!(
                "{:?}: ignoring {} trailing bytes after the last armored block",
                self.path,
                data.len() - consumed
            );
        }
        Ok(blocks)
    }

    /// Re-encrypts the buffer over the backing file: append handles add a
    /// fresh armored block at the end, everything else rewinds and truncates
    /// first.
    fn flush_buffer(&mut self) -> Result<(), Errno> {
        if self.flags.append() {
            self.fd
                .seek(SeekFrom::End(0))
                .map_err(|err| errno_of(&err))?;
        } else {
            self.fd
                .seek(SeekFrom::Start(0))
                .map_err(|err| errno_of(&err))?;
            self.fd.set_len(0).map_err(|err| errno_of(&err))?;
        }
        let sink = self.fd.try_clone().map_err(|err| errno_of(&err))?;
        let mut child = self
            .crypto
            .spawn_encryptor(sink.into())
            .map_err(|err| errno_of(&err))?;
        if let Some(fd) = child.stdin_fd() {
            self.buffer.splice(fd)?;
        }
        child.close_stdin();
        if child.wait() != 0 {
            return Err(Errno::EIO);
        }
        debug!(
            "flushed {} plaintext bytes of {:?}",
            self.buffer.size(),
            self.path
        );
        self.dirty = false;
        Ok(())
    }

    /// Tears the state down, re-encrypting first when dirty. The backing
    /// descriptor closes when the state is dropped, flush outcome
    /// notwithstanding.
    pub fn close(mut self) -> Result<(), Errno> {
        if self.dirty { self.flush_buffer() } else { Ok(()) }
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if self.dirty {
            warn!("{:?}: dropping unflushed plaintext", self.path);
        }
    }
}

/// Read-only mapping of the backing ciphertext.
struct FileMap {
    ptr: NonNull<c_void>,
    len: usize,
}

impl FileMap {
    fn new(file: &File, len: usize) -> Result<FileMap, Errno> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file,
                0,
            )?
        };
        Ok(FileMap { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast(), self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            log::error!("munmap of backing file failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::fs::OpenOptions;

    use super::*;
    use crate::gpg::tests::stub_gpg;

    fn crypto(dir: &Path) -> Arc<Gpg> {
        let mut gpg = Gpg::new(Some(stub_gpg(dir)));
        gpg.add_recipient("test-key").unwrap();
        Arc::new(gpg)
    }

    fn state(backing: &Path, flags: i32, mode: AccessMode, crypto: Arc<Gpg>) -> OpenFile {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(backing)
            .unwrap();
        OpenFile::new(
            fd,
            OpenFlags(flags),
            PathBuf::from("/t"),
            mode,
            MemoryLock::None,
            crypto,
        )
        .unwrap()
    }

    #[test]
    fn fresh_state_is_populated_empty() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto(dir.path());
        let backing = dir.path().join("t");

        let mut file = state(&backing, libc::O_WRONLY, AccessMode::ReadWrite, crypto);
        assert!(file.populated);
        assert!(file.created);
        assert!(!file.dirty);
        assert_eq!(file.attributes().unwrap().size, 0);
        assert_eq!(file.read(0, 16).unwrap(), b"");

        // Closing a clean state writes nothing.
        file.close().unwrap();
        assert_eq!(fs::metadata(&backing).unwrap().len(), 0);
    }

    #[test]
    fn dirty_close_encrypts_and_reload_decrypts() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto(dir.path());
        let backing = dir.path().join("t");

        let mut file = state(
            &backing,
            libc::O_WRONLY,
            AccessMode::ReadWrite,
            crypto.clone(),
        );
        file.write(0, b"plain contents").unwrap();
        assert!(file.dirty);
        file.close().unwrap();

        let ciphertext = fs::read(&backing).unwrap();
        assert!(ciphertext.ends_with(ARMOR_END));
        assert!(!ciphertext.windows(5).any(|window| window == b"plain"));

        let mut file = state(&backing, libc::O_RDONLY, AccessMode::ReadWrite, crypto);
        assert!(!file.created);
        assert_eq!(file.read(0, 64).unwrap(), b"plain contents");
        assert!(!file.dirty);
        file.close().unwrap();
    }

    #[test]
    fn append_state_concatenates_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto(dir.path());
        let backing = dir.path().join("t");

        let mut file = state(
            &backing,
            libc::O_WRONLY,
            AccessMode::ReadWrite,
            crypto.clone(),
        );
        file.write(0, b"one").unwrap();
        file.close().unwrap();
        let first_len = fs::metadata(&backing).unwrap().len();

        let mut file = state(
            &backing,
            libc::O_WRONLY | libc::O_APPEND,
            AccessMode::ReadWrite,
            crypto.clone(),
        );
        // The requested offset is irrelevant on an append handle.
        file.write(9999, b"two").unwrap();
        assert_eq!(file.attributes().unwrap().size, first_len + 3);
        assert_eq!(file.read(0, 16), Err(Errno::EACCES));
        file.close().unwrap();

        let mut file = state(&backing, libc::O_RDONLY, AccessMode::ReadWrite, crypto);
        assert_eq!(file.read(0, 64).unwrap(), b"onetwo");
        file.close().unwrap();
    }

    #[test]
    fn failed_decryption_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto(dir.path());
        let backing = dir.path().join("t");
        fs::write(&backing, b"no armored payload in here").unwrap();

        let mut file = state(&backing, libc::O_RDONLY, AccessMode::ReadWrite, crypto);
        assert_eq!(file.read(0, 16), Err(Errno::EIO));
        assert!(!file.populated);
        assert_eq!(file.buffer.size(), 0);
        assert_eq!(file.read(0, 16), Err(Errno::EIO));
        file.close().unwrap();
    }

    #[test]
    fn write_only_reads_are_gated_on_creation() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto(dir.path());
        let backing = dir.path().join("t");

        let mut file = state(
            &backing,
            libc::O_WRONLY,
            AccessMode::WriteOnly,
            crypto.clone(),
        );
        file.write(0, b"mine").unwrap();
        assert_eq!(file.read(0, 16).unwrap(), b"mine");
        file.close().unwrap();

        // A second state sees a non-empty backing file and may not read.
        let mut file = state(&backing, libc::O_WRONLY, AccessMode::WriteOnly, crypto);
        assert!(!file.created);
        assert_eq!(file.read(0, 16), Err(Errno::EACCES));
        file.write(0, b"replacement").unwrap();
        assert_eq!(file.read(0, 16), Err(Errno::EACCES));
        file.close().unwrap();
    }

    #[test]
    fn truncate_loads_resizes_and_refuses_write_only() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = crypto(dir.path());
        let backing = dir.path().join("t");

        let mut file = state(
            &backing,
            libc::O_WRONLY,
            AccessMode::ReadWrite,
            crypto.clone(),
        );
        file.write(0, b"abcdef").unwrap();
        file.close().unwrap();

        let mut file = state(&backing, libc::O_RDWR, AccessMode::ReadWrite, crypto.clone());
        file.truncate(3).unwrap();
        assert!(file.dirty);
        assert_eq!(file.attributes().unwrap().size, 3);
        file.close().unwrap();

        let mut file = state(
            &backing,
            libc::O_RDONLY,
            AccessMode::ReadWrite,
            crypto.clone(),
        );
        assert_eq!(file.read(0, 16).unwrap(), b"abc");
        file.close().unwrap();

        let mut file = state(&backing, libc::O_WRONLY, AccessMode::WriteOnly, crypto);
        assert_eq!(file.truncate(0), Err(Errno::EACCES));
        file.close().unwrap();
    }
}
