//! The filesystem object: handle tables, locking discipline, and
//! per-operation policy.
//!
//! Operations are keyed by logical path or by the opaque 64-bit handle the
//! open calls mint. Everything touching the tables or an open state runs
//! under one mutex, including the blocking trips through the encryption
//! child; the child is the bottleneck, not lock contention.

use std::collections::HashMap;
use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::fs::lchown;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::debug;
use nix::errno::Errno;
use parking_lot::Mutex;

use crate::config::AccessMode;
use crate::config::MemoryLock;
use crate::errno_of;
use crate::file::OpenFile;
use crate::gpg::Gpg;
use crate::gpg::Recipient;
use crate::open_flags::OpenAccMode;
use crate::open_flags::OpenFlags;

/// Permission bits granting read access, masked off in write-only mode.
const READ_BITS: u32 = 0o444;

/// stat-shaped attributes, with the size substituted from the plaintext
/// buffer when the entry is open.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Attributes {
    pub size: u64,
    pub blocks: u64,
    /// `st_mode`, file-type bits included.
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

impl From<&fs::Metadata> for Attributes {
    fn from(meta: &fs::Metadata) -> Attributes {
        Attributes {
            size: meta.len(),
            blocks: meta.blocks(),
            mode: meta.mode(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().try_into().unwrap_or(0)),
        }
    }
}

/// Entry kinds surfaced by readdir; every other kind is suppressed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
}

/// One directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryType,
}

/// Backing-filesystem statistics for statfs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[derive(Debug)]
struct Inner {
    crypto: Arc<Gpg>,
    next_handle: u64,
    by_path: HashMap<PathBuf, u64>,
    files: HashMap<u64, OpenFile>,
    dirs: HashMap<u64, Vec<DirEntry>>,
}

/// The encrypting overlay over one backing directory.
#[derive(Debug)]
pub struct AsymmetricFs {
    root: File,
    root_path: PathBuf,
    mode: AccessMode,
    mlock: MemoryLock,
    inner: Mutex<Inner>,
}

impl AsymmetricFs {
    /// Opens `target` (which must be a directory) as the backing store.
    pub fn new(
        target: &Path,
        mode: AccessMode,
        mlock: MemoryLock,
        crypto: Gpg,
    ) -> io::Result<AsymmetricFs> {
        let root = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(target)?;
        Ok(AsymmetricFs {
            root,
            root_path: target.to_owned(),
            mode,
            mlock,
            inner: Mutex::new(Inner {
                crypto: Arc::new(crypto),
                next_handle: 1,
                by_path: HashMap::new(),
                files: HashMap::new(),
                dirs: HashMap::new(),
            }),
        })
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Replaces the recipient set. Refused while any handle is open, so a
    /// given state always flushes to one consistent set.
    pub fn set_recipients(&self, recipients: Vec<Recipient>) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        if !inner.files.is_empty() {
            return Err(Errno::EBUSY);
        }
        let binary = inner.crypto.binary().to_owned();
        inner.crypto = Arc::new(Gpg::with_recipients(binary, recipients));
        Ok(())
    }

    fn backing(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix("/").unwrap_or(path);
        self.root_path.join(rel)
    }

    /// Permission probe. In write-only mode read access is denied unless
    /// the path is open through a state that created its file (and is not
    /// append); everything else defers to the backing entry.
    pub fn access(&self, path: &Path, mask: i32) -> Result<(), Errno> {
        let inner = self.inner.lock();
        if !self.mode.read_allowed() && mask & libc::R_OK != 0 {
            let readable = inner
                .by_path
                .get(path)
                .and_then(|handle| inner.files.get(handle))
                .is_some_and(|file| file.flags().create() && !file.flags().append());
            if !readable {
                return Err(Errno::EACCES);
            }
        }
        let backing = cstring(&self.backing(path))?;
        let rc = unsafe { libc::faccessat(libc::AT_FDCWD, backing.as_ptr(), mask, 0) };
        if rc < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// Attributes by path: open paths answer from their state, everything
    /// else from the backing entry. In write-only mode the read permission
    /// bits of non-directories are masked off.
    pub fn getattr(&self, path: &Path) -> Result<Attributes, Errno> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.by_path.get(path).copied() {
            if let Some(file) = inner.files.get_mut(&handle) {
                return file.attributes();
            }
        }
        let meta = fs::symlink_metadata(self.backing(path)).map_err(|err| errno_of(&err))?;
        let mut attr = Attributes::from(&meta);
        if !self.mode.read_allowed() && !meta.is_dir() {
            attr.mode &= !READ_BITS;
        }
        Ok(attr)
    }

    /// Attributes by handle.
    pub fn fgetattr(&self, handle: u64) -> Result<Attributes, Errno> {
        let mut inner = self.inner.lock();
        inner
            .files
            .get_mut(&handle)
            .ok_or(Errno::EBADF)?
            .attributes()
    }

    /// Creates and opens `path`, minting a handle.
    pub fn create(&self, path: &Path, perm: u32, flags: OpenFlags) -> Result<u64, Errno> {
        self.open_common(path, flags.with(libc::O_CREAT), Some(perm))
    }

    /// Opens `path`. In write-only mode a create that also asks for read
    /// access is forced exclusive, so creation cannot become a way to read
    /// a pre-existing file.
    pub fn open(&self, path: &Path, flags: OpenFlags) -> Result<u64, Errno> {
        let flags = if !self.mode.read_allowed() && flags.read_requested() && flags.create() {
            flags.with(libc::O_EXCL)
        } else {
            flags
        };
        self.open_common(path, flags, None)
    }

    fn open_common(&self, path: &Path, flags: OpenFlags, perm: Option<u32>) -> Result<u64, Errno> {
        // The backing open happens under the mutex like every other backing
        // syscall, so a concurrent rename cannot slip between the open and
        // the table update.
        let mut inner = self.inner.lock();
        let backing = self.backing(path);
        // Re-encrypting at close means reading the ciphertext back through
        // this descriptor, so try for read-write and fall back to what the
        // caller asked for.
        let fd = match open_backing(&backing, flags.acc_replaced(OpenAccMode::O_RDWR), perm) {
            Err(Errno::EACCES) => open_backing(&backing, flags, perm)?,
            other => other?,
        };
        if let Some(handle) = inner.by_path.get(path).copied() {
            if let Some(file) = inner.files.get_mut(&handle) {
                file.add_ref();
                debug!("open {path:?}: sharing handle {handle}");
                return Ok(handle);
            }
        }
        let file = OpenFile::new(
            fd,
            flags,
            path.to_owned(),
            self.mode,
            self.mlock,
            inner.crypto.clone(),
        )?;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.by_path.insert(path.to_owned(), handle);
        inner.files.insert(handle, file);
        debug!("open {path:?}: handle {handle}, flags {flags:#x}");
        Ok(handle)
    }

    pub fn read(&self, handle: u64, offset: i64, size: u32) -> Result<Vec<u8>, Errno> {
        let mut inner = self.inner.lock();
        let file = inner.files.get_mut(&handle).ok_or(Errno::EBADF)?;
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        file.read(offset as u64, size as usize)
    }

    pub fn write(&self, handle: u64, offset: i64, data: &[u8]) -> Result<u32, Errno> {
        let mut inner = self.inner.lock();
        let file = inner.files.get_mut(&handle).ok_or(Errno::EBADF)?;
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        file.write(offset as u64, data)
    }

    /// Path-keyed truncate. Open paths delegate to their state. Unopened
    /// files truncate the ciphertext directly when the target size is zero
    /// (lossless); a positive size needs a transient state to round-trip
    /// the plaintext, which write-only mode cannot do.
    pub fn truncate(&self, path: &Path, size: i64) -> Result<(), Errno> {
        if size < 0 {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.by_path.get(path).copied() {
            if let Some(file) = inner.files.get_mut(&handle) {
                return file.truncate(size as u64);
            }
        }
        let backing = self.backing(path);
        if size == 0 {
            let file = OpenOptions::new()
                .write(true)
                .open(&backing)
                .map_err(|err| errno_of(&err))?;
            return file.set_len(0).map_err(|err| errno_of(&err));
        }
        if !self.mode.read_allowed() {
            return Err(Errno::EACCES);
        }
        let fd = open_backing(&backing, OpenFlags(libc::O_RDWR), None)?;
        let mut transient = OpenFile::new(
            fd,
            OpenFlags(libc::O_RDWR),
            path.to_owned(),
            self.mode,
            self.mlock,
            inner.crypto.clone(),
        )?;
        transient.truncate(size as u64)?;
        transient.close()
    }

    /// Handle-keyed truncate.
    pub fn ftruncate(&self, handle: u64, size: i64) -> Result<(), Errno> {
        if size < 0 {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.inner.lock();
        inner
            .files
            .get_mut(&handle)
            .ok_or(Errno::EBADF)?
            .truncate(size as u64)
    }

    /// Renames the backing entry first (atomic), then rewrites the handle
    /// table so an open state answers for the new path. Both happen under
    /// the mutex: no operation can observe the file under both names.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        fs::rename(self.backing(old), self.backing(new)).map_err(|err| errno_of(&err))?;
        if let Some(handle) = inner.by_path.remove(old) {
            inner.by_path.insert(new.to_owned(), handle);
            if let Some(file) = inner.files.get_mut(&handle) {
                file.set_path(new.to_owned());
            }
            debug!("rename {old:?} -> {new:?} carries open handle {handle}");
        }
        Ok(())
    }

    /// Drops one reference; the last one destroys the state, flushing a
    /// dirty buffer into the backing store first.
    pub fn release(&self, handle: u64) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        let remaining = inner
            .files
            .get_mut(&handle)
            .ok_or(Errno::EBADF)?
            .drop_ref();
        if remaining > 0 {
            return Ok(());
        }
        let file = match inner.files.remove(&handle) {
            Some(file) => file,
            None => return Err(Errno::EBADF),
        };
        if inner.by_path.get(file.path()) == Some(&handle) {
            inner.by_path.remove(file.path());
        }
        debug!("release {:?}: destroying handle {handle}", file.path());
        file.close()
    }

    /// Per-close flush hook; the real work happens on the last release.
    pub fn flush(&self, handle: u64) -> Result<(), Errno> {
        let inner = self.inner.lock();
        if inner.files.contains_key(&handle) {
            Ok(())
        } else {
            Err(Errno::EBADF)
        }
    }

    pub fn fsync(&self, handle: u64, datasync: bool) -> Result<(), Errno> {
        let inner = self.inner.lock();
        inner.files.get(&handle).ok_or(Errno::EBADF)?.sync(datasync)
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        fs::set_permissions(self.backing(path), fs::Permissions::from_mode(mode))
            .map_err(|err| errno_of(&err))
    }

    /// Ownership pass-through; handing files to root is refused.
    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
        if uid == Some(0) || gid == Some(0) {
            return Err(Errno::EPERM);
        }
        let _inner = self.inner.lock();
        lchown(self.backing(path), uid, gid).map_err(|err| errno_of(&err))
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.backing(path))
            .map_err(|err| errno_of(&err))
    }

    pub fn rmdir(&self, path: &Path) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        fs::remove_dir(self.backing(path)).map_err(|err| errno_of(&err))
    }

    pub fn unlink(&self, path: &Path) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        fs::remove_file(self.backing(path)).map_err(|err| errno_of(&err))
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        symlink(target, self.backing(link)).map_err(|err| errno_of(&err))
    }

    pub fn readlink(&self, path: &Path) -> Result<OsString, Errno> {
        let _inner = self.inner.lock();
        fs::read_link(self.backing(path))
            .map(PathBuf::into_os_string)
            .map_err(|err| errno_of(&err))
    }

    /// Hard links would alias one plaintext buffer under two paths.
    pub fn link(&self, _old: &Path, _new: &Path) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    pub fn utimens(
        &self,
        path: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        let backing = cstring(&self.backing(path))?;
        let times = [timespec_of(atime), timespec_of(mtime)];
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                backing.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    pub fn statfs(&self) -> Result<FsStats, Errno> {
        let mut out: libc::statvfs = unsafe { mem::zeroed() };
        let rc = unsafe { libc::fstatvfs(self.root.as_raw_fd(), &mut out) };
        if rc < 0 {
            return Err(Errno::last());
        }
        Ok(FsStats {
            blocks: out.f_blocks as u64,
            bfree: out.f_bfree as u64,
            bavail: out.f_bavail as u64,
            files: out.f_files as u64,
            ffree: out.f_ffree as u64,
            bsize: out.f_bsize as u32,
            namelen: out.f_namemax as u32,
            frsize: out.f_frsize as u32,
        })
    }

    pub fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        let backing = cstring(&self.backing(path))?;
        let name = xattr_name(name)?;
        let rc = unsafe {
            libc::lsetxattr(
                backing.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if rc < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        let _inner = self.inner.lock();
        let backing = cstring(&self.backing(path))?;
        let name = xattr_name(name)?;
        let len = unsafe {
            libc::lgetxattr(backing.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if len < 0 {
            return Err(Errno::last());
        }
        let mut value = vec![0u8; len as usize];
        if !value.is_empty() {
            let len = unsafe {
                libc::lgetxattr(
                    backing.as_ptr(),
                    name.as_ptr(),
                    value.as_mut_ptr().cast(),
                    value.len(),
                )
            };
            if len < 0 {
                return Err(Errno::last());
            }
            value.truncate(len as usize);
        }
        Ok(value)
    }

    pub fn listxattr(&self, path: &Path) -> Result<Vec<u8>, Errno> {
        let _inner = self.inner.lock();
        let backing = cstring(&self.backing(path))?;
        let len = unsafe { libc::llistxattr(backing.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            return Err(Errno::last());
        }
        let mut names = vec![0u8; len as usize];
        if !names.is_empty() {
            let len = unsafe {
                libc::llistxattr(backing.as_ptr(), names.as_mut_ptr().cast(), names.len())
            };
            if len < 0 {
                return Err(Errno::last());
            }
            names.truncate(len as usize);
        }
        Ok(names)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), Errno> {
        let _inner = self.inner.lock();
        let backing = cstring(&self.backing(path))?;
        let name = xattr_name(name)?;
        let rc = unsafe { libc::lremovexattr(backing.as_ptr(), name.as_ptr()) };
        if rc < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }

    /// Reads the whole directory eagerly, emitting `.` and `..` and
    /// admitting only regular files, directories, and symlinks. Entries the
    /// directory stream reports as unknown are stat'd before the filter
    /// applies; anything still unidentifiable is suppressed.
    pub fn opendir(&self, path: &Path) -> Result<u64, Errno> {
        let backing = self.backing(path);
        let mut entries = vec![
            DirEntry {
                name: OsString::from("."),
                kind: EntryType::Directory,
            },
            DirEntry {
                name: OsString::from(".."),
                kind: EntryType::Directory,
            },
        ];
        for entry in fs::read_dir(&backing).map_err(|err| errno_of(&err))? {
            let entry = entry.map_err(|err| errno_of(&err))?;
            let kind = match entry.file_type() {
                Ok(kind) if kind.is_dir() => EntryType::Directory,
                Ok(kind) if kind.is_symlink() => EntryType::Symlink,
                Ok(kind) if kind.is_file() => EntryType::Regular,
                // Devices, fifos, sockets, and anything unidentifiable.
                _ => continue,
            };
            entries.push(DirEntry {
                name: entry.file_name(),
                kind,
            });
        }
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.dirs.insert(handle, entries);
        Ok(handle)
    }

    pub fn readdir(&self, handle: u64) -> Result<Vec<DirEntry>, Errno> {
        let inner = self.inner.lock();
        inner.dirs.get(&handle).cloned().ok_or(Errno::EBADF)
    }

    pub fn releasedir(&self, handle: u64) -> Result<(), Errno> {
        self.inner
            .lock()
            .dirs
            .remove(&handle)
            .map(|_| ())
            .ok_or(Errno::EBADF)
    }
}

fn open_backing(path: &Path, flags: OpenFlags, perm: Option<u32>) -> Result<File, Errno> {
    let mut options = OpenOptions::new();
    match flags.acc_mode() {
        OpenAccMode::O_RDONLY => {
            options.read(true);
        }
        OpenAccMode::O_WRONLY => {
            options.write(true);
        }
        OpenAccMode::O_RDWR => {
            options.read(true);
            options.write(true);
        }
    }
    options.create(flags.create());
    options.create_new(flags.create() && flags.excl());
    options.append(flags.append());
    options.truncate(flags.truncate());
    options.custom_flags(libc::O_CLOEXEC);
    if let Some(perm) = perm {
        options.mode(perm);
    }
    options.open(path).map_err(|err| errno_of(&err))
}

fn cstring(path: &Path) -> Result<CString, Errno> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn xattr_name(name: &OsStr) -> Result<CString, Errno> {
    CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)
}

fn timespec_of(time: Option<SystemTime>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(time) => {
            let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: since_epoch.as_secs() as libc::time_t,
                tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
            }
        }
    }
}
