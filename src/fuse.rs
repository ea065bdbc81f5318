//! FUSE protocol adapter.
//!
//! `fuser` speaks inodes; the filesystem core speaks logical paths. This
//! layer interns paths as inodes, converts attributes, and forwards every
//! operation to [`AsymmetricFs`]. Core handles double as FUSE file handles.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::KernelConfig;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::ReplyXattr;
use fuser::Request;
use fuser::TimeOrNow;
use libc::c_int;
use log::debug;
use nix::errno::Errno;

use crate::fs::AsymmetricFs;
use crate::fs::Attributes;
use crate::fs::EntryType;
use crate::open_flags::OpenFlags;

/// Attribute cache lifetime handed to the kernel. Sizes change the moment a
/// buffer loads or a write lands, so nothing is cached.
const TTL: Duration = Duration::new(0, 0);

const ROOT_INODE: u64 = 1;

/// The inode-speaking face of the filesystem.
#[derive(Debug)]
pub struct AsymmetricFuse {
    fs: AsymmetricFs,
    inodes: HashMap<u64, PathBuf>,
    paths: HashMap<PathBuf, u64>,
    next_inode: u64,
}

impl AsymmetricFuse {
    pub fn new(fs: AsymmetricFs) -> AsymmetricFuse {
        let root = PathBuf::from("/");
        AsymmetricFuse {
            fs,
            inodes: HashMap::from([(ROOT_INODE, root.clone())]),
            paths: HashMap::from([(root, ROOT_INODE)]),
            next_inode: ROOT_INODE + 1,
        }
    }

    pub fn fs(&self) -> &AsymmetricFs {
        &self.fs
    }

    fn intern(&mut self, path: PathBuf) -> u64 {
        if let Some(ino) = self.paths.get(&path) {
            return *ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(ino, path.clone());
        self.paths.insert(path, ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inodes.get(&parent).map(|dir| dir.join(name))
    }

    fn forget_path(&mut self, path: &Path) {
        if let Some(ino) = self.paths.remove(path) {
            self.inodes.remove(&ino);
        }
    }
}

fn err(errno: Errno) -> c_int {
    errno as c_int
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn file_attr(attr: &Attributes, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: UNIX_EPOCH,
        kind: kind_of(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn entry_kind(kind: EntryType) -> FileType {
    match kind {
        EntryType::Regular => FileType::RegularFile,
        EntryType::Directory => FileType::Directory,
        EntryType::Symlink => FileType::Symlink,
    }
}

fn time_of(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|value| match value {
        TimeOrNow::SpecificTime(when) => when,
        TimeOrNow::Now => SystemTime::now(),
    })
}

impl Filesystem for AsymmetricFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.intern(path);
                reply.entry(&TTL, &file_attr(&attr, ino), 0);
            }
            Err(errno) => {
                if errno == Errno::ENOENT {
                    self.forget_path(&path);
                }
                reply.error(err(errno));
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr, ino)),
            Err(errno) => reply.error(err(errno)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        if let Some(size) = size {
            let result = match fh {
                Some(fh) => self.fs.ftruncate(fh, size as i64),
                None => self.fs.truncate(&path, size as i64),
            };
            if let Err(errno) = result {
                return reply.error(err(errno));
            }
        }
        if let Some(mode) = mode {
            if let Err(errno) = self.fs.chmod(&path, mode) {
                return reply.error(err(errno));
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(errno) = self.fs.chown(&path, uid, gid) {
                return reply.error(err(errno));
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(errno) = self.fs.utimens(&path, time_of(atime), time_of(mtime)) {
                return reply.error(err(errno));
            }
        }
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr, ino)),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_encoded_bytes()),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        if let Err(errno) = self.fs.mkdir(&path, mode & !umask) {
            return reply.error(err(errno));
        }
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.intern(path);
                reply.entry(&TTL, &file_attr(&attr, ino), 0);
            }
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        if let Err(errno) = self.fs.symlink(link, &path) {
            return reply.error(err(errno));
        }
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.intern(path);
                reply.entry(&TTL, &file_attr(&attr, ino), 0);
            }
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_EXCHANGE and friends change the aliasing story.
            return reply.error(libc::EINVAL);
        }
        let old = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let new = match self.child_path(newparent, newname) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.rename(&old, &new) {
            Ok(()) => {
                self.forget_path(&new);
                if let Some(ino) = self.paths.remove(&old) {
                    self.inodes.insert(ino, new.clone());
                    self.paths.insert(new, ino);
                }
                reply.ok();
            }
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.open(&path, OpenFlags(flags)) {
            Ok(handle) => reply.opened(handle, 0),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let handle = match self.fs.create(&path, mode & !umask, OpenFlags(flags)) {
            Ok(handle) => handle,
            Err(errno) => return reply.error(err(errno)),
        };
        match self.fs.fgetattr(handle) {
            Ok(attr) => {
                let ino = self.intern(path);
                reply.created(&TTL, &file_attr(&attr, ino), 0, handle, 0);
            }
            Err(errno) => {
                debug!("create {path:?}: fgetattr failed right after open");
                let _ = self.fs.release(handle);
                reply.error(err(errno));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(err(errno)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.opendir(&path) {
            Ok(handle) => reply.opened(handle, 0),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        let entries = match self.fs.readdir(fh) {
            Ok(entries) => entries,
            Err(errno) => return reply.error(err(errno)),
        };
        let parent_ino = path
            .parent()
            .and_then(|parent| self.paths.get(parent).copied())
            .unwrap_or(ino);
        for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
            let entry_ino = if entry.name == "." {
                ino
            } else if entry.name == ".." {
                parent_ino
            } else {
                self.intern(path.join(&entry.name))
            };
            // index + 1 is the offset of the next entry
            if reply.add(
                entry_ino,
                (index + 1) as i64,
                entry_kind(entry.kind),
                &entry.name,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize,
                stats.namelen,
                stats.frsize,
            ),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.getxattr(&path, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() <= size as usize {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.listxattr(&path) {
            Ok(names) => {
                if size == 0 {
                    reply.size(names.len() as u32);
                } else if names.len() <= size as usize {
                    reply.data(&names);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Some(path) => path,
            None => return reply.error(libc::ENOENT),
        };
        match self.fs.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(err(errno)),
        }
    }
}
