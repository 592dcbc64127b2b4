//! FUSE binding.
//!
//! One method per FUSE callback, matching `fuser::Filesystem`'s surface
//! directly. FUSE's `parent`/`name` and plain `ino` arguments map onto
//! this crate's UID-keyed dentry tree, so lookups go through `vol.tree`
//! instead of a path string built component by component.
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, error, warn};
use tape_transport::TapeTransport;

use crate::error::Error;
use crate::fsops;
use crate::tree::DentryType;
use crate::Volume;

/// Attribute cache TTL handed back to the kernel. LTFS content never
/// changes out from under the kernel within a mount except through this
/// filesystem itself, but a conservative 1s keeps `stat()` honest for
/// external MAM/coherency pokes.
const TTL: Duration = Duration::from_secs(1);

pub struct LtfsFuse<T: TapeTransport> {
    vol: Arc<Volume<T>>,
}

impl<T: TapeTransport> LtfsFuse<T> {
    pub fn new(vol: Arc<Volume<T>>) -> Self {
        Self { vol }
    }
}

fn errno(err: &Error) -> c_int {
    match err {
        Error::NullArg | Error::BadArg(_) | Error::InvalidPath(_) => libc::EINVAL,
        Error::NameTooLong => libc::ENAMETOOLONG,
        Error::NoDentry => libc::ENOENT,
        Error::Exists | Error::XattrExists => libc::EEXIST,
        Error::NotADir => libc::ENOTDIR,
        Error::IsADir => libc::EISDIR,
        Error::NotEmpty => libc::ENOTEMPTY,
        Error::NoXattr => libc::ENODATA,
        Error::RdonlyXattr => libc::EACCES,
        Error::LargeXattr => libc::E2BIG,
        Error::NoSpace | Error::LessSpace => libc::ENOSPC,
        Error::EarlyWarning | Error::ProgramEarlyWarning => 0,
        Error::WriteProtected | Error::LogicalWriteProtect | Error::ReadOnlyVolume => libc::EROFS,
        Error::MediumError | Error::UnsupportedMedium | Error::MediumFormatError => libc::EIO,
        Error::DeviceUnopenable => libc::ENODEV,
        Error::DeviceBusy | Error::DeviceFenced => libc::EBUSY,
        Error::UnsupportedFirmware => libc::ENOTSUP,
        Error::PowerOnReset | Error::MediumMayBeChanged => libc::EIO,
        Error::TimedOut => libc::ETIMEDOUT,
        Error::CryptoError | Error::KeyRequired => libc::EACCES,
        Error::LbpReadError | Error::LbpWriteError => libc::EIO,
        Error::CoherencyMismatch | Error::BadIndex | Error::EodMissing => libc::EIO,
        Error::RestartOperation => libc::EAGAIN,
        Error::RevalFailed => libc::EIO,
        Error::Interrupted => libc::EINTR,
        Error::Filemark | Error::EndOfData | Error::PositionLost => libc::EIO,
    }
}

fn to_file_type(kind: DentryType) -> FileType {
    match kind {
        DentryType::Directory => FileType::Directory,
        DentryType::File => FileType::RegularFile,
        DentryType::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(attr: &fsops::Attr, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: fsops::to_system_time(attr.access),
        mtime: fsops::to_system_time(attr.modify),
        ctime: fsops::to_system_time(attr.change),
        crtime: fsops::to_system_time(attr.creation),
        kind: to_file_type(attr.kind),
        perm: if attr.readonly {
            0o555
        } else if attr.kind == DentryType::Directory {
            0o755
        } else {
            0o644
        },
        nlink: attr.nlink as u32,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn name_str(name: &OsStr) -> Result<&str, c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

impl<T: TapeTransport + Send + Sync + 'static> Filesystem for LtfsFuse<T> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("fuse init: volume {}", self.vol.volume_uuid);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.vol.is_dirty() {
            if let Err(e) = self.vol.sync_now(&[self.vol.index_partition, self.vol.data_partition]) {
                error!("fuse destroy: final sync failed: {e}");
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match self.vol.tree.lookup_child(parent, name) {
            Ok(dentry) => {
                let attr = to_file_attr(&fsops::build_attr(&dentry), _req.uid(), _req.gid());
                // The dentry's refcount bump from `lookup_child` stands in
                // for the kernel's lookup-count entry; `forget` balances it.
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if let Some(dentry) = self.vol.tree.get(ino) {
            for _ in 0..nlookup {
                self.vol.tree.put(&dentry);
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.vol.tree.get(ino) {
            Some(dentry) => reply.attr(&TTL, &to_file_attr(&fsops::build_attr(&dentry), req.uid(), req.gid())),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        if let Some(len) = size {
            if let Err(e) = fsops::truncate(&self.vol, &dentry, len) {
                return reply.error(errno(&e));
            }
        }
        reply.attr(&TTL, &to_file_attr(&fsops::build_attr(&dentry), req.uid(), req.gid()));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match dentry.meta.lock().unwrap().symlink_target.clone() {
            Some(target) => reply.data(target.as_bytes()),
            None => reply.error(libc::EINVAL),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::mkdir_at(&self.vol, parent, name) {
            Ok(dentry) => reply.entry(&TTL, &to_file_attr(&fsops::build_attr(&dentry), req.uid(), req.gid()), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, _rdev: u32, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::mknod_at(&self.vol, parent, name) {
            Ok(dentry) => reply.entry(&TTL, &to_file_attr(&fsops::build_attr(&dentry), req.uid(), req.gid()), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::mknod_at(&self.vol, parent, name) {
            Ok(dentry) => {
                let attr = to_file_attr(&fsops::build_attr(&dentry), req.uid(), req.gid());
                reply.created(&TTL, &attr, 0, 0, 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn symlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, link: &std::path::Path, reply: ReplyEntry) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let target = match link.to_str() {
            Some(t) => t,
            None => return reply.error(libc::EINVAL),
        };
        match fsops::symlink_at(&self.vol, parent, name, target) {
            Ok(dentry) => reply.entry(&TTL, &to_file_attr(&fsops::build_attr(&dentry), req.uid(), req.gid()), 0),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::unlink_at(&self.vol, parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unlink(req, parent, name, reply)
    }

    fn rename(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, _flags: u32, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let newname = match name_str(newname) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        match fsops::rename_at(&self.vol, parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.vol.tree.hold(ino) {
            Ok(dentry) => {
                if dentry.kind == DentryType::Directory {
                    self.vol.tree.put(&dentry);
                    return reply.error(libc::EISDIR);
                }
                reply.opened(0, flags as u32);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match fsops::read(&self.vol, &dentry, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match fsops::write(&self.vol, &dentry, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match self
            .vol
            .with_device(|mgr| self.vol.scheduler.close(&dentry, true, mgr, &self.vol.policy, self.vol.index_partition, self.vol.data_partition))
        {
            Ok(_) => {
                self.vol.mark_dirty();
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        let result = fsops::close(&self.vol, &dentry);
        if let Err(e) = result {
            warn!("release({ino}): flush on close failed: {e}");
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.vol.tree.hold(ino) {
            Ok(dentry) => {
                if dentry.kind != DentryType::Directory {
                    self.vol.tree.put(&dentry);
                    return reply.error(libc::ENOTDIR);
                }
                reply.opened(0, flags as u32);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        if dentry.kind != DentryType::Directory {
            return reply.error(libc::ENOTDIR);
        }
        let parent_uid = dentry.meta.lock().unwrap().parent.unwrap_or(dentry.uid);
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (dentry.uid, FileType::Directory, ".".to_string()),
            (parent_uid, FileType::Directory, "..".to_string()),
        ];
        let children: Vec<(String, u64)> = {
            let contents = dentry.contents.read().unwrap();
            contents.children.iter().map(|(n, u)| (n.clone(), *u)).collect()
        };
        for (name, uid) in children {
            if let Some(child) = self.vol.tree.get(uid) {
                entries.push((uid, to_file_type(child.kind), name));
            }
        }
        for (i, (ino_e, kind_e, name_e)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino_e, (i + 1) as i64, kind_e, name_e) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        if let Some(dentry) = self.vol.tree.get(ino) {
            self.vol.tree.put(&dentry);
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.vol.tree.get(ino) {
            Some(_) => reply.ok(),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match fsops::getxattr_on(&self.vol, &dentry, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if value.len() > size as usize {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn setxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, value: &[u8], _flags: i32, _position: u32, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match fsops::setxattr_on(&self.vol, &dentry, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        let mut blob = Vec::new();
        for name in fsops::listxattr_on(&self.vol, &dentry, true) {
            blob.extend_from_slice(name.as_bytes());
            blob.push(0);
        }
        if size == 0 {
            reply.size(blob.len() as u32);
        } else if blob.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&blob);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match name_str(name) {
            Ok(n) => n,
            Err(e) => return reply.error(e),
        };
        let dentry = match self.vol.tree.get(ino) {
            Some(d) => d,
            None => return reply.error(libc::ENOENT),
        };
        match fsops::removexattr_on(&self.vol, &dentry, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let (blocksize, highest_uid) = fsops::statfs(&self.vol);
        reply.statfs(0, 0, 0, highest_uid, u64::MAX, blocksize, 255, blocksize);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.flush(_req, ino, _fh, 0, reply)
    }
}
