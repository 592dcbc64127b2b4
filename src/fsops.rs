//! Filesystem-operation façade (C10).
//!
//! Every entry point follows the same four-step discipline: validate the
//! path, resolve the dentry (refcount++), invoke the inner operation under
//! the crate's lock order, then release the refcount, destroying the
//! dentry if it became unreachable. `RestartOperation` (returned by C4/C6
//! when a concurrent mutation invalidated an in-flight resolution)
//! restarts the whole pipeline from step 1.
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tape_transport::{PartitionId, TapeTransport};

use crate::error::{Error, Result};
use crate::tree::{Dentry, DentryType, Times};
use crate::xattr::{self, SetFlags, VirtualXattrContext, XAttr};
use crate::Volume;

/// Attribute view handed to the binding layer (FUSE or CLI), decoupled
/// from any one binding's attr struct.
#[derive(Debug, Clone)]
pub struct Attr {
    pub ino: u64,
    pub kind: DentryType,
    pub size: u64,
    pub readonly: bool,
    pub nlink: u64,
    pub creation: DateTime<Utc>,
    pub modify: DateTime<Utc>,
    pub access: DateTime<Utc>,
    pub change: DateTime<Utc>,
}

pub fn build_attr(dentry: &Dentry) -> Attr {
    let meta = dentry.meta.lock().unwrap();
    Attr {
        ino: dentry.uid,
        kind: dentry.kind,
        size: meta.size,
        readonly: meta.readonly,
        nlink: meta.link_count,
        creation: meta.times.creation,
        modify: meta.times.modify,
        access: meta.times.access,
        change: meta.times.change,
    }
}

/// Splits `/a/b/c` into (`/a/b`, `c`). The root itself has no valid split.
fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidPath("root has no parent".into()));
    }
    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Ok(("/", trimmed)),
    }
}

/// Re-runs `f` from the top whenever it signals `RestartOperation`.
/// Every façade entry point is wrapped in this.
fn retry_restart<R>(mut f: impl FnMut() -> Result<R>) -> Result<R> {
    loop {
        match f() {
            Err(Error::RestartOperation) => continue,
            other => return other,
        }
    }
}

/// Resolves `path`, bumping its refcount (balanced by the caller's
/// eventual [`release`]).
pub fn lookup<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<Arc<Dentry>> {
    retry_restart(|| vol.tree.lookup_path(path, vol.path_validator.as_ref()))
}

/// Balances a prior [`lookup`]/[`open`], destroying the dentry if it's
/// now unreachable (lifecycle).
pub fn release(vol_tree: &crate::tree::Tree, dentry: &Arc<Dentry>) {
    vol_tree.put(dentry);
}

pub fn getattr<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<Attr> {
    let dentry = lookup(vol, path)?;
    let attr = build_attr(&dentry);
    release(&vol.tree, &dentry);
    Ok(attr)
}

/// `open(path)`: just a resolution whose refcount stands in for an open
/// file handle; there's no separate handle table, the "handle" the
/// binding layer sees is the `Arc<Dentry>` itself.
pub fn open<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<Arc<Dentry>> {
    let dentry = lookup(vol, path)?;
    if dentry.kind == DentryType::Directory {
        release(&vol.tree, &dentry);
        return Err(Error::IsADir);
    }
    Ok(dentry)
}

/// `release(file, flush)`: flush the write buffer,
/// then drop the handle's refcount.
pub fn close<T: TapeTransport>(vol: &Volume<T>, file: &Arc<Dentry>) -> Result<()> {
    let flush_result = vol.with_device(|mgr| {
        vol.scheduler.close(file, true, mgr, &vol.policy, vol.index_partition, vol.data_partition)
    });
    if flush_result.is_ok() {
        vol.mark_dirty();
    }
    release(&vol.tree, file);
    if vol.scheduler.under_cache_pressure() {
        vol.request_sync(crate::sync_engine::SyncTrigger::CachePressure);
    }
    flush_result?;
    Ok(())
}

pub fn read<T: TapeTransport>(vol: &Volume<T>, file: &Dentry, offset: u64, len: usize) -> Result<Vec<u8>> {
    vol.with_device(|mgr| vol.scheduler.read_logical(file, offset, len, mgr))
}

/// `write(file, data)`: append-only per LTFS semantics — no in-place
/// rewrite of already-written extents; `offset` must equal the file's
/// current logical size.
pub fn write<T: TapeTransport>(vol: &Volume<T>, file: &Dentry, offset: u64, data: &[u8]) -> Result<usize> {
    {
        let meta = file.meta.lock().unwrap();
        if offset != meta.size {
            return Err(Error::BadArg("LTFS files are append-only".into()));
        }
    }
    vol.scheduler.write(file, data)?;
    vol.mark_dirty();
    if vol.policy.use_atime {
        vol.mark_atime_dirty();
    }
    Ok(data.len())
}

pub fn truncate<T: TapeTransport>(vol: &Volume<T>, file: &Dentry, len: u64) -> Result<()> {
    vol.with_device(|mgr| {
        vol.scheduler.truncate(file, len, mgr, &vol.policy, vol.index_partition, vol.data_partition)
    })?;
    vol.mark_dirty();
    Ok(())
}

pub fn mkdir<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<()> {
    retry_restart(|| {
        let (parent_path, name) = split_path(path)?;
        vol.path_validator.validate_component(name)?;
        let parent = lookup(vol, parent_path)?;
        let result = vol.tree.create_child(parent.uid, name, DentryType::Directory);
        release(&vol.tree, &parent);
        result?;
        Ok(())
    })?;
    vol.mark_dirty();
    Ok(())
}

pub fn create<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<Arc<Dentry>> {
    let dentry = retry_restart(|| {
        let (parent_path, name) = split_path(path)?;
        vol.path_validator.validate_component(name)?;
        let parent = lookup(vol, parent_path)?;
        let result = vol.tree.create_child(parent.uid, name, DentryType::File);
        release(&vol.tree, &parent);
        result
    })?;
    vol.mark_dirty();
    Ok(dentry)
}

pub fn symlink<T: TapeTransport>(vol: &Volume<T>, path: &str, target: &str) -> Result<()> {
    retry_restart(|| {
        let (parent_path, name) = split_path(path)?;
        vol.path_validator.validate_component(name)?;
        let parent = lookup(vol, parent_path)?;
        let result = vol.tree.create_child(parent.uid, name, DentryType::Symlink);
        release(&vol.tree, &parent);
        let dentry = result?;
        dentry.meta.lock().unwrap().symlink_target = Some(target.to_string());
        Ok(())
    })?;
    vol.mark_dirty();
    Ok(())
}

/// Ino/name variants of the above, for host bindings (FUSE) that hand the
/// façade a resolved parent dentry and a leaf name instead of a path
/// string. Same validation/retry discipline as the path-based entry
/// points above; these exist so the binding layer never touches
/// [`crate::tree::Tree`] directly.
pub fn mkdir_at<T: TapeTransport>(vol: &Volume<T>, parent_uid: u64, name: &str) -> Result<Arc<Dentry>> {
    vol.path_validator.validate_component(name)?;
    let dentry = retry_restart(|| vol.tree.create_child(parent_uid, name, DentryType::Directory))?;
    vol.mark_dirty();
    Ok(dentry)
}

pub fn mknod_at<T: TapeTransport>(vol: &Volume<T>, parent_uid: u64, name: &str) -> Result<Arc<Dentry>> {
    vol.path_validator.validate_component(name)?;
    let dentry = retry_restart(|| vol.tree.create_child(parent_uid, name, DentryType::File))?;
    vol.mark_dirty();
    Ok(dentry)
}

pub fn symlink_at<T: TapeTransport>(vol: &Volume<T>, parent_uid: u64, name: &str, target: &str) -> Result<Arc<Dentry>> {
    vol.path_validator.validate_component(name)?;
    let dentry = retry_restart(|| vol.tree.create_child(parent_uid, name, DentryType::Symlink))?;
    dentry.meta.lock().unwrap().symlink_target = Some(target.to_string());
    vol.mark_dirty();
    Ok(dentry)
}

pub fn unlink_at<T: TapeTransport>(vol: &Volume<T>, parent_uid: u64, name: &str) -> Result<()> {
    retry_restart(|| vol.tree.unlink(parent_uid, name))?;
    vol.mark_dirty();
    Ok(())
}

pub fn rename_at<T: TapeTransport>(
    vol: &Volume<T>,
    old_parent_uid: u64,
    old_name: &str,
    new_parent_uid: u64,
    new_name: &str,
) -> Result<()> {
    vol.path_validator.validate_component(new_name)?;
    retry_restart(|| vol.tree.rename(old_parent_uid, old_name, new_parent_uid, new_name))?;
    vol.mark_dirty();
    Ok(())
}

pub fn readlink<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<String> {
    let dentry = lookup(vol, path)?;
    let target = dentry.meta.lock().unwrap().symlink_target.clone();
    release(&vol.tree, &dentry);
    target.ok_or(Error::InvalidPath("not a symlink".into()))
}

pub fn unlink<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<()> {
    retry_restart(|| {
        let (parent_path, name) = split_path(path)?;
        let parent = lookup(vol, parent_path)?;
        let result = vol.tree.unlink(parent.uid, name);
        release(&vol.tree, &parent);
        result
    })?;
    vol.mark_dirty();
    Ok(())
}

/// `rmdir` shares `unlink`'s tree operation; [`crate::tree::Tree::unlink`]
/// already refuses a non-empty directory with `NotEmpty`.
pub fn rmdir<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<()> {
    unlink(vol, path)
}

pub fn rename<T: TapeTransport>(vol: &Volume<T>, old_path: &str, new_path: &str) -> Result<()> {
    retry_restart(|| {
        let (old_parent_path, old_name) = split_path(old_path)?;
        let (new_parent_path, new_name) = split_path(new_path)?;
        vol.path_validator.validate_component(new_name)?;
        let old_parent = lookup(vol, old_parent_path)?;
        let new_parent = lookup(vol, new_parent_path)?;
        let result = vol.tree.rename(old_parent.uid, old_name, new_parent.uid, new_name);
        release(&vol.tree, &old_parent);
        release(&vol.tree, &new_parent);
        result
    })?;
    vol.mark_dirty();
    Ok(())
}

pub fn readdir<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<Vec<(String, u64, DentryType)>> {
    let dentry = lookup(vol, path)?;
    if dentry.kind != DentryType::Directory {
        release(&vol.tree, &dentry);
        return Err(Error::NotADir);
    }
    let children: Vec<(String, u64)> = {
        let contents = dentry.contents.read().unwrap();
        contents.children.iter().map(|(n, u)| (n.clone(), *u)).collect()
    };
    let mut out = Vec::with_capacity(children.len());
    for (name, uid) in children {
        if let Some(child) = vol.tree.get(uid) {
            out.push((name, uid, child.kind));
        }
    }
    release(&vol.tree, &dentry);
    Ok(out)
}

pub fn setattr<T: TapeTransport>(
    vol: &Volume<T>,
    path: &str,
    readonly: Option<bool>,
    times: Option<Times>,
) -> Result<Attr> {
    let dentry = lookup(vol, path)?;
    {
        let mut meta = dentry.meta.lock().unwrap();
        if let Some(ro) = readonly {
            meta.readonly = ro;
        }
        if let Some(t) = times {
            meta.times = t;
        } else {
            meta.times.change = Utc::now();
        }
    }
    let attr = build_attr(&dentry);
    release(&vol.tree, &dentry);
    vol.mark_dirty();
    Ok(attr)
}

pub fn statfs<T: TapeTransport>(vol: &Volume<T>) -> (u64, u64) {
    let ip_remaining = match vol.with_device(|mgr| Ok(mgr.capacity_state(vol.index_partition))) {
        Ok(s) => s,
        Err(_) => tape_transport::CapacityState::Ok,
    };
    let _ = ip_remaining;
    (vol.blocksize as u64, vol.tree.highest_uid())
}

// --- Extended attributes -------------------------------------------------

/// Adapts a single `(Volume, Dentry)` pair to [`VirtualXattrContext`] for
/// the duration of one xattr call.
struct XattrCtx<'a, T: TapeTransport> {
    vol: &'a Volume<T>,
    dentry: &'a Dentry,
}

impl<'a, T: TapeTransport> VirtualXattrContext for XattrCtx<'a, T> {
    fn volume_uuid(&self) -> String {
        self.vol.volume_uuid.to_string()
    }

    fn volume_serial(&self) -> String {
        self.vol.volume_uuid.simple().to_string()[..6].to_string()
    }

    fn volume_name(&self) -> String {
        self.dentry.meta.lock().unwrap().volume_name.clone().unwrap_or_default()
    }

    fn set_volume_name(&mut self, name: String) -> Result<()> {
        self.dentry.meta.lock().unwrap().volume_name = Some(name);
        self.vol.mark_dirty();
        Ok(())
    }

    fn index_version(&self) -> String {
        crate::index::xml::CURRENT_INDEX_SCHEMA.to_string()
    }

    fn label_version(&self) -> String {
        crate::label::CURRENT_LABEL_SCHEMA.to_string()
    }

    fn index_generation(&self) -> u64 {
        self.vol.index_generation()
    }

    fn index_time(&self) -> String {
        crate::index::xml::format_ltfs_time(self.vol.index_meta().update_time)
    }

    fn index_location(&self) -> String {
        let meta = self.vol.index_meta();
        format!("{}:{}", meta.location.partition.as_letter(), meta.location.block)
    }

    fn index_previous(&self) -> String {
        match self.vol.index_meta().previous_generation_location {
            Some(p) => format!("{}:{}", p.partition.as_letter(), p.block),
            None => String::new(),
        }
    }

    fn index_creator(&self) -> String {
        self.vol.index_meta().creator
    }

    fn label_creator(&self) -> String {
        self.vol.creator.clone()
    }

    fn policy_exists(&self) -> bool {
        self.vol.index_meta().index_partition_criteria.is_some()
    }

    fn policy_allow_update(&self) -> bool {
        self.vol.index_meta().allow_policy_update
    }

    fn policy_max_file_size(&self) -> u64 {
        self.vol
            .index_meta()
            .index_partition_criteria
            .map(|c| c.max_filesize)
            .unwrap_or(0)
    }

    fn partition_map(&self) -> String {
        format!("{}{}", vol_letter(self.vol.index_partition), vol_letter(self.vol.data_partition))
    }

    fn media_encrypted(&self) -> bool {
        false
    }

    fn drive_encryption_state(&self) -> String {
        "off".to_string()
    }

    fn drive_encryption_method(&self) -> String {
        "none".to_string()
    }

    fn media_storage_alert(&self) -> bool {
        self.vol.media_storage_alert()
    }

    fn media_recovered_write_errors(&self) -> u64 {
        self.vol.media_recovered_write_errors()
    }

    fn commit_message(&self) -> Vec<u8> {
        self.vol.commit_message()
    }

    fn set_commit_message(&mut self, value: Vec<u8>) -> Result<()> {
        self.vol.set_commit_message(value);
        Ok(())
    }

    fn request_sync(&mut self) -> Result<()> {
        self.vol.request_sync(crate::sync_engine::SyncTrigger::ExplicitXattr);
        Ok(())
    }

    fn capture_dump(&mut self, _value: &[u8]) -> Result<()> {
        // No physical drive behind `FileTransport` to issue a dump-capture
        // command to; accept and discard. Best-effort diagnostic trigger,
        // not required to do anything observable from the filesystem side.
        Ok(())
    }

    fn set_vendor(&mut self, suffix: &str, value: &[u8]) -> Result<()> {
        let mut meta = self.dentry.meta.lock().unwrap();
        let name = format!("ltfs.vendor.{suffix}");
        if value.is_empty() {
            xattr::real::remove(&mut meta.xattrs, &name).or(Ok(()))
        } else {
            xattr::real::set(&mut meta.xattrs, &name, value, SetFlags::None)
        }
    }

    fn get_vendor(&self, suffix: &str) -> Result<Vec<u8>> {
        let meta = self.dentry.meta.lock().unwrap();
        xattr::real::get(&meta.xattrs, &format!("ltfs.vendor.{suffix}")).map(|v| v.to_vec())
    }

    fn file_placement(&self) -> Option<(char, u64)> {
        let contents = self.dentry.contents.read().unwrap();
        let first = contents.extents.iter().min_by_key(|e| e.file_offset)?;
        Some((first.start.partition.as_letter(), first.start.block))
    }

    fn create_time(&self) -> String {
        crate::index::xml::format_ltfs_time(self.dentry.meta.lock().unwrap().times.creation)
    }

    fn set_create_time(&mut self, value: &str) -> Result<()> {
        self.dentry.meta.lock().unwrap().times.creation = crate::index::xml::parse_ltfs_time(value)?;
        Ok(())
    }

    fn modify_time(&self) -> String {
        crate::index::xml::format_ltfs_time(self.dentry.meta.lock().unwrap().times.modify)
    }

    fn set_modify_time(&mut self, value: &str) -> Result<()> {
        self.dentry.meta.lock().unwrap().times.modify = crate::index::xml::parse_ltfs_time(value)?;
        Ok(())
    }

    fn access_time(&self) -> String {
        crate::index::xml::format_ltfs_time(self.dentry.meta.lock().unwrap().times.access)
    }

    fn set_access_time(&mut self, value: &str) -> Result<()> {
        self.dentry.meta.lock().unwrap().times.access = crate::index::xml::parse_ltfs_time(value)?;
        Ok(())
    }

    fn change_time(&self) -> String {
        crate::index::xml::format_ltfs_time(self.dentry.meta.lock().unwrap().times.change)
    }

    fn set_change_time(&mut self, value: &str) -> Result<()> {
        self.dentry.meta.lock().unwrap().times.change = crate::index::xml::parse_ltfs_time(value)?;
        Ok(())
    }

    fn backup_time(&self) -> String {
        crate::index::xml::format_ltfs_time(self.dentry.meta.lock().unwrap().times.backup)
    }

    fn set_backup_time(&mut self, value: &str) -> Result<()> {
        self.dentry.meta.lock().unwrap().times.backup = crate::index::xml::parse_ltfs_time(value)?;
        Ok(())
    }
}

fn vol_letter(p: PartitionId) -> char {
    p.as_letter()
}

fn check_root_only(vol_root_uid: u64, dentry_uid: u64, name: &str) -> Result<()> {
    if let Some((_, root_only)) = xattr::classify(name) {
        if root_only && dentry_uid != vol_root_uid {
            return Err(Error::InvalidPath(format!("{name} is only valid on the volume root")));
        }
    }
    Ok(())
}

/// Core of `getxattr`, operating on an already-resolved dentry; shared by
/// the path-based façade call and `fuse_binding`'s ino-based one. `name`
/// is classified after stripping a `user.` prefix (real syscalls pass it
/// through unmodified), but real-xattr storage keeps the caller's
/// original name so it round-trips through whatever namespace it came in
/// under.
pub fn getxattr_on<T: TapeTransport>(vol: &Volume<T>, dentry: &Dentry, name: &str) -> Result<Vec<u8>> {
    let classify_name = xattr::strip_user_prefix(name);
    if xattr::is_virtual(classify_name) {
        check_root_only(vol.tree.root().uid, dentry.uid, classify_name)?;
        let ctx = XattrCtx { vol, dentry };
        xattr::get_virtual(&ctx, classify_name)
    } else {
        let meta = dentry.meta.lock().unwrap();
        xattr::real::get(&meta.xattrs, name).map(|v| v.to_vec())
    }
}

pub fn setxattr_on<T: TapeTransport>(vol: &Volume<T>, dentry: &Dentry, name: &str, value: &[u8]) -> Result<()> {
    let classify_name = xattr::strip_user_prefix(name);
    let result = if xattr::is_virtual(classify_name) {
        check_root_only(vol.tree.root().uid, dentry.uid, classify_name)?;
        let mut ctx = XattrCtx { vol, dentry };
        xattr::set_virtual(&mut ctx, classify_name, value)
    } else {
        let mut meta = dentry.meta.lock().unwrap();
        xattr::real::set(&mut meta.xattrs, name, value, SetFlags::None)
    };
    if result.is_ok() {
        vol.mark_dirty();
    }
    result
}

const ROOT_XATTR_NAMES: &[&str] = &[
    "ltfs.volumeUUID",
    "ltfs.volumeName",
    "ltfs.volumeSerial",
    "ltfs.indexVersion",
    "ltfs.labelVersion",
    "ltfs.indexGeneration",
    "ltfs.indexTime",
    "ltfs.indexLocation",
    "ltfs.indexPrevious",
    "ltfs.indexCreator",
    "ltfs.labelCreator",
    "ltfs.commitMessage",
    "ltfs.policyExists",
    "ltfs.policyAllowUpdate",
    "ltfs.policyMaxFileSize",
    "ltfs.partitionMap",
    "ltfs.mediaEncrypted",
    "ltfs.driveEncryptionState",
    "ltfs.driveEncryptionMethod",
    "ltfs.mediaStorageAlert",
    "ltfs.mediaRecoveredWriteErrors",
];

const NON_ROOT_XATTR_NAMES: &[&str] = &["ltfs.createTime", "ltfs.modifyTime", "ltfs.accessTime", "ltfs.changeTime", "ltfs.backupTime"];

/// `needs_user_prefix` should be `true` for hosts (a real FUSE mount)
/// that require clients to address virtual xattrs as `user.ltfs.*`; such
/// hosts get no virtual names back from `listxattr` at all, since a name
/// without the prefix wouldn't round-trip through their syscalls.
pub fn listxattr_on<T: TapeTransport>(vol: &Volume<T>, dentry: &Dentry, needs_user_prefix: bool) -> Vec<String> {
    let real: Vec<XAttr> = dentry.meta.lock().unwrap().xattrs.clone();
    let is_root = dentry.uid == vol.tree.root().uid;
    let visible = if is_root { ROOT_XATTR_NAMES } else { NON_ROOT_XATTR_NAMES };
    xattr::list_names(&real, visible, needs_user_prefix)
}

pub fn removexattr_on<T: TapeTransport>(vol: &Volume<T>, dentry: &Dentry, name: &str) -> Result<()> {
    let classify_name = xattr::strip_user_prefix(name);
    let result = if xattr::is_virtual(classify_name) {
        check_root_only(vol.tree.root().uid, dentry.uid, classify_name)?;
        let mut ctx = XattrCtx { vol, dentry };
        xattr::remove_virtual(&mut ctx, classify_name)
    } else {
        let mut meta = dentry.meta.lock().unwrap();
        xattr::real::remove(&mut meta.xattrs, name)
    };
    if result.is_ok() {
        vol.mark_dirty();
    }
    result
}

pub fn getxattr<T: TapeTransport>(vol: &Volume<T>, path: &str, name: &str) -> Result<Vec<u8>> {
    let dentry = lookup(vol, path)?;
    let result = getxattr_on(vol, &dentry, name);
    release(&vol.tree, &dentry);
    result
}

pub fn setxattr<T: TapeTransport>(vol: &Volume<T>, path: &str, name: &str, value: &[u8]) -> Result<()> {
    let dentry = lookup(vol, path)?;
    let result = setxattr_on(vol, &dentry, name, value);
    release(&vol.tree, &dentry);
    result
}

pub fn listxattr<T: TapeTransport>(vol: &Volume<T>, path: &str) -> Result<Vec<String>> {
    let dentry = lookup(vol, path)?;
    let names = listxattr_on(vol, &dentry, false);
    release(&vol.tree, &dentry);
    Ok(names)
}

pub fn removexattr<T: TapeTransport>(vol: &Volume<T>, path: &str, name: &str) -> Result<()> {
    let dentry = lookup(vol, path)?;
    let result = removexattr_on(vol, &dentry, name);
    release(&vol.tree, &dentry);
    result
}

/// Converts an LTFS timestamp to `SystemTime`, for bindings (like FUSE's
/// `fuser::FileAttr`) that want `std::time` rather than `chrono`.
pub fn to_system_time(t: DateTime<Utc>) -> SystemTime {
    SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(t.timestamp().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VolumePolicy;
    use tape_transport::file::FileTransport;

    fn volume() -> Volume<FileTransport> {
        Volume::format(FileTransport::new(), 4096, "rust-ltfs", VolumePolicy::default()).unwrap()
    }

    #[test]
    fn create_write_read_round_trips() {
        let vol = volume();
        let file = create(&vol, "/hello.txt").unwrap();
        write(&vol, &file, 0, b"hello world").unwrap();
        close(&vol, &file).unwrap();

        let file = open(&vol, "/hello.txt").unwrap();
        let data = read(&vol, &file, 0, 11).unwrap();
        assert_eq!(data, b"hello world");
        release(&vol.tree, &file);
    }

    #[test]
    fn mkdir_then_readdir_lists_child() {
        let vol = volume();
        mkdir(&vol, "/sub").unwrap();
        create(&vol, "/sub/a.txt").unwrap();
        let entries = readdir(&vol, "/sub").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a.txt");
    }

    #[test]
    fn rename_moves_entry() {
        let vol = volume();
        create(&vol, "/a.txt").unwrap();
        rename(&vol, "/a.txt", "/b.txt").unwrap();
        assert!(getattr(&vol, "/b.txt").is_ok());
        assert!(getattr(&vol, "/a.txt").is_err());
    }

    #[test]
    fn root_only_virtual_xattr_rejected_on_file() {
        let vol = volume();
        create(&vol, "/a.txt").unwrap();
        let err = getxattr(&vol, "/a.txt", "ltfs.volumeUUID").unwrap_err();
        assert_eq!(err, Error::InvalidPath("ltfs.volumeUUID is only valid on the volume root".into()));
        assert!(getxattr(&vol, "/", "ltfs.volumeUUID").is_ok());
    }

    #[test]
    fn vendor_xattr_round_trips() {
        let vol = volume();
        create(&vol, "/a.txt").unwrap();
        setxattr(&vol, "/a.txt", "ltfs.vendor.note", b"hi").unwrap();
        assert_eq!(getxattr(&vol, "/a.txt", "ltfs.vendor.note").unwrap(), b"hi");
    }
}
