//! In-memory dentry tree (C4).
//!
//! The parent back-reference is an arena handle (a `u64` UID) instead of
//! a real pointer, which breaks the dentry/parent reference cycle for
//! ownership purposes. Extent lists are a flat `Vec<Extent>` rather than
//! a tail-queue of nodes: cache-friendly, and O(n) is fine given
//! practical extent counts.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use tape_transport::{PartitionId, TapePosition};

use crate::error::{Error, Result};
use crate::xattr::XAttr;

pub const ROOT_UID: u64 = 1;

/// A materialized file region. Immutable once written; a
/// truncate or overwrite trims/replaces entries in the owning file's
/// extent list, it never mutates bytes already on tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: TapePosition,
    pub byte_offset: u32,
    pub byte_count: u64,
    pub file_offset: u64,
}

impl Extent {
    pub fn end_offset(&self) -> u64 {
        self.file_offset + self.byte_count
    }
}

/// Validates the invariants from: sorted by `file_offset`, no
/// overlap.
pub fn validate_extents(extents: &[Extent]) -> bool {
    extents
        .windows(2)
        .all(|w| w[0].file_offset <= w[1].file_offset && w[0].end_offset() <= w[1].file_offset)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryType {
    Directory,
    File,
    Symlink,
}

/// Timestamps carried by every dentry.
#[derive(Debug, Clone, Copy)]
pub struct Times {
    pub creation: DateTime<Utc>,
    pub modify: DateTime<Utc>,
    pub access: DateTime<Utc>,
    pub change: DateTime<Utc>,
    pub backup: DateTime<Utc>,
}

impl Times {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            creation: now,
            modify: now,
            access: now,
            change: now,
            backup: now,
        }
    }
}

/// Fields protected by `meta_lock`: name, timestamps, xattrs,
/// parent, link/refcounts, size/realsize, readonly.
#[derive(Debug)]
pub struct Meta {
    pub name: String,
    pub platform_safe_name: String,
    pub times: Times,
    pub readonly: bool,
    pub xattrs: Vec<XAttr>,
    pub parent: Option<u64>,
    pub link_count: u64,
    /// Raw XML byte ranges this version didn't recognize, captured at
    /// parse time and re-emitted verbatim.
    pub unknown_tags: Vec<Vec<u8>>,
    /// Only meaningful for files: logical EOF and the EOF excluding the
    /// implicit sparse tail.
    pub size: u64,
    pub realsize: u64,
    /// Root directory only.
    pub volume_name: Option<String>,
    /// Symlink target.
    pub symlink_target: Option<String>,
}

/// Fields protected by `contents_lock`: the extent list, and
/// for directories the child map itself.
#[derive(Debug, Default)]
pub struct Contents {
    pub extents: Vec<Extent>,
    pub children: HashMap<String, u64>,
}

/// A single in-memory tree node. Lock order within a dentry is always
/// `contents_lock` before `meta_lock`.
pub struct Dentry {
    pub uid: u64,
    pub kind: DentryType,
    pub contents: RwLock<Contents>,
    pub meta: Mutex<Meta>,
    pub refcount: AtomicU64,
    /// Private to the I/O scheduler (C7); never touched by C4/C10 code.
    pub iosched: Mutex<Option<crate::iosched::FileIoState>>,
}

impl Dentry {
    fn new(uid: u64, kind: DentryType, name: String, parent: Option<u64>) -> Self {
        Self {
            uid,
            kind,
            contents: RwLock::new(Contents::default()),
            meta: Mutex::new(Meta {
                platform_safe_name: name.clone(),
                name,
                times: Times::now(),
                readonly: false,
                xattrs: Vec::new(),
                parent,
                link_count: 1,
                unknown_tags: Vec::new(),
                size: 0,
                realsize: 0,
                volume_name: None,
                symlink_target: None,
            }),
            refcount: AtomicU64::new(1),
            iosched: Mutex::new(None),
        }
    }

    pub fn is_deletable(&self) -> bool {
        let meta = self.meta.lock().unwrap();
        meta.link_count == 0 && self.refcount.load(Ordering::SeqCst) == 0
    }
}

/// The volume-wide arena of dentries plus UID allocation. Allocation is
/// a fetch-and-add on the index's `uid_number`.
pub struct Tree {
    arena: RwLock<HashMap<u64, std::sync::Arc<Dentry>>>,
    next_uid: AtomicU64,
    pub rename_lock: Mutex<()>,
}

impl Tree {
    /// A fresh tree with just the root directory (UID 1),
    /// ("UID 0 is reserved; UID 1 is the root directory").
    pub fn new_empty(volume_name: String) -> Self {
        let tree = Self {
            arena: RwLock::new(HashMap::new()),
            next_uid: AtomicU64::new(2),
            rename_lock: Mutex::new(()),
        };
        let root = Dentry::new(ROOT_UID, DentryType::Directory, String::new(), None);
        root.meta.lock().unwrap().volume_name = Some(volume_name);
        tree.arena.write().unwrap().insert(ROOT_UID, std::sync::Arc::new(root));
        tree
    }

    pub fn highest_uid(&self) -> u64 {
        self.next_uid.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Restores UID allocation state after a mount parses an index whose
    /// `highestfileuid` is known.
    pub fn set_next_uid(&self, highest: u64) {
        self.next_uid.store(highest + 1, Ordering::SeqCst);
    }

    pub fn allocate_uid(&self) -> u64 {
        self.next_uid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self, uid: u64) -> Option<std::sync::Arc<Dentry>> {
        self.arena.read().unwrap().get(&uid).cloned()
    }

    pub fn root(&self) -> std::sync::Arc<Dentry> {
        self.get(ROOT_UID).expect("root always present")
    }

    /// Resolves a dentry directly by UID, bumping its refcount (balanced
    /// by [`Tree::put`]). Used by bindings that already have an inode
    /// number in hand (FUSE) instead of a path to walk.
    pub fn hold(&self, uid: u64) -> Result<std::sync::Arc<Dentry>> {
        let dentry = self.get(uid).ok_or(Error::NoDentry)?;
        dentry.refcount.fetch_add(1, Ordering::SeqCst);
        Ok(dentry)
    }

    fn insert(&self, dentry: std::sync::Arc<Dentry>) {
        self.arena.write().unwrap().insert(dentry.uid, dentry);
    }

    fn remove(&self, uid: u64) {
        self.arena.write().unwrap().remove(&uid);
    }

    /// Creates a new dentry under `parent`, taking both dentries'
    /// `meta_lock`s in parent->child order (lifecycle).
    pub fn create_child(
        &self,
        parent_uid: u64,
        name: &str,
        kind: DentryType,
    ) -> Result<std::sync::Arc<Dentry>> {
        let parent = self.get(parent_uid).ok_or(Error::NoDentry)?;
        if parent.kind != DentryType::Directory {
            return Err(Error::NotADir);
        }
        {
            let contents = parent.contents.read().unwrap();
            if contents.children.contains_key(name) {
                return Err(Error::Exists);
            }
        }
        let uid = self.allocate_uid();
        let child = std::sync::Arc::new(Dentry::new(uid, kind, name.to_string(), Some(parent_uid)));
        {
            let mut contents = parent.contents.write().unwrap();
            contents.children.insert(name.to_string(), uid);
        }
        {
            let mut pmeta = parent.meta.lock().unwrap();
            pmeta.times.modify = Utc::now();
            pmeta.times.change = pmeta.times.modify;
        }
        self.insert(child.clone());
        Ok(child)
    }

    /// Like [`Tree::create_child`] but takes an explicit UID instead of
    /// allocating one. Used only by the XML index parser (C5), which is
    /// reconstructing a tree whose UIDs were already assigned on a prior
    /// mount.
    pub fn create_child_with_uid(
        &self,
        parent_uid: u64,
        uid: u64,
        name: &str,
        kind: DentryType,
    ) -> Result<std::sync::Arc<Dentry>> {
        let parent = self.get(parent_uid).ok_or(Error::NoDentry)?;
        let child = std::sync::Arc::new(Dentry::new(uid, kind, name.to_string(), Some(parent_uid)));
        parent.contents.write().unwrap().children.insert(name.to_string(), uid);
        self.insert(child.clone());
        Ok(child)
    }

    /// Looks up a single path component under `parent`, bumping the
    /// resolved dentry's refcount (balanced by [`Tree::put`]),
    pub fn lookup_child(&self, parent_uid: u64, name: &str) -> Result<std::sync::Arc<Dentry>> {
        let parent = self.get(parent_uid).ok_or(Error::NoDentry)?;
        let child_uid = {
            let contents = parent.contents.read().unwrap();
            *contents.children.get(name).ok_or(Error::NoDentry)?
        };
        let child = self.get(child_uid).ok_or(Error::NoDentry)?;
        child.refcount.fetch_add(1, Ordering::SeqCst);
        Ok(child)
    }

    /// Resolves a full `/`-separated path, each component validated by
    /// `validator`.
    pub fn lookup_path(&self, path: &str, validator: &dyn crate::pathvalidator::PathValidator) -> Result<std::sync::Arc<Dentry>> {
        let mut current = self.root();
        current.refcount.fetch_add(1, Ordering::SeqCst);
        if path.trim_matches('/').is_empty() {
            return Ok(current);
        }
        for component in path.trim_matches('/').split('/') {
            validator.validate_component(component)?;
            let next = self.lookup_child(current.uid, component);
            self.put(&current);
            current = next?;
        }
        Ok(current)
    }

    /// Balances a prior `lookup_*`/`create_child` refcount increment;
    /// destroys the dentry if it becomes unreachable (lifecycle).
    pub fn put(&self, dentry: &std::sync::Arc<Dentry>) {
        if dentry.refcount.fetch_sub(1, Ordering::SeqCst) == 1 && dentry.is_deletable() {
            self.remove(dentry.uid);
        }
    }

    /// Unlinks `name` from `parent`'s child map; drops the tree's
    /// reference to the dentry (link_count -> 0) but leaves destruction to
    /// the last `put`.
    pub fn unlink(&self, parent_uid: u64, name: &str) -> Result<()> {
        let parent = self.get(parent_uid).ok_or(Error::NoDentry)?;
        let child_uid = {
            let mut contents = parent.contents.write().unwrap();
            contents.children.remove(name).ok_or(Error::NoDentry)?
        };
        let child = self.get(child_uid).ok_or(Error::NoDentry)?;
        if child.kind == DentryType::Directory {
            let contents = child.contents.read().unwrap();
            if !contents.children.is_empty() {
                drop(contents);
                // put it back; the operation failed.
                parent.contents.write().unwrap().children.insert(name.to_string(), child_uid);
                return Err(Error::NotEmpty);
            }
        }
        {
            let mut meta = child.meta.lock().unwrap();
            meta.link_count = meta.link_count.saturating_sub(1);
        }
        if child.is_deletable() {
            self.remove(child_uid);
        }
        Ok(())
    }

    /// Atomic rename under the volume-scoped `rename_lock`, in addition to
    /// both parents' and the moving dentry's own locks.
    pub fn rename(
        &self,
        old_parent_uid: u64,
        old_name: &str,
        new_parent_uid: u64,
        new_name: &str,
    ) -> Result<()> {
        let _guard = self.rename_lock.lock().unwrap();
        let old_parent = self.get(old_parent_uid).ok_or(Error::NoDentry)?;
        let new_parent = self.get(new_parent_uid).ok_or(Error::NoDentry)?;

        let moving_uid = {
            let contents = old_parent.contents.read().unwrap();
            *contents.children.get(old_name).ok_or(Error::NoDentry)?
        };
        let moving = self.get(moving_uid).ok_or(Error::NoDentry)?;

        if new_parent.kind != DentryType::Directory {
            return Err(Error::NotADir);
        }

        {
            let mut new_contents = new_parent.contents.write().unwrap();
            if new_contents.children.contains_key(new_name) {
                return Err(Error::Exists);
            }
            let mut old_contents = old_parent.contents.write().unwrap();
            old_contents.children.remove(old_name);
            new_contents.children.insert(new_name.to_string(), moving_uid);
        }
        {
            let mut meta = moving.meta.lock().unwrap();
            meta.name = new_name.to_string();
            meta.platform_safe_name = new_name.to_string();
            meta.parent = Some(new_parent_uid);
            meta.times.change = Utc::now();
        }
        let now = Utc::now();
        old_parent.meta.lock().unwrap().times.change = now;
        new_parent.meta.lock().unwrap().times.change = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pathvalidator::DefaultPathValidator;

    #[test]
    fn create_lookup_and_unlink() {
        let tree = Tree::new_empty("TESTVOL".to_string());
        let file = tree.create_child(ROOT_UID, "hello.txt", DentryType::File).unwrap();
        assert_eq!(file.uid, 2);
        let validator = DefaultPathValidator;
        let found = tree.lookup_path("/hello.txt", &validator).unwrap();
        assert_eq!(found.uid, file.uid);
        tree.put(&found);
        tree.unlink(ROOT_UID, "hello.txt").unwrap();
        assert!(tree.lookup_path("/hello.txt", &validator).is_err());
    }

    #[test]
    fn rename_updates_both_parents() {
        let tree = Tree::new_empty("TESTVOL".to_string());
        tree.create_child(ROOT_UID, "a", DentryType::Directory).unwrap();
        let validator = DefaultPathValidator;
        let dir = tree.lookup_path("/a", &validator).unwrap();
        tree.create_child(dir.uid, "f", DentryType::File).unwrap();
        tree.put(&dir);
        tree.rename(dir.uid, "f", dir.uid, "g").unwrap();
        let found = tree.lookup_path("/a/g", &validator).unwrap();
        assert_eq!(found.meta.lock().unwrap().name, "g");
    }

    #[test]
    fn extent_validation() {
        let pos = TapePosition::zero(PartitionId::B);
        let good = vec![
            Extent { start: pos, byte_offset: 0, byte_count: 10, file_offset: 0 },
            Extent { start: pos, byte_offset: 0, byte_count: 10, file_offset: 10 },
        ];
        assert!(validate_extents(&good));
        let overlapping = vec![
            Extent { start: pos, byte_offset: 0, byte_count: 10, file_offset: 0 },
            Extent { start: pos, byte_offset: 0, byte_count: 10, file_offset: 5 },
        ];
        assert!(!validate_extents(&overlapping));
    }
}
