//! Extended attributes (C9).
//!
//! Xattrs are serialized inline in the XML index as a name/value list;
//! no separate on-disk xattr block format. A dispatch table splits
//! requests between the real (XML-backed) xattrs and the virtual
//! `ltfs.*` ones computed on the fly.
use crate::error::{Error, Result};

/// Per: values over this size are rejected outright.
pub const MAX_XATTR_SIZE: usize = 4096;
/// `ltfs.commitMessage` is explicitly carved out to a larger limit.
pub const MAX_COMMIT_MESSAGE_SIZE: usize = 65536;

pub const VIRTUAL_PREFIX: &str = "ltfs.";
/// Namespace prefix Linux's xattr syscalls add for unprivileged callers;
/// real names the host passes through unmodified, so `ltfs.*` virtual
/// names only classify correctly once this is stripped first.
pub const USER_PREFIX: &str = "user.";

/// Strips the host `user.` namespace prefix, if present, before
/// classifying a name as real or virtual: a real xattr syscall on Linux
/// passes `user.ltfs.volumeUUID` through unmodified, so virtual names
/// never match `is_virtual`/`classify` without this.
pub fn strip_user_prefix(name: &str) -> &str {
    name.strip_prefix(USER_PREFIX).unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XAttr {
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFlags {
    None,
    Create,
    Replace,
}

pub fn is_virtual(name: &str) -> bool {
    name.starts_with(VIRTUAL_PREFIX)
}

/// Real (non-`ltfs.`) xattr operations over a dentry's stored list.
/// Called by C10 after it has determined `name` isn't virtual.
pub mod real {
    use super::*;

    pub fn set(list: &mut Vec<XAttr>, name: &str, value: &[u8], flags: SetFlags) -> Result<()> {
        if value.len() > MAX_XATTR_SIZE {
            return Err(Error::LargeXattr);
        }
        let existing = list.iter_mut().find(|x| x.name == name);
        match (existing, flags) {
            (Some(_), SetFlags::Create) => Err(Error::XattrExists),
            (Some(x), _) => {
                x.value = value.to_vec();
                Ok(())
            }
            (None, SetFlags::Replace) => Err(Error::NoXattr),
            (None, _) => {
                list.push(XAttr {
                    name: name.to_string(),
                    value: value.to_vec(),
                });
                Ok(())
            }
        }
    }

    pub fn get<'a>(list: &'a [XAttr], name: &str) -> Result<&'a [u8]> {
        list.iter()
            .find(|x| x.name == name)
            .map(|x| x.value.as_slice())
            .ok_or(Error::NoXattr)
    }

    pub fn list(list: &[XAttr]) -> Vec<String> {
        list.iter().map(|x| x.name.clone()).collect()
    }

    pub fn remove(list: &mut Vec<XAttr>, name: &str) -> Result<()> {
        let len_before = list.len();
        list.retain(|x| x.name != name);
        if list.len() == len_before {
            return Err(Error::NoXattr);
        }
        Ok(())
    }
}

/// Whether a reserved name is read-only, write-only, or read-write, and
/// whether it's root-only (the per-name table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// All fixed virtual names this version understands, grouped exactly as
/// lists them. `root_only` entries fail `getxattr`/`setxattr` on
/// any other dentry with `InvalidPath` (there's no more specific kind).
pub fn classify(name: &str) -> Option<(Access, bool)> {
    use Access::*;
    Some(match name {
        "ltfs.createTime" | "ltfs.modifyTime" | "ltfs.accessTime" | "ltfs.changeTime" | "ltfs.backupTime" => {
            (ReadWrite, false)
        }
        "ltfs.volumeUUID" => (ReadOnly, true),
        "ltfs.volumeName" => (ReadWrite, true),
        "ltfs.volumeSerial" => (ReadOnly, true),
        "ltfs.indexVersion"
        | "ltfs.labelVersion"
        | "ltfs.indexGeneration"
        | "ltfs.indexTime"
        | "ltfs.indexLocation"
        | "ltfs.indexPrevious"
        | "ltfs.indexCreator"
        | "ltfs.labelCreator" => (ReadOnly, true),
        "ltfs.commitMessage" => (ReadWrite, true),
        "ltfs.policyExists" | "ltfs.policyAllowUpdate" | "ltfs.policyMaxFileSize" => (ReadOnly, true),
        "ltfs.partitionMap"
        | "ltfs.mediaEncrypted"
        | "ltfs.driveEncryptionState"
        | "ltfs.driveEncryptionMethod"
        | "ltfs.mediaStorageAlert"
        | "ltfs.mediaRecoveredWriteErrors" => (ReadOnly, true),
        "ltfs.sync" => (WriteOnly, true),
        "ltfs.driveCaptureDump" => (WriteOnly, false),
        "ltfs.partition" | "ltfs.startblock" => (ReadOnly, false),
        _ if name.starts_with("ltfs.vendor.") => (ReadWrite, false),
        _ => return None,
    })
}

/// Live runtime state a virtual xattr reads or writes. C10/the `Volume`
/// façade implements this; C9 itself holds no mutable state of its own.
pub trait VirtualXattrContext {
    fn volume_uuid(&self) -> String;
    fn volume_serial(&self) -> String;
    fn volume_name(&self) -> String;
    fn set_volume_name(&mut self, name: String) -> Result<()>;

    fn index_version(&self) -> String;
    fn label_version(&self) -> String;
    fn index_generation(&self) -> u64;
    fn index_time(&self) -> String;
    fn index_location(&self) -> String;
    fn index_previous(&self) -> String;
    fn index_creator(&self) -> String;
    fn label_creator(&self) -> String;

    fn policy_exists(&self) -> bool;
    fn policy_allow_update(&self) -> bool;
    fn policy_max_file_size(&self) -> u64;

    fn partition_map(&self) -> String;
    fn media_encrypted(&self) -> bool;
    fn drive_encryption_state(&self) -> String;
    fn drive_encryption_method(&self) -> String;
    fn media_storage_alert(&self) -> bool;
    fn media_recovered_write_errors(&self) -> u64;

    fn commit_message(&self) -> Vec<u8>;
    fn set_commit_message(&mut self, value: Vec<u8>) -> Result<()>;

    fn request_sync(&mut self) -> Result<()>;
    fn capture_dump(&mut self, value: &[u8]) -> Result<()>;

    fn set_vendor(&mut self, suffix: &str, value: &[u8]) -> Result<()>;
    fn get_vendor(&self, suffix: &str) -> Result<Vec<u8>>;

    /// `(partition_letter, startblock)` of a file's first extent; `None`
    /// for empty files or for a directory (the façade maps that to
    /// `InvalidPath` before even calling here, per `classify`'s
    /// `root_only`-style gating, but the check is repeated defensively).
    fn file_placement(&self) -> Option<(char, u64)>;

    fn create_time(&self) -> String;
    fn set_create_time(&mut self, value: &str) -> Result<()>;
    fn modify_time(&self) -> String;
    fn set_modify_time(&mut self, value: &str) -> Result<()>;
    fn access_time(&self) -> String;
    fn set_access_time(&mut self, value: &str) -> Result<()>;
    fn change_time(&self) -> String;
    fn set_change_time(&mut self, value: &str) -> Result<()>;
    fn backup_time(&self) -> String;
    fn set_backup_time(&mut self, value: &str) -> Result<()>;
}

pub fn get_virtual(ctx: &dyn VirtualXattrContext, name: &str) -> Result<Vec<u8>> {
    let (access, _root_only) = classify(name).ok_or(Error::NoXattr)?;
    if access == Access::WriteOnly {
        return Err(Error::NoXattr);
    }
    Ok(match name {
        "ltfs.createTime" => ctx.create_time().into_bytes(),
        "ltfs.modifyTime" => ctx.modify_time().into_bytes(),
        "ltfs.accessTime" => ctx.access_time().into_bytes(),
        "ltfs.changeTime" => ctx.change_time().into_bytes(),
        "ltfs.backupTime" => ctx.backup_time().into_bytes(),
        "ltfs.volumeUUID" => ctx.volume_uuid().into_bytes(),
        "ltfs.volumeName" => ctx.volume_name().into_bytes(),
        "ltfs.volumeSerial" => ctx.volume_serial().into_bytes(),
        "ltfs.indexVersion" => ctx.index_version().into_bytes(),
        "ltfs.labelVersion" => ctx.label_version().into_bytes(),
        "ltfs.indexGeneration" => ctx.index_generation().to_string().into_bytes(),
        "ltfs.indexTime" => ctx.index_time().into_bytes(),
        "ltfs.indexLocation" => ctx.index_location().into_bytes(),
        "ltfs.indexPrevious" => ctx.index_previous().into_bytes(),
        "ltfs.indexCreator" => ctx.index_creator().into_bytes(),
        "ltfs.labelCreator" => ctx.label_creator().into_bytes(),
        "ltfs.commitMessage" => ctx.commit_message(),
        "ltfs.policyExists" => (ctx.policy_exists() as u8).to_string().into_bytes(),
        "ltfs.policyAllowUpdate" => (ctx.policy_allow_update() as u8).to_string().into_bytes(),
        "ltfs.policyMaxFileSize" => ctx.policy_max_file_size().to_string().into_bytes(),
        "ltfs.partitionMap" => ctx.partition_map().into_bytes(),
        "ltfs.mediaEncrypted" => (ctx.media_encrypted() as u8).to_string().into_bytes(),
        "ltfs.driveEncryptionState" => ctx.drive_encryption_state().into_bytes(),
        "ltfs.driveEncryptionMethod" => ctx.drive_encryption_method().into_bytes(),
        "ltfs.mediaStorageAlert" => (ctx.media_storage_alert() as u8).to_string().into_bytes(),
        "ltfs.mediaRecoveredWriteErrors" => ctx.media_recovered_write_errors().to_string().into_bytes(),
        "ltfs.partition" => {
            let (part, _) = ctx.file_placement().ok_or(Error::NoXattr)?;
            part.to_string().into_bytes()
        }
        "ltfs.startblock" => {
            let (_, block) = ctx.file_placement().ok_or(Error::NoXattr)?;
            block.to_string().into_bytes()
        }
        _ if name.starts_with("ltfs.vendor.") => ctx.get_vendor(&name["ltfs.vendor.".len()..])?,
        _ => return Err(Error::NoXattr),
    })
}

pub fn set_virtual(ctx: &mut dyn VirtualXattrContext, name: &str, value: &[u8]) -> Result<()> {
    let (access, _) = classify(name).ok_or(Error::NoXattr)?;
    if access == Access::ReadOnly {
        return Err(Error::RdonlyXattr);
    }
    if name == "ltfs.commitMessage" {
        if value.len() > MAX_COMMIT_MESSAGE_SIZE {
            return Err(Error::LargeXattr);
        }
    } else if value.len() > MAX_XATTR_SIZE {
        return Err(Error::LargeXattr);
    }
    let text = || String::from_utf8_lossy(value).into_owned();
    match name {
        "ltfs.createTime" => ctx.set_create_time(&text()),
        "ltfs.modifyTime" => ctx.set_modify_time(&text()),
        "ltfs.accessTime" => ctx.set_access_time(&text()),
        "ltfs.changeTime" => ctx.set_change_time(&text()),
        "ltfs.backupTime" => ctx.set_backup_time(&text()),
        "ltfs.volumeName" => ctx.set_volume_name(text()),
        "ltfs.commitMessage" => ctx.set_commit_message(value.to_vec()),
        "ltfs.sync" => ctx.request_sync(),
        "ltfs.driveCaptureDump" => ctx.capture_dump(value),
        _ if name.starts_with("ltfs.vendor.") => ctx.set_vendor(&name["ltfs.vendor.".len()..], value),
        _ => Err(Error::RdonlyXattr),
    }
}

/// Not every reserved virtual name is removable: only real xattrs and
/// `ltfs.vendor.*` entries can be.
pub fn remove_virtual(ctx: &mut dyn VirtualXattrContext, name: &str) -> Result<()> {
    if name.starts_with("ltfs.vendor.") {
        return ctx.set_vendor(&name["ltfs.vendor.".len()..], &[]);
    }
    let _ = ctx;
    Err(Error::RdonlyXattr)
}

/// Names to surface from `listxattr`. Virtual xattrs are omitted when
/// `omit_virtual` is set (hosts, like a real FUSE mount, that require a
/// `user.` namespace prefix skip them entirely rather than report a name
/// no syscall can round-trip); real xattrs are always included.
pub fn list_names(real: &[XAttr], include_virtual: &[&str], omit_virtual: bool) -> Vec<String> {
    let mut names = real::list(real);
    if !omit_virtual {
        names.extend(include_virtual.iter().map(|s| s.to_string()));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_set_get_list_remove() {
        let mut list = Vec::new();
        real::set(&mut list, "user.foo", b"bar", SetFlags::None).unwrap();
        assert_eq!(real::get(&list, "user.foo").unwrap(), b"bar");
        assert_eq!(real::list(&list), vec!["user.foo".to_string()]);
        assert_eq!(real::set(&mut list, "user.foo", b"baz", SetFlags::Create).unwrap_err(), Error::XattrExists);
        real::remove(&mut list, "user.foo").unwrap();
        assert_eq!(real::get(&list, "user.foo").unwrap_err(), Error::NoXattr);
    }

    #[test]
    fn oversized_value_rejected() {
        let mut list = Vec::new();
        let big = vec![0u8; MAX_XATTR_SIZE + 1];
        assert_eq!(real::set(&mut list, "user.big", &big, SetFlags::None).unwrap_err(), Error::LargeXattr);
    }

    #[test]
    fn classify_matches_spec_table() {
        assert_eq!(classify("ltfs.volumeUUID"), Some((Access::ReadOnly, true)));
        assert_eq!(classify("ltfs.commitMessage"), Some((Access::ReadWrite, true)));
        assert_eq!(classify("ltfs.sync"), Some((Access::WriteOnly, true)));
        assert_eq!(classify("ltfs.vendor.logLevel"), Some((Access::ReadWrite, false)));
        assert_eq!(classify("user.anything"), None);
    }
}
