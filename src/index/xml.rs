//! XML index codec (C5).
//!
//! Built on `quick-xml`'s streaming `Reader`/`Writer` API rather than
//! `serde` + the `quick-xml` serde feature, because unknown-tag
//! preservation wants raw byte capture at arbitrary scopes, which a
//! derive macro can't express but manual events can.
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use uuid::Uuid;

use tape_transport::{PartitionId, TapePosition};

use crate::error::{Error, Result};
use crate::tree::{DentryType, Extent, Times, Tree};
use crate::xattr::XAttr;

pub const CURRENT_INDEX_SCHEMA: &str = "2.4.0";
pub const MIN_SUPPORTED_SCHEMA: (u32, u32, u32) = (2, 0, 0);
pub const MAX_SUPPORTED_SCHEMA: (u32, u32, u32) = (2, 4, 0);

/// Clamps a timestamp into `[0000-01-01T00:00:00, 9999-12-31T23:59:59.999999999]`
///, returning whether clamping occurred.
pub fn clamp_time(t: DateTime<Utc>) -> (DateTime<Utc>, bool) {
    let min = Utc.with_ymd_and_hms(0, 1, 1, 0, 0, 0).unwrap();
    let max = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap() + chrono::Duration::nanoseconds(999_999_999);
    if t < min {
        (min, true)
    } else if t > max {
        (max, true)
    } else {
        (t, false)
    }
}

pub fn format_ltfs_time(t: DateTime<Utc>) -> String {
    let (clamped, _) = clamp_time(t);
    clamped.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string()
}

pub fn parse_ltfs_time(s: &str) -> Result<DateTime<Utc>> {
    let trimmed = s.trim().trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| Error::BadIndex)?;
    Ok(Utc.from_utc_datetime(&naive))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn is_xml_safe(c: char) -> bool {
    // Valid XML 1.0 char production, excluding control chars that force
    // base64 fallback.
    matches!(c, '\u{9}' | '\u{A}' | '\u{D}' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}')
}

fn encode_value(value: &[u8]) -> String {
    if value.is_empty() {
        return "<value></value>".to_string();
    }
    if let Ok(s) = std::str::from_utf8(value) {
        if s.chars().all(is_xml_safe) {
            return format!("<value>{}</value>", escape(s));
        }
    }
    format!("<value type=\"base64\">{}</value>", base64::encode(value))
}

fn decode_value(text: &str, is_base64: bool) -> Vec<u8> {
    if is_base64 {
        base64::decode(text.trim()).unwrap_or_default()
    } else {
        unescape_xml(text).into_bytes()
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

fn serialize_xattrs(list: &[XAttr]) -> String {
    if list.is_empty() {
        return "<extendedattributes></extendedattributes>".to_string();
    }
    let mut out = String::from("<extendedattributes>");
    for x in list {
        out.push_str("<xattr><key>");
        out.push_str(&escape(&x.name));
        out.push_str("</key>");
        out.push_str(&encode_value(&x.value));
        out.push_str("</xattr>");
    }
    out.push_str("</extendedattributes>");
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPartitionCriteriaXml {
    pub max_filesize: u64,
    pub names: Vec<String>,
}

/// Everything in an `<ltfsindex>` document outside the tree itself.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub creator: String,
    pub comment: Option<String>,
    pub volume_uuid: Uuid,
    pub generation_number: u64,
    pub update_time: DateTime<Utc>,
    pub location: TapePosition,
    pub previous_generation_location: Option<TapePosition>,
    pub allow_policy_update: bool,
    pub index_partition_criteria: Option<IndexPartitionCriteriaXml>,
    pub highest_file_uid: u64,
    pub unknown_tags: Vec<Vec<u8>>,
}

/// Builds the initial empty-root-directory index written at format time
/// (step 2).
pub fn empty_index_xml(volume_uuid: Uuid, generation: u64) -> String {
    let meta = IndexMeta {
        creator: "rust-ltfs".to_string(),
        comment: None,
        volume_uuid,
        generation_number: generation,
        update_time: Utc::now(),
        location: TapePosition::zero(PartitionId::A),
        previous_generation_location: None,
        allow_policy_update: true,
        index_partition_criteria: None,
        highest_file_uid: 1,
        unknown_tags: Vec::new(),
    };
    let tree = Tree::new_empty(String::new());
    serialize_index(&meta, &tree).expect("fresh empty tree always serializes").0
}

fn serialize_location(tag: &str, pos: &TapePosition) -> String {
    format!(
        "<{tag}><partition>{part}</partition><startblock>{block}</startblock></{tag}>",
        tag = tag,
        part = pos.partition.as_letter(),
        block = pos.block,
    )
}

fn serialize_times(times: &Times, clamped: &mut bool) -> String {
    let mut emit = |t: DateTime<Utc>| {
        let (_, c) = clamp_time(t);
        *clamped = *clamped || c;
        format_ltfs_time(t)
    };
    format!(
        "<creationtime>{}</creationtime><changetime>{}</changetime><modifytime>{}</modifytime><accesstime>{}</accesstime><backuptime>{}</backuptime>",
        emit(times.creation), emit(times.change), emit(times.modify), emit(times.access), emit(times.backup),
    )
}

fn serialize_dentry(tree: &Tree, uid: u64, clamped: &mut bool) -> Result<String> {
    let dentry = tree.get(uid).ok_or(Error::BadIndex)?;
    let meta = dentry.meta.lock().unwrap();
    let mut out = String::new();
    match dentry.kind {
        DentryType::Directory => {
            out.push_str("<directory>");
            out.push_str(&format!(
                "<name>{}</name>",
                escape(meta.volume_name.as_deref().unwrap_or(&meta.name))
            ));
            out.push_str(&format!("<readonly>{}</readonly>", meta.readonly));
            out.push_str(&serialize_times(&meta.times, clamped));
            out.push_str(&format!("<fileuid>{}</fileuid>", dentry.uid));
            out.push_str(&serialize_xattrs(&meta.xattrs));
            out.push_str("<contents>");
            let mut child_uids: Vec<u64> = {
                let contents = dentry.contents.read().unwrap();
                contents.children.values().copied().collect()
            };
            child_uids.sort_unstable();
            for child_uid in child_uids {
                out.push_str(&serialize_dentry(tree, child_uid, clamped)?);
            }
            out.push_str("</contents>");
            for raw in &meta.unknown_tags {
                out.push_str(&String::from_utf8_lossy(raw));
            }
            out.push_str("</directory>");
        }
        DentryType::File | DentryType::Symlink => {
            out.push_str("<file>");
            out.push_str(&format!("<name>{}</name>", escape(&meta.name)));
            out.push_str(&format!("<length>{}</length>", meta.size));
            out.push_str(&format!("<readonly>{}</readonly>", meta.readonly));
            out.push_str(&serialize_times(&meta.times, clamped));
            out.push_str(&format!("<fileuid>{}</fileuid>", dentry.uid));
            out.push_str(&serialize_xattrs(&meta.xattrs));
            if dentry.kind == DentryType::Symlink {
                out.push_str(&format!(
                    "<symlink>{}</symlink>",
                    escape(meta.symlink_target.as_deref().unwrap_or(""))
                ));
            } else {
                out.push_str("<extentinfo>");
                let contents = dentry.contents.read().unwrap();
                for e in &contents.extents {
                    out.push_str(&format!(
                        "<extent><fileoffset>{fo}</fileoffset><partition>{part}</partition><startblock>{sb}</startblock><byteoffset>{bo}</byteoffset><bytecount>{bc}</bytecount></extent>",
                        fo = e.file_offset,
                        part = e.start.partition.as_letter(),
                        sb = e.start.block,
                        bo = e.byte_offset,
                        bc = e.byte_count,
                    ));
                }
                out.push_str("</extentinfo>");
            }
            for raw in &meta.unknown_tags {
                out.push_str(&String::from_utf8_lossy(raw));
            }
            out.push_str("</file>");
        }
    }
    Ok(out)
}

/// Serializes `tree` under `meta` into a full `<ltfsindex>` document.
/// Returns the XML text and whether any timestamp was clamped.
pub fn serialize_index(meta: &IndexMeta, tree: &Tree) -> Result<(String, bool)> {
    let mut clamped = false;
    let mut out = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ltfsindex version=\"{}\">", CURRENT_INDEX_SCHEMA);
    out.push_str(&format!("<creator>{}</creator>", escape(&meta.creator)));
    if let Some(c) = &meta.comment {
        out.push_str(&format!("<comment>{}</comment>", escape(c)));
    }
    out.push_str(&format!("<volumeuuid>{}</volumeuuid>", meta.volume_uuid));
    out.push_str(&format!("<generationnumber>{}</generationnumber>", meta.generation_number));
    {
        let (_, c) = clamp_time(meta.update_time);
        clamped = clamped || c;
    }
    out.push_str(&format!("<updatetime>{}</updatetime>", format_ltfs_time(meta.update_time)));
    out.push_str(&serialize_location("location", &meta.location));
    if let Some(prev) = &meta.previous_generation_location {
        out.push_str(&serialize_location("previousgenerationlocation", prev));
    }
    out.push_str(&format!("<allowpolicyupdate>{}</allowpolicyupdate>", meta.allow_policy_update));
    if let Some(criteria) = &meta.index_partition_criteria {
        out.push_str("<dataplacementpolicy><indexpartitioncriteria>");
        out.push_str(&format!("<size>{}</size>", criteria.max_filesize));
        for name in &criteria.names {
            out.push_str(&format!("<name>{}</name>", escape(name)));
        }
        out.push_str("</indexpartitioncriteria></dataplacementpolicy>");
    }
    out.push_str(&format!("<highestfileuid>{}</highestfileuid>", meta.highest_file_uid));
    out.push_str(&serialize_dentry(tree, crate::tree::ROOT_UID, &mut clamped)?);
    for raw in &meta.unknown_tags {
        out.push_str(&String::from_utf8_lossy(raw));
    }
    out.push_str("</ltfsindex>");
    Ok((out, clamped))
}

// --- Parsing -----------------------------------------------------------

struct EventCursor<'a> {
    reader: Reader<&'a [u8]>,
    buf: Vec<u8>,
    src: &'a [u8],
}

impl<'a> EventCursor<'a> {
    fn new(src: &'a [u8]) -> Self {
        let mut reader = Reader::from_reader(src);
        reader.trim_text(true);
        Self { reader, buf: Vec::new(), src }
    }

    fn next(&mut self) -> Result<Event<'static>> {
        self.buf.clear();
        self.reader
            .read_event(&mut self.buf)
            .map(|e| e.into_owned())
            .map_err(|_| Error::BadIndex)
    }

    fn pos(&self) -> usize {
        self.reader.buffer_position()
    }

    /// Reads text content up to a matching `End(name)`.
    fn read_text_until_end(&mut self, name: &[u8]) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.next()? {
                Event::Text(t) | Event::CData(t) => {
                    text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
                Event::End(e) if e.name().as_ref() == name => break,
                Event::Eof => return Err(Error::BadIndex),
                _ => {}
            }
        }
        Ok(unescape_xml(&text))
    }

    /// Skips to (and consumes) the matching `End(name)`, returning the raw
    /// bytes of the whole subtree starting at `start_pos` (position
    /// captured by the caller right before the opening tag).
    fn skip_capturing(&mut self, name: &[u8], start_pos: usize) -> Result<Vec<u8>> {
        let mut depth = 1u32;
        loop {
            match self.next()? {
                Event::Start(e) if e.name().as_ref() == name => depth += 1,
                Event::End(e) if e.name().as_ref() == name => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                Event::Eof => return Err(Error::BadIndex),
                _ => {}
            }
        }
        let end = self.pos();
        Ok(self.src[start_pos..end].to_vec())
    }
}

fn parse_xattrs(cursor: &mut EventCursor) -> Result<Vec<XAttr>> {
    let mut list = Vec::new();
    loop {
        match cursor.next()? {
            Event::Start(e) if e.name().as_ref() == b"xattr" => {
                let mut key = String::new();
                let mut value = Vec::new();
                loop {
                    match cursor.next()? {
                        Event::Start(inner) if inner.name().as_ref() == b"key" => {
                            key = cursor.read_text_until_end(b"key")?;
                        }
                        Event::Start(inner) if inner.name().as_ref() == b"value" => {
                            let is_base64 = inner.attributes().flatten().any(|a| {
                                a.key.as_ref() == b"type" && a.value.as_ref() == b"base64"
                            });
                            let text = cursor.read_text_until_end(b"value")?;
                            value = decode_value(&text, is_base64);
                        }
                        Event::End(e) if e.name().as_ref() == b"xattr" => break,
                        Event::Eof => return Err(Error::BadIndex),
                        _ => {}
                    }
                }
                list.push(XAttr { name: key, value });
            }
            Event::End(e) if e.name().as_ref() == b"extendedattributes" => break,
            Event::Eof => return Err(Error::BadIndex),
            _ => {}
        }
    }
    Ok(list)
}

fn parse_location(cursor: &mut EventCursor, end_tag: &[u8]) -> Result<TapePosition> {
    let mut partition = PartitionId::A;
    let mut block = 0u64;
    loop {
        match cursor.next()? {
            Event::Start(e) if e.name().as_ref() == b"partition" => {
                let text = cursor.read_text_until_end(b"partition")?;
                partition = match text.trim() {
                    "a" | "A" => PartitionId::A,
                    _ => PartitionId::B,
                };
            }
            Event::Start(e) if e.name().as_ref() == b"startblock" => {
                block = cursor.read_text_until_end(b"startblock")?.trim().parse().map_err(|_| Error::BadIndex)?;
            }
            Event::End(e) if e.name().as_ref() == end_tag => break,
            Event::Eof => return Err(Error::BadIndex),
            _ => {}
        }
    }
    Ok(TapePosition::new(partition, block))
}

/// Parses a `<directory>` or `<file>` subtree, inserting the result into
/// `tree` under `parent_uid` (root is special-cased by the caller).
fn parse_dentry(
    cursor: &mut EventCursor,
    tree: &Tree,
    parent_uid: Option<u64>,
    is_root: bool,
    tag: &[u8],
) -> Result<u64> {
    let kind = if tag == b"directory" { DentryType::Directory } else { DentryType::File };
    let mut name = String::new();
    let mut length = 0u64;
    let mut readonly = false;
    let mut times = Times::now();
    let mut uid = 0u64;
    let mut xattrs = Vec::new();
    let mut extents = Vec::new();
    let mut symlink_target: Option<String> = None;
    let mut children: Vec<u64> = Vec::new();
    let mut unknown_tags = Vec::new();

    loop {
        let start_pos = cursor.pos();
        match cursor.next()? {
            Event::Start(e) if e.name().as_ref() == b"name" => name = cursor.read_text_until_end(b"name")?,
            Event::Start(e) if e.name().as_ref() == b"length" => {
                length = cursor.read_text_until_end(b"length")?.trim().parse().unwrap_or(0)
            }
            Event::Start(e) if e.name().as_ref() == b"readonly" => {
                readonly = cursor.read_text_until_end(b"readonly")?.trim() == "true"
            }
            Event::Start(e) if e.name().as_ref() == b"creationtime" => times.creation = parse_ltfs_time(&cursor.read_text_until_end(b"creationtime")?)?,
            Event::Start(e) if e.name().as_ref() == b"changetime" => times.change = parse_ltfs_time(&cursor.read_text_until_end(b"changetime")?)?,
            Event::Start(e) if e.name().as_ref() == b"modifytime" => times.modify = parse_ltfs_time(&cursor.read_text_until_end(b"modifytime")?)?,
            Event::Start(e) if e.name().as_ref() == b"accesstime" => times.access = parse_ltfs_time(&cursor.read_text_until_end(b"accesstime")?)?,
            Event::Start(e) if e.name().as_ref() == b"backuptime" => times.backup = parse_ltfs_time(&cursor.read_text_until_end(b"backuptime")?)?,
            Event::Start(e) if e.name().as_ref() == b"fileuid" => {
                uid = cursor.read_text_until_end(b"fileuid")?.trim().parse().map_err(|_| Error::BadIndex)?
            }
            Event::Start(e) if e.name().as_ref() == b"extendedattributes" => xattrs = parse_xattrs(cursor)?,
            Event::Start(e) if e.name().as_ref() == b"symlink" => symlink_target = Some(cursor.read_text_until_end(b"symlink")?),
            Event::Start(e) if e.name().as_ref() == b"extentinfo" => {
                loop {
                    match cursor.next()? {
                        Event::Start(ex) if ex.name().as_ref() == b"extent" => {
                            let mut fo = 0u64;
                            let mut part = PartitionId::B;
                            let mut sb = 0u64;
                            let mut bo = 0u32;
                            let mut bc = 0u64;
                            loop {
                                match cursor.next()? {
                                    Event::Start(e) if e.name().as_ref() == b"fileoffset" => fo = cursor.read_text_until_end(b"fileoffset")?.trim().parse().unwrap_or(0),
                                    Event::Start(e) if e.name().as_ref() == b"partition" => {
                                        part = match cursor.read_text_until_end(b"partition")?.trim() {
                                            "a" | "A" => PartitionId::A,
                                            _ => PartitionId::B,
                                        }
                                    }
                                    Event::Start(e) if e.name().as_ref() == b"startblock" => sb = cursor.read_text_until_end(b"startblock")?.trim().parse().unwrap_or(0),
                                    Event::Start(e) if e.name().as_ref() == b"byteoffset" => bo = cursor.read_text_until_end(b"byteoffset")?.trim().parse().unwrap_or(0),
                                    Event::Start(e) if e.name().as_ref() == b"bytecount" => bc = cursor.read_text_until_end(b"bytecount")?.trim().parse().unwrap_or(0),
                                    Event::End(e) if e.name().as_ref() == b"extent" => break,
                                    Event::Eof => return Err(Error::BadIndex),
                                    _ => {}
                                }
                            }
                            extents.push(Extent {
                                start: TapePosition::new(part, sb),
                                byte_offset: bo,
                                byte_count: bc,
                                file_offset: fo,
                            });
                        }
                        Event::End(e) if e.name().as_ref() == b"extentinfo" => break,
                        Event::Eof => return Err(Error::BadIndex),
                        _ => {}
                    }
                }
            }
            Event::Start(e) if e.name().as_ref() == b"contents" => {
                // By schema order `<fileuid>` always precedes `<contents>`,
                // so the owning node's own UID is already known here: for
                // the root it's `ROOT_UID`, otherwise materialize it now so
                // children can be parented to it (not to our own parent).
                let own_uid = if is_root {
                    crate::tree::ROOT_UID
                } else {
                    let parent = parent_uid.ok_or(Error::BadIndex)?;
                    let dentry = tree.create_child_with_uid(parent, uid, &name, kind)?;
                    let mut meta = dentry.meta.lock().unwrap();
                    meta.readonly = readonly;
                    meta.times = times;
                    meta.xattrs = xattrs.clone();
                    dentry.uid
                };
                loop {
                    let child_start = cursor.pos();
                    match cursor.next()? {
                        Event::Start(e) if e.name().as_ref() == b"directory" => {
                            let _ = child_start;
                            children.push(parse_dentry(cursor, tree, Some(own_uid), false, b"directory")?);
                        }
                        Event::Start(e) if e.name().as_ref() == b"file" => {
                            children.push(parse_dentry(cursor, tree, Some(own_uid), false, b"file")?);
                        }
                        Event::End(e) if e.name().as_ref() == b"contents" => break,
                        Event::Eof => return Err(Error::BadIndex),
                        _ => {}
                    }
                }
                uid = own_uid;
            }
            Event::End(e) if e.name().as_ref() == tag => break,
            Event::Eof => return Err(Error::BadIndex),
            Event::Start(e) => {
                let owned_name = e.name().as_ref().to_vec();
                unknown_tags.push(cursor.skip_capturing(&owned_name, start_pos)?);
            }
            Event::Empty(_) => {}
            _ => {}
        }
    }

    // Directories materialize themselves (and their children) as soon as
    // `<contents>` is seen, since that's the first point their own UID is
    // known; `children` is already attached to the tree by then. Files
    // have no `<contents>` element, so they're materialized here instead.
    let _ = children;

    if is_root {
        let root = tree.root();
        let mut meta = root.meta.lock().unwrap();
        meta.name = name.clone();
        meta.volume_name = Some(name);
        meta.readonly = readonly;
        meta.times = times;
        meta.xattrs = xattrs;
        meta.unknown_tags = unknown_tags;
        drop(meta);
        Ok(root.uid)
    } else if kind == DentryType::Directory {
        // Already created inside the `<contents>` arm above; just attach
        // whatever was parsed after it (unknown tags trailing `</contents>`).
        let dentry = tree.get(uid).ok_or(Error::BadIndex)?;
        let mut meta = dentry.meta.lock().unwrap();
        meta.unknown_tags.extend(unknown_tags);
        Ok(dentry.uid)
    } else {
        let parent_uid = parent_uid.ok_or(Error::BadIndex)?;
        let dentry = if symlink_target.is_some() {
            tree.create_child_with_uid(parent_uid, uid, &name, DentryType::Symlink)?
        } else {
            tree.create_child_with_uid(parent_uid, uid, &name, kind)?
        };
        {
            let mut meta = dentry.meta.lock().unwrap();
            meta.readonly = readonly;
            meta.times = times;
            meta.xattrs = xattrs;
            meta.unknown_tags = unknown_tags;
            meta.size = length;
            meta.realsize = extents.iter().map(|e| e.end_offset()).max().unwrap_or(0).max(length.min(length));
            meta.symlink_target = symlink_target;
        }
        {
            let mut contents = dentry.contents.write().unwrap();
            contents.extents = extents;
        }
        Ok(dentry.uid)
    }
}

/// Parses a full `<ltfsindex>` document into a fresh [`Tree`] plus its
/// [`IndexMeta`]. Returns whether any parsed timestamp needed clamping.
pub fn parse_index(xml: &[u8]) -> Result<(IndexMeta, Tree, bool)> {
    let mut cursor = EventCursor::new(xml);
    let tree = Tree::new_empty(String::new());

    let mut creator = String::new();
    let mut comment = None;
    let mut volume_uuid = Uuid::nil();
    let mut generation_number = 0u64;
    let mut update_time = Utc::now();
    let mut location = TapePosition::zero(PartitionId::A);
    let mut previous_generation_location = None;
    let mut allow_policy_update = true;
    let mut index_partition_criteria = None;
    let mut highest_file_uid = 1u64;
    let mut unknown_tags = Vec::new();
    let mut clamped = false;

    loop {
        let start_pos = cursor.pos();
        match cursor.next()? {
            Event::Start(e) if e.name().as_ref() == b"ltfsindex" => {}
            Event::Start(e) if e.name().as_ref() == b"creator" => creator = cursor.read_text_until_end(b"creator")?,
            Event::Start(e) if e.name().as_ref() == b"comment" => comment = Some(cursor.read_text_until_end(b"comment")?),
            Event::Start(e) if e.name().as_ref() == b"volumeuuid" => {
                let text = cursor.read_text_until_end(b"volumeuuid")?;
                volume_uuid = Uuid::parse_str(text.trim()).map_err(|_| Error::BadIndex)?;
            }
            Event::Start(e) if e.name().as_ref() == b"generationnumber" => {
                generation_number = cursor.read_text_until_end(b"generationnumber")?.trim().parse().map_err(|_| Error::BadIndex)?
            }
            Event::Start(e) if e.name().as_ref() == b"updatetime" => {
                let text = cursor.read_text_until_end(b"updatetime")?;
                update_time = parse_ltfs_time(&text)?;
                let (_, c) = clamp_time(update_time);
                clamped = clamped || c;
            }
            Event::Start(e) if e.name().as_ref() == b"location" => location = parse_location(&mut cursor, b"location")?,
            Event::Start(e) if e.name().as_ref() == b"previousgenerationlocation" => {
                previous_generation_location = Some(parse_location(&mut cursor, b"previousgenerationlocation")?)
            }
            Event::Start(e) if e.name().as_ref() == b"allowpolicyupdate" => {
                allow_policy_update = cursor.read_text_until_end(b"allowpolicyupdate")?.trim() == "true"
            }
            Event::Start(e) if e.name().as_ref() == b"dataplacementpolicy" => {
                let mut max_filesize = 0u64;
                let mut names = Vec::new();
                loop {
                    match cursor.next()? {
                        Event::Start(e) if e.name().as_ref() == b"indexpartitioncriteria" => {}
                        Event::Start(e) if e.name().as_ref() == b"size" => {
                            max_filesize = cursor.read_text_until_end(b"size")?.trim().parse().unwrap_or(0)
                        }
                        Event::Start(e) if e.name().as_ref() == b"name" => names.push(cursor.read_text_until_end(b"name")?),
                        Event::End(e) if e.name().as_ref() == b"dataplacementpolicy" => break,
                        Event::Eof => return Err(Error::BadIndex),
                        _ => {}
                    }
                }
                index_partition_criteria = Some(IndexPartitionCriteriaXml { max_filesize, names });
            }
            Event::Start(e) if e.name().as_ref() == b"highestfileuid" => {
                highest_file_uid = cursor.read_text_until_end(b"highestfileuid")?.trim().parse().map_err(|_| Error::BadIndex)?
            }
            Event::Start(e) if e.name().as_ref() == b"directory" => {
                parse_dentry(&mut cursor, &tree, None, true, b"directory")?;
            }
            Event::End(e) if e.name().as_ref() == b"ltfsindex" => break,
            Event::Eof => break,
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                unknown_tags.push(cursor.skip_capturing(&name, start_pos)?);
            }
            _ => {}
        }
    }

    tree.set_next_uid(highest_file_uid);

    let meta = IndexMeta {
        creator,
        comment,
        volume_uuid,
        generation_number,
        update_time,
        location,
        previous_generation_location,
        allow_policy_update,
        index_partition_criteria,
        highest_file_uid,
        unknown_tags,
    };
    Ok((meta, tree, clamped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_round_trips_through_format_and_parse() {
        let t = Utc.with_ymd_and_hms(2024, 3, 5, 12, 30, 0).unwrap();
        let formatted = format_ltfs_time(t);
        let parsed = parse_ltfs_time(&formatted).unwrap();
        assert_eq!(parsed.timestamp(), t.timestamp());
    }

    #[test]
    fn year_over_9999_is_clamped() {
        let t = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap() + chrono::Duration::days(400);
        let (clamped, was_clamped) = clamp_time(t);
        assert!(was_clamped);
        assert_eq!(clamped.format("%Y").to_string(), "9999");
    }

    #[test]
    fn empty_index_parses_back_with_empty_root() {
        let uuid = Uuid::new_v4();
        let xml = empty_index_xml(uuid, 1);
        let (meta, tree, clamped) = parse_index(xml.as_bytes()).unwrap();
        assert!(!clamped);
        assert_eq!(meta.volume_uuid, uuid);
        assert_eq!(meta.generation_number, 1);
        let root = tree.root();
        assert!(root.contents.read().unwrap().children.is_empty());
    }

    #[test]
    fn file_with_extent_round_trips() {
        let uuid = Uuid::new_v4();
        let tree = Tree::new_empty(String::new());
        let file = tree.create_child(crate::tree::ROOT_UID, "hello.txt", DentryType::File).unwrap();
        {
            let mut meta = file.meta.lock().unwrap();
            meta.size = 6;
            meta.realsize = 6;
        }
        {
            let mut contents = file.contents.write().unwrap();
            contents.extents.push(Extent {
                start: TapePosition::new(PartitionId::B, 10),
                byte_offset: 0,
                byte_count: 6,
                file_offset: 0,
            });
        }
        let meta = IndexMeta {
            creator: "rust-ltfs".to_string(),
            comment: None,
            volume_uuid: uuid,
            generation_number: 2,
            update_time: Utc::now(),
            location: TapePosition::zero(PartitionId::A),
            previous_generation_location: None,
            allow_policy_update: true,
            index_partition_criteria: None,
            highest_file_uid: tree.highest_uid(),
            unknown_tags: Vec::new(),
        };
        let (xml, clamped) = serialize_index(&meta, &tree).unwrap();
        assert!(!clamped);
        let (parsed_meta, parsed_tree, _) = parse_index(xml.as_bytes()).unwrap();
        assert_eq!(parsed_meta.generation_number, 2);
        let root = parsed_tree.root();
        let child_uid = *root.contents.read().unwrap().children.get("hello.txt").unwrap();
        let child = parsed_tree.get(child_uid).unwrap();
        assert_eq!(child.meta.lock().unwrap().size, 6);
        let extents = child.contents.read().unwrap().extents.clone();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].byte_count, 6);
    }
}
