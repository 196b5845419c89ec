//! Hierarchical MF/DF/EF filesystem over a linear append region.
//!
//! Every file is one contiguous run in the data store:
//!
//! ```text
//! | entry (15 bytes) | name (name_size bytes, DFs only) | payload (size) |
//! ```
//!
//! Records are appended in creation order and never fragmented. The first
//! record whose id reads 0xFFFF — which is what erased flash looks like —
//! is the end-of-filesystem sentinel. Deletion flips the `active` bit
//! (tombstoning); tombstoned records still occupy their bytes and are
//! skipped by every search, and a trailing all-tombstone run is reclaimed
//! by refilling it with 0xFF, which moves the sentinel back.
//!
//! The parametric search of the original design is expressed as the
//! [`Query`] sum type: one traversal loop, one small matcher per variant.

pub mod keyfile;

use thiserror::Error;

use crate::status::StatusWord;
use crate::store::{MemoryDevice, StoreError};
use crate::tlv::{be_uint, push_tlv, TlvError, TlvReader};

/// Size of an encoded filesystem record.
pub const ENTRY_LEN: usize = 15;

/// Reserved id of the master file.
pub const MF_ID: u16 = 0x3F00;

/// Id of the MyEID-compatible application DF created at personalization.
pub const APP_DF_ID: u16 = 0x5015;

/// File descriptor byte for DFs (bit 6 marks shareable and is ignored).
pub const KIND_DF: u8 = 0x38;
/// Transparent working EF.
pub const KIND_TRANSPARENT: u8 = 0x01;
/// RSA key EF.
pub const KIND_RSA: u8 = 0x11;
/// EC key EF on the NIST curves.
pub const KIND_EC_NIST: u8 = 0x22;
/// EC key EF on secp256k1.
pub const KIND_EC_K1: u8 = 0x23;
/// DES key EF.
pub const KIND_DES: u8 = 0x19;
/// AES key EF.
pub const KIND_AES: u8 = 0x29;

/// Maximum payload size of a single file.
pub const MAX_FILE_SIZE: u16 = 32767;

/// Filesystem failure, mapped onto a status word at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// No matching file.
    #[error("file not found")]
    NotFound,
    /// Id or name collision on creation.
    #[error("file already exists")]
    Exists,
    /// Malformed FCP or key TLV content.
    #[error("invalid data")]
    InvalidData,
    /// The store ended before the sentinel — corrupted filesystem.
    #[error("filesystem corrupted")]
    Corrupt,
    /// Underlying device failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The append region cannot hold the new file.
    #[error("no space for file")]
    NoSpace,
    /// Offset or length outside the file body.
    #[error("outside the EF")]
    OutsideFile,
    /// Read with a definite Le past the end of file.
    #[error("end of file before Le")]
    EofBeforeLe,
    /// The operation needs a transparent EF.
    #[error("not a transparent EF")]
    NotTransparent,
    /// No current EF is selected.
    #[error("no current EF")]
    NoCurrentEf,
}

impl From<FsError> for StatusWord {
    fn from(e: FsError) -> StatusWord {
        match e {
            FsError::NotFound => StatusWord::FILE_NOT_FOUND,
            FsError::Exists => StatusWord::ALREADY_EXISTS,
            FsError::InvalidData => StatusWord::INVALID_DATA,
            FsError::Corrupt | FsError::Store(_) => StatusWord::MEMORY_FAILURE,
            FsError::NoSpace | FsError::NotTransparent => StatusWord::CONDITIONS_NOT_SATISFIED,
            FsError::OutsideFile => StatusWord::OUTSIDE_EF,
            FsError::EofBeforeLe => StatusWord::EOF_BEFORE_LE,
            FsError::NoCurrentEf => StatusWord::NOT_ALLOWED,
        }
    }
}

impl From<TlvError> for FsError {
    fn from(_: TlvError) -> FsError {
        FsError::InvalidData
    }
}

/// One decoded filesystem record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsEntry {
    /// File id (tag 0x83).
    pub id: u16,
    /// Payload size in bytes (tags 0x80/0x81).
    pub size: u16,
    /// Card-unique handle, allocated monotonically.
    pub uuid: u16,
    /// Uuid of the enclosing DF (0 for the MF itself).
    pub parent_uuid: u16,
    /// File descriptor byte (tag 0x82).
    pub kind: u8,
    /// Access conditions (tag 0x86).
    pub acl: [u8; 3],
    /// Proprietary flags (tag 0x85).
    pub prop: u16,
    /// DF name length (0..=16).
    pub name_size: u8,
    /// Size came from tag 0x81 (structural) rather than 0x80.
    pub tag_81: bool,
    /// DF marker: the record carries no payload region.
    pub no_allocate: bool,
    /// Cleared when the file is tombstoned.
    pub active: bool,
}

impl FsEntry {
    /// True for DFs; the shareable bit does not participate.
    pub fn is_df(&self) -> bool {
        self.kind & 0xBF == KIND_DF
    }

    /// Decodes a 15-byte record.
    pub fn decode(raw: &[u8; ENTRY_LEN]) -> FsEntry {
        let flags = raw[14];
        FsEntry {
            id: u16::from_le_bytes([raw[0], raw[1]]),
            size: u16::from_le_bytes([raw[2], raw[3]]),
            uuid: u16::from_le_bytes([raw[4], raw[5]]),
            parent_uuid: u16::from_le_bytes([raw[6], raw[7]]),
            kind: raw[8],
            acl: [raw[9], raw[10], raw[11]],
            prop: u16::from_le_bytes([raw[12], raw[13]]),
            name_size: flags & 0x1F,
            tag_81: flags & 0x20 != 0,
            no_allocate: flags & 0x40 != 0,
            active: flags & 0x80 != 0,
        }
    }

    /// Encodes to the 15-byte on-store form.
    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut raw = [0u8; ENTRY_LEN];
        raw[0..2].copy_from_slice(&self.id.to_le_bytes());
        raw[2..4].copy_from_slice(&self.size.to_le_bytes());
        raw[4..6].copy_from_slice(&self.uuid.to_le_bytes());
        raw[6..8].copy_from_slice(&self.parent_uuid.to_le_bytes());
        raw[8] = self.kind;
        raw[9..12].copy_from_slice(&self.acl);
        raw[12..14].copy_from_slice(&self.prop.to_le_bytes());
        raw[14] = (self.name_size & 0x1F)
            | if self.tag_81 { 0x20 } else { 0 }
            | if self.no_allocate { 0x40 } else { 0 }
            | if self.active { 0x80 } else { 0 };
        raw
    }

    /// Bytes this record occupies in the store, header included.
    pub fn extent(&self) -> usize {
        ENTRY_LEN
            + usize::from(self.name_size)
            + if self.no_allocate {
                0
            } else {
                usize::from(self.size)
            }
    }
}

/// A record located in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// The decoded record.
    pub entry: FsEntry,
    /// Offset of the record header in the data store.
    pub offset: usize,
}

impl Located {
    /// Offset of the first payload byte.
    pub fn body_offset(&self) -> usize {
        self.offset + ENTRY_LEN + usize::from(self.entry.name_size)
    }
}

/// Child kind filter for id searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Only DFs.
    Df,
    /// Only EFs.
    Ef,
    /// Either.
    Any,
}

impl ChildKind {
    fn matches(self, entry: &FsEntry) -> bool {
        match self {
            ChildKind::Df => entry.is_df(),
            ChildKind::Ef => !entry.is_df(),
            ChildKind::Any => true,
        }
    }
}

/// The parametric search selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query<'a> {
    /// Child of `dir` with a given id.
    ById {
        /// Uuid of the directory searched.
        dir: u16,
        /// File id to match.
        id: u16,
        /// DF/EF filter.
        kind: ChildKind,
    },
    /// Global uuid lookup.
    ByUuid(u16),
    /// Global DF-name lookup (names are unique).
    ByName(&'a [u8]),
    /// Iterated child descent from `start` along 2-byte ids.
    ByPath {
        /// Uuid of the DF the path is relative to.
        start: u16,
        /// Concatenated big-endian file ids.
        path: &'a [u8],
    },
    /// The record whose uuid is the given parent uuid.
    Parent(u16),
    /// First child of `dir` of the given kind (subtree deletion helper).
    FirstChild {
        /// Uuid of the directory searched.
        dir: u16,
        /// DF/EF filter.
        kind: ChildKind,
    },
    /// ISO 7816-4/7.1.1 three-tier search: immediate children of the
    /// current DF, then the parent DF itself, then the parent's children.
    /// The best (lowest) tier wins on collision.
    S0 {
        /// Uuid of the current DF.
        dir: u16,
        /// Uuid of the current DF's parent.
        parent: u16,
        /// File id to match.
        id: u16,
    },
}

/// Iterator over the records of the append region, tombstones included.
///
/// Terminates at the 0xFFFF sentinel; running off the device yields
/// [`FsError::Corrupt`].
struct Records<'a> {
    dev: &'a dyn MemoryDevice,
    offset: usize,
    done: bool,
    sentinel: Option<usize>,
}

impl<'a> Records<'a> {
    fn new(dev: &'a dyn MemoryDevice) -> Records<'a> {
        Records {
            dev,
            offset: 0,
            done: false,
            sentinel: None,
        }
    }

    /// Offset of the sentinel once iteration finished cleanly.
    fn sentinel(&self) -> Option<usize> {
        self.sentinel
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Located, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut raw = [0u8; ENTRY_LEN];
        if self.dev.read(self.offset, &mut raw).is_err() {
            self.done = true;
            return Some(Err(FsError::Corrupt));
        }
        let entry = FsEntry::decode(&raw);
        if entry.id == 0xFFFF && entry.active {
            self.done = true;
            self.sentinel = Some(self.offset);
            return None;
        }
        let located = Located {
            entry,
            offset: self.offset,
        };
        self.offset += entry.extent();
        Some(Ok(located))
    }
}

/// Runs a [`Query`] against the store.
pub fn search(dev: &dyn MemoryDevice, query: Query<'_>) -> Result<Located, FsError> {
    if let Query::ByPath { start, path } = query {
        return search_path(dev, start, path);
    }
    let mut records = Records::new(dev);
    // best S0 candidate and its tier (lower wins)
    let mut candidate: Option<(u8, Located)> = None;
    for rec in records.by_ref() {
        let rec = rec?;
        if !rec.entry.active {
            continue;
        }
        let e = &rec.entry;
        match query {
            Query::ById { dir, id, kind } => {
                if e.parent_uuid == dir && e.id == id && kind.matches(e) {
                    return Ok(rec);
                }
            }
            Query::ByUuid(uuid) => {
                if e.uuid == uuid {
                    return Ok(rec);
                }
            }
            Query::ByName(name) => {
                if usize::from(e.name_size) == name.len() && !name.is_empty() && name.len() <= 16 {
                    let mut stored = [0u8; 16];
                    let stored = &mut stored[..name.len()];
                    dev.read(rec.offset + ENTRY_LEN, stored)?;
                    if stored == name {
                        return Ok(rec);
                    }
                }
            }
            Query::Parent(parent_uuid) => {
                if e.uuid == parent_uuid {
                    return Ok(rec);
                }
            }
            Query::FirstChild { dir, kind } => {
                if e.parent_uuid == dir && kind.matches(e) {
                    return Ok(rec);
                }
            }
            Query::S0 { dir, parent, id } => {
                if e.id == id {
                    if e.parent_uuid == dir {
                        return Ok(rec);
                    }
                    let tier = if e.uuid == parent {
                        2
                    } else if e.parent_uuid == parent {
                        3
                    } else {
                        0
                    };
                    if tier != 0 && candidate.map_or(true, |(t, _)| tier < t) {
                        candidate = Some((tier, rec));
                    }
                }
            }
            Query::ByPath { .. } => unreachable!("handled above"),
        }
    }
    if let Some((_, hit)) = candidate {
        return Ok(hit);
    }
    Err(FsError::NotFound)
}

fn search_path(dev: &dyn MemoryDevice, start: u16, path: &[u8]) -> Result<Located, FsError> {
    if path.is_empty() || path.len() % 2 != 0 {
        return Err(FsError::InvalidData);
    }
    let mut dir = start;
    let mut hit = None;
    for chunk in path.chunks_exact(2) {
        let id = u16::from(chunk[0]) << 8 | u16::from(chunk[1]);
        let next = search(
            dev,
            Query::ById {
                dir,
                id,
                kind: ChildKind::Any,
            },
        )?;
        dir = next.entry.uuid;
        hit = Some(next);
    }
    hit.ok_or(FsError::NotFound)
}

/// Uuid allocation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Next free uuid (max over every record seen, plus one).
    pub uuid: u16,
    /// Offset of the end-of-filesystem sentinel (the append point).
    pub append_at: usize,
}

/// Scans for the highest uuid and checks `id` against the active children
/// of `dir` (creation pre-flight).
pub fn allocate_uuid(dev: &dyn MemoryDevice, dir: u16, id: u16) -> Result<Allocation, FsError> {
    let mut records = Records::new(dev);
    let mut max_uuid = 0u16;
    while let Some(rec) = records.next() {
        let rec = rec?;
        // tombstoned records keep their uuid reserved
        max_uuid = max_uuid.max(rec.entry.uuid);
        if rec.entry.active && rec.entry.parent_uuid == dir && rec.entry.id == id {
            return Err(FsError::Exists);
        }
    }
    let append_at = records.sentinel().ok_or(FsError::Corrupt)?;
    Ok(Allocation {
        uuid: max_uuid + 1,
        append_at,
    })
}

/// Active children of `dir` whose kind matches `(kind ^ value) & mask == 0`,
/// excluding the MF, capped at 127 ids.
pub fn list_ids(
    dev: &dyn MemoryDevice,
    dir: u16,
    value: u8,
    mask: u8,
) -> Result<Vec<u16>, FsError> {
    let mut out = Vec::new();
    for rec in Records::new(dev) {
        let rec = rec?;
        let e = rec.entry;
        if e.active
            && e.parent_uuid == dir
            && e.id != MF_ID
            && (e.kind ^ value) & mask == 0
            && out.len() < 127
        {
            out.push(e.id);
        }
    }
    Ok(out)
}

/// Finds the trailing tombstone run, if the region directly before the
/// sentinel is entirely tombstoned. Returns `(run_start, sentinel_offset)`.
pub fn free_tail(dev: &dyn MemoryDevice) -> Result<Option<(usize, usize)>, FsError> {
    let mut records = Records::new(dev);
    let mut run_start: Option<usize> = None;
    while let Some(rec) = records.next() {
        let rec = rec?;
        if rec.entry.active {
            run_start = None;
        } else if run_start.is_none() {
            run_start = Some(rec.offset);
        }
    }
    let sentinel = records.sentinel().ok_or(FsError::Corrupt)?;
    Ok(run_start.map(|s| (s, sentinel)))
}

/// 0xFF-fills `[start, end)` in device-block sized steps.
pub fn fill_ff(dev: &mut dyn MemoryDevice, start: usize, end: usize) -> Result<(), FsError> {
    let mut offset = start;
    while offset < end {
        let chunk = (end - offset).min(256);
        dev.fill_ff(offset, chunk)?;
        offset += chunk;
    }
    Ok(())
}

/// Rewrites the record header of `hit` (prop/flag updates, tombstoning).
pub fn rewrite_entry(dev: &mut dyn MemoryDevice, hit: &Located) -> Result<(), FsError> {
    dev.write(hit.offset, &hit.entry.encode())?;
    Ok(())
}

/// A parsed FCP template ready for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    /// File id.
    pub id: u16,
    /// Payload size.
    pub size: u16,
    /// File descriptor byte.
    pub kind: u8,
    /// Access conditions (defaults to all-never when absent).
    pub acl: [u8; 3],
    /// Proprietary flags.
    pub prop: u16,
    /// DF name (empty for EFs).
    pub name: Vec<u8>,
    /// Size was given by tag 0x81.
    pub tag_81: bool,
}

/// Parses a CREATE FILE data field: `62 len || FCP data objects`.
pub fn parse_fcp(data: &[u8]) -> Result<NewFile, FsError> {
    if data.len() < 2 || data[0] != 0x62 {
        return Err(FsError::InvalidData);
    }
    if usize::from(data[1]) != data.len() - 2 {
        return Err(FsError::InvalidData);
    }
    let mut file = NewFile {
        id: 0,
        size: 0,
        kind: 0,
        acl: [0, 0, 0],
        prop: 0,
        name: Vec::new(),
        tag_81: false,
    };
    let mut have_size = false;
    let mut have_kind = false;
    let mut have_id = false;
    let mut reader = TlvReader::new(&data[2..]);
    while let Some(obj) = reader.next()? {
        if obj.value.is_empty() || obj.value.len() > 16 {
            return Err(FsError::InvalidData);
        }
        match obj.tag {
            0x80 | 0x81 => {
                if have_size {
                    return Err(FsError::InvalidData);
                }
                if obj.tag == 0x81 && obj.value.len() != 2 {
                    return Err(FsError::InvalidData);
                }
                if obj.value.len() > 2 {
                    return Err(FsError::InvalidData);
                }
                file.tag_81 = obj.tag == 0x81;
                file.size = be_uint(obj.value);
                if file.size > MAX_FILE_SIZE {
                    return Err(FsError::InvalidData);
                }
                have_size = true;
            }
            0x82 => {
                if obj.value.len() > 6 {
                    return Err(FsError::InvalidData);
                }
                file.kind = obj.value[0];
                if !matches!(
                    file.kind & 0xBF,
                    KIND_TRANSPARENT | KIND_DF | KIND_RSA | KIND_EC_NIST | KIND_EC_K1 | KIND_DES
                        | KIND_AES
                ) {
                    return Err(FsError::InvalidData);
                }
                have_kind = true;
            }
            0x83 => {
                if obj.value.len() != 2 {
                    return Err(FsError::InvalidData);
                }
                file.id = be_uint(obj.value);
                // reserved ids: never creatable
                if matches!(file.id, 0x0000 | 0x3F00 | 0x3FFF | 0xFFFF) {
                    return Err(FsError::InvalidData);
                }
                have_id = true;
            }
            0x84 => {
                file.name = obj.value.to_vec();
            }
            0x85 => {
                if obj.value.len() != 2 {
                    return Err(FsError::InvalidData);
                }
                file.prop = be_uint(obj.value);
            }
            0x86 => {
                if obj.value.len() != 3 {
                    return Err(FsError::InvalidData);
                }
                file.acl = [obj.value[0], obj.value[1], obj.value[2]];
            }
            // lifecycle byte: accepted, superseded by the card lifecycle
            0x8A => {
                if obj.value.len() != 1 {
                    return Err(FsError::InvalidData);
                }
            }
            _ => return Err(FsError::InvalidData),
        }
    }
    if !(have_size && have_kind && have_id) {
        return Err(FsError::InvalidData);
    }
    if file.kind & 0xBF == KIND_DF {
        if !file.tag_81 {
            return Err(FsError::InvalidData);
        }
    } else {
        if !file.name.is_empty() {
            return Err(FsError::InvalidData);
        }
        // a fresh key EF is never born valid
        if file.kind & 0xBF != KIND_TRANSPARENT {
            file.prop &= 0xF0FF;
        }
    }
    Ok(file)
}

/// Appends a new file under `parent` and returns its location.
///
/// The caller has already parsed the FCP, checked the creation ACLs and the
/// DF-name uniqueness.
pub fn create_file(
    dev: &mut dyn MemoryDevice,
    parent_uuid: u16,
    file: &NewFile,
) -> Result<Located, FsError> {
    let alloc = allocate_uuid(dev, parent_uuid, file.id)?;
    let is_df = file.kind & 0xBF == KIND_DF;
    let entry = FsEntry {
        id: file.id,
        size: file.size,
        uuid: alloc.uuid,
        parent_uuid,
        kind: file.kind,
        acl: file.acl,
        prop: file.prop,
        name_size: file.name.len() as u8,
        tag_81: file.tag_81,
        no_allocate: is_df,
        active: true,
    };
    // room for the full record plus the next sentinel header
    let total = entry.extent();
    if alloc
        .append_at
        .checked_add(total + ENTRY_LEN)
        .map_or(true, |end| end > dev.len())
    {
        return Err(FsError::NoSpace);
    }
    dev.write(alloc.append_at, &entry.encode())?;
    if !file.name.is_empty() {
        dev.write(alloc.append_at + ENTRY_LEN, &file.name)?;
    }
    // transparent EFs start zeroed; key EFs keep the erased 0xFF pattern,
    // which is the free-space marker of the key TLV layout
    if !is_df && entry.kind & 0xBF == KIND_TRANSPARENT {
        let body = alloc.append_at + ENTRY_LEN + file.name.len();
        let mut off = 0usize;
        let zeros = [0u8; 256];
        while off < usize::from(entry.size) {
            let chunk = (usize::from(entry.size) - off).min(256);
            dev.write(body + off, &zeros[..chunk])?;
            off += chunk;
        }
    }
    Ok(Located {
        entry,
        offset: alloc.append_at,
    })
}

fn tombstone(dev: &mut dyn MemoryDevice, hit: &Located) -> Result<(), FsError> {
    let mut entry = hit.entry;
    entry.active = false;
    dev.write(hit.offset, &entry.encode())?;
    Ok(())
}

/// Tombstones `start` and, for DFs, its entire subtree depth-first.
pub fn delete_subtree(dev: &mut dyn MemoryDevice, start: &Located) -> Result<(), FsError> {
    loop {
        // descend to the deepest first DF
        let mut node = *start;
        while let Ok(child) = search(
            dev,
            Query::FirstChild {
                dir: node.entry.uuid,
                kind: ChildKind::Df,
            },
        ) {
            node = child;
        }
        while let Ok(ef) = search(
            dev,
            Query::FirstChild {
                dir: node.entry.uuid,
                kind: ChildKind::Ef,
            },
        ) {
            tombstone(dev, &ef)?;
        }
        tombstone(dev, &node)?;
        if node.entry.uuid == start.entry.uuid {
            return Ok(());
        }
    }
}

/// Reclaims the all-tombstone tail region, if any.
pub fn reclaim_tail(dev: &mut dyn MemoryDevice) -> Result<(), FsError> {
    if let Some((start, end)) = free_tail(dev)? {
        fill_ff(dev, start, end)?;
    }
    Ok(())
}

/// Reads from a transparent EF with the ISO short-Le clamp: a request of
/// exactly 256 bytes reads up to end-of-file, any other definite length
/// past the end warns `6282`. An offset at or past end-of-file is outside
/// the EF altogether.
pub fn read_binary(
    dev: &dyn MemoryDevice,
    hit: &Located,
    offset: u16,
    ne: usize,
) -> Result<Vec<u8>, FsError> {
    if hit.entry.kind & 0xBF != KIND_TRANSPARENT {
        return Err(FsError::NotTransparent);
    }
    let size = usize::from(hit.entry.size);
    let offset = usize::from(offset);
    if offset >= size {
        return Err(FsError::OutsideFile);
    }
    let mut len = ne;
    if offset + len > size {
        if len == 256 {
            len = size - offset;
        } else {
            return Err(FsError::EofBeforeLe);
        }
    }
    let mut out = vec![0u8; len];
    let mut done = 0usize;
    while done < len {
        let chunk = (len - done).min(256);
        dev.read(hit.body_offset() + offset + done, &mut out[done..done + chunk])?;
        done += chunk;
    }
    Ok(out)
}

/// Overwrites part of a transparent EF.
pub fn update_binary(
    dev: &mut dyn MemoryDevice,
    hit: &Located,
    offset: u16,
    data: &[u8],
) -> Result<(), FsError> {
    if hit.entry.kind & 0xBF != KIND_TRANSPARENT {
        return Err(FsError::NotTransparent);
    }
    let offset = usize::from(offset);
    if offset + data.len() > usize::from(hit.entry.size) {
        return Err(FsError::OutsideFile);
    }
    let mut done = 0usize;
    while done < data.len() {
        let chunk = (data.len() - done).min(256);
        dev.write(hit.body_offset() + offset + done, &data[done..done + chunk])?;
        done += chunk;
    }
    Ok(())
}

/// 0xFF-fills a transparent EF from `offset` to its end.
pub fn erase_binary(
    dev: &mut dyn MemoryDevice,
    hit: &Located,
    offset: u16,
) -> Result<(), FsError> {
    if hit.entry.kind & 0xBF != KIND_TRANSPARENT {
        return Err(FsError::NotTransparent);
    }
    let offset = usize::from(offset);
    let size = usize::from(hit.entry.size);
    if offset > size {
        return Err(FsError::OutsideFile);
    }
    fill_ff(
        dev,
        hit.body_offset() + offset,
        hit.body_offset() + size,
    )
}

/// Assembles the FCI template for a selected file.
pub fn build_fci(
    dev: &dyn MemoryDevice,
    hit: &Located,
    lifecycle: u8,
) -> Result<Vec<u8>, FsError> {
    let e = &hit.entry;
    let mut inner = Vec::with_capacity(32);
    push_tlv(
        &mut inner,
        if e.tag_81 { 0x81 } else { 0x80 },
        &e.size.to_be_bytes(),
    );
    push_tlv(&mut inner, 0x82, &[e.kind]);
    push_tlv(&mut inner, 0x83, &e.id.to_be_bytes());
    push_tlv(&mut inner, 0x86, &e.acl);
    push_tlv(&mut inner, 0x85, &e.prop.to_be_bytes());
    push_tlv(&mut inner, 0x8A, &[lifecycle]);
    if e.name_size > 0 {
        let mut name = [0u8; 16];
        let name = &mut name[..usize::from(e.name_size).min(16)];
        dev.read(hit.offset + ENTRY_LEN, name)?;
        push_tlv(&mut inner, 0x84, name);
    }
    let mut out = Vec::with_capacity(inner.len() + 2);
    push_tlv(&mut out, 0x6F, &inner);
    Ok(out)
}

/// Formats the data store: sentinel-only region plus a fresh MF, and — when
/// `app_df` is set — the MyEID-compatible application DF 5015.
///
/// `mf_acl`/`app_acl` override the default open access conditions.
pub fn mkfs(
    dev: &mut dyn MemoryDevice,
    mf_acl: Option<[u8; 3]>,
    app_df: bool,
    app_acl: Option<[u8; 3]>,
) -> Result<Located, FsError> {
    let dev_len = dev.len();
    fill_ff(dev, 0, dev_len)?;
    let mf = FsEntry {
        id: MF_ID,
        size: 0,
        uuid: 0,
        parent_uuid: 0,
        kind: KIND_DF,
        acl: mf_acl.unwrap_or([0x00, 0x00, 0x00]),
        prop: 0,
        name_size: 0,
        tag_81: true,
        no_allocate: true,
        active: true,
    };
    dev.write(0, &mf.encode())?;
    if app_df {
        let app = FsEntry {
            id: APP_DF_ID,
            size: 0,
            uuid: 1,
            parent_uuid: 0,
            kind: KIND_DF,
            acl: app_acl.unwrap_or([0x00, 0x00, 0x00]),
            prop: 0,
            name_size: 0,
            tag_81: true,
            no_allocate: true,
            active: true,
        };
        dev.write(ENTRY_LEN, &app.encode())?;
    }
    Ok(Located {
        entry: mf,
        offset: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BufferDevice;

    fn fresh() -> BufferDevice {
        let mut dev = BufferDevice::new(4096);
        mkfs(&mut dev, None, true, None).unwrap();
        dev
    }

    fn plain_file(id: u16, size: u16) -> NewFile {
        NewFile {
            id,
            size,
            kind: KIND_TRANSPARENT,
            acl: [0, 0, 0],
            prop: 0,
            name: Vec::new(),
            tag_81: false,
        }
    }

    #[test]
    fn entry_codec_round_trip() {
        let e = FsEntry {
            id: 0x5015,
            size: 300,
            uuid: 7,
            parent_uuid: 3,
            kind: KIND_RSA,
            acl: [0x12, 0x34, 0x56],
            prop: 0x0108,
            name_size: 5,
            tag_81: true,
            no_allocate: false,
            active: true,
        };
        assert_eq!(FsEntry::decode(&e.encode()), e);
        let erased = [0xFFu8; ENTRY_LEN];
        let s = FsEntry::decode(&erased);
        assert_eq!(s.id, 0xFFFF);
        assert!(s.active);
    }

    #[test]
    fn mkfs_creates_mf_and_app_df() {
        let dev = fresh();
        let mf = search(&dev, Query::ByUuid(0)).unwrap();
        assert_eq!(mf.entry.id, MF_ID);
        let app = search(
            &dev,
            Query::ById {
                dir: 0,
                id: APP_DF_ID,
                kind: ChildKind::Df,
            },
        )
        .unwrap();
        assert_eq!(app.entry.uuid, 1);
    }

    #[test]
    fn create_and_find_child() {
        let mut dev = fresh();
        let hit = create_file(&mut dev, 1, &plain_file(0x0001, 16)).unwrap();
        assert_eq!(hit.entry.uuid, 2);
        let found = search(
            &dev,
            Query::ById {
                dir: 1,
                id: 0x0001,
                kind: ChildKind::Ef,
            },
        )
        .unwrap();
        assert_eq!(found, hit);
        // duplicate id under the same DF is refused
        assert_eq!(
            create_file(&mut dev, 1, &plain_file(0x0001, 16)).unwrap_err(),
            FsError::Exists
        );
        // same id under another DF is fine
        create_file(&mut dev, 0, &plain_file(0x0001, 16)).unwrap();
    }

    #[test]
    fn binary_io_bounds() {
        let mut dev = fresh();
        let hit = create_file(&mut dev, 1, &plain_file(0x0020, 8)).unwrap();
        update_binary(&mut dev, &hit, 0, b"\xDE\xAD\xBE\xEF").unwrap();
        assert_eq!(read_binary(&dev, &hit, 0, 4).unwrap(), b"\xDE\xAD\xBE\xEF");
        // offset+len == size succeeds, one past fails
        update_binary(&mut dev, &hit, 4, b"\x01\x02\x03\x04").unwrap();
        assert_eq!(
            update_binary(&mut dev, &hit, 5, b"\x01\x02\x03\x04").unwrap_err(),
            FsError::OutsideFile
        );
        // Ne=256 clamps at EOF, definite smaller Le past EOF errors
        assert_eq!(read_binary(&dev, &hit, 0, 256).unwrap().len(), 8);
        assert_eq!(
            read_binary(&dev, &hit, 6, 4).unwrap_err(),
            FsError::EofBeforeLe
        );
        // an offset at end-of-file is outside the EF
        assert_eq!(
            read_binary(&dev, &hit, 8, 1).unwrap_err(),
            FsError::OutsideFile
        );
        erase_binary(&mut dev, &hit, 4).unwrap();
        assert_eq!(
            read_binary(&dev, &hit, 0, 256).unwrap(),
            b"\xDE\xAD\xBE\xEF\xFF\xFF\xFF\xFF"
        );
    }

    #[test]
    fn s0_prefers_children_then_parent_then_siblings() {
        let mut dev = fresh();
        // /MF/5015/DF(AA) with EF 0x0077 in 5015 and in AA
        let df = create_file(
            &mut dev,
            1,
            &NewFile {
                id: 0x00AA,
                size: 4,
                kind: KIND_DF,
                acl: [0, 0, 0],
                prop: 0,
                name: Vec::new(),
                tag_81: true,
            },
        )
        .unwrap();
        let in_5015 = create_file(&mut dev, 1, &plain_file(0x0077, 4)).unwrap();
        let in_aa = create_file(&mut dev, df.entry.uuid, &plain_file(0x0077, 4)).unwrap();

        // from AA: its own child wins
        let hit = search(
            &dev,
            Query::S0 {
                dir: df.entry.uuid,
                parent: 1,
                id: 0x0077,
            },
        )
        .unwrap();
        assert_eq!(hit, in_aa);
        // from AA: the parent DF itself is findable
        let hit = search(
            &dev,
            Query::S0 {
                dir: df.entry.uuid,
                parent: 1,
                id: APP_DF_ID,
            },
        )
        .unwrap();
        assert_eq!(hit.entry.uuid, 1);
        // from 5015 with no own child 0x77... its own child wins over AA's
        let hit = search(
            &dev,
            Query::S0 {
                dir: 1,
                parent: 0,
                id: 0x0077,
            },
        )
        .unwrap();
        assert_eq!(hit, in_5015);
    }

    #[test]
    fn delete_subtree_and_reclaim() {
        let mut dev = fresh();
        let df = create_file(
            &mut dev,
            1,
            &NewFile {
                id: 0x00AA,
                size: 4,
                kind: KIND_DF,
                acl: [0, 0, 0],
                prop: 0,
                name: Vec::new(),
                tag_81: true,
            },
        )
        .unwrap();
        create_file(&mut dev, df.entry.uuid, &plain_file(0x0001, 8)).unwrap();
        create_file(&mut dev, df.entry.uuid, &plain_file(0x0002, 8)).unwrap();
        let sentinel_before = {
            let mut r = Records::new(&dev);
            while r.next().is_some() {}
            r.sentinel().unwrap()
        };
        delete_subtree(&mut dev, &df).unwrap();
        assert!(search(&dev, Query::ByUuid(df.entry.uuid)).is_err());
        reclaim_tail(&mut dev).unwrap();
        let sentinel_after = {
            let mut r = Records::new(&dev);
            while r.next().is_some() {}
            r.sentinel().unwrap()
        };
        assert!(sentinel_after < sentinel_before);
        // the observable file set equals a fresh card again
        assert_eq!(sentinel_after, 2 * ENTRY_LEN);
    }

    #[test]
    fn name_lookup_and_path_descent() {
        let mut dev = fresh();
        let df = create_file(
            &mut dev,
            1,
            &NewFile {
                id: 0x00AA,
                size: 4,
                kind: KIND_DF,
                acl: [0, 0, 0],
                prop: 0,
                name: b"testdir".to_vec(),
                tag_81: true,
            },
        )
        .unwrap();
        let ef = create_file(&mut dev, df.entry.uuid, &plain_file(0x0077, 4)).unwrap();
        assert_eq!(search(&dev, Query::ByName(b"testdir")).unwrap(), df);
        assert!(search(&dev, Query::ByName(b"missing")).is_err());
        let hit = search(
            &dev,
            Query::ByPath {
                start: 0,
                path: &[0x50, 0x15, 0x00, 0xAA, 0x00, 0x77],
            },
        )
        .unwrap();
        assert_eq!(hit, ef);
        assert_eq!(
            search(
                &dev,
                Query::ByPath {
                    start: 0,
                    path: &[0x50]
                }
            )
            .unwrap_err(),
            FsError::InvalidData
        );
    }

    #[test]
    fn fcp_parser_enforces_the_rules() {
        let fcp = hex::decode("62108002001082010183025015860300ffff").unwrap();
        let f = parse_fcp(&fcp).unwrap();
        assert_eq!((f.id, f.size, f.kind), (0x5015, 16, KIND_TRANSPARENT));
        assert_eq!(f.acl, [0x00, 0xFF, 0xFF]);

        // missing mandatory 0x82
        assert!(parse_fcp(&hex::decode("62088002001083025015").unwrap()).is_err());
        // template length disagreeing with the body
        assert!(parse_fcp(&hex::decode("62098002001083025015").unwrap()).is_err());
        // reserved id
        assert!(
            parse_fcp(&hex::decode("62108002001082010183023f00860300ffff").unwrap()).is_err()
        );
        // DF requires tag 0x81
        assert!(
            parse_fcp(&hex::decode("62108002001082013883024444860300ffff").unwrap()).is_err()
        );
        // EF must not carry a name
        assert!(parse_fcp(
            &hex::decode("62148002001082010183024444860300ffff84024142").unwrap()
        )
        .is_err());
        // fresh key EF loses its valid-key prop bits
        let f = parse_fcp(
            &hex::decode("62148102004082011183024b01860300ffff85020f00").unwrap(),
        )
        .unwrap();
        assert_eq!(f.prop, 0x0000);
    }

    #[test]
    fn allocation_is_monotonic_across_deletes() {
        let mut dev = fresh();
        let a = create_file(&mut dev, 1, &plain_file(0x0001, 4)).unwrap();
        delete_subtree(&mut dev, &a).unwrap();
        // the tombstone still reserves uuid 2
        let b = create_file(&mut dev, 1, &plain_file(0x0002, 4)).unwrap();
        assert_eq!(b.entry.uuid, 3);
    }
}
