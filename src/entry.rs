//! Catalogue entry model.
//!
//! Every archived item is one record: an inode of some kind (plain file,
//! directory, symlink, device, pipe, socket, door), a hard-link reference
//! (`Mirage`) into a shared inode (`Etoile`), a deletion tombstone
//! (`Detruit`), a masked-out placeholder, or the end-of-directory sentinel.
//!
//! Records serialize with a one-byte ASCII tag. Inode tags encode both the
//! kind and the save status: each kind owns a base letter and the status is
//! an offset added to it. Non-inode records use fixed letters.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::compressor::CompressionAlgo;
use crate::crc::Crc;
use crate::ea::{EaSet, EaStatus};
use crate::error::{Error, Result};
use crate::fsa::{FsaSet, FsaStatus};
use crate::infinint;
use crate::layer::Layer;

/// Whether an inode's data is present in this archive.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SaveStatus {
    /// Data is stored in this archive.
    #[default]
    Saved,
    /// Unchanged since the archive of reference.
    NotSaved,
    /// Legacy: present only in the archive of reference.
    Fake,
    /// Metadata recorded, data deliberately absent.
    InodeOnly,
    /// Stored as a binary delta against the reference.
    Delta,
}

impl SaveStatus {
    fn offset(self) -> u8 {
        match self {
            Self::Saved => 0,
            Self::NotSaved => 1,
            Self::Fake => 2,
            Self::InodeOnly => 3,
            Self::Delta => 4,
        }
    }

    fn from_offset(offset: u8) -> Self {
        match offset {
            1 => Self::NotSaved,
            2 => Self::Fake,
            3 => Self::InodeOnly,
            4 => Self::Delta,
            _ => Self::Saved,
        }
    }
}

/// Inode kind base letters. Each kind owns five consecutive codes, one per
/// save status.
pub const BASE_FILE: u8 = b'A';
pub const BASE_DIR: u8 = b'F';
pub const BASE_SYMLINK: u8 = b'K';
pub const BASE_BLOCK: u8 = b'P';
pub const BASE_CHAR: u8 = b'U';
pub const BASE_PIPE: u8 = b'a';
pub const BASE_SOCKET: u8 = b'f';
pub const BASE_DOOR: u8 = b'k';

pub const TAG_EOD: u8 = b'z';
pub const TAG_DETRUIT: u8 = b'x';
pub const TAG_MIRAGE: u8 = b'w';
pub const TAG_ETOILE: u8 = b'u';
pub const TAG_IGNORED: u8 = b'y';
pub const TAG_IGNORED_DIR: u8 = b'v';

const INODE_BASES: [u8; 8] = [
    BASE_FILE,
    BASE_DIR,
    BASE_SYMLINK,
    BASE_BLOCK,
    BASE_CHAR,
    BASE_PIPE,
    BASE_SOCKET,
    BASE_DOOR,
];

/// Builds the tag byte of an inode record.
pub fn make_tag(base: u8, status: SaveStatus) -> u8 {
    base + status.offset()
}

/// What a tag byte announces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TagClass {
    Inode { base: u8, status: SaveStatus },
    Eod,
    Detruit,
    Mirage,
    Etoile,
    Ignored,
    IgnoredDir,
}

pub fn parse_tag(tag: u8) -> Result<TagClass> {
    match tag {
        TAG_EOD => return Ok(TagClass::Eod),
        TAG_DETRUIT => return Ok(TagClass::Detruit),
        TAG_MIRAGE => return Ok(TagClass::Mirage),
        TAG_ETOILE => return Ok(TagClass::Etoile),
        TAG_IGNORED => return Ok(TagClass::Ignored),
        TAG_IGNORED_DIR => return Ok(TagClass::IgnoredDir),
        _ => {}
    }
    for base in INODE_BASES {
        if (base..base + 5).contains(&tag) {
            return Ok(TagClass::Inode {
                base,
                status: SaveStatus::from_offset(tag - base),
            });
        }
    }
    Err(Error::Data(format!("unknown entry tag {:#x}", tag)))
}

/// Attributes common to every inode kind.
#[derive(Clone, Debug, Default)]
pub struct InodeAttr {
    pub uid: u64,
    pub gid: u64,
    /// Permission bits, 16 of them.
    pub perm: u16,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Filesystem device id; used for same-filesystem detection during a
    /// backup, never serialized.
    pub dev: u64,

    pub ea_status: EaStatus,
    /// EA bytes when loaded in memory (backup and restore paths).
    pub ea: Option<EaSet>,
    pub ea_offset: u64,
    pub ea_size: u64,
    pub ea_crc: Option<Crc>,

    pub fsa_status: FsaStatus,
    /// Mask of the FSA families carried, see [`crate::fsa::FsaFamily::bit`].
    pub fsa_families: u8,
    pub fsa: Option<FsaSet>,
    pub fsa_offset: u64,
    pub fsa_size: u64,
    pub fsa_crc: Option<Crc>,
}

fn dump_opt_crc(f: &mut dyn Layer, crc: &Option<Crc>) -> Result<()> {
    match crc {
        Some(crc) => {
            f.write_all(&[1])?;
            crc.dump(f)
        }
        None => f.write_all(&[0]),
    }
}

fn read_opt_crc(f: &mut dyn Layer) -> Result<Option<Crc>> {
    let mut flag = [0u8; 1];
    f.read_exact(&mut flag)?;
    match flag[0] {
        0 => Ok(None),
        1 => Ok(Some(Crc::read(f)?)),
        _ => Err(Error::Data("malformed checksum presence flag".into())),
    }
}

impl InodeAttr {
    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        infinint::dump_u64(f, self.uid)?;
        infinint::dump_u64(f, self.gid)?;
        infinint::dump_u64(f, self.perm as u64)?;
        infinint::dump_i64(f, self.atime)?;
        infinint::dump_i64(f, self.mtime)?;
        infinint::dump_i64(f, self.ctime)?;
        f.write_all(&[self.ea_status.code()])?;
        if self.ea_status == EaStatus::Full {
            infinint::dump_u64(f, self.ea_offset)?;
            infinint::dump_u64(f, self.ea_size)?;
            dump_opt_crc(f, &self.ea_crc)?;
        }
        f.write_all(&[self.fsa_status.code()])?;
        if self.fsa_status != FsaStatus::None {
            f.write_all(&[self.fsa_families])?;
        }
        if self.fsa_status == FsaStatus::Full {
            infinint::dump_u64(f, self.fsa_offset)?;
            infinint::dump_u64(f, self.fsa_size)?;
            dump_opt_crc(f, &self.fsa_crc)?;
        }
        Ok(())
    }

    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let mut attr = Self {
            uid: infinint::read_u64(f)?,
            gid: infinint::read_u64(f)?,
            perm: infinint::read_u64(f)? as u16,
            atime: infinint::read_i64(f)?,
            mtime: infinint::read_i64(f)?,
            ctime: infinint::read_i64(f)?,
            ..Default::default()
        };
        let mut code = [0u8; 1];
        f.read_exact(&mut code)?;
        attr.ea_status = EaStatus::from_code(code[0])?;
        if attr.ea_status == EaStatus::Full {
            attr.ea_offset = infinint::read_u64(f)?;
            attr.ea_size = infinint::read_u64(f)?;
            attr.ea_crc = read_opt_crc(f)?;
        }
        f.read_exact(&mut code)?;
        attr.fsa_status = FsaStatus::from_code(code[0])?;
        if attr.fsa_status != FsaStatus::None {
            f.read_exact(&mut code)?;
            attr.fsa_families = code[0];
        }
        if attr.fsa_status == FsaStatus::Full {
            attr.fsa_offset = infinint::read_u64(f)?;
            attr.fsa_size = infinint::read_u64(f)?;
            attr.fsa_crc = read_opt_crc(f)?;
        }
        Ok(attr)
    }
}

/// Data bookkeeping of a plain file.
#[derive(Clone, Debug, Default)]
pub struct FileData {
    /// Logical (decompressed) byte count.
    pub size: u64,
    /// Bytes occupied in the archive; 0 means stored uncompressed.
    pub storage_size: u64,
    /// Offset of the data in the archive stream.
    pub offset: u64,
    pub crc: Option<Crc>,
    pub compression: CompressionAlgo,
    /// The file changed while it was being read.
    pub dirty: bool,
    /// The data uses the hole/bytes tuple layout.
    pub sparse: bool,
    /// A delta signature is stored along the data.
    pub has_delta_sig: bool,
}

const FILE_FLAG_DIRTY: u8 = 0x01;
const FILE_FLAG_SPARSE: u8 = 0x02;
const FILE_FLAG_DELTA_SIG: u8 = 0x04;

impl FileData {
    fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        infinint::dump_u64(f, self.size)?;
        infinint::dump_u64(f, self.storage_size)?;
        infinint::dump_u64(f, self.offset)?;
        let mut flags = 0;
        if self.dirty {
            flags |= FILE_FLAG_DIRTY;
        }
        if self.sparse {
            flags |= FILE_FLAG_SPARSE;
        }
        if self.has_delta_sig {
            flags |= FILE_FLAG_DELTA_SIG;
        }
        f.write_all(&[self.compression.code(), flags])?;
        dump_opt_crc(f, &self.crc)
    }

    fn read(f: &mut dyn Layer) -> Result<Self> {
        let size = infinint::read_u64(f)?;
        let storage_size = infinint::read_u64(f)?;
        let offset = infinint::read_u64(f)?;
        let mut pair = [0u8; 2];
        f.read_exact(&mut pair)?;
        let compression = CompressionAlgo::from_code(pair[0])?;
        let flags = pair[1];
        let crc = read_opt_crc(f)?;
        Ok(Self {
            size,
            storage_size,
            offset,
            crc,
            compression,
            dirty: flags & FILE_FLAG_DIRTY != 0,
            sparse: flags & FILE_FLAG_SPARSE != 0,
            has_delta_sig: flags & FILE_FLAG_DELTA_SIG != 0,
        })
    }
}

/// Kind-specific part of an inode.
#[derive(Clone, Debug)]
pub enum InodePayload {
    File(FileData),
    Symlink { target: String },
    Block { major: u64, minor: u64 },
    Char { major: u64, minor: u64 },
    Pipe,
    Socket,
    Door,
}

impl InodePayload {
    pub fn base_tag(&self) -> u8 {
        match self {
            Self::File(_) => BASE_FILE,
            Self::Symlink { .. } => BASE_SYMLINK,
            Self::Block { .. } => BASE_BLOCK,
            Self::Char { .. } => BASE_CHAR,
            Self::Pipe => BASE_PIPE,
            Self::Socket => BASE_SOCKET,
            Self::Door => BASE_DOOR,
        }
    }
}

/// A non-directory inode.
#[derive(Clone, Debug)]
pub struct Inode {
    pub attr: InodeAttr,
    pub status: SaveStatus,
    pub payload: InodePayload,
}

impl Inode {
    pub fn base_tag(&self) -> u8 {
        self.payload.base_tag()
    }

    pub fn tag(&self) -> u8 {
        make_tag(self.base_tag(), self.status)
    }

    pub fn as_file(&self) -> Option<&FileData> {
        match &self.payload {
            InodePayload::File(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileData> {
        match &mut self.payload {
            InodePayload::File(data) => Some(data),
            _ => None,
        }
    }

    /// Dumps attributes and payload; the tag and name are the caller's
    /// business because inodes also appear nested in etoile records.
    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        self.attr.dump(f)?;
        match &self.payload {
            InodePayload::File(data) => data.dump(f),
            InodePayload::Symlink { target } => infinint::dump_string(f, target),
            InodePayload::Block { major, minor } | InodePayload::Char { major, minor } => {
                infinint::dump_u64(f, *major)?;
                infinint::dump_u64(f, *minor)
            }
            InodePayload::Pipe | InodePayload::Socket | InodePayload::Door => Ok(()),
        }
    }

    pub fn read(f: &mut dyn Layer, base: u8, status: SaveStatus) -> Result<Self> {
        let attr = InodeAttr::read(f)?;
        let payload = match base {
            BASE_FILE => InodePayload::File(FileData::read(f)?),
            BASE_SYMLINK => InodePayload::Symlink {
                target: infinint::read_string(f)?,
            },
            BASE_BLOCK => InodePayload::Block {
                major: infinint::read_u64(f)?,
                minor: infinint::read_u64(f)?,
            },
            BASE_CHAR => InodePayload::Char {
                major: infinint::read_u64(f)?,
                minor: infinint::read_u64(f)?,
            },
            BASE_PIPE => InodePayload::Pipe,
            BASE_SOCKET => InodePayload::Socket,
            BASE_DOOR => InodePayload::Door,
            _ => return Err(Error::bug()),
        };
        Ok(Self {
            attr,
            status,
            payload,
        })
    }
}

/// Tombstone for an entry deleted since the archive of reference.
#[derive(Clone, Debug)]
pub struct Detruit {
    /// Base tag of the deleted entry's kind.
    pub base: u8,
    /// When the deletion was recorded.
    pub ctime: i64,
}

/// The shared inode behind a set of hard links.
#[derive(Debug)]
pub struct Etoile {
    pub etiquette: u64,
    pub inode: Inode,
    /// Link count of the underlying filesystem inode.
    pub links: u64,
}

/// A directory entry referring to a shared inode.
#[derive(Clone, Debug)]
pub struct Mirage {
    pub star: Rc<RefCell<Etoile>>,
}

impl Mirage {
    pub fn etiquette(&self) -> u64 {
        self.star.borrow().etiquette
    }
}

/// A directory and its children, in insertion order, with a name index.
#[derive(Clone, Debug)]
pub struct Directory {
    pub attr: InodeAttr,
    pub status: SaveStatus,
    children: Vec<Child>,
    index: HashMap<String, usize>,
    /// Cached (logical, storage) recursive sizes.
    cached_sizes: Cell<Option<(u64, u64)>>,
    /// True when any descendant carries saved data.
    pub recursive_changed: bool,
}

impl Directory {
    pub fn new(attr: InodeAttr, status: SaveStatus) -> Self {
        Self {
            attr,
            status,
            children: Vec::new(),
            index: HashMap::new(),
            cached_sizes: Cell::new(None),
            recursive_changed: false,
        }
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn child(&self, idx: usize) -> Option<&Child> {
        self.children.get(idx)
    }

    pub fn child_mut(&mut self, idx: usize) -> Option<&mut Child> {
        self.cached_sizes.set(None);
        self.children.get_mut(idx)
    }

    pub fn child_by_name(&self, name: &str) -> Option<&Child> {
        self.index.get(name).map(|&i| &self.children[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Appends a child. Duplicate names are a caller error.
    pub fn add_child(&mut self, child: Child) -> Result<()> {
        if self.index.contains_key(&child.name) {
            return Err(Error::Libcall(format!(
                "duplicate entry name `{}` in directory",
                child.name
            )));
        }
        self.cached_sizes.set(None);
        self.index.insert(child.name.clone(), self.children.len());
        self.children.push(child);
        Ok(())
    }

    pub fn remove_child(&mut self, name: &str) -> bool {
        let Some(idx) = self.index.remove(name) else {
            return false;
        };
        self.children.remove(idx);
        for slot in self.index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        self.cached_sizes.set(None);
        true
    }

    pub fn invalidate_sizes(&self) {
        self.cached_sizes.set(None);
    }

    /// Recursive (logical, storage) sizes of the plain files below this
    /// directory. Computed once and cached until a mutation.
    pub fn recursive_sizes(&self) -> (u64, u64) {
        if let Some(sizes) = self.cached_sizes.get() {
            return sizes;
        }
        let mut logical = 0;
        let mut storage = 0;
        for child in &self.children {
            match &child.item {
                Item::Inode(inode) => {
                    if let Some(data) = inode.as_file() {
                        logical += data.size;
                        storage += if data.storage_size == 0 {
                            data.size
                        } else {
                            data.storage_size
                        };
                    }
                }
                Item::Mirage(mirage) => {
                    if let Some(data) = mirage.star.borrow().inode.as_file() {
                        logical += data.size;
                        storage += if data.storage_size == 0 {
                            data.size
                        } else {
                            data.storage_size
                        };
                    }
                }
                Item::Dir(dir) => {
                    let (l, s) = dir.recursive_sizes();
                    logical += l;
                    storage += s;
                }
                _ => {}
            }
        }
        self.cached_sizes.set(Some((logical, storage)));
        (logical, storage)
    }
}

/// Any named catalogue item.
#[derive(Clone, Debug)]
pub enum Item {
    Inode(Inode),
    Dir(Directory),
    Mirage(Mirage),
    Detruit(Detruit),
    Ignored,
    IgnoredDir,
}

impl Item {
    /// Base tag of the kind, for tombstones and listings.
    pub fn base_tag(&self) -> u8 {
        match self {
            Self::Inode(inode) => inode.base_tag(),
            Self::Dir(_) => BASE_DIR,
            Self::Mirage(mirage) => mirage.star.borrow().inode.base_tag(),
            Self::Detruit(d) => d.base,
            Self::Ignored => TAG_IGNORED,
            Self::IgnoredDir => TAG_IGNORED_DIR,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }
}

/// A named item inside a directory.
#[derive(Clone, Debug)]
pub struct Child {
    pub name: String,
    pub item: Item,
}

impl Child {
    pub fn new(name: impl Into<String>, item: Item) -> Self {
        Self {
            name: name.into(),
            item,
        }
    }

    /// Dumps this record (tag, name, payload). Directory children are the
    /// caller's business. `dumped` tracks which etoiles went out inline.
    pub fn dump(&self, f: &mut dyn Layer, dumped: &mut HashSet<u64>) -> Result<()> {
        match &self.item {
            Item::Inode(inode) => {
                f.write_all(&[inode.tag()])?;
                infinint::dump_string(f, &self.name)?;
                inode.dump(f)
            }
            Item::Dir(dir) => {
                f.write_all(&[make_tag(BASE_DIR, dir.status)])?;
                infinint::dump_string(f, &self.name)?;
                dir.attr.dump(f)
            }
            Item::Mirage(mirage) => {
                let star = mirage.star.borrow();
                if dumped.insert(star.etiquette) {
                    f.write_all(&[TAG_ETOILE])?;
                    infinint::dump_string(f, &self.name)?;
                    infinint::dump_u64(f, star.etiquette)?;
                    infinint::dump_u64(f, star.links)?;
                    f.write_all(&[star.inode.tag()])?;
                    star.inode.dump(f)
                } else {
                    f.write_all(&[TAG_MIRAGE])?;
                    infinint::dump_string(f, &self.name)?;
                    infinint::dump_u64(f, star.etiquette)
                }
            }
            Item::Detruit(detruit) => {
                f.write_all(&[TAG_DETRUIT])?;
                infinint::dump_string(f, &self.name)?;
                f.write_all(&[detruit.base])?;
                infinint::dump_i64(f, detruit.ctime)
            }
            Item::Ignored => {
                f.write_all(&[TAG_IGNORED])?;
                infinint::dump_string(f, &self.name)
            }
            Item::IgnoredDir => {
                f.write_all(&[TAG_IGNORED_DIR])?;
                infinint::dump_string(f, &self.name)
            }
        }
    }
}

/// One record parsed from a catalogue stream.
pub enum ParsedRecord {
    /// A named child; directories arrive empty, children follow.
    Child(Child),
    /// End of the current directory.
    Eod,
}

/// Reads the record starting at the current position.
///
/// `etoiles` maps etiquettes seen so far; in lax mode an unknown etiquette
/// degrades to an ignored placeholder instead of failing.
pub fn read_record(
    f: &mut dyn Layer,
    etoiles: &mut HashMap<u64, Rc<RefCell<Etoile>>>,
    lax: bool,
) -> Result<ParsedRecord> {
    let mut tag = [0u8; 1];
    f.read_exact(&mut tag)?;
    match parse_tag(tag[0])? {
        TagClass::Eod => Ok(ParsedRecord::Eod),
        TagClass::Inode { base: BASE_DIR, status } => {
            let name = infinint::read_string(f)?;
            let attr = InodeAttr::read(f)?;
            Ok(ParsedRecord::Child(Child::new(
                name,
                Item::Dir(Directory::new(attr, status)),
            )))
        }
        TagClass::Inode { base, status } => {
            let name = infinint::read_string(f)?;
            let inode = Inode::read(f, base, status)?;
            Ok(ParsedRecord::Child(Child::new(name, Item::Inode(inode))))
        }
        TagClass::Etoile => {
            let name = infinint::read_string(f)?;
            let etiquette = infinint::read_u64(f)?;
            let links = infinint::read_u64(f)?;
            let mut inner = [0u8; 1];
            f.read_exact(&mut inner)?;
            let (base, status) = match parse_tag(inner[0])? {
                TagClass::Inode { base, status } if base != BASE_DIR => (base, status),
                _ => return Err(Error::Data("etoile holds a non-inode record".into())),
            };
            let inode = Inode::read(f, base, status)?;
            let star = Rc::new(RefCell::new(Etoile {
                etiquette,
                inode,
                links,
            }));
            if etoiles.insert(etiquette, star.clone()).is_some() && !lax {
                return Err(Error::Data(format!(
                    "etiquette {etiquette} defined twice in catalogue"
                )));
            }
            Ok(ParsedRecord::Child(Child::new(
                name,
                Item::Mirage(Mirage { star }),
            )))
        }
        TagClass::Mirage => {
            let name = infinint::read_string(f)?;
            let etiquette = infinint::read_u64(f)?;
            match etoiles.get(&etiquette) {
                Some(star) => Ok(ParsedRecord::Child(Child::new(
                    name,
                    Item::Mirage(Mirage { star: star.clone() }),
                ))),
                None if lax => {
                    log::warn!(
                        "hard link `{name}` references unknown etiquette {etiquette}, \
                         degrading to a placeholder"
                    );
                    Ok(ParsedRecord::Child(Child::new(name, Item::Ignored)))
                }
                None => Err(Error::Data(format!(
                    "hard link `{name}` references undefined etiquette {etiquette}"
                ))),
            }
        }
        TagClass::Detruit => {
            let name = infinint::read_string(f)?;
            let mut base = [0u8; 1];
            f.read_exact(&mut base)?;
            let ctime = infinint::read_i64(f)?;
            Ok(ParsedRecord::Child(Child::new(
                name,
                Item::Detruit(Detruit {
                    base: base[0],
                    ctime,
                }),
            )))
        }
        TagClass::Ignored => {
            let name = infinint::read_string(f)?;
            Ok(ParsedRecord::Child(Child::new(name, Item::Ignored)))
        }
        TagClass::IgnoredDir => {
            let name = infinint::read_string(f)?;
            Ok(ParsedRecord::Child(Child::new(name, Item::IgnoredDir)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};

    #[test]
    fn tag_space_is_unambiguous() {
        let mut seen = HashSet::new();
        for base in INODE_BASES {
            for status in [
                SaveStatus::Saved,
                SaveStatus::NotSaved,
                SaveStatus::Fake,
                SaveStatus::InodeOnly,
                SaveStatus::Delta,
            ] {
                let tag = make_tag(base, status);
                assert!(tag.is_ascii_graphic());
                assert!(seen.insert(tag), "tag {tag:#x} collides");
                assert_eq!(parse_tag(tag).unwrap(), TagClass::Inode { base, status });
            }
        }
        for tag in [
            TAG_EOD,
            TAG_DETRUIT,
            TAG_MIRAGE,
            TAG_ETOILE,
            TAG_IGNORED,
            TAG_IGNORED_DIR,
        ] {
            assert!(seen.insert(tag), "tag {tag:#x} collides");
        }
        assert!(parse_tag(b'@').is_err());
    }

    fn file_inode(size: u64) -> Inode {
        Inode {
            attr: InodeAttr {
                uid: 1000,
                gid: 100,
                perm: 0o644,
                atime: 100,
                mtime: 200,
                ctime: 300,
                ..Default::default()
            },
            status: SaveStatus::Saved,
            payload: InodePayload::File(FileData {
                size,
                storage_size: 0,
                offset: 42,
                crc: Some({
                    let mut crc = Crc::new(2);
                    crc.add(b"xy");
                    crc
                }),
                compression: CompressionAlgo::None,
                dirty: false,
                sparse: true,
                has_delta_sig: false,
            }),
        }
    }

    #[test]
    fn file_record_round_trip() {
        let child = Child::new("a.txt", Item::Inode(file_inode(5)));
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        child.dump(&mut m, &mut HashSet::new()).unwrap();
        m.skip(0).unwrap();
        let mut map = HashMap::new();
        let back = match read_record(&mut m, &mut map, false).unwrap() {
            ParsedRecord::Child(c) => c,
            ParsedRecord::Eod => panic!("expected a child"),
        };
        assert_eq!(back.name, "a.txt");
        let Item::Inode(inode) = back.item else {
            panic!("expected an inode");
        };
        assert_eq!(inode.status, SaveStatus::Saved);
        let data = inode.as_file().unwrap();
        assert_eq!(data.size, 5);
        assert_eq!(data.offset, 42);
        assert!(data.sparse);
        assert_eq!(inode.attr.perm, 0o644);
        assert_eq!(inode.attr.mtime, 200);
    }

    #[test]
    fn hard_link_records_share_one_etoile() {
        let star = Rc::new(RefCell::new(Etoile {
            etiquette: 7,
            inode: file_inode(6),
            links: 2,
        }));
        let first = Child::new("file1", Item::Mirage(Mirage { star: star.clone() }));
        let second = Child::new("file2", Item::Mirage(Mirage { star }));

        let mut m = MemoryLayer::new(Mode::ReadWrite);
        let mut dumped = HashSet::new();
        first.dump(&mut m, &mut dumped).unwrap();
        second.dump(&mut m, &mut dumped).unwrap();

        m.skip(0).unwrap();
        let mut tag = [0u8; 1];
        m.read_exact(&mut tag).unwrap();
        assert_eq!(tag[0], TAG_ETOILE);

        m.skip(0).unwrap();
        let mut map = HashMap::new();
        let a = match read_record(&mut m, &mut map, false).unwrap() {
            ParsedRecord::Child(c) => c,
            _ => panic!(),
        };
        let b = match read_record(&mut m, &mut map, false).unwrap() {
            ParsedRecord::Child(c) => c,
            _ => panic!(),
        };
        let (Item::Mirage(ma), Item::Mirage(mb)) = (&a.item, &b.item) else {
            panic!("expected two mirages");
        };
        assert!(Rc::ptr_eq(&ma.star, &mb.star));
        assert_eq!(ma.etiquette(), 7);
        assert_eq!(ma.star.borrow().links, 2);
    }

    #[test]
    fn missing_etiquette_fails_strict_degrades_lax() {
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        m.write_all(&[TAG_MIRAGE]).unwrap();
        infinint::dump_string(&mut m, "orphan").unwrap();
        infinint::dump_u64(&mut m, 99).unwrap();

        m.skip(0).unwrap();
        let mut map = HashMap::new();
        assert!(read_record(&mut m, &mut map, false).is_err());

        m.skip(0).unwrap();
        let rec = read_record(&mut m, &mut map, true).unwrap();
        match rec {
            ParsedRecord::Child(c) => {
                assert_eq!(c.name, "orphan");
                assert!(matches!(c.item, Item::Ignored));
            }
            ParsedRecord::Eod => panic!(),
        }
    }

    #[test]
    fn directory_sizes_cache_and_invalidate() {
        let mut dir = Directory::new(InodeAttr::default(), SaveStatus::Saved);
        dir.add_child(Child::new("a", Item::Inode(file_inode(10)))).unwrap();
        assert_eq!(dir.recursive_sizes(), (10, 10));
        dir.add_child(Child::new("b", Item::Inode(file_inode(20)))).unwrap();
        assert_eq!(dir.recursive_sizes(), (30, 30));
        assert!(dir.remove_child("a"));
        assert_eq!(dir.recursive_sizes(), (20, 20));
        assert!(dir.add_child(Child::new("b", Item::Ignored)).is_err());
    }
}
