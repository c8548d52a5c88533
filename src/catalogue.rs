//! The catalogue: in-memory inventory of an archive.
//!
//! A catalogue is the root directory tree plus the map of shared inodes
//! (etoiles), per-kind statistics and the identity label tying it to the
//! archive that produced it. Traversal state lives outside the tree in
//! cursor objects, so several walks (reading, appending, comparing,
//! subtree-restricted reading) can run over one catalogue without stepping
//! on each other.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::crc::{Crc, CrcTee};
use crate::entry::{
    Child, Detruit, Directory, Etoile, InodeAttr, Item, Mirage, ParsedRecord, SaveStatus,
    TAG_EOD, read_record,
};
use crate::error::{Error, Result};
use crate::label::Label;
use crate::layer::Layer;

/// Per-kind entry counts, maintained while the catalogue is built.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CatalogueStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub devices: u64,
    pub pipes: u64,
    pub sockets: u64,
    pub doors: u64,
    /// Entries that are hard-link references.
    pub hard_linked: u64,
    /// Inodes whose data is saved in this archive.
    pub saved: u64,
    pub detruit: u64,
    pub ignored: u64,
}

impl CatalogueStats {
    pub fn total(&self) -> u64 {
        self.files
            + self.dirs
            + self.symlinks
            + self.devices
            + self.pipes
            + self.sockets
            + self.doors
            + self.detruit
            + self.ignored
    }
}

/// Append cursor: the chain of directories currently open for insertion.
#[derive(Clone, Debug, Default)]
pub struct AddCursor {
    path: Vec<usize>,
}

/// In-order traversal cursor.
///
/// The stack holds, per open directory, the index of the next child to
/// visit. The index path to the current directory is recovered from the
/// parent frames (each was incremented when its child was entered).
#[derive(Clone, Debug)]
pub struct ReadCursor {
    stack: Vec<usize>,
}

impl Default for ReadCursor {
    fn default() -> Self {
        Self { stack: vec![0] }
    }
}

impl ReadCursor {
    pub fn new() -> Self {
        Self::default()
    }

    fn dir_path(&self) -> Vec<usize> {
        self.stack[..self.stack.len() - 1]
            .iter()
            .map(|&i| i - 1)
            .collect()
    }
}

/// What a read cursor yields.
pub enum ReadItem<'a> {
    Child(&'a Child),
    /// Leaving a directory.
    Eod,
}

/// Traversal restricted to the subtree rooted at a given path.
#[derive(Clone, Debug)]
pub struct SubReadCursor {
    base: Vec<usize>,
    inner: ReadCursor,
}

/// Cursor used to follow a parallel traversal (typically the filesystem)
/// through the catalogue by name.
#[derive(Clone, Debug, Default)]
pub struct CompareCursor {
    path: Vec<usize>,
    /// Directories entered on the outside that do not exist here.
    missing_depth: u64,
}

pub struct Catalogue {
    root: Directory,
    etoiles: HashMap<u64, Weak<RefCell<Etoile>>>,
    /// Identity of the archive this catalogue describes.
    pub data_name: Label,
    next_etiquette: u64,
    stats: CatalogueStats,
}

fn dir_at<'a>(root: &'a Directory, path: &[usize]) -> Result<&'a Directory> {
    let mut dir = root;
    for &idx in path {
        dir = match dir.child(idx).map(|c| &c.item) {
            Some(Item::Dir(sub)) => sub,
            _ => return Err(Error::bug()),
        };
    }
    Ok(dir)
}

fn dir_at_mut<'a>(root: &'a mut Directory, path: &[usize]) -> Result<&'a mut Directory> {
    let mut dir = root;
    for &idx in path {
        dir = match dir.child_mut(idx).map(|c| &mut c.item) {
            Some(Item::Dir(sub)) => sub,
            _ => return Err(Error::bug()),
        };
    }
    Ok(dir)
}

impl Catalogue {
    pub fn new(data_name: Label) -> Self {
        Self {
            root: Directory::new(InodeAttr::default(), SaveStatus::Saved),
            etoiles: HashMap::new(),
            data_name,
            next_etiquette: 0,
            stats: CatalogueStats::default(),
        }
    }

    pub fn root(&self) -> &Directory {
        &self.root
    }

    pub fn stats(&self) -> &CatalogueStats {
        &self.stats
    }

    /// Next free hard-link identifier.
    pub fn next_etiquette(&self) -> u64 {
        self.next_etiquette
    }

    /// Allocates a fresh etiquette.
    pub fn assign_etiquette(&mut self) -> u64 {
        let etiquette = self.next_etiquette;
        self.next_etiquette += 1;
        etiquette
    }

    /// The shared inode registered under an etiquette, if still alive.
    pub fn etoile(&self, etiquette: u64) -> Option<Rc<RefCell<Etoile>>> {
        self.etoiles.get(&etiquette).and_then(Weak::upgrade)
    }

    /// Registers a shared inode so later mirages can find it.
    pub fn register_etoile(&mut self, star: &Rc<RefCell<Etoile>>) {
        let etiquette = star.borrow().etiquette;
        self.etoiles.insert(etiquette, Rc::downgrade(star));
        if etiquette >= self.next_etiquette {
            self.next_etiquette = etiquette + 1;
        }
    }

    fn count(&mut self, item: &Item) {
        use crate::entry::{BASE_BLOCK, BASE_CHAR, BASE_DIR, BASE_DOOR, BASE_FILE, BASE_PIPE,
                           BASE_SOCKET, BASE_SYMLINK};
        match item {
            Item::Mirage(_) => self.stats.hard_linked += 1,
            Item::Detruit(_) => self.stats.detruit += 1,
            Item::Ignored | Item::IgnoredDir => self.stats.ignored += 1,
            _ => {}
        }
        let saved = match item {
            Item::Inode(inode) => {
                matches!(inode.status, SaveStatus::Saved | SaveStatus::Delta)
            }
            Item::Dir(dir) => matches!(dir.status, SaveStatus::Saved | SaveStatus::Delta),
            Item::Mirage(mirage) => matches!(
                mirage.star.borrow().inode.status,
                SaveStatus::Saved | SaveStatus::Delta
            ),
            _ => false,
        };
        if saved {
            self.stats.saved += 1;
        }
        match item.base_tag() {
            BASE_FILE => self.stats.files += 1,
            BASE_DIR => self.stats.dirs += 1,
            BASE_SYMLINK => self.stats.symlinks += 1,
            BASE_BLOCK | BASE_CHAR => self.stats.devices += 1,
            BASE_PIPE => self.stats.pipes += 1,
            BASE_SOCKET => self.stats.sockets += 1,
            BASE_DOOR => self.stats.doors += 1,
            _ => {}
        }
    }

    /// Appends a child at the add cursor. Directories stay open for the
    /// children that follow, until [`Catalogue::close_dir`].
    pub fn add(&mut self, cursor: &mut AddCursor, child: Child) -> Result<()> {
        self.count(&child.item);
        if let Item::Mirage(mirage) = &child.item {
            let star = mirage.star.clone();
            self.register_etoile(&star);
        }
        let saved = match &child.item {
            Item::Inode(i) => matches!(i.status, SaveStatus::Saved | SaveStatus::Delta),
            Item::Mirage(m) => matches!(
                m.star.borrow().inode.status,
                SaveStatus::Saved | SaveStatus::Delta
            ),
            _ => false,
        };
        if saved {
            // propagate the change flag down the open chain
            let mut dir = &mut self.root;
            dir.recursive_changed = true;
            for &idx in &cursor.path {
                dir = match dir.child_mut(idx).map(|c| &mut c.item) {
                    Some(Item::Dir(sub)) => sub,
                    _ => return Err(Error::bug()),
                };
                dir.recursive_changed = true;
            }
        }
        let dir = dir_at_mut(&mut self.root, &cursor.path)?;
        let descend = child.item.is_dir();
        let idx = dir.len();
        dir.add_child(child)?;
        if descend {
            cursor.path.push(idx);
        }
        Ok(())
    }

    /// Closes the directory currently open at the add cursor.
    pub fn close_dir(&mut self, cursor: &mut AddCursor) -> Result<()> {
        cursor.path.pop().map(|_| ()).ok_or_else(|| {
            Error::Libcall("attempt to close more directories than were opened".into())
        })
    }

    /// Applies one parsed record to the add cursor.
    pub fn add_record(&mut self, cursor: &mut AddCursor, record: ParsedRecord) -> Result<()> {
        match record {
            ParsedRecord::Child(child) => self.add(cursor, child),
            ParsedRecord::Eod => self.close_dir(cursor),
        }
    }

    /// Advances an in-order traversal by one step.
    pub fn read<'a>(&'a self, cursor: &mut ReadCursor) -> Result<Option<ReadItem<'a>>> {
        if cursor.stack.is_empty() {
            return Ok(None);
        }
        let path = cursor.dir_path();
        let dir = dir_at(&self.root, &path)?;
        let next = *cursor.stack.last().ok_or_else(Error::bug)?;
        if next < dir.len() {
            *cursor.stack.last_mut().ok_or_else(Error::bug)? += 1;
            let child = dir.child(next).ok_or_else(Error::bug)?;
            if child.item.is_dir() {
                cursor.stack.push(0);
            }
            return Ok(Some(ReadItem::Child(child)));
        }
        cursor.stack.pop();
        if cursor.stack.is_empty() {
            return Ok(None);
        }
        Ok(Some(ReadItem::Eod))
    }

    /// Drops the rest of the current directory: the next read continues
    /// with the parent's following sibling.
    pub fn skip_read_to_parent_dir(&self, cursor: &mut ReadCursor) {
        if cursor.stack.len() > 1 {
            cursor.stack.pop();
        }
    }

    /// Builds a cursor over the subtree at `path` (relative, `/`-separated).
    pub fn sub_read_cursor(&self, path: &Path) -> Result<SubReadCursor> {
        let mut base = Vec::new();
        let mut dir = &self.root;
        for component in path.iter() {
            let name = component.to_string_lossy();
            let idx = dir.index_of(&name).ok_or_else(|| {
                Error::Range(format!("no such path in catalogue: {}", path.display()))
            })?;
            match dir.child(idx).map(|c| &c.item) {
                Some(Item::Dir(sub)) => {
                    base.push(idx);
                    dir = sub;
                }
                _ => {
                    return Err(Error::Range(format!(
                        "not a directory in catalogue: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(SubReadCursor {
            base,
            inner: ReadCursor::new(),
        })
    }

    /// Advances a subtree traversal by one step.
    pub fn sub_read<'a>(&'a self, cursor: &mut SubReadCursor) -> Result<Option<ReadItem<'a>>> {
        let base_dir = dir_at(&self.root, &cursor.base)?;
        if cursor.inner.stack.is_empty() {
            return Ok(None);
        }
        let path = cursor.inner.dir_path();
        let dir = dir_at(base_dir, &path)?;
        let next = *cursor.inner.stack.last().ok_or_else(Error::bug)?;
        if next < dir.len() {
            *cursor.inner.stack.last_mut().ok_or_else(Error::bug)? += 1;
            let child = dir.child(next).ok_or_else(Error::bug)?;
            if child.item.is_dir() {
                cursor.inner.stack.push(0);
            }
            return Ok(Some(ReadItem::Child(child)));
        }
        cursor.inner.stack.pop();
        if cursor.inner.stack.is_empty() {
            return Ok(None);
        }
        Ok(Some(ReadItem::Eod))
    }

    /// Looks up `name` at the compare cursor's depth. Entering a directory
    /// descends on hit and tracks a virtual depth on miss, so the caller
    /// can mirror any outside traversal.
    pub fn compare<'a>(
        &'a self,
        cursor: &mut CompareCursor,
        name: &str,
        entry_is_dir: bool,
    ) -> Result<Option<&'a Child>> {
        if cursor.missing_depth > 0 {
            if entry_is_dir {
                cursor.missing_depth += 1;
            }
            return Ok(None);
        }
        let dir = dir_at(&self.root, &cursor.path)?;
        match dir.index_of(name) {
            Some(idx) => {
                let child = dir.child(idx).ok_or_else(Error::bug)?;
                if entry_is_dir {
                    if child.item.is_dir() {
                        cursor.path.push(idx);
                    } else {
                        cursor.missing_depth = 1;
                    }
                }
                Ok(Some(child))
            }
            None => {
                if entry_is_dir {
                    cursor.missing_depth = 1;
                }
                Ok(None)
            }
        }
    }

    /// Mirrors leaving a directory on the outside traversal.
    pub fn compare_out(&self, cursor: &mut CompareCursor) {
        if cursor.missing_depth > 0 {
            cursor.missing_depth -= 1;
        } else {
            cursor.path.pop();
        }
    }

    /// Looks up a full path.
    pub fn lookup(&self, path: &Path) -> Option<&Child> {
        let mut dir = &self.root;
        let mut components = path.iter().peekable();
        while let Some(component) = components.next() {
            let name = component.to_string_lossy();
            let child = dir.child_by_name(&name)?;
            if components.peek().is_none() {
                return Some(child);
            }
            match &child.item {
                Item::Dir(sub) => dir = sub,
                _ => return None,
            }
        }
        None
    }

    /// Records a tombstone for every path present in `reference` but absent
    /// here. Returns the number of deletions recorded.
    pub fn update_destroyed_with(&mut self, reference: &Catalogue, now: i64) -> Result<u64> {
        fn recurse(dst: &mut Directory, src: &Directory, now: i64) -> Result<u64> {
            let mut count = 0;
            for src_child in src.children() {
                match &src_child.item {
                    Item::Ignored | Item::IgnoredDir | Item::Detruit(_) => continue,
                    _ => {}
                }
                match dst.index_of(&src_child.name) {
                    None => {
                        dst.add_child(Child::new(
                            src_child.name.clone(),
                            Item::Detruit(Detruit {
                                base: src_child.item.base_tag(),
                                ctime: now,
                            }),
                        ))?;
                        count += 1;
                    }
                    Some(idx) => {
                        let dst_item = dst.child_mut(idx).ok_or_else(Error::bug)?;
                        if let (Item::Dir(dst_sub), Item::Dir(src_sub)) =
                            (&mut dst_item.item, &src_child.item)
                        {
                            count += recurse(dst_sub, src_sub, now)?;
                        }
                    }
                }
            }
            Ok(count)
        }
        let count = recurse(&mut self.root, &reference.root, now)?;
        self.stats.detruit += count;
        Ok(count)
    }

    /// After an interrupted backup: copies entries from `reference` missing
    /// here as unchanged, renumbering etiquettes above `etiquette_base` to
    /// avoid collisions. Returns the number of entries copied.
    pub fn update_absent_with(
        &mut self,
        reference: &Catalogue,
        etiquette_base: u64,
    ) -> Result<u64> {
        struct Copier {
            remap: HashMap<u64, Rc<RefCell<Etoile>>>,
            base: u64,
        }

        impl Copier {
            fn copy_item(&mut self, item: &Item) -> Option<Item> {
                match item {
                    Item::Inode(inode) => {
                        let mut inode = inode.clone();
                        if inode.status == SaveStatus::Saved {
                            inode.status = SaveStatus::NotSaved;
                        }
                        Some(Item::Inode(inode))
                    }
                    Item::Mirage(mirage) => {
                        let src = mirage.star.borrow();
                        let base = self.base;
                        let star = self
                            .remap
                            .entry(src.etiquette)
                            .or_insert_with(|| {
                                let mut inode = src.inode.clone();
                                if inode.status == SaveStatus::Saved {
                                    inode.status = SaveStatus::NotSaved;
                                }
                                Rc::new(RefCell::new(Etoile {
                                    etiquette: base + src.etiquette,
                                    inode,
                                    links: src.links,
                                }))
                            })
                            .clone();
                        Some(Item::Mirage(Mirage { star }))
                    }
                    Item::Detruit(d) => Some(Item::Detruit(d.clone())),
                    Item::Dir(_) | Item::Ignored | Item::IgnoredDir => None,
                }
            }
        }

        fn recurse(
            dst: &mut Directory,
            src: &Directory,
            copier: &mut Copier,
            new_stars: &mut Vec<Rc<RefCell<Etoile>>>,
        ) -> Result<u64> {
            let mut count = 0;
            for src_child in src.children() {
                match dst.index_of(&src_child.name) {
                    Some(idx) => {
                        let dst_child = dst.child_mut(idx).ok_or_else(Error::bug)?;
                        if let (Item::Dir(dst_sub), Item::Dir(src_sub)) =
                            (&mut dst_child.item, &src_child.item)
                        {
                            count += recurse(dst_sub, src_sub, copier, new_stars)?;
                        }
                    }
                    None => match &src_child.item {
                        Item::Dir(src_sub) => {
                            let mut copy =
                                Directory::new(src_sub.attr.clone(), SaveStatus::NotSaved);
                            let sub_count =
                                recurse(&mut copy, src_sub, copier, new_stars)?;
                            dst.add_child(Child::new(src_child.name.clone(), Item::Dir(copy)))?;
                            count += 1 + sub_count;
                        }
                        other => {
                            if let Some(item) = copier.copy_item(other) {
                                if let Item::Mirage(m) = &item {
                                    new_stars.push(m.star.clone());
                                }
                                dst.add_child(Child::new(src_child.name.clone(), item))?;
                                count += 1;
                            }
                        }
                    },
                }
            }
            Ok(count)
        }

        let mut copier = Copier {
            remap: HashMap::new(),
            base: etiquette_base,
        };
        let mut new_stars = Vec::new();
        let count = recurse(&mut self.root, &reference.root, &mut copier, &mut new_stars)?;
        for star in new_stars {
            self.register_etoile(&star);
        }
        Ok(count)
    }

    /// Serializes the whole tree: identity label, depth-first records, the
    /// root's end marker, then the checksum of everything before it.
    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        fn dump_children(
            dir: &Directory,
            f: &mut dyn Layer,
            dumped: &mut HashSet<u64>,
        ) -> Result<()> {
            for child in dir.children() {
                child.dump(f, dumped)?;
                if let Item::Dir(sub) = &child.item {
                    dump_children(sub, f, dumped)?;
                    f.write_all(&[TAG_EOD])?;
                }
            }
            Ok(())
        }

        let mut crc = Crc::new(4);
        {
            let mut tee = CrcTee::new(f, &mut crc);
            self.data_name.dump(&mut tee)?;
            let mut dumped = HashSet::new();
            dump_children(&self.root, &mut tee, &mut dumped)?;
            tee.write_all(&[TAG_EOD])?;
        }
        crc.dump(f)
    }

    /// Parses a catalogue dumped by [`Catalogue::dump`].
    pub fn read_from(f: &mut dyn Layer, lax: bool) -> Result<Self> {
        let mut crc = Crc::new(4);
        let mut etoiles: HashMap<u64, Rc<RefCell<Etoile>>> = HashMap::new();
        let mut mirage_seen: HashMap<u64, u64> = HashMap::new();

        let mut catalogue;
        {
            let mut tee = CrcTee::new(f, &mut crc);
            catalogue = Catalogue::new(Label::read(&mut tee)?);
            let mut cursor = AddCursor::default();
            let mut depth = 0u64;
            loop {
                let record = read_record(&mut tee, &mut etoiles, lax)?;
                match &record {
                    ParsedRecord::Eod => {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    ParsedRecord::Child(child) => {
                        if let Item::Mirage(m) = &child.item {
                            *mirage_seen.entry(m.etiquette()).or_insert(0) += 1;
                        }
                        if child.item.is_dir() {
                            depth += 1;
                        }
                    }
                }
                catalogue.add_record(&mut cursor, record)?;
            }
        }

        let stored = Crc::read(f)?;
        if stored.value() != crc.value() {
            if lax {
                log::warn!("catalogue checksum mismatch, continuing in lax mode");
            } else {
                return Err(Error::Data("catalogue checksum mismatch".into()));
            }
        }

        for (etiquette, star) in &etoiles {
            let links = star.borrow().links;
            let seen = mirage_seen.get(etiquette).copied().unwrap_or(0);
            // fewer entries than the inode's link count is normal (links
            // outside the saved subtree); more is a corrupted graph
            if seen > links {
                if lax {
                    log::warn!(
                        "etiquette {etiquette}: {seen} hard links found, {links} expected"
                    );
                } else {
                    return Err(Error::Data(format!(
                        "etiquette {etiquette}: {seen} hard links found, {links} expected"
                    )));
                }
            } else if seen < links {
                log::debug!(
                    "etiquette {etiquette}: {} links live outside the archive",
                    links - seen
                );
            }
        }
        Ok(catalogue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::CompressionAlgo;
    use crate::entry::{FileData, Inode, InodePayload};
    use crate::layer::{MemoryLayer, Mode};

    fn file(name: &str, size: u64, status: SaveStatus) -> Child {
        Child::new(
            name,
            Item::Inode(Inode {
                attr: InodeAttr {
                    uid: 1,
                    gid: 1,
                    perm: 0o644,
                    mtime: 1000,
                    ctime: 1000,
                    ..Default::default()
                },
                status,
                payload: InodePayload::File(FileData {
                    size,
                    compression: CompressionAlgo::None,
                    ..Default::default()
                }),
            }),
        )
    }

    fn dir(name: &str) -> Child {
        Child::new(
            name,
            Item::Dir(Directory::new(InodeAttr::default(), SaveStatus::Saved)),
        )
    }

    /// root { a.txt, sub { b.txt }, link -> etoile }
    fn sample() -> Catalogue {
        let mut cat = Catalogue::new(Label::random());
        let mut cur = AddCursor::default();
        cat.add(&mut cur, file("a.txt", 5, SaveStatus::Saved)).unwrap();
        cat.add(&mut cur, dir("sub")).unwrap();
        cat.add(&mut cur, file("b.txt", 5, SaveStatus::Saved)).unwrap();
        cat.close_dir(&mut cur).unwrap();

        let etiquette = cat.assign_etiquette();
        let star = Rc::new(RefCell::new(Etoile {
            etiquette,
            inode: match file("x", 6, SaveStatus::Saved).item {
                Item::Inode(inode) => inode,
                _ => unreachable!(),
            },
            links: 2,
        }));
        cat.add(
            &mut cur,
            Child::new("file1", Item::Mirage(Mirage { star: star.clone() })),
        )
        .unwrap();
        cat.add(&mut cur, Child::new("file2", Item::Mirage(Mirage { star })))
            .unwrap();
        cat
    }

    fn names_in_order(cat: &Catalogue) -> Vec<String> {
        let mut cursor = ReadCursor::new();
        let mut names = Vec::new();
        while let Some(item) = cat.read(&mut cursor).unwrap() {
            match item {
                ReadItem::Child(c) => names.push(c.name.clone()),
                ReadItem::Eod => names.push("<eod>".into()),
            }
        }
        names
    }

    #[test]
    fn in_order_traversal_with_eod() {
        let cat = sample();
        assert_eq!(
            names_in_order(&cat),
            vec!["a.txt", "sub", "b.txt", "<eod>", "file1", "file2"]
        );
    }

    #[test]
    fn skip_to_parent() {
        let cat = sample();
        let mut cursor = ReadCursor::new();
        // a.txt then sub
        cat.read(&mut cursor).unwrap();
        cat.read(&mut cursor).unwrap();
        cat.skip_read_to_parent_dir(&mut cursor);
        let mut rest = Vec::new();
        while let Some(item) = cat.read(&mut cursor).unwrap() {
            if let ReadItem::Child(c) = item {
                rest.push(c.name.clone());
            }
        }
        assert_eq!(rest, vec!["file1", "file2"]);
    }

    #[test]
    fn sub_read_sees_only_the_subtree() {
        let cat = sample();
        let mut cursor = cat.sub_read_cursor(Path::new("sub")).unwrap();
        let mut names = Vec::new();
        while let Some(item) = cat.sub_read(&mut cursor).unwrap() {
            if let ReadItem::Child(c) = item {
                names.push(c.name.clone());
            }
        }
        assert_eq!(names, vec!["b.txt"]);
        assert!(cat.sub_read_cursor(Path::new("nope")).is_err());
    }

    #[test]
    fn statistics_track_kinds() {
        let cat = sample();
        let stats = cat.stats();
        // a.txt, sub/b.txt and both hard-link entries count as files
        assert_eq!(stats.files, 4);
        assert_eq!(stats.dirs, 1);
        assert_eq!(stats.hard_linked, 2);
        assert_eq!(stats.total(), stats.files + stats.dirs);
    }

    #[test]
    fn dump_and_read_back() {
        let cat = sample();
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        cat.dump(&mut m).unwrap();
        m.skip(0).unwrap();
        let back = Catalogue::read_from(&mut m, false).unwrap();
        assert_eq!(back.data_name, cat.data_name);
        assert_eq!(names_in_order(&back), names_in_order(&cat));
        assert_eq!(back.stats().hard_linked, 2);

        // hard links resolve to one shared inode
        let f1 = back.lookup(Path::new("file1")).unwrap();
        let f2 = back.lookup(Path::new("file2")).unwrap();
        let (Item::Mirage(m1), Item::Mirage(m2)) = (&f1.item, &f2.item) else {
            panic!("expected mirages");
        };
        assert!(Rc::ptr_eq(&m1.star, &m2.star));
    }

    #[test]
    fn corrupted_dump_is_rejected() {
        let cat = sample();
        let mut m = MemoryLayer::new(Mode::ReadWrite);
        cat.dump(&mut m).unwrap();
        let mid = (m.position().unwrap() / 2) as usize;
        m.as_mut_slice()[mid] ^= 0xff;
        m.skip(0).unwrap();
        assert!(Catalogue::read_from(&mut m, false).is_err());
    }

    #[test]
    fn compare_follows_an_outside_walk() {
        let cat = sample();
        let mut cur = CompareCursor::default();
        assert!(cat.compare(&mut cur, "a.txt", false).unwrap().is_some());
        assert!(cat.compare(&mut cur, "sub", true).unwrap().is_some());
        assert!(cat.compare(&mut cur, "b.txt", false).unwrap().is_some());
        assert!(cat.compare(&mut cur, "ghost", false).unwrap().is_none());
        cat.compare_out(&mut cur);
        // a directory that does not exist in the catalogue
        assert!(cat.compare(&mut cur, "other", true).unwrap().is_none());
        assert!(cat.compare(&mut cur, "below", false).unwrap().is_none());
        cat.compare_out(&mut cur);
        assert!(cat.compare(&mut cur, "file1", false).unwrap().is_some());
    }

    #[test]
    fn update_destroyed_records_tombstones() {
        let reference = sample();
        // current backup lost sub/b.txt and file2
        let mut cat = Catalogue::new(Label::random());
        let mut cur = AddCursor::default();
        cat.add(&mut cur, file("a.txt", 5, SaveStatus::NotSaved)).unwrap();
        cat.add(&mut cur, dir("sub")).unwrap();
        cat.close_dir(&mut cur).unwrap();
        cat.add(&mut cur, file("file1", 6, SaveStatus::NotSaved)).unwrap();

        let count = cat.update_destroyed_with(&reference, 5000).unwrap();
        assert_eq!(count, 2);
        let ghost = cat.lookup(Path::new("sub/b.txt")).unwrap();
        match &ghost.item {
            Item::Detruit(d) => {
                assert_eq!(d.base, crate::entry::BASE_FILE);
                assert_eq!(d.ctime, 5000);
            }
            _ => panic!("expected a tombstone"),
        }
        assert!(cat.lookup(Path::new("file2")).is_some());
        // idempotent for already-recorded paths
        assert_eq!(cat.update_destroyed_with(&reference, 6000).unwrap(), 0);
    }

    #[test]
    fn update_absent_copies_and_renumbers() {
        let reference = sample();
        let mut cat = Catalogue::new(Label::random());
        let mut cur = AddCursor::default();
        cat.add(&mut cur, file("a.txt", 5, SaveStatus::Saved)).unwrap();

        let base = 100;
        let copied = cat.update_absent_with(&reference, base).unwrap();
        // sub, sub/b.txt, file1, file2
        assert_eq!(copied, 4);
        let f1 = cat.lookup(Path::new("file1")).unwrap();
        let Item::Mirage(m1) = &f1.item else {
            panic!("expected a mirage");
        };
        assert_eq!(m1.etiquette(), base);
        assert!(matches!(
            m1.star.borrow().inode.status,
            SaveStatus::NotSaved
        ));
        assert!(cat.next_etiquette() > base);
    }
}
