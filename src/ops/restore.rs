//! The restore pass: archive to filesystem.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::catalogue::{Catalogue, ReadCursor, ReadItem};
use crate::entry::{
    Child, Directory, FileData, Inode, InodeAttr, InodePayload, Item, SaveStatus,
};
use crate::error::{Error, Result};
use crate::fs_io;
use crate::interaction::UserInteraction;
use crate::options::{DirtyBehavior, RestoreOptions, WhatToCheck};
use crate::overwrite::{DataAction, EaAction};
use crate::statistics::Statistics;

use super::check_cancel;

/// Restores `catalogue` (walked in order) from `archive` under `target`.
pub fn execute(
    ui: &mut dyn UserInteraction,
    archive: &mut Archive,
    catalogue: &Catalogue,
    target: &Path,
    opts: &RestoreOptions,
    stats: &mut Statistics,
) -> Result<()> {
    let mut pass = Restore {
        ui,
        archive,
        opts,
        stats,
        links: HashMap::new(),
    };
    pass.run(catalogue, target)
}

/// One open directory of the walk: where it lands on disk, and the
/// attributes to apply once its children are done.
struct OpenDir {
    dest: PathBuf,
    /// Attributes applied at end-of-directory; `None` when the directory
    /// was preserved untouched.
    finalize: Option<InodeAttr>,
}

struct Restore<'a> {
    ui: &'a mut dyn UserInteraction,
    archive: &'a mut Archive,
    opts: &'a RestoreOptions,
    stats: &'a mut Statistics,
    /// Etiquette to first-restored-path, for hard link reconstruction.
    links: HashMap<u64, PathBuf>,
}

impl Restore<'_> {
    fn run(&mut self, catalogue: &Catalogue, target: &Path) -> Result<()> {
        let mut cursor = ReadCursor::new();
        let mut dirs: Vec<OpenDir> = vec![OpenDir {
            dest: target.to_path_buf(),
            finalize: None,
        }];
        let mut rel = PathBuf::new();

        while let Some(item) = catalogue.read(&mut cursor)? {
            check_cancel(&self.opts.cancellation)?;
            match item {
                ReadItem::Eod => {
                    let done = dirs.pop().ok_or_else(Error::bug)?;
                    rel.pop();
                    if let Some(attr) = done.finalize {
                        // directory times must be set after its content
                        self.apply_ea_fsa_metadata(&done.dest, &attr, false)?;
                    }
                }
                ReadItem::Child(child) => {
                    let child_rel = rel.join(&child.name);
                    let parent = dirs.last().ok_or_else(Error::bug)?;
                    let dest = if self.opts.flat {
                        target.join(&child.name)
                    } else {
                        parent.dest.join(&child.name)
                    };
                    match &child.item {
                        Item::Dir(dir) => {
                            match self.enter_dir(catalogue, &mut cursor, dir, child, &child_rel, &dest) {
                                Ok(Some(open)) => {
                                    dirs.push(open);
                                    rel.push(&child.name);
                                }
                                Ok(None) => {
                                    // subtree pruned; the cursor was rewound
                                }
                                Err(e) if e.is_fatal() => return Err(e),
                                Err(e) => {
                                    self.stats.errored += 1;
                                    self.ui
                                        .message(&format!("{}: {e}", dest.display()));
                                    catalogue.skip_read_to_parent_dir(&mut cursor);
                                }
                            }
                        }
                        _ => match self.process_leaf(child, &child_rel, &dest) {
                            Ok(()) => {}
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                self.stats.errored += 1;
                                self.ui.message(&format!("{}: {e}", dest.display()));
                            }
                        },
                    }
                }
            }
        }
        Ok(())
    }

    /// Decides what to do with a directory entry. Returns the open record
    /// to push, or None when the subtree was pruned.
    fn enter_dir(
        &mut self,
        catalogue: &Catalogue,
        cursor: &mut ReadCursor,
        dir: &Directory,
        child: &Child,
        rel: &Path,
        dest: &Path,
    ) -> Result<Option<OpenDir>> {
        if !self.opts.subtree.covers(rel) {
            self.stats.ignored += 1;
            catalogue.skip_read_to_parent_dir(cursor);
            return Ok(None);
        }
        if self.opts.empty_dir_excluded && !dir.recursive_changed {
            self.stats.ignored += 1;
            catalogue.skip_read_to_parent_dir(cursor);
            return Ok(None);
        }
        if self.opts.flat {
            // no directory creation; children land at the target root
            return Ok(Some(OpenDir {
                dest: dest.to_path_buf(),
                finalize: None,
            }));
        }

        let mut finalize = Some(dir.attr.clone());
        match fs_io::read_entry(dest) {
            Ok(existing) if existing.is_dir => {
                // keep it; refresh metadata per policy
                let in_place = fs_child(&existing);
                let (data, _ea) = self.resolve(&in_place, child)?;
                if matches!(data, DataAction::Preserve | DataAction::PreserveMarkAlreadySaved) {
                    finalize = None;
                    self.stats.tooold += 1;
                } else {
                    self.stats.treated += 1;
                }
            }
            Ok(existing) => {
                let in_place = fs_child(&existing);
                let (data, _ea) = self.resolve(&in_place, child)?;
                match data {
                    DataAction::Preserve | DataAction::PreserveMarkAlreadySaved => {
                        self.stats.tooold += 1;
                        catalogue.skip_read_to_parent_dir(cursor);
                        return Ok(None);
                    }
                    DataAction::Remove => {
                        fs::remove_file(dest).map_err(Error::from)?;
                        self.stats.deleted += 1;
                        catalogue.skip_read_to_parent_dir(cursor);
                        return Ok(None);
                    }
                    _ => {
                        fs::remove_file(dest).map_err(Error::from)?;
                        fs::create_dir(dest).map_err(Error::from)?;
                        self.stats.treated += 1;
                    }
                }
            }
            Err(_) => {
                if self.opts.only_deleted {
                    finalize = None;
                } else {
                    fs::create_dir(dest).map_err(Error::from)?;
                    self.stats.treated += 1;
                }
            }
        }
        Ok(Some(OpenDir {
            dest: dest.to_path_buf(),
            finalize,
        }))
    }

    fn process_leaf(&mut self, child: &Child, rel: &Path, dest: &Path) -> Result<()> {
        match &child.item {
            Item::Detruit(_) => {
                if self.opts.ignore_deleted {
                    return Ok(());
                }
                match fs_io::read_entry(dest) {
                    Ok(existing) => {
                        if existing.is_dir {
                            fs::remove_dir_all(dest).map_err(Error::from)?;
                        } else {
                            fs::remove_file(dest).map_err(Error::from)?;
                        }
                        self.stats.deleted += 1;
                    }
                    Err(_) => {}
                }
                Ok(())
            }
            Item::Ignored | Item::IgnoredDir => Ok(()),
            Item::Inode(_) | Item::Mirage(_) => {
                if self.opts.only_deleted {
                    return Ok(());
                }
                if !self.opts.selection.covers(rel) || !self.opts.subtree.covers(rel) {
                    self.stats.ignored += 1;
                    return Ok(());
                }
                self.restore_inode(child, dest)
            }
            Item::Dir(_) => Err(Error::bug()),
        }
    }

    /// Resolves the overwriting policy, asking the user when it says so.
    fn resolve(&mut self, in_place: &Child, to_add: &Child) -> Result<(DataAction, EaAction)> {
        let (mut data, mut ea) = self.opts.overwriting.evaluate(in_place, to_add);
        if data == DataAction::Undefined || ea == EaAction::Undefined {
            return Err(Error::Libcall(
                "the overwriting policy leaves an action undefined".into(),
            ));
        }
        if data == DataAction::Ask {
            data = if self
                .ui
                .pause(&format!("{}: overwrite data?", to_add.name))
            {
                DataAction::Overwrite
            } else {
                DataAction::Preserve
            };
        }
        if ea == EaAction::Ask {
            ea = if self.ui.pause(&format!("{}: overwrite EA?", to_add.name)) {
                EaAction::Overwrite
            } else {
                EaAction::Preserve
            };
        }
        Ok((data, ea))
    }

    fn restore_inode(&mut self, child: &Child, dest: &Path) -> Result<()> {
        // hard link whose inode was already restored: just link
        if let Item::Mirage(mirage) = &child.item {
            let etiquette = mirage.etiquette();
            if let Some(first) = self.links.get(&etiquette) {
                if fs_io::read_entry(dest).is_ok() {
                    fs::remove_file(dest).map_err(Error::from)?;
                }
                fs::hard_link(first, dest)
                    .map_err(|e| Error::system(dest.display().to_string(), e))?;
                self.stats.hard_links += 1;
                return Ok(());
            }
        }

        let inode = match &child.item {
            Item::Inode(inode) => inode.clone(),
            Item::Mirage(mirage) => mirage.star.borrow().inode.clone(),
            _ => return Err(Error::bug()),
        };

        // a file whose data lives only in the archive of reference cannot
        // be materialized from here
        if let InodePayload::File(_) = inode.payload {
            if !matches!(inode.status, SaveStatus::Saved | SaveStatus::Delta) {
                self.stats.skipped += 1;
                return Ok(());
            }
        }

        // dirty data needs an explicit go-ahead
        if let Some(data) = inode.as_file() {
            if data.dirty {
                match self.opts.dirty {
                    DirtyBehavior::Ignore => {
                        self.stats.skipped += 1;
                        return Ok(());
                    }
                    DirtyBehavior::Warn => {
                        let go = self.ui.pause(&format!(
                            "{}: was modified while being saved, restore anyway?",
                            child.name
                        ));
                        if !go {
                            self.stats.skipped += 1;
                            return Ok(());
                        }
                    }
                    DirtyBehavior::Restore => {}
                }
            }
        }

        let mut ea_action = EaAction::Overwrite;
        match fs_io::read_entry(dest) {
            Ok(existing) => {
                let in_place = fs_child(&existing);
                let (data, ea) = self.resolve(&in_place, child)?;
                ea_action = ea;
                match data {
                    DataAction::Preserve | DataAction::PreserveMarkAlreadySaved => {
                        self.stats.tooold += 1;
                        return self.apply_ea_only(child, dest, ea_action, &existing);
                    }
                    DataAction::Remove => {
                        remove_in_place(dest, existing.is_dir)?;
                        self.stats.deleted += 1;
                        return Ok(());
                    }
                    DataAction::Overwrite | DataAction::OverwriteMarkAlreadySaved => {
                        remove_in_place(dest, existing.is_dir)?;
                    }
                    DataAction::Undefined | DataAction::Ask => return Err(Error::bug()),
                }
            }
            Err(_) => {}
        }

        match &inode.payload {
            InodePayload::File(data) => match inode.status {
                SaveStatus::Saved => self.restore_file_data(&child.name, data, dest)?,
                SaveStatus::Delta => {
                    return Err(Error::Feature("applying binary delta patches"));
                }
                _ => {
                    // data lives in the archive of reference only
                    self.stats.skipped += 1;
                    return Ok(());
                }
            },
            InodePayload::Socket | InodePayload::Door => {
                self.ui.message(&format!(
                    "{}: sockets and doors cannot be recreated, skipping",
                    dest.display()
                ));
                self.stats.skipped += 1;
                return Ok(());
            }
            payload => fs_io::create_special(dest, payload, inode.attr.perm)?,
        }

        if let Item::Mirage(mirage) = &child.item {
            self.links.insert(mirage.etiquette(), dest.to_path_buf());
        }

        if ea_action != EaAction::Preserve {
            self.restore_ea(child, dest, &inode.attr)?;
        }
        if self.opts.fsa_scope_ext
            && inode.attr.fsa_status == crate::fsa::FsaStatus::Full
        {
            match self.archive.read_fsa_block(&inode.attr) {
                Ok(set) => {
                    fs_io::write_fsa(dest, &set)?;
                    self.stats.fsa_treated += 1;
                }
                Err(e) => {
                    self.stats.errored += 1;
                    self.ui.message(&format!("{}: {e}", dest.display()));
                }
            }
        }
        let is_symlink = matches!(inode.payload, InodePayload::Symlink { .. });
        fs_io::write_metadata(
            dest,
            &inode.attr,
            is_symlink,
            self.opts.what_to_check != WhatToCheck::IgnoreOwner,
            true,
        )?;
        self.stats.treated += 1;
        Ok(())
    }

    fn restore_file_data(&mut self, name: &str, data: &FileData, dest: &Path) -> Result<()> {
        let mut out =
            File::create(dest).map_err(|e| Error::system(dest.display().to_string(), e))?;
        let crc = self.archive.read_file_data(data, Some(&mut out))?;
        drop(out);
        self.stats.byte_read += data.size;
        if let Some(stored) = &data.crc {
            if stored.value() != crc.value() {
                return Err(Error::Data(format!(
                    "{name}: data failed its checksum during restore"
                )));
            }
        }
        Ok(())
    }

    /// EA handling on an entry whose data stays in place.
    fn apply_ea_only(
        &mut self,
        child: &Child,
        dest: &Path,
        action: EaAction,
        _existing: &fs_io::FsEntry,
    ) -> Result<()> {
        let attr = match &child.item {
            Item::Inode(inode) => inode.attr.clone(),
            Item::Dir(dir) => dir.attr.clone(),
            Item::Mirage(mirage) => mirage.star.borrow().inode.attr.clone(),
            _ => return Ok(()),
        };
        match action {
            EaAction::Preserve | EaAction::PreserveMarkAlreadySaved => Ok(()),
            EaAction::Clear => {
                let current = fs_io::read_ea(dest)?;
                for (name, _) in current.iter() {
                    if let Err(e) = fs_io::remove_ea(dest, name) {
                        log::warn!("{}: cannot clear EA {name}: {e}", dest.display());
                    }
                }
                Ok(())
            }
            EaAction::Overwrite
            | EaAction::OverwriteMarkAlreadySaved
            | EaAction::MergeOverwrite
            | EaAction::MergePreserve => self.restore_ea(child, dest, &attr),
            EaAction::Undefined | EaAction::Ask => Err(Error::bug()),
        }
    }

    fn restore_ea(&mut self, child: &Child, dest: &Path, attr: &InodeAttr) -> Result<()> {
        if attr.ea_status != crate::ea::EaStatus::Full {
            return Ok(());
        }
        let set = match self.archive.read_ea_block(attr) {
            Ok(set) => set,
            Err(e) => {
                self.stats.errored += 1;
                self.ui.message(&format!("{}: {e}", child.name));
                return Ok(());
            }
        };
        let mut kept = crate::ea::EaSet::new();
        for (name, value) in set.iter() {
            if self.opts.ea_mask.covers(Path::new(name)) {
                kept.add(name, value.to_vec());
            }
        }
        if kept.is_empty() {
            return Ok(());
        }
        match fs_io::write_ea(dest, &kept) {
            Ok(()) => {
                self.stats.ea_treated += 1;
            }
            Err(e) => {
                self.stats.errored += 1;
                self.ui.message(&format!("{}: cannot write EA: {e}", dest.display()));
            }
        }
        Ok(())
    }

    /// Applies EA, FSA and metadata to a directory at end-of-directory.
    fn apply_ea_fsa_metadata(&mut self, dest: &Path, attr: &InodeAttr, _symlink: bool) -> Result<()> {
        if attr.ea_status == crate::ea::EaStatus::Full {
            if let Ok(set) = self.archive.read_ea_block(attr) {
                let mut kept = crate::ea::EaSet::new();
                for (name, value) in set.iter() {
                    if self.opts.ea_mask.covers(Path::new(name)) {
                        kept.add(name, value.to_vec());
                    }
                }
                if !kept.is_empty() && fs_io::write_ea(dest, &kept).is_ok() {
                    self.stats.ea_treated += 1;
                }
            }
        }
        if self.opts.fsa_scope_ext && attr.fsa_status == crate::fsa::FsaStatus::Full {
            if let Ok(set) = self.archive.read_fsa_block(attr) {
                if fs_io::write_fsa(dest, &set).is_ok() {
                    self.stats.fsa_treated += 1;
                }
            }
        }
        fs_io::write_metadata(
            dest,
            attr,
            false,
            self.opts.what_to_check != WhatToCheck::IgnoreOwner,
            true,
        )
    }
}

/// Builds a catalogue child out of a live filesystem entry, for policy
/// evaluation.
fn fs_child(entry: &fs_io::FsEntry) -> Child {
    let item = match &entry.payload {
        None => Item::Dir(Directory::new(entry.attr.clone(), SaveStatus::Saved)),
        Some(payload) => Item::Inode(Inode {
            attr: entry.attr.clone(),
            status: SaveStatus::Saved,
            payload: payload.clone(),
        }),
    };
    Child::new(entry.name.clone(), item)
}

fn remove_in_place(dest: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        fs::remove_dir_all(dest).map_err(Error::from)
    } else {
        fs::remove_file(dest).map_err(Error::from)
    }
}
