//! The comparison pass: archive against the live filesystem.

use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::catalogue::{Catalogue, ReadCursor, ReadItem};
use crate::crc::Crc;
use crate::entry::{Child, InodeAttr, InodePayload, Item, SaveStatus};
use crate::error::{Error, Result};
use crate::fs_io;
use crate::interaction::UserInteraction;
use crate::options::{DiffOptions, WhatToCheck};
use crate::overwrite::equal_with_hourshift;
use crate::statistics::Statistics;

use super::check_cancel;

/// Compares every selected catalogue entry with the filesystem under
/// `root`. Mismatches are reported and counted in `errored`.
pub fn execute(
    ui: &mut dyn UserInteraction,
    archive: &mut Archive,
    catalogue: &Catalogue,
    root: &Path,
    opts: &DiffOptions,
    stats: &mut Statistics,
) -> Result<()> {
    let mut cursor = ReadCursor::new();
    let mut dirs: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut rel = PathBuf::new();

    while let Some(item) = catalogue.read(&mut cursor)? {
        check_cancel(&opts.cancellation)?;
        match item {
            ReadItem::Eod => {
                dirs.pop().ok_or_else(Error::bug)?;
                rel.pop();
            }
            ReadItem::Child(child) => {
                let child_rel = rel.join(&child.name);
                let dest = dirs.last().ok_or_else(Error::bug)?.join(&child.name);
                let is_dir = child.item.is_dir();
                if is_dir {
                    if !opts.subtree.covers(&child_rel) {
                        stats.ignored += 1;
                        catalogue.skip_read_to_parent_dir(&mut cursor);
                        continue;
                    }
                    dirs.push(dest.clone());
                    rel.push(&child.name);
                } else if !opts.selection.covers(&child_rel) || !opts.subtree.covers(&child_rel)
                {
                    stats.ignored += 1;
                    continue;
                }
                match compare_one(ui, archive, child, &dest, opts, stats) {
                    Ok(true) => stats.treated += 1,
                    Ok(false) => {
                        stats.errored += 1;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        stats.errored += 1;
                        ui.message(&format!("{}: {e}", dest.display()));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Returns whether the entry matches the filesystem.
fn compare_one(
    ui: &mut dyn UserInteraction,
    archive: &mut Archive,
    child: &Child,
    dest: &Path,
    opts: &DiffOptions,
    stats: &mut Statistics,
) -> Result<bool> {
    let (attr, payload, status) = match &child.item {
        Item::Inode(inode) => (inode.attr.clone(), Some(inode.payload.clone()), inode.status),
        Item::Dir(dir) => (dir.attr.clone(), None, dir.status),
        Item::Mirage(mirage) => {
            let star = mirage.star.borrow();
            (
                star.inode.attr.clone(),
                Some(star.inode.payload.clone()),
                star.inode.status,
            )
        }
        Item::Detruit(_) => {
            // a tombstone matches when the entry is indeed gone
            return Ok(fs_io::read_entry(dest).is_err());
        }
        Item::Ignored | Item::IgnoredDir => return Ok(true),
    };

    let on_disk = match fs_io::read_entry(dest) {
        Ok(e) => e,
        Err(_) => {
            ui.message(&format!("{}: missing from the filesystem", dest.display()));
            return Ok(false);
        }
    };

    // kinds must agree
    let catalogue_base = child.item.base_tag();
    let disk_base = match &on_disk.payload {
        None => crate::entry::BASE_DIR,
        Some(p) => p.base_tag(),
    };
    if catalogue_base != disk_base {
        ui.message(&format!("{}: entry type differs", dest.display()));
        return Ok(false);
    }

    if !metadata_matches(&attr, &on_disk.attr, opts) {
        ui.message(&format!("{}: metadata differs", dest.display()));
        return Ok(false);
    }

    // symlink targets
    if let (
        Some(InodePayload::Symlink { target }),
        Some(InodePayload::Symlink { target: disk_target }),
    ) = (&payload, &on_disk.payload)
    {
        if target != disk_target {
            ui.message(&format!("{}: symlink target differs", dest.display()));
            return Ok(false);
        }
    }

    // file content, through the stored checksum
    if let Some(InodePayload::File(data)) = &payload {
        if status == SaveStatus::Saved {
            let disk_size = match &on_disk.payload {
                Some(InodePayload::File(f)) => f.size,
                _ => 0,
            };
            if disk_size != data.size {
                ui.message(&format!(
                    "{}: size differs ({} vs {})",
                    dest.display(),
                    data.size,
                    disk_size
                ));
                return Ok(false);
            }
            if let Some(stored) = &data.crc {
                let mut file = std::fs::File::open(dest)
                    .map_err(|e| Error::system(dest.display().to_string(), e))?;
                let mut crc = Crc::new(stored.width());
                let mut buf = vec![0u8; 65_536];
                loop {
                    let got = std::io::Read::read(&mut file, &mut buf).map_err(Error::from)?;
                    if got == 0 {
                        break;
                    }
                    crc.add(&buf[..got]);
                }
                if crc.value() != stored.value() {
                    ui.message(&format!("{}: content differs", dest.display()));
                    return Ok(false);
                }
            }
        }
    }

    // EA comparison under the EA mask
    if attr.ea_status == crate::ea::EaStatus::Full {
        let archived = archive.read_ea_block(&attr)?;
        let on_disk_ea = fs_io::read_ea(dest).unwrap_or_default();
        for (name, value) in archived.iter() {
            if !opts.ea_mask.covers(Path::new(name)) {
                continue;
            }
            if on_disk_ea.get(name) != Some(value) {
                ui.message(&format!("{}: EA {name} differs", dest.display()));
                return Ok(false);
            }
        }
        stats.ea_treated += 1;
    }

    // FSA comparison within the active scope
    if opts.fsa_scope_ext && attr.fsa_status == crate::fsa::FsaStatus::Full {
        let archived = archive.read_fsa_block(&attr)?;
        let on_disk_fsa = fs_io::read_fsa(dest, true);
        for fsa in archived.iter() {
            if !on_disk_fsa.iter().any(|f| f == fsa) {
                ui.message(&format!("{}: FSA differ", dest.display()));
                return Ok(false);
            }
        }
        stats.fsa_treated += 1;
    }

    Ok(true)
}

fn metadata_matches(archived: &InodeAttr, on_disk: &InodeAttr, opts: &DiffOptions) -> bool {
    match opts.what_to_check {
        WhatToCheck::InodeType => true,
        WhatToCheck::MtimeOnly => {
            equal_with_hourshift(archived.mtime, on_disk.mtime, opts.hourshift)
        }
        WhatToCheck::IgnoreOwner => {
            archived.perm == on_disk.perm
                && equal_with_hourshift(archived.mtime, on_disk.mtime, opts.hourshift)
        }
        WhatToCheck::All => {
            archived.perm == on_disk.perm
                && archived.uid == on_disk.uid
                && archived.gid == on_disk.gid
                && equal_with_hourshift(archived.mtime, on_disk.mtime, opts.hourshift)
        }
    }
}
