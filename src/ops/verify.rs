//! The test pass: archive integrity verification.

use std::path::PathBuf;

use crate::archive::Archive;
use crate::catalogue::{Catalogue, ReadCursor, ReadItem};
use crate::entry::{Inode, InodeAttr, Item, SaveStatus};
use crate::error::{Error, Result};
use crate::interaction::UserInteraction;
use crate::options::TestOptions;
use crate::statistics::Statistics;

use super::check_cancel;

/// Re-reads every selected entry's data, EA and FSA through the stack and
/// compares the recomputed checksums with the stored ones. In `empty` mode
/// only the metadata structure is checked.
pub fn execute(
    ui: &mut dyn UserInteraction,
    archive: &mut Archive,
    catalogue: &Catalogue,
    opts: &TestOptions,
    stats: &mut Statistics,
) -> Result<()> {
    let mut cursor = ReadCursor::new();
    let mut rel = PathBuf::new();

    while let Some(item) = catalogue.read(&mut cursor)? {
        check_cancel(&opts.cancellation)?;
        match item {
            ReadItem::Eod => {
                rel.pop();
            }
            ReadItem::Child(child) => {
                let child_rel = rel.join(&child.name);
                if child.item.is_dir() {
                    if !opts.subtree.covers(&child_rel) {
                        stats.ignored += 1;
                        catalogue.skip_read_to_parent_dir(&mut cursor);
                        continue;
                    }
                    rel.push(&child.name);
                    stats.treated += 1;
                    continue;
                }
                if !opts.selection.covers(&child_rel) || !opts.subtree.covers(&child_rel) {
                    stats.ignored += 1;
                    continue;
                }
                match test_one(archive, child, opts, stats) {
                    Ok(()) => stats.treated += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        stats.errored += 1;
                        ui.message(&format!("{}: {e}", child_rel.display()));
                    }
                }
            }
        }
    }
    Ok(())
}

fn test_one(
    archive: &mut Archive,
    child: &crate::entry::Child,
    opts: &TestOptions,
    stats: &mut Statistics,
) -> Result<()> {
    let inode: Option<Inode> = match &child.item {
        Item::Inode(inode) => Some(inode.clone()),
        Item::Mirage(mirage) => {
            stats.hard_links += 1;
            Some(mirage.star.borrow().inode.clone())
        }
        Item::Detruit(_) => {
            stats.deleted += 1;
            None
        }
        _ => None,
    };
    let Some(inode) = inode else {
        return Ok(());
    };
    if opts.empty {
        return Ok(());
    }

    if let Some(data) = inode.as_file() {
        if inode.status == SaveStatus::Saved {
            let crc = archive.read_file_data(data, None)?;
            stats.byte_read += data.size;
            match &data.crc {
                Some(stored) if stored.value() == crc.value() => {}
                Some(_) => {
                    return Err(Error::Data("data region failed its checksum".into()));
                }
                None => {
                    return Err(Error::Data("entry carries no data checksum".into()));
                }
            }
        }
    }
    test_blocks(archive, &inode.attr, stats)
}

fn test_blocks(archive: &mut Archive, attr: &InodeAttr, stats: &mut Statistics) -> Result<()> {
    if attr.ea_status == crate::ea::EaStatus::Full {
        archive.read_ea_block(attr)?;
        stats.ea_treated += 1;
    }
    if attr.fsa_status == crate::fsa::FsaStatus::Full {
        archive.read_fsa_block(attr)?;
        stats.fsa_treated += 1;
    }
    Ok(())
}
