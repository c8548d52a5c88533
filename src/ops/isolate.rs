//! The isolation pass: catalogue-only copy of an archive.
//!
//! The produced archive holds no file data; every offset and checksum of
//! the source catalogue is preserved, and the header keeps the source's
//! identity plus its slice layout, so the isolated catalogue can later be
//! paired with the original slices for differential backups or testing.

use crate::archive::Archive;
use crate::catalogue::Catalogue;
use crate::entrepot::Entrepot;
use crate::error::{Error, Result};
use crate::interaction::UserInteraction;
use crate::layer::{Layer, MemoryLayer, Mode};
use crate::options::IsolateOptions;
use crate::statistics::Statistics;

use super::{WriteCtx, check_cancel};

pub fn execute(
    ui: &mut dyn UserInteraction,
    source: &Archive,
    entrepot: Box<dyn Entrepot>,
    basename: &str,
    opts: &IsolateOptions,
    stats: &mut Statistics,
) -> Result<()> {
    check_cancel(&opts.cancellation)?;
    if opts.delta_signature {
        return Err(Error::Feature("rebuilding delta signatures"));
    }

    let mut ctx = WriteCtx::new(
        entrepot,
        basename,
        &opts.output,
        source.header.data_name,
        Some(source.slice_layout),
    )?;

    // deep copy through the serialized form: offsets, checksums and the
    // hard-link graph survive unchanged
    let mut staging = MemoryLayer::new(Mode::ReadWrite);
    source.catalogue.dump(&mut staging)?;
    staging.skip(0)?;
    ctx.catalogue = Catalogue::read_from(&mut staging, false)?;

    stats.treated = ctx.catalogue.stats().total();
    ctx.finalize()?;
    ui.message(&format!(
        "catalogue of {} isolated, {} entries",
        source.header.data_name,
        stats.treated
    ));
    Ok(())
}
