//! Slice files and the slicing layer.
//!
//! An archive is stored as one or more fixed-size slice files named
//! `<basename>.<NNN>.<ext>`. The slicer presents them as a single logical
//! byte stream: writes roll over to a new slice when the current one is
//! full, reads transparently open the next slice, and skips map logical
//! offsets to (slice, in-slice offset) through [`SliceLayout`].
//!
//! Each slice starts with a small header (magic, the archive's internal
//! label, a first/other flag; the first slice adds the slice sizes and the
//! digit count) and ends with a one-byte continuation flag telling whether
//! another slice follows.

use std::path::PathBuf;
use std::process::Command;

use crate::entrepot::{Entrepot, OpenHow};
use crate::error::{Error, Result};
use crate::hasher::{HashAlgo, Hasher};
use crate::label::Label;
use crate::layer::{Layer, Mode, SkipDirection};

const SLICE_MAGIC: &[u8; 8] = b"CofArSl\x01";
const FLAG_FIRST: u8 = b'F';
const FLAG_OTHER: u8 = b'O';
const FLAG_CONTINUES: u8 = b'C';
const FLAG_LAST: u8 = b'E';

/// Header bytes at the start of the first slice.
pub const FIRST_SLICE_HEADER_LEN: u64 = 8 + 16 + 1 + 8 + 8 + 8;
/// Header bytes at the start of every other slice.
pub const OTHER_SLICE_HEADER_LEN: u64 = 8 + 16 + 1;

/// Geometry of a sliced archive.
///
/// Zero sizes mean "not sliced". Offsets are mapped with integer division
/// after subtracting the per-slice header and the trailing continuation
/// byte (the legacy format predates the trailing byte and does not subtract
/// it).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SliceLayout {
    pub first_size: u64,
    pub other_size: u64,
    pub first_slice_header: u64,
    pub other_slice_header: u64,
    pub legacy_trailing: bool,
}

impl SliceLayout {
    /// Layout of a non-sliced archive.
    pub fn unsliced() -> Self {
        Self {
            first_size: 0,
            other_size: 0,
            first_slice_header: FIRST_SLICE_HEADER_LEN,
            other_slice_header: OTHER_SLICE_HEADER_LEN,
            legacy_trailing: false,
        }
    }

    /// Layout of a sliced archive with the current header sizes.
    pub fn sliced(first_size: u64, other_size: u64) -> Self {
        Self {
            first_size,
            other_size,
            first_slice_header: FIRST_SLICE_HEADER_LEN,
            other_slice_header: OTHER_SLICE_HEADER_LEN,
            legacy_trailing: false,
        }
    }

    pub fn is_sliced(&self) -> bool {
        self.first_size != 0 && self.other_size != 0
    }

    /// Usable payload bytes in the first slice.
    fn payload_first(&self) -> u64 {
        let mut n = self.first_size - self.first_slice_header;
        if !self.legacy_trailing {
            n -= 1; // trailing continuation flag
        }
        n
    }

    /// Usable payload bytes in every other slice.
    fn payload_other(&self) -> u64 {
        let mut n = self.other_size - self.other_slice_header;
        if !self.legacy_trailing {
            n -= 1;
        }
        n
    }

    /// Maps a logical archive offset to (slice number, offset inside that
    /// slice file, header included). Slice numbers start at 1.
    pub fn which_slice(&self, offset: u64) -> Result<(u64, u64)> {
        if !self.is_sliced() {
            return Ok((1, offset + self.first_slice_header));
        }
        if self.first_size < self.first_slice_header
            || self.other_size < self.other_slice_header
            || self.first_slice_header == 0
            || self.other_slice_header == 0
        {
            return Err(Error::bug());
        }
        let in_first = self.payload_first();
        let per_slice = self.payload_other();
        if offset < in_first {
            Ok((1, offset + self.first_slice_header))
        } else {
            let quotient = (offset - in_first) / per_slice;
            let rest = (offset - in_first) % per_slice;
            // slice numbers start at 1 and the first slice is already counted
            Ok((quotient + 2, rest + self.other_slice_header))
        }
    }

    /// Serializes the layout, for headers that describe reference slicing.
    pub fn dump(&self, f: &mut dyn Layer) -> Result<()> {
        crate::infinint::dump_u64(f, self.first_size)?;
        crate::infinint::dump_u64(f, self.other_size)?;
        crate::infinint::dump_u64(f, self.first_slice_header)?;
        crate::infinint::dump_u64(f, self.other_slice_header)?;
        f.write_all(&[if self.legacy_trailing { b'7' } else { b'8' }])
    }

    /// Deserializes a layout written by [`SliceLayout::dump`].
    pub fn read(f: &mut dyn Layer) -> Result<Self> {
        let first_size = crate::infinint::read_u64(f)?;
        let other_size = crate::infinint::read_u64(f)?;
        let first_slice_header = crate::infinint::read_u64(f)?;
        let other_slice_header = crate::infinint::read_u64(f)?;
        let mut flag = [0u8; 1];
        f.read_exact(&mut flag)?;
        let legacy_trailing = match flag[0] {
            b'7' => true,
            b'8' => false,
            _ => return Err(Error::Data("malformed slice layout flag".into())),
        };
        Ok(Self {
            first_size,
            other_size,
            first_slice_header,
            other_slice_header,
            legacy_trailing,
        })
    }

    /// Inverse of [`SliceLayout::which_slice`].
    pub fn reconstruct_offset(&self, slice: u64, slice_offset: u64) -> u64 {
        if !self.is_sliced() || slice == 1 {
            slice_offset - self.first_slice_header
        } else {
            self.payload_first()
                + (slice - 2) * self.payload_other()
                + (slice_offset - self.other_slice_header)
        }
    }
}

/// Naming scheme of slice files.
#[derive(Clone, Debug)]
pub struct SliceName {
    pub basename: String,
    pub extension: String,
    /// Minimum digit count of the slice number, zero-padded.
    pub min_digits: usize,
}

impl SliceName {
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            extension: "dar".into(),
            min_digits: 1,
        }
    }

    pub fn file_name(&self, slice: u64) -> String {
        format!(
            "{}.{:0width$}.{}",
            self.basename,
            slice,
            self.extension,
            width = self.min_digits.max(1)
        )
    }
}

/// Options of a [`Slicer`].
pub struct SlicerOptions {
    pub name: SliceName,
    pub layout: SliceLayout,
    pub label: Label,
    pub hash: Option<HashAlgo>,
    /// Permission bits of created slice files.
    pub permission: u32,
    /// Command executed between slices, after `%n %b %p %e` substitution.
    pub pause_command: Option<String>,
}

impl SlicerOptions {
    pub fn new(name: SliceName, layout: SliceLayout, label: Label) -> Self {
        Self {
            name,
            layout,
            label,
            hash: None,
            permission: 0o644,
            pause_command: None,
        }
    }
}

/// State of the currently open slice on the read side.
struct ReadSlice {
    file: Box<dyn Layer>,
    /// Bytes of payload in this slice (header and flag excluded).
    payload_len: u64,
    /// Whether this is the final slice.
    last: bool,
}

/// The slicing layer. Bottom of every archive stack.
pub struct Slicer {
    entrepot: Box<dyn Entrepot>,
    opts: SlicerOptions,
    mode: Mode,
    /// Logical position over the concatenated payloads.
    logical: u64,
    current_num: u64,
    write_slice: Option<Box<dyn Layer>>,
    /// Payload bytes already written into the current slice.
    write_filled: u64,
    read_slice: Option<ReadSlice>,
    terminated: bool,
}

impl Slicer {
    /// Creates the writing side, opening the first slice immediately.
    pub fn create(entrepot: Box<dyn Entrepot>, opts: SlicerOptions) -> Result<Self> {
        let mut slicer = Self {
            entrepot,
            opts,
            mode: Mode::Write,
            logical: 0,
            current_num: 0,
            write_slice: None,
            write_filled: 0,
            read_slice: None,
            terminated: false,
        };
        slicer.open_write_slice(1)?;
        Ok(slicer)
    }

    /// Opens an existing archive for reading. The layout carried by the
    /// first slice header replaces the one given in the options.
    pub fn open(entrepot: Box<dyn Entrepot>, mut opts: SlicerOptions) -> Result<Self> {
        let mut slicer = Self {
            entrepot,
            opts: SlicerOptions::new(
                SliceName::new(""),
                SliceLayout::unsliced(),
                Label::cleared(),
            ),
            mode: Mode::Read,
            logical: 0,
            current_num: 0,
            write_slice: None,
            write_filled: 0,
            read_slice: None,
            terminated: false,
        };
        opts.label = Label::cleared();
        slicer.opts = opts;
        slicer.open_read_slice(1)?;
        Ok(slicer)
    }

    /// The archive's internal label, as stamped (write) or read back.
    pub fn label(&self) -> Label {
        self.opts.label
    }

    pub fn layout(&self) -> SliceLayout {
        self.opts.layout
    }

    pub fn slice_count(&self) -> u64 {
        self.current_num
    }

    fn payload_capacity(&self, slice: u64) -> u64 {
        if !self.opts.layout.is_sliced() {
            u64::MAX
        } else if slice == 1 {
            self.opts.layout.payload_first()
        } else {
            self.opts.layout.payload_other()
        }
    }

    fn run_pause_command(&mut self, next_slice: u64) -> Result<()> {
        let Some(template) = &self.opts.pause_command else {
            return Ok(());
        };
        let cmd = template
            .replace("%n", &next_slice.to_string())
            .replace("%b", &self.opts.name.basename)
            .replace("%p", &self.entrepot.location())
            .replace("%e", &self.opts.name.extension);
        log::info!("running between-slice command: {cmd}");
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .status()
            .map_err(|e| Error::Script(format!("{cmd}: {e}")))?;
        if !status.success() {
            return Err(Error::Script(format!("{cmd}: exited with {status}")));
        }
        Ok(())
    }

    fn open_write_slice(&mut self, num: u64) -> Result<()> {
        let file_name = self.opts.name.file_name(num);
        let how = OpenHow {
            mode: Mode::Write,
            permission: self.opts.permission,
            fail_if_exists: false,
            erase: true,
        };
        let raw = self.entrepot.open(&PathBuf::from(&file_name), how)?;
        let mut slice: Box<dyn Layer> = match self.opts.hash {
            Some(algo) => {
                let sidecar_name = format!("{}.{}", file_name, algo.extension());
                let sidecar = self.entrepot.open(&PathBuf::from(&sidecar_name), how)?;
                Box::new(Hasher::new(raw, algo, sidecar, file_name.clone()))
            }
            None => raw,
        };
        // slice header
        slice.write_all(SLICE_MAGIC)?;
        slice.write_all(&self.opts.label.0)?;
        if num == 1 {
            slice.write_all(&[FLAG_FIRST])?;
            slice.write_all(&self.opts.layout.first_size.to_be_bytes())?;
            slice.write_all(&self.opts.layout.other_size.to_be_bytes())?;
            slice.write_all(&(self.opts.name.min_digits as u64).to_be_bytes())?;
        } else {
            slice.write_all(&[FLAG_OTHER])?;
        }
        self.write_slice = Some(slice);
        self.write_filled = 0;
        self.current_num = num;
        log::info!("slice {file_name} opened for writing");
        Ok(())
    }

    fn close_write_slice(&mut self, continues: bool) -> Result<()> {
        if let Some(mut slice) = self.write_slice.take() {
            let flag = if continues { FLAG_CONTINUES } else { FLAG_LAST };
            slice.write_all(&[flag])?;
            slice.terminate()?;
        }
        Ok(())
    }

    fn open_read_slice(&mut self, num: u64) -> Result<()> {
        let file_name = self.opts.name.file_name(num);
        let how = OpenHow {
            mode: Mode::Read,
            permission: 0,
            fail_if_exists: false,
            erase: false,
        };
        let mut file = match self.entrepot.open(&PathBuf::from(&file_name), how) {
            Ok(f) => f,
            Err(e) if self.opts.pause_command.is_some() => {
                // give the operator a chance to make the slice available
                self.run_pause_command(num)?;
                self.entrepot
                    .open(&PathBuf::from(&file_name), how)
                    .map_err(|_| e)?
            }
            Err(e) => return Err(e),
        };

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|_| Error::Data(format!("{file_name}: not a slice file")))?;
        if &magic != SLICE_MAGIC {
            return Err(Error::Data(format!("{file_name}: bad slice magic")));
        }
        let mut label = [0u8; 16];
        file.read_exact(&mut label)?;
        let label = Label(label);
        if self.opts.label.is_cleared() {
            self.opts.label = label;
        } else if label != self.opts.label {
            return Err(Error::Data(format!(
                "{file_name}: slice belongs to a different archive"
            )));
        }
        let mut flag = [0u8; 1];
        file.read_exact(&mut flag)?;
        let header_len = match (num, flag[0]) {
            (1, FLAG_FIRST) => {
                let mut sizes = [0u8; 24];
                file.read_exact(&mut sizes)?;
                let first = u64::from_be_bytes(sizes[0..8].try_into().unwrap());
                let other = u64::from_be_bytes(sizes[8..16].try_into().unwrap());
                let digits = u64::from_be_bytes(sizes[16..24].try_into().unwrap());
                self.opts.layout = if first != 0 && other != 0 {
                    SliceLayout::sliced(first, other)
                } else {
                    SliceLayout::unsliced()
                };
                self.opts.name.min_digits = digits as usize;
                FIRST_SLICE_HEADER_LEN
            }
            (n, FLAG_OTHER) if n > 1 => OTHER_SLICE_HEADER_LEN,
            _ => {
                return Err(Error::Data(format!(
                    "{file_name}: slice numbering does not match its header"
                )));
            }
        };

        // the last byte of the file is the continuation flag
        let file_len = file.skip_to_eof()?;
        if file_len < header_len + 1 {
            return Err(Error::Data(format!("{file_name}: truncated slice")));
        }
        file.skip(file_len - 1)?;
        let mut cont = [0u8; 1];
        file.read_exact(&mut cont)?;
        let last = match cont[0] {
            FLAG_LAST => true,
            FLAG_CONTINUES => false,
            _ => return Err(Error::Data(format!("{file_name}: bad continuation flag"))),
        };
        file.skip(header_len)?;
        self.read_slice = Some(ReadSlice {
            file,
            payload_len: file_len - header_len - 1,
            last,
        });
        self.current_num = num;
        Ok(())
    }

    fn read_state(&mut self) -> Result<&mut ReadSlice> {
        self.read_slice.as_mut().ok_or_else(Error::bug)
    }

    /// In-slice payload offset of the current read position.
    fn read_offset(&mut self) -> Result<u64> {
        let header = if self.current_num == 1 {
            self.opts.layout.first_slice_header
        } else {
            self.opts.layout.other_slice_header
        };
        let pos = self.read_state()?.file.position()?;
        Ok(pos - header)
    }
}

impl Layer for Slicer {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != Mode::Read {
            return Err(Error::bug());
        }
        let mut in_slice = self.read_offset()?;
        loop {
            let state = self.read_slice.as_mut().ok_or_else(Error::bug)?;
            if in_slice < state.payload_len {
                let room = (state.payload_len - in_slice).min(buf.len() as u64) as usize;
                let got = state.file.read(&mut buf[..room])?;
                if got == 0 {
                    return Err(Error::Data("slice shorter than advertised".into()));
                }
                self.logical += got as u64;
                return Ok(got);
            }
            if state.last {
                return Ok(0);
            }
            let next = self.current_num + 1;
            self.open_read_slice(next)?;
            in_slice = 0;
        }
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        if self.mode != Mode::Write || self.terminated {
            return Err(Error::bug());
        }
        while !buf.is_empty() {
            let capacity = self.payload_capacity(self.current_num);
            let room = capacity - self.write_filled;
            if room == 0 {
                self.close_write_slice(true)?;
                let next = self.current_num + 1;
                self.run_pause_command(next)?;
                self.open_write_slice(next)?;
                continue;
            }
            let chunk = (buf.len() as u64).min(room) as usize;
            self.write_slice
                .as_mut()
                .ok_or_else(Error::bug)?
                .write_all(&buf[..chunk])?;
            self.write_filled += chunk as u64;
            self.logical += chunk as u64;
            buf = &buf[chunk..];
        }
        Ok(())
    }

    fn skip(&mut self, pos: u64) -> Result<bool> {
        if self.mode != Mode::Read {
            // the write side only ever moves forward
            return Err(Error::bug());
        }
        let (num, in_slice) = self.opts.layout.which_slice(pos)?;
        if self.read_slice.is_none() || num != self.current_num {
            self.open_read_slice(num)?;
        }
        let state = self.read_state()?;
        if !state.file.skip(in_slice)? {
            return Ok(false);
        }
        self.logical = pos;
        Ok(true)
    }

    fn skip_to_eof(&mut self) -> Result<u64> {
        if self.mode == Mode::Write {
            return Ok(self.logical);
        }
        // walk to the final slice
        loop {
            let state = self.read_state()?;
            if state.last {
                break;
            }
            let next = self.current_num + 1;
            self.open_read_slice(next)?;
        }
        let state = self.read_slice.as_mut().ok_or_else(Error::bug)?;
        let payload = state.payload_len;
        let header = if self.current_num == 1 {
            self.opts.layout.first_slice_header
        } else {
            self.opts.layout.other_slice_header
        };
        state.file.skip(header + payload)?;
        self.logical = self
            .opts
            .layout
            .reconstruct_offset(self.current_num, header + payload);
        Ok(self.logical)
    }

    fn skippable(&self, _direction: SkipDirection, _amount: u64) -> bool {
        self.mode == Mode::Read
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.logical)
    }

    fn sync_write(&mut self) -> Result<()> {
        if let Some(slice) = self.write_slice.as_mut() {
            slice.sync_write()?;
        }
        Ok(())
    }

    fn flush_read(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::bug());
        }
        self.terminated = true;
        if self.mode == Mode::Write {
            self.close_write_slice(false)?;
        }
        self.read_slice = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entrepot::LocalEntrepot;

    #[test]
    fn which_slice_round_trip() {
        let layouts = [
            SliceLayout::sliced(1000, 500),
            SliceLayout::sliced(200, 200),
            SliceLayout::unsliced(),
        ];
        for layout in layouts {
            for offset in [0u64, 1, 100, 950, 951, 1000, 5000, 123_456] {
                let (num, in_slice) = layout.which_slice(offset).unwrap();
                assert_eq!(
                    layout.reconstruct_offset(num, in_slice),
                    offset,
                    "layout {layout:?} offset {offset}"
                );
            }
        }
    }

    #[test]
    fn slice_boundaries() {
        let layout = SliceLayout::sliced(100, 80);
        let in_first = 100 - FIRST_SLICE_HEADER_LEN - 1;
        let per_other = 80 - OTHER_SLICE_HEADER_LEN - 1;
        assert_eq!(layout.which_slice(0).unwrap(), (1, FIRST_SLICE_HEADER_LEN));
        assert_eq!(
            layout.which_slice(in_first - 1).unwrap(),
            (1, FIRST_SLICE_HEADER_LEN + in_first - 1)
        );
        assert_eq!(
            layout.which_slice(in_first).unwrap(),
            (2, OTHER_SLICE_HEADER_LEN)
        );
        assert_eq!(
            layout.which_slice(in_first + per_other).unwrap(),
            (3, OTHER_SLICE_HEADER_LEN)
        );
    }

    #[test]
    fn slice_names_are_zero_padded() {
        let mut name = SliceName::new("out");
        assert_eq!(name.file_name(7), "out.7.dar");
        name.min_digits = 3;
        assert_eq!(name.file_name(7), "out.007.dar");
        assert_eq!(name.file_name(1234), "out.1234.dar");
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("coffre-slice-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn write_then_read_across_slices() {
        let dir = scratch_dir();
        let label = Label::random();
        let layout = SliceLayout::sliced(100, 100);

        let data: Vec<u8> = (0..400u32).map(|i| (i % 251) as u8).collect();
        {
            let ent = Box::new(LocalEntrepot::new(&dir));
            let opts = SlicerOptions::new(SliceName::new("out"), layout, label);
            let mut slicer = Slicer::create(ent, opts).unwrap();
            slicer.write_all(&data).unwrap();
            slicer.terminate().unwrap();
            assert!(slicer.slice_count() > 1);
        }

        assert!(dir.join("out.1.dar").exists());
        assert!(dir.join("out.2.dar").exists());

        {
            let ent = Box::new(LocalEntrepot::new(&dir));
            let opts =
                SlicerOptions::new(SliceName::new("out"), SliceLayout::unsliced(), label);
            let mut slicer = Slicer::open(ent, opts).unwrap();
            assert_eq!(slicer.layout(), layout);
            assert_eq!(slicer.label(), label);

            let mut back = vec![0u8; data.len()];
            slicer.read_exact(&mut back).unwrap();
            assert_eq!(back, data);
            let mut probe = [0u8; 1];
            assert_eq!(slicer.read(&mut probe).unwrap(), 0);

            // random access across the slice boundary
            assert!(slicer.skip(150).unwrap());
            slicer.read_exact(&mut probe).unwrap();
            assert_eq!(probe[0], data[150]);

            assert_eq!(slicer.skip_to_eof().unwrap(), data.len() as u64);
            slicer.terminate().unwrap();
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
