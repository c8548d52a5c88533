//! Filesystem reading and writing.
//!
//! The backup side turns on-disk entries into catalogue items (metadata,
//! EA, FSA, hard-link discovery); the restore side does the inverse
//! (creation, ownership, permissions, timestamps). Data streaming with
//! sparse-run detection also lives here because backup, restore and test
//! share it.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;

use crate::crc::Crc;
use crate::ea::EaSet;
use crate::entry::{InodeAttr, InodePayload};
use crate::error::{Error, Result};
use crate::fsa::{Fsa, FsaFamily, FsaNature, FsaSet, FsaValue};
use crate::infinint;
use crate::layer::Layer;

/// ioctl macro: Command.
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
    };
}

/// ioctl command: read the ext-family inode flags.
const FS_IOC_GETFLAGS: libc::c_ulong = ioc!(2u64, 0x66u64, 1u64, 8u64);
/// ioctl command: write the ext-family inode flags.
const FS_IOC_SETFLAGS: libc::c_ulong = ioc!(1u64, 0x66u64, 2u64, 8u64);

/// ext-family inode flag bits.
const FL_IMMUTABLE: libc::c_long = 0x0000_0010;
const FL_APPEND: libc::c_long = 0x0000_0020;
const FL_NODUMP: libc::c_long = 0x0000_0040;
const FL_NOATIME: libc::c_long = 0x0000_0080;

fn cpath(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Range(format!("{}: path contains NUL", path.display())))
}

fn errno(context: &Path) -> Error {
    Error::system(
        context.display().to_string(),
        std::io::Error::last_os_error(),
    )
}

/// Identity of an on-disk inode, used to recognize hard links.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DevIno {
    pub dev: u64,
    pub ino: u64,
}

/// Map from filesystem inode to the etiquette assigned during a backup.
pub type HardLinkMap = HashMap<DevIno, u64>;

/// A filesystem entry as the backup walker sees it.
pub struct FsEntry {
    pub name: String,
    pub attr: InodeAttr,
    /// None for directories.
    pub payload: Option<InodePayload>,
    pub is_dir: bool,
    pub nlink: u64,
    pub id: DevIno,
}

/// Reads one entry's metadata without following symlinks.
pub fn read_entry(path: &Path) -> Result<FsEntry> {
    let meta = fs::symlink_metadata(path).map_err(|e| Error::system(path.display().to_string(), e))?;
    let name = path
        .file_name()
        .unwrap_or(OsStr::new("/"))
        .to_string_lossy()
        .into_owned();
    let attr = InodeAttr {
        uid: meta.uid() as u64,
        gid: meta.gid() as u64,
        perm: (meta.mode() & 0o7777) as u16,
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        dev: meta.dev(),
        ..Default::default()
    };
    let ft = meta.file_type();
    let payload = if ft.is_dir() {
        None
    } else if ft.is_file() {
        Some(InodePayload::File(crate::entry::FileData {
            size: meta.len(),
            ..Default::default()
        }))
    } else if ft.is_symlink() {
        let target = fs::read_link(path)
            .map_err(|e| Error::system(path.display().to_string(), e))?
            .to_string_lossy()
            .into_owned();
        Some(InodePayload::Symlink { target })
    } else if ft.is_block_device() {
        Some(InodePayload::Block {
            major: libc::major(meta.rdev()) as u64,
            minor: libc::minor(meta.rdev()) as u64,
        })
    } else if ft.is_char_device() {
        Some(InodePayload::Char {
            major: libc::major(meta.rdev()) as u64,
            minor: libc::minor(meta.rdev()) as u64,
        })
    } else if ft.is_fifo() {
        Some(InodePayload::Pipe)
    } else if ft.is_socket() {
        Some(InodePayload::Socket)
    } else {
        return Err(Error::Range(format!(
            "{}: unsupported file type",
            path.display()
        )));
    };
    Ok(FsEntry {
        name,
        attr,
        payload,
        is_dir: ft.is_dir(),
        nlink: meta.nlink(),
        id: DevIno {
            dev: meta.dev(),
            ino: meta.ino(),
        },
    })
}

/// Lists a directory's children sorted by name, for deterministic archives.
pub fn sorted_dir_entries(path: &Path) -> Result<Vec<std::ffi::OsString>> {
    let mut names = Vec::new();
    let iter = fs::read_dir(path).map_err(|e| Error::system(path.display().to_string(), e))?;
    for entry in iter {
        let entry = entry.map_err(|e| Error::system(path.display().to_string(), e))?;
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

/// Reads the extended attributes of an entry (without following symlinks).
pub fn read_ea(path: &Path) -> Result<EaSet> {
    let c = cpath(path)?;
    let mut set = EaSet::new();
    let list_len = unsafe { libc::llistxattr(c.as_ptr(), std::ptr::null_mut(), 0) };
    if list_len < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            // filesystem without EA support counts as "none"
            Some(code) if code == libc::ENOTSUP || code == libc::ENOSYS => Ok(set),
            _ => Err(Error::system(path.display().to_string(), err)),
        };
    }
    if list_len == 0 {
        return Ok(set);
    }
    let mut names = vec![0u8; list_len as usize];
    let got = unsafe {
        libc::llistxattr(c.as_ptr(), names.as_mut_ptr() as *mut libc::c_char, names.len())
    };
    if got < 0 {
        return Err(errno(path));
    }
    names.truncate(got as usize);
    for raw_name in names.split(|b| *b == 0).filter(|s| !s.is_empty()) {
        let Ok(name) = std::str::from_utf8(raw_name) else {
            continue;
        };
        let cname = CString::new(raw_name).map_err(|_| Error::bug())?;
        let value_len =
            unsafe { libc::lgetxattr(c.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
        if value_len < 0 {
            continue;
        }
        let mut value = vec![0u8; value_len as usize];
        let got = unsafe {
            libc::lgetxattr(
                c.as_ptr(),
                cname.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if got < 0 {
            continue;
        }
        value.truncate(got as usize);
        set.add(name, value);
    }
    Ok(set)
}

/// Writes extended attributes onto an entry.
pub fn write_ea(path: &Path, set: &EaSet) -> Result<()> {
    let c = cpath(path)?;
    for (name, value) in set.iter() {
        let cname =
            CString::new(name).map_err(|_| Error::Range("EA name contains NUL".into()))?;
        let ret = unsafe {
            libc::lsetxattr(
                c.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(errno(path));
        }
    }
    Ok(())
}

/// Removes one extended attribute from an entry.
pub fn remove_ea(path: &Path, name: &str) -> Result<()> {
    let c = cpath(path)?;
    let cname = CString::new(name).map_err(|_| Error::Range("EA name contains NUL".into()))?;
    let ret = unsafe { libc::lremovexattr(c.as_ptr(), cname.as_ptr()) };
    if ret < 0 {
        return Err(errno(path));
    }
    Ok(())
}

/// Reads the ext-family inode flags of a plain file or directory.
fn ext_flags(path: &Path) -> Option<libc::c_long> {
    let file = File::open(path).ok()?;
    let mut flags: libc::c_long = 0;
    let ret = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&file),
            FS_IOC_GETFLAGS as _,
            &mut flags,
        )
    };
    (ret == 0).then_some(flags)
}

/// The nodump flag, honored by backups configured to skip flagged files.
pub fn has_nodump_flag(path: &Path) -> bool {
    ext_flags(path).is_some_and(|flags| flags & FL_NODUMP != 0)
}

/// Captures the FSA of an entry for the active family scope.
pub fn read_fsa(path: &Path, scope_ext: bool) -> FsaSet {
    let mut set = FsaSet::new();
    if !scope_ext {
        return set;
    }
    let Some(flags) = ext_flags(path) else {
        return set;
    };
    for (bit, nature) in [
        (FL_APPEND, FsaNature::AppendOnly),
        (FL_IMMUTABLE, FsaNature::Immutable),
        (FL_NODUMP, FsaNature::NoDump),
        (FL_NOATIME, FsaNature::NoAtime),
    ] {
        if flags & bit != 0 {
            set.push(Fsa {
                family: FsaFamily::LinuxExtX,
                nature,
                value: FsaValue::Bool(true),
            });
        }
    }
    set
}

/// Applies stored FSA back onto an entry. Unsupported natures are skipped
/// with a warning rather than failing the restore.
pub fn write_fsa(path: &Path, set: &FsaSet) -> Result<()> {
    let mut flags: libc::c_long = 0;
    let mut any = false;
    for fsa in set.iter() {
        match (fsa.family, fsa.nature, fsa.value) {
            (FsaFamily::LinuxExtX, FsaNature::AppendOnly, FsaValue::Bool(true)) => {
                flags |= FL_APPEND;
                any = true;
            }
            (FsaFamily::LinuxExtX, FsaNature::Immutable, FsaValue::Bool(true)) => {
                flags |= FL_IMMUTABLE;
                any = true;
            }
            (FsaFamily::LinuxExtX, FsaNature::NoDump, FsaValue::Bool(true)) => {
                flags |= FL_NODUMP;
                any = true;
            }
            (FsaFamily::LinuxExtX, FsaNature::NoAtime, FsaValue::Bool(true)) => {
                flags |= FL_NOATIME;
                any = true;
            }
            (family, nature, _) => {
                log::warn!(
                    "{}: FSA {family:?}/{nature:?} not applicable on this system",
                    path.display()
                );
            }
        }
    }
    if !any {
        return Ok(());
    }
    let file = File::open(path).map_err(|e| Error::system(path.display().to_string(), e))?;
    let ret = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&file),
            FS_IOC_SETFLAGS as _,
            &flags,
        )
    };
    if ret != 0 {
        return Err(errno(path));
    }
    Ok(())
}

/// Restores ownership, permissions and timestamps.
///
/// Ownership is skipped when `set_owner` is false; its failures are
/// tolerated when not running as root (`tolerant`).
pub fn write_metadata(
    path: &Path,
    attr: &InodeAttr,
    is_symlink: bool,
    set_owner: bool,
    tolerant: bool,
) -> Result<()> {
    let c = cpath(path)?;
    if set_owner {
        let ret =
            unsafe { libc::lchown(c.as_ptr(), attr.uid as libc::uid_t, attr.gid as libc::gid_t) };
        if ret < 0 && !tolerant {
            return Err(errno(path));
        }
    }
    if !is_symlink {
        fs::set_permissions(path, fs::Permissions::from_mode(attr.perm as u32))
            .map_err(|e| Error::system(path.display().to_string(), e))?;
    }
    let times = [
        libc::timespec {
            tv_sec: attr.atime,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: attr.mtime,
            tv_nsec: 0,
        },
    ];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret < 0 {
        return Err(errno(path));
    }
    Ok(())
}

/// Creates a non-file, non-directory node.
pub fn create_special(path: &Path, payload: &InodePayload, perm: u16) -> Result<()> {
    let c = cpath(path)?;
    let ret = match payload {
        InodePayload::Symlink { target } => {
            let t = CString::new(target.as_bytes())
                .map_err(|_| Error::Range("symlink target contains NUL".into()))?;
            unsafe { libc::symlink(t.as_ptr(), c.as_ptr()) }
        }
        InodePayload::Block { major, minor } => unsafe {
            libc::mknod(
                c.as_ptr(),
                libc::S_IFBLK | perm as libc::mode_t,
                libc::makedev(*major as _, *minor as _),
            )
        },
        InodePayload::Char { major, minor } => unsafe {
            libc::mknod(
                c.as_ptr(),
                libc::S_IFCHR | perm as libc::mode_t,
                libc::makedev(*major as _, *minor as _),
            )
        },
        InodePayload::Pipe => unsafe { libc::mkfifo(c.as_ptr(), perm as libc::mode_t) },
        InodePayload::Socket | InodePayload::Door => {
            return Err(Error::Feature("restoring sockets or doors"));
        }
        InodePayload::File(_) => return Err(Error::bug()),
    };
    if ret < 0 {
        return Err(errno(path));
    }
    Ok(())
}

/// Buffer used by the streaming helpers.
const COPY_BUFFER: usize = 65_536;

/// Outcome of [`save_data`].
pub struct SavedData {
    /// Logical bytes read from the source.
    pub size: u64,
    pub crc: Crc,
    /// Whether the hole/bytes layout was used.
    pub sparse: bool,
}

/// Streams a file's bytes into the archive.
///
/// With a sparse threshold, zero runs of at least that many bytes become
/// hole records: the data is stored as (hole length, byte count, bytes)
/// tuples, with a final zero-count tuple carrying a trailing hole. The
/// checksum always covers the logical bytes, holes included.
pub fn save_data(
    source: &mut File,
    dest: &mut dyn Layer,
    expected_size: u64,
    sparse_threshold: Option<u64>,
) -> Result<SavedData> {
    let mut crc = Crc::for_size(expected_size);
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;

    match sparse_threshold {
        None => loop {
            let got = source.read(&mut buf).map_err(Error::from)?;
            if got == 0 {
                break;
            }
            crc.add(&buf[..got]);
            dest.write_all(&buf[..got])?;
            size += got as u64;
        },
        Some(threshold) => {
            let threshold = threshold.max(1);
            // hole waiting to prefix the next literal tuple
            let mut hole = 0u64;
            // zeros seen since the last literal byte, not yet classified
            let mut zero_run = 0u64;
            let mut literal: Vec<u8> = Vec::with_capacity(COPY_BUFFER);

            fn flush_literal(
                dest: &mut dyn Layer,
                hole: &mut u64,
                literal: &mut Vec<u8>,
            ) -> Result<()> {
                if literal.is_empty() {
                    return Ok(());
                }
                infinint::dump_u64(dest, *hole)?;
                infinint::dump_u64(dest, literal.len() as u64)?;
                dest.write_all(literal)?;
                *hole = 0;
                literal.clear();
                Ok(())
            }

            loop {
                let got = source.read(&mut buf).map_err(Error::from)?;
                if got == 0 {
                    break;
                }
                let chunk = &buf[..got];
                crc.add(chunk);
                size += got as u64;
                let mut at = 0;
                while at < chunk.len() {
                    if chunk[at] == 0 {
                        let zeros = chunk[at..].iter().take_while(|b| **b == 0).count();
                        zero_run += zeros as u64;
                        at += zeros;
                        continue;
                    }
                    if zero_run >= threshold {
                        flush_literal(dest, &mut hole, &mut literal)?;
                        hole += zero_run;
                    } else {
                        literal.resize(literal.len() + zero_run as usize, 0);
                    }
                    zero_run = 0;
                    let data = chunk[at..].iter().take_while(|b| **b != 0).count();
                    literal.extend_from_slice(&chunk[at..at + data]);
                    at += data;
                    if literal.len() >= COPY_BUFFER {
                        flush_literal(dest, &mut hole, &mut literal)?;
                    }
                }
            }
            if zero_run >= threshold {
                flush_literal(dest, &mut hole, &mut literal)?;
                hole += zero_run;
            } else {
                literal.resize(literal.len() + zero_run as usize, 0);
            }
            flush_literal(dest, &mut hole, &mut literal)?;
            // terminating tuple, carrying any trailing hole
            infinint::dump_u64(dest, hole)?;
            infinint::dump_u64(dest, 0)?;
        }
    }
    Ok(SavedData {
        size,
        crc,
        sparse: sparse_threshold.is_some(),
    })
}

/// Reads a file's bytes back from the archive, recomputing the checksum.
///
/// `dest` is None when only verifying. Returns the recomputed checksum.
pub fn load_data(
    source: &mut dyn Layer,
    mut dest: Option<&mut File>,
    size: u64,
    sparse: bool,
) -> Result<Crc> {
    let mut crc = Crc::for_size(size);
    let mut buf = vec![0u8; COPY_BUFFER];
    if !sparse {
        let mut left = size;
        while left > 0 {
            let want = (left).min(buf.len() as u64) as usize;
            source.read_exact(&mut buf[..want])?;
            crc.add(&buf[..want]);
            if let Some(out) = dest.as_deref_mut() {
                out.write_all(&buf[..want]).map_err(Error::from)?;
            }
            left -= want as u64;
        }
        return Ok(crc);
    }

    let mut materialized = 0u64;
    loop {
        let hole = infinint::read_u64(source)?;
        let count = infinint::read_u64(source)?;
        crc.add_zeros(hole);
        materialized += hole;
        if let Some(out) = dest.as_deref_mut() {
            if hole > 0 {
                out.seek(SeekFrom::Current(hole as i64)).map_err(Error::from)?;
            }
        }
        if count == 0 {
            break;
        }
        let mut left = count;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            source.read_exact(&mut buf[..want])?;
            crc.add(&buf[..want]);
            if let Some(out) = dest.as_deref_mut() {
                out.write_all(&buf[..want]).map_err(Error::from)?;
            }
            left -= want as u64;
        }
        materialized += count;
    }
    if materialized != size {
        return Err(Error::Data(format!(
            "sparse stream materialized {materialized} bytes, expected {size}"
        )));
    }
    if let Some(out) = dest.as_deref_mut() {
        // give the file its full length even when it ends on a hole
        out.set_len(size).map_err(Error::from)?;
    }
    Ok(crc)
}

/// Copies one entry's data stream between two archive stacks, recomputing
/// the logical checksum. Sparse streams are re-emitted tuple by tuple.
pub fn copy_data(
    source: &mut dyn Layer,
    dest: &mut dyn Layer,
    size: u64,
    sparse: bool,
) -> Result<Crc> {
    let mut crc = Crc::for_size(size);
    let mut buf = vec![0u8; COPY_BUFFER];
    if !sparse {
        let mut left = size;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            source.read_exact(&mut buf[..want])?;
            crc.add(&buf[..want]);
            dest.write_all(&buf[..want])?;
            left -= want as u64;
        }
        return Ok(crc);
    }
    loop {
        let hole = infinint::read_u64(source)?;
        let count = infinint::read_u64(source)?;
        infinint::dump_u64(dest, hole)?;
        infinint::dump_u64(dest, count)?;
        crc.add_zeros(hole);
        if count == 0 {
            break;
        }
        let mut left = count;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            source.read_exact(&mut buf[..want])?;
            crc.add(&buf[..want]);
            dest.write_all(&buf[..want])?;
            left -= want as u64;
        }
    }
    Ok(crc)
}

/// Like [`copy_data`] for a stream whose length is unknown: plain data is
/// copied until the source stops (a tape mark or end of stream), sparse
/// tuples until their terminator. Returns (logical size, checksum).
pub fn copy_until_end(
    source: &mut dyn Layer,
    dest: &mut dyn Layer,
    sparse: bool,
) -> Result<(u64, Crc)> {
    let mut buf = vec![0u8; COPY_BUFFER];
    if !sparse {
        let mut bytes = Vec::new();
        loop {
            let got = source.read(&mut buf)?;
            if got == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..got]);
        }
        let mut crc = Crc::for_size(bytes.len() as u64);
        crc.add(&bytes);
        dest.write_all(&bytes)?;
        return Ok((bytes.len() as u64, crc));
    }
    // sparse tuples are self-delimiting; the checksum width is sized once
    // the logical size is known, so fold into the widest and fold down
    let mut crc = Crc::new(8);
    let mut size = 0u64;
    loop {
        let hole = infinint::read_u64(source)?;
        let count = infinint::read_u64(source)?;
        infinint::dump_u64(dest, hole)?;
        infinint::dump_u64(dest, count)?;
        crc.add_zeros(hole);
        size += hole;
        if count == 0 {
            break;
        }
        let mut left = count;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            source.read_exact(&mut buf[..want])?;
            crc.add(&buf[..want]);
            dest.write_all(&buf[..want])?;
            left -= want as u64;
        }
        size += count;
    }
    Ok((size, crc.fold_to(crate::crc::width_for_size(size))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{MemoryLayer, Mode};
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("coffre-fsio-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn metadata_round_trip() {
        let dir = scratch_dir();
        let file = dir.join("x");
        fs::write(&file, b"abc").unwrap();
        let entry = read_entry(&file).unwrap();
        assert_eq!(entry.name, "x");
        assert!(!entry.is_dir);
        match entry.payload {
            Some(InodePayload::File(ref d)) => assert_eq!(d.size, 3),
            _ => panic!("expected a file payload"),
        }
        assert!(entry.nlink >= 1);

        let mut attr = entry.attr.clone();
        attr.perm = 0o600;
        attr.mtime = 1_000_000;
        attr.atime = 1_000_000;
        write_metadata(&file, &attr, false, true, true).unwrap();
        let again = read_entry(&file).unwrap();
        assert_eq!(again.attr.perm, 0o600);
        assert_eq!(again.attr.mtime, 1_000_000);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn plain_data_round_trip() {
        let dir = scratch_dir();
        let src_path = dir.join("src");
        fs::write(&src_path, b"hello world").unwrap();

        let mut archive = MemoryLayer::new(Mode::ReadWrite);
        let mut src = File::open(&src_path).unwrap();
        let saved = save_data(&mut src, &mut archive, 11, None).unwrap();
        assert_eq!(saved.size, 11);
        assert!(!saved.sparse);

        archive.skip(0).unwrap();
        let dst_path = dir.join("dst");
        let mut dst = File::create(&dst_path).unwrap();
        let crc = load_data(&mut archive, Some(&mut dst), 11, false).unwrap();
        drop(dst);
        assert_eq!(crc.value(), saved.crc.value());
        assert_eq!(fs::read(&dst_path).unwrap(), b"hello world");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn sparse_data_round_trip() {
        let dir = scratch_dir();
        let src_path = dir.join("sparse");
        // non-zero byte, a large zero region, then another byte
        let mut content = vec![0u8; 100_000];
        content[0] = b'A';
        content[99_999] = b'Z';
        fs::write(&src_path, &content).unwrap();

        let mut archive = MemoryLayer::new(Mode::ReadWrite);
        let mut src = File::open(&src_path).unwrap();
        let saved = save_data(&mut src, &mut archive, 100_000, Some(15)).unwrap();
        assert_eq!(saved.size, 100_000);
        assert!(saved.sparse);
        // the stored form is far smaller than the logical bytes
        assert!(archive.position().unwrap() < 1_000);

        archive.skip(0).unwrap();
        let dst_path = dir.join("restored");
        let mut dst = File::create(&dst_path).unwrap();
        let crc = load_data(&mut archive, Some(&mut dst), 100_000, true).unwrap();
        drop(dst);
        assert_eq!(crc.value(), saved.crc.value());
        assert_eq!(fs::read(&dst_path).unwrap(), content);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn sparse_stream_with_trailing_hole() {
        let dir = scratch_dir();
        let src_path = dir.join("tail");
        let mut content = vec![0u8; 5000];
        content[10] = 1;
        fs::write(&src_path, &content).unwrap();

        let mut archive = MemoryLayer::new(Mode::ReadWrite);
        let mut src = File::open(&src_path).unwrap();
        let saved = save_data(&mut src, &mut archive, 5000, Some(15)).unwrap();
        assert_eq!(saved.size, 5000);

        archive.skip(0).unwrap();
        let dst_path = dir.join("back");
        let mut dst = File::create(&dst_path).unwrap();
        load_data(&mut archive, Some(&mut dst), 5000, true).unwrap();
        drop(dst);
        let back = fs::read(&dst_path).unwrap();
        assert_eq!(back.len(), 5000);
        assert_eq!(back, content);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn special_nodes_and_dirs() {
        let dir = scratch_dir();
        let link = dir.join("link");
        create_special(
            &link,
            &InodePayload::Symlink {
                target: "a.txt".into(),
            },
            0o777,
        )
        .unwrap();
        let entry = read_entry(&link).unwrap();
        match entry.payload {
            Some(InodePayload::Symlink { ref target }) => assert_eq!(target, "a.txt"),
            _ => panic!("expected a symlink"),
        }

        let fifo = dir.join("fifo");
        create_special(&fifo, &InodePayload::Pipe, 0o600).unwrap();
        let entry = read_entry(&fifo).unwrap();
        assert!(matches!(entry.payload, Some(InodePayload::Pipe)));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn ea_round_trip_when_supported() {
        let dir = scratch_dir();
        let file = dir.join("attrs");
        fs::write(&file, b"x").unwrap();
        let mut set = EaSet::new();
        set.add("user.coffre-test", b"value".to_vec());
        match write_ea(&file, &set) {
            Ok(()) => {
                let back = read_ea(&file).unwrap();
                assert_eq!(back.get("user.coffre-test"), Some(b"value".as_slice()));
            }
            // tmpfs without user xattr support: nothing to verify
            Err(Error::System { .. } | Error::Hardware { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
