//! Storage backend abstraction.
//!
//! The slicer does not touch the filesystem directly: it opens, removes and
//! lists slice files through an [`Entrepot`]. The crate ships the local
//! filesystem implementation; remote backends (SFTP, FTP) plug in behind the
//! same trait.

use std::fs::{self, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::layer::{FileLayer, Layer, Mode};

/// How [`Entrepot::open`] must behave regarding existing files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenHow {
    pub mode: Mode,
    /// Permission bits for newly created files.
    pub permission: u32,
    /// Fail with a system error when the file already exists.
    pub fail_if_exists: bool,
    /// Truncate an existing file.
    pub erase: bool,
}

/// An opaque location where slice files live.
pub trait Entrepot {
    /// Opens (or creates) a file relative to the location.
    fn open(&self, name: &Path, how: OpenHow) -> Result<Box<dyn Layer>>;

    /// Removes a file.
    fn unlink(&self, name: &Path) -> Result<()>;

    /// Lists the file names present at the location.
    fn list(&self) -> Result<Vec<String>>;

    /// Changes ownership of a file, by user and group name or numeric id.
    fn change_ownership(&self, name: &Path, user: &str, group: &str) -> Result<()>;

    /// Changes permission bits of a file.
    fn change_permission(&self, name: &Path, permission: u32) -> Result<()>;

    /// Where this location points, for display purposes.
    fn location(&self) -> String;
}

/// Local directory implementation.
pub struct LocalEntrepot {
    root: PathBuf,
}

impl LocalEntrepot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full(&self, name: &Path) -> PathBuf {
        self.root.join(name)
    }
}

/// Parses a user or group given either as a name or as a numeric id.
fn resolve_id(ident: &str, user: bool) -> Result<u32> {
    if let Ok(id) = ident.parse::<u32>() {
        return Ok(id);
    }
    let c = std::ffi::CString::new(ident)
        .map_err(|_| Error::Range(format!("invalid name `{ident}`")))?;
    unsafe {
        if user {
            let pw = libc::getpwnam(c.as_ptr());
            if pw.is_null() {
                return Err(Error::Range(format!("unknown user `{ident}`")));
            }
            Ok((*pw).pw_uid)
        } else {
            let gr = libc::getgrnam(c.as_ptr());
            if gr.is_null() {
                return Err(Error::Range(format!("unknown group `{ident}`")));
            }
            Ok((*gr).gr_gid)
        }
    }
}

impl Entrepot for LocalEntrepot {
    fn open(&self, name: &Path, how: OpenHow) -> Result<Box<dyn Layer>> {
        let path = self.full(name);
        let mut opts = OpenOptions::new();
        match how.mode {
            Mode::Read => {
                opts.read(true);
            }
            Mode::Write => {
                opts.write(true).create(true);
            }
            Mode::ReadWrite => {
                opts.read(true).write(true).create(true);
            }
        }
        if how.fail_if_exists {
            opts.create_new(true);
        }
        if how.erase {
            opts.truncate(true);
        }
        if how.mode != Mode::Read {
            opts.mode(how.permission);
        }
        let file = opts
            .open(&path)
            .map_err(|e| Error::system(path.display().to_string(), e))?;
        Ok(Box::new(FileLayer::new(file, path, how.mode)))
    }

    fn unlink(&self, name: &Path) -> Result<()> {
        let path = self.full(name);
        fs::remove_file(&path).map_err(|e| Error::system(path.display().to_string(), e))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::system(self.root.display().to_string(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::system(self.root.display().to_string(), e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn change_ownership(&self, name: &Path, user: &str, group: &str) -> Result<()> {
        let path = self.full(name);
        let uid = resolve_id(user, true)?;
        let gid = resolve_id(group, false)?;
        let c = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Range("path contains NUL".into()))?;
        let ret = unsafe { libc::chown(c.as_ptr(), uid, gid) };
        if ret < 0 {
            return Err(Error::system(
                path.display().to_string(),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn change_permission(&self, name: &Path, permission: u32) -> Result<()> {
        let path = self.full(name);
        fs::set_permissions(&path, fs::Permissions::from_mode(permission))
            .map_err(|e| Error::system(path.display().to_string(), e))
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("coffre-ent-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn open_write_list_unlink() {
        let dir = scratch_dir();
        let ent = LocalEntrepot::new(&dir);
        let how = OpenHow {
            mode: Mode::Write,
            permission: 0o644,
            fail_if_exists: false,
            erase: true,
        };
        let mut f = ent.open(Path::new("slice.1"), how).unwrap();
        f.write_all(b"payload").unwrap();
        f.terminate().unwrap();
        drop(f);

        assert_eq!(ent.list().unwrap(), vec!["slice.1".to_string()]);

        // fail_if_exists honored
        let strict = OpenHow {
            fail_if_exists: true,
            ..how
        };
        assert!(ent.open(Path::new("slice.1"), strict).is_err());

        ent.unlink(Path::new("slice.1")).unwrap();
        assert!(ent.list().unwrap().is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }
}
