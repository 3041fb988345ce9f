//! Temp-file staging for callers that hold UDF bytes rather than paths.
//!
//! The blob writes the bytes to a private temp file with owner
//! read+execute permissions and removes the file when dropped, so a load
//! that fails halfway never leaves an executable lying in `/tmp`.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::NamedTempFile;

/// A UDF binary staged as a self-deleting temp file.
#[derive(Debug)]
pub struct UdfBlob {
    file: NamedTempFile,
}

impl UdfBlob {
    /// Stages `bytes` into a fresh temp file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be created,
    /// written, or chmod'd.
    pub fn create(bytes: &[u8]) -> std::io::Result<Self> {
        let mut file = NamedTempFile::with_prefix("kiln_udf_")?;
        file.write_all(bytes)?;
        file.flush()?;
        let perms = std::fs::Permissions::from_mode(0o500);
        std::fs::set_permissions(file.path(), perms)?;
        Ok(Self { file })
    }

    /// Path of the staged file; valid until the blob is dropped.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
