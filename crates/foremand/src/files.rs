//! Small filesystem helpers shared by the record and key stores.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Replaces the file at `path` with `payload` in one atomic step.
///
/// The payload lands in a sibling temporary file first, owner-readable only,
/// and is renamed over the target after a sync. A crash mid-write leaves the
/// previous file intact, so readers see either the old payload or the new
/// one, never a truncated mix.
pub(crate) fn atomic_write(path: &Path, payload: &[u8]) -> io::Result<()> {
    let Some(directory) = path.parent() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot write to a path without a directory",
        ));
    };

    let mut staging = NamedTempFile::new_in(directory)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staging
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    staging.write_all(payload)?;
    staging.as_file().sync_all()?;
    staging.persist(path).map_err(|error| error.error)?;
    Ok(())
}
