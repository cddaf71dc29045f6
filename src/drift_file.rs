//! Persistence of the absolute frequency and skew across restarts.
//!
//! The file holds a single human-editable line, `freq_ppm skew_ppm`, and is
//! replaced atomically: a partial write must never become visible, because a
//! garbage frequency applied at startup can take hours to slew back out.

use anyhow::{Context, Result};
use log::warn;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Read a previously stored `(freq_ppm, skew_ppm)` pair. Anything that does
/// not parse as exactly two floats discards the attempt with a warning.
pub fn load(path: &Path) -> Option<(f64, f64)> {
    let content = fs::read_to_string(path).ok()?;
    let mut fields = content.split_whitespace();
    let freq = fields.next().and_then(|s| s.parse::<f64>().ok());
    let skew = fields.next().and_then(|s| s.parse::<f64>().ok());
    match (freq, skew, fields.next()) {
        (Some(freq), Some(skew), None) => Some((freq, skew)),
        _ => {
            warn!("Could not parse drift file {}", path.display());
            None
        }
    }
}

/// Atomically rewrite the drift file with the current absolute frequency
/// (ppm) and skew (dimensionless). On any failure the existing file is left
/// untouched.
pub fn store(path: &Path, freq_ppm: f64, skew: f64) {
    let tmp = tmp_path(path);
    if let Err(e) = try_store(path, &tmp, freq_ppm, skew) {
        warn!("Could not update drift file {}: {}", path.display(), e);
        let _ = fs::remove_file(&tmp);
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn try_store(path: &Path, tmp: &Path, freq_ppm: f64, skew: f64) -> Result<()> {
    let mut file = File::create(tmp).context("create")?;
    writeln!(file, "{:20.6} {:20.6}", freq_ppm, skew * 1.0e6).context("write")?;
    file.sync_all().context("sync")?;
    drop(file);

    // Keep the ownership and permissions the operator gave the old file.
    #[cfg(unix)]
    if let Ok(meta) = fs::metadata(path) {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        nix::unistd::chown(
            tmp,
            Some(nix::unistd::Uid::from_raw(meta.uid())),
            Some(nix::unistd::Gid::from_raw(meta.gid())),
        )
        .context("chown")?;
        fs::set_permissions(tmp, fs::Permissions::from_mode(meta.mode() & 0o777))
            .context("chmod")?;
    }

    fs::rename(tmp, path).context("rename")?;
    Ok(())
}
