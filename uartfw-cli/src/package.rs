//! Firmware package (`package*.zip`) extraction.

use log::debug;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uartfw::{Error, PackageExtractor};

/// Unpacks packages into temporary directories that live as long as the extractor.
#[derive(Default)]
pub struct ZipPackageExtractor {
    dirs: Vec<TempDir>,
}

impl ZipPackageExtractor {
    /// Create an extractor with no unpacked packages.
    pub fn new() -> Self {
        Self::default()
    }
}

fn package_error(package: &Path, err: impl std::fmt::Display) -> Error {
    Error::Package(format!("{}: {err}", package.display()))
}

/// First `*.bin` at the top of `dir`, by name.
fn find_image(dir: &Path) -> uartfw::Result<Option<PathBuf>> {
    let mut images = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "bin"))
        .collect::<Vec<_>>();
    images.sort();
    Ok(images.into_iter().next())
}

impl PackageExtractor for ZipPackageExtractor {
    fn extract(&mut self, package: &Path) -> uartfw::Result<PathBuf> {
        let file = File::open(package).map_err(|_| Error::FileNotFound(package.to_path_buf()))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| package_error(package, e))?;

        let dir = tempfile::Builder::new().prefix("uartfw-pkg-").tempdir()?;
        archive
            .extract(dir.path())
            .map_err(|e| package_error(package, e))?;

        let image = find_image(dir.path())?
            .ok_or_else(|| package_error(package, "no .bin image at the top level"))?;
        debug!("Unpacked {} to {}", package.display(), image.display());

        self.dirs.push(dir);
        Ok(image)
    }
}
