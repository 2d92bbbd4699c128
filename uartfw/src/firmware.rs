//! Firmware image naming, package resolution and transfer sizing.
//!
//! The bootloader only accepts application images named `app<something>.bin`.
//! Release bundles named `package<something>.zip` carry such an image and are
//! unpacked through a [`PackageExtractor`] supplied by the caller.

use crate::error::{Error, Result};
use log::debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Approximate throughput of a YMODEM transfer at 115200 baud, bytes/second.
pub const TRANSFER_RATE: f64 = 8000.0;

/// Lower bound of any transfer timeout.
pub const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// File stored by `remove_app` in place of the application.
pub const EMPTY_APP_NAME: &str = "app_empty.bin";

/// Contents of [`EMPTY_APP_NAME`].
pub const EMPTY_APP_CONTENTS: &[u8] = b"void\n";

fn matches_pattern(name: &str, prefix: &str, suffix: &str) -> bool {
    name.len() > prefix.len() + suffix.len() && name.starts_with(prefix) && name.ends_with(suffix)
}

/// File name component of `path`, lossily decoded.
fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether `name` is an application image name (`app<something>.bin`).
pub fn is_firmware_name(name: &str) -> bool {
    matches_pattern(name, "app", ".bin")
}

/// Whether `name` is a firmware bundle name (`package<something>.zip`).
pub fn is_package_name(name: &str) -> bool {
    matches_pattern(name, "package", ".zip")
}

/// Reject anything that is not an application image name.
pub fn validate_firmware_name(path: &Path) -> Result<()> {
    let name = file_name(path);
    if is_firmware_name(&name) {
        Ok(())
    } else {
        Err(Error::InvalidBinaryName(name))
    }
}

/// Unpacks a firmware bundle into an application image.
pub trait PackageExtractor {
    /// Extract `package` and return the path of the contained image.
    ///
    /// The returned path must stay valid for as long as the extractor lives.
    fn extract(&mut self, package: &Path) -> Result<PathBuf>;
}

/// Resolve what `flash` should transfer for `path`.
///
/// Packages go through `extractor`; plain files must carry an application
/// image name. Nothing here touches the serial link.
pub fn resolve_firmware(path: &Path, extractor: Option<&mut dyn PackageExtractor>) -> Result<PathBuf> {
    let name = file_name(path);

    if is_package_name(&name) {
        let extractor = extractor.ok_or_else(|| {
            Error::Package(format!("cannot unpack \"{name}\": no package extractor configured"))
        })?;
        let image = extractor.extract(path)?;
        debug!("Package {name} resolved to {}", image.display());
        return Ok(image);
    }

    validate_firmware_name(path)?;
    Ok(path.to_path_buf())
}

/// Transfer timeout for a file of `size` bytes: `max(5, size / 8000 + 1)` seconds.
pub fn transfer_timeout(size: u64) -> Duration {
    let secs = size as f64 / TRANSFER_RATE + 1.0;
    Duration::from_secs_f64(secs).max(MIN_TRANSFER_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_names() {
        assert!(is_firmware_name("app_main.bin"));
        assert!(is_firmware_name("app1.bin"));
        assert!(!is_firmware_name("app.bin"));
        assert!(!is_firmware_name("main.bin"));
        assert!(!is_firmware_name("app_main.hex"));
        assert!(!is_firmware_name("my_app_main.bin"));
    }

    #[test]
    fn test_validate_uses_file_name_only() {
        assert!(validate_firmware_name(Path::new("build/release/app_main.bin")).is_ok());
        match validate_firmware_name(Path::new("app_dir/firmware.bin")) {
            Err(Error::InvalidBinaryName(name)) => assert_eq!(name, "firmware.bin"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_package_names() {
        assert!(is_package_name("package_v1.2.zip"));
        assert!(!is_package_name("package.zip"));
        assert!(!is_package_name("app_main.zip"));
    }

    struct FixedExtractor(PathBuf);

    impl PackageExtractor for FixedExtractor {
        fn extract(&mut self, _package: &Path) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_resolve_firmware() {
        let plain = resolve_firmware(Path::new("app_x.bin"), None).unwrap();
        assert_eq!(plain, PathBuf::from("app_x.bin"));

        let mut extractor = FixedExtractor(PathBuf::from("/tmp/unpacked/app_y.bin"));
        let image = resolve_firmware(Path::new("dist/package_1.zip"), Some(&mut extractor)).unwrap();
        assert_eq!(image, PathBuf::from("/tmp/unpacked/app_y.bin"));

        assert!(matches!(
            resolve_firmware(Path::new("package_1.zip"), None),
            Err(Error::Package(_))
        ));
        assert!(matches!(
            resolve_firmware(Path::new("firmware.elf"), None),
            Err(Error::InvalidBinaryName(_))
        ));
    }

    #[test]
    fn test_transfer_timeout() {
        assert_eq!(transfer_timeout(40_000), Duration::from_secs(6));
        assert_eq!(transfer_timeout(100), Duration::from_secs(5));
        assert_eq!(transfer_timeout(0), Duration::from_secs(5));
        assert_eq!(transfer_timeout(80_000), Duration::from_secs(11));
        assert!(transfer_timeout(36_000) > Duration::from_millis(5_499));
    }
}
