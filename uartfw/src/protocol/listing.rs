//! Parser for the bootloader's `getlist` output.
//!
//! Each stored file is reported on its own line as `<name>, size: <digits>`.
//! Anything else in the reply (banners, prompts, storage summaries) is
//! ignored.

/// A file stored on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RemoteFile {
    /// File name as reported by the bootloader.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

const SIZE_MARKER: &str = ", size: ";

/// Parse every `<name>, size: <digits>` line of a listing, in order.
pub fn parse_listing(text: &str) -> Vec<RemoteFile> {
    text.lines().filter_map(parse_line).collect()
}

/// Size of `name` in a listing, if present.
pub fn find_size(text: &str, name: &str) -> Option<u64> {
    parse_listing(text)
        .into_iter()
        .find(|f| f.name == name)
        .map(|f| f.size)
}

fn parse_line(line: &str) -> Option<RemoteFile> {
    let line = line.trim_matches(|c: char| c == '\r' || c.is_whitespace());
    let (name, rest) = line.rsplit_once(SIZE_MARKER)?;

    let digits: &str = rest
        .find(|c: char| !c.is_ascii_digit())
        .map_or(rest, |end| &rest[..end]);
    let size = digits.parse().ok()?;

    // Prompt characters printed by the bootloader in front of the first entry.
    let name = name.trim_start_matches(['>', ' ', '\t']).trim();
    if name.is_empty() {
        return None;
    }

    Some(RemoteFile {
        name: name.to_string(),
        size,
    })
}
