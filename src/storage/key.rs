use crate::image::{ContentDigest, ImageName};
use std::path::{Path, PathBuf};

/// Everything we keep on disk, relative to the state directory
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum StorageKey {
    Temp(u32, u64),
    Blob(ContentDigest),
    Chain(ContentDigest),
    Image(ImageName),
}

impl StorageKey {
    /// A fresh temp file name owned by this process
    pub fn temp() -> Self {
        StorageKey::Temp(std::process::id(), rand::random::<u64>())
    }

    pub fn to_path(&self, base_dir: &Path) -> PathBuf {
        let mut path = base_dir.to_path_buf();
        match self {
            StorageKey::Temp(pid, random) => {
                path.push("tmp");
                path.push(format!("{}-{:x}", pid, random));
                path.set_extension("tmp");
            }
            StorageKey::Blob(content_digest) => {
                path.push("blobs");
                path.push(content_digest.format_str());
                path.push(content_digest.hex_str());
            }
            StorageKey::Chain(chain_id) => {
                path.push("meta");
                path.push("chains");
                path.push(chain_id.hex_str());
                path.set_extension("json");
            }
            StorageKey::Image(name) => {
                path.push("meta");
                path.push("images");
                path.push(path_encode(name.as_str()));
                path.set_extension("json");
            }
        }
        path
    }

    /// Recover the owning process id from a temp file name
    pub fn temp_pid(path: &Path) -> Option<u32> {
        if path.extension()? != "tmp" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (pid, _) = stem.split_once('-')?;
        pid.parse().ok()
    }
}

/// Encode any input string in a way which preserves uniqueness but only uses
/// lowercase alphanumeric characters and dashes.
fn path_encode(input: &str) -> String {
    let mut result = String::with_capacity(input.len() + 16);
    let mut changes = String::with_capacity(16);
    let mut in_replacement = false;
    for (idx, ch) in input.char_indices() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            in_replacement = false;
            result.push(ch)
        } else if ch.is_ascii_uppercase() {
            // Record case conversion
            in_replacement = false;
            result.push(ch.to_ascii_lowercase());
            push_base18_varint(&mut changes, idx << 1);
        } else {
            if idx > 0 && !in_replacement {
                result.push('-');
            }
            in_replacement = true;
            push_base18_varint(&mut changes, (idx << 1) | 1);
            push_base18_varint(&mut changes, ch as usize);
        }
    }
    if result.is_empty() {
        // Empty string not allowed, encode it like a NUL just past the end
        in_replacement = false;
        result.push('0');
        push_base18_varint(&mut changes, (input.len() << 1) | 1);
        push_base18_varint(&mut changes, 0);
    }
    if !changes.is_empty() {
        if !in_replacement {
            result.push('-');
        }
        result.push_str(&changes);
    }
    result
}

/// Variable length integer encoding using only lowercase alphanumeric chars
fn push_base18_varint(buf: &mut String, mut value: usize) {
    loop {
        let base18_digit = value % 18;
        value /= 18;
        let continue_flag = value != 0;
        if continue_flag {
            value -= 1;
        }
        let base36_digit = if continue_flag {
            18 + base18_digit
        } else {
            base18_digit
        };
        buf.push(if base36_digit < 10 {
            (b'0' + base36_digit as u8) as char
        } else {
            (b'a' + (base36_digit - 10) as u8) as char
        });
        if !continue_flag {
            break;
        }
    }
}
