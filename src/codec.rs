//! Reversible mapping between terminal device paths and flat file names.
//!
//! `/dev/pts/12` is stored as `dev+pts+12`. Device paths containing the
//! filler character or whitespace are rejected so that decoding stays the
//! exact inverse of encoding.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Replaces `/` in encoded device names.
pub const FILLER: char = '+';

pub const DEFAULT_DEVICE_ROOT: &str = "/dev";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodec {
    root: PathBuf,
}

impl Default for DeviceCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_ROOT)
    }
}

impl DeviceCodec {
    /// Create a codec accepting devices below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encode a device path into a file name for the tty directory
    pub fn encode(&self, device: &Path) -> Result<String> {
        let invalid = |reason| Error::InvalidDevicePath {
            path: device.to_path_buf(),
            reason,
        };

        let text = device.to_str().ok_or_else(|| invalid("not valid UTF-8"))?;
        if !device.is_absolute() {
            return Err(invalid("not an absolute path"));
        }
        if text.contains(FILLER) {
            return Err(invalid("contains the '+' filler character"));
        }
        if text.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        // Reject `..`, `.` and doubled or trailing separators, which would
        // not survive the round trip.
        let normalized: PathBuf = device.components().collect();
        if normalized.as_os_str() != device.as_os_str()
            || device
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(invalid("not a normalized path"));
        }
        match device.strip_prefix(&self.root) {
            Ok(rest) if rest.as_os_str().is_empty() => {
                return Err(invalid("names the device root itself"))
            }
            Ok(_) => {}
            Err(_) => return Err(invalid("not under the device root")),
        }

        Ok(text[1..].replace('/', &FILLER.to_string()))
    }

    /// Decode a tty directory file name back into its device path
    pub fn decode(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("/{}", name.replace(FILLER, "/")))
    }
}
