//! Firmware source resolution.
//!
//! Bundled images live under a firmware root, one directory per vendor and
//! product:
//!
//! ```text
//! <root>/Dygma/Raise/default.hex
//! <root>/Dygma/Raise/experimental.hex
//! ```
//!
//! A missing bundled image is not an error for the user, it only means that
//! source is not offered.

use std::fmt;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::device::DeviceIdentity;
use crate::error::ResolutionError;

/// Where the user wants the firmware to come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareSource {
    /// The bundled stable image.
    Default,
    /// The bundled experimental image.
    Experimental,
    /// A file the user picked.
    Custom(PathBuf),
}

impl FirmwareSource {
    /// Kind of this source.
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Default => SourceKind::Default,
            Self::Experimental => SourceKind::Experimental,
            Self::Custom(_) => SourceKind::Custom,
        }
    }
}

/// Source kind without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Bundled stable image.
    Default,
    /// Bundled experimental image.
    Experimental,
    /// User-supplied file.
    Custom,
}

impl SourceKind {
    /// Image file name for bundled kinds.
    pub fn file_name(self) -> Option<&'static str> {
        match self {
            Self::Default => Some("default.hex"),
            Self::Experimental => Some("experimental.hex"),
            Self::Custom => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Experimental => write!(f, "experimental"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// A firmware image that was found readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareLocator {
    /// Image path.
    pub path: PathBuf,
    /// Where it came from.
    pub kind: SourceKind,
}

/// Maps firmware sources to image files.
#[derive(Debug, Clone)]
pub struct FirmwareResolver {
    root: PathBuf,
}

impl FirmwareResolver {
    /// Create a resolver over a firmware root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The firmware root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path where a bundled image for `identity` would live.
    ///
    /// Path separators are stripped from vendor and product so a name such
    /// as "Model 01/Rev B" cannot escape the root.
    pub fn bundled_path(&self, kind: SourceKind, identity: &DeviceIdentity) -> Option<PathBuf> {
        let file_name = kind.file_name()?;
        Some(
            self.root
                .join(strip_separators(&identity.vendor))
                .join(strip_separators(&identity.product))
                .join(file_name),
        )
    }

    /// Resolve a source for a device.
    ///
    /// Custom paths are passed through; they were chosen by the user and are
    /// validated by the image writer when it opens them.
    pub fn resolve(
        &self,
        source: &FirmwareSource,
        identity: &DeviceIdentity,
    ) -> Result<FirmwareLocator, ResolutionError> {
        let kind = source.kind();
        if let FirmwareSource::Custom(path) = source {
            return Ok(FirmwareLocator {
                path: path.clone(),
                kind,
            });
        }
        let Some(path) = self.bundled_path(kind, identity) else {
            return Err(ResolutionError::NotFound {
                kind,
                path: self.root.clone(),
            });
        };

        match File::open(&path) {
            Ok(_) => {
                debug!("Resolved {kind} firmware for {identity}: {}", path.display());
                Ok(FirmwareLocator { path, kind })
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No {kind} firmware for {identity} at {}", path.display());
                Err(ResolutionError::NotFound { kind, path })
            },
            Err(e) => Err(ResolutionError::Unreadable {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Sources that can be offered for `identity`. `Custom` is always listed.
    pub fn available_sources(&self, identity: &DeviceIdentity) -> Vec<SourceKind> {
        [SourceKind::Default, SourceKind::Experimental]
            .into_iter()
            .filter(|kind| {
                let source = match kind {
                    SourceKind::Default => FirmwareSource::Default,
                    _ => FirmwareSource::Experimental,
                };
                self.resolve(&source, identity)
                    .is_ok()
            })
            .chain(std::iter::once(SourceKind::Custom))
            .collect()
    }
}

/// Check a user-picked file at selection time.
pub fn validate_custom(path: &Path) -> Result<FirmwareLocator, ResolutionError> {
    match File::open(path) {
        Ok(_) => Ok(FirmwareLocator {
            path: path.to_path_buf(),
            kind: SourceKind::Custom,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ResolutionError::NotFound {
            kind: SourceKind::Custom,
            path: path.to_path_buf(),
        }),
        Err(e) => Err(ResolutionError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn strip_separators(name: &str) -> String {
    name.replace(['/', '\\'], "")
}
