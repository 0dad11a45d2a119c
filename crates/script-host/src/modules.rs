//! `require` resolution and local-to-global ID mapping
//!
//! Names declared through `module.defineVirtualDevice(name)` or
//! `module.PersistentStorage(name)` are rewritten to `"_" + H + name`,
//! where `H` is a stable hash of the module's physical path: its MD5
//! digest folded by XOR into 4 bytes and rendered as URL-safe base64
//! without padding. Top-level declarations keep the raw name.

use crate::error::HostError;
use crate::runtime::ResolvedModule;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

/// Stable per-file hash used to namespace module-scoped objects.
#[must_use]
pub fn filename_hash(path: &Path) -> String {
    let digest = Md5::digest(path.to_string_lossy().as_bytes());
    let mut folded = [0u8; 4];
    for i in 0..4 {
        folded[i] = digest[i] ^ digest[4 + i] ^ digest[8 + i] ^ digest[12 + i];
    }
    URL_SAFE_NO_PAD.encode(folded)
}

/// Global object id for a module-scoped name.
#[must_use]
pub fn local_object_id(filename: &Path, name: &str) -> String {
    format!("_{}{}", filename_hash(filename), name)
}

/// Resolves `require(id)` against the configured module directories
pub struct ModuleResolver {
    dirs: Vec<PathBuf>,
}

impl ModuleResolver {
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Try `<dir>/<id>.js` for each directory in order; first hit wins.
    pub fn resolve(&self, id: &str) -> Result<ResolvedModule, HostError> {
        for dir in &self.dirs {
            let path = dir.join(format!("{id}.js"));
            tracing::debug!("require: trying {}", path.display());
            if let Ok(source) = std::fs::read_to_string(&path) {
                return Ok(ResolvedModule { path, source });
            }
        }
        tracing::error!("error requiring module {}, not found", id);
        Err(HostError::NoSuchModule(id.to_string()))
    }
}
