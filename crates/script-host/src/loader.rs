//! Source map, content tracking and path handling for script loading
//!
//! Each loaded script file gets a [`SourceEntry`] recording where its
//! devices and rules were declared and any script error with a traceback
//! rewritten to virtual paths. The content tracker suppresses reloads of
//! unchanged files, which is what lets `LiveWrite` coexist with a file
//! watcher without double loads.

use crate::runtime::EvalError;
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A `(line, name)` location inside a script file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocItem {
    pub line: u32,
    pub name: String,
}

/// A script error with its traceback rewritten to virtual paths
///
/// Only frames under the source root survive the rewrite.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptError {
    pub message: String,
    /// `(line, virtual path)` pairs, outermost first
    pub traceback: Vec<LocItem>,
}

impl std::error::Error for ScriptError {}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for frame in &self.traceback {
            write!(f, "\n    at {}:{}", frame.name, frame.line)?;
        }
        Ok(())
    }
}

/// The engine's record of a loaded script
#[derive(Debug, Clone, Serialize)]
pub struct SourceEntry {
    pub virtual_path: String,
    pub physical_path: PathBuf,
    /// Devices declared while loading, with source lines
    pub devices: Vec<LocItem>,
    /// Rules declared while loading, with source lines
    pub rules: Vec<LocItem>,
    pub error: Option<ScriptError>,
}

impl SourceEntry {
    #[must_use]
    pub fn new(virtual_path: &str, physical_path: &Path) -> Self {
        Self {
            virtual_path: virtual_path.to_string(),
            physical_path: physical_path.to_path_buf(),
            devices: Vec::new(),
            rules: Vec::new(),
            error: None,
        }
    }
}

/// Maps virtual paths to the content hash last loaded
#[derive(Debug, Default)]
pub struct ContentTracker {
    hashes: HashMap<String, [u8; 16]>,
}

impl ContentTracker {
    /// Record the content; returns true when it changed or was first
    /// seen.
    pub fn track(&mut self, key: &str, content: &[u8]) -> bool {
        let digest: [u8; 16] = Md5::digest(content).into();
        match self.hashes.insert(key.to_string(), digest) {
            Some(previous) => previous != digest,
            None => true,
        }
    }
}

/// Lexically normalize a path: make it absolute and resolve `.`/`..`
/// components without touching the filesystem.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Resolve a script path; the virtual path is present when the file sits
/// under the source root.
#[must_use]
pub fn check_source_path(root: &Path, path: &Path) -> (PathBuf, Option<String>) {
    let clean = normalize(path);
    let virtual_path = clean
        .strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
    (clean, virtual_path)
}

/// Map a virtual path back to a physical path under the source root;
/// `None` when it escapes the root.
#[must_use]
pub fn check_virtual_path(root: &Path, virtual_path: &str) -> Option<PathBuf> {
    let clean = normalize(&root.join(virtual_path));
    clean.strip_prefix(root).ok()?;
    Some(clean)
}

/// Translate a raw eval error into a [`ScriptError`]: keep only frames
/// under the source root, with physical paths rewritten to virtual ones.
#[must_use]
pub fn rewrite_error(root: &Path, error: &EvalError) -> ScriptError {
    let traceback = error
        .traceback
        .iter()
        .filter_map(|frame| {
            let (_, virtual_path) = check_source_path(root, &frame.file);
            virtual_path.map(|name| LocItem {
                line: frame.line,
                name,
            })
        })
        .collect();
    ScriptError {
        message: error.message.clone(),
        traceback,
    }
}
