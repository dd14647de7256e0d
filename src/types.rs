//! Core types for vecmem

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque address of a native object. `0` means "not yet set".
pub type NativeHandle = u64;

/// Engine-specific parameters passed through to the native engine untouched.
pub type Parameters = HashMap<String, serde_json::Value>;

/// Vector type
pub type Vector = Vec<f32>;

/// Native engine that owns an allocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Faiss,
    Nmslib,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Faiss => "faiss",
            EngineKind::Nmslib => "nmslib",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            EngineKind::Faiss => &["faiss"],
            EngineKind::Nmslib => &["hnsw", "nmslib"],
        }
    }

    /// Resolve the engine from an index file extension, e.g. `_0_165_vec.faiss`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        [EngineKind::Faiss, EngineKind::Nmslib]
            .into_iter()
            .find(|engine| engine.extensions().contains(&ext.as_str()))
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "cannot determine engine for index file {}",
                    path.display()
                ))
            })
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "faiss" => Ok(EngineKind::Faiss),
            "nmslib" => Ok(EngineKind::Nmslib),
            other => Err(Error::invalid_request(format!(
                "unsupported engine: {}",
                other
            ))),
        }
    }
}
