//! Model persistence

use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{Model, ModelMetadata};
use crate::{Error, Result};

/// Model store boundary
pub trait ModelStore: Send + Sync {
    /// Persist a new model; fails if the id already exists
    fn put(&self, model: &Model) -> Result<()>;

    /// Overwrite an existing model
    fn update(&self, model: &Model) -> Result<()>;

    fn get(&self, model_id: &str) -> Result<Model>;

    fn get_metadata(&self, model_id: &str) -> Result<ModelMetadata> {
        Ok(self.get(model_id)?.metadata)
    }

    fn list_ids(&self) -> Result<Vec<String>>;
}

fn already_exists(model_id: &str) -> Error {
    Error::invalid_request(format!("model {} already exists", model_id))
}

/// Models kept in process memory
#[derive(Default)]
pub struct InMemoryModelStore {
    models: DashMap<String, Model>,
}

impl InMemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for InMemoryModelStore {
    fn put(&self, model: &Model) -> Result<()> {
        match self.models.entry(model.model_id.clone()) {
            Entry::Occupied(_) => Err(already_exists(&model.model_id)),
            Entry::Vacant(slot) => {
                slot.insert(model.clone());
                Ok(())
            }
        }
    }

    fn update(&self, model: &Model) -> Result<()> {
        match self.models.get_mut(&model.model_id) {
            Some(mut existing) => {
                *existing = model.clone();
                Ok(())
            }
            None => Err(Error::ModelNotFound(model.model_id.clone())),
        }
    }

    fn get(&self, model_id: &str) -> Result<Model> {
        self.models
            .get(model_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredModel {
    model_id: String,
    metadata: ModelMetadata,
}

/// One `<id>.json` metadata file per model, plus `<id>.model` for the payload
pub struct FileModelStore {
    root_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileModelStore {
    pub fn new(root_path: impl Into<PathBuf>) -> Result<Self> {
        let root_path = root_path.into();
        std::fs::create_dir_all(&root_path)?;
        Ok(Self {
            root_path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn metadata_path(&self, model_id: &str) -> Result<PathBuf> {
        if model_id.is_empty()
            || model_id.starts_with('.')
            || model_id.contains(['/', '\\'])
        {
            return Err(Error::invalid_request(format!(
                "invalid model id: {:?}",
                model_id
            )));
        }
        Ok(self.root_path.join(format!("{}.json", model_id)))
    }

    fn blob_path(&self, model_id: &str) -> PathBuf {
        self.root_path.join(format!("{}.model", model_id))
    }

    /// Write through a temp file so readers never see a partial file
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write(&self, model: &Model) -> Result<()> {
        let metadata_path = self.metadata_path(&model.model_id)?;
        let blob_path = self.blob_path(&model.model_id);

        match &model.blob {
            Some(blob) => Self::write_atomic(&blob_path, blob)?,
            None => {
                if blob_path.exists() {
                    std::fs::remove_file(&blob_path)?;
                }
            }
        }

        let stored = StoredModel {
            model_id: model.model_id.clone(),
            metadata: model.metadata.clone(),
        };
        Self::write_atomic(&metadata_path, &serde_json::to_vec_pretty(&stored)?)
    }
}

impl ModelStore for FileModelStore {
    fn put(&self, model: &Model) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.metadata_path(&model.model_id)?.exists() {
            return Err(already_exists(&model.model_id));
        }
        self.write(model)
    }

    fn update(&self, model: &Model) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !self.metadata_path(&model.model_id)?.exists() {
            return Err(Error::ModelNotFound(model.model_id.clone()));
        }
        self.write(model)
    }

    fn get(&self, model_id: &str) -> Result<Model> {
        let metadata_path = self.metadata_path(model_id)?;
        let data = match std::fs::read(&metadata_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ModelNotFound(model_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let stored: StoredModel = serde_json::from_slice(&data)?;

        let blob_path = self.blob_path(model_id);
        let blob = if blob_path.exists() {
            Some(std::fs::read(&blob_path)?)
        } else {
            None
        };

        Ok(Model {
            model_id: stored.model_id,
            metadata: stored.metadata,
            blob,
        })
    }

    fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
