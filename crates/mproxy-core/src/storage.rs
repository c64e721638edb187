use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::info;

use crate::auth::Auth;

/// Persisted credential file shape shared by the OAuth providers: the
/// well-known token fields first, then arbitrary metadata flattened on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenStorage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_refresh: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expired: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cookie: String,
    /// Provider tag; lets persisted tokens round-trip to the right executor.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Arbitrary key-value pairs flattened into the file at save time.
    /// Metadata wins over struct fields on key conflict.
    #[serde(skip)]
    pub metadata: HashMap<String, JsonValue>,
}

impl TokenStorage {
    /// Serializes the struct fields and merges `metadata` on top.
    pub fn merged_value(&self) -> Result<JsonValue, serde_json::Error> {
        let base = serde_json::to_value(self)?;
        let mut object = match base {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.metadata {
            object.insert(key.clone(), value.clone());
        }
        Ok(JsonValue::Object(object))
    }

    pub fn save_to_file(&self, path: &Path) -> io::Result<()> {
        info!(event = "saving_credentials", path = %path.display());
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_private_dir(parent)?;
        }
        let merged = self.merged_value().map_err(io::Error::other)?;
        let mut data = serde_json::to_vec(&merged).map_err(io::Error::other)?;
        data.push(b'\n');
        std::fs::write(path, data)
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Collaborator the manager persists refreshed auths through.
pub trait TokenStore: Send + Sync {
    fn save(&self, auth: &Auth) -> io::Result<PathBuf>;
}

/// Writes one JSON credential file per auth under a base directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(auth: &Auth) -> String {
        if !auth.file_name.trim().is_empty() {
            return auth.file_name.clone();
        }
        format!("{}.json", auth.id)
    }
}

impl TokenStore for FileTokenStore {
    fn save(&self, auth: &Auth) -> io::Result<PathBuf> {
        let mut storage = match &auth.storage {
            // Providers that maintain an explicit blob persist it as-is.
            Some(JsonValue::Object(blob)) => TokenStorage {
                metadata: blob.clone().into_iter().collect(),
                ..TokenStorage::default()
            },
            _ => TokenStorage::default(),
        };
        storage.kind = auth
            .metadata_str(crate::auth::META_TYPE)
            .unwrap_or(&auth.provider)
            .to_string();
        for (key, value) in &auth.metadata {
            storage.metadata.insert(key.clone(), value.clone());
        }
        let path = self.dir.join(Self::file_name(auth));
        storage.save_to_file(&path)?;
        Ok(path)
    }
}
