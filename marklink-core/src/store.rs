use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::document::Document;
use crate::editor::Editor;
use crate::EditorId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEditor {
    pub id: EditorId,
    #[serde(default)]
    pub title: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub content: Value,
}

impl PersistedEditor {
    pub fn from_editor(editor: &Editor) -> Result<Self> {
        Ok(Self {
            id: editor.id(),
            title: editor.title().to_string(),
            timestamp: unix_millis(),
            content: editor
                .doc()
                .to_json()
                .with_context(|| format!("failed to encode editor {}", editor.id()))?,
        })
    }

    /// Decodes the stored tree; malformed content yields an empty document.
    pub fn document(&self) -> Document {
        match Document::from_json(&self.content) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(editor = %self.id, error = %err, "stored document is malformed, starting empty");
                Document::empty()
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

pub trait StateStore: Send + Sync {
    fn load(&self, id: EditorId) -> Result<Option<PersistedEditor>>;
    fn save(&self, editor: &PersistedEditor) -> Result<()>;
    fn remove(&self, id: EditorId) -> Result<()>;
    /// Every stored editor, oldest first.
    fn list(&self) -> Result<Vec<PersistedEditor>>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, id: EditorId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn read(&self, path: &PathBuf) -> Result<PersistedEditor> {
        let mut file =
            File::open(path).with_context(|| format!("failed to open state file {:?}", path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        serde_json::from_str(&buf).with_context(|| format!("failed to decode state file {:?}", path))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, id: EditorId) -> Result<Option<PersistedEditor>> {
        let path = self.state_path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    fn save(&self, editor: &PersistedEditor) -> Result<()> {
        let path = self.state_path(editor.id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(editor)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move state file into {:?}", path))?;
        Ok(())
    }

    fn remove(&self, id: EditorId) -> Result<()> {
        let path = self.state_path(id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove state file {:?}", path))?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<PersistedEditor>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list state directory {:?}", self.root))?;
        let mut editors = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path) {
                Ok(editor) => editors.push(editor),
                Err(err) => warn!(path = ?path, error = %format!("{err:#}"), "skipping unreadable state file"),
            }
        }
        editors.sort_by_key(|editor| (editor.timestamp, editor.id));
        Ok(editors)
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<BTreeMap<EditorId, PersistedEditor>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, id: EditorId) -> Result<Option<PersistedEditor>> {
        Ok(self.inner.lock().get(&id).cloned())
    }

    fn save(&self, editor: &PersistedEditor) -> Result<()> {
        self.inner.lock().insert(editor.id, editor.clone());
        Ok(())
    }

    fn remove(&self, id: EditorId) -> Result<()> {
        self.inner.lock().remove(&id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<PersistedEditor>> {
        let mut editors: Vec<_> = self.inner.lock().values().cloned().collect();
        editors.sort_by_key(|editor| (editor.timestamp, editor.id));
        Ok(editors)
    }
}
