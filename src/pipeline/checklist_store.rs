use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::checklist::Checklist;
use crate::pipeline::RunId;

#[derive(Debug, Error)]
pub enum ChecklistStoreError {
    #[error("failed to create checklist directory '{path}': {message}")]
    CreateDir { path: String, message: String },
    #[error("failed to read checklist '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse checklist '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("checklist '{path}' belongs to run {found}, expected {expected}")]
    RunMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("failed to serialize checklist JSON: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write checklist '{path}': {message}")]
    WriteFile { path: String, message: String },
    #[error("checklist store unavailable: {0}")]
    Unavailable(String),
}

pub trait ChecklistStore: Send + Sync + 'static {
    fn load(&self, run_id: &RunId) -> Result<Checklist, ChecklistStoreError>;

    fn save(&self, run_id: &RunId, checklist: &mut Checklist) -> Result<(), ChecklistStoreError>;

    fn archive(&self, checklist: &Checklist) -> Result<(), ChecklistStoreError>;

    fn list_runs(&self) -> Result<Vec<RunId>, ChecklistStoreError>;
}

pub type SharedChecklistStore = Arc<dyn ChecklistStore>;

#[derive(Debug, Clone)]
pub struct FileChecklistStore {
    root: PathBuf,
}

impl FileChecklistStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn checklist_path(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join("checklists")
            .join(run_id.run_type.as_str())
            .join(format!("{}.json", run_id.date_str()))
    }

    pub fn archive_path(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join("archive")
            .join(run_id.run_type.as_str())
            .join(format!("{}.json", run_id.date_str()))
    }
}

impl ChecklistStore for FileChecklistStore {
    fn load(&self, run_id: &RunId) -> Result<Checklist, ChecklistStoreError> {
        let path = self.checklist_path(run_id);
        if !path.exists() {
            return Ok(Checklist::empty(run_id.clone()));
        }
        let raw = fs::read_to_string(path.as_path()).map_err(|error| {
            ChecklistStoreError::ReadFile {
                path: path.display().to_string(),
                message: error.to_string(),
            }
        })?;
        let checklist = serde_json::from_str::<Checklist>(raw.as_str()).map_err(|error| {
            ChecklistStoreError::Parse {
                path: path.display().to_string(),
                message: error.to_string(),
            }
        })?;
        if checklist.run_id != *run_id {
            return Err(ChecklistStoreError::RunMismatch {
                path: path.display().to_string(),
                expected: run_id.to_string(),
                found: checklist.run_id.to_string(),
            });
        }
        Ok(checklist)
    }

    fn save(&self, run_id: &RunId, checklist: &mut Checklist) -> Result<(), ChecklistStoreError> {
        checklist.version += 1;
        let written = write_pretty_json_atomic(self.checklist_path(run_id).as_path(), checklist);
        if written.is_err() {
            checklist.version -= 1;
        }
        written
    }

    fn archive(&self, checklist: &Checklist) -> Result<(), ChecklistStoreError> {
        write_pretty_json_atomic(self.archive_path(&checklist.run_id).as_path(), checklist)
    }

    fn list_runs(&self) -> Result<Vec<RunId>, ChecklistStoreError> {
        let base = self.root.join("checklists");
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for run_type_dir in read_dir_sorted(base.as_path())? {
            if !run_type_dir.is_dir() {
                continue;
            }
            let Some(run_type) = run_type_dir.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            for file in read_dir_sorted(run_type_dir.as_path())? {
                let is_json = file
                    .extension()
                    .and_then(|v| v.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
                let Some(stem) = file.file_stem().and_then(|v| v.to_str()) else {
                    continue;
                };
                if !is_json || stem.starts_with('.') {
                    continue;
                }
                if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
                    runs.push(RunId::new(run_type, date));
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, ChecklistStoreError> {
    let entries = fs::read_dir(dir).map_err(|error| ChecklistStoreError::ReadFile {
        path: dir.display().to_string(),
        message: error.to_string(),
    })?;
    let mut paths = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

pub fn write_pretty_json_atomic<T>(path: &Path, value: &T) -> Result<(), ChecklistStoreError>
where
    T: Serialize,
{
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|error| ChecklistStoreError::CreateDir {
        path: parent.display().to_string(),
        message: error.to_string(),
    })?;

    let mut bytes = serde_json::to_vec_pretty(value).map_err(ChecklistStoreError::Serialize)?;
    bytes.push(b'\n');

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("checklist.json");
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let write_err = |error: std::io::Error| ChecklistStoreError::WriteFile {
        path: path.display().to_string(),
        message: error.to_string(),
    };

    let written = fs::File::create(tmp_path.as_path())
        .and_then(|mut file| {
            file.write_all(bytes.as_slice())?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(tmp_path.as_path(), path));
    if let Err(error) = written {
        let _ = fs::remove_file(tmp_path.as_path());
        return Err(write_err(error));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryChecklistStore {
    checklists: Mutex<HashMap<RunId, Checklist>>,
    archived: Mutex<Vec<Checklist>>,
    fail_saves: AtomicBool,
}

impl MemoryChecklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn put(&self, checklist: Checklist) -> Result<(), ChecklistStoreError> {
        self.checklists
            .lock()
            .map_err(|_| ChecklistStoreError::Unavailable(String::from("lock poisoned")))?
            .insert(checklist.run_id.clone(), checklist);
        Ok(())
    }

    pub fn archived(&self) -> Result<Vec<Checklist>, ChecklistStoreError> {
        Ok(self
            .archived
            .lock()
            .map_err(|_| ChecklistStoreError::Unavailable(String::from("lock poisoned")))?
            .clone())
    }
}

impl ChecklistStore for MemoryChecklistStore {
    fn load(&self, run_id: &RunId) -> Result<Checklist, ChecklistStoreError> {
        let checklists = self
            .checklists
            .lock()
            .map_err(|_| ChecklistStoreError::Unavailable(String::from("lock poisoned")))?;
        Ok(checklists
            .get(run_id)
            .cloned()
            .unwrap_or_else(|| Checklist::empty(run_id.clone())))
    }

    fn save(&self, run_id: &RunId, checklist: &mut Checklist) -> Result<(), ChecklistStoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ChecklistStoreError::WriteFile {
                path: format!("memory://{run_id}"),
                message: String::from("injected save failure"),
            });
        }
        let mut checklists = self
            .checklists
            .lock()
            .map_err(|_| ChecklistStoreError::Unavailable(String::from("lock poisoned")))?;
        checklist.version += 1;
        checklists.insert(run_id.clone(), checklist.clone());
        Ok(())
    }

    fn archive(&self, checklist: &Checklist) -> Result<(), ChecklistStoreError> {
        self.archived
            .lock()
            .map_err(|_| ChecklistStoreError::Unavailable(String::from("lock poisoned")))?
            .push(checklist.clone());
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<RunId>, ChecklistStoreError> {
        let checklists = self
            .checklists
            .lock()
            .map_err(|_| ChecklistStoreError::Unavailable(String::from("lock poisoned")))?;
        let mut runs = checklists.keys().cloned().collect::<Vec<_>>();
        runs.sort();
        Ok(runs)
    }
}
