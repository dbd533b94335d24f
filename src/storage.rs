use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::BTreeSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} already exists")]
    Exists(PathBuf),
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn encode<T: Serialize>(path: &Path, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes through a sibling temp file and a rename, so readers only ever see
/// a complete document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = encode(path, value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    let tmp = path.with_file_name(format!(
        ".{name}.tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(&bytes).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    Ok(())
}

/// Creates `path` only if it does not exist yet.
pub fn write_json_new<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = encode(path, value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(StoreError::Exists(path.to_path_buf()));
        }
        Err(err) => return Err(io_err(path)(err)),
    };
    file.write_all(&bytes).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path)(err)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// File-name-safe form of an item id. Distinct ids that collide after
/// sanitizing get a short hash suffix.
pub fn sanitize_file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for ch in id.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let out = out.trim_start_matches('.').to_string();
    if out.is_empty() || out != id {
        use sha2::{Digest, Sha256};
        let digest = hex::encode(Sha256::digest(id.as_bytes()));
        let stem = if out.is_empty() { "item" } else { out.as_str() };
        return format!("{stem}-{}", &digest[..8]);
    }
    out
}

/// Root of all on-disk state.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    /// Job ids are uuids; anything else is refused before a path is built.
    pub fn job(&self, id: &str) -> Result<JobDir, StoreError> {
        let parsed =
            Uuid::parse_str(id.trim()).map_err(|_| StoreError::InvalidJobId(id.to_string()))?;
        Ok(JobDir {
            id: parsed.to_string(),
            root: self.root.join("jobs").join(parsed.to_string()),
        })
    }
}

/// Layout of one job's directory.
#[derive(Debug, Clone)]
pub struct JobDir {
    id: String,
    root: PathBuf,
}

impl JobDir {
    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn data_model_path(&self) -> PathBuf {
        self.root.join("data_model.json")
    }

    pub fn style_path(&self) -> PathBuf {
        self.root.join("style_profile.json")
    }

    pub fn conversation_path(&self) -> PathBuf {
        self.root.join("conversation.json")
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.root.join("recipes")
    }

    pub fn current_recipe_path(&self) -> PathBuf {
        self.root.join("recipe.json")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn listings_dir(&self) -> PathBuf {
        self.root.join("output").join("listings")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("output").join("report.json")
    }

    /// First existing copy of an image, preferring `images/` over `uploads/`.
    pub fn find_image(&self, filename: &str) -> Option<PathBuf> {
        let name = Path::new(filename).file_name()?;
        [self.images_dir(), self.uploads_dir()]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Image file names across `images/` and `uploads/`, deduplicated and
    /// sorted.
    pub fn image_files(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for dir in [self.images_dir(), self.uploads_dir()] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.path().is_file() && is_image_name(&name) {
                    names.insert(name);
                }
            }
        }
        names.into_iter().collect()
    }
}

pub fn is_image_name(name: &str) -> bool {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    matches!(
        ext.as_str(),
        "jpg" | "jpeg" | "png" | "webp" | "gif" | "heic"
    )
}
