//! Story catalog: serves immutable published packs by `(story_id, version)`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use fablestep_core::error::DomainError;
use tracing::{debug, info};

use crate::domain::pack::StoryPack;

/// Collaborator that resolves a published pack.
#[async_trait]
pub trait StoryCatalog: Send + Sync {
    /// Loads a validated pack.
    async fn load(&self, story_id: &str, version: i64) -> Result<Arc<StoryPack>, DomainError>;
}

type PackKey = (String, i64);

/// Catalog backed by `<root>/<story_id>@<version>.yaml` files.
///
/// Packs are parsed and validated on first use and cached for the lifetime
/// of the catalog; a published pack never changes.
#[derive(Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
    cache: RwLock<HashMap<PackKey, Arc<StoryPack>>>,
}

impl DirectoryCatalog {
    /// Creates a catalog reading from `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, story_id: &str, version: i64) -> Result<PathBuf, DomainError> {
        let safe = !story_id.is_empty()
            && story_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(DomainError::Validation(format!(
                "story id {story_id:?} contains unsupported characters"
            )));
        }
        Ok(self.root.join(format!("{story_id}@{version}.yaml")))
    }

    fn cached(&self, key: &PackKey) -> Option<Arc<StoryPack>> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    }
}

#[async_trait]
impl StoryCatalog for DirectoryCatalog {
    async fn load(&self, story_id: &str, version: i64) -> Result<Arc<StoryPack>, DomainError> {
        let key = (story_id.to_owned(), version);
        if let Some(pack) = self.cached(&key) {
            return Ok(pack);
        }

        let path = self.path_for(story_id, version)?;
        debug!(path = %path.display(), "loading story pack");
        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DomainError::StoryNotFound {
                    story_id: story_id.to_owned(),
                    version,
                });
            }
            Err(e) => {
                return Err(DomainError::Infrastructure(format!(
                    "reading {}: {e}",
                    path.display()
                )));
            }
        };

        let pack = StoryPack::from_yaml(&source)?;
        if pack.story_id != story_id || pack.version != version {
            return Err(DomainError::Validation(format!(
                "{} declares {}@{}",
                path.display(),
                pack.story_id,
                pack.version
            )));
        }
        pack.validate()?;
        info!(
            story_id,
            version,
            content_hash = %pack.content_hash(),
            "story pack published to catalog"
        );

        let pack = Arc::new(pack);
        let mut cache = self
            .cache
            .write()
            .map_err(|_| DomainError::Infrastructure("story cache lock poisoned".to_owned()))?;
        Ok(Arc::clone(cache.entry(key).or_insert(pack)))
    }
}

/// Catalog over packs held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    packs: HashMap<PackKey, Arc<StoryPack>>,
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a pack after validating it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the pack is invalid or the
    /// `(story_id, version)` pair is already published.
    pub fn publish(&mut self, pack: StoryPack) -> Result<(), DomainError> {
        pack.validate()?;
        let key = (pack.story_id.clone(), pack.version);
        if self.packs.contains_key(&key) {
            return Err(DomainError::Validation(format!(
                "{}@{} is already published",
                key.0, key.1
            )));
        }
        self.packs.insert(key, Arc::new(pack));
        Ok(())
    }
}

#[async_trait]
impl StoryCatalog for InMemoryCatalog {
    async fn load(&self, story_id: &str, version: i64) -> Result<Arc<StoryPack>, DomainError> {
        self.packs
            .get(&(story_id.to_owned(), version))
            .cloned()
            .ok_or_else(|| DomainError::StoryNotFound {
                story_id: story_id.to_owned(),
                version,
            })
    }
}
