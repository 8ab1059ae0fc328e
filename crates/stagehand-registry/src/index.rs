//! Registry index over the state store.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use stagehand_state::{
    EnvironmentPromotion, Image, ImageEntry, StateError, StateStore, epoch_secs,
};

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("valid digest pattern"));

static REPOSITORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._:/-][a-z0-9]+)*$").expect("valid repository pattern")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid tag pattern"));

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors from the registry index.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("unknown image: {0}")]
    UnknownImage(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Tracks known image versions per repository and where they were promoted.
#[derive(Clone)]
pub struct RegistryIndex {
    store: StateStore,
}

impl RegistryIndex {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Record a pushed image and point its tag at the digest.
    ///
    /// Registering a digest that is already known keeps the original entry
    /// (and its creation time); only the tag pointer moves.
    pub fn register(&self, repository: &str, tag: &str, digest: &str) -> RegistryResult<Image> {
        validate(repository, tag, digest)?;

        if let Some(existing) = self.store.get_image(repository, digest)? {
            self.store.put_tag(repository, tag, digest)?;
            debug!(%repository, %tag, %digest, "known digest re-tagged");
            return Ok(Image {
                tag: tag.to_string(),
                ..existing.image
            });
        }

        let image = Image::new(repository, tag, digest);
        self.store.put_image(&ImageEntry::new(image.clone()))?;
        info!(image = %image.reference(), "image registered");
        Ok(image)
    }

    /// Resolve a tag to the image it currently points at.
    pub fn resolve(&self, repository: &str, tag: &str) -> RegistryResult<Option<Image>> {
        let Some(digest) = self.store.get_tag(repository, tag)? else {
            return Ok(None);
        };
        Ok(self.store.get_image(repository, &digest)?.map(|entry| Image {
            tag: tag.to_string(),
            ..entry.image
        }))
    }

    /// All known versions of a repository, oldest first.
    pub fn versions(&self, repository: &str) -> RegistryResult<Vec<ImageEntry>> {
        let mut entries = self.store.list_images(repository)?;
        entries.sort_by(|a, b| {
            a.image
                .created_at
                .cmp(&b.image.created_at)
                .then_with(|| a.image.digest.cmp(&b.image.digest))
        });
        Ok(entries)
    }

    /// Record that `image` was committed to `environment`.
    pub fn mark_promoted(&self, image: &Image, environment: &str) -> RegistryResult<ImageEntry> {
        let entry = self
            .store
            .update_image(&image.repository, &image.digest, |entry| {
                entry.promotions.push(EnvironmentPromotion {
                    environment: environment.to_string(),
                    promoted_at: epoch_secs(),
                });
            })
            .map_err(|e| match e {
                StateError::NotFound(_) => RegistryError::UnknownImage(image.reference()),
                other => other.into(),
            })?;
        debug!(image = %image.reference(), %environment, "promotion recorded in index");
        Ok(entry)
    }

    /// Drop a version from the index, e.g. after the registry garbage
    /// collected it. Returns false if the digest was not known.
    pub fn forget(&self, repository: &str, digest: &str) -> RegistryResult<bool> {
        let existed = self.store.delete_image(repository, digest)?;
        if existed {
            info!(%repository, %digest, "image forgotten");
        }
        Ok(existed)
    }

    /// The version most recently committed to `environment`.
    pub fn current_in(
        &self,
        repository: &str,
        environment: &str,
    ) -> RegistryResult<Option<ImageEntry>> {
        let entries = self.store.list_images(repository)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| entry.last_promoted_at(environment).map(|at| (at, entry)))
            .max_by_key(|(at, _)| *at)
            .map(|(_, entry)| entry))
    }
}

fn validate(repository: &str, tag: &str, digest: &str) -> RegistryResult<()> {
    if !REPOSITORY_RE.is_match(repository) {
        return Err(RegistryError::InvalidReference(format!(
            "repository {repository:?}"
        )));
    }
    if !TAG_RE.is_match(tag) {
        return Err(RegistryError::InvalidReference(format!("tag {tag:?}")));
    }
    if !DIGEST_RE.is_match(digest) {
        return Err(RegistryError::InvalidReference(format!("digest {digest:?}")));
    }
    Ok(())
}
