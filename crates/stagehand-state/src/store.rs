//! StateStore — redb-backed state persistence for Stagehand.
//!
//! Provides typed operations over deployments, promotion records and the
//! image index. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(PROMOTIONS).map_err(map_err!(Table))?;
        txn.open_table(IMAGES).map_err(map_err!(Table))?;
        txn.open_table(TAGS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or replace a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let key = deployment.table_key();
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, state = deployment.strategy_state.name(), "deployment stored");
        Ok(())
    }

    /// Get a deployment by `{environment}/{service}` key.
    pub fn get_deployment(&self, key: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List all deployments, ordered by key.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    /// Atomically read, modify and write back a deployment.
    ///
    /// The closure runs inside the write transaction, so concurrent updates
    /// of different fields are applied one after the other rather than
    /// overwriting each other. If the closure fails nothing is written.
    pub fn update_deployment<F>(&self, key: &str, f: F) -> StateResult<Deployment>
    where
        F: FnOnce(&mut Deployment) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(format!("deployment {key}")))?;
            let mut deployment: Deployment =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            f(&mut deployment)?;
            deployment.updated_at = epoch_secs();
            let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
            deployment
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, state = updated.strategy_state.name(), "deployment updated");
        Ok(updated)
    }

    /// Delete a deployment by key. Returns true if it existed.
    pub fn delete_deployment(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "deployment deleted");
        Ok(existed)
    }

    // ── Promotions ─────────────────────────────────────────────────

    /// Append a new pending promotion record, assigning its ID.
    pub fn insert_promotion(&self, record: &PromotionRecord) -> StateResult<PromotionRecord> {
        if record.outcome.is_terminal() {
            return Err(StateError::InvalidTransition(
                "promotion records are created pending".to_string(),
            ));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut counters = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let seq = counters
                .get(PROMOTION_SEQ)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            counters
                .insert(PROMOTION_SEQ, seq)
                .map_err(map_err!(Write))?;

            let mut stored = record.clone();
            stored.id = PromotionRecord::make_id(&record.service, seq);
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

            let mut table = txn.open_table(PROMOTIONS).map_err(map_err!(Table))?;
            if table
                .get(stored.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::AlreadyExists(stored.id));
            }
            table
                .insert(stored.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %stored.id, to_env = %stored.to_env, "promotion record created");
        Ok(stored)
    }

    /// Set the final outcome of a pending promotion record.
    pub fn complete_promotion(
        &self,
        id: &str,
        outcome: PromotionOutcome,
        reason: &str,
    ) -> StateResult<PromotionRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(PROMOTIONS).map_err(map_err!(Table))?;
            let current = table
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(format!("promotion {id}")))?;
            let mut record: PromotionRecord =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            record.complete(outcome, reason)?;
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, %outcome, "promotion record completed");
        Ok(record)
    }

    /// Get a promotion record by ID.
    pub fn get_promotion(&self, id: &str) -> StateResult<Option<PromotionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROMOTIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: PromotionRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List the promotion records of a service in start order.
    pub fn list_promotions(&self, service: &str) -> StateResult<Vec<PromotionRecord>> {
        let prefix = format!("{service}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROMOTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: PromotionRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// List every record still pending, across all services.
    pub fn list_pending_promotions(&self) -> StateResult<Vec<PromotionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROMOTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: PromotionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.outcome == PromotionOutcome::Pending {
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Images ─────────────────────────────────────────────────────

    /// Insert or update an image entry and point its tag at its digest.
    pub fn put_image(&self, entry: &ImageEntry) -> StateResult<()> {
        let key = entry.image.table_key();
        let tag_key = format!("{}:{}", entry.image.repository, entry.image.tag);
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut images = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            images
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut tags = txn.open_table(TAGS).map_err(map_err!(Table))?;
            tags.insert(tag_key.as_str(), entry.image.digest.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "image stored");
        Ok(())
    }

    /// Point `{repository}:{tag}` at `digest`.
    pub fn put_tag(&self, repository: &str, tag: &str, digest: &str) -> StateResult<()> {
        let key = format!("{repository}:{tag}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tags = txn.open_table(TAGS).map_err(map_err!(Table))?;
            tags.insert(key.as_str(), digest).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %digest, "tag moved");
        Ok(())
    }

    /// Atomically update an existing image entry.
    pub fn update_image<F>(&self, repository: &str, digest: &str, f: F) -> StateResult<ImageEntry>
    where
        F: FnOnce(&mut ImageEntry),
    {
        let key = format!("{repository}@{digest}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let entry = {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            let current = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(format!("image {key}")))?;
            let mut entry: ImageEntry =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            f(&mut entry);
            let value = serde_json::to_vec(&entry).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            entry
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(entry)
    }

    /// Delete an image entry. Tags still pointing at it resolve to nothing.
    /// Returns true if it existed.
    pub fn delete_image(&self, repository: &str, digest: &str) -> StateResult<bool> {
        let key = format!("{repository}@{digest}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "image deleted");
        Ok(existed)
    }

    /// Get an image entry by repository and digest.
    pub fn get_image(&self, repository: &str, digest: &str) -> StateResult<Option<ImageEntry>> {
        let key = format!("{repository}@{digest}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: ImageEntry =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Resolve a tag to the digest it currently points at.
    pub fn get_tag(&self, repository: &str, tag: &str) -> StateResult<Option<String>> {
        let key = format!("{repository}:{tag}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TAGS).map_err(map_err!(Table))?;
        Ok(table
            .get(key.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string()))
    }

    /// List all image entries of a repository.
    pub fn list_images(&self, repository: &str) -> StateResult<Vec<ImageEntry>> {
        let prefix = format!("{repository}@");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IMAGES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let image: ImageEntry =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(image);
            }
        }
        Ok(results)
    }
}
