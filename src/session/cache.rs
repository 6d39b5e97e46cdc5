//! Change-tracking session attribute cache.
//!
//! # Responsibilities
//! - Load a session's attributes from the store at most once, lazily
//! - Track every attribute in a single tagged map: its persisted
//!   baseline, a staged overwrite, or a staged removal
//! - Flush only staged changes on save, and only when there are any
//!
//! # Design Decisions
//! - Writing a value byte-identical to its baseline un-stages the write,
//!   so echoing stored state back never touches the store
//! - Values are serialized to JSON bytes at set() time; the comparison
//!   above is on those bytes, not on the typed value

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{SessionStore, StoreError};

/// Error type for session attribute access.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("attribute {name:?} does not decode: {source}")]
    Decode {
        name: String,
        source: serde_json::Error,
    },
    #[error("attribute {name:?} does not encode: {source}")]
    Encode {
        name: String,
        source: serde_json::Error,
    },
}

/// State of one attribute relative to the store.
enum Slot {
    /// Matches the persisted row.
    Baseline(Bytes),
    /// Staged write; `baseline` is the persisted value, if any row exists.
    Staged {
        baseline: Option<Bytes>,
        value: Bytes,
    },
    /// Staged removal of a persisted row whose value was `.0`.
    Removed(Bytes),
}

/// One request's view of a session.
///
/// Created per exchange and flushed at the end of it; never shared
/// across requests.
pub struct Session {
    id: String,
    store: Arc<dyn SessionStore>,
    slots: HashMap<String, Slot>,
    loaded: bool,
}

impl Session {
    pub fn new(id: String, store: Arc<dyn SessionStore>) -> Self {
        Self {
            id,
            store,
            slots: HashMap::new(),
            loaded: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fetch the persisted attributes on first touch, keeping any changes
    /// already staged against them.
    async fn ensure_loaded(&mut self) -> Result<(), SessionError> {
        if self.loaded {
            return Ok(());
        }
        let persisted = self.store.load(&self.id).await?;
        for (name, value) in persisted {
            match self.slots.get_mut(&name) {
                None => {
                    self.slots.insert(name, Slot::Baseline(value));
                }
                Some(Slot::Staged { baseline, .. }) => {
                    *baseline = Some(value);
                }
                Some(Slot::Removed(old)) => {
                    *old = value;
                }
                Some(Slot::Baseline(_)) => {}
            }
        }
        self.loaded = true;
        Ok(())
    }

    fn set_raw(&mut self, name: &str, value: Bytes) {
        match self.slots.get_mut(name) {
            None => {
                self.slots.insert(
                    name.to_string(),
                    Slot::Staged {
                        baseline: None,
                        value,
                    },
                );
            }
            Some(slot) => match slot {
                Slot::Baseline(baseline) if *baseline == value => {}
                Slot::Baseline(baseline) => {
                    let baseline = std::mem::take(baseline);
                    *slot = Slot::Staged {
                        baseline: Some(baseline),
                        value,
                    };
                }
                Slot::Staged {
                    baseline: Some(baseline),
                    ..
                } if *baseline == value => {
                    let baseline = std::mem::take(baseline);
                    *slot = Slot::Baseline(baseline);
                }
                Slot::Staged { value: staged, .. } => {
                    *staged = value;
                }
                Slot::Removed(old) if *old == value => {
                    let old = std::mem::take(old);
                    *slot = Slot::Baseline(old);
                }
                Slot::Removed(old) => {
                    let old = std::mem::take(old);
                    *slot = Slot::Staged {
                        baseline: Some(old),
                        value,
                    };
                }
            },
        }
    }

    fn get_raw(&self, name: &str) -> Option<&Bytes> {
        match self.slots.get(name) {
            Some(Slot::Baseline(value)) => Some(value),
            Some(Slot::Staged { value, .. }) => Some(value),
            Some(Slot::Removed(_)) | None => None,
        }
    }

    /// Read one attribute, decoding it from its stored form.
    pub async fn get<T: DeserializeOwned>(
        &mut self,
        name: &str,
    ) -> Result<Option<T>, SessionError> {
        self.ensure_loaded().await?;
        match self.get_raw(name) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|source| SessionError::Decode {
                    name: name.to_string(),
                    source,
                }),
        }
    }

    /// Read one attribute, computing a fallback when absent. The
    /// fallback is returned, not staged.
    pub async fn get_or<T, F>(&mut self, name: &str, default: F) -> Result<T, SessionError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        Ok(self.get(name).await?.unwrap_or_else(default))
    }

    /// Stage one attribute write.
    pub async fn set<T: Serialize>(
        &mut self,
        name: &str,
        value: &T,
    ) -> Result<(), SessionError> {
        self.ensure_loaded().await?;
        let bytes = serde_json::to_vec(value).map_err(|source| SessionError::Encode {
            name: name.to_string(),
            source,
        })?;
        self.set_raw(name, Bytes::from(bytes));
        Ok(())
    }

    /// Stage one attribute removal. Removing an attribute that was never
    /// persisted simply discards its staged write.
    pub async fn remove(&mut self, name: &str) -> Result<(), SessionError> {
        self.ensure_loaded().await?;
        match self.slots.remove(name) {
            None => {}
            Some(slot @ Slot::Removed(_)) => {
                self.slots.insert(name.to_string(), slot);
            }
            Some(Slot::Baseline(value))
            | Some(Slot::Staged {
                baseline: Some(value),
                ..
            }) => {
                self.slots.insert(name.to_string(), Slot::Removed(value));
            }
            Some(Slot::Staged { baseline: None, .. }) => {}
        }
        Ok(())
    }

    /// Names of every live attribute, staged writes included.
    pub async fn names(&mut self) -> Result<Vec<String>, SessionError> {
        self.ensure_loaded().await?;
        let mut names: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| !matches!(slot, Slot::Removed(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Stage removal of every live attribute.
    pub async fn clear(&mut self) -> Result<(), SessionError> {
        let names = self.names().await?;
        for name in names {
            self.remove(&name).await?;
        }
        Ok(())
    }

    /// Flush staged changes to the store. A session with nothing staged
    /// never reaches the store at all.
    pub async fn save(&mut self) -> Result<(), SessionError> {
        let mut new = Vec::new();
        let mut removed = Vec::new();
        for (name, slot) in &self.slots {
            match slot {
                Slot::Baseline(_) => {}
                Slot::Staged { value, .. } => new.push((name.clone(), value.clone())),
                Slot::Removed(_) => removed.push(name.clone()),
            }
        }
        if new.is_empty() && removed.is_empty() {
            return Ok(());
        }

        self.store.save(&self.id, &new, &removed).await?;

        // Saved writes become the new baseline; saved removals vanish.
        self.slots.retain(|_, slot| !matches!(slot, Slot::Removed(_)));
        for slot in self.slots.values_mut() {
            if let Slot::Staged { value, .. } = slot {
                let value = std::mem::take(value);
                *slot = Slot::Baseline(value);
            }
        }
        Ok(())
    }
}
