use std::sync::Arc;

use virtualdata::{
    Capabilities, EditAck, EditCommand, EditCommandKind, EditFailure, FetchAnchor, FetchCommand,
    FetchError, FetchPage, ItemKey, PageItem,
};

/// An in-memory backing store implementing the full adapter capability
/// contract, with per-call fault injection.
///
/// Descriptions are matched by key prefix: `items_from_description("ab")`
/// anchors at the first item whose key starts with `ab`.
pub struct VecSource<T> {
    items: Vec<(ItemKey, Arc<T>)>,
    caps: Capabilities,
    next_generated_key: u64,
    /// When set, every fetch answers with this error (count calls included).
    pub fail_fetches: Option<FetchError>,
    /// When set, the next edit answers with this failure (one-shot).
    pub fail_next_edit: Option<EditFailure>,
}

impl<T> VecSource<T> {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::full())
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            items: Vec::new(),
            caps,
            next_generated_key: 0,
            fail_fetches: None,
            fail_next_edit: None,
        }
    }

    pub fn from_items(items: impl IntoIterator<Item = (ItemKey, T)>) -> Self {
        let mut source = Self::new();
        for (key, value) in items {
            source.items.push((key, Arc::new(value)));
        }
        source
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> Vec<ItemKey> {
        self.items.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|(k, _)| k == key)
    }

    pub fn value(&self, key: &str) -> Option<Arc<T>> {
        self.position(key).map(|i| Arc::clone(&self.items[i].1))
    }

    // ------------------------------------------------------------------
    // Direct store mutation (behind the engine's back; pair with the
    // engine's notify_* methods or an invalidate to keep it honest)
    // ------------------------------------------------------------------

    pub fn insert(&mut self, at: usize, key: impl Into<ItemKey>, value: T) {
        self.insert_shared(at, key, Arc::new(value));
    }

    /// Inserts an already-shared payload, so a host can hand the same `Arc`
    /// to the engine (relevant under identity comparison).
    pub fn insert_shared(&mut self, at: usize, key: impl Into<ItemKey>, value: Arc<T>) {
        let at = at.min(self.items.len());
        self.items.insert(at, (key.into(), value));
    }

    pub fn push(&mut self, key: impl Into<ItemKey>, value: T) {
        self.items.push((key.into(), Arc::new(value)));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(at) => {
                self.items.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn relocate(&mut self, key: &str, to: usize) -> bool {
        match self.position(key) {
            Some(from) => {
                let item = self.items.remove(from);
                self.items.insert(to.min(self.items.len()), item);
                true
            }
            None => false,
        }
    }

    pub fn set_value(&mut self, key: &str, value: T) -> bool {
        match self.position(key) {
            Some(at) => {
                self.items[at].1 = Arc::new(value);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // The adapter contract
    // ------------------------------------------------------------------

    pub fn answer_fetch(&self, cmd: &FetchCommand) -> Result<FetchPage<T>, FetchError> {
        if let Some(error) = self.fail_fetches {
            return Err(error);
        }
        let len = self.items.len();
        let pos = match &cmd.anchor {
            FetchAnchor::Key(key) => self.position(key).ok_or(FetchError::DoesNotExist)?,
            FetchAnchor::Description(prefix) => self
                .items
                .iter()
                .position(|(k, _)| k.starts_with(prefix.as_str()))
                .ok_or(FetchError::DoesNotExist)?,
            FetchAnchor::Index(index) => {
                if (*index as usize) < len {
                    *index as usize
                } else {
                    return Err(FetchError::DoesNotExist);
                }
            }
            FetchAnchor::Start | FetchAnchor::End => {
                if len == 0 {
                    return Ok(FetchPage {
                        items: Vec::new(),
                        offset: 0,
                        absolute_index: None,
                        total_count: self.caps.count.then_some(0),
                    });
                }
                if matches!(cmd.anchor, FetchAnchor::Start) {
                    0
                } else {
                    len - 1
                }
            }
        };

        let lo = pos.saturating_sub(cmd.before);
        let hi = (pos + cmd.after + 1).min(len);
        Ok(FetchPage {
            items: self.items[lo..hi]
                .iter()
                .map(|(k, v)| PageItem::new(k.clone(), Arc::clone(v)))
                .collect(),
            offset: pos - lo,
            absolute_index: Some(pos as u64),
            total_count: self.caps.count.then_some(len as u64),
        })
    }

    pub fn answer_count(&self) -> Result<u64, FetchError> {
        if let Some(error) = self.fail_fetches {
            return Err(error);
        }
        Ok(self.items.len() as u64)
    }

    pub fn apply_edit(&mut self, cmd: &EditCommand<T>) -> Result<EditAck, EditFailure> {
        if let Some(failure) = self.fail_next_edit.take() {
            return Err(failure);
        }
        match &cmd.kind {
            EditCommandKind::InsertAtStart { key, data } => {
                let key = self.accept_key(key)?;
                self.items.insert(0, (key.clone(), Arc::clone(data)));
                Ok(EditAck {
                    key: Some(key),
                    index: Some(0),
                })
            }
            EditCommandKind::InsertAtEnd { key, data } => {
                let key = self.accept_key(key)?;
                self.items.push((key.clone(), Arc::clone(data)));
                Ok(EditAck {
                    key: Some(key),
                    index: Some(self.items.len() as u64 - 1),
                })
            }
            EditCommandKind::InsertBefore {
                key,
                data,
                next_key,
            } => {
                let at = self
                    .position(next_key)
                    .ok_or(EditFailure::NoLongerMeaningful)?;
                let key = self.accept_key(key)?;
                self.items.insert(at, (key.clone(), Arc::clone(data)));
                Ok(EditAck {
                    key: Some(key),
                    index: Some(at as u64),
                })
            }
            EditCommandKind::InsertAfter {
                key,
                data,
                prev_key,
            } => {
                let at = self
                    .position(prev_key)
                    .ok_or(EditFailure::NoLongerMeaningful)?;
                let key = self.accept_key(key)?;
                self.items.insert(at + 1, (key.clone(), Arc::clone(data)));
                Ok(EditAck {
                    key: Some(key),
                    index: Some(at as u64 + 1),
                })
            }
            EditCommandKind::Change { key, data } => {
                let at = self.position(key).ok_or(EditFailure::NoLongerMeaningful)?;
                self.items[at].1 = Arc::clone(data);
                Ok(EditAck::default())
            }
            EditCommandKind::MoveToStart { key } => self.ack_move(key, 0),
            EditCommandKind::MoveToEnd { key } => {
                let to = self.items.len().saturating_sub(1);
                self.ack_move(key, to)
            }
            EditCommandKind::MoveBefore { key, next_key } => {
                let mut to = self
                    .position(next_key)
                    .ok_or(EditFailure::NoLongerMeaningful)?;
                if let Some(from) = self.position(key) {
                    if from < to {
                        to -= 1;
                    }
                }
                self.ack_move(key, to)
            }
            EditCommandKind::MoveAfter { key, prev_key } => {
                let mut to = self
                    .position(prev_key)
                    .ok_or(EditFailure::NoLongerMeaningful)?
                    + 1;
                if let Some(from) = self.position(key) {
                    if from < to {
                        to -= 1;
                    }
                }
                self.ack_move(key, to)
            }
            EditCommandKind::Remove { key } => {
                if !self.remove(key) {
                    return Err(EditFailure::NoLongerMeaningful);
                }
                Ok(EditAck::default())
            }
        }
    }

    fn accept_key(&mut self, key: &Option<ItemKey>) -> Result<ItemKey, EditFailure> {
        match key {
            Some(key) => {
                if self.position(key).is_some() {
                    return Err(EditFailure::NotPermitted);
                }
                Ok(key.clone())
            }
            None => {
                self.next_generated_key += 1;
                Ok(format!("generated-{}", self.next_generated_key))
            }
        }
    }

    fn ack_move(&mut self, key: &str, to: usize) -> Result<EditAck, EditFailure> {
        if !self.relocate(key, to) {
            return Err(EditFailure::NoLongerMeaningful);
        }
        Ok(EditAck {
            key: None,
            index: Some(to as u64),
        })
    }
}

impl<T> Default for VecSource<T> {
    fn default() -> Self {
        Self::new()
    }
}
