use std::sync::Arc;

use virtualdata::{
    BindingId, Command, ListEngine, ListEvent, ListItem, ListOptions, PageItem, RequestId,
};

use crate::VecSource;

/// A synchronous pump coupling a [`virtualdata::ListEngine`] to a
/// [`VecSource`].
///
/// Real hosts forward engine commands to their store asynchronously; the
/// driver runs the same loop inline, which is exactly what tests, demos, and
/// synchronous hosts want:
/// - `settle()` drains commands, answers them from the source, and repeats
///   until the pair is quiescent.
/// - `take_events()` collects everything the engine produced.
pub struct Driver<T> {
    engine: ListEngine<T>,
    source: VecSource<T>,
    events: Vec<(Option<BindingId>, ListEvent<T>)>,
}

impl<T: PartialEq> Driver<T> {
    pub fn new(source: VecSource<T>) -> Self {
        Self::with_options(source, ListOptions::new())
    }

    pub fn with_options(source: VecSource<T>, options: ListOptions) -> Self {
        Self {
            engine: ListEngine::new(source.capabilities(), options),
            source,
            events: Vec::new(),
        }
    }

    pub fn engine(&self) -> &ListEngine<T> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ListEngine<T> {
        &mut self.engine
    }

    pub fn source(&self) -> &VecSource<T> {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut VecSource<T> {
        &mut self.source
    }

    /// Processes one batch of queued commands. Returns `false` when there
    /// was nothing to do.
    pub fn step(&mut self) -> bool {
        let mut commands = Vec::new();
        self.engine.drain_commands(|c| commands.push(c));
        if commands.is_empty() {
            self.collect_events();
            return false;
        }
        for cmd in commands {
            match cmd {
                Command::Fetch(fetch) => {
                    let outcome = self.source.answer_fetch(&fetch);
                    self.engine
                        .complete_fetch(fetch.fetch, outcome)
                        .expect("source answered within contract");
                }
                Command::Count { fetch, .. } => {
                    let outcome = self.source.answer_count();
                    self.engine
                        .complete_count(fetch, outcome)
                        .expect("source answered within contract");
                }
                Command::Edit(edit) => {
                    let outcome = self.source.apply_edit(&edit);
                    self.engine
                        .complete_edit(edit.edit, outcome)
                        .expect("source answered within contract");
                }
                Command::BeginEdits | Command::EndEdits => {}
                Command::Schedule(_) => self.engine.run_low_priority_work(),
            }
        }
        self.collect_events();
        true
    }

    /// Pumps until the engine stops producing work.
    pub fn settle(&mut self) {
        while self.step() {}
    }

    fn collect_events(&mut self) {
        self.engine
            .drain_events(|binding, event| self.events.push((binding, event)));
    }

    /// Returns (and clears) everything the engine has emitted so far.
    pub fn take_events(&mut self) -> Vec<(Option<BindingId>, ListEvent<T>)> {
        self.collect_events();
        std::mem::take(&mut self.events)
    }

    /// Requests an item by key and settles; a convenience for synchronous
    /// callers.
    pub fn get_by_key(&mut self, key: &str) -> Option<ListItem<T>> {
        let request = self.engine.item_from_key(key).ok()?;
        self.settle();
        self.find_resolution(request)
    }

    /// Requests an item by absolute index and settles.
    pub fn get_by_index(&mut self, index: u64) -> Option<ListItem<T>> {
        let request = self.engine.item_from_index(index).ok()?;
        self.settle();
        self.find_resolution(request)
    }

    fn find_resolution(&mut self, request: RequestId) -> Option<ListItem<T>> {
        self.collect_events();
        self.events.iter().find_map(|(_, event)| match event {
            ListEvent::ItemAvailable {
                request: r,
                item: Some(item),
            } if *r == request => Some(item.clone()),
            _ => None,
        })
    }

    /// Pushes an adapter-side insertion through the engine's notification
    /// handler (the store is updated first, sharing one payload allocation).
    pub fn notify_inserted_after(&mut self, prev_key: &str, key: &str, value: T) {
        let at = match self.source.position(prev_key) {
            Some(at) => at + 1,
            None => self.source.len(),
        };
        let data = Arc::new(value);
        self.source.insert_shared(at, key, Arc::clone(&data));
        let next_key = self.source.keys().get(at + 1).cloned();
        self.engine
            .notify_inserted(
                PageItem::new(key, data),
                Some(prev_key),
                next_key.as_deref(),
                Some(at as u64),
            )
            .expect("key is non-empty");
        self.settle();
    }
}
