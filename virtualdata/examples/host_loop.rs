//! A minimal host loop against the raw engine: drain commands, answer them,
//! drain events. This is the whole integration contract; everything else
//! (threads, async runtimes) is just a fancier version of this loop.
//!
//! Run with: `cargo run -p virtualdata --example host_loop`

use std::sync::Arc;

use virtualdata::{
    Capabilities, Command, FetchAnchor, FetchCommand, FetchError, FetchPage, ListEngine,
    ListEvent, ListOptions, PageItem,
};

/// The "backing store": a vector the engine never sees directly.
struct Store {
    rows: Vec<(String, Arc<String>)>,
}

impl Store {
    fn answer(&self, cmd: &FetchCommand) -> Result<FetchPage<String>, FetchError> {
        let len = self.rows.len();
        let pos = match &cmd.anchor {
            FetchAnchor::Key(key) => self
                .rows
                .iter()
                .position(|(k, _)| k == key)
                .ok_or(FetchError::DoesNotExist)?,
            FetchAnchor::Index(i) => {
                if (*i as usize) < len {
                    *i as usize
                } else {
                    return Err(FetchError::DoesNotExist);
                }
            }
            FetchAnchor::Start => 0,
            FetchAnchor::End => len.saturating_sub(1),
            FetchAnchor::Description(_) => return Err(FetchError::DoesNotExist),
        };
        let lo = pos.saturating_sub(cmd.before);
        let hi = (pos + cmd.after + 1).min(len);
        Ok(FetchPage {
            items: self.rows[lo..hi]
                .iter()
                .map(|(k, v)| PageItem::new(k.clone(), Arc::clone(v)))
                .collect(),
            offset: pos - lo,
            absolute_index: Some(pos as u64),
            total_count: Some(len as u64),
        })
    }
}

fn main() {
    let store = Store {
        rows: (0..100)
            .map(|i| (format!("key-{i}"), Arc::new(format!("value {i}"))))
            .collect(),
    };
    let mut engine: ListEngine<String> =
        ListEngine::new(Capabilities::full(), ListOptions::new());

    let request = engine.item_from_index(42).unwrap();

    // The host loop.
    loop {
        let mut commands = Vec::new();
        engine.drain_commands(|c| commands.push(c));
        if commands.is_empty() {
            break;
        }
        for cmd in commands {
            match cmd {
                Command::Fetch(fetch) => {
                    let outcome = store.answer(&fetch);
                    engine.complete_fetch(fetch.fetch, outcome).unwrap();
                }
                Command::Count { fetch, .. } => {
                    engine
                        .complete_count(fetch, Ok(store.rows.len() as u64))
                        .unwrap();
                }
                Command::Schedule(_) => engine.run_low_priority_work(),
                Command::Edit(_) | Command::BeginEdits | Command::EndEdits => {}
            }
        }
    }

    engine.drain_events(|_, event| {
        if let ListEvent::ItemAvailable {
            request: r,
            item: Some(item),
        } = event
        {
            if r == request {
                println!("resolved: {} at {:?} -> {}", item.key, item.index, item.data);
            }
        }
    });
}
