//! Pure planning for refresh reconciliation.
//!
//! Given the live topology (sequences of resolved keys and placeholders) and
//! a freshly rebuilt shadow topology, this module decides which identities
//! stay put, which move, which appear, and which disappear — minimizing move
//! notifications by keeping the longest order-preserved run of identities
//! stationary (patience-sorting LIS over ordinal positions).

use rustc_hash::{FxHashMap, FxHashSet};

use crate::patience::longest_increasing_run;
use crate::types::ItemKey;

/// The live list, reduced for planning: one entry per sequence of the list
/// proper, each a run of resolved keys (`Some`) and placeholders (`None`).
/// The first entry is the sequence containing the list-start sentinel, the
/// last the one containing the list-end sentinel.
pub(crate) type LiveView = Vec<Vec<Option<ItemKey>>>;

/// The shadow topology: sequences of resolved keys, left to right.
pub(crate) type ShadowView = Vec<Vec<ItemKey>>;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ReconcilePlan {
    /// `(live sequence, shadow sequence)` pairs in shadow order; `None`
    /// means the shadow sequence has no live counterpart and is built from
    /// scratch.
    pub(crate) pairs: Vec<(Option<usize>, usize)>,
    /// Per pair: the stationary keys, in shadow order. Everything else in
    /// the shadow sequence is either moved in from elsewhere in the live
    /// list or inserted fresh.
    pub(crate) stationary: Vec<Vec<ItemKey>>,
    /// Live resolved keys that appear nowhere in the shadow: removals.
    pub(crate) removed: Vec<ItemKey>,
}

pub(crate) fn plan(live: &LiveView, shadow: &ShadowView) -> ReconcilePlan {
    let mut shadow_keys: FxHashSet<&ItemKey> = FxHashSet::default();
    for seq in shadow {
        shadow_keys.extend(seq.iter());
    }

    // Removals: previously observed identities the rebuilt topology no
    // longer contains. Every such identity was re-queried as an anchor, so
    // absence is authoritative.
    let mut removed = Vec::new();
    for seq in live {
        for key in seq.iter().flatten() {
            if !shadow_keys.contains(key) {
                removed.push(key.clone());
            }
        }
    }

    let pairs = match_sequences(live, shadow);

    // Stationary selection per matched pair.
    let mut stationary = Vec::with_capacity(pairs.len());
    for &(live_idx, shadow_idx) in &pairs {
        let Some(live_idx) = live_idx else {
            stationary.push(Vec::new());
            continue;
        };
        stationary.push(stationary_keys(&live[live_idx], &shadow[shadow_idx]));
    }

    ReconcilePlan {
        pairs,
        stationary,
        removed,
    }
}

/// Greedy, order-preserving sequence matching: each live sequence is matched
/// with the shadow sequence it shares the most identities with, subject to
/// matches never crossing. The sequence containing the list-start sentinel
/// always matches the shadow's first sequence, and the one containing the
/// list-end sentinel always matches the shadow's last, unconditionally.
fn match_sequences(live: &LiveView, shadow: &ShadowView) -> Vec<(Option<usize>, usize)> {
    if shadow.is_empty() {
        return Vec::new();
    }
    let last_shadow = shadow.len() - 1;
    let last_live = live.len().saturating_sub(1);

    // Shared-identity counts per (live, shadow) pair, via one key → live
    // sequence index map.
    let mut key_home: FxHashMap<&ItemKey, usize> = FxHashMap::default();
    for (l, seq) in live.iter().enumerate() {
        for key in seq.iter().flatten() {
            key_home.insert(key, l);
        }
    }
    let mut score: FxHashMap<(usize, usize), usize> = FxHashMap::default();
    for (s, seq) in shadow.iter().enumerate() {
        for key in seq {
            if let Some(&l) = key_home.get(key) {
                *score.entry((l, s)).or_insert(0) += 1;
            }
        }
    }

    let mut assigned: Vec<Option<usize>> = vec![None; shadow.len()];
    // Sentinel forcing: start with start, end with end. With a single live
    // sequence the two coincide and only the start forcing applies.
    assigned[0] = Some(0);
    if last_shadow > 0 && last_live > 0 {
        assigned[last_shadow] = Some(last_live);
    }

    // Interior: walk live sequences left to right, each claiming its
    // best-scoring unclaimed shadow sequence to the right of the previous
    // claim (claims never cross, which is what keeps moves minimal).
    let mut next_shadow = 1usize;
    for l in 1..last_live {
        if next_shadow >= last_shadow {
            break;
        }
        let mut best: Option<(usize, usize)> = None; // (score, shadow idx)
        for s in next_shadow..last_shadow {
            let sc = score.get(&(l, s)).copied().unwrap_or(0);
            if sc > 0 && best.map(|(b, _)| sc > b).unwrap_or(true) {
                best = Some((sc, s));
            }
        }
        if let Some((_, s)) = best {
            assigned[s] = Some(l);
            next_shadow = s + 1;
        }
    }

    assigned
        .into_iter()
        .enumerate()
        .map(|(s, l)| (l, s))
        .collect()
}

/// The largest set of identities shared by one live/shadow sequence pair
/// whose relative order is unchanged, in shadow order.
fn stationary_keys(live_seq: &[Option<ItemKey>], shadow_seq: &[ItemKey]) -> Vec<ItemKey> {
    let shadow_pos: FxHashMap<&ItemKey, usize> = shadow_seq
        .iter()
        .enumerate()
        .map(|(i, k)| (k, i))
        .collect();

    // Shared keys in live order, mapped to their shadow ordinals.
    let mut shared: Vec<(&ItemKey, usize)> = Vec::new();
    for key in live_seq.iter().flatten() {
        if let Some(&pos) = shadow_pos.get(key) {
            shared.push((key, pos));
        }
    }

    let ordinals: Vec<usize> = shared.iter().map(|(_, pos)| *pos).collect();
    let run = longest_increasing_run(&ordinals);
    run.into_iter().map(|i| shared[i].0.clone()).collect()
}
