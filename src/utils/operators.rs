// src/utils/operators.rs
//! Operators recombining channels: per-tuple transforms, pairing with a shared value,
//! key joins, the collect barrier and labelled fan-out.
//!
//! Every operator runs as a task on the [`Executor`], so a failure inside one (a strict
//! join mismatch, a closed value channel) is reported like any stage failure.

use std::collections::hash_map::Entry;

use futures::StreamExt;
use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};
use log::{debug, info, warn};

use crate::config::defs::PipelineError;
use crate::utils::executor::Executor;
use crate::utils::streams::{Keyed, QueueChannel, ValueChannel};


/// Which unmatched keys a strict join reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Every left key must appear on the right.
    LeftOnly,
    /// Every key on either side must appear on the other.
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Fail the run on the first unmatched or repeated key.
    Strict(Direction),
    /// Emit matched pairs only.
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOrder {
    /// Items in the order they arrived; varies between runs.
    Arrival,
    /// Items sorted by key.
    ByKey,
}


/// Applies `f` to every tuple.
pub fn map<A, B, F>(exec: &Executor, name: &str, input: &QueueChannel<A>, f: F) -> QueueChannel<B>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    F: Fn(A) -> Result<B, PipelineError> + Send + 'static,
{
    let (tx, output) = QueueChannel::new(name);
    let mut sub = input.subscribe();
    exec.spawn(format!("map {}", name), async move {
        while let Some(item) = sub.next().await {
            tx.emit(f(item)?)?;
        }
        Ok(())
    });
    output
}


/// Forwards only the tuples satisfying `keep`.
pub fn filter<A, F>(exec: &Executor, name: &str, input: &QueueChannel<A>, keep: F) -> QueueChannel<A>
where
    A: Clone + Send + 'static,
    F: Fn(&A) -> bool + Send + 'static,
{
    let (tx, output) = QueueChannel::new(name);
    let mut sub = input.subscribe();
    let label = name.to_string();
    exec.spawn(format!("filter {}", name), async move {
        let (mut kept, mut dropped) = (0usize, 0usize);
        while let Some(item) = sub.next().await {
            if keep(&item) {
                kept += 1;
                tx.emit(item)?;
            } else {
                dropped += 1;
            }
        }
        debug!("{}: kept {}, dropped {}", label, kept, dropped);
        Ok(())
    });
    output
}


/// Pairs every tuple of `queue` with the single value of `value`.
/// Nothing is emitted until the value is resolved.
pub fn combine<A, V>(exec: &Executor, name: &str, queue: &QueueChannel<A>, value: &ValueChannel<V>) -> QueueChannel<(A, V)>
where
    A: Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    let (tx, output) = QueueChannel::new(name);
    let mut sub = queue.subscribe();
    let value = value.clone();
    exec.spawn(format!("combine {}", name), async move {
        let v = value.get().await?;
        while let Some(item) = sub.next().await {
            tx.emit((item, v.clone()))?;
        }
        Ok(())
    });
    output
}


/// Key join of two queue channels on [`Keyed::key`].
pub fn join<L, R>(exec: &Executor, name: &str, left: &QueueChannel<L>, right: &QueueChannel<R>, mode: JoinMode) -> QueueChannel<(L, R)>
where
    L: Keyed + Clone + Send + 'static,
    R: Keyed + Clone + Send + 'static,
{
    join_by(exec, name, left, right, |l: &L| l.key().to_string(), |r: &R| r.key().to_string(), mode)
}


/// Key join with explicit key functions. Pairs are emitted as soon as both sides of a key
/// have arrived. Once both inputs close, leftover keys are handled according to `mode`.
///
/// # Arguments
///
/// * `left`, `right` - Input channels.
/// * `left_key`, `right_key` - Key extraction.
/// * `mode` - Strict (fail on unmatched/repeated keys) or Drop (inner join).
///
/// # Returns
/// Channel of matched `(left, right)` pairs.
pub fn join_by<L, R, FL, FR>(
    exec: &Executor,
    name: &str,
    left: &QueueChannel<L>,
    right: &QueueChannel<R>,
    left_key: FL,
    right_key: FR,
    mode: JoinMode,
) -> QueueChannel<(L, R)>
where
    L: Clone + Send + 'static,
    R: Clone + Send + 'static,
    FL: Fn(&L) -> String + Send + 'static,
    FR: Fn(&R) -> String + Send + 'static,
{
    let (tx, output) = QueueChannel::new(name);
    let mut left_sub = left.subscribe();
    let mut right_sub = right.subscribe();
    let operator = name.to_string();

    exec.spawn(format!("join {}", name), async move {
        let mut pending_left: HashMap<String, L> = HashMap::default();
        let mut pending_right: HashMap<String, R> = HashMap::default();
        let mut matched_keys: HashSet<String> = HashSet::default();
        let (mut left_open, mut right_open) = (true, true);

        let repeated = |key: String, side: &'static str| -> Result<(), PipelineError> {
            match mode {
                JoinMode::Strict(_) => Err(PipelineError::DuplicateKey {
                    operator: operator.clone(),
                    key,
                    side,
                }),
                JoinMode::Drop => {
                    warn!("{}: key '{}' repeated on the {} channel, dropping it", operator, key, side);
                    Ok(())
                }
            }
        };

        while left_open || right_open {
            tokio::select! {
                item = left_sub.next(), if left_open => match item {
                    Some(l) => {
                        let key = left_key(&l);
                        if matched_keys.contains(&key) || pending_left.contains_key(&key) {
                            repeated(key, "left")?;
                        } else if let Some(r) = pending_right.remove(&key) {
                            matched_keys.insert(key);
                            tx.emit((l, r))?;
                        } else {
                            pending_left.insert(key, l);
                        }
                    }
                    None => left_open = false,
                },
                item = right_sub.next(), if right_open => match item {
                    Some(r) => {
                        let key = right_key(&r);
                        match pending_left.entry(key.clone()) {
                            Entry::Occupied(entry) => {
                                let l = entry.remove();
                                matched_keys.insert(key);
                                tx.emit((l, r))?;
                            }
                            Entry::Vacant(_) => {
                                if matched_keys.contains(&key) || pending_right.contains_key(&key) {
                                    repeated(key, "right")?;
                                } else {
                                    pending_right.insert(key, r);
                                }
                            }
                        }
                    }
                    None => right_open = false,
                },
            }
        }

        let mut unmatched_left: Vec<String> = pending_left.into_keys().collect();
        let mut unmatched_right: Vec<String> = pending_right.into_keys().collect();
        unmatched_left.sort();
        unmatched_right.sort();

        match mode {
            JoinMode::Strict(direction) => {
                if let Some(key) = unmatched_left.into_iter().next() {
                    return Err(PipelineError::JoinMismatch { operator, key, side: "left" });
                }
                if direction == Direction::Both {
                    if let Some(key) = unmatched_right.into_iter().next() {
                        return Err(PipelineError::JoinMismatch { operator, key, side: "right" });
                    }
                }
            }
            JoinMode::Drop => {
                if !unmatched_left.is_empty() || !unmatched_right.is_empty() {
                    info!(
                        "{}: dropped {} unmatched left and {} unmatched right keys",
                        operator,
                        unmatched_left.len(),
                        unmatched_right.len()
                    );
                }
            }
        }
        Ok(())
    });
    output
}


/// Barrier gathering every tuple of `input` into one list. The value is emitted only
/// after the input channel has closed.
pub fn collect<A>(exec: &Executor, name: &str, input: &QueueChannel<A>, order: CollectOrder) -> ValueChannel<Vec<A>>
where
    A: Keyed + Clone + Send + Sync + 'static,
{
    let (setter, output) = ValueChannel::pending(name);
    let mut sub = input.subscribe();
    let label = name.to_string();
    let ex = exec.clone();
    exec.spawn(format!("collect {}", name), async move {
        let mut items = Vec::new();
        while let Some(item) = sub.next().await {
            items.push(item);
        }
        // a failed upstream also closes the channel; never release a partial list
        if ex.is_halted() {
            debug!("{}: run halted, not emitting {} collected items", label, items.len());
            return Ok(());
        }
        if order == CollectOrder::ByKey {
            items.sort_by(|a, b| a.key().cmp(b.key()));
        }
        info!("{}: collected {} items", label, items.len());
        setter.set(items);
        Ok(())
    });
    output
}


/// Duplicates every tuple onto `N` independently named channels, so one stream can feed
/// parallel branches.
pub fn multi_map<A, const N: usize>(exec: &Executor, name: &str, input: &QueueChannel<A>, labels: [&str; N]) -> [QueueChannel<A>; N]
where
    A: Clone + Send + 'static,
{
    let mut emitters = Vec::with_capacity(N);
    let outputs: [QueueChannel<A>; N] = std::array::from_fn(|i| {
        let (tx, channel) = QueueChannel::new(format!("{}.{}", name, labels[i]));
        emitters.push(tx);
        channel
    });
    let mut sub = input.subscribe();
    exec.spawn(format!("multi_map {}", name), async move {
        while let Some(item) = sub.next().await {
            for tx in &emitters {
                tx.emit(item.clone())?;
            }
        }
        Ok(())
    });
    outputs
}


/// Transforms a value channel on a blocking thread (file parsing and writing).
pub fn map_value<A, B, F>(exec: &Executor, name: &str, input: &ValueChannel<A>, f: F) -> ValueChannel<B>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    F: FnOnce(A) -> Result<B, PipelineError> + Send + 'static,
{
    let (setter, output) = ValueChannel::pending(name);
    let input = input.clone();
    exec.spawn(format!("map_value {}", name), async move {
        let value = input.get().await?;
        let result = tokio::task::spawn_blocking(move || f(value)).await??;
        setter.set(result);
        Ok(())
    });
    output
}
