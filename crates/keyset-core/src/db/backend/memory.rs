//! Module: db::backend::memory
//! Responsibility: in-process backend implementing the full command contract.
//! Invariants: transaction pipelines apply all-or-nothing; expired keys are
//! invisible; scored-set ties keep insertion order.


use crate::db::backend::{
    Aggregate, Backend, BackendError, Command, Pipeline, PipelineMode, Reply, SetFamily, SetOp,
    SortBy, SortCommand, StoreCommand,
};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const NOT_INTEGER: &str = "ERR value is not an integer or out of range";
const NOT_FLOAT: &str = "ERR One or more scores can't be converted into double";

///
/// BackendStats
/// Counters for asserting round-trips and write volume in tests.
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BackendStats {
    /// Commands executed, single or pipelined.
    pub commands: u64,
    /// Write commands applied.
    pub writes: u64,
    /// Pipelines executed.
    pub pipelines: u64,
    /// Round-trips (one per single command or pipeline).
    pub round_trips: u64,
}

///
/// ScoreKey
/// Total order over scores.
///

#[derive(Clone, Copy, Debug)]
struct ScoreKey(f64);

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

///
/// ScoredSet
///
/// Members ordered by (score, insertion sequence). A member keeps its
/// sequence when its score changes.
///

#[derive(Clone, Debug, Default)]
struct ScoredSet {
    members: HashMap<String, (f64, u64)>,
    order: BTreeSet<(ScoreKey, u64, String)>,
    next_seq: u64,
}

impl ScoredSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        if let Some((old, seq)) = self.members.get_mut(member) {
            self.order.remove(&(ScoreKey(*old), *seq, member.to_string()));
            *old = score;
            self.order.insert((ScoreKey(score), *seq, member.to_string()));
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(member.to_string(), (score, seq));
        self.order.insert((ScoreKey(score), seq, member.to_string()));
        true
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.members.remove(member) {
            Some((score, seq)) => {
                self.order.remove(&(ScoreKey(score), seq, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn score(&self, member: &str) -> Option<f64> {
        self.members.get(member).map(|(score, _)| *score)
    }

    fn rank(&self, member: &str) -> Option<usize> {
        let (score, seq) = self.members.get(member)?;
        self.order
            .iter()
            .position(|(s, q, _)| *s == ScoreKey(*score) && q == seq)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.order
            .iter()
            .map(|(score, _, member)| (member.as_str(), score.0))
    }

    fn from_ordered(entries: impl IntoIterator<Item = (String, f64)>) -> Self {
        let mut set = Self::default();
        for (member, score) in entries {
            set.insert(&member, score);
        }
        set
    }
}

///
/// Entry
///

#[derive(Clone, Debug)]
enum Entry {
    Text(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    ZSet(ScoredSet),
    List(Vec<String>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Hash(map) => map.is_empty(),
            Self::Set(set) => set.is_empty(),
            Self::ZSet(set) => set.len() == 0,
            Self::List(list) => list.is_empty(),
        }
    }
}

#[derive(Clone, Debug)]
struct Slot {
    entry: Entry,
    expires_at: Option<Duration>,
}

///
/// Keyspace
/// Key -> slot map evaluated against a logical `now`.
///

#[derive(Clone, Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
}

impl Keyspace {
    fn purge(&mut self, key: &str, now: Duration) {
        if self
            .slots
            .get(key)
            .is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= now))
        {
            self.slots.remove(key);
        }
    }

    fn purge_all(&mut self, now: Duration) {
        self.slots
            .retain(|_, slot| slot.expires_at.is_none_or(|at| at > now));
    }

    fn entry(&mut self, key: &str, now: Duration) -> Option<&Entry> {
        self.purge(key, now);
        self.slots.get(key).map(|slot| &slot.entry)
    }

    fn entry_mut(&mut self, key: &str, now: Duration) -> Option<&mut Entry> {
        self.purge(key, now);
        self.slots.get_mut(key).map(|slot| &mut slot.entry)
    }

    fn entry_or_insert(&mut self, key: &str, now: Duration, make: fn() -> Entry) -> &mut Entry {
        self.purge(key, now);
        &mut self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                entry: make(),
                expires_at: None,
            })
            .entry
    }

    /// Overwrite `key`, clearing any expiry; empty containers remove it.
    fn put(&mut self, key: &str, entry: Entry) {
        if entry.is_empty() {
            self.slots.remove(key);
        } else {
            self.slots.insert(
                key.to_string(),
                Slot {
                    entry,
                    expires_at: None,
                },
            );
        }
    }

    fn prune_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|slot| slot.entry.is_empty()) {
            self.slots.remove(key);
        }
    }

    fn scored_view(&mut self, key: &str, now: Duration) -> Result<Vec<(String, f64)>, String> {
        match self.entry(key, now) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().map(|m| (m.clone(), 1.0)).collect()),
            Some(Entry::ZSet(set)) => Ok(set.iter().map(|(m, s)| (m.to_string(), s)).collect()),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn plain_view(&mut self, key: &str, now: Duration) -> Result<BTreeSet<String>, String> {
        match self.entry(key, now) {
            None => Ok(BTreeSet::new()),
            Some(Entry::Set(set)) => Ok(set.clone()),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    fn sort_source(&mut self, key: &str, now: Duration) -> Result<Vec<String>, String> {
        match self.entry(key, now) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Entry::ZSet(set)) => Ok(set.iter().map(|(m, _)| m.to_string()).collect()),
            Some(Entry::List(list)) => Ok(list.clone()),
            Some(_) => Err(WRONGTYPE.to_string()),
        }
    }

    /// Resolve `prefix:*->field` (or `prefix:*`, or `#`) for one member.
    fn lookup_pattern(&mut self, pattern: &str, member: &str, now: Duration) -> Option<String> {
        if pattern == "#" {
            return Some(member.to_string());
        }

        let (key_pattern, field) = match pattern.split_once("->") {
            Some((key, field)) => (key, Some(field)),
            None => (pattern, None),
        };
        let key = key_pattern.replacen('*', member, 1);

        match (self.entry(&key, now)?, field) {
            (Entry::Hash(map), Some(field)) => map.get(field).cloned(),
            (Entry::Text(value), None) => Some(value.clone()),
            _ => None,
        }
    }

    #[expect(clippy::too_many_lines)]
    fn apply(&mut self, command: &Command, now: Duration) -> Result<Reply, String> {
        match command {
            Command::Get { key } => match self.entry(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry::Text(value)) => Ok(Reply::Text(value.clone())),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::Set { key, value } => {
                self.put(key, Entry::Text(value.clone()));
                Ok(Reply::Ok)
            }
            Command::IncrBy { key, delta } => {
                let Entry::Text(raw) =
                    self.entry_or_insert(key, now, || Entry::Text("0".to_string()))
                else {
                    return Err(WRONGTYPE.to_string());
                };
                let current: i64 = raw.parse().map_err(|_| NOT_INTEGER.to_string())?;
                let next = current
                    .checked_add(*delta)
                    .ok_or_else(|| NOT_INTEGER.to_string())?;
                *raw = next.to_string();
                Ok(Reply::Int(next))
            }

            Command::HSet { key, pairs } => {
                let Entry::Hash(map) = self.entry_or_insert(key, now, || Entry::Hash(BTreeMap::new()))
                else {
                    return Err(WRONGTYPE.to_string());
                };
                let added = pairs
                    .iter()
                    .filter(|(field, value)| map.insert(field.clone(), value.clone()).is_none())
                    .count();
                self.prune_empty(key);
                Ok(Reply::Int(count(added)))
            }
            Command::HGet { key, field } => match self.entry(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry::Hash(map)) => Ok(map.get(field).cloned().map_or(Reply::Nil, Reply::Text)),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::HMGet { key, fields } => match self.entry(key, now) {
                None => Ok(Reply::Array(vec![Reply::Nil; fields.len()])),
                Some(Entry::Hash(map)) => Ok(Reply::Array(
                    fields
                        .iter()
                        .map(|field| map.get(field).cloned().map_or(Reply::Nil, Reply::Text))
                        .collect(),
                )),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::HGetAll { key } => match self.entry(key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry::Hash(map)) => Ok(Reply::Array(
                    map.iter()
                        .flat_map(|(f, v)| [Reply::Text(f.clone()), Reply::Text(v.clone())])
                        .collect(),
                )),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::HDel { key, fields } => {
                let removed = match self.entry_mut(key, now) {
                    None => 0,
                    Some(Entry::Hash(map)) => fields.iter().filter(|f| map.remove(*f).is_some()).count(),
                    Some(_) => return Err(WRONGTYPE.to_string()),
                };
                self.prune_empty(key);
                Ok(Reply::Int(count(removed)))
            }

            Command::SAdd { key, members } => {
                let Entry::Set(set) = self.entry_or_insert(key, now, || Entry::Set(BTreeSet::new()))
                else {
                    return Err(WRONGTYPE.to_string());
                };
                let added = members.iter().filter(|m| set.insert((*m).clone())).count();
                self.prune_empty(key);
                Ok(Reply::Int(count(added)))
            }
            Command::SRem { key, members } => {
                let removed = match self.entry_mut(key, now) {
                    None => 0,
                    Some(Entry::Set(set)) => members.iter().filter(|m| set.remove(*m)).count(),
                    Some(_) => return Err(WRONGTYPE.to_string()),
                };
                self.prune_empty(key);
                Ok(Reply::Int(count(removed)))
            }
            Command::SIsMember { key, member } => match self.entry(key, now) {
                None => Ok(Reply::Int(0)),
                Some(Entry::Set(set)) => Ok(Reply::Int(i64::from(set.contains(member)))),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::SCard { key } => match self.entry(key, now) {
                None => Ok(Reply::Int(0)),
                Some(Entry::Set(set)) => Ok(Reply::Int(count(set.len()))),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::SMembers { key } => match self.entry(key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry::Set(set)) => Ok(Reply::Array(
                    set.iter().cloned().map(Reply::Text).collect(),
                )),
                Some(_) => Err(WRONGTYPE.to_string()),
            },

            Command::ZAdd { key, entries } => {
                if entries.iter().any(|(score, _)| score.is_nan()) {
                    return Err(NOT_FLOAT.to_string());
                }
                let Entry::ZSet(set) =
                    self.entry_or_insert(key, now, || Entry::ZSet(ScoredSet::default()))
                else {
                    return Err(WRONGTYPE.to_string());
                };
                let added = entries
                    .iter()
                    .filter(|(score, member)| set.insert(member, *score))
                    .count();
                self.prune_empty(key);
                Ok(Reply::Int(count(added)))
            }
            Command::ZRem { key, members } => {
                let removed = match self.entry_mut(key, now) {
                    None => 0,
                    Some(Entry::ZSet(set)) => members.iter().filter(|m| set.remove(m)).count(),
                    Some(_) => return Err(WRONGTYPE.to_string()),
                };
                self.prune_empty(key);
                Ok(Reply::Int(count(removed)))
            }
            Command::ZRank { key, member } => match self.entry(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry::ZSet(set)) => Ok(set.rank(member).map_or(Reply::Nil, |r| Reply::Int(count(r)))),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::ZScore { key, member } => match self.entry(key, now) {
                None => Ok(Reply::Nil),
                Some(Entry::ZSet(set)) => Ok(set.score(member).map_or(Reply::Nil, Reply::Float)),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::ZCard { key } => match self.entry(key, now) {
                None => Ok(Reply::Int(0)),
                Some(Entry::ZSet(set)) => Ok(Reply::Int(count(set.len()))),
                Some(_) => Err(WRONGTYPE.to_string()),
            },
            Command::ZRange {
                key,
                start,
                stop,
                reverse,
            } => match self.entry(key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry::ZSet(set)) => {
                    let mut members: Vec<&str> = set.iter().map(|(m, _)| m).collect();
                    if *reverse {
                        members.reverse();
                    }
                    Ok(Reply::Array(
                        slice_range(members.as_slice(), *start, *stop)
                            .iter()
                            .map(|m| Reply::Text((*m).to_string()))
                            .collect(),
                    ))
                }
                Some(_) => Err(WRONGTYPE.to_string()),
            },

            Command::Store(store) => self.apply_store(store, now),

            Command::LRange { key, start, stop } => match self.entry(key, now) {
                None => Ok(Reply::Array(Vec::new())),
                Some(Entry::List(list)) => Ok(Reply::Array(
                    slice_range(list.as_slice(), *start, *stop)
                        .iter()
                        .cloned()
                        .map(Reply::Text)
                        .collect(),
                )),
                Some(_) => Err(WRONGTYPE.to_string()),
            },

            Command::Del { keys } => {
                let removed = keys
                    .iter()
                    .filter(|key| {
                        self.purge(key, now);
                        self.slots.remove(key.as_str()).is_some()
                    })
                    .count();
                Ok(Reply::Int(count(removed)))
            }
            Command::Exists { key } => Ok(Reply::Int(i64::from(self.entry(key, now).is_some()))),
            Command::Expire { key, seconds } => {
                self.purge(key, now);
                match self.slots.get_mut(key) {
                    Some(slot) => {
                        slot.expires_at = Some(now + Duration::from_secs(*seconds));
                        self.purge(key, now);
                        Ok(Reply::Int(1))
                    }
                    None => Ok(Reply::Int(0)),
                }
            }
            Command::Ttl { key } => {
                self.purge(key, now);
                match self.slots.get(key) {
                    None => Ok(Reply::Int(-2)),
                    Some(Slot {
                        expires_at: None, ..
                    }) => Ok(Reply::Int(-1)),
                    Some(Slot {
                        expires_at: Some(at),
                        ..
                    }) => {
                        let remaining = at.saturating_sub(now);
                        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                        Ok(Reply::Int(i64::try_from(secs).unwrap_or(i64::MAX)))
                    }
                }
            }
            Command::Rename { from, to } => {
                self.purge(from, now);
                let slot = self
                    .slots
                    .remove(from)
                    .ok_or_else(|| "ERR no such key".to_string())?;
                self.slots.insert(to.clone(), slot);
                Ok(Reply::Ok)
            }
            Command::Keys { pattern } => {
                self.purge_all(now);
                let mut keys: Vec<&String> = self
                    .slots
                    .keys()
                    .filter(|key| glob_match(pattern, key))
                    .collect();
                keys.sort();
                Ok(Reply::Array(
                    keys.into_iter().cloned().map(Reply::Text).collect(),
                ))
            }
            Command::DelPattern { pattern } => {
                self.purge_all(now);
                let before = self.slots.len();
                self.slots.retain(|key, _| !glob_match(pattern, key));
                Ok(Reply::Int(count(before - self.slots.len())))
            }

            Command::Sort(sort) => self.apply_sort(sort, now),
        }
    }

    fn apply_store(&mut self, store: &StoreCommand, now: Duration) -> Result<Reply, String> {
        if store.keys.is_empty() {
            return Err("ERR at least 1 input key is needed".to_string());
        }

        let entry = match store.family {
            SetFamily::Plain => {
                let mut views = store
                    .keys
                    .iter()
                    .map(|key| self.plain_view(key, now))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter();
                let first = views.next().unwrap_or_default();
                let result = match store.op {
                    SetOp::Inter => views.fold(first, |acc, set| &acc & &set),
                    SetOp::Union => views.fold(first, |acc, set| &acc | &set),
                    SetOp::Diff => views.fold(first, |acc, set| &acc - &set),
                };
                Entry::Set(result)
            }
            SetFamily::Scored => {
                let weights = match &store.weights {
                    Some(weights) if weights.len() != store.keys.len() => {
                        return Err("ERR syntax error".to_string());
                    }
                    Some(weights) => weights.clone(),
                    None => vec![1.0; store.keys.len()],
                };
                let views = store
                    .keys
                    .iter()
                    .map(|key| self.scored_view(key, now))
                    .collect::<Result<Vec<_>, _>>()?;
                Entry::ZSet(ScoredSet::from_ordered(scored_algebra(
                    store.op,
                    &views,
                    &weights,
                    store.aggregate,
                )))
            }
        };

        let card = match &entry {
            Entry::Set(set) => set.len(),
            Entry::ZSet(set) => set.len(),
            _ => 0,
        };
        self.put(&store.dest, entry);

        Ok(Reply::Int(count(card)))
    }

    fn apply_sort(&mut self, sort: &SortCommand, now: Duration) -> Result<Reply, String> {
        let members = self.sort_source(&sort.key, now)?;

        let mut keyed: Vec<(String, Option<String>)> = match &sort.by {
            SortBy::NoSort => members.into_iter().map(|m| (m, None)).collect(),
            SortBy::Member => members
                .into_iter()
                .map(|m| {
                    let weight = m.clone();
                    (m, Some(weight))
                })
                .collect(),
            SortBy::Pattern(pattern) => members
                .into_iter()
                .map(|m| {
                    let weight = self.lookup_pattern(pattern, &m, now);
                    (m, weight)
                })
                .collect(),
        };

        if sort.by != SortBy::NoSort {
            if sort.alpha {
                keyed.sort_by(|(_, a), (_, b)| {
                    let ord = a.as_deref().unwrap_or("").cmp(b.as_deref().unwrap_or(""));
                    if sort.descending { ord.reverse() } else { ord }
                });
            } else {
                let mut numeric = Vec::with_capacity(keyed.len());
                for (member, weight) in keyed {
                    let score = match weight.as_deref() {
                        None | Some("") => 0.0,
                        Some(raw) => raw.parse::<f64>().map_err(|_| NOT_FLOAT.to_string())?,
                    };
                    numeric.push((member, score));
                }
                numeric.sort_by(|(_, a), (_, b)| {
                    let ord = a.total_cmp(b);
                    if sort.descending { ord.reverse() } else { ord }
                });
                keyed = numeric.into_iter().map(|(m, _)| (m, None)).collect();
            }
        }

        let projected: Vec<Option<String>> = keyed
            .into_iter()
            .map(|(member, _)| match &sort.get {
                Some(pattern) => self.lookup_pattern(pattern, &member, now),
                None => Some(member),
            })
            .collect();

        match &sort.store {
            Some(store) => {
                let entry = if store.as_set {
                    Entry::Set(projected.into_iter().flatten().collect())
                } else {
                    Entry::List(
                        projected
                            .into_iter()
                            .map(Option::unwrap_or_default)
                            .collect(),
                    )
                };
                let len = match &entry {
                    Entry::Set(set) => set.len(),
                    Entry::List(list) => list.len(),
                    _ => 0,
                };
                self.put(&store.key, entry);
                Ok(Reply::Int(count(len)))
            }
            None => Ok(Reply::Array(
                projected
                    .into_iter()
                    .map(|v| v.map_or(Reply::Nil, Reply::Text))
                    .collect(),
            )),
        }
    }
}

/// Scored intersection/union/difference over ordered views.
/// Output order follows the first view, then later views for union.
fn scored_algebra(
    op: SetOp,
    views: &[Vec<(String, f64)>],
    weights: &[f64],
    aggregate: Aggregate,
) -> Vec<(String, f64)> {
    let lookups: Vec<HashMap<&str, f64>> = views
        .iter()
        .map(|view| view.iter().map(|(m, s)| (m.as_str(), *s)).collect())
        .collect();
    let combine = |acc: f64, next: f64| match aggregate {
        Aggregate::Sum => acc + next,
        Aggregate::Min => acc.min(next),
        Aggregate::Max => acc.max(next),
    };
    let Some(first) = views.first() else {
        return Vec::new();
    };

    match op {
        SetOp::Inter => first
            .iter()
            .filter_map(|(member, score)| {
                let mut total = score * weights[0];
                for (lookup, weight) in lookups.iter().zip(weights).skip(1) {
                    total = combine(total, lookup.get(member.as_str())? * weight);
                }
                Some((member.clone(), total))
            })
            .collect(),
        SetOp::Union => {
            let mut order: Vec<String> = Vec::new();
            let mut totals: HashMap<String, f64> = HashMap::new();
            for (view, weight) in views.iter().zip(weights) {
                for (member, score) in view {
                    let weighted = score * weight;
                    match totals.get_mut(member) {
                        Some(total) => *total = combine(*total, weighted),
                        None => {
                            order.push(member.clone());
                            totals.insert(member.clone(), weighted);
                        }
                    }
                }
            }
            order
                .into_iter()
                .map(|member| {
                    let total = totals.get(&member).copied().unwrap_or_default();
                    (member, total)
                })
                .collect()
        }
        SetOp::Diff => first
            .iter()
            .filter(|(member, _)| {
                !lookups
                    .iter()
                    .skip(1)
                    .any(|lookup| lookup.contains_key(member.as_str()))
            })
            .cloned()
            .collect(),
    }
}

/// Inclusive `[start, stop]` with negative offsets counted from the end.
fn slice_range<T>(items: &[T], start: i64, stop: i64) -> &[T] {
    let Ok(len) = i64::try_from(items.len()) else {
        return &[];
    };
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return &[];
    }

    match (usize::try_from(start), usize::try_from(stop)) {
        (Ok(start), Ok(stop)) => &items[start..=stop],
        _ => &[],
    }
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let (p, t) = (pattern.as_bytes(), text.as_bytes());
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }

    pi == p.len()
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

///
/// MemoryState
///

#[derive(Debug, Default)]
struct MemoryState {
    keyspace: Keyspace,
    stats: BackendStats,
    offset: Duration,
    fail_next_transaction: Option<String>,
}

///
/// MemoryBackend
///
/// In-process store honoring the backend contract, with a controllable
/// clock for expiry and statistics for round-trip assertions.
///

#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    started: Instant,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Connection("memory backend lock poisoned".to_string()))
    }

    fn now(&self, state: &MemoryState) -> Duration {
        self.started.elapsed() + state.offset
    }

    /// Move the logical clock forward.
    pub fn advance(&self, by: Duration) -> Result<(), BackendError> {
        self.lock()?.offset += by;
        Ok(())
    }

    pub fn stats(&self) -> Result<BackendStats, BackendError> {
        Ok(self.lock()?.stats)
    }

    pub fn reset_stats(&self) -> Result<(), BackendError> {
        self.lock()?.stats = BackendStats::default();
        Ok(())
    }

    /// Number of live keys.
    pub fn key_count(&self) -> Result<usize, BackendError> {
        let mut state = self.lock()?;
        let now = self.now(&state);
        state.keyspace.purge_all(now);

        Ok(state.keyspace.slots.len())
    }

    /// Make the next transaction pipeline abort before applying anything.
    pub fn fail_next_transaction(&self, message: impl Into<String>) -> Result<(), BackendError> {
        self.lock()?.fail_next_transaction = Some(message.into());
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn execute(&self, command: Command) -> Result<Reply, BackendError> {
        let mut state = self.lock()?;
        let now = self.now(&state);
        state.stats.commands += 1;
        state.stats.round_trips += 1;

        let reply = state
            .keyspace
            .apply(&command, now)
            .map_err(|message| BackendError::Command {
                command: command.name(),
                message,
            })?;
        if command.is_write() {
            state.stats.writes += 1;
        }

        Ok(reply)
    }

    fn execute_pipeline(
        &self,
        pipeline: Pipeline,
        mode: PipelineMode,
    ) -> Result<Vec<Reply>, BackendError> {
        let mut state = self.lock()?;
        let now = self.now(&state);
        state.stats.pipelines += 1;
        state.stats.round_trips += 1;

        let commands = pipeline.into_commands();

        match mode {
            PipelineMode::Batch => {
                let mut replies = Vec::with_capacity(commands.len());
                for command in &commands {
                    state.stats.commands += 1;
                    match state.keyspace.apply(command, now) {
                        Ok(reply) => {
                            if command.is_write() {
                                state.stats.writes += 1;
                            }
                            replies.push(reply);
                        }
                        Err(message) => replies.push(Reply::Error(message)),
                    }
                }
                Ok(replies)
            }
            PipelineMode::Transaction => {
                if let Some(message) = state.fail_next_transaction.take() {
                    return Err(BackendError::Aborted { index: 0, message });
                }

                let mut staged = state.keyspace.clone();
                let mut replies = Vec::with_capacity(commands.len());
                for (index, command) in commands.iter().enumerate() {
                    let reply = staged
                        .apply(command, now)
                        .map_err(|message| BackendError::Aborted { index, message })?;
                    replies.push(reply);
                }

                state.keyspace = staged;
                state.stats.commands += commands.len() as u64;
                state.stats.writes += commands.iter().filter(|c| c.is_write()).count() as u64;
                Ok(replies)
            }
        }
    }
}
