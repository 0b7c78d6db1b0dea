//! Priority tags and the ordering they induce.
//!
//! Listeners and directory definitions carry a [`Priority`] that says where
//! they sit relative to their siblings:
//!
//! | tag          | meaning                                  |
//! |--------------|------------------------------------------|
//! | `first`      | ahead of every untagged entry            |
//! | `last`       | behind every untagged entry              |
//! | `before:x`   | ahead of every entry named `x`           |
//! | `after:x`    | behind every entry named `x`             |
//! | `<integer>`  | higher numbers sort earlier              |
//!
//! The ordering is computed once, when a chain or proxy map is assembled,
//! by a stable topological sort: entries that are otherwise unconstrained
//! keep their declaration order.

use crate::result::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

/// Relative position of a named entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawPriority", into = "String")]
pub enum Priority {
    /// Ahead of all unconstrained entries
    First,
    /// Behind all unconstrained entries
    Last,
    /// Ahead of the named entry
    Before(String),
    /// Behind the named entry
    After(String),
    /// Numeric weight; higher sorts earlier
    Numeric(i32),
    /// No constraint
    #[default]
    Unordered,
}

impl Priority {
    /// `before:<name>`
    #[must_use]
    pub fn before(name: impl Into<String>) -> Self {
        Self::Before(name.into())
    }

    /// `after:<name>`
    #[must_use]
    pub fn after(name: impl Into<String>) -> Self {
        Self::After(name.into())
    }

    const fn group(&self) -> u8 {
        match self {
            Self::First => 0,
            Self::Last => 2,
            _ => 1,
        }
    }

    fn weight(&self) -> i64 {
        match self {
            Self::Numeric(n) => i64::from(*n),
            _ => 0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Last => write!(f, "last"),
            Self::Before(name) => write!(f, "before:{name}"),
            Self::After(name) => write!(f, "after:{name}"),
            Self::Numeric(n) => write!(f, "{n}"),
            Self::Unordered => Ok(()),
        }
    }
}

impl FromStr for Priority {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::Unordered);
        }
        if s == "first" {
            return Ok(Self::First);
        }
        if s == "last" {
            return Ok(Self::Last);
        }
        if let Some(name) = s.strip_prefix("before:") {
            return non_empty_reference(s, name).map(Self::Before);
        }
        if let Some(name) = s.strip_prefix("after:") {
            return non_empty_reference(s, name).map(Self::After);
        }
        s.parse::<i32>()
            .map(Self::Numeric)
            .map_err(|_| HarnessError::priority(format!("unrecognised priority '{s}'")))
    }
}

fn non_empty_reference(tag: &str, name: &str) -> HarnessResult<String> {
    if name.is_empty() {
        Err(HarnessError::priority(format!(
            "priority '{tag}' does not name an entry"
        )))
    } else {
        Ok(name.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPriority {
    Number(i32),
    Text(String),
}

impl TryFrom<RawPriority> for Priority {
    type Error = HarnessError;

    fn try_from(raw: RawPriority) -> Result<Self, Self::Error> {
        match raw {
            RawPriority::Number(n) => Ok(Self::Numeric(n)),
            RawPriority::Text(s) => s.parse(),
        }
    }
}

impl From<Priority> for String {
    fn from(priority: Priority) -> Self {
        priority.to_string()
    }
}

/// An entry awaiting ordering
#[derive(Debug, Clone)]
pub struct Prioritized<T> {
    /// Name other entries may refer to
    pub name: String,
    /// Position constraint
    pub priority: Priority,
    /// Payload
    pub item: T,
}

impl<T> Prioritized<T> {
    /// Wrap an item
    #[must_use]
    pub fn new(name: impl Into<String>, priority: Priority, item: T) -> Self {
        Self {
            name: name.into(),
            priority,
            item,
        }
    }
}

/// Order entries by priority, preserving declaration order among equals.
///
/// # Errors
///
/// Fails when a `before:`/`after:` tag names no other entry or when the
/// constraints form a cycle.
pub fn order_by_priority<T>(entries: Vec<Prioritized<T>>) -> HarnessResult<Vec<Prioritized<T>>> {
    let count = entries.len();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut indegree = vec![0_usize; count];

    for (i, entry) in entries.iter().enumerate() {
        let (target, entry_first) = match &entry.priority {
            Priority::Before(name) => (name, true),
            Priority::After(name) => (name, false),
            _ => continue,
        };
        let matches: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(j, other)| *j != i && &other.name == target)
            .map(|(j, _)| j)
            .collect();
        if matches.is_empty() {
            return Err(HarnessError::priority(format!(
                "'{}' has priority '{}' but no entry is named '{target}'",
                entry.name, entry.priority
            )));
        }
        for j in matches {
            let (from, to) = if entry_first { (i, j) } else { (j, i) };
            successors[from].push(to);
            indegree[to] += 1;
        }
    }

    // An entry that must precede another inherits that entry's slot, so
    // `before:x` lands just ahead of `x` instead of wherever it was declared.
    let own: Vec<Rank> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.priority.group(), -e.priority.weight(), i))
        .collect();
    let mut effective: Vec<Option<Rank>> = vec![None; count];
    let mut visiting = vec![false; count];
    for i in 0..count {
        effective_rank(i, &own, &successors, &mut effective, &mut visiting);
    }
    let rank = |i: usize| {
        let (group, weight, slot) = effective[i].unwrap_or(own[i]);
        Reverse((group, weight, slot, i))
    };

    let mut ready: BinaryHeap<Reverse<(u8, i64, usize, usize)>> =
        (0..count).filter(|&i| indegree[i] == 0).map(rank).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(Reverse((_, _, _, i))) = ready.pop() {
        order.push(i);
        for &next in &successors[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(rank(next));
            }
        }
    }

    if order.len() != count {
        let stuck: Vec<&str> = (0..count)
            .filter(|i| indegree[*i] > 0)
            .map(|i| entries[i].name.as_str())
            .collect();
        return Err(HarnessError::priority(format!(
            "priority constraints form a cycle between: {}",
            stuck.join(", ")
        )));
    }

    let mut slots: Vec<Option<Prioritized<T>>> = entries.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

type Rank = (u8, i64, usize);

fn effective_rank(
    i: usize,
    own: &[Rank],
    successors: &[Vec<usize>],
    memo: &mut [Option<Rank>],
    visiting: &mut [bool],
) -> Rank {
    if let Some(rank) = memo[i] {
        return rank;
    }
    if visiting[i] {
        // cycle; reported by the caller
        return own[i];
    }
    visiting[i] = true;
    let mut best = own[i];
    for &next in &successors[i] {
        best = best.min(effective_rank(next, own, successors, memo, visiting));
    }
    visiting[i] = false;
    memo[i] = Some(best);
    best
}
