use crate::request::Action;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counter per coherence action.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerAction(HashMap<Action, u64>);

impl PerAction {
    pub fn inc(&mut self, action: Action) {
        *self.0.entry(action).or_insert(0) += 1;
    }

    #[must_use]
    pub fn get(&self, action: Action) -> u64 {
        self.0.get(&action).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    /// Non-zero counters ordered by action.
    #[must_use]
    pub fn iter(&self) -> Vec<(Action, u64)> {
        use strum::IntoEnumIterator;
        Action::iter()
            .map(|action| (action, self.get(action)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

impl std::ops::AddAssign<&PerAction> for PerAction {
    fn add_assign(&mut self, other: &PerAction) {
        for (action, count) in &other.0 {
            *self.0.entry(*action).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub hit: PerAction,
    pub half_miss: PerAction,
    pub miss_line: PerAction,
    pub miss_state: PerAction,
    pub req_ack: PerAction,
    pub set_state: PerAction,

    pub displaced_send: u64,
    pub displaced_recv: u64,
    pub inv_none: u64,
    pub inv_one: u64,
    pub inv_all: u64,
    pub write_back: u64,
    pub line_fill: u64,

    pub try_prefetch: u64,
    pub send_prefetch: u64,
    pub prefetch_hit_line: u64,
    pub prefetch_hit_pending: u64,
    pub prefetch_hit_busy: u64,
    pub prefetch_dropped: u64,
    pub prefetch_line_fill: u64,
    pub prefetch_useful: u64,
    pub prefetch_wasteful: u64,
    pub mega_sampled: u64,
    pub mega_fetched: u64,
}

impl Cache {
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hit.total()
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.miss_line.total() + self.miss_state.total()
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let accesses = self.hits() + self.half_miss.total() + self.misses();
        if accesses == 0 {
            return 0.0;
        }
        self.hits() as f64 / accesses as f64
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub reads: u64,
    pub write_backs: u64,
    pub total_latency: u64,
}

impl Memory {
    #[must_use]
    pub fn avg_latency(&self) -> f64 {
        if self.reads == 0 {
            return 0.0;
        }
        self.total_latency as f64 / self.reads as f64
    }
}

/// Latency of completed demand accesses.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    pub accesses: u64,
    pub total: u64,
    pub max: u64,
}

impl Latency {
    pub fn record(&mut self, latency: u64) {
        self.accesses += 1;
        self.total += latency;
        self.max = self.max.max(latency);
    }

    #[must_use]
    pub fn avg(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.total as f64 / self.accesses as f64
    }
}

/// Statistics of one memory object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stats {
    Cache(Cache),
    Memory(Memory),
}

#[cfg(test)]
mod tests {
    use super::{Cache, PerAction};
    use crate::request::Action;
    use pretty_assertions_sorted as diff;

    #[test]
    fn per_action_counts_and_merges() {
        let mut reads = PerAction::default();
        reads.inc(Action::SET_VALID);
        reads.inc(Action::SET_VALID);
        let mut writes = PerAction::default();
        writes.inc(Action::SET_DIRTY);

        reads += &writes;
        diff::assert_eq!(reads.total(), 3);
        diff::assert_eq!(
            reads.iter(),
            vec![(Action::SET_VALID, 2), (Action::SET_DIRTY, 1)]
        );
        diff::assert_eq!(reads.get(Action::SET_SHARED), 0);
    }

    #[test]
    fn hit_rate_counts_half_misses_as_accesses() {
        let mut stats = Cache::default();
        stats.hit.inc(Action::SET_VALID);
        stats.half_miss.inc(Action::SET_VALID);
        stats.miss_line.inc(Action::SET_VALID);
        stats.miss_state.inc(Action::SET_DIRTY);
        diff::assert_eq!(stats.hit_rate(), 0.25);
        diff::assert_eq!(Cache::default().hit_rate(), 0.0);
    }
}
