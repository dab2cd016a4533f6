//! The replicated log. Indices are 1-based; index 0 stands for the empty prefix and has term 0.

use super::Term;
use core::cmp::Ordering;
use serde::{Deserialize, Serialize};

pub type Index = usize;

/// Each log entry stores a state machine command along with the term number when the entry was received by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item<Command> {
    pub term: Term,
    pub command: Command,
}

impl<Command> Item<Command> {
    pub fn new(term: Term, command: Command) -> Self {
        Item { term, command }
    }
}

pub trait Log: Default {
    type Command;

    fn last_log_index(&self) -> Index;

    fn last_log_term(&self) -> Term;

    /// Append a new command from the leader, returning its index
    fn append(&mut self, term: Term, command: Self::Command) -> Index;

    fn get_term(&self, index: Index) -> Option<Term>;

    fn get_command(&self, index: Index) -> Option<&Self::Command>;

    /// Up to `max` entries starting at `index`
    fn get_from(&self, index: Index, max: usize) -> Vec<Item<Self::Command>>;

    /// Whether the log contains an entry at `index` whose term is `term`
    fn log_term_matches(&self, index: Index, term: Term) -> bool {
        index == 0 || self.get_term(index) == Some(term)
    }

    /// Drops any entry conflicting with the new ones (same index, different term) along with everything after it,
    /// then appends the entries not already present. Returns the index of the last new entry.
    fn truncate_if_different_and_append<Entries: IntoIterator<Item = Item<Self::Command>>>(
        &mut self,
        prev_log_index: Index,
        entries: Entries,
    ) -> Index;

    /// Compares this log against another log's last entry, ordered by term then length.
    /// `Ordering::Greater` means this log is more up-to-date.
    fn up_to_date_cmp(&self, last_log_index: Index, last_log_term: Term) -> Ordering {
        self.last_log_term()
            .cmp(&last_log_term)
            .then(self.last_log_index().cmp(&last_log_index))
    }
}

/// A log held in memory
pub type InVec<Command> = Vec<Item<Command>>;

impl<Command: Clone> Log for InVec<Command> {
    type Command = Command;

    fn last_log_index(&self) -> Index {
        self.len()
    }

    fn last_log_term(&self) -> Term {
        self.last().map(|item| item.term).unwrap_or(0)
    }

    fn append(&mut self, term: Term, command: Command) -> Index {
        self.push(Item::new(term, command));
        self.len()
    }

    fn get_term(&self, index: Index) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.get(index - 1).map(|item| item.term)
        }
    }

    fn get_command(&self, index: Index) -> Option<&Command> {
        index
            .checked_sub(1)
            .and_then(|i| self.get(i))
            .map(|item| &item.command)
    }

    fn get_from(&self, index: Index, max: usize) -> Vec<Item<Command>> {
        let start = index.max(1) - 1;
        self.iter().skip(start).take(max).cloned().collect()
    }

    fn truncate_if_different_and_append<Entries: IntoIterator<Item = Item<Command>>>(
        &mut self,
        prev_log_index: Index,
        entries: Entries,
    ) -> Index {
        let mut index = prev_log_index;
        for entry in entries {
            index += 1;
            match self.get_term(index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.truncate(index - 1);
                    self.push(entry);
                }
                None => self.push(entry),
            }
        }
        index
    }
}
