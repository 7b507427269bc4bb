//! Per-line authorship and lock tracking.
//!
//! Both maps are replaced wholesale on every snapshot, never merged. A
//! snapshot that omits a map clears it.

use crate::protocol::{DocumentSnapshot, LineMap, LineNumber, ParticipantId};

/// Display badge for one line. Locks win over authorship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineBadge {
    Locked(ParticipantId),
    Authored(ParticipantId),
}

impl LineBadge {
    pub fn participant(&self) -> &ParticipantId {
        match self {
            LineBadge::Locked(id) | LineBadge::Authored(id) => id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LineAttributionTracker {
    authors: LineMap,
    locks: LineMap,
}

impl LineAttributionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both maps from `snapshot`.
    pub fn update(&mut self, snapshot: &DocumentSnapshot) {
        // An absent authorship map drops everything we knew. This may be
        // data loss rather than "unchanged"; pending product confirmation.
        self.authors = snapshot.line_authors.clone().unwrap_or_default();
        self.locks = snapshot.line_locks.clone().unwrap_or_default();
    }

    pub fn author_of(&self, line: LineNumber) -> Option<&ParticipantId> {
        self.authors.get(&line)
    }

    pub fn locker_of(&self, line: LineNumber) -> Option<&ParticipantId> {
        self.locks.get(&line)
    }

    pub fn badge(&self, line: LineNumber) -> Option<LineBadge> {
        self.locker_of(line)
            .map(|id| LineBadge::Locked(id.clone()))
            .or_else(|| self.author_of(line).map(|id| LineBadge::Authored(id.clone())))
    }

    /// Badges for every line that has one, ordered by line.
    pub fn badges(&self) -> Vec<(LineNumber, LineBadge)> {
        let mut lines: Vec<LineNumber> = self.authors.keys().chain(self.locks.keys()).copied().collect();
        lines.sort_unstable();
        lines.dedup();
        lines
            .into_iter()
            .filter_map(|line| self.badge(line).map(|badge| (line, badge)))
            .collect()
    }

    pub fn authors(&self) -> &LineMap {
        &self.authors
    }

    pub fn locks(&self) -> &LineMap {
        &self.locks
    }

    pub fn is_empty(&self) -> bool {
        self.authors.is_empty() && self.locks.is_empty()
    }
}
