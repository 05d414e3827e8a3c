//! Completion records and the recent working set

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use upkeep_util::{CalendarDate, TaskId, date_to_timestamp, format_completion_date, parse_completion_date};

use crate::{CompletionRecord, CoreResult, RecentCompletionRecord, Task};

/// Process-local handle of one completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompletionId(u64);

impl CompletionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CompletionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Hands out [`CompletionId`]s
#[derive(Debug, Default)]
pub struct CompletionIds {
    next: u64,
}

impl CompletionIds {
    pub fn allocate(&mut self) -> CompletionId {
        let id = CompletionId(self.next);
        self.next += 1;
        id
    }
}

/// One instance of completing a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: CompletionId,
    pub task_id: TaskId,
    pub date: CalendarDate,
    pub is_approximate: bool,
    pub notes: String,
    timestamp: i64,
}

impl Completion {
    pub fn new(
        id: CompletionId,
        task_id: TaskId,
        date: CalendarDate,
        is_approximate: bool,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            id,
            task_id,
            date,
            is_approximate,
            notes: notes.into(),
            timestamp: date_to_timestamp(date),
        }
    }

    /// Ordering key, derived from the date
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Change date and notes, recomputing the timestamp
    pub fn edit(&mut self, date: CalendarDate, is_approximate: bool, notes: impl Into<String>) {
        self.date = date;
        self.is_approximate = is_approximate;
        self.notes = notes.into();
        self.timestamp = date_to_timestamp(date);
    }

    pub fn from_recent_record(id: CompletionId, record: &RecentCompletionRecord) -> CoreResult<Self> {
        let (date, is_approximate) = parse_completion_date(&record.date)?;
        Ok(Self::new(id, record.task_id, date, is_approximate, record.notes.clone()))
    }

    pub fn from_archive_record(
        id: CompletionId,
        task_id: TaskId,
        record: &CompletionRecord,
    ) -> CoreResult<Self> {
        let (date, is_approximate) = parse_completion_date(&record.date)?;
        Ok(Self::new(id, task_id, date, is_approximate, record.notes.clone()))
    }

    pub fn to_recent_record(&self) -> RecentCompletionRecord {
        RecentCompletionRecord {
            task_id: self.task_id,
            date: format_completion_date(self.date, self.is_approximate),
            notes: self.notes.clone(),
        }
    }

    pub fn to_archive_record(&self) -> CompletionRecord {
        CompletionRecord {
            date: format_completion_date(self.date, self.is_approximate),
            notes: self.notes.clone(),
        }
    }
}

/// Insert keeping ascending timestamp order. Equal timestamps keep
/// insertion order.
pub fn insert_sorted(completions: &mut Vec<Completion>, completion: Completion) {
    let index = completions.partition_point(|c| c.timestamp <= completion.timestamp);
    completions.insert(index, completion);
}

/// Restore ordering after an edit
pub fn resort(completions: &mut [Completion]) {
    completions.sort_by_key(|c| c.timestamp);
}

/// Non-owning index of the "hot" completions, keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentCompletions {
    entries: BTreeMap<CompletionId, TaskId>,
}

impl RecentCompletions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, completion: &Completion) {
        self.entries.insert(completion.id, completion.task_id);
    }

    pub fn remove(&mut self, id: CompletionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Drop every entry owned by `task_id`; returns whether anything changed
    pub fn remove_task(&mut self, task_id: TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, owner| *owner != task_id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: CompletionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CompletionId> + '_ {
        self.entries.keys().copied()
    }

    pub fn owner(&self, id: CompletionId) -> Option<TaskId> {
        self.entries.get(&id).copied()
    }
}

/// Outcome of planning a compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushPlan {
    /// Exactly the latest completion of every task that has one
    pub recent: RecentCompletions,
    /// Completions leaving the recent set
    pub dropped: BTreeSet<CompletionId>,
    /// Tasks whose archive chunk must be rewritten
    pub affected_tasks: BTreeSet<TaskId>,
}

/// How far the recent set exceeds one completion per task
pub fn surplus(recent: &RecentCompletions, task_count: usize) -> isize {
    recent.len() as isize - task_count as isize
}

/// Whether the recent set has grown enough to compact
pub fn needs_flush(recent: &RecentCompletions, task_count: usize, threshold: usize) -> bool {
    surplus(recent, task_count) >= threshold as isize
}

/// Compute the compacted recent set for `tasks`.
///
/// A task is affected when one of its completions leaves the recent set or
/// when its latest completion was not recent before (it moves out of the
/// archive).
pub fn plan_flush<'a>(
    recent: &RecentCompletions,
    tasks: impl IntoIterator<Item = &'a Task>,
) -> FlushPlan {
    let mut next = RecentCompletions::new();
    let mut affected_tasks = BTreeSet::new();

    for task in tasks {
        if let Some(latest) = task.completions.last() {
            next.insert(latest);
            if !recent.contains(latest.id) {
                affected_tasks.insert(task.id);
            }
        }
    }

    let dropped: BTreeSet<CompletionId> = recent.ids().filter(|id| !next.contains(*id)).collect();
    for id in &dropped {
        if let Some(owner) = recent.owner(*id) {
            affected_tasks.insert(owner);
        }
    }

    FlushPlan {
        recent: next,
        dropped,
        affected_tasks,
    }
}
