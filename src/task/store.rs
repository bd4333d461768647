//! In-memory task store
//!
//! The single persistence boundary of the spine. Callers take a snapshot,
//! mutate every field they need, and commit through `set_task`; multi-field
//! atomic commits (status + hold) are achieved by that ordering discipline.
//! A writer lock around the commit keeps readers from observing a
//! half-written task.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::task::metadata::TaskMetadata;
use crate::task::model::{Task, TaskId, TaskSource, TaskStatus, TaskType};

/// Options for a `set_task` commit
#[derive(Debug, Clone, Copy, Default)]
pub struct SetTaskOptions {
    /// Suppress the strict-finalize tripwire for bootstrap paths
    pub allow_unfinalized: bool,
}

/// Terminal-task history record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistoryEntry {
    pub task_id: TaskId,
    pub title: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<String>,
}

/// Filter for `get_tasks`
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub source: Option<TaskSource>,
    pub limit: Option<usize>,
}

/// Rollup statistics over the live store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_status: std::collections::BTreeMap<String, usize>,
    pub by_type: std::collections::BTreeMap<String, usize>,
    pub by_source: std::collections::BTreeMap<String, usize>,
    pub history_len: usize,
}

struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    history: VecDeque<TaskHistoryEntry>,
    progress: HashMap<TaskId, f64>,
    /// Sterling digest dedupe index: dedupe key -> task id
    dedupe_index: HashMap<String, TaskId>,
}

/// Keyed in-memory store with dedup index, history ring, and progress map
pub struct TaskStore {
    inner: RwLock<StoreInner>,
    /// Mutex-style dedupe-key reservations for concurrent creation attempts
    reservations: DashMap<String, DateTime<Utc>>,
    history_limit: usize,
    strict_finalize: bool,
}

impl TaskStore {
    pub fn new(history_limit: usize, strict_finalize: bool) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                tasks: HashMap::new(),
                history: VecDeque::new(),
                progress: HashMap::new(),
                dedupe_index: HashMap::new(),
            }),
            reservations: DashMap::new(),
            history_limit,
            strict_finalize,
        }
    }

    /// Sole commit point. Replaces the stored task, refreshes the dedupe
    /// index and progress map, and appends to the history ring on a
    /// transition into a terminal status.
    pub fn set_task(&self, task: Task, opts: SetTaskOptions) {
        let mut inner = self.inner.write();

        let previous = inner.tasks.get(&task.id);
        let is_new = previous.is_none();
        let was_terminal = previous.is_some_and(|existing| existing.status.is_terminal());

        if self.strict_finalize && is_new && task.metadata.origin.is_none() && !opts.allow_unfinalized
        {
            warn!(
                task_id = %task.id,
                title = %task.title,
                "Persisting new task without metadata.origin (strict finalize tripwire)"
            );
        }

        if let Some(sterling) = &task.metadata.sterling {
            inner
                .dedupe_index
                .insert(sterling.dedupe_key(), task.id.clone());
        }

        inner.progress.insert(task.id.clone(), task.progress);

        if task.status.is_terminal() && !was_terminal {
            let entry = TaskHistoryEntry {
                task_id: task.id.clone(),
                title: task.title.clone(),
                task_type: task.task_type,
                status: task.status,
                recorded_at: Utc::now(),
                failure_code: task.failure_code.clone(),
            };
            inner.history.push_back(entry);
            while inner.history.len() > self.history_limit {
                inner.history.pop_front();
            }
        }

        inner.tasks.insert(task.id.clone(), task);
    }

    /// Snapshot of a task taken under the read lock
    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().tasks.get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.read().tasks.contains_key(id)
    }

    /// Delete a task; purges its progress entry and dedupe index entries.
    /// Returns false for a missing id.
    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.tasks.remove(id) {
            Some(_) => {
                inner.progress.remove(id);
                inner.dedupe_index.retain(|_, task_id| task_id != id);
                true
            }
            None => false,
        }
    }

    pub fn get_all(&self) -> Vec<Task> {
        self.inner.read().tasks.values().cloned().collect()
    }

    /// Filtered task listing
    pub fn get_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let inner = self.inner.read();
        let mut matched: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| filter.status.map_or(true, |status| task.status == status))
            .filter(|task| filter.task_type.map_or(true, |ty| task.task_type == ty))
            .filter(|task| filter.source.map_or(true, |source| task.source == source))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Find an existing task that the partial would duplicate.
    ///
    /// Sterling-IR tasks dedupe by committed digest within their namespace;
    /// other tasks by case-folded title + status, by type + source with
    /// >= 70% title-word overlap, or by an equivalent resolved requirement.
    /// Terminal tasks never count as duplicates.
    pub fn find_similar(&self, partial: &Task) -> Option<Task> {
        let inner = self.inner.read();

        if partial.task_type == TaskType::SterlingIr {
            if let Some(sterling) = &partial.metadata.sterling {
                if let Some(task_id) = inner.dedupe_index.get(&sterling.dedupe_key()) {
                    if let Some(existing) = inner.tasks.get(task_id) {
                        if !existing.status.is_terminal() {
                            return Some(existing.clone());
                        }
                    }
                }
            }
            return None;
        }

        let partial_title = partial.title.to_lowercase();
        for existing in inner.tasks.values() {
            if existing.id == partial.id || existing.status.is_terminal() {
                continue;
            }

            if existing.title.to_lowercase() == partial_title && existing.status == partial.status {
                return Some(existing.clone());
            }

            if existing.task_type == partial.task_type
                && existing.source == partial.source
                && title_word_overlap(&existing.title, &partial.title) >= 0.7
            {
                return Some(existing.clone());
            }

            if let (Some(theirs), Some(ours)) = (
                &existing.metadata.requirement,
                &partial.metadata.requirement,
            ) {
                if theirs == ours {
                    return Some(existing.clone());
                }
            }
        }

        None
    }

    /// Reserve a dedupe key; returns false when another caller holds it
    pub fn reserve_dedupe_key(&self, key: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.reservations.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Utc::now());
                true
            }
        }
    }

    pub fn release_dedupe_key(&self, key: &str) {
        self.reservations.remove(key);
    }

    pub fn find_by_dedupe_key(&self, key: &str) -> Option<Task> {
        let inner = self.inner.read();
        inner
            .dedupe_index
            .get(key)
            .and_then(|task_id| inner.tasks.get(task_id))
            .cloned()
    }

    pub fn history(&self) -> Vec<TaskHistoryEntry> {
        self.inner.read().history.iter().cloned().collect()
    }

    pub fn progress_of(&self, id: &str) -> Option<f64> {
        self.inner.read().progress.get(id).copied()
    }

    /// Rollup statistics
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let mut stats = StoreStats {
            total: inner.tasks.len(),
            history_len: inner.history.len(),
            ..Default::default()
        };
        for task in inner.tasks.values() {
            *stats
                .by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_type
                .entry(task.task_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_source
                .entry(task.source.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }
}

/// Fraction of the shorter title's words present in the longer title
fn title_word_overlap(a: &str, b: &str) -> f64 {
    let words_a: std::collections::HashSet<String> =
        a.to_lowercase().split_whitespace().map(String::from).collect();
    let words_b: std::collections::HashSet<String> =
        b.to_lowercase().split_whitespace().map(String::from).collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let (smaller, larger) = if words_a.len() <= words_b.len() {
        (&words_a, &words_b)
    } else {
        (&words_b, &words_a)
    };
    let shared = smaller.iter().filter(|word| larger.contains(*word)).count();
    shared as f64 / smaller.len() as f64
}
