//! Versioned schemas of the plaintext chunk payloads
//!
//! Decoding is strict: unknown fields and unsupported versions are errors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use upkeep_util::{ActiveMonths, CalendarDate, TaskId};

use crate::{CoreError, CoreResult};

/// Schema version written into every chunk
pub const CHUNK_SCHEMA_VERSION: u32 = 1;

/// `plannerItems`: the whole tree, pre-order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PlannerItemsChunk {
    pub version: u32,
    pub next_task_id: TaskId,
    pub items: Vec<PlannerItemRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlannerItemRecord {
    Category(CategoryRecord),
    Task(TaskRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CategoryRecord {
    pub name: String,
    pub items: Vec<PlannerItemRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub frequency: Option<u32>,
    #[serde(default)]
    pub due_date: Option<CalendarDate>,
    #[serde(default)]
    pub due_date_is_manual: Option<bool>,
    #[serde(default)]
    pub upcoming_period: Option<u32>,
    #[serde(default)]
    pub grace_period: Option<u32>,
    #[serde(default)]
    pub active_months: Option<ActiveMonths>,
    #[serde(default)]
    pub notes: String,
}

/// `recentCompletions`: the hot working set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RecentCompletionsChunk {
    pub version: u32,
    pub completions: Vec<RecentCompletionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RecentCompletionRecord {
    pub task_id: TaskId,
    /// `YYYY-MM-DD`, prefixed with `~` when approximate
    pub date: String,
    #[serde(default)]
    pub notes: String,
}

/// `oldCompletions.<taskId>`: one task's archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct OldCompletionsChunk {
    pub version: u32,
    pub completions: Vec<CompletionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CompletionRecord {
    pub date: String,
    #[serde(default)]
    pub notes: String,
}

/// Chunk payloads that carry a schema version
pub trait VersionedChunk: Serialize + DeserializeOwned {
    fn version(&self) -> u32;
}

impl VersionedChunk for PlannerItemsChunk {
    fn version(&self) -> u32 {
        self.version
    }
}

impl VersionedChunk for RecentCompletionsChunk {
    fn version(&self) -> u32 {
        self.version
    }
}

impl VersionedChunk for OldCompletionsChunk {
    fn version(&self) -> u32 {
        self.version
    }
}

/// Decode a plaintext chunk value, checking shape and version
pub fn decode_chunk<T: VersionedChunk>(name: &str, value: serde_json::Value) -> CoreResult<T> {
    let chunk: T =
        serde_json::from_value(value).map_err(|e| CoreError::schema(name, e.to_string()))?;
    if chunk.version() != CHUNK_SCHEMA_VERSION {
        return Err(CoreError::schema(
            name,
            format!("unsupported schema version {}", chunk.version()),
        ));
    }
    Ok(chunk)
}

/// Encode a chunk payload to a plaintext JSON value
pub fn encode_chunk<T: VersionedChunk>(name: &str, chunk: &T) -> CoreResult<serde_json::Value> {
    serde_json::to_value(chunk).map_err(|e| CoreError::schema(name, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn planner_items_wire_shape() {
        let value = json!({
            "version": 1,
            "nextTaskId": 3,
            "items": [
                {"type": "category", "name": "Home", "items": [
                    {"type": "task", "id": 1, "name": "Water plants", "frequency": 7,
                     "dueDate": "2025-03-08", "dueDateIsManual": false, "notes": ""}
                ]},
                {"type": "task", "id": 2, "name": "Taxes"}
            ]
        });

        let chunk: PlannerItemsChunk = decode_chunk("plannerItems", value).unwrap();
        assert_eq!(chunk.next_task_id, TaskId::new(3));
        match &chunk.items[0] {
            PlannerItemRecord::Category(category) => {
                assert_eq!(category.name, "Home");
                assert!(matches!(
                    &category.items[0],
                    PlannerItemRecord::Task(task) if task.frequency == Some(7)
                ));
            }
            other => panic!("expected category, got {:?}", other),
        }
        assert!(matches!(
            &chunk.items[1],
            PlannerItemRecord::Task(task) if task.due_date.is_none() && task.notes.is_empty()
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let value = json!({
            "version": 1,
            "completions": [{"taskId": 1, "date": "2025-01-01", "notes": "", "extra": true}]
        });
        let result: CoreResult<RecentCompletionsChunk> = decode_chunk("recentCompletions", value);
        assert!(matches!(result, Err(CoreError::Schema { .. })));
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let value = json!({"version": 1, "items": []});
        let result: CoreResult<PlannerItemsChunk> = decode_chunk("plannerItems", value);
        assert!(matches!(result, Err(CoreError::Schema { .. })));
    }

    #[test]
    fn future_versions_are_rejected() {
        let value = json!({"version": 2, "completions": []});
        let result: CoreResult<OldCompletionsChunk> = decode_chunk("oldCompletions.1", value);
        assert!(matches!(result, Err(CoreError::Schema { .. })));
    }
}
