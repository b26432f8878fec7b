/// Coercion of raw remote payloads into the typed board model.
///
/// The remote store enforces no schema: empty arrays are pruned on write,
/// concurrent deletes can leave half-written records, and arrays written
/// element by element come back as objects keyed by index. Every reader goes
/// through these functions, which never fail: malformed fields are replaced
/// by their empty form and logged at debug level.
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::types::{dedup_ids, Board, Column, Label, Priority, Task, UserPresence};

/// Coerce any value expected to be an ordered id list.
///
/// - arrays keep their string entries in order
/// - objects with numeric keys are read in key order (sparse arrays)
/// - objects of `id -> true` are read as sets, in key order
/// - anything else (missing, null, scalar) is an empty list
pub fn coerce_id_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::Object(map)) => {
            if !map.is_empty() && map.keys().all(|k| k.parse::<usize>().is_ok()) {
                let mut entries: Vec<(usize, &Value)> = map
                    .iter()
                    .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
                    .collect();
                entries.sort_by_key(|(i, _)| *i);
                entries
                    .into_iter()
                    .filter_map(|(_, v)| v.as_str().map(str::to_string))
                    .collect()
            } else {
                map.iter()
                    .filter(|(_, v)| v.as_bool() == Some(true))
                    .map(|(k, _)| k.clone())
                    .collect()
            }
        }
        Some(other) => {
            log::debug!("[normalize] Expected an id list, found {}", type_name(other));
            Vec::new()
        }
    }
}

/// Build a board from the value stored at `board`. `None` yields an empty board.
pub fn board_from_value(value: Option<&Value>) -> Board {
    let Some(Value::Object(root)) = value else {
        if let Some(other) = value {
            log::debug!("[normalize] Board payload is {}, using empty board", type_name(other));
        }
        return Board::default();
    };

    let columns: BTreeMap<String, Column> = object_entries(root.get("columns"))
        .filter_map(|(key, raw)| column_from_value(key, raw).map(|c| (key.clone(), c)))
        .collect();
    let tasks: BTreeMap<String, Task> = object_entries(root.get("tasks"))
        .filter_map(|(key, raw)| task_from_value(key, raw).map(|t| (key.clone(), t)))
        .collect();
    let column_order = dedup_ids(coerce_id_list(root.get("columnOrder")));

    Board {
        columns,
        tasks,
        column_order,
    }
}

/// Coerce a column record. Non-object records are dropped.
pub fn column_from_value(key: &str, value: &Value) -> Option<Column> {
    let Value::Object(map) = value else {
        log::debug!("[normalize] Dropping column {}: record is {}", key, type_name(value));
        return None;
    };
    Some(Column {
        id: key.to_string(),
        title: string_field(map, "title").unwrap_or_default(),
        task_ids: dedup_ids(coerce_id_list(map.get("taskIds"))),
    })
}

/// Coerce a task record. Non-object records are dropped; bad fields fall back.
pub fn task_from_value(key: &str, value: &Value) -> Option<Task> {
    let Value::Object(map) = value else {
        log::debug!("[normalize] Dropping task {}: record is {}", key, type_name(value));
        return None;
    };
    let created_at = timestamp_field(map, "createdAt");
    let updated_at = map
        .get("updatedAt")
        .and_then(parse_timestamp)
        .unwrap_or(created_at);
    Some(Task {
        id: key.to_string(),
        title: string_field(map, "title").unwrap_or_default(),
        description: string_field(map, "description").filter(|d| !d.trim().is_empty()),
        created_at,
        updated_at,
        created_by: string_field(map, "createdBy"),
        last_modified_by: string_field(map, "lastModifiedBy"),
        due_date: map
            .get("dueDate")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        priority: map
            .get("priority")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Priority>().ok()),
        labels: dedup_ids(coerce_id_list(map.get("labels"))),
    })
}

pub fn label_from_value(key: &str, value: &Value) -> Option<Label> {
    let Value::Object(map) = value else {
        return None;
    };
    Some(Label {
        id: key.to_string(),
        name: string_field(map, "name").unwrap_or_default(),
        color: string_field(map, "color").unwrap_or_default(),
    })
}

/// Labels sorted by name, then id.
pub fn labels_from_value(value: Option<&Value>) -> Vec<Label> {
    let mut labels: Vec<Label> = object_entries(value)
        .filter_map(|(key, raw)| label_from_value(key, raw))
        .collect();
    labels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    labels
}

pub fn presence_from_value(key: &str, value: &Value) -> Option<UserPresence> {
    let Value::Object(map) = value else {
        return None;
    };
    Some(UserPresence {
        user_id: string_field(map, "userId").unwrap_or_else(|| key.to_string()),
        online: map.get("online").and_then(Value::as_bool).unwrap_or(false),
        last_active: timestamp_field(map, "lastActive"),
        display_name: string_field(map, "displayName"),
        photo_url: string_field(map, "photoURL"),
    })
}

// ── Field helpers ───────────────────────────────────────────────────────────

fn object_entries(value: Option<&Value>) -> impl Iterator<Item = (&String, &Value)> {
    value.and_then(Value::as_object).into_iter().flat_map(|m| m.iter())
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        // Millisecond epoch, as written by some clients.
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn timestamp_field(map: &Map<String, Value>, key: &str) -> DateTime<Utc> {
    map.get(key)
        .and_then(parse_timestamp)
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_missing_and_wrong_types() {
        assert!(coerce_id_list(None).is_empty());
        assert!(coerce_id_list(Some(&Value::Null)).is_empty());
        assert!(coerce_id_list(Some(&json!("t1"))).is_empty());
        assert!(coerce_id_list(Some(&json!(42))).is_empty());
    }

    #[test]
    fn test_coerce_array_drops_non_strings() {
        let value = json!(["t1", 7, null, "t2", { "x": 1 }]);
        assert_eq!(coerce_id_list(Some(&value)), vec!["t1", "t2"]);
    }

    #[test]
    fn test_coerce_sparse_array_object() {
        let value = json!({ "10": "c", "2": "b", "0": "a" });
        assert_eq!(coerce_id_list(Some(&value)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_coerce_set_object() {
        let value = json!({ "bug": true, "ui": true, "old": false });
        assert_eq!(coerce_id_list(Some(&value)), vec!["bug", "ui"]);
    }

    #[test]
    fn test_column_without_task_ids_reads_empty() {
        let board = board_from_value(Some(&json!({
            "columns": {
                "a": { "id": "a", "title": "A" },
                "b": { "id": "b", "title": "B", "taskIds": null },
                "c": { "title": "C", "taskIds": "oops" },
            },
            "columnOrder": ["a", "b", "c"],
        })));
        for id in ["a", "b", "c"] {
            assert!(board.task_ids(id).is_empty());
            assert!(board.column_tasks(id).is_empty());
        }
        assert_eq!(board.columns["c"].id, "c");
    }

    #[test]
    fn test_missing_column_order_reads_empty() {
        let board = board_from_value(Some(&json!({
            "columns": { "a": { "title": "A" } },
        })));
        assert!(board.column_order.is_empty());
        assert!(board.ordered_columns().is_empty());
    }

    #[test]
    fn test_non_object_board_is_empty() {
        assert_eq!(board_from_value(Some(&json!([1, 2]))), Board::default());
        assert_eq!(board_from_value(None), Board::default());
    }

    #[test]
    fn test_malformed_records_are_dropped_or_coerced() {
        let board = board_from_value(Some(&json!({
            "columns": { "a": "not a column" },
            "tasks": {
                "t1": 5,
                "t2": {
                    "title": "Two",
                    "createdAt": "garbage",
                    "updatedAt": 1700000000000u64,
                    "priority": "critical",
                    "dueDate": "2024-02-30",
                    "description": "   ",
                },
            },
        })));
        assert!(board.columns.is_empty());
        assert!(!board.tasks.contains_key("t1"));
        let task = &board.tasks["t2"];
        assert_eq!(task.id, "t2");
        assert_eq!(task.created_at, DateTime::UNIX_EPOCH);
        assert_eq!(task.updated_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(task.priority, None);
        assert_eq!(task.due_date, None);
        assert_eq!(task.description, None);
    }

    #[test]
    fn test_task_fields_parse() {
        let task = task_from_value(
            "t1",
            &json!({
                "id": "t1",
                "title": "Ship",
                "description": "Release notes",
                "createdAt": "2024-01-02T03:04:05Z",
                "createdBy": "u1",
                "dueDate": "2024-01-10",
                "priority": "urgent",
                "labels": ["l1", "l2", "l1"],
            }),
        )
        .unwrap();
        assert_eq!(task.title, "Ship");
        assert_eq!(task.updated_at, task.created_at);
        assert_eq!(task.created_by.as_deref(), Some("u1"));
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2024, 1, 10));
        assert_eq!(task.priority, Some(Priority::Urgent));
        assert_eq!(task.labels, vec!["l1", "l2"]);
    }

    #[test]
    fn test_duplicate_ids_in_order_are_collapsed() {
        let board = board_from_value(Some(&json!({
            "columns": { "a": { "title": "A", "taskIds": ["t1", "t1"] } },
            "columnOrder": ["a", "a"],
        })));
        assert_eq!(board.column_order, vec!["a"]);
        assert_eq!(board.task_ids("a"), ["t1".to_string()]);
    }

    #[test]
    fn test_labels_sorted_by_name() {
        let labels = labels_from_value(Some(&json!({
            "l2": { "name": "ui", "color": "#00f" },
            "l1": { "name": "bug", "color": "#f00" },
            "bad": 3,
        })));
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["bug", "ui"]);
    }

    #[test]
    fn test_presence_defaults() {
        let presence = presence_from_value("s1", &json!({ "online": true })).unwrap();
        assert_eq!(presence.user_id, "s1");
        assert!(presence.online);
        assert_eq!(presence.last_active, DateTime::UNIX_EPOCH);
    }
}
