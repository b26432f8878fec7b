use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Columns written when the remote store holds no board yet.
/// Order matters: this is the initial `columnOrder`.
pub const DEFAULT_COLUMNS: &[(&str, &str)] = &[
    ("column-1", "To Do"),
    ("column-2", "In Progress"),
    ("column-3", "Done"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown priority: {0}")]
pub struct UnknownPriority(pub String);

impl FromStr for Priority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(UnknownPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Weak reference to a user id; the user may no longer exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Label ids, kept unique in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub task_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    #[serde(default)]
    pub columns: BTreeMap<String, Column>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default)]
    pub column_order: Vec<String>,
}

impl Board {
    /// The three-column skeleton seeded into an empty store.
    pub fn default_board() -> Self {
        let columns = DEFAULT_COLUMNS
            .iter()
            .map(|(id, title)| {
                (
                    id.to_string(),
                    Column {
                        id: id.to_string(),
                        title: title.to_string(),
                        task_ids: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            columns,
            tasks: BTreeMap::new(),
            column_order: DEFAULT_COLUMNS.iter().map(|(id, _)| id.to_string()).collect(),
        }
    }

    pub fn column(&self, column_id: &str) -> Option<&Column> {
        self.columns.get(column_id)
    }

    /// Columns in display order. Ids in `column_order` without a record are skipped.
    pub fn ordered_columns(&self) -> Vec<&Column> {
        self.column_order
            .iter()
            .filter_map(|id| self.columns.get(id))
            .collect()
    }

    /// Task ids of a column, or an empty slice when the column is unknown.
    pub fn task_ids(&self, column_id: &str) -> &[String] {
        self.columns
            .get(column_id)
            .map(|c| c.task_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks of a column in display order, with dangling ids filtered out.
    pub fn column_tasks(&self, column_id: &str) -> Vec<&Task> {
        self.task_ids(column_id)
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .collect()
    }

    /// Find the column currently holding `task_id`.
    /// Ordered columns are scanned first, then columns missing from the order.
    pub fn find_task_column(&self, task_id: &str) -> Option<&str> {
        let ordered = self
            .column_order
            .iter()
            .filter_map(|id| self.columns.get(id));
        let unordered = self
            .columns
            .values()
            .filter(|c| !self.column_order.contains(&c.id));
        ordered
            .chain(unordered)
            .find(|c| c.task_ids.iter().any(|id| id == task_id))
            .map(|c| c.id.as_str())
    }
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub priority: Option<Priority>,
    pub labels: Vec<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Partial task update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub due_date: Option<Option<NaiveDate>>,
    pub priority: Option<Option<Priority>>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelPatch {
    pub name: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub online: bool,
    pub last_active: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

/// Profile record stored under `users/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keep the first occurrence of every id.
pub fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with(columns: &[(&str, &[&str])]) -> Board {
        let mut board = Board::default();
        for (id, tasks) in columns {
            board.column_order.push(id.to_string());
            board.columns.insert(
                id.to_string(),
                Column {
                    id: id.to_string(),
                    title: id.to_uppercase(),
                    task_ids: tasks.iter().map(|t| t.to_string()).collect(),
                },
            );
        }
        board
    }

    #[test]
    fn test_default_board_has_three_columns() {
        let board = Board::default_board();
        assert_eq!(board.column_order, vec!["column-1", "column-2", "column-3"]);
        let titles: Vec<&str> = board.ordered_columns().iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["To Do", "In Progress", "Done"]);
        assert!(board.tasks.is_empty());
    }

    #[test]
    fn test_ordered_columns_skips_unknown_ids() {
        let mut board = board_with(&[("a", &[]), ("b", &[])]);
        board.column_order.insert(1, "ghost".to_string());
        let ids: Vec<&str> = board.ordered_columns().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_column_tasks_filters_dangling_ids() {
        let mut board = board_with(&[("a", &["t1", "missing"])]);
        let now = Utc::now();
        board.tasks.insert(
            "t1".to_string(),
            Task {
                id: "t1".to_string(),
                title: "One".to_string(),
                description: None,
                created_at: now,
                updated_at: now,
                created_by: None,
                last_modified_by: None,
                due_date: None,
                priority: None,
                labels: Vec::new(),
            },
        );
        let tasks = board.column_tasks("a");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "t1");
        assert!(board.column_tasks("nope").is_empty());
    }

    #[test]
    fn test_find_task_column_scans_unordered_columns() {
        let mut board = board_with(&[("a", &["t1"])]);
        board.columns.insert(
            "stray".to_string(),
            Column {
                id: "stray".to_string(),
                title: "Stray".to_string(),
                task_ids: vec!["t9".to_string()],
            },
        );
        assert_eq!(board.find_task_column("t1"), Some("a"));
        assert_eq!(board.find_task_column("t9"), Some("stray"));
        assert_eq!(board.find_task_column("t0"), None);
    }

    #[test]
    fn test_task_serializes_camel_case_without_empty_fields() {
        let now = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let task = Task {
            id: "t1".to_string(),
            title: "Write docs".to_string(),
            description: None,
            created_at: now,
            updated_at: now,
            created_by: Some("u1".to_string()),
            last_modified_by: None,
            due_date: NaiveDate::from_ymd_opt(2024, 3, 5),
            priority: Some(Priority::High),
            labels: Vec::new(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["createdBy"], "u1");
        assert_eq!(json["dueDate"], "2024-03-05");
        assert_eq!(json["priority"], "high");
        assert!(json.get("description").is_none());
        assert!(json.get("labels").is_none());
        assert!(json.get("lastModifiedBy").is_none());
    }

    #[test]
    fn test_priority_round_trips_strings() {
        for p in [Priority::Low, Priority::Medium, Priority::High, Priority::Urgent] {
            assert_eq!(p.as_str().parse::<Priority>(), Ok(p));
        }
        assert_eq!(
            "critical".parse::<Priority>(),
            Err(UnknownPriority("critical".to_string()))
        );
    }

    #[test]
    fn test_dedup_ids_keeps_first() {
        let ids = vec!["a", "b", "a", "c", "b"].into_iter().map(String::from).collect();
        assert_eq!(dedup_ids(ids), vec!["a", "b", "c"]);
    }
}
