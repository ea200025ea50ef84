use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Editable-shape value meaning "no particular day"; never persisted.
pub const ANY_DAY: &str = "any";

/// Lifecycle status of a program download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProgramStatus {
    /// Freshly added, not yet attempted.
    #[default]
    Pending,
    Success,
    Error,
    /// The program had already been downloaded elsewhere.
    Already,
}

impl ProgramStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramStatus::Pending => "Pending",
            ProgramStatus::Success => "Success",
            ProgramStatus::Error => "Error",
            ProgramStatus::Already => "Already",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "Pending" => ProgramStatus::Pending,
            "Success" => ProgramStatus::Success,
            "Error" => ProgramStatus::Error,
            "Already" => ProgramStatus::Already,
            _ => return None,
        })
    }

    /// Statuses a patch request may move a program into.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProgramStatus::Pending)
    }
}

fn default_day_of_week() -> String {
    ANY_DAY.to_string()
}

/// Editors send `null` or `""` for "no day"; both read as [`ANY_DAY`].
fn deserialize_day_of_week<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|d| !d.is_empty())
        .unwrap_or_else(default_day_of_week))
}

/// A program as the editor sees it.
///
/// `pos` is filled on reads and ignored on writes; the store layer owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub pid: String,
    #[serde(default)]
    pub status: ProgramStatus,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub image_uri: String,
    #[serde(
        default = "default_day_of_week",
        deserialize_with = "deserialize_day_of_week"
    )]
    pub day_of_week: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<u32>,
}

impl EditRecord {
    pub fn new<S1: Into<String>, S2: Into<String>>(pid: S1, title: S2) -> Self {
        Self {
            pid: pid.into(),
            status: ProgramStatus::Pending,
            genre: String::new(),
            quality: String::new(),
            title: title.into(),
            synopsis: String::new(),
            image_uri: String::new(),
            day_of_week: default_day_of_week(),
            modify_time: None,
            pos: None,
        }
    }

    /// True when the record is bound to a concrete weekday.
    pub fn has_day_of_week(&self) -> bool {
        !self.day_of_week.is_empty() && self.day_of_week != ANY_DAY
    }
}

/// One row of the Program table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub pid: String,
    pub status: ProgramStatus,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub image_uri: String,
    /// Sparse attribute: absent rather than null when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    pub modify_time: DateTime<Utc>,
    pub pos: u32,
}

/// One row of the ProgramHistory table. Written once, never touched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub pid: String,
    pub status: ProgramStatus,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub image_uri: String,
    pub modify_time: DateTime<Utc>,
    pub download_time: DateTime<Utc>,
}

/// A requested status change, as received from the API layer.
///
/// `status` stays a string here so that unknown values surface as validation
/// errors instead of decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub pid: String,
    #[serde(default)]
    pub status: String,
}

impl StatusUpdate {
    pub fn new<S: Into<String>>(pid: S, status: ProgramStatus) -> Self {
        Self {
            pid: pid.into(),
            status: status.as_str().to_string(),
        }
    }
}
