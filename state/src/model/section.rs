use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

use super::epoch_seconds_to_datetime;

/// Ordered group of tasks. Lower `position` sorts first.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub id: String,
    pub name: String,
    pub position: i64,
    pub priority: i64,
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SectionCreateParams {
    pub id: String,
    pub name: String,
    pub position: i64,
    pub priority: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SectionRow {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) position: i64,
    pub(crate) priority: i64,
    pub(crate) skipped: i64,
    pub(crate) created_at: i64,
}

impl TryFrom<SectionRow> for Section {
    type Error = anyhow::Error;

    fn try_from(row: SectionRow) -> Result<Self> {
        Ok(Section {
            created_at: epoch_seconds_to_datetime(row.created_at)?,
            skipped: row.skipped != 0,
            id: row.id,
            name: row.name,
            position: row.position,
            priority: row.priority,
        })
    }
}
