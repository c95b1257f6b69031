// 📁 Projects & Clients - the cost objects transactions are attributed to
//
// A project belongs to at most one client and has an activity window
// [start_date, end_date]. Activity in a month drives overhead redistribution.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ClientId, ProjectId};
use crate::month::Month;

// ============================================================================
// PROJECT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Completed,
    OnHold,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
            ProjectStatus::OnHold => "onhold",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(ProjectStatus::Active),
            "completed" => Ok(ProjectStatus::Completed),
            "onhold" | "on_hold" | "on-hold" => Ok(ProjectStatus::OnHold),
            other => Err(format!("unknown project status: {}", other)),
        }
    }
}

// ============================================================================
// PROJECT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,

    /// Owning client; project totals roll up into this client
    #[serde(default)]
    pub client_id: Option<ClientId>,

    pub status: ProjectStatus,
    pub start_date: NaiveDate,

    /// Open-ended when None
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, start_date: NaiveDate) -> Self {
        Project {
            id: ProjectId::new(id),
            name: name.into(),
            client_id: None,
            status: ProjectStatus::Active,
            start_date,
            end_date: None,
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(ClientId::new(client_id));
        self
    }

    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = status;
        self
    }

    pub fn ending(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    /// Active in `month` iff status is active and the activity window
    /// overlaps any day of the month
    pub fn is_active_in(&self, month: Month) -> bool {
        self.status == ProjectStatus::Active
            && self.start_date <= month.last_day()
            && self.end_date.map_or(true, |end| end >= month.first_day())
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
}

impl Client {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Client {
            id: ClientId::new(id),
            name: name.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn feb() -> Month {
        Month::new(2025, 2).unwrap()
    }

    #[test]
    fn test_active_open_ended() {
        let project = Project::new("A", "Website", date(2024, 6, 1));
        assert!(project.is_active_in(feb()));
        assert!(!project.is_active_in(Month::new(2024, 5).unwrap()));
    }

    #[test]
    fn test_active_when_starting_on_last_day() {
        let project = Project::new("A", "Website", date(2025, 2, 28));
        assert!(project.is_active_in(feb()));

        let later = Project::new("B", "App", date(2025, 3, 1));
        assert!(!later.is_active_in(feb()));
    }

    #[test]
    fn test_active_when_ending_on_first_day() {
        let project = Project::new("A", "Website", date(2024, 1, 1)).ending(date(2025, 2, 1));
        assert!(project.is_active_in(feb()));

        let ended = Project::new("B", "App", date(2024, 1, 1)).ending(date(2025, 1, 31));
        assert!(!ended.is_active_in(feb()));
    }

    #[test]
    fn test_open_ended_project_active_in_final_month() {
        let project = Project::new("A", "Website", date(2024, 1, 1));
        assert!(project.is_active_in(Month::of(NaiveDate::MAX)));
    }

    #[test]
    fn test_inactive_status_is_never_active() {
        let completed = Project::new("A", "Website", date(2024, 1, 1))
            .with_status(ProjectStatus::Completed);
        let on_hold = Project::new("B", "App", date(2024, 1, 1)).with_status(ProjectStatus::OnHold);

        assert!(!completed.is_active_in(feb()));
        assert!(!on_hold.is_active_in(feb()));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Active".parse::<ProjectStatus>(), Ok(ProjectStatus::Active));
        assert_eq!("on_hold".parse::<ProjectStatus>(), Ok(ProjectStatus::OnHold));
        assert!("archived".parse::<ProjectStatus>().is_err());
    }
}
