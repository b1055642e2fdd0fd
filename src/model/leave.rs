use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use strum_macros::{AsRefStr, EnumIter, EnumString};
use utoipa::ToSchema;

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, ToSchema, EnumString, AsRefStr,
    EnumIter, strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LeaveType {
    Casual,
    Sick,
    Annual,
    Maternity,
    Paternity,
    Unpaid,
}

impl TryFrom<String> for LeaveType {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LeaveType::from_str(&value)
    }
}

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, ToSchema, EnumString, AsRefStr,
    strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl LeaveStatus {
    /// Every decision is taken on a pending leave; decided leaves are final.
    pub fn can_transition_to(self, next: LeaveStatus) -> bool {
        self == LeaveStatus::Pending && next != LeaveStatus::Pending
    }
}

impl TryFrom<String> for LeaveStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LeaveStatus::from_str(&value)
    }
}

/// Joins `users` so `employee_name` and `department` are populated.
pub const LEAVE_SELECT: &str = "SELECT l.id, l.employee_id, l.leave_type, l.start_date, \
     l.end_date, l.reason, l.responsible_person_id, l.status, l.manager_id, l.manager_comments, \
     l.decision_date, l.created_at, l.updated_at, u.full_name AS employee_name, \
     u.department AS department FROM leaves l JOIN users u ON u.id = l.employee_id";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Leave {
    #[schema(example = 12)]
    pub id: u64,
    #[schema(example = 7)]
    pub employee_id: u64,
    #[sqlx(try_from = "String")]
    pub leave_type: LeaveType,
    #[schema(example = "2026-01-05", format = "date", value_type = String)]
    pub start_date: NaiveDate,
    #[schema(example = "2026-01-07", format = "date", value_type = String)]
    pub end_date: NaiveDate,
    pub reason: Option<String>,
    pub responsible_person_id: Option<u64>,
    #[sqlx(try_from = "String")]
    pub status: LeaveStatus,
    pub manager_id: Option<u64>,
    pub manager_comments: Option<String>,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub decision_date: Option<NaiveDateTime>,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: NaiveDateTime,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub updated_at: Option<NaiveDateTime>,
    #[sqlx(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_name: Option<String>,
    #[sqlx(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

impl Leave {
    /// Inclusive calendar days.
    pub fn duration_days(&self) -> i32 {
        duration_days(self.start_date, self.end_date)
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && self.end_date >= start
    }

    pub fn covers(&self, day: NaiveDate) -> bool {
        self.start_date <= day && day <= self.end_date
    }
}

pub fn duration_days(start: NaiveDate, end: NaiveDate) -> i32 {
    ((end - start).num_days() + 1).max(0) as i32
}

#[cfg(test)]
pub(crate) fn sample_leave(
    id: u64,
    employee_id: u64,
    leave_type: LeaveType,
    start: NaiveDate,
    end: NaiveDate,
    status: LeaveStatus,
) -> Leave {
    Leave {
        id,
        employee_id,
        leave_type,
        start_date: start,
        end_date: end,
        reason: None,
        responsible_person_id: None,
        status,
        manager_id: None,
        manager_comments: None,
        decision_date: None,
        created_at: start.and_hms_opt(8, 0, 0).unwrap_or_default(),
        updated_at: None,
        employee_name: None,
        department: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn duration_is_inclusive() {
        assert_eq!(duration_days(d(2026, 3, 2), d(2026, 3, 2)), 1);
        assert_eq!(duration_days(d(2026, 3, 2), d(2026, 3, 6)), 5);
        assert_eq!(duration_days(d(2026, 3, 6), d(2026, 3, 2)), 0);
    }

    #[test]
    fn only_pending_leaves_move() {
        assert!(LeaveStatus::Pending.can_transition_to(LeaveStatus::Approved));
        assert!(LeaveStatus::Pending.can_transition_to(LeaveStatus::Cancelled));
        assert!(!LeaveStatus::Pending.can_transition_to(LeaveStatus::Pending));
        assert!(!LeaveStatus::Approved.can_transition_to(LeaveStatus::Rejected));
        assert!(!LeaveStatus::Rejected.can_transition_to(LeaveStatus::Approved));
    }

    #[test]
    fn overlap_and_cover() {
        let leave = sample_leave(
            1,
            2,
            LeaveType::Annual,
            d(2026, 3, 2),
            d(2026, 3, 6),
            LeaveStatus::Approved,
        );
        assert!(leave.overlaps(d(2026, 3, 6), d(2026, 3, 9)));
        assert!(!leave.overlaps(d(2026, 3, 7), d(2026, 3, 9)));
        assert!(leave.covers(d(2026, 3, 4)));
        assert!(!leave.covers(d(2026, 3, 1)));
    }

    #[test]
    fn types_parse_case_insensitively() {
        assert_eq!(LeaveType::from_str("sick").unwrap(), LeaveType::Sick);
        assert_eq!(LeaveType::try_from("ANNUAL".to_string()).unwrap(), LeaveType::Annual);
        assert!(LeaveType::from_str("holiday").is_err());
        assert_eq!(LeaveStatus::Cancelled.as_ref(), "CANCELLED");
    }
}
