use std::collections::HashMap;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use utoipa::ToSchema;

use crate::model::leave::{Leave, LeaveStatus, LeaveType, duration_days};
use crate::model::leave_balance::LeaveBalance;
use crate::model::user::User;

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn is_weekend(day: NaiveDate) -> bool {
    matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn days_between(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ImpactScore {
    #[schema(example = 45)]
    pub score: u32,
    pub level: ImpactLevel,
    pub factors: Vec<String>,
}

/// Scores how hard a leave hits the team: overlapping absences, length, and month boundaries.
pub fn impact_score(start: NaiveDate, end: NaiveDate, overlapping_teammates: usize) -> ImpactScore {
    let mut score = 0u32;
    let mut factors = Vec::new();

    if overlapping_teammates > 0 {
        score += overlapping_teammates as u32 * 20;
        factors.push(format!("{overlapping_teammates} team member(s) already on leave"));
    }

    let duration = duration_days(start, end);
    if duration > 10 {
        score += 50;
        factors.push("Long duration (>10 days)".to_string());
    } else if duration > 5 {
        score += 30;
        factors.push("Extended duration (>5 days)".to_string());
    }

    if start.day() >= 25 || start.day() <= 5 {
        score += 15;
        factors.push("Month-end/start period".to_string());
    }

    let score = score.min(100);
    let level = match score {
        0..=39 => ImpactLevel::Low,
        40..=69 => ImpactLevel::Medium,
        _ => ImpactLevel::High,
    };
    ImpactScore { score, level, factors }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum CapacityLevel {
    Full,
    Good,
    Limited,
    Critical,
}

pub fn capacity_level(availability_rate: f64) -> CapacityLevel {
    if availability_rate >= 90.0 {
        CapacityLevel::Full
    } else if availability_rate >= 70.0 {
        CapacityLevel::Good
    } else if availability_rate >= 50.0 {
        CapacityLevel::Limited
    } else {
        CapacityLevel::Critical
    }
}

/// A colleague who could cover during a leave.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResponsiblePerson {
    pub id: u64,
    pub name: String,
    pub position: Option<String>,
    pub department: Option<String>,
    pub availability: String,
    pub score: u32,
    pub reason: String,
}

/// Ranks colleagues for cover. Anyone on approved leave in the window scores 0.
pub fn rank_responsible_persons(
    requester: &User,
    colleagues: &[User],
    busy: &[u64],
    limit: usize,
) -> Vec<ResponsiblePerson> {
    let mut ranked: Vec<ResponsiblePerson> = colleagues
        .iter()
        .filter(|c| c.id != requester.id)
        .map(|c| {
            let same_role = c.position.is_some() && c.position == requester.position;
            let (availability, score, reason) = if busy.contains(&c.id) {
                ("On Leave", 0, "On leave during these dates")
            } else if same_role {
                ("Available", 100, "Same role")
            } else {
                ("Available", 80, "Same department")
            };
            ResponsiblePerson {
                id: c.id,
                name: c.full_name.clone(),
                position: c.position.clone(),
                department: c.department.clone(),
                availability: availability.to_string(),
                score,
                reason: reason.to_string(),
            }
        })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DateSuggestion {
    #[schema(value_type = String, format = "date")]
    pub start_date: NaiveDate,
    #[schema(value_type = String, format = "date")]
    pub end_date: NaiveDate,
    pub conflict_score: u32,
    pub overlapping_leaves: usize,
    pub recommendation: String,
}

/// Weekly candidate windows over the next 60 days, least conflicting first.
pub fn suggest_dates(
    department_leaves: &[Leave],
    duration_days: i64,
    today: NaiveDate,
) -> Vec<DateSuggestion> {
    let mut suggestions: Vec<DateSuggestion> = (0..60)
        .step_by(7)
        .map(|offset| {
            let start = today + Duration::days(offset);
            let end = start + Duration::days(duration_days.max(1) - 1);
            let overlapping = department_leaves
                .iter()
                .filter(|l| l.status == LeaveStatus::Approved && l.overlaps(start, end))
                .count();
            let recommendation = match overlapping {
                0 => "Optimal",
                1 => "Moderate",
                _ => "High Conflict",
            };
            DateSuggestion {
                start_date: start,
                end_date: end,
                conflict_score: overlapping as u32 * 25,
                overlapping_leaves: overlapping,
                recommendation: recommendation.to_string(),
            }
        })
        .collect();
    suggestions.sort_by_key(|s| s.conflict_score);
    suggestions.truncate(5);
    suggestions
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CalendarEntry {
    pub employee_id: u64,
    pub employee_name: String,
    pub position: Option<String>,
    pub leave_type: LeaveType,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CalendarDay {
    #[schema(value_type = String, format = "date")]
    pub date: NaiveDate,
    pub day_of_week: String,
    pub is_weekend: bool,
    pub leaves: Vec<CalendarEntry>,
    pub available_count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Period {
    #[schema(value_type = String, format = "date")]
    pub start: NaiveDate,
    #[schema(value_type = String, format = "date")]
    pub end: NaiveDate,
    pub days: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TeamCalendar {
    pub calendar: Vec<CalendarDay>,
    pub period: Period,
    pub team_size: usize,
    pub critical_days: usize,
    pub max_concurrent_leaves: usize,
}

/// Day grid of approved leaves for the next `days_ahead` days.
pub fn team_calendar(members: &[User], leaves: &[Leave], today: NaiveDate, days_ahead: i64) -> TeamCalendar {
    let end = today + Duration::days(days_ahead);
    let team_size = members.len();
    let by_id: HashMap<u64, &User> = members.iter().map(|m| (m.id, m)).collect();

    let calendar: Vec<CalendarDay> = days_between(today, end)
        .map(|day| {
            let entries: Vec<CalendarEntry> = leaves
                .iter()
                .filter(|l| l.status == LeaveStatus::Approved && l.covers(day))
                .filter_map(|l| {
                    by_id.get(&l.employee_id).map(|m| CalendarEntry {
                        employee_id: m.id,
                        employee_name: m.full_name.clone(),
                        position: m.position.clone(),
                        leave_type: l.leave_type,
                    })
                })
                .collect();
            CalendarDay {
                date: day,
                day_of_week: day.format("%A").to_string(),
                is_weekend: is_weekend(day),
                available_count: team_size as i64 - entries.len() as i64,
                leaves: entries,
            }
        })
        .collect();

    let critical_days = calendar
        .iter()
        .filter(|d| !d.is_weekend && d.leaves.len() as f64 > team_size as f64 * 0.3)
        .count();
    let max_concurrent_leaves = calendar.iter().map(|d| d.leaves.len()).max().unwrap_or(0);

    TeamCalendar {
        calendar,
        period: Period {
            start: today,
            end,
            days: days_ahead,
        },
        team_size,
        critical_days,
        max_concurrent_leaves,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema, EnumString, AsRefStr)]
pub enum InsightPeriod {
    #[default]
    #[serde(rename = "last_30_days")]
    #[strum(serialize = "last_30_days")]
    Last30Days,
    #[serde(rename = "last_quarter")]
    #[strum(serialize = "last_quarter")]
    LastQuarter,
    #[serde(rename = "current_year")]
    #[strum(serialize = "current_year")]
    CurrentYear,
}

impl InsightPeriod {
    pub fn start(self, today: NaiveDate) -> NaiveDate {
        match self {
            InsightPeriod::Last30Days => today - Duration::days(30),
            InsightPeriod::LastQuarter => today - Duration::days(90),
            InsightPeriod::CurrentYear => NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
        }
    }

    fn phrase(self) -> &'static str {
        match self {
            InsightPeriod::Last30Days => "last 30 days",
            InsightPeriod::LastQuarter => "last quarter",
            InsightPeriod::CurrentYear => "current year",
        }
    }

    fn title(self) -> &'static str {
        match self {
            InsightPeriod::Last30Days => "Last 30 Days",
            InsightPeriod::LastQuarter => "Last Quarter",
            InsightPeriod::CurrentYear => "Current Year",
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TeamRisk {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub affected_count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InsightSummary {
    pub team_size: usize,
    pub total_leaves: usize,
    pub total_days: i64,
    pub avg_days_per_person: f64,
    pub period: String,
    pub most_common_leave_type: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MemberBreakdown {
    pub employee_id: u64,
    pub name: String,
    pub position: Option<String>,
    pub leaves_taken: usize,
    pub days_taken: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TeamInsights {
    pub summary: InsightSummary,
    pub member_breakdown: Vec<MemberBreakdown>,
    pub risks: Vec<TeamRisk>,
    pub insights: String,
}

/// Most frequent value; ties go to the value seen first.
pub(crate) fn most_common<T: PartialEq + Copy>(values: impl IntoIterator<Item = T>) -> Option<(T, usize)> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }
    counts
        .into_iter()
        .fold(None, |best, (v, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((v, n)),
        })
}

/// Leave patterns for a manager's team over `period`. `leaves` are those starting inside it.
/// Returns `None` for an empty team.
pub fn team_insights(members: &[User], leaves: &[Leave], period: InsightPeriod) -> Option<TeamInsights> {
    if members.is_empty() {
        return None;
    }
    let team_size = members.len();
    let approved: Vec<&Leave> = leaves.iter().filter(|l| l.status == LeaveStatus::Approved).collect();

    let total_leaves = approved.len();
    let total_days: i64 = approved.iter().map(|l| l.duration_days() as i64).sum();

    let mut member_stats: HashMap<u64, (usize, i64)> = HashMap::new();
    for leave in &approved {
        let entry = member_stats.entry(leave.employee_id).or_default();
        entry.0 += 1;
        entry.1 += leave.duration_days() as i64;
    }

    let most_common_type = most_common(approved.iter().map(|l| l.leave_type));

    let mut risks = Vec::new();
    let inactive = members
        .iter()
        .filter(|m| member_stats.get(&m.id).is_none_or(|s| s.1 == 0))
        .count();
    if inactive as f64 > team_size as f64 * 0.3 {
        risks.push(TeamRisk {
            kind: "LOW_UTILIZATION".to_string(),
            severity: "MEDIUM".to_string(),
            message: format!("{inactive} team members haven't taken leave in {}", period.phrase()),
            affected_count: inactive,
        });
    }

    let avg_days = total_days as f64 / team_size as f64;
    if !member_stats.is_empty() {
        let high_usage = member_stats
            .values()
            .filter(|(_, days)| *days as f64 > avg_days * 1.5)
            .count();
        if high_usage > 0 {
            risks.push(TeamRisk {
                kind: "UNEVEN_DISTRIBUTION".to_string(),
                severity: "LOW".to_string(),
                message: format!("{high_usage} team members using significantly more leave than average"),
                affected_count: high_usage,
            });
        }
    }

    let mut text = vec![format!(
        "Your team of {team_size} took {total_leaves} leave requests totaling {total_days} days in the {}.",
        period.phrase()
    )];
    if avg_days < 3.0 {
        text.push(format!(
            "With only {avg_days:.1} days per person on average, your team may be underutilizing their leave benefits."
        ));
    } else if avg_days > 10.0 {
        text.push(format!(
            "At {avg_days:.1} days per person, leave usage is above typical levels. Ensure adequate coverage is maintained."
        ));
    } else {
        text.push(format!(
            "Leave utilization appears healthy at {avg_days:.1} days per person on average."
        ));
    }
    if let Some((leave_type, count)) = most_common_type {
        text.push(format!(
            "The most common leave type is {leave_type}, accounting for {count} requests."
        ));
    }
    let urgent = risks
        .iter()
        .filter(|r| r.severity == "HIGH" || r.severity == "CRITICAL")
        .count();
    if urgent > 0 {
        text.push(format!("{urgent} high-priority concern(s) detected requiring your attention."));
    }
    if inactive > 0 {
        text.push(format!(
            "Consider checking in with {inactive} team member(s) who haven't taken leave recently to ensure work-life balance."
        ));
    }

    Some(TeamInsights {
        summary: InsightSummary {
            team_size,
            total_leaves,
            total_days,
            avg_days_per_person: round1(avg_days),
            period: period.title().to_string(),
            most_common_leave_type: most_common_type
                .map_or_else(|| "N/A".to_string(), |(t, _)| t.to_string()),
        },
        member_breakdown: members
            .iter()
            .map(|m| {
                let (leaves_taken, days_taken) = member_stats.get(&m.id).copied().unwrap_or_default();
                MemberBreakdown {
                    employee_id: m.id,
                    name: m.full_name.clone(),
                    position: m.position.clone(),
                    leaves_taken,
                    days_taken,
                }
            })
            .collect(),
        risks,
        insights: text.join(" "),
    })
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ForecastDay {
    #[schema(value_type = String, format = "date")]
    pub date: NaiveDate,
    pub day_of_week: String,
    pub is_weekend: bool,
    pub available_count: i64,
    pub potential_available: i64,
    pub approved_absences: usize,
    pub pending_absences: usize,
    pub availability_rate: f64,
    pub capacity_level: CapacityLevel,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AvailabilityForecast {
    pub forecast: Vec<ForecastDay>,
    pub team_size: usize,
    pub critical_periods: usize,
    pub avg_availability: f64,
}

/// Per-day availability counting approved absences as certain and pending ones as possible.
pub fn availability_forecast(
    team_size: usize,
    leaves: &[Leave],
    today: NaiveDate,
    days_ahead: i64,
) -> AvailabilityForecast {
    let end = today + Duration::days(days_ahead);
    let forecast: Vec<ForecastDay> = days_between(today, end)
        .map(|day| {
            let covering = leaves.iter().filter(|l| l.covers(day));
            let (approved, pending) = covering.fold((0, 0), |(a, p), l| match l.status {
                LeaveStatus::Approved => (a + 1, p),
                LeaveStatus::Pending => (a, p + 1),
                _ => (a, p),
            });
            let available_count = team_size as i64 - approved as i64;
            let rate = if team_size > 0 {
                available_count as f64 / team_size as f64 * 100.0
            } else {
                0.0
            };
            ForecastDay {
                date: day,
                day_of_week: day.format("%A").to_string(),
                is_weekend: is_weekend(day),
                available_count,
                potential_available: available_count - pending as i64,
                approved_absences: approved,
                pending_absences: pending,
                availability_rate: round1(rate),
                capacity_level: capacity_level(rate),
            }
        })
        .collect();

    let weekdays: Vec<&ForecastDay> = forecast.iter().filter(|d| !d.is_weekend).collect();
    let critical_periods = weekdays.iter().filter(|d| d.availability_rate < 70.0).count();
    let avg_availability = if weekdays.is_empty() {
        0.0
    } else {
        round1(weekdays.iter().map(|d| d.availability_rate).sum::<f64>() / weekdays.len() as f64)
    };

    AvailabilityForecast {
        forecast,
        team_size,
        critical_periods,
        avg_availability,
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CurrentLeave {
    pub leave_type: LeaveType,
    #[schema(value_type = String, format = "date")]
    pub end_date: NaiveDate,
    pub days_remaining: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UpcomingLeave {
    pub id: u64,
    pub leave_type: LeaveType,
    #[schema(value_type = String, format = "date")]
    pub start_date: NaiveDate,
    #[schema(value_type = String, format = "date")]
    pub end_date: NaiveDate,
    pub duration: i32,
    pub status: LeaveStatus,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct BalanceTotals {
    pub total_allocated: i32,
    pub used: i32,
    pub available: i32,
    pub utilization: f64,
}

impl BalanceTotals {
    pub fn of<'a>(balances: impl IntoIterator<Item = &'a LeaveBalance>) -> Self {
        let mut totals = balances.into_iter().fold(Self::default(), |mut acc, b| {
            acc.total_allocated += b.total_allocated;
            acc.used += b.used;
            acc.available += b.available;
            acc
        });
        if totals.total_allocated > 0 {
            totals.utilization = round1(totals.used as f64 / totals.total_allocated as f64 * 100.0);
        }
        totals
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MemberOverview {
    pub id: u64,
    pub name: String,
    pub position: Option<String>,
    pub email: String,
    pub status: String,
    pub current_leave: Option<CurrentLeave>,
    pub upcoming_leaves: Vec<UpcomingLeave>,
    pub leave_balance: BalanceTotals,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TeamOverview {
    pub team_members: Vec<MemberOverview>,
    pub team_size: usize,
    pub available_count: usize,
    pub on_leave_count: usize,
    pub availability_rate: f64,
}

/// Who is out today, what is coming in the next 30 days, and balance totals per member.
pub fn team_overview(
    members: &[User],
    leaves: &[Leave],
    balances: &[LeaveBalance],
    today: NaiveDate,
) -> TeamOverview {
    let horizon = today + Duration::days(30);
    let team_members: Vec<MemberOverview> = members
        .iter()
        .map(|m| {
            let own = leaves.iter().filter(|l| l.employee_id == m.id);
            let current = own
                .clone()
                .find(|l| l.status == LeaveStatus::Approved && l.covers(today));
            let upcoming = own
                .filter(|l| {
                    matches!(l.status, LeaveStatus::Approved | LeaveStatus::Pending)
                        && l.start_date > today
                        && l.start_date <= horizon
                })
                .map(|l| UpcomingLeave {
                    id: l.id,
                    leave_type: l.leave_type,
                    start_date: l.start_date,
                    end_date: l.end_date,
                    duration: l.duration_days(),
                    status: l.status,
                })
                .collect();
            MemberOverview {
                id: m.id,
                name: m.full_name.clone(),
                position: m.position.clone(),
                email: m.email.clone(),
                status: if current.is_some() { "ON_LEAVE" } else { "AVAILABLE" }.to_string(),
                current_leave: current.map(|l| CurrentLeave {
                    leave_type: l.leave_type,
                    end_date: l.end_date,
                    days_remaining: (l.end_date - today).num_days(),
                }),
                upcoming_leaves: upcoming,
                leave_balance: BalanceTotals::of(balances.iter().filter(|b| b.employee_id == m.id)),
            }
        })
        .collect();

    let available_count = team_members.iter().filter(|m| m.current_leave.is_none()).count();
    let team_size = members.len();
    TeamOverview {
        on_leave_count: team_size - available_count,
        availability_rate: if team_size > 0 {
            round1(available_count as f64 / team_size as f64 * 100.0)
        } else {
            0.0
        },
        team_members,
        team_size,
        available_count,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MemberStatus {
    pub id: u64,
    pub name: String,
    pub position: Option<String>,
    pub department: Option<String>,
    pub status: String,
    #[schema(value_type = Option<String>, format = "date")]
    pub on_leave_until: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TeamStatus {
    pub total_members: usize,
    pub available: usize,
    pub on_leave: usize,
    pub members: Vec<MemberStatus>,
}

/// "On Leave" when an approved leave covers `today`, otherwise "Available".
pub fn team_status(members: &[User], leaves: &[Leave], today: NaiveDate) -> TeamStatus {
    let statuses: Vec<MemberStatus> = members
        .iter()
        .map(|m| {
            let current = leaves.iter().find(|l| {
                l.employee_id == m.id && l.status == LeaveStatus::Approved && l.covers(today)
            });
            MemberStatus {
                id: m.id,
                name: m.full_name.clone(),
                position: m.position.clone(),
                department: m.department.clone(),
                status: if current.is_some() { "On Leave" } else { "Available" }.to_string(),
                on_leave_until: current.map(|l| l.end_date),
            }
        })
        .collect();
    let on_leave = statuses.iter().filter(|s| s.on_leave_until.is_some()).count();
    TeamStatus {
        total_members: statuses.len(),
        available: statuses.len() - on_leave,
        on_leave,
        members: statuses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::leave::sample_leave;
    use crate::model::role::Role;
    use crate::model::user::sample_user;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    #[test]
    fn impact_scoring() {
        let quiet = impact_score(d(3, 10), d(3, 11), 0);
        assert_eq!(quiet.score, 0);
        assert_eq!(quiet.level, ImpactLevel::Low);
        assert!(quiet.factors.is_empty());

        let long = impact_score(d(3, 10), d(3, 23), 1);
        assert_eq!(long.score, 70);
        assert_eq!(long.level, ImpactLevel::High);
        assert!(long.factors.contains(&"Long duration (>10 days)".to_string()));

        let medium = impact_score(d(3, 26), d(3, 31), 0);
        assert_eq!(medium.score, 45);
        assert_eq!(medium.level, ImpactLevel::Medium);

        assert_eq!(impact_score(d(3, 1), d(3, 20), 4).score, 100);
    }

    #[test]
    fn capacity_thresholds() {
        assert_eq!(capacity_level(90.0), CapacityLevel::Full);
        assert_eq!(capacity_level(89.9), CapacityLevel::Good);
        assert_eq!(capacity_level(70.0), CapacityLevel::Good);
        assert_eq!(capacity_level(50.0), CapacityLevel::Limited);
        assert_eq!(capacity_level(49.0), CapacityLevel::Critical);
    }

    #[test]
    fn responsible_persons_prefer_same_role() {
        let mut me = sample_user(1, "Jane Doe", Role::Employee, "Engineering");
        me.position = Some("Backend Developer".to_string());
        let mut twin = sample_user(2, "Ann Lee", Role::Employee, "Engineering");
        twin.position = Some("Backend Developer".to_string());
        let other = sample_user(3, "Bob Ray", Role::Employee, "Engineering");
        let away = sample_user(4, "Cy Tan", Role::Employee, "Engineering");

        let ranked = rank_responsible_persons(&me, &[other, away, twin, me.clone()], &[4], 5);
        let ids: Vec<u64> = ranked.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(ranked[0].reason, "Same role");
        assert_eq!(ranked[1].score, 80);
        assert_eq!(ranked[2].availability, "On Leave");
    }

    #[test]
    fn date_suggestions_rank_by_conflicts() {
        let today = d(3, 2);
        let busy = vec![
            sample_leave(1, 2, LeaveType::Annual, d(3, 2), d(3, 6), LeaveStatus::Approved),
            sample_leave(2, 3, LeaveType::Annual, d(3, 3), d(3, 4), LeaveStatus::Approved),
            sample_leave(3, 3, LeaveType::Annual, d(3, 9), d(3, 9), LeaveStatus::Pending),
        ];
        let suggestions = suggest_dates(&busy, 3, today);
        assert_eq!(suggestions.len(), 5);
        assert!(suggestions.iter().all(|s| s.recommendation == "Optimal"));
        assert_eq!(suggestions[0].start_date, d(3, 9));
        assert_eq!(suggestions[0].end_date, d(3, 11));

        let packed = vec![
            sample_leave(4, 2, LeaveType::Annual, d(3, 1), d(5, 31), LeaveStatus::Approved),
            sample_leave(5, 3, LeaveType::Annual, d(3, 1), d(5, 31), LeaveStatus::Approved),
        ];
        let crowded = suggest_dates(&packed, 2, today);
        assert!(crowded.iter().all(|s| s.recommendation == "High Conflict" && s.conflict_score == 50));
    }

    #[test]
    fn calendar_marks_critical_weekdays() {
        let team = vec![
            sample_user(1, "A", Role::Employee, "Ops"),
            sample_user(2, "B", Role::Employee, "Ops"),
            sample_user(3, "C", Role::Employee, "Ops"),
        ];
        let leaves = vec![
            sample_leave(10, 1, LeaveType::Sick, d(3, 2), d(3, 3), LeaveStatus::Approved),
            sample_leave(11, 2, LeaveType::Annual, d(3, 3), d(3, 3), LeaveStatus::Approved),
            sample_leave(12, 3, LeaveType::Annual, d(3, 3), d(3, 3), LeaveStatus::Pending),
        ];
        // 2026-03-02 is a Monday.
        let cal = team_calendar(&team, &leaves, d(3, 2), 7);
        assert_eq!(cal.calendar.len(), 8);
        assert_eq!(cal.calendar[1].leaves.len(), 2);
        assert_eq!(cal.calendar[1].available_count, 1);
        assert_eq!(cal.critical_days, 2);
        assert_eq!(cal.max_concurrent_leaves, 2);
        assert_eq!(cal.calendar[0].day_of_week, "Monday");
        assert!(cal.calendar[5].is_weekend);
    }

    #[test]
    fn insights_flag_inactive_and_heavy_users() {
        let team: Vec<User> = (1..=4)
            .map(|i| sample_user(i, &format!("M{i}"), Role::Employee, "Ops"))
            .collect();
        let leaves = vec![
            sample_leave(1, 1, LeaveType::Annual, d(2, 2), d(2, 11), LeaveStatus::Approved),
            sample_leave(2, 2, LeaveType::Sick, d(2, 20), d(2, 20), LeaveStatus::Approved),
            sample_leave(3, 3, LeaveType::Sick, d(2, 21), d(2, 21), LeaveStatus::Rejected),
        ];
        let insights = team_insights(&team, &leaves, InsightPeriod::LastQuarter).unwrap();
        assert_eq!(insights.summary.total_leaves, 2);
        assert_eq!(insights.summary.total_days, 11);
        assert_eq!(insights.summary.avg_days_per_person, 2.8);
        assert_eq!(insights.summary.period, "Last Quarter");
        assert_eq!(insights.summary.most_common_leave_type, "ANNUAL");

        let kinds: Vec<&str> = insights.risks.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["LOW_UTILIZATION", "UNEVEN_DISTRIBUTION"]);
        assert_eq!(insights.risks[0].affected_count, 2);
        assert!(insights.insights.starts_with("Your team of 4 took 2 leave requests totaling 11 days in the last quarter."));
        assert!(insights.insights.contains("underutilizing"));

        assert!(team_insights(&[], &leaves, InsightPeriod::Last30Days).is_none());
    }

    #[test]
    fn forecast_counts_pending_separately() {
        let leaves = vec![
            sample_leave(1, 1, LeaveType::Annual, d(3, 2), d(3, 2), LeaveStatus::Approved),
            sample_leave(2, 2, LeaveType::Annual, d(3, 2), d(3, 3), LeaveStatus::Pending),
        ];
        let forecast = availability_forecast(4, &leaves, d(3, 2), 7);
        let monday = &forecast.forecast[0];
        assert_eq!(monday.available_count, 3);
        assert_eq!(monday.potential_available, 2);
        assert_eq!(monday.availability_rate, 75.0);
        assert_eq!(monday.capacity_level, CapacityLevel::Good);
        assert_eq!(forecast.critical_periods, 0);
        assert_eq!(forecast.avg_availability, 95.8);
    }

    #[test]
    fn overview_and_status() {
        let today = d(3, 4);
        let team = vec![
            sample_user(1, "A", Role::Employee, "Ops"),
            sample_user(2, "B", Role::Employee, "Ops"),
        ];
        let leaves = vec![
            sample_leave(1, 1, LeaveType::Sick, d(3, 3), d(3, 6), LeaveStatus::Approved),
            sample_leave(2, 2, LeaveType::Annual, d(3, 20), d(3, 22), LeaveStatus::Pending),
            sample_leave(3, 2, LeaveType::Annual, d(5, 20), d(5, 22), LeaveStatus::Pending),
        ];
        let mut balance = LeaveBalance::new(2, 2026, LeaveType::Annual, 20).unwrap();
        balance.debit(5).unwrap();

        let overview = team_overview(&team, &leaves, &[balance], today);
        assert_eq!(overview.on_leave_count, 1);
        assert_eq!(overview.availability_rate, 50.0);
        assert_eq!(overview.team_members[0].status, "ON_LEAVE");
        assert_eq!(overview.team_members[0].current_leave.as_ref().unwrap().days_remaining, 2);
        assert_eq!(overview.team_members[1].upcoming_leaves.len(), 1);
        assert_eq!(overview.team_members[1].leave_balance.utilization, 25.0);

        let status = team_status(&team, &leaves, today);
        assert_eq!((status.available, status.on_leave), (1, 1));
        assert_eq!(status.members[0].status, "On Leave");
        assert_eq!(status.members[0].on_leave_until, Some(d(3, 6)));
    }

    #[test]
    fn most_common_prefers_first_on_ties() {
        assert_eq!(most_common(["b", "a", "a", "b"]), Some(("b", 2)));
        assert_eq!(most_common(Vec::<u8>::new()), None);
    }
}
