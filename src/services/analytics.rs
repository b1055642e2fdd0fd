//! Leave analytics for HR: aggregation, heuristic predictions, risk scoring and
//! recommendations. Everything here is pure; handlers load the rows and pass `today`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration as Timeout;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::debug;
use utoipa::ToSchema;

use super::llm::{ChatCompletion, ChatMessage, ChatRequest};
use super::team::{most_common, round1};
use crate::model::leave::{Leave, LeaveStatus, LeaveType};
use crate::model::role::Role;
use crate::model::user::User;

const NO_DEPARTMENT: &str = "Unassigned";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    #[default]
    CurrentYear,
    #[serde(rename = "last_6_months")]
    Last6Months,
    LastQuarter,
}

impl Timeframe {
    pub fn start(self, today: NaiveDate) -> NaiveDate {
        match self {
            Timeframe::CurrentYear => year_start(today),
            Timeframe::Last6Months => today - Duration::days(180),
            Timeframe::LastQuarter => today - Duration::days(90),
        }
    }
}

pub fn year_start(today: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today)
}

/// A leave flattened with its owner's department.
#[derive(Debug, Clone)]
pub struct LeaveRecord {
    pub employee_id: u64,
    pub employee_name: String,
    pub department: String,
    pub leave_type: LeaveType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub duration: i64,
    pub status: LeaveStatus,
}

impl LeaveRecord {
    pub fn from_leave(leave: &Leave) -> Self {
        Self {
            employee_id: leave.employee_id,
            employee_name: leave.employee_name.clone().unwrap_or_default(),
            department: leave
                .department
                .clone()
                .unwrap_or_else(|| NO_DEPARTMENT.to_string()),
            leave_type: leave.leave_type,
            start_date: leave.start_date,
            end_date: leave.end_date,
            duration: leave.duration_days() as i64,
            status: leave.status,
        }
    }

    fn approved(&self) -> bool {
        self.status == LeaveStatus::Approved
    }
}

/// A balance row joined with its owner.
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct BalanceRecord {
    pub employee_id: u64,
    pub employee_name: String,
    pub department: Option<String>,
    #[sqlx(try_from = "String")]
    pub leave_type: LeaveType,
    pub total_allocated: i32,
    pub used: i32,
    pub available: i32,
}

pub const BALANCE_RECORD_SELECT: &str = "SELECT b.employee_id, u.full_name AS employee_name, \
     u.department, b.leave_type, b.total_allocated, b.used, b.available \
     FROM leave_balances b JOIN users u ON u.id = b.employee_id";

impl BalanceRecord {
    pub fn utilization(&self) -> f64 {
        if self.total_allocated > 0 {
            self.used as f64 / self.total_allocated as f64 * 100.0
        } else {
            0.0
        }
    }

    fn department(&self) -> &str {
        self.department.as_deref().unwrap_or(NO_DEPARTMENT)
    }
}

pub struct AnalyticsData<'a> {
    pub leaves: &'a [LeaveRecord],
    /// Non-HR users in scope.
    pub users: &'a [User],
    pub balances: &'a [BalanceRecord],
}

/// Either a computed section or the reason it could not be computed.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Analysis<T> {
    Ready(T),
    Insufficient { message: String },
}

impl<T> Analysis<T> {
    fn insufficient(message: &str) -> Self {
        Analysis::Insufficient {
            message: message.to_string(),
        }
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Analysis::Ready(t) => Some(t),
            Analysis::Insufficient { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CountDays {
    pub count: usize,
    pub days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_requests: usize,
    pub approved_requests: usize,
    pub total_days_taken: i64,
    pub avg_duration: f64,
    pub approval_rate: f64,
    pub active_employees: usize,
    pub departments: BTreeMap<String, CountDays>,
}

pub fn summarize(data: &AnalyticsData) -> Summary {
    let total = data.leaves.len();
    let approved = data.leaves.iter().filter(|l| l.approved()).count();
    let total_days: i64 = data.leaves.iter().map(|l| l.duration).sum();

    let mut departments: BTreeMap<String, CountDays> = BTreeMap::new();
    for leave in data.leaves {
        let entry = departments.entry(leave.department.clone()).or_default();
        entry.count += 1;
        entry.days += leave.duration;
    }

    let ratio = |n: f64| if total > 0 { round1(n / total as f64) } else { 0.0 };
    Summary {
        total_requests: total,
        approved_requests: approved,
        total_days_taken: total_days,
        avg_duration: ratio(total_days as f64),
        approval_rate: ratio(approved as f64 * 100.0),
        active_employees: data.users.len(),
        departments,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyTrend {
    pub month: String,
    pub requests: usize,
    pub days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentTrend {
    pub requests: usize,
    pub days: i64,
    pub top_type: Option<LeaveType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trends {
    pub monthly_trend: Vec<MonthlyTrend>,
    pub leave_types: BTreeMap<String, usize>,
    pub day_of_week: BTreeMap<String, usize>,
    pub departments: BTreeMap<String, DepartmentTrend>,
    pub seasonal: BTreeMap<String, CountDays>,
}

pub(crate) fn season(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "Winter",
        3..=5 => "Spring",
        6..=8 => "Summer",
        _ => "Fall",
    }
}

pub fn analyze_trends(data: &AnalyticsData) -> Analysis<Trends> {
    if data.leaves.is_empty() {
        return Analysis::insufficient("Insufficient data for trend analysis");
    }

    let mut monthly: BTreeMap<String, CountDays> = BTreeMap::new();
    let mut leave_types: BTreeMap<String, usize> = BTreeMap::new();
    let mut day_of_week: BTreeMap<String, usize> = BTreeMap::new();
    let mut seasonal: BTreeMap<String, CountDays> = BTreeMap::new();
    let mut departments: BTreeMap<String, (CountDays, Vec<LeaveType>)> = BTreeMap::new();

    for leave in data.leaves {
        let month = monthly.entry(leave.start_date.format("%Y-%m").to_string()).or_default();
        month.count += 1;
        month.days += leave.duration;

        *leave_types.entry(leave.leave_type.to_string()).or_default() += 1;
        *day_of_week.entry(leave.start_date.format("%A").to_string()).or_default() += 1;

        let season = seasonal.entry(season(leave.start_date.month()).to_string()).or_default();
        season.count += 1;
        season.days += leave.duration;

        let dept = departments.entry(leave.department.clone()).or_default();
        dept.0.count += 1;
        dept.0.days += leave.duration;
        dept.1.push(leave.leave_type);
    }

    Analysis::Ready(Trends {
        monthly_trend: monthly
            .into_iter()
            .map(|(month, c)| MonthlyTrend {
                month,
                requests: c.count,
                days: c.days,
            })
            .collect(),
        leave_types,
        day_of_week,
        departments: departments
            .into_iter()
            .map(|(name, (c, types))| {
                let trend = DepartmentTrend {
                    requests: c.count,
                    days: c.days,
                    top_type: most_common(types).map(|(t, _)| t),
                };
                (name, trend)
            })
            .collect(),
        seasonal,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthPrediction {
    pub month: String,
    pub predicted_requests: f64,
    pub predicted_days: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HighDemand {
    pub month: String,
    pub expected_requests: f64,
    pub above_average: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LikelyRequest {
    pub employee: String,
    pub department: String,
    pub available_days: i32,
    pub likelihood: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Predictions {
    pub next_90_days: Vec<MonthPrediction>,
    pub high_demand_periods: Vec<HighDemand>,
    pub likely_leave_requests: Vec<LikelyRequest>,
    pub prediction_confidence: String,
}

fn month_name(month: u32) -> String {
    NaiveDate::from_ymd_opt(2000, month, 1)
        .map(|d| d.format("%B").to_string())
        .unwrap_or_default()
}

pub fn predict_patterns(data: &AnalyticsData, today: NaiveDate) -> Analysis<Predictions> {
    if data.leaves.is_empty() {
        return Analysis::insufficient("Insufficient historical data");
    }

    // month -> (requests, average duration)
    let mut per_month: BTreeMap<u32, (f64, f64)> = BTreeMap::new();
    for month in 1..=12 {
        let durations: Vec<i64> = data
            .leaves
            .iter()
            .filter(|l| l.start_date.month() == month)
            .map(|l| l.duration)
            .collect();
        let avg_days = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        };
        per_month.insert(month, (durations.len() as f64, round1(avg_days)));
    }

    let next_90_days = (0..3)
        .map(|i| {
            let month = (today.month0() + i) % 12 + 1;
            let (requests, days) = per_month.get(&month).copied().unwrap_or_default();
            MonthPrediction {
                month: month_name(month),
                predicted_requests: requests,
                predicted_days: days,
            }
        })
        .collect();

    let busy: Vec<f64> = per_month.values().map(|p| p.0).filter(|r| *r > 0.0).collect();
    let avg_all = if busy.is_empty() {
        0.0
    } else {
        busy.iter().sum::<f64>() / busy.len() as f64
    };
    let high_demand_periods = per_month
        .iter()
        .filter(|(_, (requests, _))| *requests > 0.0 && *requests > avg_all * 1.3)
        .map(|(month, (requests, _))| HighDemand {
            month: month_name(*month),
            expected_requests: *requests,
            above_average: round1((requests / avg_all - 1.0) * 100.0),
        })
        .collect();

    let mut likely: Vec<LikelyRequest> = data
        .balances
        .iter()
        .filter(|b| b.available >= 5 && b.utilization() < 30.0)
        .map(|b| {
            let utilization = b.utilization();
            LikelyRequest {
                employee: b.employee_name.clone(),
                department: b.department().to_string(),
                available_days: b.available,
                likelihood: if utilization < 15.0 { "HIGH" } else { "MEDIUM" }.to_string(),
                reason: format!(
                    "Low utilization ({}%), {} days available",
                    round1(utilization),
                    b.available
                ),
            }
        })
        .collect();
    likely.sort_by(|a, b| b.available_days.cmp(&a.available_days));
    likely.truncate(10);

    Analysis::Ready(Predictions {
        next_90_days,
        high_demand_periods,
        likely_leave_requests: likely,
        prediction_confidence: if data.leaves.len() > 20 { "MEDIUM" } else { "LOW" }.to_string(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Risk {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    pub description: String,
    pub impact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl Risk {
    fn new(kind: &str, severity: &str, description: String, impact: String) -> Self {
        Self {
            kind: kind.to_string(),
            severity: severity.to_string(),
            department: None,
            employee: None,
            period: None,
            description,
            impact,
            recommendation: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskReport {
    pub critical_risks: Vec<Risk>,
    pub high_risks: Vec<Risk>,
    pub medium_risks: Vec<Risk>,
    pub total_risks: usize,
    pub risk_score: usize,
}

pub fn identify_risks(data: &AnalyticsData, today: NaiveDate) -> RiskReport {
    let mut report = RiskReport::default();

    let mut dept_sizes: HashMap<&str, usize> = HashMap::new();
    for user in data.users {
        *dept_sizes
            .entry(user.department.as_deref().unwrap_or(NO_DEPARTMENT))
            .or_default() += 1;
    }

    let horizon = today + Duration::days(30);
    let mut dept_days: BTreeMap<&str, i64> = BTreeMap::new();
    for leave in data.leaves.iter().filter(|l| l.approved()) {
        if leave.start_date <= horizon && leave.end_date >= today {
            *dept_days.entry(leave.department.as_str()).or_default() += leave.duration;
        }
    }
    for (dept, total_days) in dept_days {
        let size = dept_sizes.get(dept).copied().unwrap_or(1).max(1);
        let per_person = total_days as f64 / size as f64;
        let impact = format!("Average {} days per employee", round1(per_person));
        if per_person > 10.0 {
            let mut risk = Risk::new(
                "UNDERSTAFFING",
                "CRITICAL",
                format!("{dept} will have {total_days} leave days in next 30 days"),
                impact,
            );
            risk.department = Some(dept.to_string());
            risk.recommendation =
                Some("Consider staggering leaves or hiring temporary support".to_string());
            report.critical_risks.push(risk);
        } else if per_person > 5.0 {
            let mut risk = Risk::new(
                "UNDERSTAFFING",
                "HIGH",
                format!("{dept} has elevated leave volume upcoming"),
                impact,
            );
            risk.department = Some(dept.to_string());
            report.high_risks.push(risk);
        }
    }

    for balance in data.balances {
        if balance.available as f64 > balance.total_allocated as f64 * 0.7 {
            let mut risk = Risk::new(
                "BURNOUT_RISK",
                "MEDIUM",
                format!("{} has {} unused days", balance.employee_name, balance.available),
                "Employee may not be taking adequate rest".to_string(),
            );
            risk.employee = Some(balance.employee_name.clone());
            risk.department = Some(balance.department().to_string());
            risk.recommendation = Some("Encourage employee to use leave balance".to_string());
            report.medium_risks.push(risk);
        }
    }

    let total = data.leaves.len();
    if total > 0 {
        let share = |months: &[u32]| {
            let n = data
                .leaves
                .iter()
                .filter(|l| months.contains(&l.start_date.month()))
                .count();
            n as f64 / total as f64 * 100.0
        };
        let year_end = share(&[12, 1]);
        let summer = share(&[6, 7, 8]);
        if year_end > 40.0 {
            let mut risk = Risk::new(
                "SEASONAL_CLUSTERING",
                "HIGH",
                format!("{year_end:.0}% of leaves concentrated in Dec-Jan"),
                "Potential operational disruption during holidays".to_string(),
            );
            risk.period = Some("Year-end".to_string());
            risk.recommendation =
                Some("Implement leave blackout periods or rotation policy".to_string());
            report.high_risks.push(risk);
        }
        if summer > 50.0 {
            let mut risk = Risk::new(
                "SEASONAL_CLUSTERING",
                "HIGH",
                format!("{summer:.0}% of leaves concentrated in summer"),
                "Reduced capacity during peak period".to_string(),
            );
            risk.period = Some("Summer".to_string());
            report.high_risks.push(risk);
        }
    }

    let (c, h, m) = (
        report.critical_risks.len(),
        report.high_risks.len(),
        report.medium_risks.len(),
    );
    report.total_risks = c + h + m;
    report.risk_score = c * 10 + h * 5 + m * 2;
    report
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub priority: String,
    pub category: String,
    pub title: String,
    pub description: String,
    pub actions: Vec<String>,
    pub impact: String,
}

fn recommendation(
    priority: &str,
    category: &str,
    title: String,
    description: String,
    actions: &[&str],
    impact: &str,
) -> Recommendation {
    Recommendation {
        priority: priority.to_string(),
        category: category.to_string(),
        title,
        description,
        actions: actions.iter().map(|a| a.to_string()).collect(),
        impact: impact.to_string(),
    }
}

pub fn generate_recommendations(
    data: &AnalyticsData,
    trends: &Analysis<Trends>,
    risks: &RiskReport,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    let critical = risks.critical_risks.len();
    if critical > 0 {
        out.push(recommendation(
            "URGENT",
            "STAFFING",
            "Address Critical Staffing Risks".to_string(),
            format!("{critical} critical staffing risk(s) identified"),
            &[
                "Review upcoming leaves in affected departments",
                "Consider temporary staffing or workload redistribution",
                "Implement leave approval restrictions for peak periods",
            ],
            "HIGH",
        ));
    }

    let low_utilization = data.balances.iter().filter(|b| b.utilization() < 30.0).count();
    if low_utilization as f64 > data.balances.len() as f64 * 0.3 {
        out.push(recommendation(
            "HIGH",
            "WELLNESS",
            "Improve Leave Utilization".to_string(),
            format!("{low_utilization} employees using <30% of their leave"),
            &[
                "Send reminders about available leave balances",
                "Encourage managers to promote work-life balance",
                "Consider mandatory minimum leave policy",
                "Investigate workload and culture issues",
            ],
            "MEDIUM",
        ));
    }

    if let Some(trends) = trends.ready() {
        let total: usize = trends.seasonal.values().map(|s| s.count).sum();
        let peak = ["Winter", "Spring", "Summer", "Fall"]
            .iter()
            .filter_map(|name| trends.seasonal.get(*name).map(|s| (*name, s.count)))
            .fold(None, |best: Option<(&str, usize)>, (name, n)| match best {
                Some((_, best_n)) if best_n >= n => best,
                _ => Some((name, n)),
            });
        if let Some((season, count)) = peak {
            if count as f64 > total as f64 * 0.4 {
                out.push(recommendation(
                    "MEDIUM",
                    "PLANNING",
                    "Address Seasonal Imbalance".to_string(),
                    format!("{season} has {count} requests (highest concentration)"),
                    &[
                        "Introduce incentives for off-peak leave",
                        "Implement rotation schedules for popular periods",
                        "Plan for seasonal capacity needs in advance",
                    ],
                    "MEDIUM",
                ));
            }
        }

        let top_department = trends
            .departments
            .iter()
            .filter(|(_, d)| d.requests > 0)
            .fold(None, |best: Option<(&String, usize)>, (name, d)| match best {
                Some((_, n)) if n >= d.requests => best,
                _ => Some((name, d.requests)),
            });
        if let Some((dept, requests)) = top_department {
            out.push(recommendation(
                "MEDIUM",
                "ANALYTICS",
                format!("Monitor {dept} Department"),
                format!("{dept} has highest leave volume ({requests} requests)"),
                &[
                    "Review workload distribution in the department",
                    "Check for burnout indicators",
                    "Ensure adequate backup coverage",
                    "Consider team size and capacity",
                ],
                "MEDIUM",
            ));
        }
    }

    if !data.leaves.is_empty() {
        let avg = data.leaves.iter().map(|l| l.duration).sum::<i64>() as f64 / data.leaves.len() as f64;
        if avg < 2.0 {
            out.push(recommendation(
                "LOW",
                "POLICY",
                "Review Leave Duration Patterns".to_string(),
                format!("Average leave duration is {avg:.1} days (very short)"),
                &[
                    "Investigate if employees feel pressured to take short leaves",
                    "Promote longer rest periods for better recovery",
                    "Review minimum leave duration policies",
                ],
                "LOW",
            ));
        }
    }

    out
}

/// Deterministic summary used when the model is unavailable.
pub fn fallback_insights(
    summary: &Summary,
    predictions: Option<&Analysis<Predictions>>,
    risks: &RiskReport,
) -> String {
    let mut parts = Vec::new();

    let rate = summary.approval_rate;
    if rate < 70.0 {
        parts.push(format!(
            "Your approval rate of {rate}% is below optimal levels, suggesting potential issues with leave policies or management."
        ));
    } else if rate > 95.0 {
        parts.push(format!(
            "Excellent approval rate of {rate}% indicates healthy leave culture and clear policies."
        ));
    }

    let critical = risks.critical_risks.len();
    if critical > 0 {
        parts.push(format!(
            "URGENT: {critical} critical staffing risk(s) require immediate attention to prevent operational disruption."
        ));
    } else if risks.total_risks > 5 {
        parts.push(format!(
            "{} risks identified across departments. Proactive intervention needed.",
            risks.total_risks
        ));
    } else {
        parts.push("Risk levels are manageable with current staffing.".to_string());
    }

    let likely = predictions
        .and_then(Analysis::ready)
        .map_or(0, |p| p.likely_leave_requests.len());
    if likely > 0 {
        parts.push(format!(
            "{likely} employees likely to request leave soon based on low utilization patterns."
        ));
    }

    parts.push(if critical > 0 {
        "RECOMMENDATION: Review and potentially restrict upcoming leaves in critical departments to maintain coverage.".to_string()
    } else {
        "RECOMMENDATION: Focus on encouraging underutilized employees to take adequate rest.".to_string()
    });

    parts.join(" ")
}

const INSIGHTS_PROMPT: &str = "You are an HR analytics expert. Generate a concise, actionable \
insights summary (3-4 sentences) that:\n\n1. Highlights the most important finding\n2. Identifies \
the biggest risk or opportunity\n3. Provides one clear recommendation\n\nBe direct and focus on \
what matters most for HR decision-making. Avoid generic statements.";

/// Natural-language summary from the model, or [`fallback_insights`] on any failure.
pub async fn generate_insights(
    llm: &dyn ChatCompletion,
    summary: &Summary,
    trends: &Analysis<Trends>,
    predictions: Option<&Analysis<Predictions>>,
    risks: &RiskReport,
) -> String {
    let to_json = |v: serde_json::Result<String>| v.unwrap_or_default();
    let context = format!(
        "LEAVE ANALYTICS SUMMARY:\n- Total Requests: {}\n- Approval Rate: {}%\n- Total Days Taken: {}\n\
         - Average Duration: {} days\n\nKEY TRENDS:\n{}\n\nPREDICTIONS:\n{}\n\nRISKS IDENTIFIED:\n\
         - Critical: {}\n- High: {}\n- Medium: {}\n",
        summary.total_requests,
        summary.approval_rate,
        summary.total_days_taken,
        summary.avg_duration,
        to_json(serde_json::to_string_pretty(trends)),
        to_json(serde_json::to_string_pretty(&predictions)),
        risks.critical_risks.len(),
        risks.high_risks.len(),
        risks.medium_risks.len(),
    );

    let request = ChatRequest::new(vec![
        ChatMessage::system(INSIGHTS_PROMPT),
        ChatMessage::user(context),
    ])
    .temperature(0.3)
    .max_tokens(200)
    .timeout(Timeout::from_secs(8));

    match llm.complete(request).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => fallback_insights(summary, predictions, risks),
        Err(e) => {
            debug!(error = %e, "Analytics insights use the fallback summary");
            fallback_insights(summary, predictions, risks)
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DepartmentComparison {
    pub department: String,
    pub total_leaves: usize,
    pub total_days: i64,
    pub employee_count: usize,
    pub avg_leaves_per_employee: f64,
    pub avg_days_per_employee: f64,
}

/// `users` are all users; `leaves` start in the current year.
pub fn department_comparison(users: &[User], leaves: &[Leave]) -> Vec<DepartmentComparison> {
    let mut departments: Vec<&str> = users.iter().filter_map(|u| u.department.as_deref()).collect();
    departments.sort_unstable();
    departments.dedup();

    departments
        .into_iter()
        .map(|dept| {
            let in_dept: Vec<&Leave> = leaves
                .iter()
                .filter(|l| l.department.as_deref() == Some(dept))
                .collect();
            let total_days: i64 = in_dept.iter().map(|l| l.duration_days() as i64).sum();
            let employee_count = users
                .iter()
                .filter(|u| u.department.as_deref() == Some(dept) && u.role() != Role::Hr)
                .count();
            let per_head = |n: f64| {
                if employee_count > 0 {
                    round1(n / employee_count as f64)
                } else {
                    0.0
                }
            };
            DepartmentComparison {
                department: dept.to_string(),
                total_leaves: in_dept.len(),
                total_days,
                employee_count,
                avg_leaves_per_employee: per_head(in_dept.len() as f64),
                avg_days_per_employee: per_head(total_days as f64),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BurnoutIndicator {
    pub employee_id: u64,
    pub employee_name: String,
    pub department: Option<String>,
    pub position: Option<String>,
    pub risk_score: u32,
    pub risk_level: String,
    pub risk_factors: Vec<String>,
    pub days_taken_6m: i64,
    pub leave_utilization: f64,
    pub available_days: i32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BurnoutReport {
    pub at_risk_employees: Vec<BurnoutIndicator>,
    pub total_at_risk: usize,
    pub high_risk: usize,
    pub medium_risk: usize,
}

/// `recent` are approved leaves from the last six months; `balances` are for the current year.
pub fn burnout_indicators(users: &[User], recent: &[Leave], balances: &[BalanceRecord]) -> BurnoutReport {
    let mut indicators: Vec<BurnoutIndicator> = users
        .iter()
        .filter_map(|user| {
            let own: Vec<&Leave> = recent.iter().filter(|l| l.employee_id == user.id).collect();
            let days_taken: i64 = own.iter().map(|l| l.duration_days() as i64).sum();
            let (allocated, available) = balances
                .iter()
                .filter(|b| b.employee_id == user.id)
                .fold((0, 0), |(t, a), b| (t + b.total_allocated, a + b.available));
            let utilization = if allocated > 0 {
                (allocated - available) as f64 / allocated as f64 * 100.0
            } else {
                0.0
            };

            let mut score = 0;
            let mut factors = Vec::new();
            if allocated > 0 && utilization < 20.0 {
                score += 30;
                factors.push("Very low leave utilization".to_string());
            }
            if own.is_empty() {
                score += 40;
                factors.push("No leaves taken in 6 months".to_string());
            }
            if !own.is_empty() && own.iter().all(|l| l.leave_type == LeaveType::Sick) {
                score += 20;
                factors.push("Only sick leaves taken".to_string());
            }
            if own.iter().filter(|l| l.start_date == l.end_date).count() > 5 {
                score += 15;
                factors.push("Many single-day leaves (fragmented rest)".to_string());
            }

            (score > 30).then(|| BurnoutIndicator {
                employee_id: user.id,
                employee_name: user.full_name.clone(),
                department: user.department.clone(),
                position: user.position.clone(),
                risk_score: score,
                risk_level: if score > 60 { "HIGH" } else { "MEDIUM" }.to_string(),
                risk_factors: factors,
                days_taken_6m: days_taken,
                leave_utilization: round1(utilization),
                available_days: available,
            })
        })
        .collect();
    indicators.sort_by(|a, b| b.risk_score.cmp(&a.risk_score));

    let high_risk = indicators.iter().filter(|i| i.risk_level == "HIGH").count();
    BurnoutReport {
        total_at_risk: indicators.len(),
        medium_risk: indicators.len() - high_risk,
        high_risk,
        at_risk_employees: indicators,
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AbsentEmployee {
    pub employee: String,
    pub position: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CoverageGap {
    #[schema(value_type = String, format = "date")]
    pub date: NaiveDate,
    pub department: String,
    pub absent_count: usize,
    pub department_size: usize,
    pub absence_rate: f64,
    pub severity: String,
    pub absent_employees: Vec<AbsentEmployee>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CoverageReport {
    pub coverage_gaps: Vec<CoverageGap>,
    pub total_gaps: usize,
    pub days_analyzed: i64,
    pub high_severity: usize,
}

/// Department-days where more than 30 % of the (non-HR) department is on approved leave.
pub fn coverage_gaps(users: &[User], leaves: &[Leave], today: NaiveDate, days_ahead: i64) -> CoverageReport {
    let end = today + Duration::days(days_ahead);
    let by_id: HashMap<u64, &User> = users.iter().map(|u| (u.id, u)).collect();

    let mut absences: BTreeMap<(String, NaiveDate), Vec<AbsentEmployee>> = BTreeMap::new();
    for leave in leaves.iter().filter(|l| l.status == LeaveStatus::Approved) {
        let Some(user) = by_id.get(&leave.employee_id) else {
            continue;
        };
        let Some(dept) = user.department.as_ref() else {
            continue;
        };
        let mut day = leave.start_date.max(today);
        while day <= leave.end_date.min(end) {
            absences
                .entry((dept.clone(), day))
                .or_default()
                .push(AbsentEmployee {
                    employee: user.full_name.clone(),
                    position: user.position.clone(),
                });
            day += Duration::days(1);
        }
    }

    let dept_size = |dept: &str| {
        users
            .iter()
            .filter(|u| u.department.as_deref() == Some(dept) && u.role() != Role::Hr)
            .count()
    };

    let mut gaps: Vec<CoverageGap> = absences
        .into_iter()
        .filter_map(|((dept, date), absent)| {
            let size = dept_size(&dept);
            let rate = if size > 0 {
                absent.len() as f64 / size as f64 * 100.0
            } else {
                0.0
            };
            (rate > 30.0).then(|| CoverageGap {
                date,
                absent_count: absent.len(),
                department_size: size,
                absence_rate: round1(rate),
                severity: if rate > 50.0 { "HIGH" } else { "MEDIUM" }.to_string(),
                department: dept,
                absent_employees: absent,
            })
        })
        .collect();
    gaps.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then(b.absence_rate.total_cmp(&a.absence_rate))
    });

    CoverageReport {
        total_gaps: gaps.len(),
        high_severity: gaps.iter().filter(|g| g.severity == "HIGH").count(),
        days_analyzed: days_ahead,
        coverage_gaps: gaps,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MonthCount {
    pub month: u32,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DepartmentCount {
    pub department: String,
    pub leave_count: usize,
}

/// The compact year-to-date view the conversation returns for analytics questions.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AnalyticsSnapshot {
    pub monthly_distribution: Vec<MonthCount>,
    pub department_stats: Vec<DepartmentCount>,
}

/// `leaves` start in the current year.
pub fn snapshot(leaves: &[Leave]) -> AnalyticsSnapshot {
    let mut months: BTreeMap<u32, usize> = BTreeMap::new();
    let mut departments: BTreeMap<String, usize> = BTreeMap::new();
    for leave in leaves {
        *months.entry(leave.start_date.month()).or_default() += 1;
        let dept = leave.department.clone().unwrap_or_else(|| NO_DEPARTMENT.to_string());
        *departments.entry(dept).or_default() += 1;
    }
    AnalyticsSnapshot {
        monthly_distribution: months
            .into_iter()
            .map(|(month, count)| MonthCount { month, count })
            .collect(),
        department_stats: departments
            .into_iter()
            .map(|(department, leave_count)| DepartmentCount {
                department,
                leave_count,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::leave::sample_leave;
    use crate::model::user::sample_user;
    use crate::services::llm::testing::ScriptedLlm;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn record(
        employee_id: u64,
        dept: &str,
        leave_type: LeaveType,
        start: NaiveDate,
        end: NaiveDate,
        status: LeaveStatus,
    ) -> LeaveRecord {
        let mut leave = sample_leave(0, employee_id, leave_type, start, end, status);
        leave.employee_name = Some(format!("E{employee_id}"));
        leave.department = Some(dept.to_string());
        LeaveRecord::from_leave(&leave)
    }

    fn balance(employee_id: u64, total: i32, used: i32) -> BalanceRecord {
        BalanceRecord {
            employee_id,
            employee_name: format!("E{employee_id}"),
            department: Some("Ops".to_string()),
            leave_type: LeaveType::Annual,
            total_allocated: total,
            used,
            available: total - used,
        }
    }

    #[test]
    fn summary_and_trends() {
        let leaves = vec![
            record(1, "Ops", LeaveType::Annual, d(2026, 1, 5), d(2026, 1, 9), LeaveStatus::Approved),
            record(2, "Ops", LeaveType::Sick, d(2026, 1, 12), d(2026, 1, 12), LeaveStatus::Rejected),
            record(3, "Eng", LeaveType::Sick, d(2026, 3, 2), d(2026, 3, 3), LeaveStatus::Approved),
        ];
        let data = AnalyticsData {
            leaves: &leaves,
            users: &[],
            balances: &[],
        };

        let summary = summarize(&data);
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_days_taken, 8);
        assert_eq!(summary.avg_duration, 2.7);
        assert_eq!(summary.approval_rate, 66.7);
        assert_eq!(summary.departments["Ops"], CountDays { count: 2, days: 6 });

        let trends = analyze_trends(&data);
        let trends = trends.ready().unwrap();
        assert_eq!(trends.monthly_trend[0].month, "2026-01");
        assert_eq!(trends.monthly_trend[0].requests, 2);
        assert_eq!(trends.leave_types["SICK"], 2);
        assert_eq!(trends.day_of_week["Monday"], 3);
        assert_eq!(trends.departments["Ops"].top_type, Some(LeaveType::Annual));
        assert_eq!(trends.seasonal["Winter"].count, 2);

        let empty = AnalyticsData {
            leaves: &[],
            users: &[],
            balances: &[],
        };
        let json = serde_json::to_value(analyze_trends(&empty)).unwrap();
        assert_eq!(json["message"], "Insufficient data for trend analysis");
    }

    #[test]
    fn predictions_find_high_demand_and_likely_requesters() {
        let mut leaves = Vec::new();
        for i in 0..4 {
            leaves.push(record(i, "Ops", LeaveType::Annual, d(2025, 7, 1), d(2025, 7, 2), LeaveStatus::Approved));
        }
        leaves.push(record(9, "Ops", LeaveType::Sick, d(2025, 3, 1), d(2025, 3, 1), LeaveStatus::Approved));
        leaves.push(record(9, "Ops", LeaveType::Sick, d(2025, 4, 1), d(2025, 4, 1), LeaveStatus::Approved));
        let balances = vec![balance(1, 20, 1), balance(2, 20, 5), balance(3, 4, 0)];
        let data = AnalyticsData {
            leaves: &leaves,
            users: &[],
            balances: &balances,
        };

        let predictions = predict_patterns(&data, d(2026, 6, 15));
        let p = predictions.ready().unwrap();
        let months: Vec<&str> = p.next_90_days.iter().map(|m| m.month.as_str()).collect();
        assert_eq!(months, vec!["June", "July", "August"]);
        assert_eq!(p.next_90_days[1].predicted_requests, 4.0);
        assert_eq!(p.next_90_days[1].predicted_days, 2.0);

        assert_eq!(p.high_demand_periods.len(), 1);
        assert_eq!(p.high_demand_periods[0].month, "July");
        assert_eq!(p.high_demand_periods[0].above_average, 100.0);

        assert_eq!(p.likely_leave_requests.len(), 2);
        assert_eq!(p.likely_leave_requests[0].likelihood, "HIGH");
        assert_eq!(p.likely_leave_requests[1].likelihood, "MEDIUM");
        assert_eq!(p.prediction_confidence, "LOW");
    }

    #[test]
    fn risk_report_weights() {
        let today = d(2026, 7, 1);
        let users = vec![sample_user(1, "A", Role::Employee, "Ops")];
        let leaves = vec![
            record(1, "Ops", LeaveType::Annual, d(2026, 7, 1), d(2026, 7, 12), LeaveStatus::Approved),
            record(1, "Ops", LeaveType::Annual, d(2026, 6, 1), d(2026, 6, 2), LeaveStatus::Pending),
        ];
        let balances = vec![balance(1, 20, 2)];
        let data = AnalyticsData {
            leaves: &leaves,
            users: &users,
            balances: &balances,
        };

        let risks = identify_risks(&data, today);
        assert_eq!(risks.critical_risks.len(), 1);
        assert_eq!(risks.critical_risks[0].department.as_deref(), Some("Ops"));
        assert_eq!(risks.high_risks.len(), 1);
        assert_eq!(risks.high_risks[0].period.as_deref(), Some("Summer"));
        assert_eq!(risks.medium_risks[0].kind, "BURNOUT_RISK");
        assert_eq!(risks.total_risks, 3);
        assert_eq!(risks.risk_score, 17);

        let trends = analyze_trends(&data);
        let recs = generate_recommendations(&data, &trends, &risks);
        let titles: Vec<&str> = recs.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "Address Critical Staffing Risks",
                "Improve Leave Utilization",
                "Address Seasonal Imbalance",
                "Monitor Ops Department",
            ]
        );
    }

    #[actix_web::test]
    async fn insights_fall_back_without_model() {
        let data = AnalyticsData {
            leaves: &[],
            users: &[],
            balances: &[],
        };
        let summary = summarize(&data);
        let risks = identify_risks(&data, d(2026, 1, 1));
        let trends = analyze_trends(&data);

        let text = generate_insights(&ScriptedLlm::failing(), &summary, &trends, None, &risks).await;
        assert_eq!(
            text,
            "Your approval rate of 0% is below optimal levels, suggesting potential issues with leave policies or management. \
             Risk levels are manageable with current staffing. \
             RECOMMENDATION: Focus on encouraging underutilized employees to take adequate rest."
        );

        let llm = ScriptedLlm::new(vec![Ok("  Leave is healthy.  ".to_string())]);
        let text = generate_insights(&llm, &summary, &trends, None, &risks).await;
        assert_eq!(text, "Leave is healthy.");
        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].max_tokens, Some(200));
    }

    #[test]
    fn burnout_scoring() {
        let users = vec![
            sample_user(1, "Idle", Role::Employee, "Ops"),
            sample_user(2, "Sickly", Role::Employee, "Ops"),
            sample_user(3, "Fine", Role::Employee, "Ops"),
        ];
        let recent = vec![
            sample_leave(1, 2, LeaveType::Sick, d(2026, 2, 2), d(2026, 2, 2), LeaveStatus::Approved),
            sample_leave(2, 3, LeaveType::Annual, d(2026, 2, 2), d(2026, 2, 10), LeaveStatus::Approved),
        ];
        let balances = vec![balance(1, 20, 0), balance(2, 20, 1), balance(3, 20, 9)];

        let report = burnout_indicators(&users, &recent, &balances);
        assert_eq!(report.total_at_risk, 2);
        assert_eq!(report.at_risk_employees[0].employee_id, 1);
        assert_eq!(report.at_risk_employees[0].risk_score, 70);
        assert_eq!(report.at_risk_employees[0].risk_level, "HIGH");
        assert_eq!(report.at_risk_employees[1].risk_score, 50);
        assert_eq!(report.at_risk_employees[1].leave_utilization, 5.0);
        assert_eq!((report.high_risk, report.medium_risk), (1, 1));
    }

    #[test]
    fn coverage_gaps_by_department_day() {
        let today = d(2026, 3, 2);
        let users = vec![
            sample_user(1, "A", Role::Employee, "Ops"),
            sample_user(2, "B", Role::Employee, "Ops"),
            sample_user(3, "C", Role::Employee, "Ops"),
            sample_user(4, "HR", Role::Hr, "Ops"),
        ];
        let leaves = vec![
            sample_leave(1, 1, LeaveType::Annual, d(2026, 2, 27), d(2026, 3, 3), LeaveStatus::Approved),
            sample_leave(2, 2, LeaveType::Annual, d(2026, 3, 3), d(2026, 3, 3), LeaveStatus::Approved),
        ];
        let report = coverage_gaps(&users, &leaves, today, 30);
        assert_eq!(report.total_gaps, 2);
        assert_eq!(report.coverage_gaps[0].date, today);
        assert_eq!(report.coverage_gaps[0].absence_rate, 33.3);
        assert_eq!(report.coverage_gaps[0].severity, "MEDIUM");
        assert_eq!(report.coverage_gaps[1].absent_count, 2);
        assert_eq!(report.coverage_gaps[1].severity, "HIGH");
        assert_eq!(report.high_severity, 1);
    }

    #[test]
    fn comparison_and_snapshot() {
        let users = vec![
            sample_user(1, "A", Role::Employee, "Ops"),
            sample_user(2, "B", Role::Hr, "Ops"),
            sample_user(3, "C", Role::Employee, "Eng"),
        ];
        let mut l1 = sample_leave(1, 1, LeaveType::Annual, d(2026, 1, 5), d(2026, 1, 6), LeaveStatus::Approved);
        l1.department = Some("Ops".to_string());
        let mut l2 = sample_leave(2, 1, LeaveType::Sick, d(2026, 2, 5), d(2026, 2, 5), LeaveStatus::Pending);
        l2.department = Some("Ops".to_string());

        let comparison = department_comparison(&users, &[l1.clone(), l2.clone()]);
        assert_eq!(comparison.len(), 2);
        assert_eq!(comparison[0].department, "Eng");
        assert_eq!(comparison[1].employee_count, 1);
        assert_eq!(comparison[1].total_days, 3);
        assert_eq!(comparison[1].avg_leaves_per_employee, 2.0);

        let snap = snapshot(&[l1, l2]);
        assert_eq!(snap.monthly_distribution.len(), 2);
        assert_eq!(snap.department_stats[0].leave_count, 2);
    }
}
