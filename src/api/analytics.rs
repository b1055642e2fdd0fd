use crate::{
    auth::auth::AuthUser,
    error::AppResult,
    model::{
        leave::{LEAVE_SELECT, Leave, LeaveStatus},
        role::Role,
        user::{USER_COLUMNS, User},
    },
    services::{
        analytics::{
            self, Analysis, AnalyticsData, BalanceRecord, BurnoutReport, CoverageReport, LeaveRecord, Predictions,
            RiskReport, Summary, Timeframe, Trends,
        },
        leave_service::{self, Scope},
        llm::ChatCompletion,
    },
};
use actix_web::{HttpResponse, web};
use chrono::{Datelike, Duration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnalyticsRequest {
    /// current_year | last_6_months | last_quarter
    #[serde(default)]
    pub timeframe: Timeframe,
    pub department: Option<String>,
    #[serde(default = "default_true")]
    pub include_predictions: bool,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CoverageQuery {
    /// Defaults to 30.
    pub days_ahead: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct InsightsReport {
    pub summary: Summary,
    pub trends: Analysis<Trends>,
    /// `{}` when predictions were not requested.
    #[serde(serialize_with = "predictions_or_empty")]
    pub predictions: Option<Analysis<Predictions>>,
    pub risks: RiskReport,
    pub recommendations: Vec<analytics::Recommendation>,
    pub insights: String,
}

fn predictions_or_empty<S: serde::Serializer>(
    value: &Option<Analysis<Predictions>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(p) => p.serialize(serializer),
        None => json!({}).serialize(serializer),
    }
}

/// Everything but the insight text, which needs the model.
fn assemble(
    leaves: &[Leave],
    users: &[User],
    balances: &[BalanceRecord],
    include_predictions: bool,
    today: NaiveDate,
) -> InsightsReport {
    let records: Vec<LeaveRecord> = leaves.iter().map(LeaveRecord::from_leave).collect();
    let data = AnalyticsData { leaves: &records, users, balances };

    let trends = analytics::analyze_trends(&data);
    let risks = analytics::identify_risks(&data, today);
    InsightsReport {
        summary: analytics::summarize(&data),
        predictions: include_predictions.then(|| analytics::predict_patterns(&data, today)),
        recommendations: analytics::generate_recommendations(&data, &trends, &risks),
        trends,
        risks,
        insights: String::new(),
    }
}

/// Non-HR users, optionally of one department.
async fn staff(pool: &MySqlPool, department: Option<&str>) -> Result<Vec<User>, sqlx::Error> {
    let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {USER_COLUMNS} FROM users WHERE role_id <> "));
    qb.push_bind(Role::Hr.id());
    if let Some(department) = department {
        qb.push(" AND department = ").push_bind(department.to_string());
    }
    qb.build_query_as::<User>().fetch_all(pool).await
}

async fn all_users(pool: &MySqlPool) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users"))
        .fetch_all(pool)
        .await
}

/// Leaves starting on or after `from`, any status unless `approved_only`.
async fn leaves_since(pool: &MySqlPool, from: NaiveDate, approved_only: bool) -> Result<Vec<Leave>, sqlx::Error> {
    let mut qb = QueryBuilder::<MySql>::new(LEAVE_SELECT);
    qb.push(" WHERE l.start_date >= ").push_bind(from);
    if approved_only {
        qb.push(" AND l.status = 'APPROVED'");
    }
    qb.build_query_as::<Leave>().fetch_all(pool).await
}

/// AI-assisted leave insights
#[utoipa::path(
    post,
    path = "/api/v1/analytics/insights",
    request_body = AnalyticsRequest,
    responses(
        (status = 200, description = "Summary, trends, predictions, risks, recommendations and insight text", body = Object, example = json!({
            "summary": {"total_requests": 42, "approved_requests": 35, "approval_rate": 83.3},
            "risks": {"critical_risks": [], "high_risks": [], "medium_risks": [], "total_risks": 0, "risk_score": 0},
            "insights": "Risk levels are manageable with current staffing."
        })),
        (status = 403, description = "HR only")
    ),
    tag = "Analytics",
    security(("bearer_auth" = []))
)]
pub async fn insights(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    llm: web::Data<dyn ChatCompletion>,
    payload: web::Json<AnalyticsRequest>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let today = Local::now().date_naive();
    let department = payload.department.as_deref();

    let leaves: Vec<Leave> =
        leave_service::leaves_starting_between(pool.get_ref(), None, payload.timeframe.start(today), today)
            .await?
            .into_iter()
            .filter(|l| department.is_none() || l.department.as_deref() == department)
            .collect();
    let users = staff(pool.get_ref(), department).await?;
    let balances = leave_service::query_balances(pool.get_ref(), Scope::All, department, today.year()).await?;

    let mut report = assemble(&leaves, &users, &balances, payload.include_predictions, today);
    report.insights = analytics::generate_insights(
        llm.get_ref(),
        &report.summary,
        &report.trends,
        report.predictions.as_ref(),
        &report.risks,
    )
    .await;

    info!(
        timeframe = ?payload.timeframe,
        department = department.unwrap_or("all"),
        requests = report.summary.total_requests,
        risk_score = report.risks.risk_score,
        "Analytics insights generated"
    );
    Ok(HttpResponse::Ok().json(report))
}

/// Leave volume per department this year
#[utoipa::path(
    get,
    path = "/api/v1/analytics/department-comparison",
    responses((status = 200, description = "Per-department totals and per-head averages", body = Object, example = json!({
        "departments": [{"department": "Engineering", "total_leaves": 14, "total_days": 40, "employee_count": 8,
                         "avg_leaves_per_employee": 1.8, "avg_days_per_employee": 5.0}]
    }))),
    tag = "Analytics",
    security(("bearer_auth" = []))
)]
pub async fn department_comparison(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let today = Local::now().date_naive();
    let users = all_users(pool.get_ref()).await?;
    let leaves = leaves_since(pool.get_ref(), analytics::year_start(today), false).await?;
    Ok(HttpResponse::Ok().json(json!({ "departments": analytics::department_comparison(&users, &leaves) })))
}

/// Employees showing burnout indicators
#[utoipa::path(
    get,
    path = "/api/v1/analytics/burnout-indicators",
    responses((status = 200, description = "Employees scoring above 30", body = BurnoutReport)),
    tag = "Analytics",
    security(("bearer_auth" = []))
)]
pub async fn burnout_indicators(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let today = Local::now().date_naive();
    let users = staff(pool.get_ref(), None).await?;
    let recent = leaves_since(pool.get_ref(), today - Duration::days(180), true).await?;
    let balances = leave_service::query_balances(pool.get_ref(), Scope::All, None, today.year()).await?;
    Ok(HttpResponse::Ok().json(analytics::burnout_indicators(&users, &recent, &balances)))
}

/// Upcoming department coverage gaps
#[utoipa::path(
    get,
    path = "/api/v1/analytics/coverage-gaps",
    params(CoverageQuery),
    responses((status = 200, description = "Department-days with more than 30% absent", body = CoverageReport)),
    tag = "Analytics",
    security(("bearer_auth" = []))
)]
pub async fn coverage_gaps(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<CoverageQuery>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let today = Local::now().date_naive();
    let days_ahead = query.days_ahead.unwrap_or(30).clamp(1, 365);

    let users = all_users(pool.get_ref()).await?;
    let ids: Vec<u64> = users.iter().map(|u| u.id).collect();
    let leaves = leave_service::leaves_overlapping(
        pool.get_ref(),
        &ids,
        &[LeaveStatus::Approved],
        today,
        today + Duration::days(days_ahead),
    )
    .await?;
    Ok(HttpResponse::Ok().json(analytics::coverage_gaps(&users, &leaves, today, days_ahead)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::leave::{LeaveType, sample_leave};
    use crate::model::user::sample_user;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    #[test]
    fn request_defaults_to_current_year_with_predictions() {
        let req: AnalyticsRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.timeframe, Timeframe::CurrentYear);
        assert!(req.include_predictions);

        let req: AnalyticsRequest =
            serde_json::from_value(json!({"timeframe": "last_6_months", "include_predictions": false})).unwrap();
        assert_eq!(req.timeframe, Timeframe::Last6Months);
        assert!(!req.include_predictions);
    }

    #[test]
    fn empty_history_still_produces_a_report() {
        let users = vec![sample_user(2, "Ann Lee", Role::Employee, "Ops")];
        let report = assemble(&[], &users, &[], false, day(3, 1));

        assert_eq!(report.summary.total_requests, 0);
        assert_eq!(report.summary.active_employees, 1);
        assert!(report.trends.ready().is_none());

        let body = serde_json::to_value(&report).unwrap();
        assert_eq!(body["predictions"], json!({}));
    }

    #[test]
    fn summary_counts_approved_leaves() {
        let users = vec![sample_user(2, "Ann Lee", Role::Employee, "Ops")];
        let leaves = vec![
            sample_leave(1, 2, LeaveType::Annual, day(2, 2), day(2, 4), LeaveStatus::Approved),
            sample_leave(2, 2, LeaveType::Sick, day(2, 10), day(2, 10), LeaveStatus::Rejected),
        ];
        let report = assemble(&leaves, &users, &[], true, day(3, 1));

        assert_eq!(report.summary.total_requests, 2);
        assert_eq!(report.summary.approved_requests, 1);
        assert_eq!(report.summary.total_days_taken, 4);
        assert!(report.predictions.is_some());
    }
}
