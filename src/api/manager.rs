use crate::{
    auth::auth::AuthUser,
    error::{AppError, AppResult},
    model::leave::{Leave, LeaveStatus},
    model::user::User,
    services::{
        leave_service,
        llm::ChatCompletion,
        team::{
            self, AvailabilityForecast, ImpactScore, InsightPeriod, TeamCalendar, TeamInsights, TeamOverview,
        },
    },
};
use actix_web::{HttpResponse, web};
use chrono::{Datelike, Duration, Local};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::MySqlPool;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, ToSchema)]
pub struct PendingLeave {
    pub leave: Leave,
    pub employee_name: String,
    pub employee_position: Option<String>,
    pub impact_score: ImpactScore,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LeaveApproval {
    #[schema(example = 12)]
    pub leave_id: u64,
    pub approved: bool,
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct DaysAheadQuery {
    pub days_ahead: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PeriodQuery {
    /// last_30_days | last_quarter | current_year
    pub period: Option<String>,
}

fn days_ahead(raw: Option<i64>, default: i64, min: i64, max: i64) -> AppResult<i64> {
    let days = raw.unwrap_or(default);
    if (min..=max).contains(&days) {
        Ok(days)
    } else {
        Err(AppError::bad_request(format!("days_ahead must be between {min} and {max}")))
    }
}

async fn team_of(auth: &AuthUser, pool: &MySqlPool) -> AppResult<Vec<User>> {
    auth.require_manager()?;
    Ok(User::direct_reports(pool, auth.user_id).await?)
}

fn ids(members: &[User]) -> Vec<u64> {
    members.iter().map(|m| m.id).collect()
}

/// Pending leaves of my team
#[utoipa::path(
    get,
    path = "/api/v1/managers/pending-leaves",
    responses(
        (status = 200, description = "Pending leaves of direct reports with impact score", body = [PendingLeave]),
        (status = 403, description = "Manager or HR only")
    ),
    tag = "Manager",
    security(("bearer_auth" = []))
)]
pub async fn pending_leaves(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_manager()?;
    let pending = leave_service::pending_for_manager(pool.get_ref(), auth.user_id).await?;
    let members = User::direct_reports(pool.get_ref(), auth.user_id).await?;

    let mut results = Vec::with_capacity(pending.len());
    for leave in pending {
        let teammates: Vec<u64> = members
            .iter()
            .filter(|m| m.id != leave.employee_id && m.department == leave.department)
            .map(|m| m.id)
            .collect();
        let overlapping = leave_service::leaves_overlapping(
            pool.get_ref(),
            &teammates,
            &[LeaveStatus::Approved],
            leave.start_date,
            leave.end_date,
        )
        .await?
        .len();
        let position = members
            .iter()
            .find(|m| m.id == leave.employee_id)
            .and_then(|m| m.position.clone());
        results.push(PendingLeave {
            impact_score: team::impact_score(leave.start_date, leave.end_date, overlapping),
            employee_name: leave.employee_name.clone().unwrap_or_default(),
            employee_position: position,
            leave,
        });
    }
    Ok(HttpResponse::Ok().json(results))
}

/// Approve or reject a leave
#[utoipa::path(
    post,
    path = "/api/v1/managers/leaves/approve",
    request_body = LeaveApproval,
    responses(
        (status = 200, description = "Leave decided", body = Object, example = json!({
            "message": "Leave request processed successfully",
            "status": "APPROVED",
            "warnings": []
        })),
        (status = 400, description = "Not pending, policy violation or insufficient balance"),
        (status = 403, description = "Not the employee's manager"),
        (status = 404, description = "Leave not found")
    ),
    tag = "Manager",
    security(("bearer_auth" = []))
)]
pub async fn approve_leave(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    llm: web::Data<dyn ChatCompletion>,
    payload: web::Json<LeaveApproval>,
) -> AppResult<HttpResponse> {
    auth.require_manager()?;
    let approver = auth.load(pool.get_ref()).await?;
    let outcome = leave_service::decide_leave(
        pool.get_ref(),
        llm.get_ref(),
        &approver,
        payload.leave_id,
        payload.approved,
        payload.comments.as_deref(),
    )
    .await?;

    info!(leave_id = payload.leave_id, approved = payload.approved, "Leave processed");
    Ok(HttpResponse::Ok().json(json!({
        "message": "Leave request processed successfully",
        "status": outcome.leave.status,
        "leave": outcome.leave,
        "warnings": outcome.warnings,
    })))
}

/// Team overview
#[utoipa::path(
    get,
    path = "/api/v1/managers/team-overview",
    responses(
        (status = 200, description = "Today's status, upcoming leaves and balances per member", body = TeamOverview),
        (status = 403, description = "Manager or HR only")
    ),
    tag = "Manager",
    security(("bearer_auth" = []))
)]
pub async fn team_overview(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    let members = team_of(&auth, pool.get_ref()).await?;
    let today = Local::now().date_naive();
    let member_ids = ids(&members);

    let leaves = leave_service::leaves_overlapping(
        pool.get_ref(),
        &member_ids,
        &[LeaveStatus::Approved, LeaveStatus::Pending],
        today,
        today + Duration::days(30),
    )
    .await?;
    let balances = leave_service::balances_for_employees(pool.get_ref(), &member_ids, today.year()).await?;

    Ok(HttpResponse::Ok().json(team::team_overview(&members, &leaves, &balances, today)))
}

/// Team calendar
#[utoipa::path(
    get,
    path = "/api/v1/managers/team-calendar",
    params(DaysAheadQuery),
    responses(
        (status = 200, description = "Day grid with approved absences", body = TeamCalendar),
        (status = 400, description = "days_ahead outside 7..=90")
    ),
    tag = "Manager",
    security(("bearer_auth" = []))
)]
pub async fn team_calendar(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<DaysAheadQuery>,
) -> AppResult<HttpResponse> {
    let days = days_ahead(query.days_ahead, 30, 7, 90)?;
    let members = team_of(&auth, pool.get_ref()).await?;
    let today = Local::now().date_naive();

    let leaves = leave_service::leaves_overlapping(
        pool.get_ref(),
        &ids(&members),
        &[LeaveStatus::Approved],
        today,
        today + Duration::days(days),
    )
    .await?;
    Ok(HttpResponse::Ok().json(team::team_calendar(&members, &leaves, today, days)))
}

/// Team insights
#[utoipa::path(
    get,
    path = "/api/v1/managers/team-insights",
    params(PeriodQuery),
    responses(
        (status = 200, description = "Summary, member breakdown, risks and insight text", body = TeamInsights),
        (status = 400, description = "Unknown period")
    ),
    tag = "Manager",
    security(("bearer_auth" = []))
)]
pub async fn team_insights(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<PeriodQuery>,
) -> AppResult<HttpResponse> {
    let period = match query.period.as_deref() {
        None => InsightPeriod::default(),
        Some(raw) => raw
            .parse::<InsightPeriod>()
            .map_err(|_| AppError::bad_request("period must be last_30_days, last_quarter or current_year"))?,
    };
    let members = team_of(&auth, pool.get_ref()).await?;
    let today = Local::now().date_naive();

    let leaves = leave_service::leaves_starting_between(
        pool.get_ref(),
        Some(ids(&members).as_slice()),
        period.start(today),
        today,
    )
    .await?;

    match team::team_insights(&members, &leaves, period) {
        Some(insights) => Ok(HttpResponse::Ok().json(insights)),
        None => Ok(HttpResponse::Ok().json(json!({
            "message": "No team members found",
            "insights": []
        }))),
    }
}

/// Team availability forecast
#[utoipa::path(
    get,
    path = "/api/v1/managers/team-availability-forecast",
    params(DaysAheadQuery),
    responses(
        (status = 200, description = "Per-day availability and capacity level", body = AvailabilityForecast),
        (status = 400, description = "days_ahead outside 7..=60")
    ),
    tag = "Manager",
    security(("bearer_auth" = []))
)]
pub async fn availability_forecast(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<DaysAheadQuery>,
) -> AppResult<HttpResponse> {
    let days = days_ahead(query.days_ahead, 14, 7, 60)?;
    let members = team_of(&auth, pool.get_ref()).await?;
    let today = Local::now().date_naive();

    let leaves = leave_service::leaves_overlapping(
        pool.get_ref(),
        &ids(&members),
        &[LeaveStatus::Approved, LeaveStatus::Pending],
        today,
        today + Duration::days(days),
    )
    .await?;
    Ok(HttpResponse::Ok().json(team::availability_forecast(members.len(), &leaves, today, days)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn days_ahead_bounds() {
        assert_eq!(days_ahead(None, 30, 7, 90).unwrap(), 30);
        assert_eq!(days_ahead(Some(7), 30, 7, 90).unwrap(), 7);
        let err = days_ahead(Some(91), 30, 7, 90).unwrap_err();
        assert_eq!(err.to_string(), "days_ahead must be between 7 and 90");
        assert!(days_ahead(Some(6), 14, 7, 60).is_err());
    }
}
