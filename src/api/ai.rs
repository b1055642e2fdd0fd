use crate::{
    auth::auth::AuthUser,
    error::{AppError, AppResult},
    model::{leave::LeaveStatus, user::User},
    services::{
        leave_service,
        team::{self, DateSuggestion, ResponsiblePerson},
    },
};
use actix_web::{HttpResponse, web};
use chrono::{Duration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use utoipa::{IntoParams, ToSchema};

const SEARCH_WINDOW_DAYS: i64 = 60;

#[derive(Debug, Deserialize, IntoParams)]
pub struct SuggestDatesQuery {
    /// Length of the planned leave in days.
    pub duration_days: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CoverQuery {
    #[param(value_type = String, format = "date", example = "2026-11-02")]
    pub start_date: NaiveDate,
    #[param(value_type = String, format = "date", example = "2026-11-06")]
    pub end_date: NaiveDate,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DateSuggestions {
    pub suggestions: Vec<DateSuggestion>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CoverSuggestions {
    pub suggestions: Vec<ResponsiblePerson>,
}

/// Active department colleagues, excluding the caller.
async fn colleagues_of(pool: &MySqlPool, user: &User) -> Result<Vec<User>, sqlx::Error> {
    let Some(department) = user.department.as_deref() else {
        return Ok(Vec::new());
    };
    Ok(User::active_in_department(pool, department)
        .await?
        .into_iter()
        .filter(|c| c.id != user.id)
        .collect())
}

/// Suggest low-conflict leave dates
#[utoipa::path(
    get,
    path = "/api/v1/ai/suggest-dates",
    params(SuggestDatesQuery),
    responses(
        (status = 200, description = "Up to five weekly windows, least conflicting first", body = DateSuggestions),
        (status = 400, description = "duration_days out of range")
    ),
    tag = "AI",
    security(("bearer_auth" = []))
)]
pub async fn suggest_dates(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<SuggestDatesQuery>,
) -> AppResult<HttpResponse> {
    if !(1..=90).contains(&query.duration_days) {
        return Err(AppError::bad_request("duration_days must be between 1 and 90"));
    }
    let user = auth.load(pool.get_ref()).await?;
    let today = Local::now().date_naive();

    let colleagues = colleagues_of(pool.get_ref(), &user).await?;
    let ids: Vec<u64> = colleagues.iter().map(|c| c.id).collect();
    let leaves = leave_service::leaves_overlapping(
        pool.get_ref(),
        &ids,
        &[LeaveStatus::Approved],
        today,
        today + Duration::days(SEARCH_WINDOW_DAYS + query.duration_days),
    )
    .await?;

    Ok(HttpResponse::Ok().json(DateSuggestions {
        suggestions: team::suggest_dates(&leaves, query.duration_days, today),
    }))
}

/// Suggest colleagues to cover a leave
#[utoipa::path(
    get,
    path = "/api/v1/ai/responsible-person-suggestions",
    params(CoverQuery),
    responses(
        (status = 200, description = "Up to five colleagues, best cover first", body = CoverSuggestions),
        (status = 400, description = "start_date after end_date")
    ),
    tag = "AI",
    security(("bearer_auth" = []))
)]
pub async fn responsible_persons(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<CoverQuery>,
) -> AppResult<HttpResponse> {
    if query.start_date > query.end_date {
        return Err(AppError::bad_request("start_date cannot be after end_date"));
    }
    let user = auth.load(pool.get_ref()).await?;

    let colleagues = colleagues_of(pool.get_ref(), &user).await?;
    let ids: Vec<u64> = colleagues.iter().map(|c| c.id).collect();
    let busy: Vec<u64> = leave_service::leaves_overlapping(
        pool.get_ref(),
        &ids,
        &[LeaveStatus::Approved],
        query.start_date,
        query.end_date,
    )
    .await?
    .iter()
    .map(|l| l.employee_id)
    .collect();

    Ok(HttpResponse::Ok().json(CoverSuggestions {
        suggestions: team::rank_responsible_persons(&user, &colleagues, &busy, 5),
    }))
}
