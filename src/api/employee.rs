use crate::{
    auth::auth::AuthUser,
    error::AppResult,
    model::leave::Leave,
    model::leave_balance::LeaveBalance,
    services::leave_service::{self, NewLeave},
};
use actix_web::{HttpResponse, web};
use chrono::{Datelike, Local};
use serde_json::json;
use sqlx::MySqlPool;

/// Request leave
#[utoipa::path(
    post,
    path = "/api/v1/employees/leaves",
    request_body = NewLeave,
    responses(
        (status = 201, description = "Leave request created as PENDING", body = Leave),
        (status = 400, description = "Invalid dates or insufficient balance", body = Object, example = json!({
            "error": "Insufficient leave balance"
        })),
        (status = 401, description = "Unauthorized")
    ),
    tag = "Employee",
    security(("bearer_auth" = []))
)]
pub async fn create_leave(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    payload: web::Json<NewLeave>,
) -> AppResult<HttpResponse> {
    let user = auth.load(pool.get_ref()).await?;
    let leave = leave_service::create_leave(pool.get_ref(), &user, &payload).await?;
    Ok(HttpResponse::Created().json(leave))
}

/// List my leaves
#[utoipa::path(
    get,
    path = "/api/v1/employees/leaves",
    responses(
        (status = 200, description = "Own leaves, newest start date first", body = [Leave]),
        (status = 401, description = "Unauthorized")
    ),
    tag = "Employee",
    security(("bearer_auth" = []))
)]
pub async fn list_leaves(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    let leaves = leave_service::list_own(pool.get_ref(), auth.user_id).await?;
    Ok(HttpResponse::Ok().json(leaves))
}

/// Get one of my leaves
#[utoipa::path(
    get,
    path = "/api/v1/employees/leaves/{leave_id}",
    params(("leave_id" = u64, Path, description = "Leave ID")),
    responses(
        (status = 200, description = "Leave found", body = Leave),
        (status = 404, description = "Not found or not yours", body = Object, example = json!({"error": "Leave not found"}))
    ),
    tag = "Employee",
    security(("bearer_auth" = []))
)]
pub async fn get_leave(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> AppResult<HttpResponse> {
    let leave = leave_service::find_own(pool.get_ref(), auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(leave))
}

/// Cancel a pending leave
#[utoipa::path(
    put,
    path = "/api/v1/employees/leaves/{leave_id}/cancel",
    params(("leave_id" = u64, Path, description = "Leave ID")),
    responses(
        (status = 200, description = "Leave cancelled", body = Leave),
        (status = 400, description = "Leave is not pending", body = Object, example = json!({"error": "Only pending leaves can be cancelled"})),
        (status = 404, description = "Not found or not yours")
    ),
    tag = "Employee",
    security(("bearer_auth" = []))
)]
pub async fn cancel_leave(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
) -> AppResult<HttpResponse> {
    let leave = leave_service::cancel_leave(pool.get_ref(), auth.user_id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(leave))
}

/// My balances for the current year
#[utoipa::path(
    get,
    path = "/api/v1/employees/leave-balances",
    responses(
        (status = 200, description = "One row per leave type", body = [LeaveBalance]),
        (status = 401, description = "Unauthorized")
    ),
    tag = "Employee",
    security(("bearer_auth" = []))
)]
pub async fn leave_balances(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    let year = Local::now().date_naive().year();
    let balances = leave_service::balances_for(pool.get_ref(), auth.user_id, year).await?;
    Ok(HttpResponse::Ok().json(balances))
}
