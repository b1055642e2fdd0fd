use std::collections::HashMap;

use crate::{
    auth::auth::AuthUser,
    error::{AppError, AppResult, is_duplicate_key},
    model::{
        leave::LeaveType,
        leave_balance::{BALANCE_COLUMNS, LeaveBalance, default_allocation},
        role::Role,
        user::{USER_COLUMNS, User},
    },
};
use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use strum::IntoEnumIterator;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Deserialize, ToSchema)]
pub struct RoleUpdate {
    pub role: Role,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ManagerUpdate {
    /// `null` clears the manager.
    pub manager_id: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BalanceCreate {
    pub employee_id: u64,
    #[schema(example = 2026)]
    pub year: i32,
    pub leave_type: LeaveType,
    #[schema(example = 20)]
    pub total_allocated: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BalanceUpdate {
    #[schema(example = 25)]
    pub total_allocated: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkCreate {
    #[schema(example = 2026)]
    pub year: i32,
    /// Days per leave type; missing means the default allocation for every type.
    pub leave_allocations: Option<HashMap<LeaveType, i32>>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct BalanceFilter {
    pub year: Option<i32>,
    pub employee_id: Option<u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct YearQuery {
    pub year: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BalanceSummary {
    pub employee_id: u64,
    pub employee_name: String,
    pub year: Option<i32>,
    pub balances: Vec<LeaveBalance>,
    pub total_allocated: i32,
    pub total_used: i32,
    pub total_available: i32,
}

impl BalanceSummary {
    fn of(employee: &User, year: Option<i32>, balances: Vec<LeaveBalance>) -> Self {
        Self {
            employee_id: employee.id,
            employee_name: employee.full_name.clone(),
            year,
            total_allocated: balances.iter().map(|b| b.total_allocated).sum(),
            total_used: balances.iter().map(|b| b.used).sum(),
            total_available: balances.iter().map(|b| b.available).sum(),
            balances,
        }
    }
}

async fn existing_user(pool: &MySqlPool, id: u64, what: &str) -> AppResult<User> {
    User::find(pool, id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("{what} not found")))
}

async fn find_balance(pool: &MySqlPool, id: u64) -> AppResult<LeaveBalance> {
    sqlx::query_as::<_, LeaveBalance>(&format!("SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("Leave balance not found"))
}

// ---------------- users ----------------

/// List users
#[utoipa::path(
    get,
    path = "/api/v1/hr/users",
    responses((status = 200, description = "All users", body = [User]), (status = 403, description = "HR only")),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn list_users(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let users = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY full_name"))
        .fetch_all(pool.get_ref())
        .await?;
    Ok(HttpResponse::Ok().json(users))
}

/// Get a user
#[utoipa::path(
    get,
    path = "/api/v1/hr/users/{user_id}",
    params(("user_id" = u64, Path, description = "User ID")),
    responses((status = 200, description = "User", body = User), (status = 404, description = "User not found")),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn get_user(auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let user = existing_user(pool.get_ref(), path.into_inner(), "User").await?;
    Ok(HttpResponse::Ok().json(user))
}

/// Change a user's role
#[utoipa::path(
    put,
    path = "/api/v1/hr/users/{user_id}/role",
    params(("user_id" = u64, Path, description = "User ID")),
    request_body = RoleUpdate,
    responses(
        (status = 200, description = "Role changed", body = Object, example = json!({"message": "Role updated successfully to MANAGER"})),
        (status = 404, description = "User not found")
    ),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn update_role(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    payload: web::Json<RoleUpdate>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let id = path.into_inner();
    existing_user(pool.get_ref(), id, "User").await?;

    sqlx::query("UPDATE users SET role_id = ? WHERE id = ?")
        .bind(payload.role.id())
        .bind(id)
        .execute(pool.get_ref())
        .await?;
    info!(user_id = id, role = %payload.role, by = auth.user_id, "Role changed");

    let user = existing_user(pool.get_ref(), id, "User").await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Role updated successfully to {}", payload.role),
        "user": user,
    })))
}

/// Change a user's manager
#[utoipa::path(
    put,
    path = "/api/v1/hr/users/{user_id}/manager",
    params(("user_id" = u64, Path, description = "User ID")),
    request_body = ManagerUpdate,
    responses(
        (status = 200, description = "Manager changed"),
        (status = 400, description = "Target is not a manager or HR, or is the user"),
        (status = 404, description = "User or manager not found")
    ),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn update_manager(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    payload: web::Json<ManagerUpdate>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let id = path.into_inner();
    existing_user(pool.get_ref(), id, "User").await?;

    if let Some(manager_id) = payload.manager_id {
        if manager_id == id {
            return Err(AppError::bad_request("A user cannot manage themselves"));
        }
        let manager = existing_user(pool.get_ref(), manager_id, "Manager").await?;
        if !manager.role().can_manage() {
            return Err(AppError::bad_request("Assigned user must be a Manager or HR"));
        }
    }

    sqlx::query("UPDATE users SET manager_id = ? WHERE id = ?")
        .bind(payload.manager_id)
        .bind(id)
        .execute(pool.get_ref())
        .await?;

    let user = existing_user(pool.get_ref(), id, "User").await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Manager updated successfully", "user": user })))
}

/// Activate or deactivate a user
#[utoipa::path(
    put,
    path = "/api/v1/hr/users/{user_id}/activate",
    params(("user_id" = u64, Path, description = "User ID")),
    responses(
        (status = 200, description = "Active flag toggled", body = Object, example = json!({"message": "User deactivated successfully"})),
        (status = 404, description = "User not found")
    ),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn toggle_active(auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let id = path.into_inner();
    let user = existing_user(pool.get_ref(), id, "User").await?;
    if id == auth.user_id && user.is_active {
        return Err(AppError::bad_request("You cannot deactivate your own account"));
    }

    sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
        .bind(!user.is_active)
        .bind(id)
        .execute(pool.get_ref())
        .await?;
    if user.is_active {
        // Outstanding refresh tokens die with the account.
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = ?")
            .bind(id)
            .execute(pool.get_ref())
            .await?;
    }

    let user = existing_user(pool.get_ref(), id, "User").await?;
    let state = if user.is_active { "activated" } else { "deactivated" };
    info!(user_id = id, state, "User status toggled");
    Ok(HttpResponse::Ok().json(json!({ "message": format!("User {state} successfully"), "user": user })))
}

/// List managers
#[utoipa::path(
    get,
    path = "/api/v1/hr/managers",
    responses((status = 200, description = "Active managers and HR", body = [User])),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn list_managers(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let managers = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE role_id IN (?, ?) AND is_active = TRUE ORDER BY full_name"
    ))
    .bind(Role::Manager.id())
    .bind(Role::Hr.id())
    .fetch_all(pool.get_ref())
    .await?;
    Ok(HttpResponse::Ok().json(managers))
}

// ---------------- balances ----------------

/// List balances
#[utoipa::path(
    get,
    path = "/api/v1/hr/leave-balances",
    params(BalanceFilter),
    responses((status = 200, description = "Balances matching the filters", body = [LeaveBalance])),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn list_balances(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<BalanceFilter>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE 1 = 1"));
    if let Some(year) = query.year {
        qb.push(" AND year = ").push_bind(year);
    }
    if let Some(employee_id) = query.employee_id {
        qb.push(" AND employee_id = ").push_bind(employee_id);
    }
    qb.push(" ORDER BY employee_id, year, leave_type");

    let balances = qb.build_query_as::<LeaveBalance>().fetch_all(pool.get_ref()).await?;
    Ok(HttpResponse::Ok().json(balances))
}

/// Get a balance
#[utoipa::path(
    get,
    path = "/api/v1/hr/leave-balances/{balance_id}",
    params(("balance_id" = u64, Path, description = "Balance ID")),
    responses((status = 200, description = "Balance", body = LeaveBalance), (status = 404, description = "Leave balance not found")),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn get_balance(auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    Ok(HttpResponse::Ok().json(find_balance(pool.get_ref(), path.into_inner()).await?))
}

/// Create a balance
#[utoipa::path(
    post,
    path = "/api/v1/hr/leave-balances",
    request_body = BalanceCreate,
    responses(
        (status = 201, description = "Balance created", body = LeaveBalance),
        (status = 400, description = "Negative allocation"),
        (status = 404, description = "Employee not found"),
        (status = 409, description = "Balance already exists for this employee, year and type")
    ),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn create_balance(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    payload: web::Json<BalanceCreate>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    existing_user(pool.get_ref(), payload.employee_id, "Employee").await?;
    let balance = LeaveBalance::new(payload.employee_id, payload.year, payload.leave_type, payload.total_allocated)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let result = sqlx::query(
        "INSERT INTO leave_balances (employee_id, year, leave_type, total_allocated, used, available) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(balance.employee_id)
    .bind(balance.year)
    .bind(balance.leave_type.as_ref())
    .bind(balance.total_allocated)
    .bind(balance.used)
    .bind(balance.available)
    .execute(pool.get_ref())
    .await;

    let id = match result {
        Ok(done) => done.last_insert_id(),
        Err(e) if is_duplicate_key(&e) => {
            return Err(AppError::conflict(
                "Leave balance already exists for this employee, year, and leave type",
            ));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(HttpResponse::Created().json(LeaveBalance { id, ..balance }))
}

/// Change an allocation
#[utoipa::path(
    put,
    path = "/api/v1/hr/leave-balances/{balance_id}",
    params(("balance_id" = u64, Path, description = "Balance ID")),
    request_body = BalanceUpdate,
    responses(
        (status = 200, description = "Allocation changed, available recomputed", body = LeaveBalance),
        (status = 400, description = "Allocation below used days"),
        (status = 404, description = "Leave balance not found")
    ),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn update_balance(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    payload: web::Json<BalanceUpdate>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let id = path.into_inner();

    let mut tx = pool.begin().await?;
    let mut balance = sqlx::query_as::<_, LeaveBalance>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE id = ? FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::not_found("Leave balance not found"))?;

    balance
        .reallocate(payload.total_allocated)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    sqlx::query("UPDATE leave_balances SET total_allocated = ?, available = ? WHERE id = ?")
        .bind(balance.total_allocated)
        .bind(balance.available)
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(HttpResponse::Ok().json(balance))
}

/// Delete a balance
#[utoipa::path(
    delete,
    path = "/api/v1/hr/leave-balances/{balance_id}",
    params(("balance_id" = u64, Path, description = "Balance ID")),
    responses((status = 204, description = "Deleted"), (status = 404, description = "Leave balance not found")),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn delete_balance(auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let result = sqlx::query("DELETE FROM leave_balances WHERE id = ?")
        .bind(path.into_inner())
        .execute(pool.get_ref())
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Leave balance not found"));
    }
    Ok(HttpResponse::NoContent().finish())
}

/// Create balances for every active user
#[utoipa::path(
    post,
    path = "/api/v1/hr/leave-balances/bulk-create",
    request_body = BulkCreate,
    responses((status = 200, description = "Counts of created and skipped rows", body = Object, example = json!({
        "message": "Bulk leave balance creation completed",
        "year": 2026,
        "employees_processed": 12,
        "balances_created": 60,
        "balances_skipped": 12
    }))),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn bulk_create(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    payload: web::Json<BulkCreate>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let allocations: Vec<(LeaveType, i32)> = match &payload.leave_allocations {
        Some(map) => map.iter().map(|(t, days)| (*t, *days)).collect(),
        None => LeaveType::iter().map(|t| (t, default_allocation(t))).collect(),
    };
    if allocations.iter().any(|(_, days)| *days < 0) {
        return Err(AppError::bad_request("Allocation must not be negative"));
    }

    let employees = User::all_active(pool.get_ref()).await?;
    let mut created = 0u64;
    let mut skipped = 0u64;

    let mut tx = pool.begin().await?;
    for employee in &employees {
        for (leave_type, days) in &allocations {
            let done = sqlx::query(
                "INSERT IGNORE INTO leave_balances (employee_id, year, leave_type, total_allocated, used, available) \
                 VALUES (?, ?, ?, ?, 0, ?)",
            )
            .bind(employee.id)
            .bind(payload.year)
            .bind(leave_type.as_ref())
            .bind(*days)
            .bind(*days)
            .execute(&mut *tx)
            .await?;
            if done.rows_affected() == 0 {
                skipped += 1;
            } else {
                created += 1;
            }
        }
    }
    tx.commit().await?;

    info!(year = payload.year, created, skipped, "Bulk balance creation");
    Ok(HttpResponse::Ok().json(json!({
        "message": "Bulk leave balance creation completed",
        "year": payload.year,
        "employees_processed": employees.len(),
        "balances_created": created,
        "balances_skipped": skipped,
    })))
}

/// Reset an employee's year
#[utoipa::path(
    put,
    path = "/api/v1/hr/leave-balances/employee/{employee_id}/reset",
    params(("employee_id" = u64, Path, description = "Employee ID"), YearQuery),
    responses(
        (status = 200, description = "Used days set to zero"),
        (status = 400, description = "year is required"),
        (status = 404, description = "Employee or balances not found")
    ),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn reset_balances(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    query: web::Query<YearQuery>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let employee_id = path.into_inner();
    let year = query.year.ok_or_else(|| AppError::bad_request("year is required"))?;
    existing_user(pool.get_ref(), employee_id, "Employee").await?;

    let mut tx = pool.begin().await?;
    let balances = sqlx::query_as::<_, LeaveBalance>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE employee_id = ? AND year = ? FOR UPDATE"
    ))
    .bind(employee_id)
    .bind(year)
    .fetch_all(&mut *tx)
    .await?;
    if balances.is_empty() {
        return Err(AppError::not_found(format!(
            "No leave balances found for employee {employee_id} in year {year}"
        )));
    }

    for mut balance in balances.iter().cloned() {
        balance.reset();
        sqlx::query("UPDATE leave_balances SET used = ?, available = ? WHERE id = ?")
            .bind(balance.used)
            .bind(balance.available)
            .bind(balance.id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Leave balances reset successfully for employee {employee_id}"),
        "year": year,
        "balances_reset": balances.len(),
    })))
}

/// Balance summary for one employee
#[utoipa::path(
    get,
    path = "/api/v1/hr/leave-balances/employee/{employee_id}/summary",
    params(("employee_id" = u64, Path, description = "Employee ID"), YearQuery),
    responses((status = 200, description = "Balances and totals", body = BalanceSummary), (status = 404, description = "Employee not found")),
    tag = "HR",
    security(("bearer_auth" = []))
)]
pub async fn balance_summary(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<u64>,
    query: web::Query<YearQuery>,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let employee = existing_user(pool.get_ref(), path.into_inner(), "Employee").await?;

    let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE employee_id = "));
    qb.push_bind(employee.id);
    if let Some(year) = query.year {
        qb.push(" AND year = ").push_bind(year);
    }
    qb.push(" ORDER BY year, leave_type");
    let balances = qb.build_query_as::<LeaveBalance>().fetch_all(pool.get_ref()).await?;

    Ok(HttpResponse::Ok().json(BalanceSummary::of(&employee, query.year, balances)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::user::sample_user;

    #[test]
    fn summary_totals_every_row() {
        let employee = sample_user(4, "Rae Report", Role::Employee, "Ops");
        let mut sick = LeaveBalance::new(4, 2026, LeaveType::Sick, 10).unwrap();
        sick.debit(3).unwrap();
        let annual = LeaveBalance::new(4, 2026, LeaveType::Annual, 20).unwrap();

        let summary = BalanceSummary::of(&employee, Some(2026), vec![sick, annual]);
        assert_eq!(summary.employee_name, "Rae Report");
        assert_eq!(summary.total_allocated, 30);
        assert_eq!(summary.total_used, 3);
        assert_eq!(summary.total_available, 27);
    }

    #[test]
    fn bulk_payload_allocations_are_optional() {
        let payload: BulkCreate = serde_json::from_value(json!({"year": 2026})).unwrap();
        assert!(payload.leave_allocations.is_none());

        let payload: BulkCreate =
            serde_json::from_value(json!({"year": 2026, "leave_allocations": {"SICK": 12}})).unwrap();
        assert_eq!(payload.leave_allocations.unwrap()[&LeaveType::Sick], 12);
    }
}
