use chrono::{Datelike, NaiveDate};
use derive_more::Display;
use serde::Deserialize;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use tracing::{info, warn};
use utoipa::ToSchema;

use super::analytics::{BALANCE_RECORD_SELECT, BalanceRecord};
use super::intent::{DateFilter, DateFilterKind};
use super::llm::ChatCompletion;
use super::policy_rag::{ComplianceReport, ComplianceRequest, PolicyRag, RequesterContext, load_active_chunks};
use crate::error::{AppError, AppResult};
use crate::model::leave::{LEAVE_SELECT, Leave, LeaveStatus, LeaveType, duration_days};
use crate::model::leave_balance::{BALANCE_COLUMNS, BalanceError, LeaveBalance};
use crate::model::role::Role;
use crate::model::user::User;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewLeave {
    pub leave_type: LeaveType,
    #[schema(example = "2026-03-02", format = "date", value_type = String)]
    pub start_date: NaiveDate,
    #[schema(example = "2026-03-04", format = "date", value_type = String)]
    pub end_date: NaiveDate,
    pub reason: Option<String>,
    pub responsible_person_id: Option<u64>,
}

pub async fn find_leave(pool: &MySqlPool, id: u64) -> Result<Option<Leave>, sqlx::Error> {
    sqlx::query_as::<_, Leave>(&format!("{LEAVE_SELECT} WHERE l.id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_balance(
    pool: &MySqlPool,
    employee_id: u64,
    year: i32,
    leave_type: LeaveType,
) -> Result<Option<LeaveBalance>, sqlx::Error> {
    sqlx::query_as::<_, LeaveBalance>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE employee_id = ? AND year = ? AND leave_type = ?"
    ))
    .bind(employee_id)
    .bind(year)
    .bind(leave_type.as_ref())
    .fetch_optional(pool)
    .await
}

pub async fn balances_for(
    pool: &MySqlPool,
    employee_id: u64,
    year: i32,
) -> Result<Vec<LeaveBalance>, sqlx::Error> {
    sqlx::query_as::<_, LeaveBalance>(&format!(
        "SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE employee_id = ? AND year = ? ORDER BY leave_type"
    ))
    .bind(employee_id)
    .bind(year)
    .fetch_all(pool)
    .await
}

pub async fn balances_for_employees(
    pool: &MySqlPool,
    employee_ids: &[u64],
    year: i32,
) -> Result<Vec<LeaveBalance>, sqlx::Error> {
    if employee_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<MySql>::new(format!(
        "SELECT {BALANCE_COLUMNS} FROM leave_balances WHERE year = "
    ));
    qb.push_bind(year).push(" AND employee_id IN (");
    let mut ids = qb.separated(", ");
    for id in employee_ids {
        ids.push_bind(*id);
    }
    qb.push(")");
    qb.build_query_as::<LeaveBalance>().fetch_all(pool).await
}

/// Files a PENDING leave. The balance is only checked when a row exists for the start year.
pub async fn create_leave(pool: &MySqlPool, user: &User, new: &NewLeave) -> AppResult<Leave> {
    if new.start_date > new.end_date {
        return Err(AppError::bad_request("start_date cannot be after end_date"));
    }

    let days = duration_days(new.start_date, new.end_date);
    if let Some(balance) = find_balance(pool, user.id, new.start_date.year(), new.leave_type).await? {
        if balance.available < days {
            return Err(AppError::bad_request(BalanceError::Insufficient {
                available: balance.available,
                requested: days,
            }
            .to_string()));
        }
    }

    let result = sqlx::query(
        r#"
        INSERT INTO leaves
            (employee_id, leave_type, start_date, end_date, reason, responsible_person_id, status, manager_id)
        VALUES (?, ?, ?, ?, ?, ?, 'PENDING', ?)
        "#,
    )
    .bind(user.id)
    .bind(new.leave_type.as_ref())
    .bind(new.start_date)
    .bind(new.end_date)
    .bind(new.reason.as_deref())
    .bind(new.responsible_person_id)
    .bind(user.manager_id)
    .execute(pool)
    .await?;

    let id = result.last_insert_id();
    info!(leave_id = id, employee_id = user.id, leave_type = %new.leave_type, "Leave request created");

    find_leave(pool, id)
        .await?
        .ok_or_else(|| AppError::internal("Leave vanished after insert"))
}

pub async fn list_own(pool: &MySqlPool, employee_id: u64) -> Result<Vec<Leave>, sqlx::Error> {
    sqlx::query_as::<_, Leave>(&format!(
        "{LEAVE_SELECT} WHERE l.employee_id = ? ORDER BY l.start_date DESC"
    ))
    .bind(employee_id)
    .fetch_all(pool)
    .await
}

pub async fn find_own(pool: &MySqlPool, employee_id: u64, id: u64) -> AppResult<Leave> {
    find_leave(pool, id)
        .await?
        .filter(|l| l.employee_id == employee_id)
        .ok_or_else(|| AppError::not_found("Leave not found"))
}

pub async fn cancel_leave(pool: &MySqlPool, employee_id: u64, id: u64) -> AppResult<Leave> {
    let leave = find_own(pool, employee_id, id).await?;
    if !leave.status.can_transition_to(LeaveStatus::Cancelled) {
        return Err(AppError::bad_request("Only pending leaves can be cancelled"));
    }

    let result = sqlx::query(
        "UPDATE leaves SET status = 'CANCELLED', updated_at = NOW() WHERE id = ? AND status = 'PENDING'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::bad_request("Only pending leaves can be cancelled"));
    }

    info!(leave_id = id, employee_id, "Leave cancelled");
    find_own(pool, employee_id, id).await
}

/// Days between filing and the first day off; negative for retroactive requests.
pub fn notice_days(start: NaiveDate, filed_on: NaiveDate) -> i64 {
    (start - filed_on).num_days()
}

/// Policy check for a leave of `employee`, against the active policy chunks.
pub async fn check_compliance(
    pool: &MySqlPool,
    llm: &dyn ChatCompletion,
    request: &ComplianceRequest,
    employee: &User,
) -> Result<ComplianceReport, sqlx::Error> {
    let chunks = load_active_chunks(pool).await?;
    let requester = RequesterContext {
        role: employee.role(),
        department: employee.department.clone(),
    };
    Ok(PolicyRag::new(llm, &chunks)
        .check_compliance(request, &requester)
        .await)
}

#[derive(Debug, Display)]
pub enum DecisionError {
    #[display(fmt = "Leave not found")]
    NotFound,
    #[display(fmt = "You can only approve leaves for your team members")]
    NotYourTeam,
    #[display(fmt = "Leave is already {}", "_0.as_ref().to_lowercase()")]
    AlreadyDecided(LeaveStatus),
    #[display(fmt = "Cannot approve: Policy violations detected")]
    PolicyViolations(ComplianceReport),
    #[display(fmt = "No {} balance configured for {}", _0, _1)]
    NoBalance(LeaveType, i32),
    #[display(fmt = "{}", _0)]
    Balance(BalanceError),
    #[display(fmt = "Internal Server Error")]
    Db(sqlx::Error),
}

impl std::error::Error for DecisionError {}

impl From<sqlx::Error> for DecisionError {
    fn from(e: sqlx::Error) -> Self {
        DecisionError::Db(e)
    }
}

impl From<DecisionError> for AppError {
    fn from(e: DecisionError) -> Self {
        match e {
            DecisionError::NotFound => AppError::not_found(e.to_string()),
            DecisionError::NotYourTeam => AppError::forbidden(e.to_string()),
            DecisionError::Db(db) => db.into(),
            DecisionError::PolicyViolations(ref report) => {
                AppError::bad_request(format!("{e}: {}", report.violations.join("; ")))
            }
            _ => AppError::bad_request(e.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct DecisionOutcome {
    pub leave: Leave,
    pub warnings: Vec<String>,
}

/// HR may decide any leave; a manager only those of their direct reports.
pub fn may_decide(approver: &User, employee: &User) -> bool {
    approver.role() == Role::Hr || employee.manager_id == Some(approver.id)
}

/// Approves or rejects a PENDING leave.
///
/// Approval first runs the policy gate, then debits the balance row for the leave's start
/// year inside the same transaction that flips the status, with the row locked.
pub async fn decide_leave(
    pool: &MySqlPool,
    llm: &dyn ChatCompletion,
    approver: &User,
    leave_id: u64,
    approve: bool,
    comments: Option<&str>,
) -> Result<DecisionOutcome, DecisionError> {
    let leave = find_leave(pool, leave_id).await?.ok_or(DecisionError::NotFound)?;
    let employee = User::find(pool, leave.employee_id)
        .await?
        .ok_or(DecisionError::NotFound)?;

    if !may_decide(approver, &employee) {
        return Err(DecisionError::NotYourTeam);
    }
    if leave.status != LeaveStatus::Pending {
        return Err(DecisionError::AlreadyDecided(leave.status));
    }

    let next = if approve {
        LeaveStatus::Approved
    } else {
        LeaveStatus::Rejected
    };

    let mut warnings = Vec::new();
    if approve {
        let request = ComplianceRequest {
            leave_type: leave.leave_type.to_string(),
            start_date: Some(leave.start_date),
            end_date: Some(leave.end_date),
            reason: leave.reason.clone(),
            notice_days: notice_days(leave.start_date, leave.created_at.date()),
        };
        let report = check_compliance(pool, llm, &request, &employee).await?;
        if !report.compliant {
            warn!(leave_id, violations = ?report.violations, "Approval blocked by policy");
            return Err(DecisionError::PolicyViolations(report));
        }
        warnings = report.warnings;
    }

    let mut tx = pool.begin().await?;

    if approve {
        let year = leave.start_date.year();
        let mut balance = sqlx::query_as::<_, LeaveBalance>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM leave_balances \
             WHERE employee_id = ? AND year = ? AND leave_type = ? FOR UPDATE"
        ))
        .bind(leave.employee_id)
        .bind(year)
        .bind(leave.leave_type.as_ref())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DecisionError::NoBalance(leave.leave_type, year))?;

        balance.debit(leave.duration_days()).map_err(DecisionError::Balance)?;

        sqlx::query("UPDATE leave_balances SET used = ?, available = ? WHERE id = ?")
            .bind(balance.used)
            .bind(balance.available)
            .bind(balance.id)
            .execute(&mut *tx)
            .await?;
    }

    let updated = sqlx::query(
        r#"
        UPDATE leaves
        SET status = ?, manager_comments = ?, decision_date = NOW(), updated_at = NOW()
        WHERE id = ? AND status = 'PENDING'
        "#,
    )
    .bind(next.as_ref())
    .bind(comments)
    .bind(leave_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        // Someone else decided it between our read and the update.
        tx.rollback().await?;
        let current = find_leave(pool, leave_id).await?.map_or(leave.status, |l| l.status);
        return Err(DecisionError::AlreadyDecided(current));
    }

    tx.commit().await?;
    info!(leave_id, approver = approver.id, status = %next, "Leave decided");

    let leave = find_leave(pool, leave_id).await?.ok_or(DecisionError::NotFound)?;
    Ok(DecisionOutcome { leave, warnings })
}

/// Whose leaves a requester may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Own(u64),
    /// Direct reports of the manager, plus the manager.
    Team(u64),
    All,
}

impl Scope {
    pub fn for_user(user: &User) -> Self {
        match user.role() {
            Role::Employee => Scope::Own(user.id),
            Role::Manager => Scope::Team(user.id),
            Role::Hr => Scope::All,
        }
    }

    fn push(self, qb: &mut QueryBuilder<'_, MySql>, employee_col: &str) {
        match self {
            Scope::Own(id) => {
                qb.push(format!(" AND {employee_col} = ")).push_bind(id);
            }
            Scope::Team(manager_id) => {
                qb.push(" AND (u.manager_id = ")
                    .push_bind(manager_id)
                    .push(format!(" OR {employee_col} = "))
                    .push_bind(manager_id)
                    .push(")");
            }
            Scope::All => {}
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeaveFilter {
    pub date_filter: Option<DateFilter>,
    pub status: Option<LeaveStatus>,
    pub leave_type: Option<LeaveType>,
    pub department: Option<String>,
    /// Partial, case-insensitive match on the employee's full name.
    pub employee_name: Option<String>,
}

pub async fn query_leaves(
    pool: &MySqlPool,
    scope: Scope,
    filter: &LeaveFilter,
    today: NaiveDate,
) -> Result<Vec<Leave>, sqlx::Error> {
    let mut qb = QueryBuilder::<MySql>::new(LEAVE_SELECT);
    qb.push(" WHERE 1 = 1");
    scope.push(&mut qb, "l.employee_id");

    if let Some(date_filter) = &filter.date_filter {
        match date_filter.kind {
            DateFilterKind::Today => {
                qb.push(" AND l.start_date <= ")
                    .push_bind(today)
                    .push(" AND l.end_date >= ")
                    .push_bind(today)
                    .push(" AND l.status = 'APPROVED'");
            }
            DateFilterKind::ThisMonth => {
                if let Some((first, _)) = date_filter.window(today) {
                    qb.push(" AND l.start_date >= ").push_bind(first);
                }
            }
            _ => {
                if let Some((start, end)) = date_filter.window(today) {
                    qb.push(" AND l.start_date <= ")
                        .push_bind(end)
                        .push(" AND l.end_date >= ")
                        .push_bind(start);
                }
            }
        }
    }
    if let Some(status) = filter.status {
        qb.push(" AND l.status = ").push_bind(status.to_string());
    }
    if let Some(leave_type) = filter.leave_type {
        qb.push(" AND l.leave_type = ").push_bind(leave_type.to_string());
    }
    if let Some(department) = &filter.department {
        qb.push(" AND u.department = ").push_bind(department.clone());
    }
    if let Some(name) = &filter.employee_name {
        qb.push(" AND LOWER(u.full_name) LIKE ")
            .push_bind(format!("%{}%", name.to_lowercase()));
    }
    qb.push(" ORDER BY l.start_date DESC");

    qb.build_query_as::<Leave>().fetch_all(pool).await
}

pub async fn query_balances(
    pool: &MySqlPool,
    scope: Scope,
    department: Option<&str>,
    year: i32,
) -> Result<Vec<BalanceRecord>, sqlx::Error> {
    let mut qb = QueryBuilder::<MySql>::new(BALANCE_RECORD_SELECT);
    qb.push(" WHERE b.year = ").push_bind(year);
    scope.push(&mut qb, "b.employee_id");
    if let Some(department) = department {
        qb.push(" AND u.department = ").push_bind(department.to_string());
    }
    qb.push(" ORDER BY u.full_name, b.leave_type");

    qb.build_query_as::<BalanceRecord>().fetch_all(pool).await
}

/// Most recent PENDING leave of the first employee whose name contains `name`.
pub async fn latest_pending_for(pool: &MySqlPool, name: &str) -> Result<Option<Leave>, sqlx::Error> {
    let pattern = format!("%{}%", name.to_lowercase());
    let employee_id: Option<u64> =
        sqlx::query_scalar("SELECT id FROM users WHERE LOWER(full_name) LIKE ? ORDER BY id LIMIT 1")
            .bind(&pattern)
            .fetch_optional(pool)
            .await?;
    let Some(employee_id) = employee_id else {
        return Ok(None);
    };

    sqlx::query_as::<_, Leave>(&format!(
        "{LEAVE_SELECT} WHERE l.employee_id = ? AND l.status = 'PENDING' ORDER BY l.created_at DESC LIMIT 1"
    ))
    .bind(employee_id)
    .fetch_optional(pool)
    .await
}

/// Leaves of `employee_ids` with one of `statuses` that overlap `[start, end]`.
pub async fn leaves_overlapping(
    pool: &MySqlPool,
    employee_ids: &[u64],
    statuses: &[LeaveStatus],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<Leave>, sqlx::Error> {
    if employee_ids.is_empty() || statuses.is_empty() {
        return Ok(Vec::new());
    }
    let mut qb = QueryBuilder::<MySql>::new(LEAVE_SELECT);
    qb.push(" WHERE l.employee_id IN (");
    let mut ids = qb.separated(", ");
    for id in employee_ids {
        ids.push_bind(*id);
    }
    qb.push(") AND l.status IN (");
    let mut sts = qb.separated(", ");
    for status in statuses {
        sts.push_bind(status.to_string());
    }
    qb.push(") AND l.start_date <= ")
        .push_bind(end)
        .push(" AND l.end_date >= ")
        .push_bind(start)
        .push(" ORDER BY l.start_date");

    qb.build_query_as::<Leave>().fetch_all(pool).await
}

/// Leaves of `employee_ids` that start inside `[from, to]`, any status.
pub async fn leaves_starting_between(
    pool: &MySqlPool,
    employee_ids: Option<&[u64]>,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Leave>, sqlx::Error> {
    let mut qb = QueryBuilder::<MySql>::new(LEAVE_SELECT);
    qb.push(" WHERE l.start_date >= ")
        .push_bind(from)
        .push(" AND l.start_date <= ")
        .push_bind(to);
    if let Some(ids) = employee_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        qb.push(" AND l.employee_id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        qb.push(")");
    }
    qb.push(" ORDER BY l.start_date");
    qb.build_query_as::<Leave>().fetch_all(pool).await
}

pub async fn pending_for_manager(pool: &MySqlPool, manager_id: u64) -> Result<Vec<Leave>, sqlx::Error> {
    sqlx::query_as::<_, Leave>(&format!(
        "{LEAVE_SELECT} WHERE u.manager_id = ? AND l.status = 'PENDING' ORDER BY l.start_date"
    ))
    .bind(manager_id)
    .fetch_all(pool)
    .await
}

/// Colleagues in the same department who could cover, same position first.
pub async fn cover_candidates(pool: &MySqlPool, user: &User) -> Result<Vec<User>, sqlx::Error> {
    let Some(department) = user.department.as_deref() else {
        return Ok(Vec::new());
    };
    let colleagues: Vec<User> = User::active_in_department(pool, department)
        .await?
        .into_iter()
        .filter(|c| c.id != user.id)
        .collect();

    let same_role: Vec<User> = colleagues
        .iter()
        .filter(|c| c.position.is_some() && c.position == user.position)
        .cloned()
        .collect();
    if same_role.is_empty() {
        Ok(colleagues.into_iter().take(5).collect())
    } else {
        Ok(same_role)
    }
}
