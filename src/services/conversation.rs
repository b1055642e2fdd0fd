//! One turn of the unified conversation: parse, merge with the client draft, route to the
//! intent handler, then phrase the result.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use super::analytics::{AnalyticsSnapshot, BalanceRecord, snapshot};
use super::intent::{
    self, ApprovalAction, Intent, LeaveDraft, ParsedIntent, Requester, StageInputs, UiStage,
};
use super::leave_service::{self, DecisionError, LeaveFilter, NewLeave, Scope};
use super::llm::{ChatCompletion, ChatMessage};
use super::policy_rag::{ComplianceReport, ComplianceRequest};
use super::responder;
use super::team::{ImpactScore, ResponsiblePerson, TeamStatus, impact_score, rank_responsible_persons, team_status};
use crate::error::{AppError, AppResult};
use crate::model::leave::{Leave, LeaveStatus};
use crate::model::role::Role;
use crate::model::user::User;

const MAX_SUGGESTED_PERSONS: usize = 3;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConversationRequest {
    #[schema(example = "I need sick leave tomorrow")]
    pub message: String,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    /// Leave draft returned in `data.draft` by the previous turn.
    pub context: Option<LeaveDraft>,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub response: String,
    pub intent: Intent,
    pub data: TurnData,
    pub actions: Vec<String>,
    pub ui_stage: UiStage,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub total: i32,
    pub used: i32,
    pub available: i32,
}

#[derive(Debug, Serialize)]
pub struct LeaveRequestData {
    pub leave_data: ParsedIntent,
    pub suggested_responsible_persons: Vec<ResponsiblePerson>,
    pub selected_responsible_person: Option<String>,
    pub team_impact: Option<ImpactScore>,
    pub leave_balance: Option<BalanceView>,
    pub is_complete: bool,
    pub needs_clarification: bool,
    pub policy_compliance: Option<ComplianceReport>,
    pub draft: LeaveDraft,
}

#[derive(Debug, Serialize)]
pub struct SubmissionData {
    pub submitted: bool,
    pub message: Option<String>,
    pub leave: Option<Leave>,
    pub responsible_person: Option<String>,
    pub draft: LeaveDraft,
}

#[derive(Debug, Serialize)]
pub struct DecidedLeave {
    pub id: u64,
    pub employee: String,
    pub leave_type: String,
    pub dates: String,
    pub status: LeaveStatus,
}

#[derive(Debug, Default, Serialize)]
pub struct ApprovalData {
    pub success: bool,
    pub action: Option<String>,
    pub message: Option<String>,
    pub leave: Option<DecidedLeave>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl ApprovalData {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LeavesData {
    pub leaves: Vec<Leave>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct BalancesData {
    pub balances: Vec<BalanceRecord>,
    pub count: usize,
}

/// Handler result, serialized as the `data` field of the reply.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TurnData {
    LeaveRequest(Box<LeaveRequestData>),
    Submission(SubmissionData),
    Approval(ApprovalData),
    Leaves(LeavesData),
    Balances(BalancesData),
    Team(TeamStatus),
    Analytics(AnalyticsSnapshot),
    Message { message: String },
}

fn is_submit(text: &str) -> bool {
    let normalized = text.trim().trim_end_matches(['.', '!']).to_lowercase();
    matches!(
        normalized.as_str(),
        "submit" | "confirm" | "yes, submit" | "yes submit" | "submit it" | "submit leave"
    )
}

/// A bare number picks one of the persons offered in the previous turn (1-based).
fn selected_person(text: &str, draft: &LeaveDraft) -> Option<u64> {
    let n: usize = text.trim().trim_end_matches('.').parse().ok()?;
    n.checked_sub(1)
        .and_then(|i| draft.suggested_person_ids.get(i))
        .copied()
}

fn draft_as_parsed(draft: &LeaveDraft, requester: &Requester) -> ParsedIntent {
    let mut parsed = ParsedIntent::of(Intent::RequestLeave);
    parsed.leave_type = draft.leave_type;
    parsed.start_date = draft.start_date;
    parsed.end_date = draft.end_date;
    parsed.reason = draft.reason.clone();
    intent::post_process(parsed, requester)
}

fn stage_for(intent: Intent, data: &TurnData) -> UiStage {
    let inputs = match data {
        TurnData::LeaveRequest(req) => StageInputs {
            has_leave_type: req.leave_data.leave_type.is_some(),
            has_start_date: req.leave_data.start_date.is_some(),
            end_date_assumed: req.leave_data.end_date_assumed,
            policy_violations: req.policy_compliance.as_ref().is_some_and(|c| !c.compliant),
            has_suggestions: !req.suggested_responsible_persons.is_empty(),
            person_selected: req.draft.responsible_person_id.is_some(),
            submitted: false,
        },
        TurnData::Submission(sub) => StageInputs {
            has_leave_type: true,
            has_start_date: true,
            person_selected: true,
            submitted: sub.submitted,
            ..StageInputs::default()
        },
        _ => StageInputs::default(),
    };
    intent::ui_stage(intent, inputs)
}

#[instrument(skip_all, fields(user_id = user.id))]
pub async fn handle_turn(
    pool: &MySqlPool,
    llm: &dyn ChatCompletion,
    user: &User,
    request: &ConversationRequest,
    today: NaiveDate,
) -> AppResult<ConversationResponse> {
    let text = request.message.trim();
    if text.is_empty() {
        return Err(AppError::bad_request("message must not be empty"));
    }

    let requester = Requester::from_user(user);
    let draft = request.context.as_ref().filter(|d| d.is_active());

    let (parsed, data) = match draft {
        Some(draft) if is_submit(text) && draft.is_complete() => {
            let parsed = draft_as_parsed(draft, &requester);
            let data = submit_draft(pool, user, draft).await?;
            (parsed, data)
        }
        Some(draft) if selected_person(text, draft).is_some() => {
            let mut chosen = draft.clone();
            chosen.responsible_person_id = selected_person(text, draft);
            let parsed = draft_as_parsed(&chosen, &requester);
            let data = leave_request(pool, llm, user, parsed.clone(), Some(&chosen), today).await?;
            (parsed, data)
        }
        _ => route(pool, llm, user, &requester, request, draft, today).await?,
    };

    let intent = parsed.intent;
    let response = responder::respond(llm, &parsed, &data, &requester).await;
    let actions = intent::filter_actions(&parsed.suggested_actions, &requester);
    let ui_stage = stage_for(intent, &data);
    info!(intent = %intent, ?ui_stage, "Conversation turn handled");

    Ok(ConversationResponse {
        response,
        intent,
        data,
        actions,
        ui_stage,
    })
}

async fn route(
    pool: &MySqlPool,
    llm: &dyn ChatCompletion,
    user: &User,
    requester: &Requester,
    request: &ConversationRequest,
    draft: Option<&LeaveDraft>,
    today: NaiveDate,
) -> AppResult<(ParsedIntent, TurnData)> {
    let text = request.message.trim();
    let mut parsed =
        intent::parse_conversation(llm, text, &request.chat_history, requester, today).await;
    intent::merge_context(&mut parsed, text, draft, &request.chat_history, today);
    intent::apply_role_corrections(&mut parsed, requester);

    let data = match parsed.intent {
        Intent::RequestLeave => {
            let data = leave_request(pool, llm, user, parsed.clone(), draft, today).await?;
            if let TurnData::LeaveRequest(req) = &data {
                parsed = req.leave_data.clone();
            }
            data
        }
        Intent::ApproveReject if parsed.action == Some(ApprovalAction::CheckPending) => {
            let mut pending = parsed.clone();
            pending.status = Some(LeaveStatus::Pending);
            leave_query(pool, user, requester, &pending, today).await?
        }
        Intent::ApproveReject => approval(pool, llm, user, &parsed).await?,
        Intent::QueryLeaves => leave_query(pool, user, requester, &parsed, today).await?,
        Intent::CheckBalance => balance_check(pool, user, requester, &parsed, today).await?,
        Intent::TeamStatus => team(pool, user, &parsed, today).await?,
        Intent::Analytics => analytics(pool, today).await?,
        Intent::General => TurnData::Message {
            message: "I can help you with leave requests, approvals, queries, and more. What would you like to do?"
                .to_string(),
        },
    };
    Ok((parsed, data))
}

/// Assists an in-progress request: notice, policy check, cover suggestions, impact and balance.
async fn leave_request(
    pool: &MySqlPool,
    llm: &dyn ChatCompletion,
    user: &User,
    mut parsed: ParsedIntent,
    previous: Option<&LeaveDraft>,
    today: NaiveDate,
) -> AppResult<TurnData> {
    if let Some(start) = parsed.start_date {
        parsed.notice_days = Some(leave_service::notice_days(start, today));
    }

    let mut compliance = None;
    if let (true, Some(leave_type), Some(start), Some(end)) =
        (parsed.is_complete, parsed.leave_type, parsed.start_date, parsed.end_date)
    {
        let request = ComplianceRequest {
            leave_type: leave_type.to_string(),
            start_date: Some(start),
            end_date: Some(end),
            reason: parsed.reason.clone(),
            notice_days: leave_service::notice_days(start, today),
        };
        match leave_service::check_compliance(pool, llm, &request, user).await {
            Ok(report) => {
                if !report.compliant {
                    parsed.needs_clarification = true;
                    parsed.is_complete = false;
                }
                compliance = Some(report);
            }
            Err(e) => warn!(error = %e, "Policy check skipped"),
        }
    }

    let mut persons = Vec::new();
    let mut impact = None;
    if let (Some(start), Some(end)) = (parsed.start_date, parsed.end_date) {
        let candidates = leave_service::cover_candidates(pool, user).await?;
        let candidate_ids: Vec<u64> = candidates.iter().map(|c| c.id).collect();
        let busy: Vec<u64> =
            leave_service::leaves_overlapping(pool, &candidate_ids, &[LeaveStatus::Approved], start, end)
                .await?
                .into_iter()
                .map(|l| l.employee_id)
                .collect();
        persons = rank_responsible_persons(user, &candidates, &busy, candidates.len())
            .into_iter()
            .filter(|p| p.score > 0)
            .take(MAX_SUGGESTED_PERSONS)
            .collect();

        let teammates: Vec<u64> = match user.department.as_deref() {
            Some(department) => User::active_in_department(pool, department)
                .await?
                .into_iter()
                .filter(|m| m.id != user.id)
                .map(|m| m.id)
                .collect(),
            None => Vec::new(),
        };
        let mut away: Vec<u64> =
            leave_service::leaves_overlapping(pool, &teammates, &[LeaveStatus::Approved], start, end)
                .await?
                .into_iter()
                .map(|l| l.employee_id)
                .collect();
        away.sort_unstable();
        away.dedup();
        impact = Some(impact_score(start, end, away.len()));
    }

    let mut balance = None;
    if let Some(leave_type) = parsed.leave_type {
        let year = parsed.start_date.unwrap_or(today).year();
        balance = leave_service::find_balance(pool, user.id, year, leave_type)
            .await?
            .map(|b| BalanceView {
                total: b.total_allocated,
                used: b.used,
                available: b.available,
            });
    }

    let mut draft = LeaveDraft::from_parsed(&parsed, previous);
    draft.suggested_person_ids = persons.iter().map(|p| p.id).collect();

    let selected = match draft.responsible_person_id {
        Some(id) => User::find(pool, id).await?.map(|u| u.full_name),
        None => None,
    };

    Ok(TurnData::LeaveRequest(Box::new(LeaveRequestData {
        is_complete: parsed.is_complete,
        needs_clarification: parsed.needs_clarification,
        leave_data: parsed,
        suggested_responsible_persons: persons,
        selected_responsible_person: selected,
        team_impact: impact,
        leave_balance: balance,
        policy_compliance: compliance,
        draft,
    })))
}

async fn submit_draft(pool: &MySqlPool, user: &User, draft: &LeaveDraft) -> AppResult<TurnData> {
    let (Some(leave_type), Some(start_date), Some(end_date)) =
        (draft.leave_type, draft.start_date, draft.end_date)
    else {
        return Err(AppError::bad_request("Leave draft is incomplete"));
    };
    let new = NewLeave {
        leave_type,
        start_date,
        end_date,
        reason: draft.reason.clone(),
        responsible_person_id: draft.responsible_person_id,
    };

    let responsible_person = match draft.responsible_person_id {
        Some(id) => User::find(pool, id).await?.map(|u| u.full_name),
        None => None,
    };

    match leave_service::create_leave(pool, user, &new).await {
        Ok(leave) => Ok(TurnData::Submission(SubmissionData {
            submitted: true,
            message: None,
            leave: Some(leave),
            responsible_person,
            draft: LeaveDraft::default(),
        })),
        // Keep the draft so the user can fix it and try again.
        Err(AppError::BadRequest(message)) => Ok(TurnData::Submission(SubmissionData {
            submitted: false,
            message: Some(message),
            leave: None,
            responsible_person,
            draft: draft.clone(),
        })),
        Err(e) => Err(e),
    }
}

async fn approval(
    pool: &MySqlPool,
    llm: &dyn ChatCompletion,
    user: &User,
    parsed: &ParsedIntent,
) -> AppResult<TurnData> {
    let approve = match parsed.action {
        Some(ApprovalAction::Approve) => true,
        Some(ApprovalAction::Reject) => false,
        _ => {
            return Ok(TurnData::Approval(ApprovalData::failed(
                "Please say whether to approve or reject the request",
            )));
        }
    };

    let leave_id = match (parsed.leave_id, parsed.employee_name.as_deref()) {
        (Some(id), _) => Some(id),
        (None, Some(name)) => leave_service::latest_pending_for(pool, name)
            .await?
            .map(|l| l.id),
        (None, None) => None,
    };
    let Some(leave_id) = leave_id else {
        return Ok(TurnData::Approval(ApprovalData::failed(
            "Could not identify the leave request",
        )));
    };

    let outcome =
        leave_service::decide_leave(pool, llm, user, leave_id, approve, parsed.comments.as_deref()).await;
    let data = match outcome {
        Ok(outcome) => {
            let leave = outcome.leave;
            ApprovalData {
                success: true,
                action: Some(if approve { "approved" } else { "rejected" }.to_string()),
                message: None,
                leave: Some(DecidedLeave {
                    id: leave.id,
                    employee: leave.employee_name.clone().unwrap_or_default(),
                    leave_type: leave.leave_type.to_string(),
                    dates: format!("{} to {}", leave.start_date, leave.end_date),
                    status: leave.status,
                }),
                warnings: outcome.warnings,
                violations: Vec::new(),
            }
        }
        Err(DecisionError::Db(e)) => return Err(e.into()),
        Err(DecisionError::PolicyViolations(report)) => ApprovalData {
            message: Some("Cannot approve: Policy violations detected".to_string()),
            violations: report.violations,
            ..ApprovalData::default()
        },
        Err(e) => ApprovalData::failed(e.to_string()),
    };
    Ok(TurnData::Approval(data))
}

/// The department filter is HR-only; an employee name equal to the requester's own adds nothing
/// to the role scope.
fn leave_filter(parsed: &ParsedIntent, requester: &Requester) -> LeaveFilter {
    LeaveFilter {
        date_filter: parsed.date_filter.clone(),
        status: parsed.status,
        leave_type: parsed.leave_type,
        department: parsed.department.clone().filter(|_| requester.is_hr()),
        employee_name: parsed
            .employee_name
            .clone()
            .filter(|name| !name.eq_ignore_ascii_case(&requester.full_name)),
    }
}

async fn leave_query(
    pool: &MySqlPool,
    user: &User,
    requester: &Requester,
    parsed: &ParsedIntent,
    today: NaiveDate,
) -> AppResult<TurnData> {
    let filter = leave_filter(parsed, requester);
    let leaves = leave_service::query_leaves(pool, Scope::for_user(user), &filter, today).await?;
    Ok(TurnData::Leaves(LeavesData {
        count: leaves.len(),
        leaves,
    }))
}

async fn balance_check(
    pool: &MySqlPool,
    user: &User,
    requester: &Requester,
    parsed: &ParsedIntent,
    today: NaiveDate,
) -> AppResult<TurnData> {
    let department = parsed.department.as_deref().filter(|_| requester.is_hr());
    let balances =
        leave_service::query_balances(pool, Scope::for_user(user), department, today.year()).await?;
    Ok(TurnData::Balances(BalancesData {
        count: balances.len(),
        balances,
    }))
}

/// Team status is narrowed to a department only for HR.
fn team_department<'a>(parsed: &'a ParsedIntent, user: &User) -> Option<&'a str> {
    parsed.department.as_deref().filter(|_| user.role() == Role::Hr)
}

async fn team(pool: &MySqlPool, user: &User, parsed: &ParsedIntent, today: NaiveDate) -> AppResult<TurnData> {
    let members: Vec<User> = match user.role() {
        Role::Hr => User::all_active(pool)
            .await?
            .into_iter()
            .filter(|u| u.role() != Role::Hr)
            .collect(),
        _ => User::direct_reports(pool, user.id).await?,
    };
    let members: Vec<User> = match team_department(parsed, user) {
        Some(department) => members
            .into_iter()
            .filter(|m| m.department.as_deref() == Some(department))
            .collect(),
        None => members,
    };

    let ids: Vec<u64> = members.iter().map(|m| m.id).collect();
    let leaves =
        leave_service::leaves_overlapping(pool, &ids, &[LeaveStatus::Approved], today, today).await?;
    Ok(TurnData::Team(team_status(&members, &leaves, today)))
}

async fn analytics(pool: &MySqlPool, today: NaiveDate) -> AppResult<TurnData> {
    let year = today.year();
    let (Some(first), Some(last)) = (
        NaiveDate::from_ymd_opt(year, 1, 1),
        NaiveDate::from_ymd_opt(year, 12, 31),
    ) else {
        return Err(AppError::internal("Invalid calendar year"));
    };
    let leaves = leave_service::leaves_starting_between(pool, None, first, last).await?;
    Ok(TurnData::Analytics(snapshot(&leaves)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::leave::LeaveType;
    use crate::model::user::sample_user;
    use crate::services::intent::requester;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    fn draft() -> LeaveDraft {
        LeaveDraft {
            leave_type: Some(LeaveType::Casual),
            start_date: Some(d(3, 2)),
            end_date: Some(d(3, 3)),
            suggested_person_ids: vec![11, 12, 13],
            ..LeaveDraft::default()
        }
    }

    #[test]
    fn submit_words() {
        assert!(is_submit("submit"));
        assert!(is_submit("  Submit! "));
        assert!(is_submit("yes, submit"));
        assert!(!is_submit("submit a new request for friday"));
    }

    #[test]
    fn numeric_reply_picks_offered_person() {
        let draft = draft();
        assert_eq!(selected_person("2", &draft), Some(12));
        assert_eq!(selected_person(" 1. ", &draft), Some(11));
        assert_eq!(selected_person("0", &draft), None);
        assert_eq!(selected_person("4", &draft), None);
        assert_eq!(selected_person("two", &draft), None);
    }

    #[test]
    fn draft_becomes_complete_request() {
        let parsed = draft_as_parsed(&draft(), &requester(Role::Employee));
        assert_eq!(parsed.intent, Intent::RequestLeave);
        assert!(parsed.is_complete);
        assert!(!parsed.suggested_actions.is_empty());
    }

    #[test]
    fn own_name_does_not_narrow_the_query() {
        let manager = requester(Role::Manager);
        let mut parsed = ParsedIntent::of(Intent::QueryLeaves);
        parsed.employee_name = Some("jane doe".to_string());
        parsed.department = Some("Sales".to_string());
        let filter = leave_filter(&parsed, &manager);
        assert_eq!(filter.employee_name, None);
        assert_eq!(filter.department, None);

        parsed.employee_name = Some("Ali".to_string());
        let filter = leave_filter(&parsed, &requester(Role::Hr));
        assert_eq!(filter.employee_name.as_deref(), Some("Ali"));
        assert_eq!(filter.department.as_deref(), Some("Sales"));
    }

    #[test]
    fn only_hr_narrows_team_status_by_department() {
        let mut parsed = ParsedIntent::of(Intent::TeamStatus);
        parsed.department = Some("Sales".to_string());
        let manager = sample_user(2, "Mia Manager", Role::Manager, "Ops");
        let hr = sample_user(3, "Hal Hr", Role::Hr, "People");
        assert_eq!(team_department(&parsed, &manager), None);
        assert_eq!(team_department(&parsed, &hr), Some("Sales"));
    }

    #[test]
    fn stage_follows_handler_data() {
        let submitted = TurnData::Submission(SubmissionData {
            submitted: true,
            message: None,
            leave: None,
            responsible_person: None,
            draft: LeaveDraft::default(),
        });
        assert_eq!(stage_for(Intent::RequestLeave, &submitted), UiStage::Submitted);

        let leaves = TurnData::Leaves(LeavesData { leaves: Vec::new(), count: 0 });
        assert_eq!(stage_for(Intent::QueryLeaves, &leaves), UiStage::ShowResults);

        let mut parsed = draft_as_parsed(&draft(), &requester(Role::Employee));
        parsed.end_date_assumed = false;
        let request = TurnData::LeaveRequest(Box::new(LeaveRequestData {
            is_complete: true,
            needs_clarification: false,
            leave_data: parsed,
            suggested_responsible_persons: Vec::new(),
            selected_responsible_person: None,
            team_impact: None,
            leave_balance: None,
            policy_compliance: Some(ComplianceReport {
                compliant: false,
                ..ComplianceReport::clean()
            }),
            draft: draft(),
        }));
        assert_eq!(stage_for(Intent::RequestLeave, &request), UiStage::ReviewPolicy);
    }

    #[test]
    fn turn_data_serializes_flat() {
        let data = TurnData::Message {
            message: "hello".to_string(),
        };
        assert_eq!(serde_json::to_value(&data).unwrap(), serde_json::json!({"message": "hello"}));
    }
}
