use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, Duration as Days, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, EnumString};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::llm::{ChatCompletion, ChatMessage, ChatRequest, extract_json};
use crate::model::leave::{LeaveStatus, LeaveType};
use crate::model::role::Role;
use crate::model::user::User;

const HISTORY_WINDOW: usize = 5;

pub const ASK_LEAVE_TYPE: &str = "What type of leave do you need? (Sick, Casual, Annual, etc.)";
pub const ASK_START_DATE: &str = "When would you like to start your leave? (e.g., tomorrow, Oct 5)";

#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema, EnumString,
    AsRefStr, strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Intent {
    RequestLeave,
    ApproveReject,
    QueryLeaves,
    CheckBalance,
    TeamStatus,
    Analytics,
    #[default]
    General,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr,
    strum_macros::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ApprovalAction {
    Approve,
    Reject,
    CheckPending,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum DateFilterKind {
    Today,
    ThisWeek,
    ThisMonth,
    DateRange,
    SpecificDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    #[serde(rename = "type")]
    pub kind: DateFilterKind,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl DateFilter {
    pub fn of(kind: DateFilterKind) -> Self {
        Self {
            kind,
            start_date: None,
            end_date: None,
        }
    }

    /// Inclusive window the filter selects, relative to `today`.
    /// `None` means "no date restriction" (an incomplete range or specific date).
    pub fn window(&self, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        match self.kind {
            DateFilterKind::Today => Some((today, today)),
            DateFilterKind::ThisWeek => {
                let start = today - Days::days(today.weekday().num_days_from_monday() as i64);
                Some((start, start + Days::days(6)))
            }
            DateFilterKind::ThisMonth => {
                let first = today.with_day(1).unwrap_or(today);
                Some((first, NaiveDate::MAX))
            }
            DateFilterKind::DateRange => match (self.start_date, self.end_date) {
                (Some(s), Some(e)) => Some((s, e)),
                (Some(s), None) => Some((s, s)),
                _ => None,
            },
            DateFilterKind::SpecificDate => self.start_date.map(|d| (d, d)),
        }
    }
}

/// The requester, as seen by the parsing and routing rules.
#[derive(Debug, Clone)]
pub struct Requester {
    pub user_id: u64,
    pub full_name: String,
    pub role: Role,
    pub department: Option<String>,
    pub position: Option<String>,
}

impl Requester {
    pub fn from_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            full_name: user.full_name.clone(),
            role: user.role(),
            department: user.department.clone(),
            position: user.position.clone(),
        }
    }

    pub fn is_manager(&self) -> bool {
        self.role.can_manage()
    }

    pub fn is_hr(&self) -> bool {
        self.role == Role::Hr
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub intent: Intent,
    pub leave_type: Option<LeaveType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub is_complete: bool,
    pub needs_clarification: bool,
    pub clarification_question: Option<String>,
    pub missing_fields: Vec<String>,
    /// End date was defaulted to the start date and should be confirmed.
    pub end_date_assumed: bool,
    pub action: Option<ApprovalAction>,
    pub leave_id: Option<u64>,
    pub employee_name: Option<String>,
    pub comments: Option<String>,
    pub date_filter: Option<DateFilter>,
    pub department: Option<String>,
    pub status: Option<LeaveStatus>,
    pub suggested_actions: Vec<String>,
    pub notice_days: Option<i64>,
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(String::from)
}

fn date_field(value: &Value, key: &str) -> Option<NaiveDate> {
    text_field(value, key).and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn enum_field<T: FromStr>(value: &Value, key: &str) -> Option<T> {
    text_field(value, key).and_then(|s| T::from_str(&s).ok())
}

impl ParsedIntent {
    pub fn of(intent: Intent) -> Self {
        Self {
            intent,
            ..Self::default()
        }
    }

    /// Reads a model reply leniently: unknown values become `None` instead of failing.
    pub fn from_value(value: &Value) -> Self {
        let leave_id = match value.get("leave_id") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().trim_start_matches('#').parse().ok(),
            _ => None,
        };

        let date_filter = match value.get("date_filter") {
            Some(Value::String(kind)) => DateFilterKind::from_str(kind).ok().map(DateFilter::of),
            Some(obj @ Value::Object(_)) => {
                enum_field::<DateFilterKind>(obj, "type").map(|kind| DateFilter {
                    kind,
                    start_date: date_field(obj, "start_date"),
                    end_date: date_field(obj, "end_date"),
                })
            }
            _ => None,
        };

        let suggested_actions = value
            .get("suggested_actions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(_) => text_field(item, "text"),
                        _ => None,
                    })
                    .filter(|s| !s.trim().is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            intent: enum_field(value, "intent").unwrap_or_default(),
            leave_type: enum_field(value, "leave_type"),
            start_date: date_field(value, "start_date"),
            end_date: date_field(value, "end_date"),
            reason: text_field(value, "reason"),
            action: enum_field(value, "action"),
            leave_id,
            employee_name: text_field(value, "employee_name"),
            comments: text_field(value, "comments").or_else(|| text_field(value, "rejection_reason")),
            date_filter,
            department: text_field(value, "department"),
            status: enum_field(value, "status"),
            suggested_actions,
            ..Self::default()
        }
    }
}

pub fn system_prompt(requester: &Requester, today: NaiveDate) -> String {
    let name = &requester.full_name;
    let role = requester.role;
    format!(
        r#"You are an intelligent assistant for a leave management system.

USER CONTEXT:
- Role: {role}
- Department: {department}
- Position: {position}
- Is Manager: {is_manager}
- Is HR: {is_hr}
- User Name: {name}

Today's date: {today} ({weekday})

ROLE RULES:
Employees cannot approve or reject leaves, view team status or analytics. For an employee,
"pending requests", "need approval" and "awaiting approval" mean their OWN pending leaves:
answer with QUERY_LEAVES, status PENDING, employee_name "{name}".
Managers and HR can approve or reject leaves and view team data. For them the same phrases mean
leaves awaiting their decision: answer with APPROVE_REJECT and action CHECK_PENDING.
Only HR can view analytics.

INTENTS: REQUEST_LEAVE, APPROVE_REJECT, QUERY_LEAVES, CHECK_BALANCE, TEAM_STATUS, ANALYTICS, GENERAL.

REQUEST_LEAVE fields: leave_type (SICK, CASUAL, ANNUAL, MATERNITY, PATERNITY, UNPAID),
start_date and end_date (YYYY-MM-DD), reason.
APPROVE_REJECT fields: action (APPROVE, REJECT, CHECK_PENDING), leave_id, employee_name, comments.
QUERY_LEAVES fields: date_filter {{"type": TODAY | THIS_WEEK | THIS_MONTH | DATE_RANGE | SPECIFIC_DATE,
"start_date", "end_date"}}, department, employee_name, status (PENDING, APPROVED, REJECTED), leave_type.

DATES: "tomorrow" is {tomorrow}. "3 days" means three days starting tomorrow unless a start is given.
"this week" is the THIS_WEEK filter and "today" the TODAY filter.

Respond ONLY with a JSON object:
{{"intent": "QUERY_LEAVES", "leave_type": null, "start_date": null, "end_date": null, "reason": null,
"action": null, "leave_id": null, "employee_name": null, "comments": null, "date_filter": null,
"department": null, "status": null, "suggested_actions": ["Check my leaves"]}}"#,
        department = requester.department.as_deref().unwrap_or("Unknown"),
        position = requester.position.as_deref().unwrap_or("Unknown"),
        is_manager = requester.is_manager(),
        is_hr = requester.is_hr(),
        weekday = today.format("%A"),
        tomorrow = today + Days::days(1),
    )
}

/// Prompt messages: system rules, the last few history turns, then the new message.
pub fn build_messages(
    requester: &Requester,
    today: NaiveDate,
    history: &[ChatMessage],
    text: &str,
) -> Vec<ChatMessage> {
    let skip = history.len().saturating_sub(HISTORY_WINDOW);
    let mut messages = vec![ChatMessage::system(system_prompt(requester, today))];
    messages.extend(history.iter().skip(skip).cloned());
    messages.push(ChatMessage::user(text));
    messages
}

/// Parses a turn with the model, falling back to keyword rules on any failure.
pub async fn parse_conversation(
    llm: &dyn ChatCompletion,
    text: &str,
    history: &[ChatMessage],
    requester: &Requester,
    today: NaiveDate,
) -> ParsedIntent {
    let request = ChatRequest::new(build_messages(requester, today, history, text))
        .temperature(0.1)
        .json()
        .timeout(Duration::from_secs(10));

    let parsed = match llm.complete(request).await {
        Ok(reply) => match extract_json(&reply) {
            Some(value) => Some(ParsedIntent::from_value(&value)),
            None => {
                warn!("Intent reply was not a JSON object");
                None
            }
        },
        Err(e) => {
            debug!(error = %e, "Intent parsing falls back to keywords");
            None
        }
    };

    let parsed = parsed.unwrap_or_else(|| fallback_parse(text, requester, today));
    post_process(parsed, requester)
}

/// Role-aware defaults applied to every parse.
pub fn post_process(mut parsed: ParsedIntent, requester: &Requester) -> ParsedIntent {
    if matches!(parsed.intent, Intent::QueryLeaves | Intent::CheckBalance)
        && parsed.employee_name.is_none()
        && (!requester.is_manager() || parsed.status == Some(LeaveStatus::Pending))
    {
        parsed.employee_name = Some(requester.full_name.clone());
    }

    if parsed.intent == Intent::RequestLeave {
        check_completeness(&mut parsed);
    }

    if parsed.suggested_actions.is_empty() {
        parsed.suggested_actions = suggested_actions(requester, parsed.intent);
    }
    parsed
}

/// Asks for leave type, then start date; a missing end date defaults to the start date.
pub fn check_completeness(parsed: &mut ParsedIntent) {
    parsed.missing_fields.clear();
    parsed.clarification_question = None;
    parsed.needs_clarification = false;
    parsed.end_date_assumed = false;

    if let (Some(start), Some(end)) = (parsed.start_date, parsed.end_date) {
        if end < start {
            parsed.end_date = None;
        }
    }

    match (parsed.leave_type, parsed.start_date, parsed.end_date) {
        (None, _, _) => {
            parsed.missing_fields.push("leave_type".to_string());
            parsed.clarification_question = Some(ASK_LEAVE_TYPE.to_string());
            parsed.needs_clarification = true;
        }
        (Some(_), None, _) => {
            parsed.missing_fields.push("start_date".to_string());
            parsed.clarification_question = Some(ASK_START_DATE.to_string());
            parsed.needs_clarification = true;
        }
        (Some(_), Some(start), None) => {
            parsed.missing_fields.push("end_date".to_string());
            parsed.end_date = Some(start);
            parsed.end_date_assumed = true;
            parsed.clarification_question = Some(format!(
                "Your leave is set for {}. Is this just for one day?",
                start.format("%B %d")
            ));
        }
        _ => {}
    }

    parsed.is_complete =
        parsed.leave_type.is_some() && parsed.start_date.is_some() && parsed.end_date.is_some();
    if parsed.is_complete {
        parsed.needs_clarification = false;
    }
}

pub fn suggested_actions(requester: &Requester, intent: Intent) -> Vec<String> {
    let actions: &[&str] = match (requester.role, intent) {
        (Role::Employee, Intent::QueryLeaves) => &["Check my leaves", "View balance", "Request leave"],
        (Role::Employee, Intent::CheckBalance) => &["Request leave", "View my leaves"],
        (Role::Employee, Intent::RequestLeave) => &["Check balance", "View my leaves"],
        (Role::Employee, _) => &["Check my leaves", "Request leave", "View balance"],
        (Role::Hr, Intent::ApproveReject) => &["View all pending", "Process approvals", "Team status"],
        (Role::Hr, Intent::QueryLeaves) => &["Department report", "View analytics", "Pending approvals"],
        (Role::Hr, _) => &["Pending approvals", "Team status", "View analytics"],
        (Role::Manager, Intent::ApproveReject) => {
            &["View pending approvals", "Team status", "Approve all"]
        }
        (Role::Manager, Intent::QueryLeaves) => &["Team leaves", "Pending approvals", "Balance report"],
        (Role::Manager, _) => &["Pending approvals", "Team status", "View my team"],
    };
    actions.iter().map(|s| s.to_string()).collect()
}

/// Downgrades intents the requester's role may not use.
pub fn apply_role_corrections(parsed: &mut ParsedIntent, requester: &Requester) {
    match parsed.intent {
        Intent::ApproveReject if !requester.is_manager() => {
            debug!(user = %requester.full_name, "APPROVE_REJECT corrected to QUERY_LEAVES");
            parsed.intent = Intent::QueryLeaves;
            parsed.status.get_or_insert(LeaveStatus::Pending);
            parsed
                .employee_name
                .get_or_insert_with(|| requester.full_name.clone());
        }
        Intent::TeamStatus if !requester.is_manager() => parsed.intent = Intent::QueryLeaves,
        Intent::Analytics if !requester.is_hr() => parsed.intent = Intent::QueryLeaves,
        _ => {}
    }
}

/// Drops suggested actions the role cannot perform.
pub fn filter_actions(actions: &[String], requester: &Requester) -> Vec<String> {
    const APPROVAL: [&str; 3] = ["approve", "reject", "pending approval"];
    const ANALYTICS: [&str; 3] = ["analytics", "trends", "reports"];
    const TEAM: [&str; 2] = ["team", "department"];

    actions
        .iter()
        .filter(|action| {
            let lower = action.to_lowercase();
            let mentions = |words: &[&str]| words.iter().any(|w| lower.contains(w));
            if !requester.is_manager() && (mentions(&APPROVAL) || mentions(&TEAM)) {
                return false;
            }
            !(!requester.is_hr() && mentions(&ANALYTICS))
        })
        .cloned()
        .collect()
}

/// Leave fields recognised in a single message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveSlots {
    pub leave_type: Option<LeaveType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub duration_days: Option<i64>,
}

impl LeaveSlots {
    pub fn is_empty(&self) -> bool {
        *self == LeaveSlots::default()
    }

    /// A bare duration starts tomorrow.
    fn with_default_start(mut self, today: NaiveDate) -> Self {
        if let (Some(days), None) = (self.duration_days, self.start_date) {
            let start = today + Days::days(1);
            self.start_date = Some(start);
            self.end_date = span_end(start, days);
        }
        self
    }
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-' && c != '\'')
        .filter(|w| !w.is_empty())
        .collect()
}

fn has_word(words: &[&str], candidates: &[&str]) -> bool {
    words.iter().any(|w| candidates.contains(w))
}

/// Longest span a single message can ask for.
const MAX_DURATION_DAYS: i64 = 366;

/// Last day of a leave `days` long, `None` when it runs off the calendar.
fn span_end(start: NaiveDate, days: i64) -> Option<NaiveDate> {
    let extra = u64::try_from(days.checked_sub(1)?).ok()?;
    start.checked_add_days(chrono::Days::new(extra))
}

/// `N day(s)` with optional whitespace, as in "3 days" or "2day".
fn duration_in(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() && (i == 0 || !bytes[i - 1].is_ascii_digit()) {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let number = &text[start..i];
            let rest = text[i..].trim_start();
            if rest.starts_with("day") {
                return number
                    .parse()
                    .ok()
                    .filter(|n| (1..=MAX_DURATION_DAYS).contains(n));
            }
            continue;
        }
        i += 1;
    }
    None
}

pub fn extract_slots(text: &str, today: NaiveDate) -> LeaveSlots {
    let lower = text.to_lowercase();
    let tokens = words(&lower);
    let mut slots = LeaveSlots::default();

    slots.leave_type = if lower.contains("sick") || lower.contains("unwell") || has_word(&tokens, &["ill"]) {
        Some(LeaveType::Sick)
    } else if lower.contains("casual") || lower.contains("personal") {
        Some(LeaveType::Casual)
    } else if lower.contains("annual") || lower.contains("vacation") || lower.contains("holiday") {
        Some(LeaveType::Annual)
    } else if lower.contains("maternity") {
        Some(LeaveType::Maternity)
    } else if lower.contains("paternity") {
        Some(LeaveType::Paternity)
    } else if lower.contains("unpaid") {
        Some(LeaveType::Unpaid)
    } else {
        None
    };

    let explicit: Vec<NaiveDate> = tokens
        .iter()
        .filter_map(|t| NaiveDate::parse_from_str(t, "%Y-%m-%d").ok())
        .collect();

    if let Some(first) = explicit.first() {
        slots.start_date = Some(*first);
        slots.end_date = explicit.get(1).copied();
    } else if lower.contains("tomorrow") {
        let day = today + Days::days(1);
        slots.start_date = Some(day);
        slots.end_date = Some(day);
    } else if has_word(&tokens, &["today"]) {
        slots.start_date = Some(today);
        slots.end_date = Some(today);
    }

    slots.duration_days = duration_in(&lower);
    if let (Some(days), Some(start)) = (slots.duration_days, slots.start_date) {
        slots.end_date = span_end(start, days);
    }
    slots
}

fn first_number(text: &str) -> Option<u64> {
    words(text)
        .iter()
        .find_map(|w| w.trim_start_matches('#').parse::<u64>().ok())
}

/// Keyword rules used when the model is unavailable or replies with garbage.
pub fn fallback_parse(text: &str, requester: &Requester, today: NaiveDate) -> ParsedIntent {
    let lower = text.to_lowercase();
    let tokens = words(&lower);
    let mentions = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    let decision = if has_word(&tokens, &["reject", "decline"]) {
        Some(ApprovalAction::Reject)
    } else if has_word(&tokens, &["approve"]) {
        Some(ApprovalAction::Approve)
    } else {
        None
    };
    if let (Some(action), true) = (decision, requester.is_manager()) {
        if let Some(leave_id) = first_number(&lower) {
            return ParsedIntent {
                action: Some(action),
                leave_id: Some(leave_id),
                ..ParsedIntent::of(Intent::ApproveReject)
            };
        }
    }

    if mentions(&["pending", "approval", "approve", "need approval"]) {
        return ParsedIntent {
            status: Some(LeaveStatus::Pending),
            ..ParsedIntent::of(Intent::QueryLeaves)
        };
    }

    if mentions(&["balance", "days left", "remaining", "how many days"]) {
        return ParsedIntent::of(Intent::CheckBalance);
    }

    if mentions(&["team status", "team availability", "who is available", "who's available"]) {
        return ParsedIntent::of(Intent::TeamStatus);
    }

    if mentions(&["analytics", "trend", "statistics", "insight"]) {
        return ParsedIntent::of(Intent::Analytics);
    }

    let listing = mentions(&[
        "who's on leave",
        "who is on leave",
        "show",
        "list",
        "who is absent",
        "leaves",
    ]);
    let slots = extract_slots(text, today).with_default_start(today);
    let asks_for_time_off = has_word(&tokens, &["request", "apply", "take", "need", "want", "book"])
        && mentions(&["leave", "off", "day"]);
    if !listing && (slots.leave_type.is_some() || slots.duration_days.is_some() || asks_for_time_off) {
        return ParsedIntent {
            leave_type: slots.leave_type,
            start_date: slots.start_date,
            end_date: slots.end_date,
            ..ParsedIntent::of(Intent::RequestLeave)
        };
    }

    if listing {
        let date_filter = if has_word(&tokens, &["today"]) {
            Some(DateFilter::of(DateFilterKind::Today))
        } else if lower.contains("this week") {
            Some(DateFilter::of(DateFilterKind::ThisWeek))
        } else if lower.contains("this month") {
            Some(DateFilter::of(DateFilterKind::ThisMonth))
        } else {
            None
        };
        return ParsedIntent {
            date_filter,
            ..ParsedIntent::of(Intent::QueryLeaves)
        };
    }

    ParsedIntent::of(Intent::General)
}

/// Leave fields the client carries between turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct LeaveDraft {
    pub leave_type: Option<LeaveType>,
    #[schema(value_type = Option<String>, format = "date")]
    pub start_date: Option<NaiveDate>,
    #[schema(value_type = Option<String>, format = "date")]
    pub end_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub responsible_person_id: Option<u64>,
    /// Ids offered in the previous turn, in the order they were listed.
    pub suggested_person_ids: Vec<u64>,
}

impl LeaveDraft {
    pub fn is_active(&self) -> bool {
        self.leave_type.is_some() || self.start_date.is_some() || self.end_date.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.leave_type.is_some() && self.start_date.is_some() && self.end_date.is_some()
    }

    pub fn from_parsed(parsed: &ParsedIntent, previous: Option<&LeaveDraft>) -> Self {
        let carried = previous.cloned().unwrap_or_default();
        Self {
            leave_type: parsed.leave_type,
            start_date: parsed.start_date,
            end_date: parsed.end_date,
            reason: parsed.reason.clone().or(carried.reason),
            responsible_person_id: carried.responsible_person_id,
            suggested_person_ids: Vec::new(),
        }
    }
}

/// Fills leave fields this turn left empty: first from the client draft, then from
/// earlier user messages. A duration in this turn is measured from the final start date.
pub fn merge_context(
    parsed: &mut ParsedIntent,
    text: &str,
    draft: Option<&LeaveDraft>,
    history: &[ChatMessage],
    today: NaiveDate,
) {
    if parsed.intent == Intent::General && draft.is_some_and(LeaveDraft::is_active) {
        let follow_up = extract_slots(text, today);
        if !follow_up.is_empty() {
            parsed.intent = Intent::RequestLeave;
        }
    }
    if parsed.intent != Intent::RequestLeave {
        return;
    }

    let skip = history.len().saturating_sub(HISTORY_WINDOW);
    let earlier = history
        .iter()
        .skip(skip)
        .filter(|m| m.role == "user")
        .map(|m| extract_slots(&m.content, today))
        .fold(LeaveSlots::default(), |acc, s| LeaveSlots {
            leave_type: s.leave_type.or(acc.leave_type),
            start_date: s.start_date.or(acc.start_date),
            end_date: s.end_date.or(acc.end_date),
            duration_days: None,
        });

    let current = extract_slots(text, today);
    let start_now = parsed.start_date.or(current.start_date);

    parsed.leave_type = parsed
        .leave_type
        .or(current.leave_type)
        .or(draft.and_then(|d| d.leave_type))
        .or(earlier.leave_type);
    parsed.start_date = start_now
        .or(draft.and_then(|d| d.start_date))
        .or(earlier.start_date);

    match (current.duration_days, parsed.start_date) {
        // "3 days" counts from the start already agreed on.
        (Some(days), Some(start)) => parsed.end_date = span_end(start, days),
        (Some(_), None) => {
            let resolved = current.with_default_start(today);
            parsed.start_date = resolved.start_date;
            parsed.end_date = resolved.end_date;
        }
        (None, _) if parsed.end_date.is_none() => {
            parsed.end_date = current.end_date.or_else(|| {
                // An end carried over only makes sense with the carried-over start.
                if start_now.is_some() {
                    None
                } else {
                    draft.and_then(|d| d.end_date).or(earlier.end_date)
                }
            });
        }
        _ => {}
    }

    if parsed.reason.is_none() {
        parsed.reason = draft.and_then(|d| d.reason.clone());
    }
    check_completeness(parsed);
}

/// Hint telling the client which widget to show next.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum UiStage {
    ChooseLeaveType,
    ChooseStartDate,
    ConfirmEndDate,
    ReviewPolicy,
    ChooseResponsiblePerson,
    ConfirmSubmit,
    Submitted,
    ShowResults,
    Idle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StageInputs {
    pub has_leave_type: bool,
    pub has_start_date: bool,
    pub end_date_assumed: bool,
    pub policy_violations: bool,
    pub has_suggestions: bool,
    pub person_selected: bool,
    pub submitted: bool,
}

pub fn ui_stage(intent: Intent, inputs: StageInputs) -> UiStage {
    match intent {
        Intent::RequestLeave => match inputs {
            StageInputs { submitted: true, .. } => UiStage::Submitted,
            StageInputs { has_leave_type: false, .. } => UiStage::ChooseLeaveType,
            StageInputs { has_start_date: false, .. } => UiStage::ChooseStartDate,
            StageInputs { end_date_assumed: true, .. } => UiStage::ConfirmEndDate,
            StageInputs { policy_violations: true, .. } => UiStage::ReviewPolicy,
            StageInputs { has_suggestions: true, person_selected: false, .. } => {
                UiStage::ChooseResponsiblePerson
            }
            _ => UiStage::ConfirmSubmit,
        },
        Intent::General => UiStage::Idle,
        _ => UiStage::ShowResults,
    }
}

#[cfg(test)]
pub(crate) fn requester(role: Role) -> Requester {
    Requester {
        user_id: 7,
        full_name: "Jane Doe".to_string(),
        role,
        department: Some("Engineering".to_string()),
        position: Some("Backend Developer".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::testing::ScriptedLlm;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 4).unwrap() // a Wednesday
    }

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    #[test]
    fn lenient_reply_parsing() {
        let parsed = ParsedIntent::from_value(&json!({
            "intent": "request_leave",
            "leave_type": "SICK",
            "start_date": "2026-03-05",
            "end_date": "not a date",
            "leave_id": "#42",
            "employee_name": "null",
            "date_filter": "THIS_WEEK",
            "status": "WHATEVER",
            "suggested_actions": ["Check balance", {"text": "View my leaves"}, 3]
        }));
        assert_eq!(parsed.intent, Intent::RequestLeave);
        assert_eq!(parsed.leave_type, Some(LeaveType::Sick));
        assert_eq!(parsed.start_date, Some(d(3, 5)));
        assert_eq!(parsed.end_date, None);
        assert_eq!(parsed.leave_id, Some(42));
        assert_eq!(parsed.employee_name, None);
        assert_eq!(parsed.date_filter, Some(DateFilter::of(DateFilterKind::ThisWeek)));
        assert_eq!(parsed.status, None);
        assert_eq!(parsed.suggested_actions, vec!["Check balance", "View my leaves"]);

        let ranged = ParsedIntent::from_value(&json!({
            "intent": "QUERY_LEAVES",
            "date_filter": {"type": "DATE_RANGE", "start_date": "2026-03-01", "end_date": "2026-03-10"}
        }));
        let filter = ranged.date_filter.unwrap();
        assert_eq!(filter.window(today()), Some((d(3, 1), d(3, 10))));

        assert_eq!(ParsedIntent::from_value(&json!({"intent": "DANCE"})).intent, Intent::General);
    }

    #[test]
    fn date_filter_windows() {
        assert_eq!(
            DateFilter::of(DateFilterKind::ThisWeek).window(today()),
            Some((d(3, 2), d(3, 8)))
        );
        assert_eq!(
            DateFilter::of(DateFilterKind::Today).window(today()),
            Some((today(), today()))
        );
        assert_eq!(
            DateFilter::of(DateFilterKind::ThisMonth).window(today()).map(|w| w.0),
            Some(d(3, 1))
        );
        assert_eq!(DateFilter::of(DateFilterKind::SpecificDate).window(today()), None);
    }

    #[test]
    fn completeness_asks_in_order() {
        let mut parsed = ParsedIntent::of(Intent::RequestLeave);
        check_completeness(&mut parsed);
        assert_eq!(parsed.clarification_question.as_deref(), Some(ASK_LEAVE_TYPE));
        assert!(parsed.needs_clarification && !parsed.is_complete);

        parsed.leave_type = Some(LeaveType::Annual);
        check_completeness(&mut parsed);
        assert_eq!(parsed.clarification_question.as_deref(), Some(ASK_START_DATE));
        assert_eq!(parsed.missing_fields, vec!["start_date"]);

        parsed.start_date = Some(d(3, 9));
        check_completeness(&mut parsed);
        assert!(parsed.is_complete && !parsed.needs_clarification);
        assert!(parsed.end_date_assumed);
        assert_eq!(parsed.end_date, Some(d(3, 9)));
        assert_eq!(
            parsed.clarification_question.as_deref(),
            Some("Your leave is set for March 09. Is this just for one day?")
        );
    }

    #[test]
    fn end_before_start_is_reset() {
        let mut parsed = ParsedIntent {
            leave_type: Some(LeaveType::Casual),
            start_date: Some(d(3, 10)),
            end_date: Some(d(3, 8)),
            ..ParsedIntent::of(Intent::RequestLeave)
        };
        check_completeness(&mut parsed);
        assert_eq!(parsed.end_date, Some(d(3, 10)));
        assert!(parsed.end_date_assumed);
    }

    #[test]
    fn post_process_fills_name_and_actions() {
        let employee = requester(Role::Employee);
        let parsed = post_process(ParsedIntent::of(Intent::CheckBalance), &employee);
        assert_eq!(parsed.employee_name.as_deref(), Some("Jane Doe"));
        assert_eq!(parsed.suggested_actions, vec!["Request leave", "View my leaves"]);

        let manager = requester(Role::Manager);
        let parsed = post_process(ParsedIntent::of(Intent::QueryLeaves), &manager);
        assert_eq!(parsed.employee_name, None);
        let pending = post_process(
            ParsedIntent {
                status: Some(LeaveStatus::Pending),
                ..ParsedIntent::of(Intent::QueryLeaves)
            },
            &manager,
        );
        assert_eq!(pending.employee_name.as_deref(), Some("Jane Doe"));
        assert_eq!(
            pending.suggested_actions,
            vec!["Team leaves", "Pending approvals", "Balance report"]
        );
    }

    #[test]
    fn suggestions_per_role() {
        assert_eq!(
            suggested_actions(&requester(Role::Hr), Intent::ApproveReject),
            vec!["View all pending", "Process approvals", "Team status"]
        );
        assert_eq!(
            suggested_actions(&requester(Role::Manager), Intent::General),
            vec!["Pending approvals", "Team status", "View my team"]
        );
        assert_eq!(
            suggested_actions(&requester(Role::Employee), Intent::Analytics),
            vec!["Check my leaves", "Request leave", "View balance"]
        );
    }

    #[test]
    fn fallback_rules() {
        let employee = requester(Role::Employee);
        let manager = requester(Role::Manager);

        let pending = fallback_parse("What needs approval?", &employee, today());
        assert_eq!(pending.intent, Intent::QueryLeaves);
        assert_eq!(pending.status, Some(LeaveStatus::Pending));

        let approve = fallback_parse("Approve leave #12 please", &manager, today());
        assert_eq!(approve.intent, Intent::ApproveReject);
        assert_eq!(approve.action, Some(ApprovalAction::Approve));
        assert_eq!(approve.leave_id, Some(12));

        let employee_approve = fallback_parse("approve 12", &employee, today());
        assert_eq!(employee_approve.intent, Intent::QueryLeaves);

        let who = fallback_parse("Who's on leave today?", &manager, today());
        assert_eq!(who.intent, Intent::QueryLeaves);
        assert_eq!(who.date_filter, Some(DateFilter::of(DateFilterKind::Today)));

        let week = fallback_parse("show leaves this week", &manager, today());
        assert_eq!(week.date_filter, Some(DateFilter::of(DateFilterKind::ThisWeek)));

        let sick = fallback_parse("I'm feeling ill, need 2 days off", &employee, today());
        assert_eq!(sick.intent, Intent::RequestLeave);
        assert_eq!(sick.leave_type, Some(LeaveType::Sick));
        assert_eq!(sick.start_date, Some(d(3, 5)));
        assert_eq!(sick.end_date, Some(d(3, 6)));

        let will = fallback_parse("I will be there", &employee, today());
        assert_eq!(will.intent, Intent::General);

        assert_eq!(
            fallback_parse("what's my balance", &employee, today()).intent,
            Intent::CheckBalance
        );
        assert_eq!(fallback_parse("hello", &employee, today()).intent, Intent::General);
    }

    #[test]
    fn slots_from_text() {
        let slots = extract_slots("annual leave 2026-04-01 to 2026-04-03", today());
        assert_eq!(slots.leave_type, Some(LeaveType::Annual));
        assert_eq!(slots.start_date, Some(d(4, 1)));
        assert_eq!(slots.end_date, Some(d(4, 3)));

        let bare = extract_slots("3 days", today());
        assert_eq!((bare.start_date, bare.end_date), (None, None));
        let bare = bare.with_default_start(today());
        assert_eq!((bare.start_date, bare.end_date), (Some(d(3, 5)), Some(d(3, 7))));

        let slots = extract_slots("vacation tomorrow for 3days", today());
        assert_eq!(slots.start_date, Some(d(3, 5)));
        assert_eq!(slots.end_date, Some(d(3, 7)));
        assert_eq!(slots.duration_days, Some(3));

        assert!(extract_slots("hello there", today()).is_empty());
        assert_eq!(duration_in("0 days"), None);
        assert_eq!(duration_in("room 12 has 4 day passes"), Some(4));
    }

    #[test]
    fn oversized_durations_are_ignored() {
        assert_eq!(duration_in("366 days"), Some(366));
        assert_eq!(duration_in("367 days"), None);
        assert_eq!(duration_in("999999999999999999999999 days"), None);
        assert_eq!(span_end(d(3, 5), 1), Some(d(3, 5)));
        assert_eq!(span_end(NaiveDate::MAX, 2), None);

        let parsed = fallback_parse("I need 1000000000 days off", &requester(Role::Employee), today());
        assert_eq!(parsed.end_date, None);

        let draft = LeaveDraft {
            leave_type: Some(LeaveType::Annual),
            start_date: Some(d(3, 16)),
            ..LeaveDraft::default()
        };
        let mut parsed = ParsedIntent::of(Intent::RequestLeave);
        merge_context(&mut parsed, "make it 999999999999999 days", Some(&draft), &[], today());
        assert_eq!(parsed.start_date, Some(d(3, 16)));
        assert!(parsed.end_date.map_or(true, |end| end == d(3, 16)));
    }

    #[test]
    fn role_corrections() {
        let employee = requester(Role::Employee);
        let mut parsed = ParsedIntent::of(Intent::ApproveReject);
        apply_role_corrections(&mut parsed, &employee);
        assert_eq!(parsed.intent, Intent::QueryLeaves);
        assert_eq!(parsed.status, Some(LeaveStatus::Pending));
        assert_eq!(parsed.employee_name.as_deref(), Some("Jane Doe"));

        let manager = requester(Role::Manager);
        let mut analytics = ParsedIntent::of(Intent::Analytics);
        apply_role_corrections(&mut analytics, &manager);
        assert_eq!(analytics.intent, Intent::QueryLeaves);

        let mut team = ParsedIntent::of(Intent::TeamStatus);
        apply_role_corrections(&mut team, &manager);
        assert_eq!(team.intent, Intent::TeamStatus);

        let hr = requester(Role::Hr);
        let mut analytics = ParsedIntent::of(Intent::Analytics);
        apply_role_corrections(&mut analytics, &hr);
        assert_eq!(analytics.intent, Intent::Analytics);
    }

    #[test]
    fn actions_filtered_by_role() {
        let actions: Vec<String> = [
            "Approve all",
            "Team status",
            "View analytics",
            "Department reports",
            "Check my leaves",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            filter_actions(&actions, &requester(Role::Employee)),
            vec!["Check my leaves"]
        );
        assert_eq!(
            filter_actions(&actions, &requester(Role::Manager)),
            vec!["Approve all", "Team status", "Check my leaves"]
        );
        assert_eq!(filter_actions(&actions, &requester(Role::Hr)).len(), 5);
    }

    #[test]
    fn draft_and_history_fill_missing_fields() {
        let draft = LeaveDraft {
            leave_type: Some(LeaveType::Annual),
            start_date: Some(d(3, 16)),
            ..LeaveDraft::default()
        };

        // "3 days" answers the one-day confirmation and counts from the draft start.
        let mut parsed = ParsedIntent::of(Intent::General);
        merge_context(&mut parsed, "make it 3 days", Some(&draft), &[], today());
        assert_eq!(parsed.intent, Intent::RequestLeave);
        assert_eq!(parsed.leave_type, Some(LeaveType::Annual));
        assert_eq!(parsed.start_date, Some(d(3, 16)));
        assert_eq!(parsed.end_date, Some(d(3, 18)));
        assert!(parsed.is_complete && !parsed.end_date_assumed);

        // Without a draft the type comes from an earlier user message.
        let history = vec![
            ChatMessage::user("I want sick leave"),
            ChatMessage {
                role: "assistant".to_string(),
                content: ASK_START_DATE.to_string(),
            },
        ];
        let mut parsed = ParsedIntent {
            start_date: Some(d(3, 5)),
            ..ParsedIntent::of(Intent::RequestLeave)
        };
        merge_context(&mut parsed, "tomorrow", None, &history, today());
        assert_eq!(parsed.leave_type, Some(LeaveType::Sick));
        assert_eq!(parsed.end_date, Some(d(3, 5)));
        assert!(parsed.is_complete);

        // Unrelated intents are left alone.
        let mut query = ParsedIntent::of(Intent::QueryLeaves);
        merge_context(&mut query, "sick", Some(&draft), &history, today());
        assert_eq!(query.leave_type, None);
    }

    #[test]
    fn stage_table() {
        let base = StageInputs {
            has_leave_type: true,
            has_start_date: true,
            ..StageInputs::default()
        };
        assert_eq!(ui_stage(Intent::RequestLeave, StageInputs::default()), UiStage::ChooseLeaveType);
        assert_eq!(
            ui_stage(Intent::RequestLeave, StageInputs { has_start_date: false, ..base }),
            UiStage::ChooseStartDate
        );
        assert_eq!(
            ui_stage(Intent::RequestLeave, StageInputs { end_date_assumed: true, ..base }),
            UiStage::ConfirmEndDate
        );
        assert_eq!(
            ui_stage(Intent::RequestLeave, StageInputs { policy_violations: true, ..base }),
            UiStage::ReviewPolicy
        );
        assert_eq!(
            ui_stage(Intent::RequestLeave, StageInputs { has_suggestions: true, ..base }),
            UiStage::ChooseResponsiblePerson
        );
        assert_eq!(ui_stage(Intent::RequestLeave, base), UiStage::ConfirmSubmit);
        assert_eq!(
            ui_stage(Intent::RequestLeave, StageInputs { submitted: true, ..base }),
            UiStage::Submitted
        );
        assert_eq!(ui_stage(Intent::QueryLeaves, base), UiStage::ShowResults);
        assert_eq!(ui_stage(Intent::General, base), UiStage::Idle);
    }

    #[actix_web::test]
    async fn model_reply_is_used_and_history_trimmed() {
        let llm = ScriptedLlm::new(vec![Ok(
            r#"{"intent":"REQUEST_LEAVE","leave_type":"CASUAL","start_date":"2026-03-09"}"#.to_string(),
        )]);
        let history: Vec<ChatMessage> = (0..8).map(|i| ChatMessage::user(format!("m{i}"))).collect();

        let parsed = parse_conversation(&llm, "casual leave monday", &history, &requester(Role::Employee), today()).await;
        assert_eq!(parsed.intent, Intent::RequestLeave);
        assert!(parsed.is_complete);
        assert_eq!(parsed.suggested_actions, vec!["Check balance", "View my leaves"]);

        let seen = llm.seen.lock().unwrap();
        let sent = &seen[0];
        assert_eq!(sent.messages.len(), 1 + HISTORY_WINDOW + 1);
        assert_eq!(sent.messages[1].content, "m3");
        assert!(sent.json_mode);
        assert!((sent.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[actix_web::test]
    async fn failing_model_uses_keywords() {
        let llm = ScriptedLlm::failing();
        let parsed = parse_conversation(&llm, "who is absent today", &[], &requester(Role::Hr), today()).await;
        assert_eq!(parsed.intent, Intent::QueryLeaves);
        assert_eq!(parsed.date_filter, Some(DateFilter::of(DateFilterKind::Today)));
    }
}
