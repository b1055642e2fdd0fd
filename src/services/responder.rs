use std::fmt::Write as _;
use std::time::Duration;

use tracing::debug;

use super::conversation::TurnData;
use super::intent::{Intent, ParsedIntent, Requester};
use super::llm::{ChatCompletion, ChatMessage, ChatRequest};
use super::team::ImpactLevel;
use crate::model::leave::duration_days;

const LISTED_LEAVES: usize = 5;
const LISTED_BALANCES: usize = 10;

fn system_prompt(requester: &Requester, intent: Intent) -> String {
    format!(
        "You are a helpful leave management assistant.\n\n\
         User: {} ({} - {})\n\n\
         Generate natural, conversational responses.\n\n\
         INTENT: {intent}\n\n\
         TONE GUIDELINES:\n\
         - Friendly and professional\n\
         - Clear and actionable\n\
         - REQUEST_LEAVE: confirm the details and guide the next step\n\
         - APPROVE_REJECT: state the action taken\n\
         - QUERY_LEAVES and CHECK_BALANCE: present the numbers clearly\n\
         - TEAM_STATUS and ANALYTICS: lead with the highlights\n\n\
         Keep responses to 2-3 sentences for simple queries, longer for complex data.",
        requester.full_name,
        requester.role,
        requester.position.as_deref().unwrap_or("Employee"),
    )
}

/// Phrases a handled turn. Any model failure falls back to a fixed template.
pub async fn respond(
    llm: &dyn ChatCompletion,
    parsed: &ParsedIntent,
    data: &TurnData,
    requester: &Requester,
) -> String {
    let prompt = format!(
        "PARSED DATA:\n{}\n\nRESULT DATA:\n{}\n\nGenerate a helpful response for the user:",
        serde_json::to_string_pretty(parsed).unwrap_or_default(),
        serde_json::to_string_pretty(data).unwrap_or_default(),
    );
    let request = ChatRequest::new(vec![
        ChatMessage::system(system_prompt(requester, parsed.intent)),
        ChatMessage::user(prompt),
    ])
    .temperature(0.7)
    .max_tokens(200)
    .timeout(Duration::from_secs(8));

    match llm.complete(request).await {
        Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
        Ok(_) => fallback_response(parsed, data, requester),
        Err(e) => {
            debug!(error = %e, "Response generation falls back to templates");
            fallback_response(parsed, data, requester)
        }
    }
}

pub fn fallback_response(parsed: &ParsedIntent, data: &TurnData, requester: &Requester) -> String {
    match data {
        TurnData::LeaveRequest(req) => {
            if req.needs_clarification {
                if let Some(report) = req.policy_compliance.as_ref().filter(|r| !r.compliant) {
                    return format!(
                        "This request conflicts with company policy:\n- {}\n\nPlease adjust the dates or leave type.",
                        report.violations.join("\n- ")
                    );
                }
                return parsed
                    .clarification_question
                    .clone()
                    .unwrap_or_else(|| "Please provide more details about your leave request.".to_string());
            }
            let leave = &req.leave_data;
            let (Some(start), Some(end)) = (leave.start_date, leave.end_date) else {
                return "I'm here to help you request leave. What type of leave do you need?".to_string();
            };

            let kind = leave
                .leave_type
                .map(|t| t.to_string().to_lowercase())
                .unwrap_or_else(|| "leave".to_string());
            let mut out = format!(
                "Got it! Your {kind} request for {} day(s) from {start} to {end}.\n\n",
                duration_days(start, end)
            );
            if let Some(question) = leave.clarification_question.as_deref().filter(|_| leave.end_date_assumed) {
                let _ = write!(out, "{question}\n\n");
            }
            if let Some(balance) = &req.leave_balance {
                let _ = write!(
                    out,
                    "Your balance: {}/{} days available.\n\n",
                    balance.available, balance.total
                );
            }

            match (&req.selected_responsible_person, req.suggested_responsible_persons.is_empty()) {
                (Some(name), _) => {
                    let _ = write!(out, "{name} will cover for you. Type 'submit' to finalize your leave request.");
                }
                (None, false) => {
                    out.push_str("Suggested colleagues to handle your responsibilities:\n");
                    for (i, person) in req.suggested_responsible_persons.iter().enumerate() {
                        let _ = writeln!(
                            out,
                            "{}. {} ({}) - {}",
                            i + 1,
                            person.name,
                            person.position.as_deref().unwrap_or("N/A"),
                            person.reason
                        );
                    }
                    out.push_str("\nReply with a number to select, or 'submit' to finalize your leave request.");
                }
                (None, true) => out.push_str("Type 'submit' to finalize your leave request."),
            }

            if let Some(impact) = req
                .team_impact
                .as_ref()
                .filter(|i| matches!(i.level, ImpactLevel::Medium | ImpactLevel::High))
            {
                let _ = write!(out, "\n\nNote: {}", impact.factors.join(", "));
            }
            out
        }

        TurnData::Submission(sub) => match (&sub.leave, sub.submitted) {
            (Some(leave), true) => {
                let mut out = format!(
                    "Your {} leave from {} to {} has been submitted for approval.",
                    leave.leave_type.to_string().to_lowercase(),
                    leave.start_date,
                    leave.end_date
                );
                if let Some(name) = &sub.responsible_person {
                    let _ = write!(out, " {name} will cover for you.");
                }
                out
            }
            _ => format!(
                "I couldn't submit your leave: {}",
                sub.message.as_deref().unwrap_or("unknown error")
            ),
        },

        TurnData::Approval(result) => match (&result.leave, result.success) {
            (Some(leave), true) => format!(
                "Successfully {} leave request for {} ({}).",
                result.action.as_deref().unwrap_or("processed"),
                leave.employee,
                leave.dates
            ),
            _ => {
                let mut out = result
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unable to process the approval/rejection.".to_string());
                if !result.violations.is_empty() {
                    let _ = write!(out, ":\n- {}", result.violations.join("\n- "));
                }
                out
            }
        },

        TurnData::Leaves(found) => {
            if found.count == 0 {
                return "No leaves found matching your criteria.".to_string();
            }
            let mut out = format!("Found {} leave record(s):\n\n", found.count);
            for leave in found.leaves.iter().take(LISTED_LEAVES) {
                let _ = writeln!(
                    out,
                    "- {} ({}): {} from {} to {} [{}]",
                    leave.employee_name.as_deref().unwrap_or("Unknown"),
                    leave.department.as_deref().unwrap_or("N/A"),
                    leave.leave_type,
                    leave.start_date,
                    leave.end_date,
                    leave.status
                );
            }
            if found.count > LISTED_LEAVES {
                let _ = write!(out, "\n... and {} more", found.count - LISTED_LEAVES);
            }
            out
        }

        TurnData::Balances(found) => {
            if found.balances.is_empty() {
                return "No balance information found.".to_string();
            }
            let own = found.balances.iter().all(|b| b.employee_id == requester.user_id);
            let mut out = String::new();
            if own {
                out.push_str("Your leave balance:\n\n");
                for b in &found.balances {
                    let _ = writeln!(
                        out,
                        "{}: {}/{} days available ({} used)",
                        b.leave_type, b.available, b.total_allocated, b.used
                    );
                }
            } else {
                let _ = write!(out, "Leave balances for {} record(s):\n\n", found.count);
                for b in found.balances.iter().take(LISTED_BALANCES) {
                    let _ = writeln!(
                        out,
                        "- {}: {} - {}/{} available",
                        b.employee_name, b.leave_type, b.available, b.total_allocated
                    );
                }
            }
            out
        }

        TurnData::Team(status) => {
            let mut out = format!(
                "Team Status: {}/{} available, {} on leave\n\n",
                status.available, status.total_members, status.on_leave
            );
            let away: Vec<_> = status.members.iter().filter(|m| m.on_leave_until.is_some()).collect();
            if away.is_empty() {
                out.push_str("Everyone is available!");
            } else {
                out.push_str("Currently on leave:\n");
                for member in away.iter().take(LISTED_LEAVES) {
                    let _ = writeln!(
                        out,
                        "- {} ({}) until {}",
                        member.name,
                        member.position.as_deref().unwrap_or("N/A"),
                        member.on_leave_until.map(|d| d.to_string()).unwrap_or_default()
                    );
                }
            }
            out
        }

        TurnData::Analytics(snapshot) => {
            let mut out = "Analytics Overview:\n\n".to_string();
            if !snapshot.monthly_distribution.is_empty() {
                out.push_str("Monthly distribution available. ");
            }
            if !snapshot.department_stats.is_empty() {
                let _ = write!(out, "Data for {} departments. ", snapshot.department_stats.len());
            }
            out + "Check the detailed data below."
        }

        TurnData::Message { .. } => "How can I help you with leave management today? You can request \
             leave, check balances, view team status, or ask me anything related to leaves."
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::leave::{LeaveStatus, LeaveType, sample_leave};
    use crate::model::role::Role;
    use crate::services::conversation::{
        ApprovalData, BalanceView, DecidedLeave, LeaveRequestData, LeavesData,
    };
    use crate::services::intent::{LeaveDraft, requester};
    use crate::services::llm::testing::ScriptedLlm;
    use crate::services::team::{ResponsiblePerson, impact_score};
    use chrono::NaiveDate;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, day).unwrap()
    }

    fn request_data(parsed: ParsedIntent) -> LeaveRequestData {
        LeaveRequestData {
            is_complete: parsed.is_complete,
            needs_clarification: parsed.needs_clarification,
            leave_data: parsed,
            suggested_responsible_persons: Vec::new(),
            selected_responsible_person: None,
            team_impact: None,
            leave_balance: None,
            policy_compliance: None,
            draft: LeaveDraft::default(),
        }
    }

    fn complete_request() -> ParsedIntent {
        let mut parsed = ParsedIntent::of(Intent::RequestLeave);
        parsed.leave_type = Some(LeaveType::Sick);
        parsed.start_date = Some(d(3, 2));
        parsed.end_date = Some(d(3, 4));
        parsed.is_complete = true;
        parsed
    }

    #[test]
    fn clarification_is_asked_back() {
        let mut parsed = ParsedIntent::of(Intent::RequestLeave);
        parsed.needs_clarification = true;
        parsed.clarification_question = Some("What type of leave do you need?".to_string());
        let data = TurnData::LeaveRequest(Box::new(request_data(parsed.clone())));
        assert_eq!(
            fallback_response(&parsed, &data, &requester(Role::Employee)),
            "What type of leave do you need?"
        );
    }

    #[test]
    fn complete_request_lists_cover_and_balance() {
        let parsed = complete_request();
        let mut req = request_data(parsed.clone());
        req.leave_balance = Some(BalanceView { total: 10, used: 2, available: 8 });
        req.suggested_responsible_persons = vec![ResponsiblePerson {
            id: 11,
            name: "Ravi Kumar".to_string(),
            position: Some("Backend Developer".to_string()),
            department: Some("Engineering".to_string()),
            availability: "Available".to_string(),
            score: 100,
            reason: "Same role".to_string(),
        }];
        req.team_impact = Some(impact_score(d(3, 2), d(3, 4), 2));
        let data = TurnData::LeaveRequest(Box::new(req));

        let text = fallback_response(&parsed, &data, &requester(Role::Employee));
        assert!(text.starts_with("Got it! Your sick request for 3 day(s) from 2026-03-02 to 2026-03-04."));
        assert!(text.contains("Your balance: 8/10 days available."));
        assert!(text.contains("1. Ravi Kumar (Backend Developer) - Same role"));
        assert!(text.contains("Reply with a number to select"));
        assert!(text.contains("Note: "));
    }

    #[test]
    fn approval_messages() {
        let parsed = ParsedIntent::of(Intent::ApproveReject);
        let ok = TurnData::Approval(ApprovalData {
            success: true,
            action: Some("approved".to_string()),
            leave: Some(DecidedLeave {
                id: 4,
                employee: "Ravi Kumar".to_string(),
                leave_type: "SICK".to_string(),
                dates: "2026-03-02 to 2026-03-04".to_string(),
                status: LeaveStatus::Approved,
            }),
            ..ApprovalData::default()
        });
        assert_eq!(
            fallback_response(&parsed, &ok, &requester(Role::Manager)),
            "Successfully approved leave request for Ravi Kumar (2026-03-02 to 2026-03-04)."
        );

        let blocked = TurnData::Approval(ApprovalData {
            message: Some("Cannot approve: Policy violations detected".to_string()),
            violations: vec!["Requires 14 days notice".to_string()],
            ..ApprovalData::default()
        });
        assert_eq!(
            fallback_response(&parsed, &blocked, &requester(Role::Manager)),
            "Cannot approve: Policy violations detected:\n- Requires 14 days notice"
        );
    }

    #[test]
    fn long_lists_are_cut() {
        let leaves: Vec<_> = (1..=7)
            .map(|i| sample_leave(i, 2, LeaveType::Casual, d(3, 2), d(3, 2), LeaveStatus::Pending))
            .collect();
        let data = TurnData::Leaves(LeavesData { count: leaves.len(), leaves });
        let text = fallback_response(&ParsedIntent::of(Intent::QueryLeaves), &data, &requester(Role::Hr));
        assert!(text.starts_with("Found 7 leave record(s):"));
        assert_eq!(text.matches("[PENDING]").count(), 5);
        assert!(text.ends_with("... and 2 more"));
    }

    #[actix_web::test]
    async fn model_reply_wins_when_present() {
        let llm = ScriptedLlm::new(vec![Ok("  All set, enjoy your time off!  ".to_string())]);
        let parsed = complete_request();
        let data = TurnData::LeaveRequest(Box::new(request_data(parsed.clone())));
        let text = respond(&llm, &parsed, &data, &requester(Role::Employee)).await;
        assert_eq!(text, "All set, enjoy your time off!");

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen[0].max_tokens, Some(200));
        assert!(seen[0].messages[0].content.contains("INTENT: REQUEST_LEAVE"));
    }

    #[actix_web::test]
    async fn model_failure_uses_template() {
        let llm = ScriptedLlm::failing();
        let parsed = ParsedIntent::of(Intent::General);
        let data = TurnData::Message { message: String::new() };
        let text = respond(&llm, &parsed, &data, &requester(Role::Employee)).await;
        assert!(text.starts_with("How can I help you with leave management today?"));
    }
}
