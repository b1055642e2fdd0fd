use crate::api::{
    ai::{CoverSuggestions, DateSuggestions},
    analytics::AnalyticsRequest,
    hr::{BalanceCreate, BalanceSummary, BalanceUpdate, BulkCreate, ManagerUpdate, RoleUpdate},
    manager::{LeaveApproval, PendingLeave},
    policy::{PolicyDetails, PolicySearch, PolicyStats, PolicyTypeCount, UploadResult},
};
use crate::model::{
    company_policy::{CompanyPolicy, EmbeddingStatus},
    leave::{Leave, LeaveStatus, LeaveType},
    leave_balance::LeaveBalance,
    role::Role,
    user::User,
};
use crate::models::{LoginReqDto, LoginResponse, RegisterReq, TokenPair};
use crate::services::{
    analytics::{
        AbsentEmployee, BurnoutIndicator, BurnoutReport, CoverageGap, CoverageReport, DepartmentComparison,
        Timeframe,
    },
    conversation::ConversationRequest,
    intent::{Intent, LeaveDraft, UiStage},
    leave_service::NewLeave,
    llm::ChatMessage,
    policy_rag::{ComplianceReport, ComplianceRequest, RetrievedChunk},
    team::{
        AvailabilityForecast, BalanceTotals, CalendarDay, CalendarEntry, CapacityLevel, CurrentLeave,
        DateSuggestion, ForecastDay, ImpactLevel, ImpactScore, InsightPeriod, InsightSummary, MemberBreakdown,
        MemberOverview, Period, ResponsiblePerson, TeamCalendar, TeamInsights, TeamOverview, TeamRisk,
        UpcomingLeave,
    },
};
use utoipa::Modify;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{OpenApi, openapi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Leave Desk API",
        version = "1.0.0",
        description = r#"
## Leave Desk

Leave management with a conversational assistant, company-policy search and HR analytics.

### 🔹 Key Features
- **Employees**: request, list and cancel leaves, see balances
- **Managers**: approve or reject team leaves, team calendar, insights and availability forecast
- **HR**: users, roles, reporting lines, leave balances, analytics
- **Conversation**: one endpoint that understands requests like *"sick leave tomorrow"*
- **Policies**: upload policy documents, search them, check a leave against them

### 🔐 Security
Every endpoint outside `/auth` needs a **JWT Bearer** access token.
Obtain one from `/auth/login`, renew it with the refresh token at `/auth/refresh`.

---
Built with **Rust**, **Actix Web**, **SQLx**, and **Utoipa**.
"#,
    ),
    paths(
        crate::auth::handlers::register,
        crate::auth::handlers::login,
        crate::auth::handlers::refresh_token,
        crate::auth::handlers::logout,
        crate::auth::handlers::me,

        crate::api::employee::create_leave,
        crate::api::employee::list_leaves,
        crate::api::employee::get_leave,
        crate::api::employee::cancel_leave,
        crate::api::employee::leave_balances,

        crate::api::manager::pending_leaves,
        crate::api::manager::approve_leave,
        crate::api::manager::team_overview,
        crate::api::manager::team_calendar,
        crate::api::manager::team_insights,
        crate::api::manager::availability_forecast,

        crate::api::hr::list_users,
        crate::api::hr::get_user,
        crate::api::hr::update_role,
        crate::api::hr::update_manager,
        crate::api::hr::toggle_active,
        crate::api::hr::list_managers,
        crate::api::hr::list_balances,
        crate::api::hr::get_balance,
        crate::api::hr::create_balance,
        crate::api::hr::update_balance,
        crate::api::hr::delete_balance,
        crate::api::hr::bulk_create,
        crate::api::hr::reset_balances,
        crate::api::hr::balance_summary,

        crate::api::ai::suggest_dates,
        crate::api::ai::responsible_persons,

        crate::api::analytics::insights,
        crate::api::analytics::department_comparison,
        crate::api::analytics::burnout_indicators,
        crate::api::analytics::coverage_gaps,

        crate::api::conversation::converse,

        crate::api::policy::upload_policy,
        crate::api::policy::list_policies,
        crate::api::policy::policy_stats,
        crate::api::policy::active_policy,
        crate::api::policy::get_policy,
        crate::api::policy::delete_policy,
        crate::api::policy::activate_policy,
        crate::api::policy::query_policies,
        crate::api::policy::check_compliance
    ),
    components(
        schemas(
            RegisterReq, LoginReqDto, TokenPair, LoginResponse,
            User, Role, Leave, LeaveType, LeaveStatus, LeaveBalance, NewLeave,
            PendingLeave, LeaveApproval, ImpactScore, ImpactLevel,
            TeamOverview, MemberOverview, CurrentLeave, UpcomingLeave, BalanceTotals,
            TeamCalendar, CalendarDay, CalendarEntry, Period,
            TeamInsights, InsightPeriod, InsightSummary, MemberBreakdown, TeamRisk,
            AvailabilityForecast, ForecastDay, CapacityLevel,
            RoleUpdate, ManagerUpdate, BalanceCreate, BalanceUpdate, BulkCreate, BalanceSummary,
            DateSuggestions, DateSuggestion, CoverSuggestions, ResponsiblePerson,
            AnalyticsRequest, Timeframe, DepartmentComparison, BurnoutReport, BurnoutIndicator,
            CoverageReport, CoverageGap, AbsentEmployee,
            ConversationRequest, ChatMessage, LeaveDraft, Intent, UiStage,
            CompanyPolicy, EmbeddingStatus, UploadResult, PolicyDetails, PolicyStats, PolicyTypeCount,
            PolicySearch, RetrievedChunk, ComplianceRequest, ComplianceReport
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Auth", description = "Registration, login and token rotation"),
        (name = "Employee", description = "Own leaves and balances"),
        (name = "Manager", description = "Team approvals, calendar and insights"),
        (name = "HR", description = "Users and leave balances"),
        (name = "AI", description = "Date and cover suggestions"),
        (name = "Analytics", description = "Organisation-wide leave analytics"),
        (name = "Conversation", description = "Natural-language assistant"),
        (name = "Policy", description = "Company policy documents and compliance"),
    )
)]
pub struct ApiDoc;

/// Registers the `bearer_auth` scheme the paths refer to.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_group() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/api/v1/conversation"));
        assert!(doc.paths.paths.contains_key("/api/v1/policies/upload"));
        assert!(doc.paths.paths.contains_key("/auth/login"));
        let schemes = &doc.components.as_ref().unwrap().security_schemes;
        assert!(schemes.contains_key("bearer_auth"));
    }
}
