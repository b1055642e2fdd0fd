use crate::{
    auth::auth::AuthUser,
    error::AppResult,
    services::{
        conversation::{self, ConversationRequest},
        llm::ChatCompletion,
    },
};
use actix_web::{HttpResponse, web};
use chrono::Local;
use serde_json::json;
use sqlx::MySqlPool;
use tracing::instrument;

/// One conversational turn
///
/// Works for every role. The previous turn's `data.draft` goes back in `context`
/// so a leave request can be built over several messages.
#[utoipa::path(
    post,
    path = "/api/v1/conversation",
    request_body = ConversationRequest,
    responses(
        (status = 200, description = "Reply, detected intent, turn data, suggested actions and UI stage", body = Object, example = json!({
            "response": "What type of leave would you like to take?",
            "intent": "REQUEST_LEAVE",
            "data": {"is_complete": false, "needs_clarification": ["leave_type"]},
            "actions": ["Choose leave type"],
            "ui_stage": "ChooseLeaveType"
        })),
        (status = 400, description = "Empty message"),
        (status = 401, description = "Missing or invalid token")
    ),
    tag = "Conversation",
    security(("bearer_auth" = []))
)]
#[instrument(skip_all, fields(user_id = auth.user_id))]
pub async fn converse(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    llm: web::Data<dyn ChatCompletion>,
    payload: web::Json<ConversationRequest>,
) -> AppResult<HttpResponse> {
    let user = auth.load(pool.get_ref()).await?;
    let today = Local::now().date_naive();
    let reply = conversation::handle_turn(pool.get_ref(), llm.get_ref(), &user, &payload, today).await?;
    Ok(HttpResponse::Ok().json(reply))
}
