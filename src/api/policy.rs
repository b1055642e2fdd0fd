use crate::{
    auth::auth::AuthUser,
    config::Config,
    error::{AppError, AppResult},
    model::company_policy::{CompanyPolicy, EmbeddingStatus, POLICY_COLUMNS},
    services::{
        leave_service,
        llm::ChatCompletion,
        policy_processor::{FileType, PolicyProcessor, ProcessedChunk},
        policy_rag::{self, ComplianceReport, ComplianceRequest, RetrievedChunk},
    },
};
use actix_multipart::Multipart;
use actix_web::{HttpResponse, web};
use chrono::{Local, NaiveDateTime};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, MySql, MySqlPool, QueryBuilder};
use tracing::{error, info, warn};
use utoipa::{IntoParams, ToSchema};

const PREVIEW_CHARS: usize = 500;

#[derive(Debug, Deserialize, IntoParams)]
pub struct UploadQuery {
    /// Defaults to LEAVE.
    pub policy_type: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PolicyQuery {
    #[param(example = "How many days of notice do I need for annual leave?")]
    pub query: String,
    /// Defaults to 5.
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResult {
    pub message: String,
    pub policy_id: u64,
    pub version: i32,
    pub chunks_created: usize,
    pub filename: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PolicyDetails {
    pub id: u64,
    pub filename: String,
    pub policy_type: String,
    pub version: i32,
    #[schema(value_type = String, format = "date-time")]
    pub upload_date: NaiveDateTime,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub effective_date: Option<NaiveDateTime>,
    pub chunks_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct PolicyTypeCount {
    #[serde(rename = "type")]
    pub policy_type: String,
    pub count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PolicyStats {
    pub total_policies: i64,
    pub active_policies: i64,
    pub policy_types: Vec<PolicyTypeCount>,
    pub total_chunks: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PolicySearch {
    pub query: String,
    pub results: Vec<RetrievedChunk>,
}

fn accepted_file(filename: &str) -> AppResult<FileType> {
    FileType::from_filename(filename)
        .ok_or_else(|| AppError::bad_request("Unsupported file type. Allowed: pdf, docx, doc, txt"))
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn multipart_error(e: actix_multipart::MultipartError) -> AppError {
    AppError::bad_request(format!("Invalid multipart body: {e}"))
}

/// First field carrying a filename, read up to `max_bytes`.
async fn read_upload(payload: &mut Multipart, max_bytes: usize) -> AppResult<(String, Vec<u8>)> {
    while let Some(mut field) = payload.try_next().await.map_err(multipart_error)? {
        let Some(filename) = field.content_disposition().get_filename().map(str::to_string) else {
            continue;
        };
        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(multipart_error)? {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::bad_request(format!(
                    "File too large (max {}MB)",
                    max_bytes / (1024 * 1024)
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        return Ok((filename, bytes));
    }
    Err(AppError::bad_request("No file uploaded"))
}

async fn mark_failed(pool: &MySqlPool, policy_id: u64) {
    let result = sqlx::query("UPDATE company_policies SET embedding_status = ? WHERE id = ?")
        .bind(EmbeddingStatus::Failed.as_ref())
        .bind(policy_id)
        .execute(pool)
        .await;
    if let Err(e) = result {
        error!(policy_id, error = %e, "Could not mark policy as failed");
    }
}

/// Makes `policy_id` the only active policy of its type and stores its chunks.
async fn activate_with_chunks(
    pool: &MySqlPool,
    policy_id: u64,
    policy_type: &str,
    text: &str,
    chunks: &[ProcessedChunk],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE company_policies SET is_active = FALSE WHERE policy_type = ? AND is_active = TRUE")
        .bind(policy_type)
        .execute(&mut *tx)
        .await?;

    if !chunks.is_empty() {
        let mut qb = QueryBuilder::<MySql>::new(
            "INSERT INTO policy_chunks (policy_id, chunk_index, content, embedding, section_title, page_number) ",
        );
        qb.push_values(chunks, |mut row, chunk| {
            row.push_bind(policy_id)
                .push_bind(chunk.index as i32)
                .push_bind(chunk.content.clone())
                .push_bind(serde_json::to_string(&chunk.embedding).unwrap_or_else(|_| "[]".to_string()))
                .push_bind(chunk.section_title.clone())
                .push_bind(chunk.page_number);
        });
        qb.build().execute(&mut *tx).await?;
    }

    sqlx::query(
        "UPDATE company_policies SET is_active = TRUE, embedding_status = ?, extracted_text = ? WHERE id = ?",
    )
    .bind(EmbeddingStatus::Completed.as_ref())
    .bind(text)
    .bind(policy_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Re-activates an already processed policy in place of the current one of its type.
async fn switch_active(pool: &MySqlPool, policy_id: u64, policy_type: &str) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE company_policies SET is_active = FALSE WHERE policy_type = ? AND is_active = TRUE")
        .bind(policy_type)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE company_policies SET is_active = TRUE WHERE id = ?")
        .bind(policy_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

async fn find_policy(pool: &MySqlPool, id: u64) -> AppResult<CompanyPolicy> {
    sqlx::query_as::<_, CompanyPolicy>(&format!("SELECT {POLICY_COLUMNS} FROM company_policies WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("Policy not found"))
}

async fn chunk_count(pool: &MySqlPool, policy_id: u64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM policy_chunks WHERE policy_id = ?")
        .bind(policy_id)
        .fetch_one(pool)
        .await
}

/// Upload a policy document
///
/// Multipart form with one file field. The processed document becomes the only active
/// policy of its type; a document that cannot be processed is kept as FAILED and the
/// previous policy stays active.
#[utoipa::path(
    post,
    path = "/api/v1/policies/upload",
    params(UploadQuery),
    request_body(content = String, content_type = "multipart/form-data", description = "pdf, docx, doc or txt"),
    responses(
        (status = 201, description = "Policy processed and activated", body = UploadResult),
        (status = 400, description = "Unsupported type, empty or oversized file"),
        (status = 403, description = "HR only"),
        (status = 500, description = "Processing failed")
    ),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn upload_policy(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    config: web::Data<Config>,
    query: web::Query<UploadQuery>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let policy_type = query
        .policy_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("LEAVE")
        .to_uppercase();

    let (filename, bytes) = read_upload(&mut payload, config.policy_max_upload_bytes).await?;
    let file_type = accepted_file(&filename)?;
    if bytes.is_empty() {
        return Err(AppError::bad_request("Uploaded file is empty"));
    }

    let version: i64 =
        sqlx::query_scalar("SELECT CAST(COALESCE(MAX(version), 0) + 1 AS SIGNED) FROM company_policies WHERE policy_type = ?")
            .bind(&policy_type)
            .fetch_one(pool.get_ref())
            .await?;
    let version = i32::try_from(version).map_err(|_| AppError::internal("Policy version overflow"))?;

    let inserted = sqlx::query(
        "INSERT INTO company_policies (filename, file_type, upload_date, uploaded_by, is_active, version, \
         embedding_status, effective_date, policy_type) VALUES (?, ?, ?, ?, FALSE, ?, ?, ?, ?)",
    )
    .bind(&filename)
    .bind(file_type.as_ref())
    .bind(Local::now().naive_local())
    .bind(auth.user_id)
    .bind(version)
    .bind(EmbeddingStatus::Processing.as_ref())
    .bind(Local::now().naive_local())
    .bind(&policy_type)
    .execute(pool.get_ref())
    .await?;
    let policy_id = inserted.last_insert_id();

    let processed = web::block(move || {
        let processor = PolicyProcessor::default();
        let text = processor.extract_text(&bytes, file_type)?;
        if text.trim().is_empty() {
            anyhow::bail!("no text could be extracted");
        }
        let chunks = processor.chunk(&text);
        Ok::<_, anyhow::Error>((text, chunks))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e.to_string()))
    .and_then(|r| r);

    let (text, chunks) = match processed {
        Ok(done) => done,
        Err(e) => {
            warn!(policy_id, filename = %filename, error = %e, "Policy processing failed");
            mark_failed(pool.get_ref(), policy_id).await;
            return Err(AppError::internal(format!("Processing failed: {e}")));
        }
    };

    if let Err(e) = activate_with_chunks(pool.get_ref(), policy_id, &policy_type, &text, &chunks).await {
        error!(policy_id, error = %e, "Storing policy chunks failed");
        mark_failed(pool.get_ref(), policy_id).await;
        return Err(AppError::internal("Processing failed: could not store policy chunks"));
    }
    policy_rag::invalidate_active_chunks().await;

    info!(policy_id, policy_type = %policy_type, version, chunks = chunks.len(), "Policy activated");
    Ok(HttpResponse::Created().json(UploadResult {
        message: "Policy uploaded and processed successfully".to_string(),
        policy_id,
        version,
        chunks_created: chunks.len(),
        filename,
    }))
}

/// List all policies
#[utoipa::path(
    get,
    path = "/api/v1/policies",
    responses((status = 200, description = "Every uploaded policy, newest first", body = [CompanyPolicy])),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn list_policies(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let policies = sqlx::query_as::<_, CompanyPolicy>(&format!(
        "SELECT {POLICY_COLUMNS} FROM company_policies ORDER BY upload_date DESC, id DESC"
    ))
    .fetch_all(pool.get_ref())
    .await?;
    Ok(HttpResponse::Ok().json(policies))
}

/// Policy statistics
#[utoipa::path(
    get,
    path = "/api/v1/policies/stats",
    responses((status = 200, description = "Counts of policies, types and chunks", body = PolicyStats)),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn policy_stats(auth: AuthUser, pool: web::Data<MySqlPool>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let db = pool.get_ref();
    let (total_policies, active_policies): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), CAST(COALESCE(SUM(is_active), 0) AS SIGNED) FROM company_policies",
    )
    .fetch_one(db)
    .await?;
    let policy_types = sqlx::query_as::<_, PolicyTypeCount>(
        "SELECT policy_type, COUNT(*) AS count FROM company_policies GROUP BY policy_type ORDER BY policy_type",
    )
    .fetch_all(db)
    .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_chunks")
        .fetch_one(db)
        .await?;

    Ok(HttpResponse::Ok().json(PolicyStats {
        total_policies,
        active_policies,
        policy_types,
        total_chunks,
    }))
}

/// Active policy of a type
#[utoipa::path(
    get,
    path = "/api/v1/policies/active/{policy_type}",
    params(("policy_type" = String, Path, description = "e.g. LEAVE")),
    responses((status = 200, description = "The active policy, or a message when none is active", body = PolicyDetails)),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn active_policy(
    _auth: AuthUser,
    pool: web::Data<MySqlPool>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let policy_type = path.into_inner().to_uppercase();
    let policy = sqlx::query_as::<_, CompanyPolicy>(&format!(
        "SELECT {POLICY_COLUMNS} FROM company_policies WHERE policy_type = ? AND is_active = TRUE LIMIT 1"
    ))
    .bind(&policy_type)
    .fetch_optional(pool.get_ref())
    .await?;

    let Some(policy) = policy else {
        return Ok(HttpResponse::Ok().json(json!({
            "message": format!("No active {policy_type} policy found"),
            "policy": null,
        })));
    };
    let chunks_count = chunk_count(pool.get_ref(), policy.id).await?;
    Ok(HttpResponse::Ok().json(PolicyDetails {
        id: policy.id,
        filename: policy.filename,
        policy_type: policy.policy_type,
        version: policy.version,
        upload_date: policy.upload_date,
        effective_date: policy.effective_date,
        chunks_count,
        preview: None,
    }))
}

/// Active policy details with a text preview
#[utoipa::path(
    get,
    path = "/api/v1/policies/{policy_id}",
    params(("policy_id" = u64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Details and the first 500 characters", body = PolicyDetails),
        (status = 404, description = "Policy not found or not active")
    ),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn get_policy(_auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    let policy = sqlx::query_as::<_, CompanyPolicy>(&format!(
        "SELECT {POLICY_COLUMNS}, extracted_text FROM company_policies WHERE id = ? AND is_active = TRUE"
    ))
    .bind(path.into_inner())
    .fetch_optional(pool.get_ref())
    .await?
    .ok_or_else(|| AppError::not_found("Policy not found"))?;

    let chunks_count = chunk_count(pool.get_ref(), policy.id).await?;
    Ok(HttpResponse::Ok().json(PolicyDetails {
        preview: policy.extracted_text.as_deref().map(preview),
        id: policy.id,
        filename: policy.filename,
        policy_type: policy.policy_type,
        version: policy.version,
        upload_date: policy.upload_date,
        effective_date: policy.effective_date,
        chunks_count,
    }))
}

/// Delete a policy and its chunks
#[utoipa::path(
    delete,
    path = "/api/v1/policies/{policy_id}",
    params(("policy_id" = u64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Deleted", body = Object, example = json!({"message": "Policy deleted successfully"})),
        (status = 404, description = "Policy not found")
    ),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn delete_policy(auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let policy = find_policy(pool.get_ref(), path.into_inner()).await?;

    sqlx::query("DELETE FROM company_policies WHERE id = ?")
        .bind(policy.id)
        .execute(pool.get_ref())
        .await?;
    policy_rag::invalidate_active_chunks().await;

    info!(policy_id = policy.id, by = auth.user_id, "Policy deleted");
    Ok(HttpResponse::Ok().json(json!({ "message": "Policy deleted successfully" })))
}

/// Activate a policy
#[utoipa::path(
    put,
    path = "/api/v1/policies/{policy_id}/activate",
    params(("policy_id" = u64, Path, description = "Policy ID")),
    responses(
        (status = 200, description = "Activated; other policies of the type are deactivated"),
        (status = 400, description = "Policy was never processed"),
        (status = 404, description = "Policy not found")
    ),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn activate_policy(auth: AuthUser, pool: web::Data<MySqlPool>, path: web::Path<u64>) -> AppResult<HttpResponse> {
    auth.require_hr()?;
    let policy = find_policy(pool.get_ref(), path.into_inner()).await?;
    if policy.embedding_status != EmbeddingStatus::Completed {
        return Err(AppError::bad_request("Only successfully processed policies can be activated"));
    }

    switch_active(pool.get_ref(), policy.id, &policy.policy_type).await?;
    policy_rag::invalidate_active_chunks().await;

    Ok(HttpResponse::Ok().json(json!({
        "message": "Policy activated successfully",
        "policy_id": policy.id,
        "filename": policy.filename,
    })))
}

/// Search active policies
#[utoipa::path(
    post,
    path = "/api/v1/policies/query",
    params(PolicyQuery),
    responses((status = 200, description = "Most similar chunks of active policies", body = PolicySearch)),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn query_policies(
    _auth: AuthUser,
    pool: web::Data<MySqlPool>,
    query: web::Query<PolicyQuery>,
) -> AppResult<HttpResponse> {
    let text = query.query.trim();
    if text.is_empty() {
        return Err(AppError::bad_request("query must not be empty"));
    }
    let top_k = query.top_k.unwrap_or(5).clamp(1, 20);

    let chunks = policy_rag::load_active_chunks(pool.get_ref()).await?;
    Ok(HttpResponse::Ok().json(PolicySearch {
        query: text.to_string(),
        results: policy_rag::rank_chunks(&chunks, text, top_k, None),
    }))
}

/// Check a leave against the active policy
#[utoipa::path(
    post,
    path = "/api/v1/policies/check-compliance",
    request_body = ComplianceRequest,
    responses((status = 200, description = "Compliance verdict with violations, warnings and sources", body = ComplianceReport)),
    tag = "Policy",
    security(("bearer_auth" = []))
)]
pub async fn check_compliance(
    auth: AuthUser,
    pool: web::Data<MySqlPool>,
    llm: web::Data<dyn ChatCompletion>,
    payload: web::Json<ComplianceRequest>,
) -> AppResult<HttpResponse> {
    let user = auth.load(pool.get_ref()).await?;
    let mut request = payload.into_inner();
    if request.notice_days == 0 {
        if let Some(start) = request.start_date {
            request.notice_days = leave_service::notice_days(start, Local::now().date_naive());
        }
    }
    let report = leave_service::check_compliance(pool.get_ref(), llm.get_ref(), &request, &user).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_document_types_are_accepted() {
        assert_eq!(accepted_file("Leave Policy.PDF").unwrap(), FileType::Pdf);
        assert_eq!(accepted_file("handbook.docx").unwrap(), FileType::Docx);
        assert!(accepted_file("policy.xlsx").is_err());
        assert!(accepted_file("README").is_err());
    }

    #[test]
    fn preview_cuts_at_500_characters() {
        assert_eq!(preview("short"), "short");

        let long = "é".repeat(600);
        let cut = preview(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), PREVIEW_CHARS + 3);
    }

    #[test]
    fn type_counts_serialize_as_type() {
        let row = PolicyTypeCount {
            policy_type: "LEAVE".to_string(),
            count: 2,
        };
        assert_eq!(serde_json::to_value(&row).unwrap(), json!({"type": "LEAVE", "count": 2}));
    }

    async fn insert_policy(pool: &MySqlPool, filename: &str, policy_type: &str) -> u64 {
        sqlx::query(
            "INSERT INTO company_policies (filename, file_type, policy_type, embedding_status) VALUES (?, 'txt', ?, ?)",
        )
        .bind(filename)
        .bind(policy_type)
        .bind(EmbeddingStatus::Processing.as_ref())
        .execute(pool)
        .await
        .unwrap()
        .last_insert_id()
    }

    async fn active_ids(pool: &MySqlPool) -> Vec<u64> {
        sqlx::query_scalar("SELECT id FROM company_policies WHERE is_active = TRUE ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn one_active_policy_per_type(pool: MySqlPool) {
        let text = "LEAVE POLICY\n\nAnnual leave needs 14 days notice.";
        let chunks = PolicyProcessor::default().chunk(text);

        let handbook = insert_policy(&pool, "handbook.txt", "HR").await;
        activate_with_chunks(&pool, handbook, "HR", text, &chunks).await.unwrap();

        let first = insert_policy(&pool, "leave_v1.txt", "LEAVE").await;
        activate_with_chunks(&pool, first, "LEAVE", text, &chunks).await.unwrap();
        assert_eq!(active_ids(&pool).await, vec![handbook, first]);

        let second = insert_policy(&pool, "leave_v2.txt", "LEAVE").await;
        activate_with_chunks(&pool, second, "LEAVE", text, &chunks).await.unwrap();
        assert_eq!(active_ids(&pool).await, vec![handbook, second]);
        assert_eq!(chunk_count(&pool, second).await.unwrap(), chunks.len() as i64);
        let stored = find_policy(&pool, second).await.unwrap();
        assert_eq!(stored.embedding_status, EmbeddingStatus::Completed);

        switch_active(&pool, first, "LEAVE").await.unwrap();
        assert_eq!(active_ids(&pool).await, vec![handbook, first]);
    }
}
