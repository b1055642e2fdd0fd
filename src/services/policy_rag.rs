use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use moka::future::Cache;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, MySqlPool};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::embedding::{cosine_similarity, embed};
use super::llm::{ChatCompletion, ChatMessage, ChatRequest, extract_json};
use crate::model::role::Role;

/// A chunk of an active policy with its decoded vector.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk_id: u64,
    pub policy_id: u64,
    pub policy_name: String,
    pub policy_type: String,
    pub content: String,
    pub section_title: Option<String>,
    pub page_number: Option<i32>,
    pub vector: Vec<f32>,
}

#[derive(FromRow)]
struct ActiveChunkRow {
    chunk_id: u64,
    policy_id: u64,
    policy_name: String,
    policy_type: String,
    content: String,
    embedding: String,
    section_title: Option<String>,
    page_number: Option<i32>,
}

static ACTIVE_CHUNKS: Lazy<Cache<(), Arc<Vec<IndexedChunk>>>> = Lazy::new(|| {
    Cache::builder()
        .max_capacity(1)
        .time_to_live(Duration::from_secs(600))
        .build()
});

/// Chunks of every active policy, served from memory until the next policy change.
pub async fn load_active_chunks(pool: &MySqlPool) -> Result<Arc<Vec<IndexedChunk>>, sqlx::Error> {
    if let Some(hit) = ACTIVE_CHUNKS.get(&()).await {
        return Ok(hit);
    }

    let rows = sqlx::query_as::<_, ActiveChunkRow>(
        r#"
        SELECT c.id AS chunk_id, c.policy_id, p.filename AS policy_name, p.policy_type,
               c.content, c.embedding, c.section_title, c.page_number
        FROM policy_chunks c
        JOIN company_policies p ON p.id = c.policy_id
        WHERE p.is_active = TRUE
        ORDER BY c.policy_id, c.chunk_index
        "#,
    )
    .fetch_all(pool)
    .await?;

    let chunks: Vec<IndexedChunk> = rows
        .into_iter()
        .map(|row| IndexedChunk {
            vector: serde_json::from_str(&row.embedding).unwrap_or_default(),
            chunk_id: row.chunk_id,
            policy_id: row.policy_id,
            policy_name: row.policy_name,
            policy_type: row.policy_type,
            content: row.content,
            section_title: row.section_title,
            page_number: row.page_number,
        })
        .collect();

    debug!(count = chunks.len(), "Loaded active policy chunks");
    let chunks = Arc::new(chunks);
    ACTIVE_CHUNKS.insert((), chunks.clone()).await;
    Ok(chunks)
}

pub async fn invalidate_active_chunks() {
    ACTIVE_CHUNKS.invalidate(&()).await;
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetrievedChunk {
    pub chunk_id: u64,
    pub policy_id: u64,
    pub policy_name: String,
    pub content: String,
    pub section_title: Option<String>,
    pub page_number: Option<i32>,
    pub similarity: f32,
}

/// Ranks chunks against `query` by cosine similarity, optionally restricted to one policy type.
pub fn rank_chunks(
    chunks: &[IndexedChunk],
    query: &str,
    top_k: usize,
    policy_type: Option<&str>,
) -> Vec<RetrievedChunk> {
    let query_vector = embed(query);

    let mut ranked: Vec<RetrievedChunk> = chunks
        .iter()
        .filter(|c| !c.vector.is_empty())
        .filter(|c| policy_type.is_none_or(|t| c.policy_type.eq_ignore_ascii_case(t)))
        .map(|c| RetrievedChunk {
            chunk_id: c.chunk_id,
            policy_id: c.policy_id,
            policy_name: c.policy_name.clone(),
            content: c.content.clone(),
            section_title: c.section_title.clone(),
            page_number: c.page_number,
            similarity: cosine_similarity(&query_vector, &c.vector),
        })
        .collect();

    ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    ranked.truncate(top_k);
    ranked
}

/// The leave being checked.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ComplianceRequest {
    #[schema(example = "ANNUAL")]
    pub leave_type: String,
    #[schema(example = "2026-03-02", format = "date", value_type = Option<String>)]
    pub start_date: Option<NaiveDate>,
    #[schema(example = "2026-03-06", format = "date", value_type = Option<String>)]
    pub end_date: Option<NaiveDate>,
    pub reason: Option<String>,
    #[serde(default)]
    pub notice_days: i64,
}

#[derive(Debug, Clone)]
pub struct RequesterContext {
    pub role: Role,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub relevant_policies: Vec<RetrievedChunk>,
}

impl ComplianceReport {
    pub fn clean() -> Self {
        Self {
            compliant: true,
            violations: Vec::new(),
            warnings: Vec::new(),
            relevant_policies: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Findings {
    violations: Vec<String>,
    warnings: Vec<String>,
}

pub struct PolicyRag<'a> {
    llm: &'a dyn ChatCompletion,
    chunks: &'a [IndexedChunk],
}

impl<'a> PolicyRag<'a> {
    pub fn new(llm: &'a dyn ChatCompletion, chunks: &'a [IndexedChunk]) -> Self {
        Self { llm, chunks }
    }

    pub fn retrieve(&self, query: &str, top_k: usize, policy_type: Option<&str>) -> Vec<RetrievedChunk> {
        rank_chunks(self.chunks, query, top_k, policy_type)
    }

    pub async fn check_compliance(
        &self,
        request: &ComplianceRequest,
        requester: &RequesterContext,
    ) -> ComplianceReport {
        let leave_type = request.leave_type.as_str();
        let queries = [
            format!("{leave_type} policy"),
            format!("notice period {leave_type}"),
            format!("maximum duration {leave_type}"),
            format!("approval requirements {leave_type}"),
        ];

        let mut report = ComplianceReport::clean();
        for query in &queries {
            let relevant = self.retrieve(query, 3, Some("LEAVE"));
            if relevant.is_empty() {
                continue;
            }
            let findings = self.analyze(request, &relevant, requester).await;
            if !findings.violations.is_empty() {
                report.compliant = false;
            }
            push_unique(&mut report.violations, findings.violations);
            push_unique(&mut report.warnings, findings.warnings);
        }

        report.relevant_policies = self.retrieve(&format!("{leave_type} policy overview"), 2, None);
        report
    }

    async fn analyze(
        &self,
        request: &ComplianceRequest,
        policies: &[RetrievedChunk],
        requester: &RequesterContext,
    ) -> Findings {
        let policy_context = policies
            .iter()
            .map(|p| {
                format!(
                    "Policy Section: {}\n{}",
                    p.section_title.as_deref().unwrap_or("General"),
                    p.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let fmt_date = |d: Option<NaiveDate>| d.map_or("Not provided".to_string(), |d| d.to_string());
        let prompt = format!(
            "Analyze if this leave request complies with company policy.\n\n\
             LEAVE REQUEST:\n- Type: {}\n- Start: {}\n- End: {}\n- Reason: {}\n- Notice: {} days\n\n\
             USER CONTEXT:\n- Role: {}\n- Department: {}\n\n\
             COMPANY POLICIES:\n{}\n\n\
             Return JSON with:\n{{\n  \"violations\": [\"list of policy violations\"],\n  \
             \"warnings\": [\"list of warnings\"],\n  \"compliant\": true/false\n}}",
            request.leave_type,
            fmt_date(request.start_date),
            fmt_date(request.end_date),
            request.reason.as_deref().unwrap_or("Not provided"),
            request.notice_days,
            requester.role,
            requester.department.as_deref().unwrap_or("Unknown"),
            policy_context,
        );

        let chat = ChatRequest::new(vec![
            ChatMessage::system("You are a policy compliance analyzer."),
            ChatMessage::user(prompt),
        ])
        .temperature(0.1)
        .json()
        .timeout(Duration::from_secs(10));

        match self.llm.complete(chat).await {
            Ok(reply) => match extract_json(&reply) {
                Some(value) => Findings {
                    violations: string_list(&value, "violations"),
                    warnings: string_list(&value, "warnings"),
                },
                None => {
                    warn!("Compliance reply was not JSON");
                    Findings::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "AI compliance check failed");
                Findings::default()
            }
        }
    }
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn push_unique(into: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

#[cfg(test)]
pub(crate) fn indexed(chunk_id: u64, policy_type: &str, content: &str) -> IndexedChunk {
    IndexedChunk {
        chunk_id,
        policy_id: 1,
        policy_name: "leave_policy.txt".to_string(),
        policy_type: policy_type.to_string(),
        content: content.to_string(),
        section_title: None,
        page_number: None,
        vector: embed(content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm::testing::ScriptedLlm;

    fn requester() -> RequesterContext {
        RequesterContext {
            role: Role::Employee,
            department: Some("Engineering".to_string()),
        }
    }

    fn request() -> ComplianceRequest {
        ComplianceRequest {
            leave_type: "ANNUAL".to_string(),
            start_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            end_date: NaiveDate::from_ymd_opt(2026, 3, 6),
            reason: None,
            notice_days: 3,
        }
    }

    #[test]
    fn ranking_filters_type_and_truncates() {
        let mut chunks = vec![
            indexed(1, "LEAVE", "annual leave annual leave days"),
            indexed(2, "LEAVE", "Sick leave requires a certificate after two days."),
            indexed(3, "TRAVEL", "annual leave annual leave days"),
            indexed(4, "LEAVE", "Notice of fourteen days for annual leave."),
        ];
        chunks[1].vector.clear();

        let ranked = rank_chunks(&chunks, "annual leave", 2, Some("leave"));
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|r| r.chunk_id != 2 && r.chunk_id != 3));
        assert!(ranked[0].similarity >= ranked[1].similarity);

        assert_eq!(rank_chunks(&chunks, "annual leave", 10, None).len(), 3);
    }

    #[actix_web::test]
    async fn violations_make_request_non_compliant_once() {
        let verdict = r#"{"violations":["Annual leave needs 14 days notice"],"warnings":["Peak season"],"compliant":false}"#;
        let llm = ScriptedLlm::new(vec![
            Ok(verdict.to_string()),
            Ok(verdict.to_string()),
            Ok(r#"{"violations":[],"warnings":["Peak season"]}"#.to_string()),
            Ok("not json".to_string()),
        ]);
        let chunks = vec![
            indexed(1, "LEAVE", "ANNUAL LEAVE\nNotice of fourteen days."),
            indexed(2, "LEAVE", "Manager approval is required."),
        ];

        let report = PolicyRag::new(&llm, &chunks)
            .check_compliance(&request(), &requester())
            .await;

        assert!(!report.compliant);
        assert_eq!(report.violations, vec!["Annual leave needs 14 days notice"]);
        assert_eq!(report.warnings, vec!["Peak season"]);
        assert_eq!(report.relevant_policies.len(), 2);
        assert_eq!(llm.seen.lock().unwrap().len(), 4);
        assert!(llm.seen.lock().unwrap()[0].json_mode);
    }

    #[actix_web::test]
    async fn llm_failure_counts_as_compliant() {
        let llm = ScriptedLlm::failing();
        let chunks = vec![indexed(1, "LEAVE", "Annual leave rules.")];
        let report = PolicyRag::new(&llm, &chunks)
            .check_compliance(&request(), &requester())
            .await;
        assert!(report.compliant);
        assert!(report.violations.is_empty() && report.warnings.is_empty());
    }

    #[actix_web::test]
    async fn no_policies_means_no_llm_calls() {
        let llm = ScriptedLlm::failing();
        let report = PolicyRag::new(&llm, &[])
            .check_compliance(&request(), &requester())
            .await;
        assert!(report.compliant);
        assert!(report.relevant_policies.is_empty());
        assert!(llm.seen.lock().unwrap().is_empty());
    }
}
