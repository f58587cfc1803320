use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use warden_core::actor::ActorIdentity;
use warden_core::mitigation::MitigationLevel;
use warden_core::verdict::{CalibratedCase, CalibrationDecision, FeedbackLabel};

use crate::error::MemoryError;

/// How many recent rows the Postgres backend pulls into the in-process
/// ranking pass. Similarity is computed over this window, not the full
/// history — old cases age out of retrieval naturally.
const RETRIEVAL_WINDOW: i64 = 512;

/// Retrieved cases below this score are noise, not precedent.
const MIN_SIMILARITY: f64 = 0.60;

/// Same-actor precedent outranks text similarity alone.
const SAME_ACTOR_BONUS: f64 = 0.15;

/// A retrieved case with its similarity score (higher is closer).
#[derive(Debug, Clone)]
pub struct ScoredCase {
    pub case: CalibratedCase,
    pub score: f64,
}

/// Pagination/filtering for the case-history surface.
#[derive(Debug, Clone, Default)]
pub struct CaseFilter {
    pub category: Option<String>,
    pub level: Option<MitigationLevel>,
    pub limit: i64,
    pub offset: i64,
}

/// The institutional-memory seam. Two backends: an in-memory log for tests
/// and DB-less deployments, and the durable Postgres log. Cases are
/// append-only with unique ids, so concurrent batch runs cannot corrupt
/// the store; feedback attachment is the only mutation.
#[derive(Clone)]
pub enum CaseMemory {
    Memory(InMemoryCaseMemory),
    Postgres(PgCaseMemory),
}

impl CaseMemory {
    pub fn in_memory() -> Self {
        CaseMemory::Memory(InMemoryCaseMemory::default())
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        CaseMemory::Postgres(PgCaseMemory { pool })
    }

    pub async fn insert(&self, case: &CalibratedCase) -> Result<(), MemoryError> {
        match self {
            CaseMemory::Memory(memory) => memory.insert(case).await,
            CaseMemory::Postgres(pg) => pg.insert(case).await,
        }
    }

    /// Top-k most similar past cases, optionally restricted to a category.
    pub async fn similar(
        &self,
        query: &str,
        category: Option<&str>,
        actor: Option<&ActorIdentity>,
        k: usize,
    ) -> Result<Vec<ScoredCase>, MemoryError> {
        match self {
            CaseMemory::Memory(memory) => memory.similar(query, category, actor, k).await,
            CaseMemory::Postgres(pg) => pg.similar(query, category, actor, k).await,
        }
    }

    /// Attach a feedback label, idempotently (last write wins). Returns the
    /// updated case.
    pub async fn attach_feedback(
        &self,
        id: Uuid,
        label: FeedbackLabel,
    ) -> Result<CalibratedCase, MemoryError> {
        match self {
            CaseMemory::Memory(memory) => memory.attach_feedback(id, label).await,
            CaseMemory::Postgres(pg) => pg.attach_feedback(id, label).await,
        }
    }

    /// Paginated history, newest first.
    pub async fn recent(&self, filter: &CaseFilter) -> Result<Vec<CalibratedCase>, MemoryError> {
        match self {
            CaseMemory::Memory(memory) => memory.recent(filter).await,
            CaseMemory::Postgres(pg) => pg.recent(filter).await,
        }
    }

    pub async fn count(&self) -> Result<u64, MemoryError> {
        match self {
            CaseMemory::Memory(memory) => Ok(memory.cases.read().await.len() as u64),
            CaseMemory::Postgres(pg) => pg.count().await,
        }
    }
}

/// Shared ranking: jaro-winkler over normalized fingerprints, a bonus for
/// same-actor precedent, hard category filter when requested.
fn rank_similar<'a>(
    cases: impl Iterator<Item = &'a CalibratedCase>,
    query: &str,
    category: Option<&str>,
    actor: Option<&ActorIdentity>,
    k: usize,
) -> Vec<ScoredCase> {
    let query = normalize(query);
    let mut scored: Vec<ScoredCase> = cases
        .filter(|case| category.is_none_or(|c| case.category == c))
        .filter_map(|case| {
            let mut score = strsim::jaro_winkler(&query, &normalize(&case.fingerprint));
            if actor.is_some_and(|a| *a == case.actor) {
                score += SAME_ACTOR_BONUS;
            }
            (score >= MIN_SIMILARITY).then(|| ScoredCase {
                case: case.clone(),
                score,
            })
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Volatile backend: a lock around an append-only vector.
#[derive(Clone, Default)]
pub struct InMemoryCaseMemory {
    cases: Arc<RwLock<Vec<CalibratedCase>>>,
}

impl InMemoryCaseMemory {
    async fn insert(&self, case: &CalibratedCase) -> Result<(), MemoryError> {
        self.cases.write().await.push(case.clone());
        Ok(())
    }

    async fn similar(
        &self,
        query: &str,
        category: Option<&str>,
        actor: Option<&ActorIdentity>,
        k: usize,
    ) -> Result<Vec<ScoredCase>, MemoryError> {
        let cases = self.cases.read().await;
        Ok(rank_similar(cases.iter(), query, category, actor, k))
    }

    async fn attach_feedback(
        &self,
        id: Uuid,
        label: FeedbackLabel,
    ) -> Result<CalibratedCase, MemoryError> {
        let mut cases = self.cases.write().await;
        let case = cases
            .iter_mut()
            .find(|case| case.id == id)
            .ok_or(MemoryError::NotFound(id))?;
        case.feedback = Some(label);
        case.feedback_at = Some(Utc::now());
        Ok(case.clone())
    }

    async fn recent(&self, filter: &CaseFilter) -> Result<Vec<CalibratedCase>, MemoryError> {
        let cases = self.cases.read().await;
        let mut matching: Vec<CalibratedCase> = cases
            .iter()
            .filter(|case| filter.category.as_deref().is_none_or(|c| case.category == c))
            .filter(|case| filter.level.is_none_or(|l| case.final_level == l))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }
}

/// Durable backend over the `warden_cases` table (see `migrations/`).
#[derive(Clone)]
pub struct PgCaseMemory {
    pool: sqlx::PgPool,
}

#[derive(sqlx::FromRow)]
struct CaseRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    actor: String,
    category: String,
    fingerprint: String,
    rationale: String,
    suggested_level: String,
    final_level: String,
    decision: String,
    feedback: Option<String>,
    feedback_at: Option<DateTime<Utc>>,
}

impl CaseRow {
    /// Rows written by older or foreign code can carry values the domain
    /// no longer understands; such rows are skipped with a warning rather
    /// than poisoning retrieval.
    fn into_case(self) -> Option<CalibratedCase> {
        let actor: ActorIdentity = match self.actor.parse() {
            Ok(actor) => actor,
            Err(_) => {
                tracing::warn!(case_id = %self.id, actor = %self.actor, "skipping case row with malformed actor");
                return None;
            }
        };
        let (Some(suggested_level), Some(final_level), Some(decision)) = (
            MitigationLevel::from_wire(&self.suggested_level),
            MitigationLevel::from_wire(&self.final_level),
            CalibrationDecision::from_wire(&self.decision),
        ) else {
            tracing::warn!(case_id = %self.id, "skipping case row with unknown level or decision");
            return None;
        };
        Some(CalibratedCase {
            id: self.id,
            created_at: self.created_at,
            actor,
            category: self.category,
            fingerprint: self.fingerprint,
            rationale: self.rationale,
            suggested_level,
            final_level,
            decision,
            feedback: self.feedback.as_deref().and_then(FeedbackLabel::from_wire),
            feedback_at: self.feedback_at,
        })
    }
}

impl PgCaseMemory {
    async fn insert(&self, case: &CalibratedCase) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            INSERT INTO warden_cases (
                id, created_at, actor, category, fingerprint, rationale,
                suggested_level, final_level, decision, feedback, feedback_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(case.id)
        .bind(case.created_at)
        .bind(case.actor.to_string())
        .bind(&case.category)
        .bind(&case.fingerprint)
        .bind(&case.rationale)
        .bind(case.suggested_level.as_str())
        .bind(case.final_level.as_str())
        .bind(case.decision.as_str())
        .bind(case.feedback.map(FeedbackLabel::as_str))
        .bind(case.feedback_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn similar(
        &self,
        query: &str,
        category: Option<&str>,
        actor: Option<&ActorIdentity>,
        k: usize,
    ) -> Result<Vec<ScoredCase>, MemoryError> {
        let rows = sqlx::query_as::<_, CaseRow>(
            r#"
            SELECT id, created_at, actor, category, fingerprint, rationale,
                   suggested_level, final_level, decision, feedback, feedback_at
            FROM warden_cases
            WHERE ($1::text IS NULL OR category = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(category)
        .bind(RETRIEVAL_WINDOW)
        .fetch_all(&self.pool)
        .await?;

        let cases: Vec<CalibratedCase> = rows.into_iter().filter_map(CaseRow::into_case).collect();
        Ok(rank_similar(cases.iter(), query, category, actor, k))
    }

    async fn attach_feedback(
        &self,
        id: Uuid,
        label: FeedbackLabel,
    ) -> Result<CalibratedCase, MemoryError> {
        let row = sqlx::query_as::<_, CaseRow>(
            r#"
            UPDATE warden_cases
            SET feedback = $2, feedback_at = NOW()
            WHERE id = $1
            RETURNING id, created_at, actor, category, fingerprint, rationale,
                      suggested_level, final_level, decision, feedback, feedback_at
            "#,
        )
        .bind(id)
        .bind(label.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(MemoryError::NotFound(id))?;
        row.into_case().ok_or(MemoryError::NotFound(id))
    }

    async fn recent(&self, filter: &CaseFilter) -> Result<Vec<CalibratedCase>, MemoryError> {
        let rows = sqlx::query_as::<_, CaseRow>(
            r#"
            SELECT id, created_at, actor, category, fingerprint, rationale,
                   suggested_level, final_level, decision, feedback, feedback_at
            FROM warden_cases
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR final_level = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.category.as_deref())
        .bind(filter.level.map(MitigationLevel::as_str))
        .bind(filter.limit.max(0))
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(CaseRow::into_case).collect())
    }

    async fn count(&self) -> Result<u64, MemoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM warden_cases")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
