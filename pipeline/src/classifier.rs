use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use warden_core::actor::ActorIdentity;
use warden_core::mitigation::MitigationLevel;
use warden_core::record::RequestRecord;
use warden_core::verdict::Verdict;

use crate::error::ClassifyError;
use crate::heuristic::HeuristicClassifier;
use crate::metrics::{GuardMetrics, add};

/// Narrow seam to the external reasoning capability: given one category's
/// drained records and that category's analyst rules, return suspect
/// verdicts.
///
/// Implementations may consult context beyond the batch, so verdicts can
/// reference actors that never appear in `records`. Whatever the backend,
/// the caller bounds the call with a timeout and treats any error as "zero
/// verdicts this batch".
pub trait Classify: Send + Sync + 'static {
    fn classify(
        &self,
        category: &str,
        records: &[RequestRecord],
        ruleset: &str,
    ) -> impl Future<Output = Result<Vec<Verdict>, ClassifyError>> + Send;
}

/// The wired classifier: an LLM endpoint when one is configured, the
/// deterministic heuristic otherwise.
pub enum ClassifierBackend {
    Llm(LlmClassifier),
    Heuristic(HeuristicClassifier),
}

impl Classify for ClassifierBackend {
    async fn classify(
        &self,
        category: &str,
        records: &[RequestRecord],
        ruleset: &str,
    ) -> Result<Vec<Verdict>, ClassifyError> {
        match self {
            ClassifierBackend::Llm(llm) => llm.classify(category, records, ruleset).await,
            ClassifierBackend::Heuristic(heuristic) => {
                heuristic.classify(category, records, ruleset).await
            }
        }
    }
}

const SYSTEM_PROMPT: &str = r#"You are an API security specialist reviewing a window of traffic for one category of endpoints.
Each line is one observed request in the form:
"actor,method,path,status,account,payload,times_seen"
where actor is ip:<addr> or account:<id>, payload is a sanitized body excerpt, and times_seen counts identical repeats in this window.

Identify actors showing abusive patterns (credential stuffing, enumeration, scraping, flooding) and respond with ONLY a valid JSON object:
{"verdicts": [{"actor": "ip:203.0.113.7", "level": "temp_block", "rationale": "why this actor is suspect", "evidence": "what in the window shows it"}]}

level must be one of: delay, captcha, temp_block, ban. Report only actors that warrant action; an empty list is a valid answer."#;

/// Chat-completions-backed classifier (any OpenAI-compatible endpoint).
///
/// The request shape follows the common denominator: JSON response format,
/// temperature 0, system prompt + one user message carrying the compressed
/// traffic window and the category's analyst rules.
pub struct LlmClassifier {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    metrics: Arc<GuardMetrics>,
}

impl LlmClassifier {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
        metrics: Arc<GuardMetrics>,
    ) -> Result<Self, ClassifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClassifyError::Transport)?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model,
            metrics,
        })
    }
}

impl Classify for LlmClassifier {
    async fn classify(
        &self,
        category: &str,
        records: &[RequestRecord],
        ruleset: &str,
    ) -> Result<Vec<Verdict>, ClassifyError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let window = compress_window(records);
        let mut user_prompt = format!(
            "Traffic window for category \"{category}\" ({} requests):\n{window}",
            records.len(),
        );
        if !ruleset.is_empty() {
            user_prompt.push_str("\n\nCUSTOM RULES:\n");
            user_prompt.push_str(ruleset);
        }

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": 0,
            "response_format": {"type": "json_object"},
        });

        let mut request = self.http.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(ClassifyError::Transport)?;
        if !response.status().is_success() {
            return Err(ClassifyError::Status(response.status().as_u16()));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ClassifyError::Malformed(err.to_string()))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ClassifyError::Malformed("no choices in completion".to_string()))?;

        let (verdicts, discarded) = parse_verdicts(strip_code_fences(&content), category);
        if discarded > 0 {
            tracing::warn!(category, discarded, "discarded malformed verdicts");
            add(&self.metrics.verdicts_discarded, discarded as u64);
        }
        Ok(verdicts)
    }
}

/// Collapse identical request lines into `line,count` so a flood of one
/// pattern costs a single prompt line instead of hundreds.
fn compress_window(records: &[RequestRecord]) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for record in records {
        let line = record.summary_line();
        match counts.get_mut(&line) {
            Some(count) => *count += 1,
            None => {
                counts.insert(line.clone(), 1);
                order.push(line);
            }
        }
    }
    order
        .into_iter()
        .map(|line| {
            let count = counts[&line];
            format!("{line},{count}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Models occasionally wrap JSON in markdown fences despite the response
/// format; strip them before parsing.
fn strip_code_fences(content: &str) -> &str {
    let content = content.trim();
    let content = content
        .strip_prefix("```json")
        .or_else(|| content.strip_prefix("```"))
        .unwrap_or(content);
    content.strip_suffix("```").unwrap_or(content).trim()
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawVerdictEnvelope {
    #[serde(default)]
    verdicts: Vec<RawVerdict>,
}

#[derive(Deserialize)]
struct RawVerdict {
    actor: String,
    level: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    evidence: String,
}

/// Validate raw verdicts into domain verdicts. A verdict with an
/// unparseable actor or a level outside the five defined ones is discarded,
/// never guessed at; `none`-level verdicts carry no action and are dropped
/// silently.
fn parse_verdicts(content: &str, category: &str) -> (Vec<Verdict>, usize) {
    let raw: Vec<RawVerdict> = match serde_json::from_str::<RawVerdictEnvelope>(content) {
        Ok(envelope) => envelope.verdicts,
        // Tolerate a bare top-level array as well.
        Err(_) => match serde_json::from_str::<Vec<RawVerdict>>(content) {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(category, error = %err, "unparseable classifier response");
                return (Vec::new(), 0);
            }
        },
    };

    let mut verdicts = Vec::new();
    let mut discarded = 0;
    for item in raw {
        let Ok(actor) = item.actor.parse::<ActorIdentity>() else {
            tracing::warn!(category, actor = %item.actor, "verdict with malformed actor discarded");
            discarded += 1;
            continue;
        };
        let Some(level) = MitigationLevel::from_wire(&item.level) else {
            tracing::warn!(category, level = %item.level, "verdict with unknown level discarded");
            discarded += 1;
            continue;
        };
        if level == MitigationLevel::None {
            continue;
        }
        verdicts.push(Verdict {
            actor,
            level,
            rationale: item.rationale,
            category: category.to_string(),
            evidence: item.evidence,
        });
    }
    (verdicts, discarded)
}
