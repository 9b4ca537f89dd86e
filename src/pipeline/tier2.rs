//! Tier 2: selective validation of low-confidence fields.
//!
//! The cost-control core of the pipeline. Fields needing a second opinion
//! are partitioned into fixed semantic groups and each *non-empty* group
//! becomes exactly one external call — N doubtful fields never turn into N
//! calls. Group calls run concurrently and are joined, so Tier-2 latency is
//! bounded by the slowest group instead of the sum of all groups.
//!
//! Failure is always group-scoped: a timed-out or malformed call degrades
//! that group to its Tier-1 values and records a [`RunError`]; the run
//! itself never aborts here.

use crate::config::PipelineConfig;
use crate::error::{ProviderError, RunError};
use crate::fields::{FieldKind, SemanticGroup};
use crate::model::{
    Correction, ExtractedField, Provenance, TextBlock, Tier, Tier1Result, Tier2Result,
    TierDiagnostics,
};
use crate::provider::{FieldQuery, GroupValidationRequest, GroupValidationResponse, ValidationProvider};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Validate the doubtful subset of Tier-1 fields. Never fails the run; all
/// degradation is reported through `Tier2Result::errors`.
pub async fn validate(
    tier1: &Tier1Result,
    document_id: &str,
    config: &PipelineConfig,
    provider: &Arc<dyn ValidationProvider>,
) -> Tier2Result {
    let start = Instant::now();
    let mut fields = tier1.fields.clone();
    let mut corrections = Vec::new();
    let mut errors = Vec::new();
    let mut notes = Vec::new();

    let requests = build_requests(tier1, document_id, config);
    let calls = requests.len() as u32;
    if requests.is_empty() {
        debug!("tier2: nothing selected for validation");
        return Tier2Result {
            fields,
            corrections,
            errors,
            calls: 0,
            diagnostics: TierDiagnostics {
                tier: Tier::Tier2,
                duration_ms: start.elapsed().as_millis() as u64,
                fields_extracted: 0,
                notes: vec!["no fields below threshold".to_string()],
            },
        };
    }

    debug!(
        groups = requests.len(),
        "tier2: dispatching grouped validation calls"
    );

    // One call per non-empty group, all in flight together.
    let outcomes = futures::future::join_all(requests.into_iter().map(|req| {
        let provider = Arc::clone(provider);
        async move {
            let group = req.group;
            let queried: Vec<String> = req.fields.iter().map(|f| f.name.clone()).collect();
            let outcome = call_with_retry(&provider, req, config).await;
            (group, queried, outcome)
        }
    }))
    .await;

    let mut validated = 0usize;
    for (group, queried, outcome) in outcomes {
        match outcome {
            Ok(response) => {
                validated += apply_group(
                    group,
                    &queried,
                    response,
                    &mut fields,
                    &mut corrections,
                    &mut notes,
                    config,
                );
            }
            Err(e) => {
                warn!(%group, "tier2 group degraded to tier1 values: {e}");
                notes.push(format!("group '{group}' kept tier1 values"));
                errors.push(e);
            }
        }
    }

    Tier2Result {
        fields,
        corrections,
        errors,
        calls,
        diagnostics: TierDiagnostics {
            tier: Tier::Tier2,
            duration_ms: start.elapsed().as_millis() as u64,
            fields_extracted: validated,
            notes,
        },
    }
}

// ── Selection & request building ─────────────────────────────────────────

/// Selection rule: below the general threshold, or a critical field below
/// the stricter critical threshold.
pub fn needs_validation(kind: FieldKind, confidence: f64, config: &PipelineConfig) -> bool {
    confidence < config.confidence_threshold
        || (kind.is_critical() && confidence < config.critical_threshold)
}

/// Build at most one request per semantic group: doubtful extracted fields
/// plus missing required fields (queried with no current value so the
/// service may supply them).
fn build_requests(
    tier1: &Tier1Result,
    document_id: &str,
    config: &PipelineConfig,
) -> Vec<GroupValidationRequest> {
    let mut by_group: BTreeMap<SemanticGroup, Vec<FieldQuery>> = BTreeMap::new();

    for (&kind, field) in &tier1.fields {
        if !needs_validation(kind, field.confidence, config) {
            continue;
        }
        by_group
            .entry(kind.group())
            .or_default()
            .push(field_query(kind, Some(field), tier1, config));
    }

    for kind in FieldKind::required_fields() {
        if !tier1.fields.contains_key(&kind) {
            by_group
                .entry(kind.group())
                .or_default()
                .push(field_query(kind, None, tier1, config));
        }
    }

    by_group
        .into_iter()
        .map(|(group, fields)| GroupValidationRequest {
            document_id: document_id.to_string(),
            group,
            fields,
        })
        .collect()
}

fn field_query(
    kind: FieldKind,
    field: Option<&ExtractedField>,
    tier1: &Tier1Result,
    config: &PipelineConfig,
) -> FieldQuery {
    let mut hints = vec![kind.spec().hint.to_string()];
    if let Some(s) = &config.suggestions {
        if let Some(extra) = s.suggest(kind, field.map(|f| f.value.as_str())) {
            hints.push(extra);
        }
    }
    FieldQuery {
        name: kind.name().to_string(),
        current_value: field.map(|f| f.value.clone()),
        confidence: field.map_or(0.0, |f| f.confidence),
        context: context_for(field, &tier1.blocks, config.context_window_chars),
        hints,
    }
}

/// Bounded window of document text around the contributing block — never
/// the whole document. Missing fields get the head of page 1 instead.
fn context_for(field: Option<&ExtractedField>, blocks: &[TextBlock], window: usize) -> String {
    let anchor = field.and_then(|f| {
        blocks.iter().position(|b| {
            Some(b.page) == f.page && Some(b.text.as_str()) == f.source_text.as_deref()
        })
    });

    let texts: Vec<&str> = match anchor {
        Some(i) => {
            let lo = i.saturating_sub(1);
            let hi = (i + 2).min(blocks.len());
            blocks[lo..hi]
                .iter()
                .filter(|b| b.page == blocks[i].page)
                .map(|b| b.text.as_str())
                .collect()
        }
        None => blocks
            .iter()
            .filter(|b| b.page == 1)
            .take(6)
            .map(|b| b.text.as_str())
            .collect(),
    };

    let mut context = texts.join("\n");
    if context.len() > window {
        let mut end = window;
        while !context.is_char_boundary(end) {
            end -= 1;
        }
        context.truncate(end);
    }
    context
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Drive one group call with timeout and exponential backoff on transient
/// failures. Non-transient failures map straight to the run taxonomy.
async fn call_with_retry(
    provider: &Arc<dyn ValidationProvider>,
    request: GroupValidationRequest,
    config: &PipelineConfig,
) -> Result<GroupValidationResponse, RunError> {
    let group = request.group;
    let mut last_err = String::new();

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(%group, "tier2 retry {attempt}/{} after {backoff}ms", config.max_retries);
            sleep(Duration::from_millis(backoff)).await;
        }

        let call = provider.validate_group(request.clone());
        match timeout(Duration::from_secs(config.api_timeout_secs), call).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(ProviderError::Malformed(detail))) => {
                return Err(RunError::ValidationParse { group, detail });
            }
            Ok(Err(e)) => {
                last_err = e.to_string();
                if !e.is_transient() {
                    break;
                }
            }
            Err(_) => {
                last_err = format!("timed out after {}s", config.api_timeout_secs);
            }
        }
    }

    Err(RunError::ValidationCall {
        group,
        retries: config.max_retries,
        detail: last_err,
    })
}

// ── Merge ────────────────────────────────────────────────────────────────

/// Fold one group response into the field map. Returns how many fields the
/// service actually validated.
fn apply_group(
    group: SemanticGroup,
    queried: &[String],
    response: GroupValidationResponse,
    fields: &mut crate::model::FieldMap,
    corrections: &mut Vec<Correction>,
    notes: &mut Vec<String>,
    config: &PipelineConfig,
) -> usize {
    let mut validated = 0;

    for (name, corrected) in response.fields {
        let Some(kind) = FieldKind::from_name(&name) else {
            notes.push(format!("group '{group}': ignored unknown field '{name}'"));
            continue;
        };
        if !queried.iter().any(|q| q == &name) {
            notes.push(format!("group '{group}': ignored unsolicited field '{name}'"));
            continue;
        }

        match fields.get_mut(&kind) {
            Some(existing) => {
                if corrected.value != existing.value {
                    corrections.push(Correction {
                        field: kind,
                        original: existing.value.clone(),
                        corrected: corrected.value.clone(),
                        reason: corrected.reason,
                    });
                    existing.value = corrected.value;
                }
                existing.confidence =
                    boosted(existing.confidence, config.validation_boost, config.confidence_cap);
                existing.provenance = Provenance::AiValidated;
            }
            None => {
                // Previously-missing required field supplied by the service.
                notes.push(format!("group '{group}': '{name}' supplied by validator"));
                fields.insert(
                    kind,
                    ExtractedField {
                        value: corrected.value,
                        confidence: config.supplied_field_confidence,
                        page: None,
                        bbox: None,
                        provenance: Provenance::AiValidated,
                        source_text: None,
                    },
                );
            }
        }
        validated += 1;
    }

    validated
}

/// `min(cap, original + boost)` — never lower than the original.
fn boosted(original: f64, boost: f64, cap: f64) -> f64 {
    (original + boost).min(cap).max(original)
}
