//! Escalation orchestrator.
//!
//! Runs the tiers in order, evaluates the confidence gates between them and
//! combines their outputs with a pure field-wise merge. A run always yields
//! one [`ExtractionOutput`]: tier failures, cancellation and skipped
//! escalations are folded into its status and error list instead of being
//! surfaced as a bare `Err`.
//!
//! Gate summary:
//!
//! * Tier 1 → Tier 2 when overall confidence is below the Tier-1 escalation
//!   threshold or any required field is missing.
//! * Tier 2 → Tier 3 when overall confidence is still below the Tier-2
//!   escalation threshold or a required field is still missing.
//! * An escalation that cannot happen (no provider, no page images, or the
//!   configured ceiling) is skipped with a note, never treated as fatal.

use crate::config::PipelineConfig;
use crate::error::RunError;
use crate::model::{
    missing_required, overall_confidence, CallUsage, Correction, ExtractionOutput, FieldMap,
    RunStatus, TextBlock, Tier, TierDiagnostics,
};
use crate::pipeline::{tier1, tier2, tier3};
use crate::progress::ProgressSink;
use image::DynamicImage;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One document, ready to run: positioned text blocks from the upstream
/// extractor plus optional rendered page images for Tier 3.
#[derive(Clone)]
pub struct DocumentInput {
    pub id: String,
    pub blocks: Vec<TextBlock>,
    pub page_images: Vec<DynamicImage>,
}

impl DocumentInput {
    pub fn new(id: impl Into<String>, blocks: Vec<TextBlock>) -> Self {
        Self {
            id: id.into(),
            blocks,
            page_images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<DynamicImage>) -> Self {
        self.page_images = images;
        self
    }
}

impl std::fmt::Debug for DocumentInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentInput")
            .field("id", &self.id)
            .field("blocks", &self.blocks.len())
            .field("page_images", &self.page_images.len())
            .finish()
    }
}

/// Mutable run state threaded through the tiers.
struct Run<'a> {
    doc_id: String,
    config: &'a PipelineConfig,
    sink: ProgressSink,
    started: Instant,
    fields: FieldMap,
    tiers_executed: Vec<Tier>,
    diagnostics: Vec<TierDiagnostics>,
    corrections: Vec<Correction>,
    errors: Vec<RunError>,
    usage: CallUsage,
    cancelled: bool,
    skip_notes: Vec<String>,
}

/// Execute the pipeline for one document.
pub async fn run(doc: DocumentInput, config: &PipelineConfig) -> ExtractionOutput {
    let sink = match &config.progress {
        Some(tx) => ProgressSink::new(&doc.id, tx.clone()),
        None => ProgressSink::disabled(&doc.id),
    };
    let mut run = Run {
        doc_id: doc.id.clone(),
        config,
        sink,
        started: Instant::now(),
        fields: FieldMap::new(),
        tiers_executed: Vec::new(),
        diagnostics: Vec::new(),
        corrections: Vec::new(),
        errors: Vec::new(),
        usage: CallUsage::default(),
        cancelled: false,
        skip_notes: Vec::new(),
    };

    run.sink.emit(None, RunStatus::Queued, 0, "queued");
    info!(document_id = %doc.id, entry = %config.entry_tier, "starting extraction run");

    run.execute(&doc).await;
    run.finish().await
}

impl Run<'_> {
    async fn execute(&mut self, doc: &DocumentInput) {
        // Tier 1 runs for both Tier-1 and Tier-2 entry: the validator needs
        // local candidates and context to work on. Tier-3 entry skips it.
        let tier1_result = if self.config.entry_tier <= Tier::Tier2 {
            if self.check_cancelled("tier1") {
                return;
            }
            self.sink.emit(
                Some(Tier::Tier1),
                RunStatus::Processing,
                10,
                "tier1: local extraction",
            );
            let result = tier1::extract(doc.blocks.clone());
            self.fields = result.fields.clone();
            self.tiers_executed.push(Tier::Tier1);
            self.diagnostics.push(result.diagnostics.clone());
            self.sink.emit(
                Some(Tier::Tier1),
                RunStatus::Processing,
                30,
                format!("tier1: {} fields extracted", result.fields.len()),
            );
            Some(result)
        } else {
            None
        };

        // Tier 1 → Tier 2 gate.
        if let Some(t1) = &tier1_result {
            let confidence = overall_confidence(&self.fields);
            let missing = missing_required(&self.fields);
            let wanted = self.config.entry_tier == Tier::Tier2
                || confidence < self.config.tier1_escalation_threshold
                || !missing.is_empty();

            if !wanted {
                debug!(confidence, "tier1 results sufficient, no escalation");
            } else if self.config.max_tier < Tier::Tier2 {
                self.skip("tier2 skipped: tier ceiling reached");
            } else if let Some(provider) = self.config.provider.clone() {
                if self.check_cancelled("tier2") {
                    return;
                }
                self.run_tier2(t1, &provider).await;
            } else {
                self.skip("tier2 skipped: no validation provider configured");
            }
        }

        // Tier 2 → Tier 3 gate (or direct Tier-3 entry).
        let confidence = overall_confidence(&self.fields);
        let wanted = self.config.entry_tier == Tier::Tier3
            || (self.tiers_executed.contains(&Tier::Tier2)
                && (confidence < self.config.tier2_escalation_threshold
                    || !missing_required(&self.fields).is_empty()));
        if !wanted {
            return;
        }
        if self.config.entry_tier < Tier::Tier3 {
            // Escalation path: impossibility is a skip, not a failure.
            if self.config.max_tier < Tier::Tier3 {
                self.skip("tier3 skipped: tier ceiling reached");
                return;
            }
            if self.config.provider.is_none() {
                self.skip("tier3 skipped: no validation provider configured");
                return;
            }
            if doc.page_images.is_empty() {
                self.skip("tier3 skipped: no page images available");
                return;
            }
        }
        if self.check_cancelled("tier3") {
            return;
        }
        self.run_tier3(doc).await;
    }

    async fn run_tier2(
        &mut self,
        tier1_result: &crate::model::Tier1Result,
        provider: &std::sync::Arc<dyn crate::provider::ValidationProvider>,
    ) {
        self.sink.emit(
            Some(Tier::Tier2),
            RunStatus::Processing,
            40,
            "tier2: validating low-confidence fields",
        );
        let result = tier2::validate(tier1_result, &self.doc_id, self.config, provider).await;

        self.fields = result.fields;
        self.tiers_executed.push(Tier::Tier2);
        self.diagnostics.push(result.diagnostics);
        self.corrections.extend(result.corrections);
        self.errors.extend(result.errors);
        self.usage.validation_calls += result.calls;
        self.sink.emit(
            Some(Tier::Tier2),
            RunStatus::Processing,
            60,
            format!("tier2: {} group calls issued", result.calls),
        );
    }

    async fn run_tier3(&mut self, doc: &DocumentInput) {
        self.sink.emit(
            Some(Tier::Tier3),
            RunStatus::Processing,
            70,
            "tier3: full re-extraction from page images",
        );
        let outcome = match self.config.provider.as_ref() {
            Some(provider) => {
                tier3::reextract(&self.doc_id, &doc.page_images, self.config, provider).await
            }
            None => Err(RunError::FullExtraction {
                detail: "no validation provider configured".to_string(),
            }),
        };

        match outcome {
            Ok(result) => {
                // Tier 3 saw the whole document; its values supersede the
                // text-based tiers field-wise. Fields it did not return keep
                // their lower-tier values.
                self.fields = merge(std::mem::take(&mut self.fields), result.fields);
                self.tiers_executed.push(Tier::Tier3);
                self.diagnostics.push(result.diagnostics);
                self.usage.full_extraction_calls += result.calls;
                self.sink.emit(
                    Some(Tier::Tier3),
                    RunStatus::Processing,
                    90,
                    "tier3: re-extraction complete",
                );
            }
            Err(e) => {
                warn!(document_id = %self.doc_id, "tier3 failed: {e}");
                self.tiers_executed.push(Tier::Tier3);
                self.errors.push(e);
            }
        }
    }

    fn check_cancelled(&mut self, stage: &str) -> bool {
        if self.config.cancel.is_cancelled() {
            info!(document_id = %self.doc_id, stage, "run cancelled");
            self.errors.push(RunError::Cancelled {
                stage: stage.to_string(),
            });
            self.cancelled = true;
            return true;
        }
        false
    }

    fn skip(&mut self, note: &str) {
        debug!(document_id = %self.doc_id, "{note}");
        self.skip_notes.push(note.to_string());
    }

    /// Assemble the output, emit the terminal progress event and hand the
    /// result to the store. Called exactly once per run.
    async fn finish(mut self) -> ExtractionOutput {
        let status = if self.errors.iter().any(RunError::is_fatal) {
            RunStatus::Failed
        } else if self.cancelled || !missing_required(&self.fields).is_empty() {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };

        self.usage.estimated_cost = f64::from(self.usage.validation_calls)
            * self.config.cost_per_validation_call
            + f64::from(self.usage.full_extraction_calls)
                * self.config.cost_per_full_extraction;

        let output = ExtractionOutput {
            document_id: self.doc_id,
            overall_confidence: overall_confidence(&self.fields),
            fields: self.fields,
            tiers_executed: self.tiers_executed,
            diagnostics: self.diagnostics,
            notes: self.skip_notes,
            corrections: self.corrections,
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            usage: self.usage,
            status,
            success: status != RunStatus::Failed,
            errors: self.errors,
        };

        info!(
            document_id = %output.document_id,
            status = ?output.status,
            fields = output.fields.len(),
            calls = output.usage.total_calls(),
            "extraction run finished"
        );
        self.sink.emit(
            None,
            status,
            100,
            format!("finished with {} fields", output.fields.len()),
        );

        if let Some(store) = &self.config.store {
            if let Err(e) = store.store(&output).await {
                warn!(document_id = %output.document_id, "failed to store result: {e}");
            }
        }

        output
    }
}

/// Field-wise overlay: a field present in `higher` replaces the lower-tier
/// value regardless of confidence; everything else is kept.
fn merge(mut base: FieldMap, higher: FieldMap) -> FieldMap {
    for (kind, field) in higher {
        base.insert(kind, field);
    }
    base
}
