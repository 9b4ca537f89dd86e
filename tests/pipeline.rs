//! End-to-end pipeline tests: escalation gates, grouped validation,
//! degradation on provider failure, forced re-extraction, progress and
//! persistence wiring.

use async_trait::async_trait;
use docfields::provider::{
    CorrectedField, FullExtractionRequest, FullExtractionResponse, GroupValidationRequest,
    GroupValidationResponse,
};
use docfields::{
    run, DocumentInput, ExtractionOutput, FieldKind, PipelineConfig, ProcessingProgress,
    Provenance, ProviderError, ResultStore, RunError, RunStatus, SemanticGroup, StoreError,
    TextBlock, Tier, ValidationProvider,
};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn doc(lines: &[&str]) -> Vec<TextBlock> {
    lines
        .iter()
        .enumerate()
        .map(|(i, l)| TextBlock::new(*l, 1, 10.0, 20.0 + i as f32 * 15.0))
        .collect()
}

/// Scripted provider: answers group validations from a fixed name→value
/// map and full extractions from another, recording everything it sees.
#[derive(Default)]
struct ScriptedProvider {
    corrections: BTreeMap<String, String>,
    full_fields: BTreeMap<String, String>,
    validate_calls: AtomicU32,
    full_calls: AtomicU32,
    requests: Mutex<Vec<GroupValidationRequest>>,
}

#[async_trait]
impl ValidationProvider for ScriptedProvider {
    async fn validate_group(
        &self,
        request: GroupValidationRequest,
    ) -> Result<GroupValidationResponse, ProviderError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let mut response = GroupValidationResponse::default();
        for query in &request.fields {
            if let Some(value) = self.corrections.get(&query.name) {
                response.fields.insert(
                    query.name.clone(),
                    CorrectedField {
                        value: value.clone(),
                        reason: Some("cross-checked against document".into()),
                    },
                );
            }
        }
        self.requests.lock().unwrap().push(request);
        Ok(response)
    }

    async fn extract_full(
        &self,
        _request: FullExtractionRequest,
    ) -> Result<FullExtractionResponse, ProviderError> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        Ok(FullExtractionResponse {
            fields: self.full_fields.clone(),
        })
    }
}

/// Provider that never answers. Used with paused time to exercise the
/// per-call timeout.
struct HangingProvider;

#[async_trait]
impl ValidationProvider for HangingProvider {
    async fn validate_group(
        &self,
        _request: GroupValidationRequest,
    ) -> Result<GroupValidationResponse, ProviderError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Err(ProviderError::Transport("unreachable".into()))
    }

    async fn extract_full(
        &self,
        _request: FullExtractionRequest,
    ) -> Result<FullExtractionResponse, ProviderError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Err(ProviderError::Transport("unreachable".into()))
    }
}

struct CountingStore {
    calls: AtomicU32,
}

#[async_trait]
impl ResultStore for CountingStore {
    async fn store(&self, _output: &ExtractionOutput) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Scenario A: clean document stays local ───────────────────────────────

#[tokio::test]
async fn clean_invoice_terminates_after_tier1() {
    let blocks = doc(&[
        "ACME Industrie",
        "Invoice No. FA-2024-001",
        "Total TTC: 1 200,00 €",
    ]);
    let config = PipelineConfig::builder().build().unwrap();
    let output = run(DocumentInput::new("doc-a", blocks), &config).await;

    assert_eq!(output.tiers_executed, vec![Tier::Tier1]);
    assert_eq!(output.usage.total_calls(), 0);
    assert_eq!(output.usage.estimated_cost, 0.0);

    let invoice = &output.fields[&FieldKind::InvoiceNumber];
    assert_eq!(invoice.value, "FA-2024-001");
    assert!(invoice.confidence >= 0.7);
    let total = &output.fields[&FieldKind::TotalGross];
    assert_eq!(total.value, "1200.00");
    assert!(total.confidence >= 0.6);

    // All required fields present and nothing failed.
    assert_eq!(output.status, RunStatus::Completed);
    assert!(output.success);
    assert!(output.errors.is_empty());
}

#[tokio::test]
async fn sufficient_confidence_never_escalates_even_with_provider() {
    let blocks = doc(&[
        "ACME Industrie",
        "Invoice No. FA-2024-001",
        "SIRET : 123 456 789 00012",
        "Total TTC: 1 200,00 €",
    ]);
    let provider = Arc::new(ScriptedProvider::default());
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        // Gate below the tier-1 overall confidence of this document.
        .tier1_escalation_threshold(0.75)
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-gate", blocks), &config).await;

    assert_eq!(output.tiers_executed, vec![Tier::Tier1]);
    assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.full_calls.load(Ordering::SeqCst), 0);
    assert!(output.overall_confidence >= 0.75);
    assert_eq!(output.status, RunStatus::Completed);
}

// ── Scenario B: grouped selective validation ─────────────────────────────

#[tokio::test]
async fn escalation_issues_one_call_per_nonempty_group() {
    // No amount anywhere: total_gross is a missing required field, so the
    // amounts group gets queried. The confident identifier and date must
    // not trigger calls for their groups.
    let blocks = doc(&[
        "ACME Industrie",
        "Invoice No. FA-2024-001",
        "Date de facturation : 15/01/2024",
    ]);
    let provider = Arc::new(ScriptedProvider {
        corrections: BTreeMap::from([
            ("total_gross".to_string(), "980.00".to_string()),
            ("vendor_name".to_string(), "ACME Industrie SAS".to_string()),
        ]),
        ..Default::default()
    });
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-b", blocks), &config).await;

    assert_eq!(output.tiers_executed, vec![Tier::Tier1, Tier::Tier2]);

    let requests = provider.requests.lock().unwrap();
    let groups: Vec<SemanticGroup> = requests.iter().map(|r| r.group).collect();
    assert!(groups.contains(&SemanticGroup::Amounts));
    assert!(!groups.contains(&SemanticGroup::Identifiers));
    assert!(!groups.contains(&SemanticGroup::Dates));
    // One call per non-empty group, no more.
    assert_eq!(provider.validate_calls.load(Ordering::SeqCst) as usize, groups.len());
    assert_eq!(output.usage.validation_calls as usize, groups.len());

    // The missing required amount was queried without a current value…
    let amount_query = requests
        .iter()
        .find(|r| r.group == SemanticGroup::Amounts)
        .and_then(|r| r.fields.iter().find(|f| f.name == "total_gross"))
        .expect("amounts group queried total_gross");
    assert!(amount_query.current_value.is_none());

    // …and came back supplied at the configured confidence.
    let total = &output.fields[&FieldKind::TotalGross];
    assert_eq!(total.value, "980.00");
    assert!((total.confidence - config.supplied_field_confidence).abs() < 1e-9);
    assert_eq!(total.provenance, Provenance::AiValidated);
}

#[tokio::test]
async fn correction_is_recorded_and_confidence_boosted() {
    let blocks = doc(&[
        "Fournisseur",
        "ACME Industrie SARL",
        "Invoice No. FA-2024-001",
        "Total TTC: 1 200,00 €",
    ]);
    let provider = Arc::new(ScriptedProvider {
        corrections: BTreeMap::from([(
            "vendor_name".to_string(),
            "ACME Industrie SARL & Cie".to_string(),
        )]),
        ..Default::default()
    });
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-corr", blocks), &config).await;

    let vendor = &output.fields[&FieldKind::VendorName];
    assert_eq!(vendor.value, "ACME Industrie SARL & Cie");
    assert_eq!(vendor.provenance, Provenance::AiValidated);
    // 0.65 from keyword proximity, +0.3 boost, capped at 0.95.
    assert!((vendor.confidence - 0.95).abs() < 1e-9);

    assert_eq!(output.corrections.len(), 1);
    let c = &output.corrections[0];
    assert_eq!(c.field, FieldKind::VendorName);
    assert_eq!(c.original, "ACME Industrie SARL");
    assert_eq!(c.corrected, "ACME Industrie SARL & Cie");
}

// ── Scenario C: provider timeout degrades, never fails ───────────────────

#[tokio::test(start_paused = true)]
async fn timeout_keeps_tier1_values_and_run_succeeds() {
    let blocks = doc(&[
        "ACME Industrie",
        "Invoice No. FA-2024-001",
        "Total TTC: 1 200,00 €",
    ]);
    let tier1_only = run(
        DocumentInput::new("doc-ref", blocks.clone()),
        &PipelineConfig::builder().build().unwrap(),
    )
    .await;

    let config = PipelineConfig::builder()
        .provider(Arc::new(HangingProvider))
        .api_timeout_secs(5)
        .max_retries(0)
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-c", blocks), &config).await;

    assert!(output.success);
    assert_eq!(output.status, RunStatus::Completed);
    assert!(output.tiers_executed.contains(&Tier::Tier2));
    assert!(!output.errors.is_empty());
    assert!(output
        .errors
        .iter()
        .all(|e| matches!(e, RunError::ValidationCall { .. })));
    assert!(output.errors.iter().all(|e| !e.is_fatal()));

    // Every field keeps its tier-1 value and confidence.
    for (kind, field) in &output.fields {
        let before = &tier1_only.fields[kind];
        assert_eq!(field.value, before.value);
        assert!((field.confidence - before.confidence).abs() < 1e-9);
    }
}

/// Answers 2xx but with garbage the pipeline cannot interpret.
struct MalformedProvider {
    validate_calls: AtomicU32,
}

#[async_trait]
impl ValidationProvider for MalformedProvider {
    async fn validate_group(
        &self,
        _request: GroupValidationRequest,
    ) -> Result<GroupValidationResponse, ProviderError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Malformed("response was prose, not JSON".into()))
    }

    async fn extract_full(
        &self,
        _request: FullExtractionRequest,
    ) -> Result<FullExtractionResponse, ProviderError> {
        Err(ProviderError::Malformed("response was prose, not JSON".into()))
    }
}

#[tokio::test]
async fn malformed_response_degrades_without_retrying() {
    let blocks = doc(&[
        "Fournisseur",
        "ACME Industrie SARL",
        "Invoice No. FA-2024-001",
        "Total TTC: 1 200,00 €",
    ]);
    let tier1_only = run(
        DocumentInput::new("doc-ref-m", blocks.clone()),
        &PipelineConfig::builder().build().unwrap(),
    )
    .await;

    let provider = Arc::new(MalformedProvider {
        validate_calls: AtomicU32::new(0),
    });
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        .max_retries(2)
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-malformed", blocks), &config).await;

    // One parse error per dispatched group, and a malformed body is never
    // retried: call count equals error count.
    assert!(!output.errors.is_empty());
    assert!(output
        .errors
        .iter()
        .all(|e| matches!(e, RunError::ValidationParse { .. })));
    assert_eq!(
        provider.validate_calls.load(Ordering::SeqCst) as usize,
        output.errors.len()
    );

    // Tier-1 values and confidences survive untouched.
    assert_eq!(output.fields.len(), tier1_only.fields.len());
    for (kind, field) in &output.fields {
        let before = &tier1_only.fields[kind];
        assert_eq!(field.value, before.value);
        assert!((field.confidence - before.confidence).abs() < 1e-9);
        assert_eq!(field.provenance, before.provenance);
    }
    assert!(output.success);
    assert_eq!(output.status, RunStatus::Completed);
}

// ── Scenario D: forced tier-3 entry ──────────────────────────────────────

#[tokio::test]
async fn forced_tier3_replaces_everything_with_ai_full() {
    let provider = Arc::new(ScriptedProvider {
        full_fields: BTreeMap::from([
            ("invoice_number".to_string(), "FA-2024-001".to_string()),
            ("total_gross".to_string(), "1200.00".to_string()),
            ("vendor_name".to_string(), "ACME Industrie".to_string()),
            ("issue_date".to_string(), "2024-01-15".to_string()),
        ]),
        ..Default::default()
    });
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        .entry_tier(Tier::Tier3)
        .build()
        .unwrap();
    let input = DocumentInput::new("doc-d", doc(&["ignored text"]))
        .with_images(vec![DynamicImage::new_rgb8(2, 2)]);
    let output = run(input, &config).await;

    assert_eq!(output.tiers_executed, vec![Tier::Tier3]);
    assert_eq!(provider.validate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.full_calls.load(Ordering::SeqCst), 1);
    assert_eq!(output.usage.full_extraction_calls, 1);

    assert_eq!(output.fields.len(), 4);
    for field in output.fields.values() {
        assert_eq!(field.provenance, Provenance::AiFull);
        assert!((field.confidence - config.full_extraction_confidence).abs() < 1e-9);
    }
    assert!(output.success);
}

#[tokio::test]
async fn tier3_without_images_fails_the_run() {
    let config = PipelineConfig::builder()
        .provider(Arc::new(ScriptedProvider::default()))
        .entry_tier(Tier::Tier3)
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-fail", Vec::new()), &config).await;

    assert_eq!(output.status, RunStatus::Failed);
    assert!(!output.success);
    assert!(output
        .errors
        .iter()
        .any(|e| matches!(e, RunError::FullExtraction { .. })));
}

// ── Merge precedence across a full escalation ────────────────────────────

#[tokio::test]
async fn higher_tier_wins_field_wise_in_merge() {
    let blocks = doc(&[
        "Fournisseur",
        "ACME Industrie SARL",
        "Invoice No. FA-2024-001",
        "Total TTC: 1 200,00 €",
    ]);
    let provider = Arc::new(ScriptedProvider {
        corrections: BTreeMap::from([(
            "vendor_name".to_string(),
            "ACME Industrie (validated)".to_string(),
        )]),
        // Tier 3 re-reads the invoice number but says nothing about the
        // vendor, so the tier-2 vendor must survive the merge.
        full_fields: BTreeMap::from([(
            "invoice_number".to_string(),
            "FA-2024-001-B".to_string(),
        )]),
        ..Default::default()
    });
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        // Force the tier-2 → tier-3 gate open: the cap keeps overall
        // confidence below this.
        .tier2_escalation_threshold(0.99)
        .build()
        .unwrap();
    let input = DocumentInput::new("doc-merge", blocks)
        .with_images(vec![DynamicImage::new_rgb8(2, 2)]);
    let output = run(input, &config).await;

    assert_eq!(
        output.tiers_executed,
        vec![Tier::Tier1, Tier::Tier2, Tier::Tier3]
    );

    let invoice = &output.fields[&FieldKind::InvoiceNumber];
    assert_eq!(invoice.value, "FA-2024-001-B");
    assert_eq!(invoice.provenance, Provenance::AiFull);

    let vendor = &output.fields[&FieldKind::VendorName];
    assert_eq!(vendor.value, "ACME Industrie (validated)");
    assert_eq!(vendor.provenance, Provenance::AiValidated);

    assert_eq!(output.usage.full_extraction_calls, 1);
    let expected_cost = f64::from(output.usage.validation_calls)
        * config.cost_per_validation_call
        + config.cost_per_full_extraction;
    assert!((output.usage.estimated_cost - expected_cost).abs() < 1e-9);
}

// ── Cancellation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn pre_cancelled_run_ends_partial_with_no_tiers() {
    let token = CancellationToken::new();
    token.cancel();
    let config = PipelineConfig::builder().cancel(token).build().unwrap();
    let output = run(
        DocumentInput::new("doc-cancel", doc(&["Invoice No. FA-1"])),
        &config,
    )
    .await;

    assert!(output.tiers_executed.is_empty());
    assert_eq!(output.status, RunStatus::Partial);
    assert!(output.success);
    assert!(output
        .errors
        .iter()
        .any(|e| matches!(e, RunError::Cancelled { .. })));
}

/// Cancels its own run while answering the first validation call, so the
/// cancellation lands between Tier 2 and Tier 3.
struct CancellingProvider {
    token: CancellationToken,
    full_calls: AtomicU32,
}

#[async_trait]
impl ValidationProvider for CancellingProvider {
    async fn validate_group(
        &self,
        _request: GroupValidationRequest,
    ) -> Result<GroupValidationResponse, ProviderError> {
        self.token.cancel();
        Ok(GroupValidationResponse::default())
    }

    async fn extract_full(
        &self,
        _request: FullExtractionRequest,
    ) -> Result<FullExtractionResponse, ProviderError> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        Ok(FullExtractionResponse::default())
    }
}

#[tokio::test]
async fn cancellation_between_tiers_keeps_completed_work() {
    let blocks = doc(&[
        "Fournisseur",
        "ACME Industrie SARL",
        "Invoice No. FA-2024-001",
        "Total TTC: 1 200,00 €",
    ]);
    let token = CancellationToken::new();
    let provider = Arc::new(CancellingProvider {
        token: token.clone(),
        full_calls: AtomicU32::new(0),
    });
    let config = PipelineConfig::builder()
        .provider(provider.clone())
        .cancel(token)
        // Keep the tier-2 → tier-3 gate open so only the cancellation can
        // stop the escalation.
        .tier2_escalation_threshold(0.99)
        .build()
        .unwrap();
    let input = DocumentInput::new("doc-midcancel", blocks)
        .with_images(vec![DynamicImage::new_rgb8(2, 2)]);
    let output = run(input, &config).await;

    // Tier 3 never starts; everything extracted so far is kept.
    assert_eq!(output.tiers_executed, vec![Tier::Tier1, Tier::Tier2]);
    assert_eq!(provider.full_calls.load(Ordering::SeqCst), 0);
    assert_eq!(output.usage.full_extraction_calls, 0);
    assert_eq!(output.status, RunStatus::Partial);
    assert!(output.success);
    assert!(output
        .errors
        .iter()
        .any(|e| matches!(e, RunError::Cancelled { .. })));
    assert_eq!(output.fields[&FieldKind::InvoiceNumber].value, "FA-2024-001");
    assert_eq!(output.fields[&FieldKind::VendorName].value, "ACME Industrie SARL");
}

// ── Skipped escalations are reported ─────────────────────────────────────

#[tokio::test]
async fn skipped_escalation_reasons_survive_in_run_notes() {
    // Low confidence wants Tier 2, but no provider is configured: the run
    // must say so in its notes even though only Tier 1 produced
    // diagnostics.
    let blocks = doc(&["Fournisseur", "ACME Industrie SARL"]);
    let config = PipelineConfig::builder().build().unwrap();
    let output = run(DocumentInput::new("doc-notes", blocks), &config).await;

    assert_eq!(output.tiers_executed, vec![Tier::Tier1]);
    assert!(output
        .notes
        .iter()
        .any(|n| n.contains("tier2 skipped: no validation provider")));
}

// ── Progress stream ──────────────────────────────────────────────────────

#[tokio::test]
async fn progress_events_are_ordered_and_terminal() {
    let (tx, mut rx) = mpsc::channel::<ProcessingProgress>(64);
    let config = PipelineConfig::builder().progress(tx).build().unwrap();
    let output = run(
        DocumentInput::new(
            "doc-progress",
            doc(&["ACME Industrie", "Invoice No. FA-2024-001", "Total TTC: 1 200,00 €"]),
        ),
        &config,
    )
    .await;
    drop(config);

    let mut events = Vec::new();
    while let Some(e) = rx.recv().await {
        events.push(e);
    }

    assert!(events.len() >= 3);
    assert_eq!(events[0].status, RunStatus::Queued);
    assert_eq!(events[0].percent, 0);
    for pair in events.windows(2) {
        assert!(pair[0].percent <= pair[1].percent);
    }
    let last = events.last().unwrap();
    assert_eq!(last.percent, 100);
    assert_eq!(last.status, output.status);
    assert!(events.iter().all(|e| e.document_id == "doc-progress"));
}

// ── Persistence ──────────────────────────────────────────────────────────

#[tokio::test]
async fn store_receives_exactly_one_output_even_on_failure() {
    let store = Arc::new(CountingStore {
        calls: AtomicU32::new(0),
    });

    let config = PipelineConfig::builder()
        .store(store.clone())
        .build()
        .unwrap();
    run(DocumentInput::new("doc-s1", doc(&["Invoice No. FA-1"])), &config).await;
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);

    // Failed runs are stored too.
    let config = PipelineConfig::builder()
        .store(store.clone())
        .entry_tier(Tier::Tier3)
        .provider(Arc::new(ScriptedProvider::default()))
        .build()
        .unwrap();
    let output = run(DocumentInput::new("doc-s2", Vec::new()), &config).await;
    assert!(!output.success);
    assert_eq!(store.calls.load(Ordering::SeqCst), 2);
}
