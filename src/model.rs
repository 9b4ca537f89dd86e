//! Shared data types flowing through the pipeline.
//!
//! Everything here is a plain serialisable value. Tier results are immutable
//! once produced — the orchestrator combines them with a pure merge function
//! instead of mutating one shared record across tiers, so concurrent document
//! runs can never alias each other's state.

use crate::error::RunError;
use crate::fields::FieldKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Axis-aligned box in page coordinate space (origin top-left, units as
/// produced by the upstream text-extraction library).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Optional font attributes attached to a text block by the upstream
/// extractor. Only used as a weak layout signal (e.g. large text near the top
/// of page 1 is likely the vendor name).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FontInfo {
    pub name: Option<String>,
    pub size: Option<f32>,
    #[serde(default)]
    pub bold: bool,
}

/// One positioned text block — the immutable unit of pipeline input.
///
/// Blocks within a page arrive top-to-bottom in the order the extraction
/// library produced them; the Tier-1 heuristics rely on that ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    /// 1-indexed page number.
    pub page: usize,
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<FontInfo>,
}

impl TextBlock {
    /// Convenience constructor used heavily in tests.
    pub fn new(text: impl Into<String>, page: usize, x: f32, y: f32) -> Self {
        Self {
            text: text.into(),
            page,
            bbox: BoundingBox {
                x,
                y,
                width: 100.0,
                height: 12.0,
            },
            font: None,
        }
    }
}

/// Which method produced a field's current value. Drives merge precedence
/// and lets downstream consumers audit where each value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Tier 1 regular-expression match.
    Pattern,
    /// Tier 1 keyword-anchored proximity heuristic.
    KeywordProximity,
    /// Tier 2: confirmed or corrected by the validation service.
    AiValidated,
    /// Tier 3: wholesale re-extraction from page images.
    AiFull,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Pattern => f.write_str("pattern"),
            Provenance::KeywordProximity => f.write_str("keyword-proximity"),
            Provenance::AiValidated => f.write_str("ai-validated"),
            Provenance::AiFull => f.write_str("ai-full"),
        }
    }
}

/// A named, confidence-scored value extracted from the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedField {
    pub value: String,
    /// Correctness estimate in `[0, 1]`; monotonically non-decreasing across
    /// tiers for the same field.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    pub provenance: Provenance,
    /// Raw block text the value was extracted from (absent for Tier 3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
}

/// Field map keyed by typed field name. `BTreeMap` keeps serialized output
/// in a stable order.
pub type FieldMap = BTreeMap<FieldKind, ExtractedField>;

/// Mean confidence across all extracted fields; 0.0 for an empty map.
pub fn overall_confidence(fields: &FieldMap) -> f64 {
    if fields.is_empty() {
        return 0.0;
    }
    fields.values().map(|f| f.confidence).sum::<f64>() / fields.len() as f64
}

/// Required fields (per the registry) absent from `fields`.
pub fn missing_required(fields: &FieldMap) -> Vec<FieldKind> {
    FieldKind::required_fields()
        .filter(|k| !fields.contains_key(k))
        .collect()
}

/// One stage of the escalation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    /// Local pattern/keyword extraction, zero external calls.
    Tier1,
    /// Selective grouped validation of low-confidence fields.
    Tier2,
    /// Full re-extraction from page images.
    Tier3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Tier1 => f.write_str("tier1"),
            Tier::Tier2 => f.write_str("tier2"),
            Tier::Tier3 => f.write_str("tier3"),
        }
    }
}

/// Per-tier execution record kept for the final output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierDiagnostics {
    pub tier: Tier,
    pub duration_ms: u64,
    pub fields_extracted: usize,
    /// Free-form notes (skipped groups, ignored response fields, …).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Output of the Tier-1 local extractor.
///
/// Carries the raw blocks alongside the fields because Tier 2 needs them to
/// build bounded context windows around each candidate value.
#[derive(Debug, Clone)]
pub struct Tier1Result {
    pub fields: FieldMap,
    pub page_count: usize,
    pub blocks: Vec<TextBlock>,
    pub diagnostics: TierDiagnostics,
}

/// Output of the Tier-2 selective validator. Always produced — on external
/// failure it degrades to the Tier-1 fields with the failure recorded in
/// `errors`, never by aborting the run.
#[derive(Debug, Clone)]
pub struct Tier2Result {
    pub fields: FieldMap,
    pub corrections: Vec<Correction>,
    pub errors: Vec<RunError>,
    /// External calls actually issued (at most one per non-empty group).
    pub calls: u32,
    pub diagnostics: TierDiagnostics,
}

/// Output of the Tier-3 full re-extraction.
#[derive(Debug, Clone)]
pub struct Tier3Result {
    pub fields: FieldMap,
    pub calls: u32,
    pub diagnostics: TierDiagnostics,
}

/// Audit record written whenever Tier 2 changes a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub field: FieldKind,
    pub original: String,
    pub corrected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-run external-call accounting for downstream cost attribution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CallUsage {
    pub validation_calls: u32,
    pub full_extraction_calls: u32,
    /// Estimated cost in the caller's unit (call counts × configured rates).
    pub estimated_cost: f64,
}

impl CallUsage {
    pub fn total_calls(&self) -> u32 {
        self.validation_calls + self.full_extraction_calls
    }
}

/// Run status, also used in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Partial,
}

/// The single owned, serialisable output of a pipeline run.
///
/// A run always produces one of these — tier failures are folded into
/// `status`/`errors` rather than surfaced as a panic or bare `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub document_id: String,
    pub fields: FieldMap,
    pub tiers_executed: Vec<Tier>,
    pub diagnostics: Vec<TierDiagnostics>,
    /// Run-level notes, e.g. why an escalation was skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<Correction>,
    pub total_duration_ms: u64,
    pub usage: CallUsage,
    /// Mean of final field confidences.
    pub overall_confidence: f64,
    pub status: RunStatus,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RunError>,
}

impl ExtractionOutput {
    /// Confidence of a single field, if extracted.
    pub fn confidence_of(&self, kind: FieldKind) -> Option<f64> {
        self.fields.get(&kind).map(|f| f.confidence)
    }

    /// Per-field confidence view, keyed by wire name.
    pub fn confidence_by_field(&self) -> BTreeMap<&'static str, f64> {
        self.fields
            .iter()
            .map(|(k, f)| (k.name(), f.confidence))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldKind;

    fn field(conf: f64) -> ExtractedField {
        ExtractedField {
            value: "x".into(),
            confidence: conf,
            page: Some(1),
            bbox: None,
            provenance: Provenance::Pattern,
            source_text: None,
        }
    }

    #[test]
    fn overall_confidence_empty_is_zero() {
        assert_eq!(overall_confidence(&FieldMap::new()), 0.0);
    }

    #[test]
    fn overall_confidence_is_mean() {
        let mut m = FieldMap::new();
        m.insert(FieldKind::InvoiceNumber, field(0.9));
        m.insert(FieldKind::TotalGross, field(0.7));
        assert!((overall_confidence(&m) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn missing_required_reports_gaps() {
        let mut m = FieldMap::new();
        m.insert(FieldKind::InvoiceNumber, field(0.9));
        let missing = missing_required(&m);
        assert_eq!(missing, vec![FieldKind::TotalGross, FieldKind::VendorName]);
    }

    #[test]
    fn tier_ordering_matches_escalation_order() {
        assert!(Tier::Tier1 < Tier::Tier2);
        assert!(Tier::Tier2 < Tier::Tier3);
    }

    #[test]
    fn field_map_serialises_with_string_keys() {
        let mut m = FieldMap::new();
        m.insert(FieldKind::VendorName, field(0.65));
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("vendor_name").is_some());
    }

    #[test]
    fn provenance_wire_names() {
        assert_eq!(
            serde_json::to_string(&Provenance::AiValidated).unwrap(),
            "\"ai-validated\""
        );
        assert_eq!(
            serde_json::to_string(&Provenance::KeywordProximity).unwrap(),
            "\"keyword-proximity\""
        );
    }
}
