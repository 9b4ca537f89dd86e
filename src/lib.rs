//! # docfields
//!
//! Progressive multi-tier field extraction for business documents.
//!
//! ## Why this crate?
//!
//! Sending every document wholesale to an AI extraction service is slow and
//! expensive, and most documents do not need it: invoice numbers, SIRET
//! codes, IBANs and totals sit next to predictable labels that local
//! patterns read reliably. This crate starts cheap and escalates only when
//! confidence says it must, so the external service sees the doubtful
//! minority of fields instead of the whole corpus.
//!
//! ## Pipeline Overview
//!
//! ```text
//! positioned text blocks
//!  │
//!  ├─ Tier 1  local regex + keyword proximity, confidence per field
//!  │            │  overall < 0.85 or required field missing?
//!  ├─ Tier 2  doubtful fields grouped by semantic family,
//!  │          ≤ 1 external call per non-empty group, concurrent
//!  │            │  overall still < 0.90?
//!  ├─ Tier 3  full re-extraction from rendered page images
//!  │
//!  └─ merge   higher tier wins field-wise → ExtractionOutput
//! ```
//!
//! Each run produces exactly one [`ExtractionOutput`] with per-field
//! provenance, per-tier diagnostics, an audit trail of corrections and
//! external-call accounting. Tier-2 failures degrade the affected group to
//! its Tier-1 values; only Tier-3 failure fails the run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docfields::{run, DocumentInput, PipelineConfig, TextBlock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let blocks = vec![
//!         TextBlock::new("Facture N° FA-2024-001", 1, 50.0, 40.0),
//!         TextBlock::new("Total TTC : 1 234,56 €", 1, 50.0, 600.0),
//!     ];
//!     let config = PipelineConfig::builder().build()?;
//!     let output = run(DocumentInput::new("doc-1", blocks), &config).await;
//!     println!("{}", serde_json::to_string_pretty(&output)?);
//!     Ok(())
//! }
//! ```
//!
//! With no validation provider configured the pipeline stays local: Tier 2
//! and Tier 3 are skipped with a run-level note. Wire an
//! [`HttpValidationProvider`] (or your own [`ValidationProvider`]) into the
//! config to enable escalation.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docfields` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! docfields = { version = "0.3", default-features = false }
//! ```

pub mod config;
pub mod error;
pub mod fields;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod provider;

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{PipelineError, ProviderError, RunError, StoreError};
pub use fields::{FieldKind, FieldSpec, SemanticGroup};
pub use model::{
    overall_confidence, BoundingBox, CallUsage, Correction, ExtractedField, ExtractionOutput,
    FieldMap, FontInfo, Provenance, RunStatus, TextBlock, Tier, TierDiagnostics,
};
pub use orchestrator::{run, DocumentInput};
pub use progress::{progress_stream, ProcessingProgress};
pub use provider::{
    HttpValidationProvider, ResultStore, SuggestionProvider, ValidationProvider,
};
