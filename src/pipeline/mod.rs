//! The three extraction tiers.
//!
//! Each tier is a standalone stage with its own result type; the
//! orchestrator decides which ones run and how results combine:
//!
//! 1. [`tier1`] — local regex and keyword-proximity extraction over
//!    positioned text blocks. No I/O, always runs first when text exists.
//! 2. [`tier2`] — selective validation of doubtful fields through an
//!    external service, grouped by semantic family to bound call count.
//! 3. [`tier3`] — full visual re-extraction from rendered page images,
//!    when the cheaper tiers leave overall confidence too low.
//!
//! [`locale`] carries the French-locale parsing shared by the tiers.

pub mod locale;
pub mod tier1;
pub mod tier2;
pub mod tier3;
