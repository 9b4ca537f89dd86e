//! External collaborator seams: the validation/extraction service, the
//! optional suggestion provider, and the persistence collaborator.
//!
//! The pipeline never talks HTTP directly — it calls `Arc<dyn
//! ValidationProvider>`, so tests inject a mock and production injects
//! [`HttpValidationProvider`] (a thin reqwest client). The provider is a
//! shared singleton from the caller's perspective: one instance, one
//! connection pool, any number of concurrent document runs.
//!
//! Two request shapes exist, matching the two escalation paths:
//!
//! * **Group validation** — a handful of low-confidence fields with bounded
//!   context, one call per semantic group.
//! * **Full extraction** — the entire document as base64 page images, one
//!   call, last resort.

use crate::error::{ProviderError, StoreError};
use crate::fields::SemanticGroup;
use crate::model::ExtractionOutput;
use crate::fields::FieldKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ── Wire types ───────────────────────────────────────────────────────────

/// One field submitted for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldQuery {
    /// Wire name, e.g. `total_gross`.
    pub name: String,
    /// Current Tier-1 value; `None` asks the service to supply a missing
    /// required field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
    pub confidence: f64,
    /// Bounded window of document text around the candidate, never the full
    /// document.
    pub context: String,
    /// Expected-shape hints (registry hint plus any injected suggestions).
    pub hints: Vec<String>,
}

/// One external call covering every selected field of a semantic group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupValidationRequest {
    pub document_id: String,
    pub group: SemanticGroup,
    pub fields: Vec<FieldQuery>,
}

/// Corrected (or confirmed) value for one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectedField {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Response to a group validation call: wire name → corrected value.
/// Fields absent from the map keep their local values and confidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupValidationResponse {
    #[serde(default)]
    pub fields: BTreeMap<String, CorrectedField>,
}

/// One base64-encoded page bitmap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageImage {
    /// 1-indexed page number.
    pub page: usize,
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

/// Full-document re-extraction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullExtractionRequest {
    pub document_id: String,
    pub page_images: Vec<PageImage>,
}

/// Full-document response: wire name → extracted value. Unknown names are
/// ignored (with a diagnostic note) rather than rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullExtractionResponse {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

// ── Service trait ────────────────────────────────────────────────────────

/// The external validation/extraction service. Both operations are fallible,
/// rate-limited, billable calls; the orchestrator tracks per-run usage.
#[async_trait::async_trait]
pub trait ValidationProvider: Send + Sync {
    /// Validate/correct one semantic group of low-confidence fields.
    async fn validate_group(
        &self,
        request: GroupValidationRequest,
    ) -> Result<GroupValidationResponse, ProviderError>;

    /// Re-extract the whole document from page images.
    async fn extract_full(
        &self,
        request: FullExtractionRequest,
    ) -> Result<FullExtractionResponse, ProviderError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// Reference `ValidationProvider` speaking JSON over HTTP.
///
/// POSTs `GroupValidationRequest` to `{endpoint}/v1/validate` and
/// `FullExtractionRequest` to `{endpoint}/v1/extract`, with an optional
/// bearer token. Request timeouts belong to the pipeline (which wraps each
/// call in `tokio::time::timeout`), so the inner client only carries a
/// generous connect timeout.
pub struct HttpValidationProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpValidationProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, ProviderError> {
        let url = format!("{}{}", self.endpoint, path);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ValidationProvider for HttpValidationProvider {
    async fn validate_group(
        &self,
        request: GroupValidationRequest,
    ) -> Result<GroupValidationResponse, ProviderError> {
        self.post_json("/v1/validate", &request).await
    }

    async fn extract_full(
        &self,
        request: FullExtractionRequest,
    ) -> Result<FullExtractionResponse, ProviderError> {
        self.post_json("/v1/extract", &request).await
    }
}

// ── Optional collaborators ───────────────────────────────────────────────

/// Optional source of extra per-field hints, e.g. a subsystem that learned
/// correction patterns from historical runs. Consulted when building a
/// validation request; the pipeline core stays independent of any learning
/// or storage machinery behind it.
pub trait SuggestionProvider: Send + Sync {
    /// Extra hint for `field` given its current candidate value, if any.
    fn suggest(&self, field: FieldKind, current_value: Option<&str>) -> Option<String>;
}

/// Persistence collaborator. Receives the final output exactly once per run,
/// after merge, on every path including failure.
#[async_trait::async_trait]
pub trait ResultStore: Send + Sync {
    async fn store(&self, output: &ExtractionOutput) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_request_wire_shape() {
        let req = GroupValidationRequest {
            document_id: "doc-9".into(),
            group: SemanticGroup::Amounts,
            fields: vec![FieldQuery {
                name: "total_gross".into(),
                current_value: Some("1200.00".into()),
                confidence: 0.6,
                context: "Total TTC: 1 200,00 €".into(),
                hints: vec!["two decimals".into()],
            }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["group"], "amounts");
        assert_eq!(json["fields"][0]["name"], "total_gross");
        assert_eq!(json["fields"][0]["current_value"], "1200.00");
    }

    #[test]
    fn missing_field_query_omits_value() {
        let q = FieldQuery {
            name: "vendor_name".into(),
            current_value: None,
            confidence: 0.0,
            context: String::new(),
            hints: vec![],
        };
        let json = serde_json::to_value(&q).unwrap();
        assert!(json.get("current_value").is_none());
    }

    #[test]
    fn response_tolerates_missing_fields_key() {
        let resp: GroupValidationResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.fields.is_empty());
        let resp: FullExtractionResponse =
            serde_json::from_str(r#"{"fields":{"invoice_number":"FA-1"}}"#).unwrap();
        assert_eq!(resp.fields["invoice_number"], "FA-1");
    }

    #[test]
    fn endpoint_trailing_slash_is_normalised() {
        let p = HttpValidationProvider::new("https://api.example.test/", None).unwrap();
        assert_eq!(p.endpoint, "https://api.example.test");
    }
}
