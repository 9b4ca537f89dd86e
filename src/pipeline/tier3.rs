//! Tier 3: full re-extraction from rendered page images.
//!
//! Last resort. The whole document is re-read visually in a single external
//! call, discarding the cheap tiers' text heuristics. Unlike Tier 2, a
//! failure here is fatal to the run: there is no deeper tier to fall back
//! to, and the caller already decided the cheaper results were inadequate.

use crate::config::PipelineConfig;
use crate::error::{ProviderError, RunError};
use crate::fields::FieldKind;
use crate::model::{
    ExtractedField, FieldMap, Provenance, Tier, Tier3Result, TierDiagnostics,
};
use crate::provider::{FullExtractionRequest, FullExtractionResponse, PageImage, ValidationProvider};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::DynamicImage;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Re-extract every field from page images. Fatal on failure.
pub async fn reextract(
    document_id: &str,
    images: &[DynamicImage],
    config: &PipelineConfig,
    provider: &Arc<dyn ValidationProvider>,
) -> Result<Tier3Result, RunError> {
    let start = Instant::now();

    if images.is_empty() {
        return Err(RunError::FullExtraction {
            detail: "no page images available for full re-extraction".to_string(),
        });
    }

    let page_images = encode_pages(images)?;
    debug!(pages = page_images.len(), "tier3: dispatching full re-extraction");

    let request = FullExtractionRequest {
        document_id: document_id.to_string(),
        page_images,
    };
    let response = call_with_retry(provider, request, config).await?;

    let mut fields = FieldMap::new();
    let mut notes = Vec::new();
    for (name, value) in response.fields {
        let Some(kind) = FieldKind::from_name(&name) else {
            notes.push(format!("ignored unknown field '{name}'"));
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        fields.insert(
            kind,
            ExtractedField {
                value,
                confidence: config.full_extraction_confidence,
                page: None,
                bbox: None,
                provenance: Provenance::AiFull,
                source_text: None,
            },
        );
    }

    let extracted = fields.len();
    Ok(Tier3Result {
        fields,
        calls: 1,
        diagnostics: TierDiagnostics {
            tier: Tier::Tier3,
            duration_ms: start.elapsed().as_millis() as u64,
            fields_extracted: extracted,
            notes,
        },
    })
}

/// PNG-encode each page and wrap it as base64 for the wire.
fn encode_pages(images: &[DynamicImage]) -> Result<Vec<PageImage>, RunError> {
    images
        .iter()
        .enumerate()
        .map(|(i, img)| {
            let mut buf = Cursor::new(Vec::new());
            img.write_to(&mut buf, image::ImageFormat::Png)
                .map_err(|e| RunError::FullExtraction {
                    detail: format!("failed to encode page {}: {e}", i + 1),
                })?;
            Ok(PageImage {
                page: i + 1,
                mime_type: "image/png".to_string(),
                data: STANDARD.encode(buf.into_inner()),
            })
        })
        .collect()
}

async fn call_with_retry(
    provider: &Arc<dyn ValidationProvider>,
    request: FullExtractionRequest,
    config: &PipelineConfig,
) -> Result<FullExtractionResponse, RunError> {
    let mut last_err = String::new();

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!("tier3 retry {attempt}/{} after {backoff}ms", config.max_retries);
            sleep(Duration::from_millis(backoff)).await;
        }

        let call = provider.extract_full(request.clone());
        match timeout(Duration::from_secs(config.api_timeout_secs), call).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(ProviderError::Malformed(detail))) => {
                return Err(RunError::FullExtraction {
                    detail: format!("malformed response: {detail}"),
                });
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

    Err(RunError::FullExtraction { detail: last_err })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_base64_png() {
        let img = DynamicImage::new_rgb8(4, 4);
        let pages = encode_pages(&[img]).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 1);
        assert_eq!(pages[0].mime_type, "image/png");
        let raw = STANDARD.decode(&pages[0].data).unwrap();
        // PNG signature.
        assert_eq!(&raw[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn pages_are_numbered_from_one() {
        let imgs = vec![DynamicImage::new_rgb8(2, 2), DynamicImage::new_rgb8(2, 2)];
        let pages = encode_pages(&imgs).unwrap();
        assert_eq!(pages[0].page, 1);
        assert_eq!(pages[1].page, 2);
    }
}
