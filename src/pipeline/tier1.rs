//! Tier 1: local field extraction from positioned text blocks.
//!
//! Pure function of its input — no I/O, no suspension points, completes even
//! on empty input. Two families of heuristics:
//!
//! * **Pattern matching** — ordered regex tables for structurally
//!   recognisable fields (document number, SIRET, VAT id, IBAN, labelled
//!   amounts, dates). First match wins per field; the contributing block is
//!   recorded so position provenance survives.
//! * **Keyword proximity** — for fields with no reliable shape (vendor and
//!   customer names): find a role-keyword block, take the nearest following
//!   non-keyword block on the same page as the value.
//!
//! Confidence is assigned heuristically: checksum-length identifiers 0.9–0.95,
//! labelled matches ~0.75–0.8, proximity and ambiguous numeric heuristics
//! 0.6–0.7. Values that fail a round-trip parse are rejected outright.

use crate::fields::FieldKind;
use crate::model::{ExtractedField, FieldMap, Provenance, TextBlock, Tier, Tier1Result, TierDiagnostics};
use crate::pipeline::locale;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Instant;
use tracing::debug;

// ── Pattern tables ───────────────────────────────────────────────────────

static RE_INVOICE_LABELLED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:facture|invoice)\s*(?:n[°o]\s*|no\.?\s*|#\s*|num(?:éro)?\.?\s*)?[:.]?\s*([A-Z]{0,5}[-/]?\d[0-9A-Za-z\-/]*)",
    )
    .unwrap()
});

static RE_INVOICE_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b((?:FA|FC|FAC|INV)[-/]?\d{2,}(?:[-/]\d+)*)\b").unwrap());

static RE_SIRET_LABELLED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsiret\b[\s:.]*((?:\d ?){14})").unwrap());

static RE_SIRET_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3} ?\d{3} ?\d{3} ?\d{5})\b").unwrap());

static RE_VAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(FR ?[0-9A-Z]{2} ?\d{3} ?\d{3} ?\d{3})\b").unwrap());

static RE_IBAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(FR\d{2}(?: ?[0-9A-Z]{4}){5} ?[0-9A-Z]{3})\b").unwrap());

static RE_TOTAL_GROSS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:total\s*ttc|net\s*(?:à|a)\s*payer|montant\s*(?:total|d[ûu])|total\s*(?:amount|due)|grand\s*total|amount\s*due)\b",
    )
    .unwrap()
});

static RE_TOTAL_NET_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:total\s*ht|sous[\s-]*total|subtotal|total\s*net)\b").unwrap());

static RE_TAX_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:tva|t\.v\.a\.?|vat|tax\s*amount)\b").unwrap());

static RE_AMOUNT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\d{1,3}(?:[ .,]\d{3})+|\d+)(?:[.,]\d{1,2})?").unwrap()
});

static RE_DATE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(\d{4}-\d{2}-\d{2}|\d{1,2}[/.\-]\d{1,2}[/.\-]\d{2,4}|\d{1,2}(?:er)?\s+[[:alpha:]éèûà]+\s+\d{4})\b",
    )
    .unwrap()
});

static RE_ISSUE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:date\s*(?:de\s*)?(?:facture|facturation|émission|emission)|invoice\s*date|issued?\s*(?:on|le)?)\b",
    )
    .unwrap()
});

static RE_DUE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:échéance|echeance|due\s*date|payable\s*(?:avant|before|by)|date\s*limite)\b")
        .unwrap()
});

const VENDOR_KEYWORDS: [&str; 6] = [
    "fournisseur",
    "émetteur",
    "emetteur",
    "vendeur",
    "vendor",
    "seller",
];

const CUSTOMER_KEYWORDS: [&str; 8] = [
    "client",
    "destinataire",
    "facturé à",
    "facture a",
    "bill to",
    "billed to",
    "customer",
    "adressé à",
];

// ── Entry point ──────────────────────────────────────────────────────────

/// Extract every recognisable field from the blocks. Deterministic; returns
/// an empty field map (overall confidence 0) on empty input.
pub fn extract(blocks: Vec<TextBlock>) -> Tier1Result {
    let start = Instant::now();
    let page_count = blocks.iter().map(|b| b.page).max().unwrap_or(0);

    // NBSP variants fold to plain spaces for matching; the original text is
    // kept for source provenance.
    let normalised: Vec<String> = blocks
        .iter()
        .map(|b| b.text.replace(['\u{00A0}', '\u{202F}', '\u{2009}'], " "))
        .collect();

    let mut fields = FieldMap::new();
    let mut notes = Vec::new();

    extract_identifiers(&blocks, &normalised, &mut fields);
    extract_amounts(&blocks, &normalised, &mut fields, &mut notes);
    extract_dates(&blocks, &normalised, &mut fields);
    extract_parties(&blocks, &normalised, &mut fields);

    debug!(
        fields = fields.len(),
        blocks = blocks.len(),
        pages = page_count,
        "tier1 extraction complete"
    );

    let diagnostics = TierDiagnostics {
        tier: Tier::Tier1,
        duration_ms: start.elapsed().as_millis() as u64,
        fields_extracted: fields.len(),
        notes,
    };

    Tier1Result {
        fields,
        page_count,
        blocks,
        diagnostics,
    }
}

fn make_field(
    value: String,
    confidence: f64,
    provenance: Provenance,
    block: &TextBlock,
) -> ExtractedField {
    ExtractedField {
        value,
        confidence,
        page: Some(block.page),
        bbox: Some(block.bbox),
        provenance,
        source_text: Some(block.text.clone()),
    }
}

// ── Identifiers ──────────────────────────────────────────────────────────

fn extract_identifiers(blocks: &[TextBlock], texts: &[String], fields: &mut FieldMap) {
    // IBAN first: its long digit runs would otherwise satisfy the bare
    // SIRET shape.
    let mut iban_blocks = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        if let Some(caps) = RE_IBAN.captures(text) {
            iban_blocks.push(i);
            fields.entry(FieldKind::Iban).or_insert_with(|| {
                make_field(
                    caps[1].replace(' ', ""),
                    0.9,
                    Provenance::Pattern,
                    &blocks[i],
                )
            });
        }
    }

    for (i, text) in texts.iter().enumerate() {
        if !fields.contains_key(&FieldKind::InvoiceNumber) {
            if let Some(caps) = RE_INVOICE_LABELLED.captures(text) {
                fields.insert(
                    FieldKind::InvoiceNumber,
                    make_field(caps[1].to_string(), 0.85, Provenance::Pattern, &blocks[i]),
                );
            }
        }
        if !fields.contains_key(&FieldKind::Siret) {
            let labelled = RE_SIRET_LABELLED.captures(text).map(|c| (c, 0.95));
            let bare = if iban_blocks.contains(&i) {
                None
            } else {
                RE_SIRET_BARE.captures(text).map(|c| (c, 0.9))
            };
            if let Some((caps, conf)) = labelled.or(bare) {
                let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.len() == 14 {
                    fields.insert(
                        FieldKind::Siret,
                        make_field(digits, conf, Provenance::Pattern, &blocks[i]),
                    );
                }
            }
        }
        if !fields.contains_key(&FieldKind::VatNumber) {
            if let Some(caps) = RE_VAT.captures(text) {
                fields.insert(
                    FieldKind::VatNumber,
                    make_field(caps[1].replace(' ', ""), 0.95, Provenance::Pattern, &blocks[i]),
                );
            }
        }
    }

    // Fallback document-number shapes without a "Facture/Invoice" label.
    if !fields.contains_key(&FieldKind::InvoiceNumber) {
        for (i, text) in texts.iter().enumerate() {
            if let Some(caps) = RE_INVOICE_BARE.captures(text) {
                fields.insert(
                    FieldKind::InvoiceNumber,
                    make_field(caps[1].to_string(), 0.7, Provenance::Pattern, &blocks[i]),
                );
                break;
            }
        }
    }
}

// ── Amounts ──────────────────────────────────────────────────────────────

/// Amount attached to a label: first parseable token after the label in the
/// same block, else the first one in the next block on the same page
/// (label-left / value-right layouts).
fn labelled_amount(
    label: &Regex,
    blocks: &[TextBlock],
    texts: &[String],
) -> Option<(f64, usize)> {
    for (i, text) in texts.iter().enumerate() {
        let Some(m) = label.find(text) else { continue };
        if let Some(v) = first_amount_in(&text[m.end()..]) {
            return Some((v, i));
        }
        if let Some(next) = texts.get(i + 1) {
            if blocks[i + 1].page == blocks[i].page {
                if let Some(v) = first_amount_in(next) {
                    return Some((v, i + 1));
                }
            }
        }
    }
    None
}

/// First token in `text` that plausibly denotes money. Percentage rates
/// ("TVA 20%") and bare integers without a currency marker (years, SIRET
/// digit runs, quantities) do not qualify.
fn first_amount_in(text: &str) -> Option<f64> {
    RE_AMOUNT_TOKEN
        .find_iter(text)
        .find_map(|m| monetary_value(text, &m))
}

fn monetary_value(text: &str, m: &regex::Match<'_>) -> Option<f64> {
    let tail = text[m.end()..].trim_start();
    if tail.starts_with('%') {
        return None;
    }
    let monetary = m.as_str().contains(',')
        || m.as_str().contains('.')
        || tail.starts_with('€')
        || tail.starts_with("EUR");
    if !monetary {
        return None;
    }
    locale::parse_amount(m.as_str())
}

fn extract_amounts(
    blocks: &[TextBlock],
    texts: &[String],
    fields: &mut FieldMap,
    notes: &mut Vec<String>,
) {
    for (kind, label) in [
        (FieldKind::TotalGross, &*RE_TOTAL_GROSS_LABEL),
        (FieldKind::TotalNet, &*RE_TOTAL_NET_LABEL),
        (FieldKind::TaxAmount, &*RE_TAX_LABEL),
    ] {
        if let Some((value, i)) = labelled_amount(label, blocks, texts) {
            fields.insert(
                kind,
                make_field(
                    locale::format_amount(value),
                    0.8,
                    Provenance::Pattern,
                    &blocks[i],
                ),
            );
        }
    }

    // Ambiguous fallback: the largest monetary amount on the document is
    // probably the grand total. Low confidence by construction.
    if !fields.contains_key(&FieldKind::TotalGross) {
        let mut best: Option<(f64, usize)> = None;
        for (i, text) in texts.iter().enumerate() {
            for m in RE_AMOUNT_TOKEN.find_iter(text) {
                if let Some(v) = monetary_value(text, &m) {
                    if best.map_or(true, |(b, _)| v > b) {
                        best = Some((v, i));
                    }
                }
            }
        }
        if let Some((value, i)) = best {
            notes.push("total_gross inferred from largest amount".to_string());
            fields.insert(
                FieldKind::TotalGross,
                make_field(
                    locale::format_amount(value),
                    0.6,
                    Provenance::Pattern,
                    &blocks[i],
                ),
            );
        }
    }
}

// ── Dates ────────────────────────────────────────────────────────────────

fn dates_in(text: &str) -> Vec<NaiveDate> {
    RE_DATE_TOKEN
        .find_iter(text)
        .filter_map(|m| locale::parse_date(m.as_str()))
        .collect()
}

fn extract_dates(blocks: &[TextBlock], texts: &[String], fields: &mut FieldMap) {
    // Labelled dates first. Dates claimed here are excluded from the
    // unlabelled fallback below so a labelled issue date never doubles as
    // the due date (or vice versa).
    let mut assigned: Vec<NaiveDate> = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        if !fields.contains_key(&FieldKind::IssueDate) && RE_ISSUE_LABEL.is_match(text) {
            if let Some(&d) = dates_in(text).first() {
                fields.insert(
                    FieldKind::IssueDate,
                    make_field(d.to_string(), 0.75, Provenance::Pattern, &blocks[i]),
                );
                assigned.push(d);
            }
        }
        if !fields.contains_key(&FieldKind::DueDate) && RE_DUE_LABEL.is_match(text) {
            if let Some(&d) = dates_in(text).first() {
                fields.insert(
                    FieldKind::DueDate,
                    make_field(d.to_string(), 0.75, Provenance::Pattern, &blocks[i]),
                );
                assigned.push(d);
            }
        }
    }

    if fields.contains_key(&FieldKind::IssueDate) && fields.contains_key(&FieldKind::DueDate) {
        return;
    }

    // Unlabelled candidates: earliest is the issue date; the latest becomes
    // the due date only when at least two distinct candidates exist. A lone
    // candidate never fabricates a due date.
    let mut candidates: Vec<(NaiveDate, usize)> = Vec::new();
    for (i, text) in texts.iter().enumerate() {
        for d in dates_in(text) {
            if !assigned.contains(&d) {
                candidates.push((d, i));
            }
        }
    }
    candidates.sort_by_key(|(d, _)| *d);
    candidates.dedup_by_key(|(d, _)| *d);

    let issue_date = if !fields.contains_key(&FieldKind::IssueDate) {
        candidates.first().map(|&(earliest, i)| {
            fields.insert(
                FieldKind::IssueDate,
                make_field(earliest.to_string(), 0.6, Provenance::Pattern, &blocks[i]),
            );
            earliest
        })
    } else {
        assigned.first().copied()
    };
    if candidates.len() >= 2 && !fields.contains_key(&FieldKind::DueDate) {
        let &(latest, i) = candidates.last().unwrap();
        // A due date earlier than the issue date is noise, not a due date.
        if issue_date.map_or(true, |d| latest > d) {
            fields.insert(
                FieldKind::DueDate,
                make_field(latest.to_string(), 0.6, Provenance::Pattern, &blocks[i]),
            );
        }
    }
}

// ── Vendor / customer names ──────────────────────────────────────────────

fn keyword_in(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|k| lower.contains(k))
}

/// Plausible party name: short, mostly letters, not an amount/date/label.
fn looks_like_name(text: &str) -> bool {
    let t = text.trim();
    if t.len() < 3 || t.len() > 80 {
        return false;
    }
    let letters = t.chars().filter(|c| c.is_alphabetic()).count();
    if letters < 3 {
        return false;
    }
    !(RE_TOTAL_GROSS_LABEL.is_match(t)
        || RE_DATE_TOKEN.is_match(t)
        || RE_INVOICE_LABELLED.is_match(t))
}

fn proximity_value(
    blocks: &[TextBlock],
    texts: &[String],
    keywords: &[&str],
) -> Option<(String, usize)> {
    for (i, text) in texts.iter().enumerate() {
        if !keyword_in(text, keywords) || text.len() > 60 {
            continue;
        }
        // "Client : ACME SARL" — value shares the keyword block.
        if let Some((_, rest)) = text.split_once(':') {
            let candidate = rest.trim();
            if looks_like_name(candidate) {
                return Some((first_line(candidate), i));
            }
        }
        // Otherwise the nearest following non-keyword block on the page.
        for (j, next) in texts.iter().enumerate().skip(i + 1) {
            if blocks[j].page != blocks[i].page {
                break;
            }
            if keyword_in(next, &VENDOR_KEYWORDS) || keyword_in(next, &CUSTOMER_KEYWORDS) {
                continue;
            }
            if looks_like_name(next) {
                return Some((first_line(next.trim()), j));
            }
            break;
        }
    }
    None
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}

fn extract_parties(blocks: &[TextBlock], texts: &[String], fields: &mut FieldMap) {
    if let Some((value, i)) = proximity_value(blocks, texts, &VENDOR_KEYWORDS) {
        fields.insert(
            FieldKind::VendorName,
            make_field(value, 0.65, Provenance::KeywordProximity, &blocks[i]),
        );
    }
    if let Some((value, i)) = proximity_value(blocks, texts, &CUSTOMER_KEYWORDS) {
        fields.insert(
            FieldKind::CustomerName,
            make_field(value, 0.65, Provenance::KeywordProximity, &blocks[i]),
        );
    }

    // Letterhead fallback: the topmost name-like block of page 1.
    if !fields.contains_key(&FieldKind::VendorName) {
        if let Some((i, text)) = texts
            .iter()
            .enumerate()
            .find(|(i, t)| blocks[*i].page == 1 && looks_like_name(t))
        {
            fields.insert(
                FieldKind::VendorName,
                make_field(
                    first_line(text.trim()),
                    0.6,
                    Provenance::KeywordProximity,
                    &blocks[i],
                ),
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
