//! Typed field registry: every field the pipeline knows how to extract.
//!
//! The registry replaces scattered string-keyed conditionals with one static
//! table built at compile time. Each entry carries everything the tiers need
//! to make decisions about a field: its wire name, the semantic group used to
//! batch validation calls, a static hint describing the expected shape, and
//! the criticality/required flags consulted by the escalation gates.
//!
//! Adding a field means adding one [`FieldKind`] variant and one [`FieldSpec`]
//! row — no tier code changes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A field the pipeline can extract from a document.
///
/// Serialises as its snake_case wire name, so a `BTreeMap<FieldKind, _>`
/// round-trips through JSON as an ordinary string-keyed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Document number, e.g. `FA-2024-001`.
    InvoiceNumber,
    /// Issue (emission) date.
    IssueDate,
    /// Payment due date.
    DueDate,
    /// Grand total, tax included (French "Total TTC").
    TotalGross,
    /// Net total before tax ("Total HT").
    TotalNet,
    /// Tax amount ("TVA").
    TaxAmount,
    /// French 14-digit business establishment identifier.
    Siret,
    /// EU VAT number, e.g. `FR40 123456824`.
    VatNumber,
    /// Bank account identifier printed on the document.
    Iban,
    /// Issuing party.
    VendorName,
    /// Billed party.
    CustomerName,
}

/// Semantic category used to batch low-confidence fields into a single
/// external validation call. At most one call is issued per non-empty group,
/// which is the pipeline's core cost-control mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticGroup {
    Identifiers,
    Amounts,
    Entities,
    Dates,
    Other,
}

impl SemanticGroup {
    pub const ALL: [SemanticGroup; 5] = [
        SemanticGroup::Identifiers,
        SemanticGroup::Amounts,
        SemanticGroup::Entities,
        SemanticGroup::Dates,
        SemanticGroup::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SemanticGroup::Identifiers => "identifiers",
            SemanticGroup::Amounts => "amounts",
            SemanticGroup::Entities => "entities",
            SemanticGroup::Dates => "dates",
            SemanticGroup::Other => "other",
        }
    }
}

impl fmt::Display for SemanticGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one field: wire name, grouping, validation hint,
/// and the flags the escalation gates consult.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub kind: FieldKind,
    /// snake_case name used in wire formats and serialized output.
    pub name: &'static str,
    pub group: SemanticGroup,
    /// Shape/format hint forwarded to the validation service.
    pub hint: &'static str,
    /// Critical fields are validated below a stricter threshold (0.85).
    pub critical: bool,
    /// Required fields force escalation when missing.
    pub required: bool,
}

/// The full registry, one row per [`FieldKind`], in `FieldKind` order.
pub const REGISTRY: [FieldSpec; 11] = [
    FieldSpec {
        kind: FieldKind::InvoiceNumber,
        name: "invoice_number",
        group: SemanticGroup::Identifiers,
        hint: "Alphanumeric document reference, often prefixed FA/FC/INV, e.g. FA-2024-001",
        critical: true,
        required: true,
    },
    FieldSpec {
        kind: FieldKind::IssueDate,
        name: "issue_date",
        group: SemanticGroup::Dates,
        hint: "Emission date in ISO format YYYY-MM-DD; source documents are day-first",
        critical: false,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::DueDate,
        name: "due_date",
        group: SemanticGroup::Dates,
        hint: "Payment due date in ISO format YYYY-MM-DD; never earlier than the issue date",
        critical: false,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::TotalGross,
        name: "total_gross",
        group: SemanticGroup::Amounts,
        hint: "Grand total including tax, decimal point, two decimals, no currency symbol",
        critical: true,
        required: true,
    },
    FieldSpec {
        kind: FieldKind::TotalNet,
        name: "total_net",
        group: SemanticGroup::Amounts,
        hint: "Total before tax (HT), decimal point, two decimals",
        critical: false,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::TaxAmount,
        name: "tax_amount",
        group: SemanticGroup::Amounts,
        hint: "Tax (TVA/VAT) amount, decimal point, two decimals",
        critical: false,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::Siret,
        name: "siret",
        group: SemanticGroup::Identifiers,
        hint: "French SIRET: exactly 14 digits, no separators",
        critical: true,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::VatNumber,
        name: "vat_number",
        group: SemanticGroup::Identifiers,
        hint: "EU VAT id: country code + 2 check chars + 9 digits, e.g. FR40123456824",
        critical: false,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::Iban,
        name: "iban",
        group: SemanticGroup::Identifiers,
        hint: "IBAN without spaces, e.g. FR7630006000011234567890189",
        critical: false,
        required: false,
    },
    FieldSpec {
        kind: FieldKind::VendorName,
        name: "vendor_name",
        group: SemanticGroup::Entities,
        hint: "Legal or trade name of the issuing party, as printed",
        critical: false,
        required: true,
    },
    FieldSpec {
        kind: FieldKind::CustomerName,
        name: "customer_name",
        group: SemanticGroup::Entities,
        hint: "Name of the billed party, as printed",
        critical: false,
        required: false,
    },
];

impl FieldKind {
    pub const ALL: [FieldKind; 11] = [
        FieldKind::InvoiceNumber,
        FieldKind::IssueDate,
        FieldKind::DueDate,
        FieldKind::TotalGross,
        FieldKind::TotalNet,
        FieldKind::TaxAmount,
        FieldKind::Siret,
        FieldKind::VatNumber,
        FieldKind::Iban,
        FieldKind::VendorName,
        FieldKind::CustomerName,
    ];

    /// Registry row for this field.
    pub fn spec(self) -> &'static FieldSpec {
        // REGISTRY is in FieldKind order; keep it that way.
        &REGISTRY[self as usize]
    }

    /// snake_case wire name.
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    pub fn group(self) -> SemanticGroup {
        self.spec().group
    }

    pub fn is_critical(self) -> bool {
        self.spec().critical
    }

    pub fn is_required(self) -> bool {
        self.spec().required
    }

    /// Reverse lookup from a wire name, used when parsing service responses.
    pub fn from_name(name: &str) -> Option<FieldKind> {
        REGISTRY.iter().find(|s| s.name == name).map(|s| s.kind)
    }

    /// Fields the escalation gates treat as mandatory.
    pub fn required_fields() -> impl Iterator<Item = FieldKind> {
        REGISTRY.iter().filter(|s| s.required).map(|s| s.kind)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
