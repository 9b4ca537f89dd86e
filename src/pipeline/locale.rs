//! Locale-tolerant parsing of amounts and dates.
//!
//! Source documents mix French and English conventions freely: space (or
//! no-break space) as thousands separator, comma as decimal separator,
//! day-first dates, spelled-out French month names. Every candidate value
//! must survive a round-trip parse here before it becomes a field — a token
//! that merely *looks* numeric is rejected rather than guessed at.

use chrono::NaiveDate;

/// Space-like characters used as digit grouping in French typography.
const GROUPING_SPACES: [char; 4] = [' ', '\u{00A0}', '\u{202F}', '\u{2009}'];

/// Parse a monetary amount written in French or English conventions.
///
/// Accepts `1 200,00`, `1 200,00 €`, `1.200,00`, `1,200.00`, `1200.00`,
/// `12,5`. Returns `None` for anything that does not round-trip as a number.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .chars()
        .filter(|c| !GROUPING_SPACES.contains(c))
        .filter(|c| !matches!(c, '€' | '$' | '£'))
        .collect();
    // Textual currency codes
    for code in ["EUR", "eur", "USD", "usd"] {
        s = s.replace(code, "");
    }
    let s = s.trim().trim_end_matches(['.', ',']).to_string();
    if s.is_empty() {
        return None;
    }

    let commas = s.matches(',').count();
    let dots = s.matches('.').count();

    let normalised = match (commas, dots) {
        (0, 0) => s,
        // Both present: the rightmost separator is the decimal mark.
        (c, d) if c > 0 && d > 0 => {
            let last_comma = s.rfind(',').unwrap_or(0);
            let last_dot = s.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                s.replace('.', "").replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        // Single separator kind: 1-2 trailing digits means decimal mark,
        // groups of exactly 3 mean thousands grouping.
        (_, 0) => normalise_single_separator(&s, ','),
        (0, _) => normalise_single_separator(&s, '.'),
        _ => unreachable!(),
    };

    let value: f64 = normalised.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value)
}

fn normalise_single_separator(s: &str, sep: char) -> String {
    let parts: Vec<&str> = s.split(sep).collect();
    let tail = parts.last().copied().unwrap_or("");
    let decimal = parts.len() == 2 && (1..=2).contains(&tail.len());
    let grouping = parts[1..].iter().all(|p| p.len() == 3);
    if decimal {
        s.replace(sep, ".")
    } else if grouping {
        s.replace(sep, "")
    } else {
        // Mixed group widths: keep only a trailing 2-digit fragment as
        // decimals, otherwise refuse by passing through (parse will fail).
        s.to_string()
    }
}

/// Canonical string form of an amount: decimal point, two decimals.
pub fn format_amount(value: f64) -> String {
    format!("{value:.2}")
}

/// Parse a date written day-first (numeric) or with a spelled-out French or
/// English month name. ISO `YYYY-MM-DD` is also accepted.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();

    for fmt in ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%d/%m/%y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    // "12 janvier 2024" / "12 January 2024"
    let mut parts = s.split_whitespace();
    let day: u32 = parts.next()?.trim_end_matches(['e', 'r']).parse().ok()?;
    let month = month_number(parts.next()?)?;
    let year: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Month number from a French or English month name (case-insensitive,
/// accent-tolerant).
pub fn month_number(name: &str) -> Option<u32> {
    let n = name
        .to_lowercase()
        .replace(['é', 'è'], "e")
        .replace('û', "u");
    let month = match n.as_str() {
        "janvier" | "january" | "jan" => 1,
        "fevrier" | "february" | "feb" => 2,
        "mars" | "march" | "mar" => 3,
        "avril" | "april" | "apr" => 4,
        "mai" | "may" => 5,
        "juin" | "june" | "jun" => 6,
        "juillet" | "july" | "jul" => 7,
        "aout" | "august" | "aug" => 8,
        "septembre" | "september" | "sep" => 9,
        "octobre" | "october" | "oct" => 10,
        "novembre" | "november" | "nov" => 11,
        "decembre" | "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}
