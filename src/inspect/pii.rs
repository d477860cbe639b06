//! PII detection: emails, phone numbers, SSNs, credit cards, IP addresses.
//!
//! Candidate matches are regex-driven; credit cards must additionally pass
//! the Luhn check and SSNs the issuance digit rules. Detections are returned
//! as non-overlapping spans — types are scanned in a fixed precedence order
//! and a later type never claims text inside an earlier detection.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    Phone,
    Ssn,
    CreditCard,
    Ip,
}

impl PiiType {
    pub fn placeholder(&self) -> &'static str {
        match self {
            PiiType::Email => "[EMAIL_REDACTED]",
            PiiType::Phone => "[PHONE_REDACTED]",
            PiiType::Ssn => "[SSN_REDACTED]",
            PiiType::CreditCard => "[CREDIT_CARD_REDACTED]",
            PiiType::Ip => "[IP_REDACTED]",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PiiType::Email => "email",
            PiiType::Phone => "phone",
            PiiType::Ssn => "ssn",
            PiiType::CreditCard => "credit_card",
            PiiType::Ip => "ip",
        }
    }
}

/// One detected span. `span` is `[start, end)` in byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct PiiDetection {
    pub kind: PiiType,
    pub text: String,
    pub span: (usize, usize),
}

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap());

// 13-19 digits with optional single space/dash separators.
static CREDIT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").unwrap());

static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{3})-(\d{2})-(\d{4})\b").unwrap());

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b",
    )
    .unwrap()
});

// US with optional country code, plus a loose international form. The word
// boundaries keep the pattern from firing inside longer digit runs (which
// belong to the credit-card detector).
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:1[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b|\b\d{1,3}[-. ]\d{2,4}[-. ]\d{3,4}[-. ]\d{3,6}\b")
        .unwrap()
});

/// Luhn checksum over the digits of `s` (non-digits ignored).
pub fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// SSN issuance rules: area not 000/666/9xx, group not 00, serial not 0000.
fn ssn_plausible(area: &str, group: &str, serial: &str) -> bool {
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

/// Detect PII spans in `text`, optionally restricted to `types`.
pub fn detect(text: &str, types: Option<&[PiiType]>) -> Vec<PiiDetection> {
    let wanted = |t: PiiType| types.map_or(true, |ts| ts.contains(&t));
    let mut found: Vec<PiiDetection> = Vec::new();

    let push_non_overlapping = |kind: PiiType, start: usize, end: usize, found: &mut Vec<PiiDetection>| {
        if found.iter().any(|d| overlaps(d.span, (start, end))) {
            return;
        }
        found.push(PiiDetection { kind, text: text[start..end].to_string(), span: (start, end) });
    };

    if wanted(PiiType::Email) {
        for m in EMAIL_RE.find_iter(text) {
            push_non_overlapping(PiiType::Email, m.start(), m.end(), &mut found);
        }
    }

    if wanted(PiiType::CreditCard) {
        for m in CREDIT_CARD_RE.find_iter(text) {
            if luhn_valid(m.as_str()) {
                push_non_overlapping(PiiType::CreditCard, m.start(), m.end(), &mut found);
            }
        }
    }

    if wanted(PiiType::Ssn) {
        for caps in SSN_RE.captures_iter(text) {
            let (area, group, serial) = (&caps[1], &caps[2], &caps[3]);
            if ssn_plausible(area, group, serial) {
                let m = caps.get(0).unwrap();
                push_non_overlapping(PiiType::Ssn, m.start(), m.end(), &mut found);
            }
        }
    }

    if wanted(PiiType::Ip) {
        for m in IPV4_RE.find_iter(text) {
            push_non_overlapping(PiiType::Ip, m.start(), m.end(), &mut found);
        }
    }

    if wanted(PiiType::Phone) {
        for m in PHONE_RE.find_iter(text) {
            push_non_overlapping(PiiType::Phone, m.start(), m.end(), &mut found);
        }
    }

    found.sort_by_key(|d| d.span.0);
    found
}
