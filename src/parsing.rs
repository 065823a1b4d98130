use tracing::debug;

use crate::error::NormalizationError;

// Divisors for cpu suffixes; the result is in cores.
const CPU_UNITS: &[(&str, f64)] = &[("m", 1e3), ("u", 1e6), ("n", 1e9)];

// Order matters: binary suffixes (Ki, Mi, ...) are checked before decimal ones (K, M, ...)
const BINARY_UNITS: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];
const DECIMAL_UNITS: &[(&str, f64)] = &[
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("k", 1e3),
];

/// Parse a Kubernetes-style quantity into cores (cpu tokens) or bytes (memory tokens).
///
/// An empty token means "no resource spec" and yields `0.0`.
pub fn normalize_quantity(token: &str) -> Result<f64, NormalizationError> {
    let q = token.trim();
    if q.is_empty() {
        return Ok(0.0);
    }
    let invalid = || NormalizationError::InvalidQuantity(q.to_string());

    for (suf, div) in CPU_UNITS {
        if let Some(stripped) = q.strip_suffix(suf) {
            return parse_finite(stripped).map(|v| v / div).ok_or_else(invalid);
        }
    }
    for (suf, mul) in BINARY_UNITS.iter().chain(DECIMAL_UNITS) {
        if let Some(stripped) = q.strip_suffix(suf) {
            return parse_finite(stripped).map(|v| v * mul).ok_or_else(invalid);
        }
    }
    // a bare decimal is a cpu core count
    if q.contains('.') {
        return parse_finite(q).ok_or_else(invalid);
    }
    if let Ok(bytes) = q.parse::<i64>() {
        return Ok(bytes as f64);
    }
    parse_finite(q).ok_or_else(invalid)
}

/// Like [`normalize_quantity`] but a bad token contributes zero.
pub fn normalize_or_zero(token: &str, field: &str) -> f64 {
    match normalize_quantity(token) {
        Ok(v) => v,
        Err(e) => {
            debug!(field, error = %e, "skipping unparseable quantity");
            0.0
        }
    }
}

/// Parse a percentage cell such as `"12%"`.
pub fn parse_percent(token: &str) -> Result<f64, NormalizationError> {
    let q = token.trim();
    let stripped = q.strip_suffix('%').unwrap_or(q);
    parse_finite(stripped).ok_or_else(|| NormalizationError::InvalidQuantity(q.to_string()))
}

/// `part / whole * 100`, or 0 when the denominator is unknown.
pub fn percent_of(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}
