pub const DEFAULT_AUGMENT_CONCURRENCY: usize = 3;
pub const MAX_AUGMENT_CONCURRENCY: usize = 32;

pub const CONCURRENCY_ENV: &str = "CONTEXT_INDEX_CONCURRENCY";

pub(crate) fn parse_concurrency(raw: Option<&str>, default_value: usize) -> usize {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
        .clamp(1, MAX_AUGMENT_CONCURRENCY)
}

#[must_use]
pub const fn clamp_concurrency(value: usize) -> usize {
    if value == 0 {
        1
    } else if value > MAX_AUGMENT_CONCURRENCY {
        MAX_AUGMENT_CONCURRENCY
    } else {
        value
    }
}
