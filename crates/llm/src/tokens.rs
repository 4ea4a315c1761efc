/// Rough token count for budget decisions (~4 bytes per token for code and prose).
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}
