/// Splits `text` into consecutive, non-overlapping chunks of at most `chunk_size` characters.
///
/// A chunk ends at the last newline inside its window when that newline falls in the second
/// half of the window, so lines are kept whole where practical. Concatenating the chunks
/// yields `text` again.
#[must_use]
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let window_end = rest
            .char_indices()
            .nth(chunk_size)
            .map_or(rest.len(), |(idx, _)| idx);
        if window_end == rest.len() {
            chunks.push(rest.to_string());
            break;
        }

        let window = &rest[..window_end];
        let end = window
            .rfind('\n')
            .map(|idx| idx + 1)
            .filter(|end| window[..*end].chars().count() * 2 >= chunk_size)
            .unwrap_or(window_end);

        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", 10).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("fn main() {}", 100), vec!["fn main() {}".to_string()]);
    }

    #[test]
    fn chunks_cover_text_without_overlap() {
        let text = "line one\nline two\nline three\nline four\n".repeat(20);
        let chunks = chunk_text(&text, 50);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn prefers_line_boundaries() {
        let text = "aaaaaaaaa\nbbbbbbbbb\nccc";
        let chunks = chunk_text(text, 15);
        assert_eq!(chunks[0], "aaaaaaaaa\n");
    }

    #[test]
    fn respects_multibyte_characters() {
        let text = "é".repeat(25);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 10);
        assert_eq!(chunks.concat(), text);
    }
}
