//! Regroups streamed text fragments at natural break points.
//!
//! Token generators emit arbitrary slices of words. The input-streaming
//! endpoint synthesizes better when each message ends at punctuation or a
//! word boundary, so fragments are buffered until a splitter is seen and
//! every emitted chunk ends with a space.

/// Characters after which the buffered text is flushed.
pub const SPLITTERS: &[char] = &[
    '.', ',', '?', '!', ';', ':', '—', '-', '(', ')', '[', ']', '}', ' ',
];

fn ends_with_splitter(text: &str) -> bool {
    text.ends_with(SPLITTERS)
}

fn with_trailing_space(mut text: String) -> String {
    if !text.ends_with(' ') {
        text.push(' ');
    }
    text
}

/// Iterator adapter over text fragments.
pub struct TextChunker<I> {
    fragments: I,
    buffer: String,
    exhausted: bool,
}

impl<I> TextChunker<I>
where
    I: Iterator<Item = String>,
{
    pub fn new(fragments: I) -> Self {
        Self {
            fragments,
            buffer: String::new(),
            exhausted: false,
        }
    }
}

impl<I> Iterator for TextChunker<I>
where
    I: Iterator<Item = String>,
{
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while !self.exhausted {
            let Some(fragment) = self.fragments.next() else {
                self.exhausted = true;
                break;
            };

            if ends_with_splitter(&self.buffer) {
                let out = std::mem::replace(&mut self.buffer, fragment);
                return Some(with_trailing_space(out));
            }

            let mut chars = fragment.chars();
            match chars.next() {
                Some(first) if SPLITTERS.contains(&first) => {
                    let mut out = std::mem::take(&mut self.buffer);
                    out.push(first);
                    self.buffer = chars.as_str().to_string();
                    return Some(with_trailing_space(out));
                }
                _ => self.buffer.push_str(&fragment),
            }
        }

        if self.buffer.is_empty() {
            None
        } else {
            Some(with_trailing_space(std::mem::take(&mut self.buffer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(fragments: &[&str]) -> Vec<String> {
        TextChunker::new(fragments.iter().map(|s| s.to_string())).collect()
    }

    #[test]
    fn test_word_fragments_are_joined_until_boundary() {
        assert_eq!(
            chunk(&["Hel", "lo", " wor", "ld."]),
            vec!["Hello ", "world. "]
        );
    }

    #[test]
    fn test_buffer_ending_with_punctuation_flushes() {
        assert_eq!(
            chunk(&["Hi,", "there", "!"]),
            vec!["Hi, ", "there! "]
        );
    }

    #[test]
    fn test_every_chunk_ends_with_space() {
        let chunks = chunk(&["One", "-two", "(three)", "four"]);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.ends_with(' ')));
        assert_eq!(chunks.concat().replace(' ', ""), "One-two(three)four");
    }

    #[test]
    fn test_em_dash_is_a_splitter() {
        assert_eq!(chunk(&["wait", "—", "what"]), vec!["wait— ", "what "]);
    }

    #[test]
    fn test_empty_input() {
        assert!(chunk(&[]).is_empty());
        assert!(chunk(&["", ""]).is_empty());
    }
}
