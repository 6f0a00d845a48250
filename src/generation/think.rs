//! Reasoning-tag filter
//!
//! Some models wrap chain-of-thought in `<think>...</think>`. That text must
//! never reach the device, even when a tag is split across stream chunks.

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

/// Streaming filter that drops `<think>` sections
#[derive(Debug, Default)]
pub struct ThinkFilter {
    inside: bool,
    carry: String,
}

impl ThinkFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the text safe to forward now
    ///
    /// A trailing fragment that could be the start of a tag is held back
    /// until the next chunk decides it.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut input = std::mem::take(&mut self.carry);
        input.push_str(chunk);

        let mut out = String::new();
        let mut rest = input.as_str();
        loop {
            let tag = if self.inside { CLOSE } else { OPEN };
            if let Some(pos) = rest.find(tag) {
                if !self.inside {
                    out.push_str(&rest[..pos]);
                }
                rest = &rest[pos + tag.len()..];
                self.inside = !self.inside;
                continue;
            }

            let held = partial_tag_suffix(rest, tag);
            let (ready, pending) = rest.split_at(rest.len() - held);
            if !self.inside {
                out.push_str(ready);
            }
            self.carry = pending.to_string();
            break;
        }
        out
    }

    /// Release anything held back at end of stream
    ///
    /// An unterminated think section is dropped.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        if std::mem::take(&mut self.inside) {
            String::new()
        } else {
            carry
        }
    }

    /// Filter a complete text in one go
    #[must_use]
    pub fn strip(text: &str) -> String {
        let mut filter = Self::new();
        let mut out = filter.push(text);
        out.push_str(&filter.finish());
        out
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| {
            n <= text.len()
                && text.is_char_boundary(text.len() - n)
                && tag.starts_with(&text[text.len() - n..])
        })
        .unwrap_or(0)
}
