//! Whitespace-boundary re-segmentation of text deltas for continuation runs.
//!
//! With continuation enabled a step only publishes text up to and including its last
//! whitespace run. The trailing partial word stays buffered until more text arrives, possibly
//! from the next `continue` step, so a word is never split across a step boundary.

use crate::continuation::NextStep;
use crate::types::StepKind;

/// Splits `text` at its last whitespace run into `(prefix, whitespace, suffix)`.
///
/// The suffix never contains whitespace; `None` means `text` has no whitespace at all.
pub fn split_on_last_whitespace(text: &str) -> Option<(&str, &str, &str)> {
    let suffix_start = text
        .char_indices()
        .rev()
        .find(|(_, ch)| ch.is_whitespace())
        .map(|(index, ch)| index + ch.len_utf8())?;
    let prefix_end = text[..suffix_start]
        .char_indices()
        .rev()
        .find(|(_, ch)| !ch.is_whitespace())
        .map(|(index, ch)| index + ch.len_utf8())
        .unwrap_or(0);
    Some((
        &text[..prefix_end],
        &text[prefix_end..suffix_start],
        &text[suffix_start..],
    ))
}

/// Segmentation state handed from one step to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitespaceCarry {
    /// Unpublished partial word.
    pub pending: String,
    /// Whether the last published chunk ended in whitespace.
    pub ends_in_whitespace: bool,
}

#[derive(Debug)]
pub struct TextSegmenter {
    enabled: bool,
    buffer: String,
    in_whitespace_prefix: bool,
    ends_in_whitespace: bool,
    published: bool,
    received: String,
}

impl TextSegmenter {
    pub fn new(enabled: bool, carry: WhitespaceCarry) -> Self {
        let in_whitespace_prefix =
            enabled && carry.pending.is_empty() && carry.ends_in_whitespace;
        Self {
            enabled,
            buffer: carry.pending,
            in_whitespace_prefix,
            ends_in_whitespace: carry.ends_in_whitespace,
            published: false,
            received: String::new(),
        }
    }

    /// Accepts one raw delta and returns the text that may be published now.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        if !self.enabled {
            self.received.push_str(delta);
            self.record_published(delta);
            return Some(delta.to_string());
        }

        let delta = if self.in_whitespace_prefix {
            delta.trim_start()
        } else {
            delta
        };
        if delta.is_empty() {
            return None;
        }
        self.in_whitespace_prefix = false;
        self.received.push_str(delta);
        self.buffer.push_str(delta);

        let (publish, rest) = {
            let (prefix, whitespace, suffix) = split_on_last_whitespace(&self.buffer)?;
            (format!("{prefix}{whitespace}"), suffix.to_string())
        };
        self.buffer = rest;
        self.record_published(&publish);
        Some(publish)
    }

    /// Releases the buffered partial word at the end of a step when the run will not
    /// continue it, or when a `continue` step published nothing of its own.
    pub fn flush(&mut self, kind: StepKind, next: NextStep) -> Option<String> {
        if !self.enabled || self.buffer.is_empty() {
            return None;
        }
        let release =
            next != NextStep::Continue || (kind == StepKind::Continue && !self.published);
        if !release {
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        self.record_published(&text);
        Some(text)
    }

    /// Text the model produced in this step, after leading-whitespace trimming.
    pub fn received(&self) -> &str {
        &self.received
    }

    pub fn into_carry(self) -> WhitespaceCarry {
        WhitespaceCarry {
            pending: self.buffer,
            ends_in_whitespace: self.ends_in_whitespace,
        }
    }

    fn record_published(&mut self, text: &str) {
        self.published = true;
        self.ends_in_whitespace = text.chars().last().is_some_and(char::is_whitespace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uses_the_last_whitespace_run() {
        assert_eq!(
            split_on_last_whitespace("The quick br"),
            Some(("The quick", " ", "br"))
        );
        assert_eq!(
            split_on_last_whitespace("a \n\t b"),
            Some(("a", " \n\t ", "b"))
        );
        assert_eq!(split_on_last_whitespace("trailing  "), Some(("trailing", "  ", "")));
        assert_eq!(split_on_last_whitespace("   "), Some(("", "   ", "")));
        assert_eq!(split_on_last_whitespace("word"), None);
    }

    #[test]
    fn split_handles_multibyte_characters() {
        assert_eq!(
            split_on_last_whitespace("größer\u{3000}straße"),
            Some(("größer", "\u{3000}", "straße"))
        );
    }

    #[test]
    fn disabled_segmenter_passes_deltas_through() {
        let mut segmenter = TextSegmenter::new(false, WhitespaceCarry::default());

        assert_eq!(segmenter.push("Hel"), Some("Hel".to_string()));
        assert_eq!(segmenter.push(""), None);
        assert_eq!(segmenter.flush(StepKind::Initial, NextStep::Done), None);
        assert_eq!(segmenter.received(), "Hel");
    }

    #[test]
    fn partial_words_are_held_until_whitespace_arrives() {
        let mut segmenter = TextSegmenter::new(true, WhitespaceCarry::default());

        assert_eq!(segmenter.push("The qu"), Some("The ".to_string()));
        assert_eq!(segmenter.push("ick"), None);
        assert_eq!(segmenter.push(" br"), Some("quick ".to_string()));
        assert_eq!(segmenter.flush(StepKind::Initial, NextStep::Continue), None);

        let carry = segmenter.into_carry();
        assert_eq!(carry.pending, "br");
        assert!(carry.ends_in_whitespace);
    }

    #[test]
    fn final_step_releases_the_buffer() {
        let mut segmenter = TextSegmenter::new(
            true,
            WhitespaceCarry {
                pending: "br".to_string(),
                ends_in_whitespace: true,
            },
        );

        assert_eq!(segmenter.push("own fox"), Some("brown ".to_string()));
        assert_eq!(
            segmenter.flush(StepKind::Continue, NextStep::Done),
            Some("fox".to_string())
        );
        assert_eq!(segmenter.received(), "own fox");
    }

    #[test]
    fn continue_step_without_published_text_releases_the_buffer() {
        let mut segmenter = TextSegmenter::new(true, WhitespaceCarry::default());

        assert_eq!(segmenter.push("Supercali"), None);
        assert_eq!(
            segmenter.flush(StepKind::Continue, NextStep::Continue),
            Some("Supercali".to_string())
        );
    }

    #[test]
    fn leading_whitespace_is_trimmed_after_a_whitespace_boundary() {
        let mut segmenter = TextSegmenter::new(
            true,
            WhitespaceCarry {
                pending: String::new(),
                ends_in_whitespace: true,
            },
        );

        assert_eq!(segmenter.push("  "), None);
        assert_eq!(segmenter.push(" next words"), Some("next ".to_string()));
        assert_eq!(segmenter.push(" more"), Some("words ".to_string()));
        assert_eq!(segmenter.received(), "next words more");
    }

    #[test]
    fn pending_word_disables_leading_trim() {
        let mut segmenter = TextSegmenter::new(
            true,
            WhitespaceCarry {
                pending: "end".to_string(),
                ends_in_whitespace: true,
            },
        );

        assert_eq!(segmenter.push(" start"), Some("end ".to_string()));
    }
}
