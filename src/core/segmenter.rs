//! Splits script text into speech-sized paragraphs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLimits {
    /// Nominal paragraph size. Splitting is driven by `hard_cap` alone.
    pub target_words: usize,
    pub hard_cap: usize,
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self {
            target_words: 55,
            hard_cap: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paragraph {
    pub index: usize,
    pub text: String,
    pub words: usize,
}

fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn close_paragraph(paragraphs: &mut Vec<Paragraph>, sentences: &mut Vec<&str>, words: usize) {
    if sentences.is_empty() {
        return;
    }
    paragraphs.push(Paragraph {
        index: paragraphs.len(),
        text: sentences.join(". "),
        words,
    });
    sentences.clear();
}

/// Greedily packs sentences into paragraphs of at most `hard_cap` words.
/// A sentence is never split, so an oversized sentence stands alone.
pub fn segment(text: &str, limits: SegmentLimits) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0;

    for sentence in split_sentences(text) {
        let words = sentence.split_whitespace().count();
        if current_words > 0 && current_words + words > limits.hard_cap {
            close_paragraph(&mut paragraphs, &mut current, current_words);
            current_words = 0;
        }
        current.push(sentence);
        current_words += words;
    }
    close_paragraph(&mut paragraphs, &mut current, current_words);

    log::debug!(
        "Segmented text into {} paragraphs (target {} words, cap {})",
        paragraphs.len(),
        limits.target_words,
        limits.hard_cap
    );
    paragraphs
}
