//! Validation of raw speech-service responses and merging of per-segment slices.
//!
//! Every timestamp in a [`TranscriptionSlice`] is relative to the start of the
//! audio that produced it; [`merge_slices`] shifts them onto the job timeline.

use serde::{Deserialize, Serialize};

/// Response body as returned by the speech service, nothing trusted yet
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTranscription {
    #[serde(default)]
    pub segments: Option<Vec<RawTimedText>>,
    #[serde(default)]
    pub words: Option<Vec<RawTimedText>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// One timed entry from the service; words use `word` instead of `text`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTimedText {
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(default, alias = "word")]
    pub text: Option<String>,
}

/// Transcript segment with timestamps in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Single word with timestamps in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Normalized result for one segment or sub-segment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSlice {
    pub segments: Vec<TranscriptSegment>,
    pub words: Vec<TranscriptWord>,
    pub text: Option<String>,
    pub language: Option<String>,
}

/// Final merged transcript for a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    pub words: Vec<TranscriptWord>,
    pub text: String,
    pub language: Option<String>,
}

impl TranscriptionSlice {
    /// A slice counts as content only if something was actually heard
    pub fn has_content(&self) -> bool {
        !self.segments.is_empty() || !self.words.is_empty() || self.text.is_some()
    }

    /// Text for joining: explicit text, else the segment texts, else the words
    pub fn joined_text(&self) -> Option<String> {
        if let Some(text) = &self.text {
            return Some(text.clone());
        }
        let from_segments = join_non_empty(self.segments.iter().map(|s| s.text.as_str()));
        if !from_segments.is_empty() {
            return Some(from_segments);
        }
        let from_words = join_non_empty(self.words.iter().map(|w| w.text.as_str()));
        (!from_words.is_empty()).then_some(from_words)
    }

    /// Shift every timestamp by `offset` seconds
    pub fn shifted(mut self, offset: f64) -> Self {
        if offset != 0.0 {
            for segment in &mut self.segments {
                segment.start += offset;
                segment.end += offset;
            }
            for word in &mut self.words {
                word.start += offset;
                word.end += offset;
            }
        }
        self
    }
}

fn join_non_empty<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean_timed(raw: &RawTimedText) -> Option<(f64, f64, String)> {
    let start = raw.start.filter(|s| s.is_finite())?;
    let end = raw.end.filter(|e| e.is_finite())?;
    let text = raw.text.as_deref().map(str::trim).unwrap_or_default();
    if start < 0.0 || end <= start || text.is_empty() {
        return None;
    }
    Some((start, end, text.to_string()))
}

/// Validate a raw response into a slice, dropping entries that break invariants
pub fn normalize(raw: RawTranscription) -> TranscriptionSlice {
    let segments = raw
        .segments
        .unwrap_or_default()
        .iter()
        .filter_map(clean_timed)
        .map(|(start, end, text)| TranscriptSegment { start, end, text })
        .collect();

    let words = raw
        .words
        .unwrap_or_default()
        .iter()
        .filter_map(clean_timed)
        .map(|(start, end, text)| TranscriptWord { start, end, text })
        .collect();

    let text = raw
        .text
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let language = raw
        .language
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty());

    TranscriptionSlice {
        segments,
        words,
        text,
        language,
    }
}

/// Concatenate slices in the order given, each shifted by its offset.
///
/// The merger never re-sorts; callers feed slices in chronological order.
pub fn merge_slices<I>(slices: I) -> Transcript
where
    I: IntoIterator<Item = (TranscriptionSlice, f64)>,
{
    let mut transcript = Transcript::default();
    let mut texts = Vec::new();

    for (slice, offset) in slices {
        let slice = slice.shifted(offset);
        if let Some(text) = slice.joined_text() {
            texts.push(text);
        }
        if transcript.language.is_none() {
            transcript.language = slice.language.clone();
        }
        transcript.segments.extend(slice.segments);
        transcript.words.extend(slice.words);
    }

    transcript.text = join_non_empty(texts.iter().map(String::as_str));
    transcript
}

/// Merge already-shifted slices into a single slice (used for finer splits)
pub fn merge_into_slice<I>(slices: I) -> TranscriptionSlice
where
    I: IntoIterator<Item = (TranscriptionSlice, f64)>,
{
    let merged = merge_slices(slices);
    TranscriptionSlice {
        segments: merged.segments,
        words: merged.words,
        text: (!merged.text.is_empty()).then_some(merged.text),
        language: merged.language,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_seg(start: f64, end: f64, text: &str) -> RawTimedText {
        RawTimedText {
            start: Some(start),
            end: Some(end),
            text: Some(text.to_string()),
        }
    }

    fn slice_with(segments: &[(f64, f64, &str)]) -> TranscriptionSlice {
        normalize(RawTranscription {
            segments: Some(segments.iter().map(|(s, e, t)| raw_seg(*s, *e, t)).collect()),
            ..Default::default()
        })
    }

    #[test]
    fn test_normalize_drops_invalid_entries() {
        let raw = RawTranscription {
            segments: Some(vec![
                raw_seg(0.0, 1.5, "  hello "),
                raw_seg(2.0, 2.0, "zero length"),
                raw_seg(3.0, 4.0, "   "),
                RawTimedText {
                    start: None,
                    end: Some(5.0),
                    text: Some("no start".into()),
                },
                raw_seg(f64::NAN, 6.0, "nan"),
            ]),
            words: Some(vec![raw_seg(0.0, 0.4, "hello"), raw_seg(0.5, 0.4, "backwards")]),
            text: Some("   ".into()),
            language: Some(" EN ".into()),
        };

        let slice = normalize(raw);
        assert_eq!(slice.segments.len(), 1);
        assert_eq!(slice.segments[0].text, "hello");
        assert_eq!(slice.words.len(), 1);
        assert_eq!(slice.text, None);
        assert_eq!(slice.language.as_deref(), Some("en"));
        assert!(slice.has_content());
    }

    #[test]
    fn test_empty_response_has_no_content() {
        let slice = normalize(RawTranscription {
            segments: Some(vec![]),
            words: Some(vec![]),
            text: Some(String::new()),
            language: Some("en".into()),
        });
        assert!(!slice.has_content());
    }

    #[test]
    fn test_words_accept_word_key() {
        let raw: RawTranscription = serde_json::from_str(
            r#"{"words":[{"word":"hi","start":0.1,"end":0.3}],"text":"hi"}"#,
        )
        .unwrap();
        let slice = normalize(raw);
        assert_eq!(slice.words[0].text, "hi");
        assert_eq!(slice.text.as_deref(), Some("hi"));
    }

    #[test]
    fn test_merge_preserves_order_and_shifts_time() {
        let merged = merge_slices(vec![
            (slice_with(&[(0.0, 2.0, "a")]), 0.0),
            (slice_with(&[(0.0, 3.0, "b")]), 2.0),
        ]);

        assert_eq!(
            merged.segments,
            vec![
                TranscriptSegment { start: 0.0, end: 2.0, text: "a".into() },
                TranscriptSegment { start: 2.0, end: 5.0, text: "b".into() },
            ]
        );
        assert_eq!(merged.text, "a b");
    }

    #[test]
    fn test_merge_does_not_resort() {
        let merged = merge_slices(vec![
            (slice_with(&[(0.0, 1.0, "late")]), 10.0),
            (slice_with(&[(0.0, 1.0, "early")]), 0.0),
        ]);
        assert_eq!(merged.segments[0].text, "late");
        assert_eq!(merged.text, "late early");
    }

    #[test]
    fn test_merge_takes_first_detected_language() {
        let mut first = slice_with(&[(0.0, 1.0, "x")]);
        first.language = None;
        let mut second = slice_with(&[(0.0, 1.0, "y")]);
        second.language = Some("de".into());
        let mut third = slice_with(&[(0.0, 1.0, "z")]);
        third.language = Some("fr".into());

        let merged = merge_slices(vec![(first, 0.0), (second, 1.0), (third, 2.0)]);
        assert_eq!(merged.language.as_deref(), Some("de"));
    }

    #[test]
    fn test_explicit_text_wins_over_segments() {
        let mut slice = slice_with(&[(0.0, 1.0, "seg")]);
        slice.text = Some("Full sentence.".into());
        let merged = merge_slices(vec![(slice, 0.0)]);
        assert_eq!(merged.text, "Full sentence.");
    }
}
