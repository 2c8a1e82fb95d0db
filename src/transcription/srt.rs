use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::transcription::normalize::Transcript;

/// Longest caption line before wrapping
const MAX_LINE_CHARS: usize = 42;

/// SRT (SubRip Subtitle) entry
#[derive(Debug, Clone, PartialEq)]
pub struct SrtEntry {
    pub index: usize,
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

impl fmt::Display for SrtEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{} --> {}\n{}\n",
            self.index,
            format_timestamp(self.start),
            format_timestamp(self.end),
            self.text
        )
    }
}

/// Build numbered caption entries from a merged transcript's segments
pub fn entries_from_transcript(transcript: &Transcript) -> Vec<SrtEntry> {
    transcript
        .segments
        .iter()
        .filter(|s| s.end > s.start && !s.text.trim().is_empty())
        .enumerate()
        .map(|(i, segment)| SrtEntry {
            index: i + 1,
            start: seconds(segment.start),
            end: seconds(segment.end),
            text: wrap_text(&segment.text, MAX_LINE_CHARS),
        })
        .collect()
}

/// Render a transcript as SubRip text
pub fn render_srt(transcript: &Transcript) -> String {
    entries_from_transcript(transcript)
        .iter()
        .map(|entry| format!("{}\n", entry))
        .collect()
}

/// Write the SubRip rendering of a transcript to disk
pub async fn save_srt(transcript: &Transcript, path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, render_srt(transcript)).await
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or_default()
}

/// Format duration as SRT timestamp (HH:MM:SS,mmm)
pub fn format_timestamp(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let milliseconds = duration.subsec_millis();

    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, milliseconds)
}

/// Wrap text at specified line length
pub fn wrap_text(text: &str, max_line_length: usize) -> String {
    let mut lines = Vec::new();
    let mut current_line = String::new();

    for word in text.split_whitespace() {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= max_line_length {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current_line));
            current_line = word.to_string();
        }
    }

    if !current_line.is_empty() {
        lines.push(current_line);
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::normalize::TranscriptSegment;

    #[test]
    fn test_timestamp_formatting() {
        assert_eq!(format_timestamp(Duration::from_secs(3661)), "01:01:01,000");
        assert_eq!(format_timestamp(Duration::from_millis(1500)), "00:00:01,500");
        assert_eq!(format_timestamp(Duration::ZERO), "00:00:00,000");
    }

    #[test]
    fn test_render_numbers_entries_in_order() {
        let transcript = Transcript {
            segments: vec![
                TranscriptSegment { start: 0.0, end: 2.5, text: "first line".into() },
                TranscriptSegment { start: 600.0, end: 603.25, text: "after the first segment".into() },
            ],
            words: vec![],
            text: "first line after the first segment".into(),
            language: Some("en".into()),
        };

        let srt = render_srt(&transcript);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:02,500\nfirst line\n\n\
             2\n00:10:00,000 --> 00:10:03,250\nafter the first segment\n\n"
        );
    }

    #[test]
    fn test_save_srt_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("talk.srt");
        let transcript = Transcript {
            segments: vec![TranscriptSegment { start: 1.0, end: 2.0, text: "hello".into() }],
            ..Default::default()
        };

        tokio_test::block_on(save_srt(&transcript, &path)).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("1\n00:00:01,000 --> 00:00:02,000\nhello"));
    }

    #[test]
    fn test_text_wrapping() {
        let wrapped = wrap_text("This is a very long line that should be wrapped at a specific length", 20);
        assert!(wrapped.lines().count() > 1);
        assert!(wrapped.lines().all(|line| line.len() <= 20));
    }
}
