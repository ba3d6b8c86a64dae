//! Markdown documents for the knowledge base.

use super::{DocumentRenderer, SubtitleSequence};
use crate::error::Result;
use crate::source::VideoMetadata;
use chrono::Utc;
use std::fmt::Write;

/// File name of the index written beside the documents.
pub const INDEX_FILE: &str = "index.md";

/// Renders a video as a Markdown document with YAML front matter.
#[derive(Debug, Clone, Default)]
pub struct MarkdownRenderer;

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentRenderer for MarkdownRenderer {
    fn render(&self, metadata: &VideoMetadata, subtitles: &SubtitleSequence) -> Result<String> {
        let mut doc = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(doc, "---");
        let _ = writeln!(doc, "video_id: {}", metadata.id);
        let _ = writeln!(doc, "title: {}", yaml_string(&metadata.title));
        let _ = writeln!(doc, "source: {}", metadata.source_url);
        if let Some(channel) = &metadata.channel {
            let _ = writeln!(doc, "channel: {}", yaml_string(channel));
        }
        if let Some(published) = metadata.published_at {
            let _ = writeln!(doc, "published: {}", published.format("%Y-%m-%d"));
        }
        if !metadata.tags.is_empty() {
            let tags: Vec<String> = metadata.tags.iter().map(|t| yaml_string(t)).collect();
            let _ = writeln!(doc, "tags: [{}]", tags.join(", "));
        }
        if let Some(language) = &subtitles.language {
            let _ = writeln!(doc, "language: {}", language);
        }
        let _ = writeln!(doc, "generated_at: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(doc, "---\n");

        let _ = writeln!(doc, "# {}\n", metadata.title);

        let mut facts = Vec::new();
        if let Some(duration) = metadata.duration_seconds {
            facts.push(format!("**Duration:** {}", format_duration(duration as f64)));
        }
        if let Some(views) = metadata.view_count {
            facts.push(format!("**Views:** {}", views));
        }
        if let Some(likes) = metadata.like_count {
            facts.push(format!("**Likes:** {}", likes));
        }
        if !facts.is_empty() {
            let _ = writeln!(doc, "{}\n", facts.join(" · "));
        }

        let description = metadata.description.as_deref().filter(|d| !d.trim().is_empty());
        if let Some(description) = description {
            let _ = writeln!(doc, "## Description\n\n{}\n", description.trim());
        }

        let _ = writeln!(doc, "## Transcript\n");
        if subtitles.is_empty() {
            let _ = writeln!(doc, "_No speech detected._");
        }
        for subtitle in &subtitles.subtitles {
            let at = format_timestamp(subtitle.start_seconds);
            let _ = writeln!(doc, "[{}] {}", at, subtitle.text);
        }

        Ok(doc)
    }

    fn render_index(&self, videos: &[VideoMetadata]) -> Result<String> {
        let mut doc = String::new();
        let _ = writeln!(doc, "# Video index\n");
        let _ = writeln!(
            doc,
            "_{} video(s), generated {}_\n",
            videos.len(),
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );

        for video in videos {
            let title = video.title.replace('[', "\\[").replace(']', "\\]");
            let _ = write!(doc, "- [{}](<{}>)", title, safe_filename(&video.id, &video.title));

            let mut facts = Vec::new();
            if let Some(published) = video.published_at {
                facts.push(published.format("%Y-%m-%d").to_string());
            }
            if let Some(duration) = video.duration_seconds {
                facts.push(format_duration(f64::from(duration)));
            }
            if let Some(channel) = &video.channel {
                facts.push(channel.clone());
            }
            if facts.is_empty() {
                let _ = writeln!(doc);
            } else {
                let _ = writeln!(doc, " · {}", facts.join(" · "));
            }
        }

        Ok(doc)
    }
}

/// File name for a rendered document: `{id}_{title}.md`, title reduced to
/// alphanumerics, spaces, `-` and `_`.
pub fn safe_filename(video_id: &str, title: &str) -> String {
    let safe_title: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let safe_title = safe_title.trim();

    if safe_title.is_empty() {
        format!("{}.md", video_id)
    } else {
        format!("{}_{}.md", video_id, safe_title)
    }
}

/// Timestamp as HH:MM:SS.
fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.0}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1} min", seconds / 60.0)
    } else {
        format!("{:.1} h", seconds / 3600.0)
    }
}

/// Quote a YAML scalar when it contains characters with meaning in YAML.
fn yaml_string(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains([':', '#', '"', '\'', '[', ']', '{', '}', ',', '\n'])
        || value.starts_with([' ', '-', '*', '&', '!', '|', '>', '%', '@']);
    if needs_quotes {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', " "))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Subtitle;

    #[test]
    fn test_safe_filename() {
        assert_eq!(
            safe_filename("BV1", "Rust: ownership/borrowing!"),
            "BV1_Rust ownershipborrowing.md"
        );
        assert_eq!(safe_filename("BV1", "???"), "BV1.md");
        assert_eq!(safe_filename("BV1", "中文 标题"), "BV1_中文 标题.md");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(65.9), "00:01:05");
        assert_eq!(format_timestamp(3725.0), "01:02:05");
    }

    #[test]
    fn test_render_document() {
        let mut meta = VideoMetadata::new("BV1", "Lifetimes: explained", "https://example.com/BV1");
        meta.tags = vec!["rust".into()];
        meta.duration_seconds = Some(754);
        meta.description = Some("A walkthrough.".into());

        let subs = SubtitleSequence::new(vec![
            Subtitle::new(0.0, 3.0, "Hi"),
            Subtitle::new(61.0, 64.0, "Borrowing"),
        ]);
        let doc = MarkdownRenderer::new().render(&meta, &subs).unwrap();

        assert!(doc.starts_with("---\nvideo_id: BV1\n"));
        assert!(doc.contains("title: \"Lifetimes: explained\""));
        assert!(doc.contains("tags: [rust]"));
        assert!(doc.contains("**Duration:** 12.6 min"));
        assert!(doc.contains("## Description\n\nA walkthrough."));
        assert!(doc.contains("[00:00:00] Hi\n[00:01:01] Borrowing"));
    }

    #[test]
    fn test_render_index_links_every_document() {
        let mut first = VideoMetadata::new("BV1", "Lifetimes [part 1]", "https://example.com/BV1");
        first.duration_seconds = Some(90);
        first.channel = Some("rustacean".into());
        let second = VideoMetadata::new("BV2", "Traits", "https://example.com/BV2");

        let index = MarkdownRenderer::new().render_index(&[first, second]).unwrap();

        assert!(index.starts_with("# Video index\n"));
        assert!(index.contains("_2 video(s), generated "));
        assert!(index.contains(
            "- [Lifetimes \\[part 1\\]](<BV1_Lifetimes part 1.md>) · 1.5 min · rustacean\n"
        ));
        assert!(index.contains("- [Traits](<BV2_Traits.md>)\n"));
    }
}
