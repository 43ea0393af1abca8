// Fallback title/artist guesses for files that carry no usable tags
// Ordered pipeline: cheap delimiter split first, then the regexes

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    pub title: String,
    pub artist: Option<String>,
    pub track_number: Option<u32>,
}

struct NamePattern {
    regex: Regex,
    track_group: Option<usize>,
    artist_group: Option<usize>,
    title_group: usize,
}

pub struct FilenameParser {
    patterns: Vec<NamePattern>,
}

const NOISE: [&str; 10] = [
    "(Official Audio)",
    "(Official Video)",
    "(Official Music Video)",
    "(Official Lyric Video)",
    "(Lyric Video)",
    "(Audio)",
    "(Video)",
    "[Official Audio]",
    "[Official Video]",
    "[Audio]",
];

impl FilenameParser {
    pub fn new() -> Self {
        let mut patterns = Vec::new();

        // "03 - Artist - Title"
        if let Ok(regex) = Regex::new(r"^(\d{1,3})\s*[-.]\s*(.+?)\s+-\s+(.+)$") {
            patterns.push(NamePattern {
                regex,
                track_group: Some(1),
                artist_group: Some(2),
                title_group: 3,
            });
        }

        // "Artist - Title"
        if let Ok(regex) = Regex::new(r"^(.+?)\s+[-–|]\s+(.+)$") {
            patterns.push(NamePattern {
                regex,
                track_group: None,
                artist_group: Some(1),
                title_group: 2,
            });
        }

        // "03 Title" / "03. Title"
        if let Ok(regex) = Regex::new(r"^(\d{1,3})[\s.\-_]+(.+)$") {
            patterns.push(NamePattern {
                regex,
                track_group: Some(1),
                artist_group: None,
                title_group: 2,
            });
        }

        Self { patterns }
    }

    /// `stem` is the file name without extension.
    pub fn parse(&self, stem: &str) -> ParsedName {
        let cleaned = clean_text(stem);
        for pattern in &self.patterns {
            if let Some(caps) = pattern.regex.captures(&cleaned) {
                let title = caps
                    .get(pattern.title_group)
                    .map(|m| clean_text(m.as_str()))
                    .unwrap_or_default();
                if title.is_empty() {
                    continue;
                }
                let artist = pattern
                    .artist_group
                    .and_then(|g| caps.get(g))
                    .map(|m| clean_text(m.as_str()))
                    .filter(|a| !a.is_empty());
                let track_number = pattern
                    .track_group
                    .and_then(|g| caps.get(g))
                    .and_then(|m| m.as_str().parse().ok());
                return ParsedName {
                    title,
                    artist,
                    track_number,
                };
            }
        }

        ParsedName {
            title: if cleaned.is_empty() { stem.to_string() } else { cleaned },
            artist: None,
            track_number: None,
        }
    }
}

impl Default for FilenameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn clean_text(text: &str) -> String {
    let mut cleaned = text.replace('_', " ");
    for noise in &NOISE {
        cleaned = cleaned.replace(noise, "");
    }
    let collapsed: Vec<&str> = cleaned.split_whitespace().collect();
    collapsed
        .join(" ")
        .trim_matches(|c: char| c == '-' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_artist_title() {
        let parsed = FilenameParser::new().parse("21 - blink-182 - TAKE ME IN (Official Lyric Video)");
        assert_eq!(parsed.title, "TAKE ME IN");
        assert_eq!(parsed.artist.as_deref(), Some("blink-182"));
        assert_eq!(parsed.track_number, Some(21));
    }

    #[test]
    fn artist_title() {
        let parsed = FilenameParser::new().parse("The Black Keys - Beautiful People (Stay High)");
        assert_eq!(parsed.title, "Beautiful People (Stay High)");
        assert_eq!(parsed.artist.as_deref(), Some("The Black Keys"));
    }

    #[test]
    fn numbered_title_only() {
        let parsed = FilenameParser::new().parse("07_Interlude");
        assert_eq!(parsed.title, "Interlude");
        assert_eq!(parsed.artist, None);
        assert_eq!(parsed.track_number, Some(7));
    }

    #[test]
    fn bare_name_passes_through() {
        let parsed = FilenameParser::new().parse("Untitled");
        assert_eq!(parsed.title, "Untitled");
        assert_eq!(parsed.artist, None);
    }
}
