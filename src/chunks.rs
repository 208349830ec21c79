//! Splitting event records into overlapping, retrievable text windows.

use crate::corpus::models::{EventRecord, format_timestamp};
use crate::corpus::store::Document;
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};

/// Separators tried in order; the empty separator splits per character.
const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Provenance copied from the owning event onto every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Store id of the source document.
    pub event_id: String,
    pub uid: String,
    pub agenda_uid: String,
    pub title: String,
    pub city: Option<String>,
    pub department: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub keywords: Vec<String>,
    pub conditions: Option<String>,
    pub status: Option<String>,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Recursive character splitter with overlap.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(ConfigError::Invalid("chunk size must be greater than zero".into()).into());
        }
        if overlap_chars >= max_chars {
            return Err(ConfigError::Invalid(format!(
                "chunk overlap ({overlap_chars}) must be smaller than chunk size ({max_chars})"
            ))
            .into());
        }
        Ok(Self {
            max_chars,
            overlap_chars,
        })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Format `record` and cut it into chunks carrying its metadata.
    pub fn split(&self, doc_id: i64, record: &EventRecord) -> Vec<Chunk> {
        let metadata = metadata(doc_id, record);
        self.split_text(&format_event(record))
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                id: format!("{}:{}:{index}", record.uid, record.agenda_uid),
                text,
                metadata: ChunkMetadata {
                    chunk_index: index,
                    ..metadata.clone()
                },
            })
            .collect()
    }

    /// Chunk every decodable stored event, in store order.
    pub fn split_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for document in documents {
            match EventRecord::from_value(&document.body, None) {
                Ok(record) => chunks.extend(self.split(document.doc_id, &record)),
                Err(reason) => {
                    tracing::warn!(doc_id = document.doc_id, %reason, "skipping undecodable event");
                }
            }
        }
        chunks
    }

    /// Split text, preferring the coarsest separator that keeps pieces under
    /// the size limit.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (separator, finer) = match separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
        {
            Some(index) => (separators[index], &separators[index + 1..]),
            None => ("", &[][..]),
        };

        let pieces = split_keeping_separator(text, separator);
        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) < self.max_chars {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }
            if finer.is_empty() {
                chunks.push(piece.trim().to_string());
            } else {
                chunks.extend(self.split_recursive(piece, finer));
            }
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }

        chunks.retain(|chunk| !chunk.is_empty());
        chunks
    }

    /// Greedily pack pieces into windows; each new window starts with the
    /// trailing pieces of the previous one, up to the overlap budget.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut merged = Vec::new();
        let mut window: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0_usize;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.max_chars && !window.is_empty() {
                push_trimmed(&mut merged, window.iter().copied().collect::<String>());
                while total > self.overlap_chars || (total + len > self.max_chars && total > 0) {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += len;
        }

        push_trimmed(&mut merged, window.iter().copied().collect::<String>());
        merged
    }
}

fn push_trimmed(out: &mut Vec<String>, text: String) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split on `separator`, attaching each separator to the start of the piece
/// that follows it. The empty separator splits into characters.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(start, ch)| &text[start..start + ch.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            pieces.push(&text[start..index]);
        }
        start = index;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Labelled plain-text rendering of an event.
pub fn format_event(record: &EventRecord) -> String {
    let mut parts = vec![
        format!("Title: {}", record.title.as_deref().unwrap_or("Untitled")),
        format!("Date: {}", record.date_range.as_deref().unwrap_or_default()),
        format!("Conditions: {}", record.conditions.as_deref().unwrap_or_default()),
    ];

    if let Some(description) = record.description.as_deref().filter(|d| !d.is_empty()) {
        parts.push(format!("\nDescription: {description}"));
    }
    if let Some(details) = record.long_description.as_deref().filter(|d| !d.is_empty()) {
        parts.push(format!("\nDetails: {details}"));
    }
    if let Some(location) = &record.location {
        parts.push(format!(
            "\nVenue: {}\nAddress: {}\nCity: {}\nRegion: {}",
            location.name.as_deref().unwrap_or_default(),
            location.address.as_deref().unwrap_or_default(),
            location.city.as_deref().unwrap_or_default(),
            location.region.as_deref().unwrap_or_default(),
        ));
    }
    if !record.keywords.is_empty() {
        parts.push(format!("\nKeywords: {}", record.keywords.join(", ")));
    }
    if let Some(mode) = record.attendance_mode.as_deref().filter(|m| !m.is_empty()) {
        parts.push(format!("\nAttendance: {mode}"));
    }

    parts.join("\n").trim().to_string()
}

fn metadata(doc_id: i64, record: &EventRecord) -> ChunkMetadata {
    let location = record.location.clone().unwrap_or_default();
    ChunkMetadata {
        event_id: doc_id.to_string(),
        uid: record.uid.clone(),
        agenda_uid: record.agenda_uid.clone(),
        title: record.title.clone().unwrap_or_default(),
        city: location.city,
        department: location.department,
        region: location.region,
        postal_code: location.postal_code,
        latitude: location.latitude,
        longitude: location.longitude,
        start_date: record
            .first_timing
            .as_ref()
            .and_then(|t| t.begin)
            .map(format_timestamp),
        end_date: record
            .last_timing
            .as_ref()
            .and_then(|t| t.end)
            .map(format_timestamp),
        keywords: record.keywords.clone(),
        conditions: record.conditions.clone(),
        status: record.status.clone(),
        chunk_index: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunker, format_event, split_keeping_separator};
    use crate::corpus::models::{EventRecord, Location};

    fn event(long_description: &str) -> EventRecord {
        EventRecord {
            uid: "e1".into(),
            agenda_uid: "a1".into(),
            title: Some("Festival".into()),
            date_range: Some("1 - 3 juin".into()),
            long_description: Some(long_description.into()),
            location: Some(Location {
                city: Some("Albi".into()),
                region: Some("Occitanie".into()),
                ..Location::default()
            }),
            keywords: vec!["musique".into(), "plein air".into()],
            ..EventRecord::default()
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(100, 100).is_err());
        assert!(Chunker::new(100, 150).is_err());
        assert!(Chunker::new(100, 99).is_ok());
    }

    #[test]
    fn separator_starts_following_piece() {
        assert_eq!(split_keeping_separator("a b c", " "), vec!["a", " b", " c"]);
        assert_eq!(split_keeping_separator("ab", ""), vec!["a", "b"]);
    }

    #[test]
    fn short_record_is_one_chunk() {
        let chunker = Chunker::new(2000, 100).expect("chunker");
        let record = event("Un concert en plein air.");
        let chunks = chunker.split(7, &record);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, format_event(&record));
        assert_eq!(chunks[0].metadata.event_id, "7");
        assert_eq!(chunks[0].metadata.city.as_deref(), Some("Albi"));
    }

    #[test]
    fn long_record_respects_size_and_overlap() {
        let chunker = Chunker::new(120, 30).expect("chunker");
        let words: Vec<String> = (0..120).map(|i| format!("mot{i}")).collect();
        let record = event(&words.join(" "));
        let chunks = chunker.split(1, &record);

        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 120, "chunk too long: {}", chunk.text);
            assert_eq!(chunk.metadata.uid, "e1");
            assert_eq!(chunk.metadata.keywords, vec!["musique", "plein air"]);
        }
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.chunk_index, index);
        }

        // Chunk 0 is the header; consecutive windows inside the description
        // share words.
        assert!(chunks[1].text.starts_with("Details:"));
        let first_word = chunks[2].text.split(' ').next().expect("word");
        assert!(first_word.starts_with("mot"));
        assert!(chunks[1].text.contains(first_word));
    }

    #[test]
    fn unbreakable_text_falls_back_to_characters() {
        let chunker = Chunker::new(10, 2).expect("chunker");
        let chunks = chunker.split_text(&"x".repeat(25));
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.first().map(String::as_str), Some("xxxxxxxxxx"));
    }
}
