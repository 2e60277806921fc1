use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::job::SourceRecord;

/// Heading that opens the reference glossary the generator appends to a survey.
pub const GLOSSARY_MARKER: &str = "###ReferenceMapping###";

/// Inline citation marker: `##<N>$$`.
static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"##(\d+)\$\$").expect("citation marker pattern is valid"));

/// Citation number (1-based) to display label.
pub type CitationMap = BTreeMap<u32, String>;

/// A piece of a processed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Citation(u32),
}

/// A survey body ready for display, plus the labels its citations resolve to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedDocument {
    /// Body with the glossary removed and every marker replaced by `[N]`.
    pub display_document: String,
    pub segments: Vec<Segment>,
    pub citation_map: CitationMap,
}

impl ProcessedDocument {
    /// Label for a citation number, falling back to `Reference N`.
    pub fn label(&self, number: u32) -> Cow<'_, str> {
        match self.citation_map.get(&number) {
            Some(title) => Cow::Borrowed(title.as_str()),
            None => Cow::Owned(fallback_label(number)),
        }
    }

    /// Citation numbers in order of appearance, duplicates included.
    pub fn citations(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Citation(n) => Some(*n),
            Segment::Text(_) => None,
        })
    }

    /// Every distinct cited number with its resolved label, ascending.
    pub fn references(&self) -> Vec<(u32, Cow<'_, str>)> {
        let cited: BTreeSet<u32> = self.citations().collect();
        cited.into_iter().map(|n| (n, self.label(n))).collect()
    }

    /// Render the document with a custom citation renderer.
    pub fn render_with<F>(&self, mut render: F) -> String
    where
        F: FnMut(u32, &str) -> String,
    {
        let mut out = String::with_capacity(self.display_document.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Citation(n) => {
                    let label = self.label(*n);
                    out.push_str(&render(*n, &*label));
                }
            }
        }
        out
    }
}

pub fn fallback_label(number: u32) -> String {
    format!("Reference {}", number)
}

/// Turn a raw survey body into its display form and build the citation map.
///
/// A non-empty `sources` list is the only input to the map (position `i`
/// becomes citation `i + 1`). Without one, the embedded glossary is parsed
/// instead. The glossary is stripped from the display text either way.
pub fn process_document(body: &str, sources: Option<&[SourceRecord]>) -> ProcessedDocument {
    let (text, glossary) = split_glossary(body);

    let citation_map = match sources {
        Some(sources) if !sources.is_empty() => map_from_sources(sources),
        _ => glossary.map(parse_glossary).unwrap_or_default(),
    };

    let segments = segment(&text);
    let display_document = segments
        .iter()
        .map(|s| match s {
            Segment::Text(t) => Cow::Borrowed(t.as_str()),
            Segment::Citation(n) => Cow::Owned(format!("[{}]", n)),
        })
        .collect();

    ProcessedDocument {
        display_document,
        segments,
        citation_map,
    }
}

fn map_from_sources(sources: &[SourceRecord]) -> CitationMap {
    sources
        .iter()
        .zip(1u32..)
        .map(|(source, n)| (n, source.display_title().to_string()))
        .collect()
}

/// Split the body into (display text, glossary section contents).
///
/// The section runs from the marker to the next `###` heading, whether it
/// opens a line or follows the last entry inline, or to the end of the text.
fn split_glossary(body: &str) -> (String, Option<&str>) {
    let Some(start) = body.find(GLOSSARY_MARKER) else {
        return (body.to_string(), None);
    };
    let contents_start = start + GLOSSARY_MARKER.len();
    let end = body[contents_start..]
        .find("###")
        .map(|i| contents_start + i)
        .unwrap_or(body.len());

    let head = body[..start].trim_end();
    let tail = body[end..].trim_start();
    let text = match (head.is_empty(), tail.is_empty()) {
        (_, true) => head.to_string(),
        (true, false) => tail.to_string(),
        (false, false) => format!("{}\n\n{}", head, tail),
    };

    (text, Some(&body[contents_start..end]))
}

/// Extract `##N$$ - title` entries. Entries may share a line.
fn parse_glossary(section: &str) -> CitationMap {
    let markers: Vec<_> = MARKER_RE.captures_iter(section).collect();
    let mut map = CitationMap::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(digits)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Ok(number) = digits.as_str().parse::<u32>() else {
            continue;
        };
        let rest_end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(section.len());

        let Some(title) = section[whole.end()..rest_end].trim_start().strip_prefix('-') else {
            continue;
        };
        let title = title.lines().next().unwrap_or("").trim();
        if title.is_empty() {
            continue;
        }
        map.entry(number).or_insert_with(|| title.to_string());
    }

    map
}

fn segment(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut last = 0;

    for caps in MARKER_RE.captures_iter(text) {
        let (Some(whole), Some(digits)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        // Numbers too large for u32 stay in the text verbatim
        let Ok(number) = digits.as_str().parse::<u32>() else {
            continue;
        };
        if whole.start() > last {
            segments.push(Segment::Text(text[last..whole.start()].to_string()));
        }
        segments.push(Segment::Citation(number));
        last = whole.end();
    }

    if last < text.len() {
        segments.push(Segment::Text(text[last..].to_string()));
    }
    segments
}
