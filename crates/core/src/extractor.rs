use crate::error::IngestError;
use lopdf::Document;
use regex::{Captures, Regex};
use std::path::Path;
use std::sync::Arc;

/// Text pulled out of a source file plus whatever structure the format exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedText {
    pub text: String,
    pub title: Option<String>,
    pub section_path: Option<String>,
}

pub trait DocumentExtractor: Send + Sync {
    /// Lower-case file extensions this extractor accepts.
    fn extensions(&self) -> &[&'static str];

    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError>;
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        Ok(pages)
    }
}

impl DocumentExtractor for PdfExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let pages = self.extract_pages(path)?;
        let text = pages
            .into_iter()
            .map(|page| page.text)
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(ExtractedText {
            text,
            ..ExtractedText::default()
        })
    }
}

/// Plain text, Markdown and AsciiDoc. Headings stay in the text for the
/// chunker; the first top-level heading becomes the title.
#[derive(Debug, Default)]
pub struct PlainTextExtractor;

impl DocumentExtractor for PlainTextExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["txt", "text", "log", "csv", "md", "markdown", "adoc", "asciidoc", "rst"]
    }

    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let title = match extension_of(path).as_deref() {
            Some("md" | "markdown") => first_heading(&text, "# "),
            Some("adoc" | "asciidoc") => first_heading(&text, "= "),
            _ => None,
        };

        Ok(ExtractedText {
            text,
            title,
            section_path: None,
        })
    }
}

fn first_heading(text: &str, marker: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(marker))
        .map(|heading| heading.trim().to_string())
        .filter(|heading| !heading.is_empty())
}

/// Tag-stripping HTML extraction. `<h1>`..`<h6>` are rewritten as Markdown
/// headings so sections survive into chunk context.
#[derive(Debug, Clone)]
pub struct HtmlExtractor {
    title: Regex,
    script_style: Regex,
    heading: Regex,
    block: Regex,
    tag: Regex,
}

impl HtmlExtractor {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")?,
            script_style: Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<head\b.*?</head>")?,
            heading: Regex::new(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]>")?,
            block: Regex::new(r"(?i)</?(p|div|br|li|ul|ol|tr|table|section|article|header|footer|pre|blockquote)\b[^>]*>")?,
            tag: Regex::new(r"(?s)<[^>]+>")?,
        })
    }

    pub fn html_to_text(&self, html: &str) -> ExtractedText {
        let title = self
            .title
            .captures(html)
            .and_then(|captures| captures.get(1))
            .map(|found| decode_entities(&self.tag.replace_all(found.as_str(), "")))
            .map(|title| title.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|title| !title.is_empty());

        let body = self.script_style.replace_all(html, " ");
        let body = self.heading.replace_all(&body, |captures: &Captures| {
            let level = captures
                .get(1)
                .and_then(|level| level.as_str().parse::<usize>().ok())
                .unwrap_or(1);
            let inner = self.tag.replace_all(captures.get(2).map_or("", |m| m.as_str()), "");
            let inner = inner.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("\n\n{} {}\n\n", "#".repeat(level), inner)
        });
        let body = self.block.replace_all(&body, "\n");
        let body = self.tag.replace_all(&body, " ");

        ExtractedText {
            text: decode_entities(&body),
            title,
            section_path: None,
        }
    }
}

impl DocumentExtractor for HtmlExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["html", "htm", "xhtml"]
    }

    fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let bytes = std::fs::read(path)?;
        Ok(self.html_to_text(&String::from_utf8_lossy(&bytes)))
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Dispatches to the extractor registered for a file's extension.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: Vec<Arc<dyn DocumentExtractor>>,
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let extensions: Vec<&str> = self
            .extractors
            .iter()
            .flat_map(|extractor| extractor.extensions().iter().copied())
            .collect();
        f.debug_struct("ExtractorRegistry")
            .field("extensions", &extensions)
            .finish()
    }
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Result<Self, IngestError> {
        Ok(Self::new()
            .register(Arc::new(PdfExtractor))
            .register(Arc::new(PlainTextExtractor))
            .register(Arc::new(HtmlExtractor::new()?)))
    }

    /// Later registrations win for shared extensions.
    pub fn register(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractors.insert(0, extractor);
        self
    }

    fn find(&self, path: &Path) -> Option<&Arc<dyn DocumentExtractor>> {
        let extension = extension_of(path)?;
        self.extractors
            .iter()
            .find(|extractor| extractor.extensions().contains(&extension.as_str()))
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.find(path).is_some()
    }

    pub fn extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        match self.find(path) {
            Some(extractor) => extractor.extract(path),
            None => Err(IngestError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn markdown_title_comes_from_first_heading() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("guide.md");
        fs::write(&path, "intro line\n# Pump Guide\n\nbody\n## Later")?;

        let extracted = PlainTextExtractor.extract(&path)?;
        assert_eq!(extracted.title.as_deref(), Some("Pump Guide"));
        assert!(extracted.text.contains("## Later"));
        Ok(())
    }

    #[test]
    fn plain_text_has_no_title() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "# not a title in txt")?;

        assert_eq!(PlainTextExtractor.extract(&path)?.title, None);
        Ok(())
    }

    #[test]
    fn html_is_stripped_and_headings_kept() -> Result<(), Box<dyn std::error::Error>> {
        let extractor = HtmlExtractor::new()?;
        let html = "<html><head><title>Valve &amp; Pump</title><style>p{}</style></head>\
                    <body><h2 class=\"x\">Setup <b>steps</b></h2><p>Open&nbsp;the valve.</p>\
                    <script>alert(1)</script></body></html>";

        let extracted = extractor.html_to_text(html);
        assert_eq!(extracted.title.as_deref(), Some("Valve & Pump"));
        assert!(extracted.text.contains("## Setup steps"));
        assert!(extracted.text.contains("Open the valve."));
        assert!(!extracted.text.contains("alert"));
        assert!(!extracted.text.contains('<'));
        Ok(())
    }

    #[test]
    fn registry_rejects_unknown_extensions() -> Result<(), Box<dyn std::error::Error>> {
        let registry = ExtractorRegistry::with_defaults()?;
        assert!(registry.supports(Path::new("a.PDF")));
        assert!(registry.supports(Path::new("b.md")));
        assert!(!registry.supports(Path::new("c.exe")));
        assert!(matches!(
            registry.extract(Path::new("c.exe")),
            Err(IngestError::UnsupportedFormat(_))
        ));
        Ok(())
    }

    #[test]
    fn unreadable_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("unreadable.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(
            PdfExtractor.extract(&path),
            Err(IngestError::PdfParse(_))
        ));
        Ok(())
    }
}
