use anyhow::{Result, anyhow};
use ::scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};

/// Elements whose whole subtree is ignored when extracting content.
const STRIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "meta", "link",
];

/// Candidate main-content containers, highest priority first.
const CONTENT_SELECTORS: &[&str] = &[
    "main",
    "article",
    ".content",
    ".main-content",
    "#content",
    ".post-content",
    ".entry-content",
    "[role=\"main\"]",
];

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];
const DEFAULT_SECTION_HEADING: &str = "Main Content";
pub const MISSING_TITLE: &str = "No Title Found";
const MIN_PARAGRAPH_CHARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub title: String,
    pub url: String,
    pub content: Vec<Section>,
    pub metadata: PageMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub content: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_description: Option<String>,
}

impl PageMetadata {
    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Present fields in their canonical order.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("description", &self.description),
            ("keywords", &self.keywords),
            ("og_title", &self.og_title),
            ("og_description", &self.og_description),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_deref().map(|value| (key, value)))
    }
}

/// Turns raw HTML into a title, heading-delimited sections and a few meta
/// tags. Selectors are compiled once and shared across requests.
pub struct ContentParser {
    title: Selector,
    h1: Selector,
    body: Selector,
    content: Vec<Selector>,
    description: Selector,
    keywords: Selector,
    og_title: Selector,
    og_description: Selector,
}

impl ContentParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            title: compile("title")?,
            h1: compile("h1")?,
            body: compile("body")?,
            content: CONTENT_SELECTORS
                .iter()
                .map(|css| compile(css))
                .collect::<Result<_>>()?,
            description: compile("meta[name=\"description\"]")?,
            keywords: compile("meta[name=\"keywords\"]")?,
            og_title: compile("meta[property=\"og:title\"]")?,
            og_description: compile("meta[property=\"og:description\"]")?,
        })
    }

    pub fn parse_html(&self, html: &str, url: &str) -> ScrapedPage {
        let document = Html::parse_document(html);
        ScrapedPage {
            title: self.extract_title(&document),
            url: url.to_string(),
            content: extract_sections(self.main_content(&document)),
            metadata: self.extract_metadata(&document),
        }
    }

    fn extract_title(&self, document: &Html) -> String {
        document
            .select(&self.title)
            .next()
            .or_else(|| document.select(&self.h1).next())
            .map(|element| clean_text(&element.text().collect::<String>()))
            .unwrap_or_else(|| MISSING_TITLE.to_string())
    }

    fn main_content<'a>(&self, document: &'a Html) -> ElementRef<'a> {
        self.content
            .iter()
            .find_map(|selector| {
                document
                    .select(selector)
                    .find(|element| !is_stripped(*element))
            })
            .or_else(|| document.select(&self.body).next())
            .unwrap_or_else(|| document.root_element())
    }

    fn extract_metadata(&self, document: &Html) -> PageMetadata {
        let content_of = |selector: &Selector| {
            document.select(selector).next().map(|element| {
                element
                    .value()
                    .attr("content")
                    .unwrap_or_default()
                    .to_string()
            })
        };
        PageMetadata {
            description: content_of(&self.description),
            keywords: content_of(&self.keywords),
            og_title: content_of(&self.og_title),
            og_description: content_of(&self.og_description),
        }
    }
}

fn compile(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| anyhow!("invalid selector {css:?}: {err}"))
}

/// Collapses every whitespace run into one space and trims the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_stripped_tag(name: &str) -> bool {
    STRIPPED_TAGS.contains(&name)
}

fn is_stripped(element: ElementRef<'_>) -> bool {
    is_stripped_tag(element.value().name())
        || element.ancestors().any(|node| {
            node.value()
                .as_element()
                .is_some_and(|ancestor| is_stripped_tag(ancestor.name()))
        })
}

fn extract_sections(root: ElementRef<'_>) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current = Section {
        heading: DEFAULT_SECTION_HEADING.to_string(),
        content: Vec::new(),
    };
    walk_sections(root, &mut sections, &mut current);
    if !current.content.is_empty() {
        sections.push(current);
    }
    sections
}

fn walk_sections(element: ElementRef<'_>, sections: &mut Vec<Section>, current: &mut Section) {
    for child in element.children().filter_map(ElementRef::wrap) {
        let name = child.value().name();
        if is_stripped_tag(name) {
            continue;
        }
        if HEADING_TAGS.contains(&name) {
            let finished = std::mem::replace(
                current,
                Section {
                    heading: clean_text(&visible_text(child)),
                    content: Vec::new(),
                },
            );
            if !finished.content.is_empty() {
                sections.push(finished);
            }
        } else if name == "p" || name == "li" {
            let text = clean_text(&visible_text(child));
            if text.chars().count() > MIN_PARAGRAPH_CHARS {
                current.content.push(text);
            }
        }
        walk_sections(child, sections, current);
    }
}

/// Text of an element, skipping stripped descendants.
fn visible_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    push_visible_text(element, &mut out);
    out
}

fn push_visible_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(inner) if !is_stripped_tag(inner.name()) => {
                if let Some(inner) = ElementRef::wrap(child) {
                    push_visible_text(inner, out);
                }
            }
            _ => {}
        }
    }
}
