use pulldown_cmark::{CodeBlockKind, CowStr, Event, HeadingLevel, Options, Parser, Tag, TagEnd};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

pub const REASONING_LABEL: &str = "Show AI's reasoning process";
pub const CODE_NOTICE: &str = "This code was generated by AI. Please review properly.";

/// A reply split into the model's reasoning and the answer proper.
#[derive(Debug, Clone)]
pub enum Section {
    Reasoning(Vec<MessageBlock>),
    Answer(Vec<MessageBlock>),
}

#[derive(Debug, Clone)]
pub enum MessageBlock {
    Paragraph(Vec<InlineSpan>),
    CodeBlock {
        language: Option<String>,
        code: String,
    },
    Heading {
        level: u8,
        spans: Vec<InlineSpan>,
    },
    BlockQuote(Vec<MessageBlock>),
    List {
        ordered: bool,
        items: Vec<Vec<MessageBlock>>,
    },
    Rule,
}

#[derive(Debug, Clone, Default)]
pub struct InlineSpan {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    pub code: bool,
    pub link_url: Option<String>,
}

/// Split `content` on `<think>` sections, returning `(is_reasoning, text)`
/// pieces in order. An unterminated `<think>` (reply still streaming) makes
/// the rest of the text reasoning. Whitespace-only pieces are dropped.
pub fn split_reasoning(content: &str) -> Vec<(bool, &str)> {
    let mut pieces = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find(THINK_OPEN) {
        pieces.push((false, &rest[..start]));
        let after_open = &rest[start + THINK_OPEN.len()..];
        match after_open.find(THINK_CLOSE) {
            Some(end) => {
                pieces.push((true, &after_open[..end]));
                rest = &after_open[end + THINK_CLOSE.len()..];
            }
            None => {
                pieces.push((true, after_open));
                rest = "";
            }
        }
    }
    pieces.push((false, rest));

    pieces
        .into_iter()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(thinking, text)| (thinking, text.trim()))
        .collect()
}

/// The reply with reasoning sections removed.
pub fn answer_text(content: &str) -> String {
    split_reasoning(content)
        .into_iter()
        .filter(|(thinking, _)| !thinking)
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_message(content: &str) -> Vec<Section> {
    split_reasoning(content)
        .into_iter()
        .map(|(thinking, text)| {
            let blocks = parse_markdown(text);
            if thinking {
                Section::Reasoning(blocks)
            } else {
                Section::Answer(blocks)
            }
        })
        .collect()
}

pub fn parse_markdown(input: &str) -> Vec<MessageBlock> {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES;
    let mut ctx = ParseContext::default();
    for event in Parser::new_ext(input, options) {
        ctx.handle_event(event);
    }
    ctx.finish()
}

#[derive(Default)]
struct ParseContext {
    document: Vec<MessageBlock>,
    // Open quotes, lists and list items, innermost last.
    containers: Vec<Container>,
    spans: Vec<InlineSpan>,
    style: InlineSpan,
    code: Option<(Option<String>, String)>,
    heading: Option<u8>,
}

enum Container {
    Quote(Vec<MessageBlock>),
    List {
        ordered: bool,
        items: Vec<Vec<MessageBlock>>,
    },
    Item(Vec<MessageBlock>),
}

impl ParseContext {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start(tag) => self.handle_start(tag),
            Event::End(tag) => self.handle_end(tag),
            Event::Text(text) => self.handle_text(text),
            Event::Code(code) => {
                let mut span = self.styled(code.to_string());
                span.code = true;
                self.spans.push(span);
            }
            Event::SoftBreak => self.spans.push(InlineSpan {
                text: " ".to_string(),
                ..InlineSpan::default()
            }),
            Event::HardBreak => self.spans.push(InlineSpan {
                text: "\n".to_string(),
                ..InlineSpan::default()
            }),
            Event::Rule => {
                self.flush_paragraph();
                self.push_block(MessageBlock::Rule);
            }
            _ => {}
        }
    }

    fn handle_start(&mut self, tag: Tag) {
        match tag {
            Tag::Heading { level, .. } => {
                self.flush_paragraph();
                self.heading = Some(heading_level_to_u8(level));
            }
            Tag::Strong => self.style.bold = true,
            Tag::Emphasis => self.style.italic = true,
            Tag::Strikethrough => self.style.strikethrough = true,
            Tag::Link { dest_url, .. } => self.style.link_url = Some(dest_url.to_string()),
            Tag::CodeBlock(kind) => {
                self.flush_paragraph();
                let language = match kind {
                    CodeBlockKind::Fenced(lang) => {
                        let lang = lang.trim();
                        (!lang.is_empty()).then(|| lang.to_string())
                    }
                    CodeBlockKind::Indented => None,
                };
                self.code = Some((language, String::new()));
            }
            Tag::BlockQuote(_) => {
                self.flush_paragraph();
                self.containers.push(Container::Quote(Vec::new()));
            }
            Tag::List(start) => {
                self.flush_paragraph();
                self.containers.push(Container::List {
                    ordered: start.is_some(),
                    items: Vec::new(),
                });
            }
            Tag::Item => self.containers.push(Container::Item(Vec::new())),
            _ => {}
        }
    }

    fn handle_end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.flush_paragraph(),
            TagEnd::Heading(_) => {
                if let Some(level) = self.heading.take() {
                    let spans = std::mem::take(&mut self.spans);
                    self.push_block(MessageBlock::Heading { level, spans });
                }
            }
            TagEnd::Strong => self.style.bold = false,
            TagEnd::Emphasis => self.style.italic = false,
            TagEnd::Strikethrough => self.style.strikethrough = false,
            TagEnd::Link => self.style.link_url = None,
            TagEnd::CodeBlock => {
                if let Some((language, code)) = self.code.take() {
                    let code = code.trim_end_matches('\n').to_string();
                    self.push_block(MessageBlock::CodeBlock { language, code });
                }
            }
            TagEnd::BlockQuote(_) => {
                self.flush_paragraph();
                if let Some(Container::Quote(blocks)) = self.containers.pop() {
                    self.push_block(MessageBlock::BlockQuote(blocks));
                }
            }
            TagEnd::Item => {
                // Tight list items carry text without a paragraph.
                self.flush_paragraph();
                if let Some(Container::Item(blocks)) = self.containers.pop() {
                    if let Some(Container::List { items, .. }) = self.containers.last_mut() {
                        items.push(blocks);
                    }
                }
            }
            TagEnd::List(_) => {
                if let Some(Container::List { ordered, items }) = self.containers.pop() {
                    self.push_block(MessageBlock::List { ordered, items });
                }
            }
            _ => {}
        }
    }

    fn handle_text(&mut self, text: CowStr) {
        if let Some((_, code)) = self.code.as_mut() {
            code.push_str(&text);
            return;
        }
        let span = self.styled(text.to_string());
        self.spans.push(span);
    }

    fn styled(&self, text: String) -> InlineSpan {
        InlineSpan {
            text,
            ..self.style.clone()
        }
    }

    fn flush_paragraph(&mut self) {
        if self.spans.is_empty() || self.heading.is_some() {
            return;
        }
        let spans = std::mem::take(&mut self.spans);
        self.push_block(MessageBlock::Paragraph(spans));
    }

    fn push_block(&mut self, block: MessageBlock) {
        match self.containers.last_mut() {
            Some(Container::Quote(blocks)) | Some(Container::Item(blocks)) => blocks.push(block),
            Some(Container::List { .. }) | None => self.document.push(block),
        }
    }

    fn finish(mut self) -> Vec<MessageBlock> {
        self.flush_paragraph();
        self.document
    }
}

fn heading_level_to_u8(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// Render formatted sections as plain text for a terminal.
pub fn render_plain(sections: &[Section]) -> String {
    let mut out = String::new();
    for section in sections {
        match section {
            Section::Reasoning(blocks) => {
                out.push_str(&format!("[{}]\n", REASONING_LABEL));
                let inner = render_blocks(blocks);
                for line in inner.lines() {
                    out.push_str("  | ");
                    out.push_str(line);
                    out.push('\n');
                }
                out.push('\n');
            }
            Section::Answer(blocks) => out.push_str(&render_blocks(blocks)),
        }
    }
    out.trim_end().to_string()
}

/// Plain rendering for a reply that is still arriving. Markdown is left
/// as-is; reasoning is laid out like `render_plain` so the text only grows
/// at the end as tokens come in.
pub fn render_streaming(content: &str) -> String {
    let mut out = String::new();
    for (thinking, text) in split_reasoning(content) {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        if thinking {
            out.push_str(&format!("[{}]", REASONING_LABEL));
            for line in text.lines() {
                out.push_str("\n  | ");
                out.push_str(line);
            }
        } else {
            out.push_str(text);
        }
    }
    out
}

fn render_blocks(blocks: &[MessageBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        match block {
            MessageBlock::Paragraph(spans) => {
                out.push_str(&render_spans(spans));
                out.push_str("\n\n");
            }
            MessageBlock::Heading { level, spans } => {
                out.push_str(&"#".repeat(*level as usize));
                out.push(' ');
                out.push_str(&render_spans(spans));
                out.push_str("\n\n");
            }
            MessageBlock::CodeBlock { language, code } => {
                out.push_str(&format!("```{}\n{}\n```\n", language.as_deref().unwrap_or(""), code));
                out.push_str(CODE_NOTICE);
                out.push_str("\n\n");
            }
            MessageBlock::BlockQuote(inner) => {
                for line in render_blocks(inner).trim_end().lines() {
                    out.push_str("> ");
                    out.push_str(line);
                    out.push('\n');
                }
                out.push('\n');
            }
            MessageBlock::List { ordered, items } => {
                for (i, item) in items.iter().enumerate() {
                    let marker = if *ordered {
                        format!("{}. ", i + 1)
                    } else {
                        "- ".to_string()
                    };
                    let body = render_blocks(item);
                    for (n, line) in body.trim_end().lines().enumerate() {
                        if n == 0 {
                            out.push_str(&marker);
                        } else {
                            out.push_str(&" ".repeat(marker.len()));
                        }
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                out.push('\n');
            }
            MessageBlock::Rule => out.push_str("---\n\n"),
        }
    }
    out
}

fn render_spans(spans: &[InlineSpan]) -> String {
    let mut text = String::new();
    for span in spans {
        if span.code {
            text.push('`');
            text.push_str(&span.text);
            text.push('`');
        } else {
            text.push_str(&span.text);
        }
        if let Some(url) = &span.link_url {
            if url != &span.text {
                text.push_str(&format!(" <{}>", url));
            }
        }
    }
    text
}
