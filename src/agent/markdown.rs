//! Markdown stripping for TTS-bound text.
//!
//! Sentences are cleaned before they reach the synthesizer so formatting is
//! never spoken aloud: emphasis, headers, links (text kept), images, list
//! markers, blockquotes, HTML tags, footnotes and horizontal rules are
//! removed, fenced code blocks are dropped wholesale, and emotion tags are
//! stripped last. The delta stream published to other consumers is never
//! filtered.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

use crate::agent::EMOTION_TAG_PREFIX;

/// Strip markdown markup, keeping the readable text.
pub fn strip(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_FOOTNOTES);
    let parser = Parser::new_ext(text, options);

    let mut out = String::new();
    let mut skip_depth = 0usize;

    for event in parser {
        match event {
            Event::Start(Tag::CodeBlock(_)) | Event::Start(Tag::Image { .. }) => {
                skip_depth += 1;
            }
            Event::End(TagEnd::CodeBlock | TagEnd::Image) => {
                skip_depth = skip_depth.saturating_sub(1);
            }
            Event::Text(t) | Event::Code(t) => {
                if skip_depth == 0 {
                    out.push_str(&t);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if skip_depth == 0 {
                    out.push(' ');
                }
            }
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::BlockQuote(_)
                | TagEnd::List(_),
            ) => {
                if skip_depth == 0 && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Rule
            | Event::Html(_)
            | Event::InlineHtml(_)
            | Event::FootnoteReference(_)
            | Event::TaskListMarker(_) => {}
            _ => {}
        }
    }

    let collapsed = collapse_newlines(&out);
    strip_emotion_tags(collapsed.trim())
}

/// Collapse runs of 3+ newlines down to 2.
fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for c in text.chars() {
        if c == '\n' {
            run += 1;
            if run <= 2 {
                out.push(c);
            }
        } else {
            run = 0;
            out.push(c);
        }
    }
    out
}

/// Remove `[EMO:<name>]` tags.
pub fn strip_emotion_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(EMOTION_TAG_PREFIX) {
        out.push_str(&rest[..start]);
        let after = &rest[start + EMOTION_TAG_PREFIX.len()..];
        match after.find(']') {
            Some(end) => rest = &after[end + 1..],
            None => {
                // Unterminated tag: keep it verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
