//! Tolerant markup loading and markup serialization helpers.

mod entities;
mod serialize;
mod tokenizer;

use pk_dom::Attribute;
use pk_dom::Document;
use pk_dom::Element;
use pk_dom::Namespace;
use pk_dom::NodeData;
use pk_dom::NodeId;
use tokenizer::ParsedTag;
use tokenizer::find_byte;
use tokenizer::parse_tag;
use tokenizer::read_raw_text_until_end_tag;
use tokenizer::skip_comment;
use tokenizer::skip_processing_instruction;
use tokenizer::skip_to_gt;
use tokenizer::starts_with;
use tokenizer::starts_with_ignore_ascii_case;

pub use entities::decode_entities;
pub use serialize::escape_attribute;
pub use serialize::escape_text;
pub use serialize::is_raw_text_element;
pub use serialize::is_void_element;
pub use serialize::serialize_document;

/// Builds a DOM snapshot from saved markup.
///
/// The builder is deliberately forgiving: unknown end tags are dropped, unclosed
/// elements are closed at end of input and a handful of implied end tags
/// (`p`, `li`, `option`, table cells) are honoured.
#[derive(Debug, Default)]
pub struct HtmlParser;

impl HtmlParser {
    pub fn parse(&self, input: &str, url: &str) -> Document {
        let mut builder = TreeBuilder::new(url);
        builder.run(input);
        builder.finish()
    }
}

struct TreeBuilder {
    document: Document,
    stack: Vec<NodeId>,
    base_href: Option<String>,
    meta_charset: Option<String>,
}

impl TreeBuilder {
    fn new(url: &str) -> Self {
        let document = Document::new(url);
        let root = document.root();
        Self {
            document,
            stack: vec![root],
            base_href: None,
            meta_charset: None,
        }
    }

    fn current(&self) -> NodeId {
        self.stack.last().copied().unwrap_or_else(|| self.document.root())
    }

    fn current_namespace(&self) -> Namespace {
        self.document
            .element(self.current())
            .map(|element| match element.namespace {
                Namespace::Svg if element.is("foreignObject") => Namespace::Html,
                namespace => namespace,
            })
            .unwrap_or(Namespace::Html)
    }

    fn run(&mut self, input: &str) {
        let bytes = input.as_bytes();
        let mut idx = 0_usize;

        while idx < bytes.len() {
            if bytes[idx] != b'<' {
                let next = find_byte(bytes, idx, b'<').unwrap_or(bytes.len());
                self.text(&decode_entities(&input[idx..next]));
                idx = next;
                continue;
            }

            if starts_with(bytes, idx, b"<!--") {
                let end = skip_comment(bytes, idx);
                let body_end = end.saturating_sub(3).max(idx.saturating_add(4));
                let body = input.get(idx.saturating_add(4)..body_end).unwrap_or("");
                let parent = self.current();
                self.document.append_comment(parent, body);
                idx = end;
                continue;
            }

            if starts_with_ignore_ascii_case(bytes, idx, b"<!doctype") {
                let end = skip_to_gt(bytes, idx.saturating_add(2));
                let name = input
                    .get(idx.saturating_add(9)..end.saturating_sub(1))
                    .unwrap_or("")
                    .trim()
                    .to_owned();
                let parent = self.current();
                self.document.append(parent, NodeData::Doctype { name });
                idx = end;
                continue;
            }

            if starts_with(bytes, idx, b"<!") {
                idx = skip_to_gt(bytes, idx.saturating_add(2));
                continue;
            }

            if starts_with(bytes, idx, b"<?") {
                idx = skip_processing_instruction(bytes, idx);
                continue;
            }

            let Some((tag, next_idx)) = parse_tag(input, idx) else {
                self.text("<");
                idx = idx.saturating_add(1);
                continue;
            };

            if tag.is_end {
                self.end_tag(&tag.name);
                idx = next_idx;
                continue;
            }

            idx = self.start_tag(input, tag, next_idx);
        }
    }

    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let parent = self.current();
        let last = self.document.children(parent).last().copied();
        let merged = last.and_then(|id| match self.document.node(id).map(|node| &node.data) {
            Some(NodeData::Text(existing)) => Some((id, format!("{existing}{text}"))),
            _ => None,
        });
        if let Some((id, merged)) = merged {
            self.document.replace_data(id, NodeData::Text(merged));
            return;
        }
        self.document.append_text(parent, text);
    }

    fn start_tag(&mut self, input: &str, tag: ParsedTag, next_idx: usize) -> usize {
        let namespace = if tag.name == "svg" {
            Namespace::Svg
        } else if tag.name == "math" {
            Namespace::MathMl
        } else {
            self.current_namespace()
        };

        if namespace == Namespace::Html {
            self.close_implied(&tag.name);
        }

        let mut element = match namespace {
            Namespace::Html => Element::new(&tag.name),
            Namespace::Svg => Element::svg(&tag.raw_name),
            Namespace::MathMl => Element {
                namespace: Namespace::MathMl,
                ..Element::new(&tag.name)
            },
        };
        element.attributes = tag
            .attributes
            .into_iter()
            .map(|(name, value)| Attribute::new(name, decode_entities(&value)))
            .collect();
        seed_live_state(&mut element);
        self.observe_metadata(&element);

        let parent = self.current();
        let id = self.document.append_element(parent, element);

        if namespace == Namespace::Html
            && (is_raw_text_element(&tag.name) || matches!(tag.name.as_str(), "title" | "textarea"))
            && !tag.self_closing
        {
            let (raw, after) = read_raw_text_until_end_tag(input, next_idx, &tag.name);
            let text = if matches!(tag.name.as_str(), "title" | "textarea") {
                decode_entities(raw)
            } else {
                raw.to_owned()
            };
            if !text.is_empty() {
                self.document.append_text(id, &text);
            }
            if tag.name == "title" && self.document.title.is_empty() {
                self.document.title = collapse_whitespace(&text);
            }
            if tag.name == "textarea" {
                if let Some(element) = self.document.element_mut(id) {
                    element.live.value = Some(text);
                }
            }
            return after;
        }

        let is_void = namespace == Namespace::Html && is_void_element(&tag.name);
        if !is_void && !tag.self_closing {
            self.stack.push(id);
        }
        next_idx
    }

    fn end_tag(&mut self, name: &str) {
        let position = self.stack.iter().rposition(|&id| {
            self.document
                .element(id)
                .is_some_and(|element| element.is(name))
        });
        if let Some(position) = position {
            self.stack.truncate(position.max(1));
        }
    }

    fn close_implied(&mut self, incoming: &str) {
        let Some(open) = self.document.element(self.current()) else {
            return;
        };
        let closes = match open.name.as_str() {
            "p" => is_block_start(incoming),
            "li" => incoming == "li",
            "option" => matches!(incoming, "option" | "optgroup"),
            "td" | "th" => matches!(incoming, "td" | "th" | "tr"),
            "tr" => incoming == "tr",
            "dt" | "dd" => matches!(incoming, "dt" | "dd"),
            _ => false,
        };
        if closes && self.stack.len() > 1 {
            self.stack.pop();
            if matches!(incoming, "tr") {
                self.close_implied(incoming);
            }
        }
    }

    fn observe_metadata(&mut self, element: &Element) {
        if element.is_html("base") && self.base_href.is_none() {
            self.base_href = element.attr("href").map(str::to_owned);
        }
        if element.is_html("meta") && self.meta_charset.is_none() {
            if let Some(charset) = element.attr("charset") {
                self.meta_charset = Some(charset.trim().to_owned());
            } else if element
                .attr("http-equiv")
                .is_some_and(|value| value.eq_ignore_ascii_case("content-type"))
            {
                self.meta_charset = element
                    .attr("content")
                    .and_then(|content| content.split(';').find_map(charset_param));
            }
        }
    }

    fn finish(mut self) -> Document {
        if let Some(href) = self.base_href.take() {
            let joined = url::Url::parse(&self.document.url)
                .and_then(|page| page.join(href.trim()))
                .map(|resolved| resolved.to_string());
            if let Ok(resolved) = joined {
                self.document.base_url = resolved;
            }
        }
        if let Some(charset) = self.meta_charset.take() {
            if !charset.is_empty() {
                self.document.charset = charset;
            }
        }
        self.document
    }
}

fn seed_live_state(element: &mut Element) {
    if element.is_html("input") {
        match element.input_type().as_str() {
            "checkbox" | "radio" => element.live.checked = Some(element.has_attr("checked")),
            _ => element.live.value = element.attr("value").map(str::to_owned),
        }
    } else if element.is_html("option") {
        element.live.selected = Some(element.has_attr("selected"));
    }
}

fn charset_param(part: &str) -> Option<String> {
    let (key, value) = part.split_once('=')?;
    key.trim()
        .eq_ignore_ascii_case("charset")
        .then(|| value.trim().trim_matches(['"', '\'']).to_owned())
}

fn is_block_start(name: &str) -> bool {
    matches!(
        name,
        "address"
            | "article"
            | "aside"
            | "blockquote"
            | "div"
            | "dl"
            | "fieldset"
            | "footer"
            | "form"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "header"
            | "hr"
            | "main"
            | "nav"
            | "ol"
            | "p"
            | "pre"
            | "section"
            | "table"
            | "ul"
    )
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
