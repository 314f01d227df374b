//! Pass 3: markup emission with resource substitution.

use crate::frames::FrameContentReply;
use crate::pipeline::FrameCapture;
use pk_core::ResourceCategory;
use pk_core::SequenceIndex;
use pk_css::charset_rule;
use pk_dom::Attribute;
use pk_dom::Document;
use pk_dom::Element;
use pk_dom::Namespace;
use pk_dom::NodeData;
use pk_dom::NodeId;
use pk_encode::EMPTY_DOCUMENT_DATA_URL;
use pk_encode::TextHints;
use pk_encode::binary_data_url;
use pk_encode::document_data_url;
use pk_encode::escape_srcdoc;
use pk_encode::text_data_url;
use pk_html::escape_attribute;
use pk_html::escape_text;
use pk_html::is_raw_text_element;
use pk_html::is_void_element;
use pk_ipc::SaveAction;
use pk_net::url::resolve;
use pk_net::url::same_document;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

const PAGE_INFO_PREFIX: &str = "savepage-";

/// Replacement for one URL-valued attribute or `url()` token.
pub(crate) struct Substitution {
    pub(crate) value: String,
    /// True when the value is the embedded resource.
    pub(crate) embedded: bool,
}

struct EmitScope<'r> {
    replies: &'r HashMap<NodeId, FrameContentReply>,
    base_target: Option<String>,
}

impl FrameCapture<'_> {
    /// Serializes the frame's document with every substitution applied.
    pub(crate) fn emit(&mut self, replies: &HashMap<NodeId, FrameContentReply>) -> String {
        let document = Arc::clone(&self.document);
        let scope = EmitScope {
            replies,
            base_target: document
                .elements()
                .find(|(_, element)| element.is_html("base"))
                .and_then(|(_, element)| element.attr("target"))
                .map(str::to_owned),
        };
        let mut out = String::with_capacity(document.node_count() * 16);
        for &child in document.children(document.root()) {
            self.write_node(&document, child, &scope, false, &mut out);
        }
        out
    }

    /// Data URL for a reference that loaded, `None` otherwise.
    fn data_url(&mut self, index: SequenceIndex, element_charset: Option<&str>) -> Option<String> {
        if let Some(encoded) = self.encoded.get(&index) {
            return Some(encoded.clone());
        }
        let category = self
            .table
            .references()
            .iter()
            .find(|reference| reference.index == index)?
            .category;
        let content = self.table.outcome(index)?.content()?;

        let encoded = match category {
            ResourceCategory::Script | ResourceCategory::Stylesheet => {
                let (mime_type, rule_charset) = if category == ResourceCategory::Script {
                    ("text/javascript", None)
                } else {
                    ("text/css", charset_rule(&content.bytes))
                };
                let hints = TextHints {
                    header_charset: content.charset.clone(),
                    rule_charset,
                    element_charset: element_charset.map(str::to_owned),
                    parent_charset: Some(self.document.charset.clone()),
                };
                text_data_url(&content.bytes, mime_type, &hints)
            }
            _ => binary_data_url(&content.bytes, Some(&content.mime_type)),
        };
        self.encoded.insert(index, encoded.clone());
        Some(encoded)
    }

    /// Data URL of a loaded reference, else the absolute URL, else the
    /// value as written.
    pub(crate) fn substitute(&mut self, raw: &str, base: &str, element_charset: Option<&str>) -> Substitution {
        let Some(absolute) = resolve(base, raw) else {
            return Substitution {
                value: raw.to_owned(),
                embedded: false,
            };
        };
        if absolute.scheme() == "data" {
            return Substitution {
                value: raw.trim().to_owned(),
                embedded: false,
            };
        }
        let mut key = absolute.clone();
        key.set_fragment(None);
        if let Some(value) = self
            .table
            .index_of(key.as_str())
            .and_then(|index| self.data_url(index, element_charset))
        {
            return Substitution { value, embedded: true };
        }
        Substitution {
            value: absolute.to_string(),
            embedded: false,
        }
    }

    fn write_node(&mut self, document: &Document, id: NodeId, scope: &EmitScope<'_>, raw_parent: bool, out: &mut String) {
        let Some(node) = document.node(id) else {
            return;
        };
        match &node.data {
            NodeData::Document => {}
            NodeData::Doctype { name } => {
                out.push_str("<!DOCTYPE ");
                out.push_str(name);
                out.push('>');
            }
            NodeData::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeData::Text(text) if raw_parent => out.push_str(text),
            NodeData::Text(text) => out.push_str(&escape_text(text)),
            NodeData::Element(element) => self.write_element(document, id, element, scope, out),
        }
    }

    fn write_element(&mut self, document: &Document, id: NodeId, element: &Element, scope: &EmitScope<'_>, out: &mut String) {
        let html = element.namespace == Namespace::Html;
        if element.is_html("base") || self.drops_page_info(element) || drops_meta(element) {
            return;
        }
        if element.is_html("link") && element.rel_contains("stylesheet") && self.write_linked_sheet(document, element, out) {
            return;
        }

        let mut attributes = element.attributes.clone();
        if let Some(comment) = self.rewrite_attributes(document, id, element, &mut attributes, scope) {
            out.push_str("<!--");
            out.push_str(&comment.replace("--", "- -"));
            out.push_str("-->");
        }

        out.push('<');
        out.push_str(&element.name);
        for attribute in &attributes {
            out.push(' ');
            out.push_str(&attribute.name);
            out.push_str("=\"");
            if html && attribute.name == "srcdoc" {
                out.push_str(&escape_srcdoc(&attribute.value));
            } else {
                out.push_str(&escape_attribute(&attribute.value));
            }
            out.push('"');
        }
        out.push('>');

        if element.is_html("head") {
            self.write_head_additions(document, scope, out);
        }
        if html && is_void_element(&element.name) {
            return;
        }

        let inline_sheet = if element.is_html("style") {
            self.inline_style(id)
        } else {
            None
        };
        if element.is_html("textarea") {
            let text = element
                .live
                .value
                .clone()
                .unwrap_or_else(|| document.text_content(id));
            out.push_str(&escape_text(&text));
        } else if let Some(sheet) = inline_sheet {
            let processed = self.process_sheet(&sheet, &document.base_url, None);
            out.push_str(&processed);
        } else {
            let raw = html && is_raw_text_element(&element.name);
            for &child in document.children(id) {
                self.write_node(document, child, scope, raw, out);
            }
        }

        out.push_str("</");
        out.push_str(&element.name);
        out.push('>');
    }

    fn inline_style(&self, id: NodeId) -> Option<String> {
        self.inline_styles
            .iter()
            .find(|(node, _)| *node == id)
            .map(|(_, text)| text.clone())
    }

    /// Existing page-info metas are replaced on save and stripped on removal.
    fn drops_page_info(&self, element: &Element) -> bool {
        let options = &self.ctx.options;
        element.is_html("meta")
            && element
                .attr("name")
                .is_some_and(|name| name.to_ascii_lowercase().starts_with(PAGE_INFO_PREFIX))
            && (options.action == SaveAction::Remove || (self.is_top() && options.page_info.is_some()))
    }

    fn write_head_additions(&self, document: &Document, scope: &EmitScope<'_>, out: &mut String) {
        // Saved markup is always written as UTF-8.
        out.push_str("<meta charset=\"utf-8\">");
        out.push_str("<base href=\"");
        out.push_str(&escape_attribute(&document.base_url));
        out.push('"');
        if let Some(target) = &scope.base_target {
            out.push_str(" target=\"");
            out.push_str(&escape_attribute(target));
            out.push('"');
        }
        out.push('>');

        if !self.is_top() || self.ctx.options.action != SaveAction::Save {
            return;
        }
        if let Some(info) = &self.ctx.options.page_info {
            for (name, value) in [("url", &info.url), ("title", &info.title), ("date", &info.date)] {
                out.push_str("<meta name=\"");
                out.push_str(PAGE_INFO_PREFIX);
                out.push_str(name);
                out.push_str("\" content=\"");
                out.push_str(&escape_attribute(value));
                out.push_str("\">");
            }
        }
    }

    /// Writes a loaded `<link rel=stylesheet>` as `<style>`. False when the
    /// sheet did not load and the link is kept.
    fn write_linked_sheet(&mut self, document: &Document, element: &Element, out: &mut String) -> bool {
        let Some(key) = element
            .attr("href")
            .and_then(|href| crate::scan::fetch_key(&document.base_url, href))
        else {
            return false;
        };
        let Some(sheet) = self.sheets.get(&key).cloned() else {
            return false;
        };
        let processed = self.process_sheet(&sheet, &key, Some(&key));
        out.push_str("<style");
        if let Some(media) = element.attr("media") {
            out.push_str(" media=\"");
            out.push_str(&escape_attribute(media));
            out.push('"');
        }
        out.push('>');
        out.push_str(&processed);
        out.push_str("</style>");
        true
    }

    /// Applies the per-element substitution rules to `attributes`. Returns
    /// the text of a comment to place before the element, if any.
    fn rewrite_attributes(
        &mut self,
        document: &Document,
        id: NodeId,
        element: &Element,
        attributes: &mut Vec<Attribute>,
        scope: &EmitScope<'_>,
    ) -> Option<String> {
        let base = document.base_url.as_str();
        let charset = element.attr("charset");
        let mut comment = None;

        if let Some(style) = element.attr("style") {
            let processed = self.process_declarations(style, base);
            set(attributes, "style", &processed);
        }

        match element.namespace {
            Namespace::Svg => {
                if element.is("image") || element.is("a") {
                    for name in ["href", "xlink:href"] {
                        let Some(raw) = element.attr(name) else {
                            continue;
                        };
                        let value = if element.is("a") {
                            link_target(document, raw)
                        } else {
                            self.substitute(raw, base, None).value
                        };
                        set(attributes, name, &value);
                    }
                }
                return None;
            }
            Namespace::MathMl => return None,
            Namespace::Html => {}
        }

        match element.name.as_str() {
            "input" => {
                let kind = element.input_type();
                match kind.as_str() {
                    "password" | "file" => {
                        remove(attributes, "value");
                    }
                    "checkbox" | "radio" => match element.live.checked {
                        Some(true) => set(attributes, "checked", ""),
                        Some(false) => remove(attributes, "checked"),
                        None => {}
                    },
                    "image" => {
                        if let Some(src) = element.attr("src") {
                            let value = self.substitute(src, base, None).value;
                            set(attributes, "src", &value);
                        }
                    }
                    _ => {
                        if let Some(value) = &element.live.value {
                            set(attributes, "value", value);
                        }
                    }
                }
            }
            "option" => match element.live.selected {
                Some(true) => set(attributes, "selected", ""),
                Some(false) => remove(attributes, "selected"),
                None => {}
            },
            "img" => {
                let active = element
                    .live
                    .current_src
                    .as_deref()
                    .or_else(|| element.attr("src"));
                if let Some(active) = active {
                    let substitution = self.substitute(active, base, None);
                    set(attributes, "src", &substitution.value);
                    if substitution.embedded && element.has_attr("srcset") {
                        set(attributes, "srcset", "");
                    }
                }
            }
            "source" => {
                let picture_embedded = document
                    .parent_element(id)
                    .is_some_and(|(parent, _)| picture_img_embedded(self, document, parent));
                if picture_embedded && element.has_attr("srcset") {
                    set(attributes, "srcset", "");
                }
                if let Some(src) = element.attr("src") {
                    let value = self.substitute(src, base, None).value;
                    set(attributes, "src", &value);
                }
            }
            "script" | "audio" | "video" | "track" | "embed" => {
                let active = if element.is("audio") || element.is("video") {
                    element.live.current_src.as_deref().filter(|_| element.has_attr("src"))
                } else {
                    None
                };
                if let Some(src) = active.or_else(|| element.attr("src")) {
                    let value = self.substitute(src, base, charset).value;
                    set(attributes, "src", &value);
                }
                if let Some(poster) = element.attr("poster").filter(|_| element.is("video")) {
                    let value = self.substitute(poster, base, None).value;
                    set(attributes, "poster", &value);
                }
            }
            "object" => {
                if let Some(data) = element.attr("data") {
                    let value = self.substitute(data, base, None).value;
                    set(attributes, "data", &value);
                }
            }
            "body" => {
                if let Some(background) = element.attr("background") {
                    let value = self.substitute(background, base, None).value;
                    set(attributes, "background", &value);
                }
            }
            "link" => {
                if let Some(href) = element.attr("href") {
                    let value = if element.rel_contains("icon") {
                        self.substitute(href, base, None).value
                    } else {
                        resolve(base, href).map_or_else(|| href.to_owned(), |url| url.to_string())
                    };
                    set(attributes, "href", &value);
                }
            }
            "a" | "area" => {
                if let Some(href) = element.attr("href") {
                    set(attributes, "href", &link_target(document, href));
                }
            }
            "canvas" => {
                if let Some(rendering) = &element.live.canvas_data_url {
                    let existing = attribute_value(attributes, "style").unwrap_or_default();
                    let separator = if existing.trim().is_empty() || existing.trim_end().ends_with(';') {
                        ""
                    } else {
                        "; "
                    };
                    let style = format!(
                        "{existing}{separator}background-image: {}; background-size: 100% 100%; background-repeat: no-repeat;",
                        pk_css::url_token(rendering)
                    );
                    set(attributes, "style", &style);
                }
            }
            "iframe" | "frame" => {
                comment = self.rewrite_frame(element, attributes, scope.replies.get(&id));
            }
            _ => {}
        }
        comment
    }

    fn rewrite_frame(
        &self,
        element: &Element,
        attributes: &mut Vec<Attribute>,
        reply: Option<&FrameContentReply>,
    ) -> Option<String> {
        let iframe = element.is("iframe");
        match reply {
            Some(FrameContentReply::Html(html)) if iframe => {
                remove(attributes, "src");
                set(attributes, "srcdoc", html);
                None
            }
            Some(FrameContentReply::Html(html)) => {
                set(attributes, "src", &document_data_url(html));
                None
            }
            Some(FrameContentReply::Unavailable(reason)) => {
                if iframe {
                    remove(attributes, "src");
                    set(attributes, "srcdoc", "");
                } else {
                    set(attributes, "src", EMPTY_DOCUMENT_DATA_URL);
                }
                Some(format!(" savepage: frame not saved ({reason}) "))
            }
            None => None,
        }
    }
}

/// Charset declarations are replaced by `utf-8`. A page's own
/// Content-Security-Policy would block the embedded `data:` resources.
fn drops_meta(element: &Element) -> bool {
    if !element.is_html("meta") {
        return false;
    }
    if element.has_attr("charset") {
        return true;
    }
    element.attr("http-equiv").is_some_and(|equiv| {
        let equiv = equiv.trim();
        equiv.eq_ignore_ascii_case("content-type")
            || equiv.eq_ignore_ascii_case("content-security-policy")
            || equiv.eq_ignore_ascii_case("content-security-policy-report-only")
    })
}

fn picture_img_embedded(capture: &FrameCapture<'_>, document: &Document, picture: NodeId) -> bool {
    let Some(picture_element) = document.element(picture) else {
        return false;
    };
    if !picture_element.is_html("picture") {
        return false;
    }
    document.children(picture).iter().any(|&child| {
        document
            .element(child)
            .filter(|element| element.is_html("img"))
            .and_then(|img| img.live.current_src.as_deref().or_else(|| img.attr("src")))
            .and_then(|src| crate::scan::fetch_key(&document.base_url, src))
            .and_then(|key| capture.table.outcome_for_url(&key))
            .is_some_and(|outcome| outcome.content().is_some())
    })
}

/// Same-document links become bare fragments, other links absolute.
fn link_target(document: &Document, raw: &str) -> String {
    let Some(target) = resolve(&document.base_url, raw) else {
        return raw.to_owned();
    };
    let same = Url::parse(&document.url).is_ok_and(|url| same_document(&url, &target));
    match target.fragment() {
        Some(fragment) if same => format!("#{fragment}"),
        _ => target.to_string(),
    }
}

fn attribute_value(attributes: &[Attribute], name: &str) -> Option<String> {
    attributes
        .iter()
        .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
        .map(|attribute| attribute.value.clone())
}

fn set(attributes: &mut Vec<Attribute>, name: &str, value: &str) {
    match attributes
        .iter_mut()
        .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
    {
        Some(attribute) => attribute.value = value.to_owned(),
        None => attributes.push(Attribute::new(name, value)),
    }
}

fn remove(attributes: &mut Vec<Attribute>, name: &str) {
    attributes.retain(|attribute| !attribute.name.eq_ignore_ascii_case(name));
}

#[cfg(test)]
mod tests {
    use super::link_target;
    use pk_dom::Document;

    #[test]
    fn links_into_the_same_document_keep_only_the_fragment() {
        let mut doc = Document::new("https://a.example/dir/page.html?q=1");
        doc.base_url = "https://a.example/dir/".to_owned();
        assert_eq!(link_target(&doc, "page.html?q=1#top"), "#top");
        assert_eq!(link_target(&doc, "other.html#top"), "https://a.example/dir/other.html#top");
        assert_eq!(link_target(&doc, "/"), "https://a.example/");
        assert_eq!(link_target(&doc, "mailto:someone@example.org"), "mailto:someone@example.org");
    }
}
