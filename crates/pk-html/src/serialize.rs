//! Markup serialization helpers.

use pk_dom::Document;
use pk_dom::Namespace;
use pk_dom::NodeData;
use pk_dom::NodeId;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "basefont", "bgsound", "br", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "xmp", "noembed", "noframes"];

pub fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.iter().any(|void| void.eq_ignore_ascii_case(name))
}

/// Elements whose text content is written without escaping.
pub fn is_raw_text_element(name: &str) -> bool {
    RAW_TEXT_ELEMENTS
        .iter()
        .any(|raw| raw.eq_ignore_ascii_case(name))
}

/// Escapes the two markup metacharacters in text content.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escapes a value for a double-quoted attribute.
pub fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Serializes a document exactly as captured, without substitutions.
pub fn serialize_document(document: &Document) -> String {
    let mut out = String::new();
    for &child in document.children(document.root()) {
        write_node(document, child, false, &mut out);
    }
    out
}

fn write_node(document: &Document, id: NodeId, raw_parent: bool, out: &mut String) {
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
        NodeData::Element(element) => {
            out.push('<');
            out.push_str(&element.name);
            for attribute in &element.attributes {
                out.push(' ');
                out.push_str(&attribute.name);
                out.push_str("=\"");
                out.push_str(&escape_attribute(&attribute.value));
                out.push('"');
            }
            out.push('>');
            let html = element.namespace == Namespace::Html;
            if html && is_void_element(&element.name) {
                return;
            }
            let raw = html && is_raw_text_element(&element.name);
            for &child in &node.children {
                write_node(document, child, raw, out);
            }
            out.push_str("</");
            out.push_str(&element.name);
            out.push('>');
        }
    }
}
