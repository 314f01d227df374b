//! Reference discovery for passes 1 and 2.

use crate::options::CssImageMode;
use crate::options::FontSelection;
use crate::pipeline::FrameCapture;
use crate::resources::ReferenceOrigin;
use crate::resources::ResourceReference;
use crate::styles::MAX_IMPORT_DEPTH;
use crate::styles::decode_sheet;
use pk_core::ResourceCategory;
use pk_core::SequenceIndex;
use pk_css::CssRefKind;
use pk_css::scan_declarations;
use pk_css::scan_stylesheet;
use pk_css::strip_comments_preserve_strings;
use pk_dom::Document;
use pk_dom::Element;
use pk_dom::Namespace;
use pk_dom::NodeId;
use pk_net::ReferrerPolicy;
use pk_net::url::resolve;
use std::sync::Arc;

const FETCHABLE_SCHEMES: &[&str] = &["http", "https", "file", "blob"];

/// URL under which a reference is fetched and deduplicated: absolute,
/// without fragment. `None` for values nothing should be fetched for.
pub(crate) fn fetch_key(base: &str, raw: &str) -> Option<String> {
    let mut url = resolve(base, raw)?;
    if !FETCHABLE_SCHEMES.contains(&url.scheme()) {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// A sheet whose text is searched for references.
pub(crate) struct SheetSource {
    /// Base for relative URLs inside the sheet.
    pub(crate) base: String,
    /// Sent as referrer for what the sheet references.
    pub(crate) referrer: String,
    pub(crate) text: String,
    /// `@import` nesting level of the sheet itself.
    pub(crate) level: usize,
}

impl FrameCapture<'_> {
    pub(crate) fn element_policy(&self, element: &Element) -> ReferrerPolicy {
        element
            .attr("referrerpolicy")
            .map(ReferrerPolicy::parse)
            .unwrap_or(self.referrer_policy)
    }

    pub(crate) fn register(
        &mut self,
        category: ResourceCategory,
        raw: &str,
        base: &str,
        referrer: &str,
        referrer_policy: ReferrerPolicy,
        origin: ReferenceOrigin,
    ) -> Option<SequenceIndex> {
        let options = &self.ctx.options;
        if !options.fetches_enabled() || !options.items.includes(category) {
            return None;
        }
        let key = fetch_key(base, raw)?;
        let allocator = &self.ctx.allocator;
        let index = self.table.register(
            allocator,
            |index| ResourceReference {
                index,
                category,
                raw_url: raw.to_owned(),
                resolved_url: key.clone(),
                referrer: referrer.to_owned(),
                referrer_policy,
                origin,
            },
            &key,
        );
        Some(index)
    }

    /// Pass 1 seed: `<style>` text and `<link rel=stylesheet>` targets,
    /// plus the imports of inline styles.
    pub(crate) fn discover_styles(&mut self) {
        let document = Arc::clone(&self.document);
        for (node, element) in document.elements() {
            if element.is_html("style") {
                let text = strip_comments_preserve_strings(&document.text_content(node));
                self.inline_styles.push((node, text));
            } else if element.is_html("link") && element.rel_contains("stylesheet") {
                let Some(href) = element.attr("href") else {
                    continue;
                };
                let policy = self.element_policy(element);
                let registered = self.register(
                    ResourceCategory::Stylesheet,
                    href,
                    &document.base_url,
                    &document.url,
                    policy,
                    ReferenceOrigin::Element {
                        node,
                        attribute: "href",
                    },
                );
                if let Some(key) = registered.and_then(|_| fetch_key(&document.base_url, href)) {
                    self.note_sheet_level(key, 0);
                }
            }
        }

        let inline: Vec<SheetSource> = self
            .inline_styles
            .iter()
            .map(|(_, text)| SheetSource {
                base: document.base_url.clone(),
                referrer: document.url.clone(),
                text: text.clone(),
                level: 0,
            })
            .collect();
        self.discover_imports(&inline);
    }

    /// Decodes stylesheets loaded since the last call. Returns them in
    /// discovery order.
    pub(crate) fn absorb_loaded_sheets(&mut self) -> Vec<SheetSource> {
        let document = Arc::clone(&self.document);
        let mut fresh = Vec::new();
        for reference in self.table.references() {
            if reference.category != ResourceCategory::Stylesheet
                || self.sheets.contains_key(&reference.resolved_url)
            {
                continue;
            }
            let Some(content) = self
                .table
                .outcome(reference.index)
                .and_then(|outcome| outcome.content())
            else {
                continue;
            };
            let element_charset = match &reference.origin {
                ReferenceOrigin::Element { node, .. } => document
                    .element(*node)
                    .and_then(|element| element.attr("charset")),
                _ => None,
            };
            let text = decode_sheet(content, element_charset, &document.charset);
            fresh.push(SheetSource {
                base: reference.resolved_url.clone(),
                referrer: reference.resolved_url.clone(),
                text,
                level: self.sheet_levels.get(&reference.resolved_url).copied().unwrap_or(0),
            });
        }
        for sheet in &fresh {
            self.sheets.insert(sheet.base.clone(), sheet.text.clone());
            self.sheet_order.push(sheet.base.clone());
        }
        fresh
    }

    /// Keeps the shallowest level seen for a sheet.
    fn note_sheet_level(&mut self, key: String, level: usize) {
        let known = self.sheet_levels.entry(key).or_insert(level);
        *known = (*known).min(level);
    }

    /// Registers the `@import` targets of `sheets` up to
    /// [`MAX_IMPORT_DEPTH`]. Returns how many new references appeared.
    pub(crate) fn discover_imports(&mut self, sheets: &[SheetSource]) -> usize {
        let before = self.table.len();
        let policy = self.referrer_policy;
        for sheet in sheets {
            if sheet.level >= MAX_IMPORT_DEPTH {
                continue;
            }
            for reference in scan_stylesheet(&sheet.text) {
                if !reference.is_import() {
                    continue;
                }
                let registered = self.register(
                    ResourceCategory::Stylesheet,
                    &reference.url,
                    &sheet.base,
                    &sheet.referrer,
                    policy,
                    ReferenceOrigin::Stylesheet {
                        sheet_url: sheet.referrer.clone(),
                    },
                );
                if let Some(key) = registered.and_then(|_| fetch_key(&sheet.base, &reference.url)) {
                    self.note_sheet_level(key, sheet.level + 1);
                }
            }
        }
        self.table.len() - before
    }

    /// Pass 2: media, scripts, objects, CSS images and fonts.
    pub(crate) fn discover_media(&mut self) {
        let document = Arc::clone(&self.document);
        let all_css_images = self.ctx.options.css_images == CssImageMode::All;

        for (node, element) in document.elements() {
            let policy = self.element_policy(element);
            for (category, attribute, raw) in element_references(&document, node, element) {
                self.register(
                    category,
                    &raw,
                    &document.base_url,
                    &document.url,
                    policy,
                    ReferenceOrigin::Element { node, attribute },
                );
            }

            for url in &element.live.rendered_images {
                self.register(
                    ResourceCategory::Image,
                    url,
                    &document.base_url,
                    &document.url,
                    policy,
                    ReferenceOrigin::RenderedStyle { node },
                );
            }

            if all_css_images {
                if let Some(style) = element.attr("style") {
                    for reference in scan_declarations(&strip_comments_preserve_strings(style)) {
                        self.register(
                            ResourceCategory::Image,
                            &reference.url,
                            &document.base_url,
                            &document.url,
                            policy,
                            ReferenceOrigin::Element {
                                node,
                                attribute: "style",
                            },
                        );
                    }
                }
            }
        }

        let mut sheets: Vec<SheetSource> = self
            .inline_styles
            .iter()
            .map(|(_, text)| SheetSource {
                base: document.base_url.clone(),
                referrer: document.url.clone(),
                text: text.clone(),
                level: 0,
            })
            .collect();
        sheets.extend(self.sheet_order.iter().filter_map(|url| {
            Some(SheetSource {
                base: url.clone(),
                referrer: url.clone(),
                text: self.sheets.get(url)?.clone(),
                level: self.sheet_levels.get(url).copied().unwrap_or(0),
            })
        }));

        let fonts = self.ctx.options.wants_fonts().then_some(self.ctx.options.fonts);
        let policy = self.referrer_policy;
        for sheet in &sheets {
            for reference in scan_stylesheet(&sheet.text) {
                let category = match &reference.kind {
                    CssRefKind::Font { .. } => match fonts {
                        Some(FontSelection::All) => ResourceCategory::Font,
                        Some(FontSelection::Woff) if reference.is_woff_font() => ResourceCategory::Font,
                        _ => continue,
                    },
                    CssRefKind::Image if all_css_images => ResourceCategory::Image,
                    _ => continue,
                };
                self.register(
                    category,
                    &reference.url,
                    &sheet.base,
                    &sheet.referrer,
                    policy,
                    ReferenceOrigin::Stylesheet {
                        sheet_url: sheet.referrer.clone(),
                    },
                );
            }
        }
    }
}

/// Element attributes that name a resource of the given category.
fn element_references(
    document: &Document,
    node: NodeId,
    element: &Element,
) -> Vec<(ResourceCategory, &'static str, String)> {
    let mut refs = Vec::new();
    let mut push = |category, attribute: &'static str, value: Option<&str>| {
        if let Some(value) = value {
            refs.push((category, attribute, value.to_owned()));
        }
    };

    if element.namespace == Namespace::Svg {
        if element.is("image") {
            push(
                ResourceCategory::Image,
                "href",
                element.attr("href").or_else(|| element.attr("xlink:href")),
            );
        }
        return refs;
    }
    if element.namespace != Namespace::Html {
        return refs;
    }

    match element.name.as_str() {
        "script" => push(ResourceCategory::Script, "src", element.attr("src")),
        "link" if element.rel_contains("icon") => push(ResourceCategory::Icon, "href", element.attr("href")),
        "img" => push(
            ResourceCategory::Image,
            "src",
            element
                .live
                .current_src
                .as_deref()
                .or_else(|| element.attr("src")),
        ),
        "input" if element.input_type() == "image" => push(ResourceCategory::Image, "src", element.attr("src")),
        "body" => push(ResourceCategory::Image, "background", element.attr("background")),
        "audio" | "video" => {
            let category = if element.is("audio") {
                ResourceCategory::Audio
            } else {
                ResourceCategory::Video
            };
            push(
                category,
                "src",
                element
                    .live
                    .current_src
                    .as_deref()
                    .or_else(|| element.attr("src")),
            );
            if element.is("video") {
                push(ResourceCategory::Image, "poster", element.attr("poster"));
            }
        }
        "source" => {
            if let Some(src) = current_media_source(document, node, element) {
                push(src.0, "src", Some(src.1));
            }
        }
        "track" => push(ResourceCategory::Video, "src", element.attr("src")),
        "object" => push(ResourceCategory::Object, "data", element.attr("data")),
        "embed" => push(ResourceCategory::Object, "src", element.attr("src")),
        _ => {}
    }
    refs
}

/// `src` of a `<source>` when it is what its media element plays. Without
/// a recorded current source the first `<source>` is taken.
fn current_media_source<'a>(
    document: &Document,
    node: NodeId,
    element: &'a Element,
) -> Option<(ResourceCategory, &'a str)> {
    let src = element.attr("src")?;
    let (media_node, media) = document.parent_element(node)?;
    let category = if media.is_html("audio") {
        ResourceCategory::Audio
    } else if media.is_html("video") {
        ResourceCategory::Video
    } else {
        return None;
    };

    let is_current = match &media.live.current_src {
        Some(current) => fetch_key(&document.base_url, src) == fetch_key(&document.base_url, current),
        None if media.has_attr("src") => false,
        None => {
            document
                .children(media_node)
                .iter()
                .find(|&&child| document.element(child).is_some_and(|child| child.is_html("source")))
                == Some(&node)
        }
    };
    is_current.then_some((category, src))
}

#[cfg(test)]
mod tests {
    use super::current_media_source;
    use super::element_references;
    use super::fetch_key;
    use pk_core::ResourceCategory;
    use pk_dom::Document;
    use pk_dom::Element;

    #[test]
    fn fetch_keys_drop_fragments_and_skip_inline_schemes() {
        assert_eq!(
            fetch_key("https://a.example/dir/page.html", "img/x.svg#icon").as_deref(),
            Some("https://a.example/dir/img/x.svg")
        );
        assert_eq!(fetch_key("https://a.example/", "data:image/png;base64,AA"), None);
        assert_eq!(fetch_key("https://a.example/", "javascript:void(0)"), None);
        assert_eq!(fetch_key("https://a.example/", "  "), None);
    }

    #[test]
    fn img_prefers_current_source() {
        let mut doc = Document::new("https://a.example/");
        let mut img = Element::new("img").with_attr("src", "small.png");
        img.live.current_src = Some("https://a.example/large.png".to_owned());
        let node = doc.append_element(doc.root(), img);
        let refs = doc
            .element(node)
            .map(|element| element_references(&doc, node, element))
            .unwrap_or_default();
        assert_eq!(
            refs,
            vec![(ResourceCategory::Image, "src", "https://a.example/large.png".to_owned())]
        );
    }

    #[test]
    fn only_the_playing_source_counts() {
        let mut doc = Document::new("https://a.example/");
        let mut video = Element::new("video");
        video.live.current_src = Some("https://a.example/clip.webm".to_owned());
        let video = doc.append_element(doc.root(), video);
        let mp4 = doc.append_element(video, Element::new("source").with_attr("src", "clip.mp4"));
        let webm = doc.append_element(video, Element::new("source").with_attr("src", "clip.webm"));

        let pick = |node| {
            doc.element(node)
                .and_then(|element| current_media_source(&doc, node, element))
        };
        assert_eq!(pick(mp4), None);
        assert_eq!(pick(webm), Some((ResourceCategory::Video, "clip.webm")));
    }

    #[test]
    fn first_source_without_recorded_playback() {
        let mut doc = Document::new("https://a.example/");
        let audio = doc.append_element(doc.root(), Element::new("audio"));
        let first = doc.append_element(audio, Element::new("source").with_attr("src", "a.ogg"));
        let second = doc.append_element(audio, Element::new("source").with_attr("src", "a.mp3"));
        let pick = |node| {
            doc.element(node)
                .and_then(|element| current_media_source(&doc, node, element))
        };
        assert_eq!(pick(first), Some((ResourceCategory::Audio, "a.ogg")));
        assert_eq!(pick(second), None);
    }

    #[test]
    fn svg_images_use_either_href() {
        let mut doc = Document::new("https://a.example/");
        let node = doc.append_element(
            doc.root(),
            Element::svg("image").with_attr("xlink:href", "sprite.png"),
        );
        let refs = doc
            .element(node)
            .map(|element| element_references(&doc, node, element))
            .unwrap_or_default();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].2, "sprite.png");
    }
}
