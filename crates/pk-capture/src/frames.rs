//! Frame discovery and sub-frame reply routing.

use pk_core::FrameKey;
use pk_dom::Document;
use pk_dom::FrameContent;
use pk_dom::NodeId;
use pk_net::url::resolve;
use pk_net::url::same_origin;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAccess {
    Accessible,
    Inaccessible { reason: String },
    DepthExceeded,
}

impl FrameAccess {
    /// Text for the placeholder comment of a frame that is not traversed.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Accessible => None,
            Self::Inaccessible { reason } => Some(reason.clone()),
            Self::DepthExceeded => Some("maximum frame depth exceeded".to_owned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub key: FrameKey,
    pub parent: Option<FrameKey>,
    pub depth: usize,
    pub url: String,
    pub document: Option<Arc<Document>>,
    pub access: FrameAccess,
    /// `<frame>`/`<iframe>` element in the parent document.
    pub element: Option<NodeId>,
    /// Same origin as the top-level document; other frames run their own
    /// capture script and cannot ask for privileged fetches.
    pub same_origin_with_top: bool,
}

/// Frames of one page in depth-first document order. Written once by
/// [`discover_frames`], read-only afterwards.
#[derive(Debug, Clone)]
pub struct FrameTree {
    frames: Vec<FrameRecord>,
    children: HashMap<(FrameKey, NodeId), FrameKey>,
}

impl FrameTree {
    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn root(&self) -> Option<&FrameRecord> {
        self.frames.first()
    }

    pub fn get(&self, key: &FrameKey) -> Option<&FrameRecord> {
        self.frames.iter().find(|frame| &frame.key == key)
    }

    /// Key of the frame hosted by `element` inside the frame `parent`.
    pub fn child_key(&self, parent: &FrameKey, element: NodeId) -> Option<&FrameKey> {
        self.children.get(&(parent.clone(), element))
    }

    pub fn accessible(&self) -> impl Iterator<Item = &FrameRecord> {
        self.frames
            .iter()
            .filter(|frame| frame.access == FrameAccess::Accessible)
    }
}

/// Walks the frame tree below `root`. Frames deeper than `max_depth` and
/// frames whose document cannot be read are recorded but not entered.
pub fn discover_frames(root: Arc<Document>, max_depth: usize) -> FrameTree {
    let top = Url::parse(&root.url).ok();
    let mut tree = FrameTree {
        frames: vec![FrameRecord {
            key: FrameKey::root(),
            parent: None,
            depth: 0,
            url: root.url.clone(),
            document: Some(Arc::clone(&root)),
            access: FrameAccess::Accessible,
            element: None,
            same_origin_with_top: true,
        }],
        children: HashMap::new(),
    };
    visit(&mut tree, &root, &FrameKey::root(), 0, max_depth, top.as_ref());
    tree
}

fn visit(
    tree: &mut FrameTree,
    document: &Arc<Document>,
    key: &FrameKey,
    depth: usize,
    max_depth: usize,
    top: Option<&Url>,
) {
    let hosts: Vec<(NodeId, Option<FrameContent>, Option<String>)> = document
        .elements()
        .filter(|(_, element)| element.is_html("iframe") || element.is_html("frame"))
        .map(|(id, element)| (id, element.frame.clone(), element.attr("src").map(str::to_owned)))
        .collect();

    for (position, (node, content, src)) in hosts.into_iter().enumerate() {
        let child_key = key.child(position);
        let child_depth = depth + 1;
        let declared_url = src
            .as_deref()
            .and_then(|src| resolve(&document.base_url, src))
            .map(|url| url.to_string())
            .unwrap_or_else(|| "about:blank".to_owned());

        let (url, child_document, access) = match content {
            Some(FrameContent::Document(child)) if child_depth <= max_depth => {
                (child.url.clone(), Some(child), FrameAccess::Accessible)
            }
            Some(FrameContent::Document(child)) => (child.url.clone(), None, FrameAccess::DepthExceeded),
            Some(FrameContent::Inaccessible { reason }) => {
                (declared_url, None, FrameAccess::Inaccessible { reason })
            }
            None => (
                declared_url,
                None,
                FrameAccess::Inaccessible {
                    reason: "no content document".to_owned(),
                },
            ),
        };

        let same_origin_with_top = match (top, Url::parse(&url)) {
            (Some(top), Ok(url)) => same_origin(top, &url),
            // about:blank and srcdoc frames inherit the parent origin.
            (_, Ok(url)) => url.scheme() == "about",
            _ => false,
        };

        tracing::trace!(target: "pagekeep::frames", key = %child_key, %url, ?access, "frame discovered");
        tree.children.insert((key.clone(), node), child_key.clone());
        tree.frames.push(FrameRecord {
            key: child_key.clone(),
            parent: Some(key.clone()),
            depth: child_depth,
            url,
            document: child_document.clone(),
            access,
            element: Some(node),
            same_origin_with_top,
        });

        if let Some(child) = child_document {
            visit(tree, &child, &child_key, child_depth, max_depth, top);
        }
    }
}

/// What a parent frame gets back for one of its sub-frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameContentReply {
    Html(String),
    Unavailable(String),
}

/// Producer half for one frame key.
#[derive(Debug)]
pub struct FrameReplySender {
    key: FrameKey,
    tx: oneshot::Sender<String>,
}

impl FrameReplySender {
    pub fn key(&self) -> &FrameKey {
        &self.key
    }

    /// Posts the frame's final markup. False when nobody waits any more.
    pub fn send(self, html: String) -> bool {
        self.tx.send(html).is_ok()
    }
}

/// Correlates sub-frame replies with the parent frames waiting for them.
#[derive(Debug, Default)]
pub struct FrameRouter {
    pending: Mutex<HashMap<FrameKey, oneshot::Receiver<String>>>,
}

impl FrameRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&self, key: FrameKey) -> FrameReplySender {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), rx);
        FrameReplySender { key, tx }
    }

    /// Waits at most `wait` for the markup of frame `key`.
    pub async fn request_frame_content(&self, key: &FrameKey, wait: Duration) -> FrameContentReply {
        let receiver = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let Some(receiver) = receiver else {
            return FrameContentReply::Unavailable(format!("no reply expected for frame {key}"));
        };

        match tokio::time::timeout(wait, receiver).await {
            Ok(Ok(html)) => FrameContentReply::Html(html),
            Ok(Err(_)) => FrameContentReply::Unavailable(format!("frame {key} stopped before replying")),
            Err(_) => FrameContentReply::Unavailable(format!(
                "frame {key} did not reply within {}s",
                wait.as_secs_f32()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FrameAccess;
    use super::FrameContentReply;
    use super::FrameRouter;
    use super::discover_frames;
    use pk_core::FrameKey;
    use pk_dom::Document;
    use pk_dom::Element;
    use pk_dom::FrameContent;
    use std::sync::Arc;
    use std::time::Duration;

    fn page_with_frames(url: &str, children: Vec<Element>) -> Document {
        let mut doc = Document::new(url);
        let html = doc.append_element(doc.root(), Element::new("html"));
        let body = doc.append_element(html, Element::new("body"));
        for child in children {
            doc.append_element(body, child);
        }
        doc
    }

    fn iframe(content: FrameContent) -> Element {
        let mut element = Element::new("iframe").with_attr("src", "inner.html");
        element.frame = Some(content);
        element
    }

    #[test]
    fn keys_follow_document_order_and_depth() {
        let grandchild = page_with_frames("https://a.example/deep.html", Vec::new());
        let child = page_with_frames(
            "https://a.example/inner.html",
            vec![iframe(FrameContent::Document(Arc::new(grandchild)))],
        );
        let root = page_with_frames(
            "https://a.example/",
            vec![
                iframe(FrameContent::Document(Arc::new(child))),
                iframe(FrameContent::Inaccessible {
                    reason: "cross-origin".to_owned(),
                }),
            ],
        );

        let tree = discover_frames(Arc::new(root), 5);
        let keys: Vec<&str> = tree.frames().iter().map(|frame| frame.key.as_str()).collect();
        assert_eq!(keys, vec!["0", "0.0", "0.0.0", "0.1"]);
        assert_eq!(tree.accessible().count(), 3);
        let blocked = tree.get(&FrameKey::root().child(1));
        assert!(matches!(
            blocked.map(|frame| &frame.access),
            Some(FrameAccess::Inaccessible { reason }) if reason == "cross-origin"
        ));
        assert_eq!(
            blocked.map(|frame| frame.url.as_str()),
            Some("https://a.example/inner.html")
        );
    }

    #[test]
    fn frames_past_max_depth_are_not_entered() {
        let grandchild = page_with_frames("https://a.example/deep.html", Vec::new());
        let child = page_with_frames(
            "https://a.example/inner.html",
            vec![iframe(FrameContent::Document(Arc::new(grandchild)))],
        );
        let root = page_with_frames(
            "https://a.example/",
            vec![iframe(FrameContent::Document(Arc::new(child)))],
        );

        let tree = discover_frames(Arc::new(root), 1);
        let deep = tree.get(&FrameKey::root().child(0).child(0));
        assert_eq!(deep.map(|frame| frame.access.clone()), Some(FrameAccess::DepthExceeded));
        assert!(deep.is_some_and(|frame| frame.document.is_none()));
    }

    #[test]
    fn cross_origin_documents_are_flagged() {
        let foreign = page_with_frames("https://b.example/widget.html", Vec::new());
        let root = page_with_frames(
            "https://a.example/",
            vec![iframe(FrameContent::Document(Arc::new(foreign)))],
        );
        let tree = discover_frames(Arc::new(root), 5);
        assert!(tree.root().is_some_and(|frame| frame.same_origin_with_top));
        assert!(
            tree.get(&FrameKey::root().child(0))
                .is_some_and(|frame| !frame.same_origin_with_top)
        );
    }

    #[tokio::test]
    async fn router_delivers_posted_markup() {
        let router = FrameRouter::new();
        let key = FrameKey::root().child(0);
        let sender = router.expect(key.clone());
        assert!(sender.send("<p>child</p>".to_owned()));
        assert_eq!(
            router.request_frame_content(&key, Duration::from_secs(1)).await,
            FrameContentReply::Html("<p>child</p>".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_or_dropped_producers_become_unavailable() {
        let router = FrameRouter::new();
        let silent = FrameKey::root().child(0);
        let dropped = FrameKey::root().child(1);
        let _keep = router.expect(silent.clone());
        drop(router.expect(dropped.clone()));

        assert!(matches!(
            router.request_frame_content(&silent, Duration::from_secs(2)).await,
            FrameContentReply::Unavailable(_)
        ));
        assert!(matches!(
            router.request_frame_content(&dropped, Duration::from_secs(2)).await,
            FrameContentReply::Unavailable(_)
        ));
        assert!(matches!(
            router
                .request_frame_content(&FrameKey::root().child(9), Duration::from_secs(2))
                .await,
            FrameContentReply::Unavailable(_)
        ));
    }
}
