//! Shared primitives used across PageKeep crates.

use core::fmt;

/// Result alias used across the workspace.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Coded error shared by every crate; `code` is a dotted machine-readable key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureError {
    pub code: &'static str,
    pub message: String,
}

impl CaptureError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// True when the error belongs to the given dotted code family (`"net.http"`).
    pub fn is_in(&self, family: &str) -> bool {
        self.code == family
            || (self.code.starts_with(family)
                && self.code.as_bytes().get(family.len()) == Some(&b'.'))
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CaptureError {}

/// Browser tab identity; save state is keyed by this, not by operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TabId(pub u32);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab#{}", self.0)
    }
}

/// Correlates an asynchronous fetch result with the reference that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceIndex(pub u64);

impl fmt::Display for SequenceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address path of a frame from the root frame, e.g. `0.2.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey(String);

impl FrameKey {
    pub fn root() -> Self {
        Self("0".to_owned())
    }

    pub fn child(&self, position: usize) -> Self {
        Self(format!("{}.{position}", self.0))
    }

    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| Self(parent.to_owned()))
    }

    pub fn depth(&self) -> usize {
        self.0.bytes().filter(|byte| *byte == b'.').count()
    }

    pub fn is_root(&self) -> bool {
        self.depth() == 0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of external resource a reference points at; drives item toggles and
/// the mixed-content rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    Stylesheet,
    Script,
    Image,
    Font,
    Audio,
    Video,
    Object,
    Icon,
    Frame,
    Other,
}

impl ResourceCategory {
    /// Passive content may be displayed from an insecure origin on a secure page.
    pub fn is_passive(self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Video | Self::Icon)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stylesheet => "stylesheet",
            Self::Script => "script",
            Self::Image => "image",
            Self::Font => "font",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Object => "object",
            Self::Icon => "icon",
            Self::Frame => "frame",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::CaptureError;
    use super::FrameKey;
    use super::ResourceCategory;

    #[test]
    fn frame_keys_address_from_root() {
        let root = FrameKey::root();
        let nested = root.child(2).child(0);
        assert_eq!(nested.as_str(), "0.2.0");
        assert_eq!(nested.depth(), 2);
        assert_eq!(nested.parent(), Some(root.child(2)));
        assert_eq!(root.parent(), None);
        assert!(root.is_root());
    }

    #[test]
    fn error_family_matches_on_segment_boundary() {
        let error = CaptureError::new("net.http.read_body_failed", "boom");
        assert!(error.is_in("net.http"));
        assert!(error.is_in("net"));
        assert!(!error.is_in("net.ht"));
        assert_eq!(error.to_string(), "net.http.read_body_failed: boom");
    }

    #[test]
    fn only_display_media_is_passive() {
        assert!(ResourceCategory::Image.is_passive());
        assert!(ResourceCategory::Icon.is_passive());
        assert!(!ResourceCategory::Script.is_passive());
        assert!(!ResourceCategory::Stylesheet.is_passive());
        assert_eq!(ResourceCategory::Font.to_string(), "font");
    }
}
