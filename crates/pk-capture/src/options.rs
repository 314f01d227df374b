//! Per-operation capture options, resolved from the configuration and the
//! menu selection before the capture starts.

use pk_core::ResourceCategory;
use pk_ipc::SaveAction;
use std::time::Duration;

/// Which CSS images are saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CssImageMode {
    /// Only images the page currently renders (computed style).
    #[default]
    Rendered,
    /// Every image URL in every reachable rule and inline style.
    All,
}

/// Which `@font-face` sources are saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FontSelection {
    None,
    #[default]
    Woff,
    All,
}

/// Whole-category switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemToggles {
    pub images: bool,
    pub audio_video: bool,
    pub objects: bool,
    pub scripts: bool,
    pub fonts: bool,
}

impl ItemToggles {
    /// Structure, styles and displayed images.
    pub fn basic() -> Self {
        Self {
            images: true,
            audio_video: false,
            objects: false,
            scripts: false,
            fonts: false,
        }
    }

    pub fn standard() -> Self {
        Self {
            images: true,
            audio_video: true,
            objects: true,
            scripts: false,
            fonts: true,
        }
    }

    /// Nothing is fetched; used when a saved page is only rewritten.
    pub fn none() -> Self {
        Self {
            images: false,
            audio_video: false,
            objects: false,
            scripts: false,
            fonts: false,
        }
    }

    pub fn includes(&self, category: ResourceCategory) -> bool {
        match category {
            ResourceCategory::Image | ResourceCategory::Icon => self.images,
            ResourceCategory::Audio | ResourceCategory::Video => self.audio_video,
            ResourceCategory::Object => self.objects,
            ResourceCategory::Script => self.scripts,
            ResourceCategory::Font => self.fonts,
            ResourceCategory::Stylesheet | ResourceCategory::Frame | ResourceCategory::Other => true,
        }
    }
}

impl Default for ItemToggles {
    fn default() -> Self {
        Self::standard()
    }
}

/// Page-info metadata written into the root document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
    /// Already formatted save time.
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub action: SaveAction,
    pub items: ItemToggles,
    pub css_images: CssImageMode,
    pub fonts: FontSelection,
    pub max_frame_depth: usize,
    /// How long a parent frame waits for each sub-frame's markup.
    pub frame_wait: Duration,
    pub page_info: Option<PageInfo>,
    /// Resource chosen for [`SaveAction::Extract`], relative to the page.
    pub extract_url: Option<String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            action: SaveAction::Save,
            items: ItemToggles::standard(),
            css_images: CssImageMode::Rendered,
            fonts: FontSelection::Woff,
            max_frame_depth: 5,
            frame_wait: Duration::from_secs(10),
            page_info: None,
            extract_url: None,
        }
    }
}

impl CaptureOptions {
    /// Options for rewriting an already saved page: no fetches, existing
    /// page-info metadata stripped.
    pub fn for_removal() -> Self {
        Self {
            action: SaveAction::Remove,
            items: ItemToggles::none(),
            fonts: FontSelection::None,
            ..Self::default()
        }
    }

    /// Only saving fetches; removal and extraction rewrite or pick.
    pub(crate) fn fetches_enabled(&self) -> bool {
        self.action == SaveAction::Save
    }

    pub(crate) fn wants_fonts(&self) -> bool {
        self.items.fonts && self.fonts != FontSelection::None
    }
}

#[cfg(test)]
mod tests {
    use super::CaptureOptions;
    use super::FontSelection;
    use super::ItemToggles;
    use pk_core::ResourceCategory;

    #[test]
    fn toggles_gate_whole_categories() {
        let basic = ItemToggles::basic();
        assert!(basic.includes(ResourceCategory::Image));
        assert!(basic.includes(ResourceCategory::Stylesheet));
        assert!(!basic.includes(ResourceCategory::Video));
        assert!(!basic.includes(ResourceCategory::Script));
        assert!(ItemToggles::standard().includes(ResourceCategory::Object));
        assert!(!ItemToggles::none().includes(ResourceCategory::Icon));
    }

    #[test]
    fn fonts_need_toggle_and_selection() {
        let mut options = CaptureOptions::default();
        assert!(options.wants_fonts());
        options.fonts = FontSelection::None;
        assert!(!options.wants_fonts());
        assert!(!CaptureOptions::for_removal().wants_fonts());
    }
}
