//! Closed message vocabularies, one enum per direction.

use pk_core::FrameKey;
use pk_core::SequenceIndex;
use pk_core::TabId;

/// What a started operation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveAction {
    /// Capture the page into one self-contained file.
    #[default]
    Save,
    /// Re-save an already saved page without its page-info metadata.
    Remove,
    /// Save a single media resource of a saved page as its own file.
    Extract,
}

impl SaveAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Remove => "remove",
            Self::Extract => "extract",
        }
    }
}

/// Item set chosen from the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavedItems {
    /// Page structure, styles and the images currently displayed.
    Basic,
    #[default]
    Standard,
    /// Category toggles taken from the configuration.
    Custom,
}

/// Operation phase. Declaration order is the progress order; the
/// terminal phases are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SavePhase {
    #[default]
    Unknown,
    Committed,
    ScriptLoading,
    ScriptLoaded,
    OperationStarted,
    LazyLoad,
    FirstPass,
    SecondPass,
    ThirdPass,
    Saved,
    Removed,
    Extracted,
}

impl SavePhase {
    /// Legacy numeric state, `None` before the first navigation.
    pub fn code(self) -> Option<i8> {
        match self {
            Self::Unknown => None,
            Self::Committed => Some(-4),
            Self::ScriptLoading => Some(-3),
            Self::ScriptLoaded => Some(-2),
            Self::OperationStarted => Some(-1),
            Self::LazyLoad => Some(0),
            Self::FirstPass => Some(1),
            Self::SecondPass => Some(2),
            Self::ThirdPass => Some(3),
            Self::Saved => Some(6),
            Self::Removed => Some(7),
            Self::Extracted => Some(8),
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        [
            Self::Committed,
            Self::ScriptLoading,
            Self::ScriptLoaded,
            Self::OperationStarted,
            Self::LazyLoad,
            Self::FirstPass,
            Self::SecondPass,
            Self::ThirdPass,
            Self::Saved,
            Self::Removed,
            Self::Extracted,
        ]
        .into_iter()
        .find(|phase| phase.code() == Some(code))
    }

    /// `OperationStarted..=ThirdPass`: a capture is running.
    pub fn is_in_progress(self) -> bool {
        (Self::OperationStarted..=Self::ThirdPass).contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Saved | Self::Removed | Self::Extracted)
    }

    pub fn terminal_for(action: SaveAction) -> Self {
        match action {
            SaveAction::Save => Self::Saved,
            SaveAction::Remove => Self::Removed,
            SaveAction::Extract => Self::Extracted,
        }
    }
}

/// Toolbar badge state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeUpdate {
    pub text: &'static str,
    pub color: &'static str,
}

impl BadgeUpdate {
    pub fn for_phase(phase: SavePhase, action: SaveAction) -> Self {
        let (text, color) = match (phase, action) {
            (SavePhase::LazyLoad, _) => ("Laz", "#606060"),
            (SavePhase::FirstPass | SavePhase::SecondPass | SavePhase::ThirdPass, SaveAction::Remove) => {
                ("Rm", "#A06000")
            }
            (SavePhase::FirstPass | SavePhase::SecondPass | SavePhase::ThirdPass, SaveAction::Extract) => {
                ("Ext", "#008000")
            }
            (SavePhase::FirstPass, SaveAction::Save) => ("Sav", "#E00000"),
            (SavePhase::SecondPass, SaveAction::Save) => ("Sav", "#A000D0"),
            (SavePhase::ThirdPass, SaveAction::Save) => ("Sav", "#0000E0"),
            (SavePhase::Saved, _) => ("Sav", "#A0A0A0"),
            (SavePhase::Removed, _) => ("Rm", "#A0A0A0"),
            (SavePhase::Extracted, _) => ("Ext", "#A0A0A0"),
            _ => ("", "#000000"),
        };
        Self { text, color }
    }
}

/// Parameters handed to the capture for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureParams {
    pub action: SaveAction,
    pub items: SavedItems,
    /// Invert the configured lazy-load behaviour for this run.
    pub toggle_lazy: bool,
    pub extract_url: Option<String>,
    /// The page's CSP sandbox forbids downloads.
    pub csp_restricted: bool,
}

/// How a capture run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Completed,
    /// Stopped after a cancel request.
    Terminated,
    Failed { reason: String },
}

/// UI → core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    StartSave {
        tab: TabId,
        action: SaveAction,
        items: SavedItems,
        toggle_lazy: bool,
        extract_url: Option<String>,
    },
    Cancel {
        tab: TabId,
    },
}

/// Platform → core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Top-level navigation committed; any earlier state is stale.
    Committed { tab: TabId, url: String },
    PageLoaded {
        tab: TabId,
        url: String,
        title: String,
        /// The document already carries page-info metadata.
        saved_page: bool,
    },
    ScriptLoaded { tab: TabId },
    PhaseReport { tab: TabId, phase: SavePhase },
    FragmentReady { tab: TabId, index: usize, html: String },
    CaptureFinished { tab: TabId, outcome: CaptureOutcome },
    TabClosed { tab: TabId },
    PackageFinished { tab: TabId, success: bool },
}

impl PlatformEvent {
    pub fn tab(&self) -> TabId {
        match self {
            Self::Committed { tab, .. }
            | Self::PageLoaded { tab, .. }
            | Self::ScriptLoaded { tab }
            | Self::PhaseReport { tab, .. }
            | Self::FragmentReady { tab, .. }
            | Self::CaptureFinished { tab, .. }
            | Self::TabClosed { tab }
            | Self::PackageFinished { tab, .. } => *tab,
        }
    }
}

/// Core → platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreSignal {
    InjectCapture { tab: TabId },
    PerformCapture { tab: TabId, params: CaptureParams },
    CancelCapture { tab: TabId },
    Badge { tab: TabId, badge: BadgeUpdate },
    /// Ordered fragments of one finished operation. For
    /// [`SaveAction::Extract`] the single fragment is the resource's data URL.
    Package {
        tab: TabId,
        action: SaveAction,
        fragments: Vec<String>,
        file_name: String,
    },
    Notify { message: String },
    /// `reason` is `None` for a loaded resource, else its failure code.
    ResourceResolved { tab: TabId, index: SequenceIndex, reason: Option<String> },
    FrameReplied { tab: TabId, key: FrameKey },
}

/// Bytes a message carries beyond its fixed fields; checked against the
/// channel limit.
pub trait PayloadSize {
    fn payload_bytes(&self) -> usize;
}

impl PayloadSize for UiCommand {
    fn payload_bytes(&self) -> usize {
        match self {
            Self::StartSave { extract_url, .. } => extract_url.as_ref().map_or(0, String::len),
            Self::Cancel { .. } => 0,
        }
    }
}

impl PayloadSize for PlatformEvent {
    fn payload_bytes(&self) -> usize {
        match self {
            Self::Committed { url, .. } => url.len(),
            Self::PageLoaded { url, title, .. } => url.len() + title.len(),
            Self::FragmentReady { html, .. } => html.len(),
            Self::CaptureFinished {
                outcome: CaptureOutcome::Failed { reason },
                ..
            } => reason.len(),
            _ => 0,
        }
    }
}

impl PayloadSize for CoreSignal {
    fn payload_bytes(&self) -> usize {
        match self {
            Self::PerformCapture { params, .. } => params.extract_url.as_ref().map_or(0, String::len),
            Self::Package {
                fragments, file_name, ..
            } => fragments.iter().map(String::len).sum::<usize>() + file_name.len(),
            Self::Notify { message } => message.len(),
            Self::ResourceResolved { reason, .. } => reason.as_ref().map_or(0, String::len),
            Self::FrameReplied { key, .. } => key.as_str().len(),
            _ => 0,
        }
    }
}
