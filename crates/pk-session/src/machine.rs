//! Per-tab save state machine.
//!
//! The machine is pure: it consumes UI commands and platform events and
//! returns the signals the service must act on. All per-tab state lives in
//! one registry owned by the machine.

use crate::config::SaveConfig;
use crate::filename::FileNameRules;
use crate::filename::resource_file_name;
use crate::filename::suggest_file_name;
use chrono::DateTime;
use chrono::Local;
use pk_core::TabId;
use pk_ipc::BadgeUpdate;
use pk_ipc::CaptureOutcome;
use pk_ipc::CaptureParams;
use pk_ipc::CoreSignal;
use pk_ipc::PlatformEvent;
use pk_ipc::SaveAction;
use pk_ipc::SavePhase;
use pk_ipc::UiCommand;
use pk_net::is_special_page;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

pub const ALREADY_IN_PROGRESS: &str = "Operation already in progress";

/// Anything the machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineInput {
    Ui(UiCommand),
    Platform(PlatformEvent),
}

impl From<UiCommand> for MachineInput {
    fn from(command: UiCommand) -> Self {
        Self::Ui(command)
    }
}

impl From<PlatformEvent> for MachineInput {
    fn from(event: PlatformEvent) -> Self {
        Self::Platform(event)
    }
}

/// State of one tab.
#[derive(Debug, Clone)]
pub struct SaveOperationState {
    pub phase: SavePhase,
    pub url: String,
    pub title: String,
    pub loaded: bool,
    /// The page already carries page-info metadata.
    pub saved_page: bool,
    /// Markup fragments by index; discarded unless the operation completes.
    pub fragments: BTreeMap<usize, String>,
    /// Start request parked until the capture script is loaded.
    pub pending: Option<CaptureParams>,
    pub cancel_requested: bool,
    pub params: Option<CaptureParams>,
    pub config: Option<Arc<SaveConfig>>,
    pub started_at: Option<DateTime<Local>>,
}

impl SaveOperationState {
    fn new(url: &str) -> Self {
        Self {
            phase: SavePhase::Committed,
            url: url.to_owned(),
            title: String::new(),
            loaded: false,
            saved_page: false,
            fragments: BTreeMap::new(),
            pending: None,
            cancel_requested: false,
            params: None,
            config: None,
            started_at: None,
        }
    }

    fn action(&self) -> SaveAction {
        self.params.as_ref().map(|params| params.action).unwrap_or_default()
    }

    fn badge(&self, tab: TabId) -> CoreSignal {
        CoreSignal::Badge {
            tab,
            badge: BadgeUpdate::for_phase(self.phase, self.action()),
        }
    }

    fn reset_operation(&mut self) {
        self.phase = SavePhase::ScriptLoaded;
        self.fragments.clear();
        self.cancel_requested = false;
        self.params = None;
        self.config = None;
        self.started_at = None;
    }
}

pub struct SaveStateMachine {
    config: Arc<SaveConfig>,
    tabs: HashMap<TabId, SaveOperationState>,
}

impl SaveStateMachine {
    pub fn new(config: Arc<SaveConfig>) -> Self {
        Self {
            config,
            tabs: HashMap::new(),
        }
    }

    pub fn state(&self, tab: TabId) -> Option<&SaveOperationState> {
        self.tabs.get(&tab)
    }

    pub fn phase(&self, tab: TabId) -> SavePhase {
        self.tabs.get(&tab).map(|state| state.phase).unwrap_or_default()
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    /// Treats the tab as loaded after the page wait ran out.
    pub fn assume_loaded(&mut self, tab: TabId) {
        if let Some(state) = self.tabs.get_mut(&tab) {
            if !state.loaded {
                tracing::info!(target: "pagekeep::session", %tab, "page wait expired, saving anyway");
                state.loaded = true;
            }
        }
    }

    pub fn handle(&mut self, input: impl Into<MachineInput>) -> Vec<CoreSignal> {
        self.handle_at(input, Local::now())
    }

    pub fn handle_at(&mut self, input: impl Into<MachineInput>, now: DateTime<Local>) -> Vec<CoreSignal> {
        match input.into() {
            MachineInput::Ui(UiCommand::StartSave {
                tab,
                action,
                items,
                toggle_lazy,
                extract_url,
            }) => self.start(
                tab,
                CaptureParams {
                    action,
                    items,
                    toggle_lazy,
                    extract_url,
                    csp_restricted: false,
                },
                now,
            ),
            MachineInput::Ui(UiCommand::Cancel { tab }) => self.cancel(tab),
            MachineInput::Platform(event) => self.on_event(event, now),
        }
    }

    fn start(&mut self, tab: TabId, params: CaptureParams, now: DateTime<Local>) -> Vec<CoreSignal> {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return vec![notify("Cannot save page: no page is open", "")];
        };
        if is_special_page(&state.url) {
            return vec![notify("Cannot save special page", &state.title)];
        }
        if !state.loaded {
            return vec![notify("Cannot save page: page is not loaded", &state.title)];
        }
        if state.phase.is_in_progress() {
            return vec![notify(ALREADY_IN_PROGRESS, &state.title)];
        }
        if params.action == SaveAction::Remove && !state.saved_page {
            return vec![notify("Cannot remove page info: page was not saved", &state.title)];
        }
        if params.action == SaveAction::Extract && params.extract_url.is_none() {
            return vec![notify("Cannot extract: no resource selected", &state.title)];
        }

        // The script is already on its way; a repeated request is ignored.
        if state.phase == SavePhase::ScriptLoading {
            if state.pending.is_none() {
                state.pending = Some(params);
            }
            return Vec::new();
        }
        if state.phase < SavePhase::ScriptLoaded {
            state.pending = Some(params);
            state.phase = SavePhase::ScriptLoading;
            return vec![CoreSignal::InjectCapture { tab }];
        }
        begin(tab, state, params, &self.config, now)
    }

    fn cancel(&mut self, tab: TabId) -> Vec<CoreSignal> {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return Vec::new();
        };
        if state.pending.take().is_some() {
            return Vec::new();
        }
        if !state.phase.is_in_progress() {
            return Vec::new();
        }
        state.cancel_requested = true;
        vec![CoreSignal::CancelCapture { tab }]
    }

    fn on_event(&mut self, event: PlatformEvent, now: DateTime<Local>) -> Vec<CoreSignal> {
        match event {
            PlatformEvent::Committed { tab, url } => {
                let previous = self.tabs.insert(tab, SaveOperationState::new(&url));
                let mut signals = Vec::new();
                if previous.is_some_and(|state| state.phase.is_in_progress()) {
                    signals.push(CoreSignal::CancelCapture { tab });
                }
                signals.push(CoreSignal::Badge {
                    tab,
                    badge: BadgeUpdate::for_phase(SavePhase::Committed, SaveAction::Save),
                });
                signals
            }
            PlatformEvent::PageLoaded {
                tab,
                url,
                title,
                saved_page,
            } => {
                let state = self
                    .tabs
                    .entry(tab)
                    .or_insert_with(|| SaveOperationState::new(&url));
                state.url = url;
                state.title = title;
                state.saved_page = saved_page;
                state.loaded = true;
                Vec::new()
            }
            PlatformEvent::ScriptLoaded { tab } => {
                let Some(state) = self.tabs.get_mut(&tab) else {
                    return Vec::new();
                };
                if state.phase < SavePhase::ScriptLoaded {
                    state.phase = SavePhase::ScriptLoaded;
                }
                match state.pending.take() {
                    Some(params) => begin(tab, state, params, &self.config, now),
                    None => Vec::new(),
                }
            }
            PlatformEvent::PhaseReport { tab, phase } => {
                let Some(state) = self.tabs.get_mut(&tab) else {
                    return Vec::new();
                };
                let running = state.phase.is_in_progress();
                if !running || state.cancel_requested || phase <= state.phase || phase > SavePhase::ThirdPass {
                    return Vec::new();
                }
                state.phase = phase;
                vec![state.badge(tab)]
            }
            PlatformEvent::FragmentReady { tab, index, html } => {
                if let Some(state) = self.tabs.get_mut(&tab) {
                    if state.phase.is_in_progress() && !state.cancel_requested {
                        state.fragments.insert(index, html);
                    }
                }
                Vec::new()
            }
            PlatformEvent::CaptureFinished { tab, outcome } => self.finish(tab, outcome),
            PlatformEvent::TabClosed { tab } => match self.tabs.remove(&tab) {
                Some(state) if state.phase.is_in_progress() => {
                    vec![CoreSignal::CancelCapture { tab }]
                }
                _ => Vec::new(),
            },
            PlatformEvent::PackageFinished { tab, success } => {
                if success {
                    return Vec::new();
                }
                let title = self
                    .tabs
                    .get(&tab)
                    .map(|state| state.title.clone())
                    .unwrap_or_default();
                vec![notify("Cannot write saved file", &title)]
            }
        }
    }

    fn finish(&mut self, tab: TabId, outcome: CaptureOutcome) -> Vec<CoreSignal> {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return Vec::new();
        };
        if state.phase == SavePhase::ScriptLoading {
            // The capture script never arrived; drop the parked start.
            return match outcome {
                CaptureOutcome::Failed { reason } => {
                    state.pending = None;
                    state.phase = SavePhase::Committed;
                    vec![notify(&reason, &state.title)]
                }
                _ => Vec::new(),
            };
        }
        if !state.phase.is_in_progress() {
            return Vec::new();
        }

        match outcome {
            CaptureOutcome::Completed if !state.cancel_requested => {
                let action = state.action();
                let fragments: Vec<String> = std::mem::take(&mut state.fragments).into_values().collect();
                let file_name = file_name_for(state, action);
                state.phase = SavePhase::terminal_for(action);
                tracing::info!(target: "pagekeep::session", %tab, action = action.as_str(), %file_name, "operation complete");
                let badge = state.badge(tab);
                state.params = None;
                state.config = None;
                vec![
                    badge,
                    CoreSignal::Package {
                        tab,
                        action,
                        fragments,
                        file_name,
                    },
                ]
            }
            CaptureOutcome::Failed { reason } if !state.cancel_requested => {
                tracing::warn!(target: "pagekeep::session", %tab, %reason, "operation failed");
                state.reset_operation();
                vec![state.badge(tab), notify(&reason, &state.title)]
            }
            _ => {
                tracing::info!(target: "pagekeep::session", %tab, "operation cancelled");
                state.reset_operation();
                vec![state.badge(tab)]
            }
        }
    }
}

fn begin(
    tab: TabId,
    state: &mut SaveOperationState,
    params: CaptureParams,
    config: &Arc<SaveConfig>,
    now: DateTime<Local>,
) -> Vec<CoreSignal> {
    state.phase = SavePhase::OperationStarted;
    state.fragments.clear();
    state.cancel_requested = false;
    state.pending = None;
    state.params = Some(params.clone());
    state.config = Some(Arc::clone(config));
    state.started_at = Some(now);
    tracing::info!(target: "pagekeep::session", %tab, action = params.action.as_str(), url = %state.url, "operation started");
    vec![state.badge(tab), CoreSignal::PerformCapture { tab, params }]
}

fn file_name_for(state: &SaveOperationState, action: SaveAction) -> String {
    let config = state.config.as_deref().cloned().unwrap_or_default();
    if action == SaveAction::Extract {
        if let Some(name) = state
            .params
            .as_ref()
            .and_then(|params| params.extract_url.as_deref())
            .and_then(|raw| pk_net::url::resolve(&state.url, raw))
            .and_then(|url| resource_file_name(url.as_str()))
        {
            return name;
        }
    }
    let rules = FileNameRules {
        template: config.file_name_template,
        replace_spaces: config.replace_spaces,
        replace_char: config.replace_char,
        max_length: config.max_file_name_length,
    };
    let now = state.started_at.unwrap_or_else(Local::now);
    suggest_file_name(&rules, &state.title, &state.url, &now, "html")
}

/// One notification per failed operation: `"<reason>:\n > <title>"`.
fn notify(reason: &str, title: &str) -> CoreSignal {
    CoreSignal::Notify {
        message: format!("{reason}:\n > {title}"),
    }
}

#[cfg(test)]
mod tests {
    use super::ALREADY_IN_PROGRESS;
    use super::SaveStateMachine;
    use crate::config::SaveConfig;
    use chrono::Local;
    use chrono::TimeZone;
    use pk_core::TabId;
    use pk_ipc::CaptureOutcome;
    use pk_ipc::CoreSignal;
    use pk_ipc::PlatformEvent;
    use pk_ipc::SaveAction;
    use pk_ipc::SavePhase;
    use pk_ipc::SavedItems;
    use pk_ipc::UiCommand;
    use std::sync::Arc;

    const TAB: TabId = TabId(7);

    fn start(action: SaveAction) -> UiCommand {
        UiCommand::StartSave {
            tab: TAB,
            action,
            items: SavedItems::Standard,
            toggle_lazy: false,
            extract_url: None,
        }
    }

    fn loaded_machine(script_loaded: bool) -> SaveStateMachine {
        let mut machine = SaveStateMachine::new(Arc::new(SaveConfig::default()));
        machine.handle(PlatformEvent::Committed {
            tab: TAB,
            url: "https://a.example/news".to_owned(),
        });
        machine.handle(PlatformEvent::PageLoaded {
            tab: TAB,
            url: "https://a.example/news".to_owned(),
            title: "News".to_owned(),
            saved_page: false,
        });
        if script_loaded {
            machine.handle(PlatformEvent::ScriptLoaded { tab: TAB });
        }
        machine
    }

    fn has_notify(signals: &[CoreSignal], text: &str) -> bool {
        signals
            .iter()
            .any(|signal| matches!(signal, CoreSignal::Notify { message } if message.contains(text)))
    }

    #[test]
    fn start_injects_the_script_first_when_missing() {
        let mut machine = loaded_machine(false);
        let signals = machine.handle(start(SaveAction::Save));
        assert_eq!(signals, vec![CoreSignal::InjectCapture { tab: TAB }]);
        assert_eq!(machine.phase(TAB), SavePhase::ScriptLoading);

        let signals = machine.handle(PlatformEvent::ScriptLoaded { tab: TAB });
        assert!(signals.iter().any(|signal| matches!(signal, CoreSignal::PerformCapture { .. })));
        assert_eq!(machine.phase(TAB), SavePhase::OperationStarted);
    }

    #[test]
    fn repeated_start_while_the_script_loads_is_ignored() {
        let mut machine = loaded_machine(false);
        machine.handle(start(SaveAction::Save));
        let repeated = machine.handle(UiCommand::StartSave {
            tab: TAB,
            action: SaveAction::Save,
            items: SavedItems::Standard,
            toggle_lazy: true,
            extract_url: None,
        });
        assert!(repeated.is_empty());
        assert_eq!(machine.phase(TAB), SavePhase::ScriptLoading);

        let signals = machine.handle(PlatformEvent::ScriptLoaded { tab: TAB });
        let started: Vec<bool> = signals
            .iter()
            .filter_map(|signal| match signal {
                CoreSignal::PerformCapture { params, .. } => Some(params.toggle_lazy),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![false]);
    }

    #[test]
    fn second_start_is_rejected_while_running() {
        let mut machine = loaded_machine(true);
        machine.handle(start(SaveAction::Save));
        machine.handle(PlatformEvent::PhaseReport {
            tab: TAB,
            phase: SavePhase::SecondPass,
        });
        let signals = machine.handle(start(SaveAction::Save));
        assert!(has_notify(&signals, ALREADY_IN_PROGRESS));
        assert!(has_notify(&signals, "> News"));
    }

    #[test]
    fn special_and_unloaded_pages_are_refused() {
        let mut machine = SaveStateMachine::new(Arc::new(SaveConfig::default()));
        machine.handle(PlatformEvent::Committed {
            tab: TAB,
            url: "about:config".to_owned(),
        });
        assert!(has_notify(&machine.handle(start(SaveAction::Save)), "special page"));

        machine.handle(PlatformEvent::Committed {
            tab: TAB,
            url: "https://a.example/".to_owned(),
        });
        assert!(has_notify(&machine.handle(start(SaveAction::Save)), "not loaded"));
        machine.assume_loaded(TAB);
        assert_eq!(
            machine.handle(start(SaveAction::Save)),
            vec![CoreSignal::InjectCapture { tab: TAB }]
        );
    }

    #[test]
    fn completed_capture_hands_ordered_fragments_to_packaging() {
        let mut machine = loaded_machine(true);
        let now = Local
            .with_ymd_and_hms(2026, 10, 19, 9, 30, 0)
            .single()
            .unwrap_or_else(Local::now);
        machine.handle_at(start(SaveAction::Save), now);
        for phase in [SavePhase::FirstPass, SavePhase::SecondPass, SavePhase::ThirdPass] {
            let signals = machine.handle(PlatformEvent::PhaseReport { tab: TAB, phase });
            assert_eq!(signals.len(), 1);
        }
        machine.handle(PlatformEvent::FragmentReady {
            tab: TAB,
            index: 1,
            html: "world".to_owned(),
        });
        machine.handle(PlatformEvent::FragmentReady {
            tab: TAB,
            index: 0,
            html: "hello ".to_owned(),
        });

        let signals = machine.handle(PlatformEvent::CaptureFinished {
            tab: TAB,
            outcome: CaptureOutcome::Completed,
        });
        assert!(signals.contains(&CoreSignal::Package {
            tab: TAB,
            action: SaveAction::Save,
            fragments: vec!["hello ".to_owned(), "world".to_owned()],
            file_name: "News.html".to_owned(),
        }));
        assert_eq!(machine.phase(TAB), SavePhase::Saved);
        assert!(machine.state(TAB).is_some_and(|state| state.fragments.is_empty()));
    }

    #[test]
    fn cancellation_returns_to_idle_without_packaging() {
        let mut machine = loaded_machine(true);
        machine.handle(start(SaveAction::Save));
        machine.handle(PlatformEvent::PhaseReport {
            tab: TAB,
            phase: SavePhase::SecondPass,
        });
        machine.handle(PlatformEvent::FragmentReady {
            tab: TAB,
            index: 0,
            html: "partial".to_owned(),
        });

        assert_eq!(
            machine.handle(UiCommand::Cancel { tab: TAB }),
            vec![CoreSignal::CancelCapture { tab: TAB }]
        );
        let signals = machine.handle(PlatformEvent::CaptureFinished {
            tab: TAB,
            outcome: CaptureOutcome::Terminated,
        });
        assert!(!signals.iter().any(|signal| matches!(signal, CoreSignal::Package { .. })));
        assert_eq!(machine.phase(TAB), SavePhase::ScriptLoaded);
        assert!(machine.state(TAB).is_some_and(|state| state.fragments.is_empty()));
        // Idle again: a new save may start.
        assert!(
            machine
                .handle(start(SaveAction::Save))
                .iter()
                .any(|signal| matches!(signal, CoreSignal::PerformCapture { .. }))
        );
    }

    #[test]
    fn failures_notify_once_with_the_title() {
        let mut machine = loaded_machine(true);
        machine.handle(start(SaveAction::Save));
        let signals = machine.handle(PlatformEvent::CaptureFinished {
            tab: TAB,
            outcome: CaptureOutcome::Failed {
                reason: "Cannot access page".to_owned(),
            },
        });
        let notes: Vec<&CoreSignal> = signals
            .iter()
            .filter(|signal| matches!(signal, CoreSignal::Notify { .. }))
            .collect();
        assert_eq!(
            notes,
            vec![&CoreSignal::Notify {
                message: "Cannot access page:\n > News".to_owned()
            }]
        );
    }

    #[test]
    fn failed_injection_drops_the_parked_start() {
        let mut machine = loaded_machine(false);
        machine.handle(start(SaveAction::Save));
        let signals = machine.handle(PlatformEvent::CaptureFinished {
            tab: TAB,
            outcome: CaptureOutcome::Failed {
                reason: "Cannot load capture script".to_owned(),
            },
        });
        assert!(has_notify(&signals, "Cannot load capture script"));
        assert_eq!(machine.phase(TAB), SavePhase::Committed);
        assert!(machine.state(TAB).is_some_and(|state| state.pending.is_none()));
    }

    #[test]
    fn removal_needs_a_saved_page() {
        let mut machine = loaded_machine(true);
        assert!(has_notify(&machine.handle(start(SaveAction::Remove)), "was not saved"));
        machine.handle(PlatformEvent::PageLoaded {
            tab: TAB,
            url: "https://a.example/news".to_owned(),
            title: "News".to_owned(),
            saved_page: true,
        });
        assert!(
            machine
                .handle(start(SaveAction::Remove))
                .iter()
                .any(|signal| matches!(signal, CoreSignal::PerformCapture { .. }))
        );
    }

    #[test]
    fn closing_the_tab_drops_its_state() {
        let mut machine = loaded_machine(true);
        machine.handle(start(SaveAction::Save));
        assert_eq!(
            machine.handle(PlatformEvent::TabClosed { tab: TAB }),
            vec![CoreSignal::CancelCapture { tab: TAB }]
        );
        assert_eq!(machine.tab_count(), 0);
        assert_eq!(machine.phase(TAB), SavePhase::Unknown);
    }
}
