//! Async save service: owns the state machine and carries out its signals.

use crate::config::SaveConfig;
use crate::machine::SaveStateMachine;
use async_trait::async_trait;
use chrono::Local;
use futures::StreamExt;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use pk_capture::CANCELLED;
use pk_capture::CancelFlag;
use pk_capture::CaptureEvent;
use pk_capture::PageCapture;
use pk_capture::PageInfo;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_core::TabId;
use pk_dom::Document;
use pk_ipc::CaptureOutcome;
use pk_ipc::CaptureParams;
use pk_ipc::ChannelConfig;
use pk_ipc::CoreSignal;
use pk_ipc::DEFAULT_MAX_MESSAGE_BYTES;
use pk_ipc::Endpoint;
use pk_ipc::PlatformEvent;
use pk_ipc::SaveAction;
use pk_ipc::SavePhase;
use pk_ipc::SignalReceiver;
use pk_ipc::SignalSender;
use pk_ipc::UiCommand;
use pk_ipc::chunk_markup;
use pk_ipc::signal_channel;
use pk_net::ResourceFetcher;
use pk_net::ResourceTransport;
use pk_net::is_special_page;
use pk_net::page_allows_downloads;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use tokio::sync::mpsc;

/// Host side of a tab: script injection, lazy content and DOM snapshots.
#[async_trait]
pub trait PagePlatform: Send + Sync {
    async fn inject_capture(&self, tab: TabId) -> CaptureResult<()>;

    /// Scrolls the page so lazily loaded content is fetched.
    async fn load_lazy_content(&self, tab: TabId) -> CaptureResult<()>;

    /// Live DOM of the tab's top-level document, sub-frames attached.
    async fn snapshot(&self, tab: TabId) -> CaptureResult<Arc<Document>>;
}

/// One finished operation ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageJob {
    pub tab: TabId,
    pub action: SaveAction,
    pub fragments: Vec<String>,
    pub file_name: String,
    /// The page's policy sandbox forbids downloads started by the page.
    pub restricted: bool,
}

#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(&self, job: PackageJob) -> CaptureResult<()>;
}

enum TaskDone {
    Capture { tab: TabId, ticket: u64 },
    PageWait { tab: TabId, ticket: u64 },
    Idle,
}

pub struct SaveService {
    core: ServiceCore,
    events: SignalReceiver<PlatformEvent>,
}

struct ServiceCore {
    machine: SaveStateMachine,
    config: Arc<SaveConfig>,
    fetcher: ResourceFetcher,
    platform: Arc<dyn PagePlatform>,
    packager: Arc<dyn Packager>,
    outbound: SignalSender<CoreSignal>,
    loopback: SignalSender<PlatformEvent>,
    running: HashMap<TabId, (u64, CancelFlag)>,
    waiting: HashMap<TabId, (u64, UiCommand)>,
    restricted: Arc<Mutex<HashSet<TabId>>>,
    next_ticket: u64,
    tasks: FuturesUnordered<LocalBoxFuture<'static, TaskDone>>,
}

impl SaveService {
    pub fn new(
        config: SaveConfig,
        transport: Arc<dyn ResourceTransport>,
        platform: Arc<dyn PagePlatform>,
        packager: Arc<dyn Packager>,
        outbound: SignalSender<CoreSignal>,
    ) -> CaptureResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (loopback, events) = signal_channel(ChannelConfig::new(Endpoint::Platform)?)?;
        Ok(Self {
            core: ServiceCore {
                machine: SaveStateMachine::new(Arc::clone(&config)),
                fetcher: ResourceFetcher::new(transport, config.fetch_limits()),
                config,
                platform,
                packager,
                outbound,
                loopback,
                running: HashMap::new(),
                waiting: HashMap::new(),
                restricted: Arc::new(Mutex::new(HashSet::new())),
                next_ticket: 0,
                tasks: FuturesUnordered::new(),
            },
            events,
        })
    }

    /// Sender the platform reports tab events through.
    pub fn event_sender(&self) -> SignalSender<PlatformEvent> {
        self.core.loopback.clone()
    }

    /// Serves commands until the command channel closes and no operation,
    /// packaging job or page wait is left.
    pub async fn run(self, mut commands: SignalReceiver<UiCommand>) {
        let Self { mut core, mut events } = self;
        let mut commands_open = true;
        tracing::info!(target: "pagekeep::session", "save service started");

        loop {
            for event in events.drain() {
                core.on_event(event);
            }
            if !commands_open && core.is_idle() {
                break;
            }

            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(command) => core.on_command(command),
                    None => commands_open = false,
                },
                Some(event) = events.recv() => core.on_event(event),
                Some(done) = core.tasks.next(), if !core.tasks.is_empty() => core.on_task_done(done),
            }
        }
        tracing::info!(target: "pagekeep::session", "save service stopped");
    }
}

impl ServiceCore {
    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.waiting.is_empty()
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn on_command(&mut self, command: UiCommand) {
        let tab = match &command {
            UiCommand::StartSave { tab, .. } | UiCommand::Cancel { tab } => *tab,
        };
        match command {
            UiCommand::StartSave { .. } if self.should_wait(tab) => self.park(tab, command),
            UiCommand::Cancel { .. } if self.waiting.remove(&tab).is_some() => {
                tracing::info!(target: "pagekeep::session", %tab, "queued save dropped");
            }
            command => {
                let signals = self.machine.handle(command);
                self.dispatch(signals);
            }
        }
    }

    fn should_wait(&self, tab: TabId) -> bool {
        !self.waiting.contains_key(&tab)
            && self
                .machine
                .state(tab)
                .is_some_and(|state| !state.loaded && !is_special_page(&state.url))
    }

    fn park(&mut self, tab: TabId, command: UiCommand) {
        let ticket = self.ticket();
        let wait = self.config.max_page_time();
        tracing::info!(target: "pagekeep::session", %tab, ?wait, "waiting for page load");
        self.waiting.insert(tab, (ticket, command));
        self.tasks.push(Box::pin(async move {
            tokio::time::sleep(wait).await;
            TaskDone::PageWait { tab, ticket }
        }));
    }

    fn on_event(&mut self, event: PlatformEvent) {
        let tab = event.tab();
        let loaded = matches!(event, PlatformEvent::PageLoaded { .. });
        let gone = matches!(event, PlatformEvent::Committed { .. } | PlatformEvent::TabClosed { .. });

        let signals = self.machine.handle(event);
        self.dispatch(signals);

        if gone {
            self.waiting.remove(&tab);
            self.restricted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&tab);
        }
        if loaded {
            if let Some((_, command)) = self.waiting.remove(&tab) {
                self.on_command(command);
            }
        }
    }

    fn on_task_done(&mut self, done: TaskDone) {
        match done {
            TaskDone::Capture { tab, ticket } => {
                if self.running.get(&tab).is_some_and(|(current, _)| *current == ticket) {
                    self.running.remove(&tab);
                }
            }
            TaskDone::PageWait { tab, ticket } => {
                if !self.waiting.get(&tab).is_some_and(|(current, _)| *current == ticket) {
                    return;
                }
                if let Some((_, command)) = self.waiting.remove(&tab) {
                    self.machine.assume_loaded(tab);
                    let signals = self.machine.handle(command);
                    self.dispatch(signals);
                }
            }
            TaskDone::Idle => {}
        }
    }

    fn dispatch(&mut self, signals: Vec<CoreSignal>) {
        for signal in signals {
            match signal {
                CoreSignal::InjectCapture { tab } => self.inject(tab),
                CoreSignal::PerformCapture { tab, params } => self.start_capture(tab, params),
                CoreSignal::CancelCapture { tab } => {
                    if let Some((_, cancel)) = self.running.get(&tab) {
                        cancel.cancel();
                    }
                    self.forward(CoreSignal::CancelCapture { tab });
                }
                CoreSignal::Package {
                    tab,
                    action,
                    fragments,
                    file_name,
                } => self.package(tab, action, fragments, file_name),
                other => self.forward(other),
            }
        }
    }

    fn forward(&self, signal: CoreSignal) {
        if let Err(error) = self.outbound.send(signal) {
            tracing::warn!(target: "pagekeep::session", %error, "dropping outbound signal");
        }
    }

    fn inject(&mut self, tab: TabId) {
        let platform = Arc::clone(&self.platform);
        let loopback = self.loopback.clone();
        self.tasks.push(Box::pin(async move {
            let event = match platform.inject_capture(tab).await {
                Ok(()) => PlatformEvent::ScriptLoaded { tab },
                Err(error) => {
                    tracing::warn!(target: "pagekeep::session", %tab, %error, "capture script injection failed");
                    PlatformEvent::CaptureFinished {
                        tab,
                        outcome: CaptureOutcome::Failed {
                            reason: "Cannot load capture script".to_owned(),
                        },
                    }
                }
            };
            send_event(&loopback, event);
            TaskDone::Idle
        }));
    }

    fn start_capture(&mut self, tab: TabId, params: CaptureParams) {
        let ticket = self.ticket();
        let cancel = CancelFlag::new();
        self.running.insert(tab, (ticket, cancel.clone()));
        let (url, title) = self
            .machine
            .state(tab)
            .map(|state| (state.url.clone(), state.title.clone()))
            .unwrap_or_default();

        let job = CaptureJob {
            tab,
            params,
            url,
            title,
            config: Arc::clone(&self.config),
            fetcher: self.fetcher.clone(),
            platform: Arc::clone(&self.platform),
            loopback: self.loopback.clone(),
            outbound: self.outbound.clone(),
            restricted: Arc::clone(&self.restricted),
            cancel,
        };
        self.tasks.push(Box::pin(async move {
            job.run().await;
            TaskDone::Capture { tab, ticket }
        }));
    }

    fn package(&mut self, tab: TabId, action: SaveAction, fragments: Vec<String>, file_name: String) {
        let restricted = self
            .restricted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tab);
        let job = PackageJob {
            tab,
            action,
            fragments,
            file_name,
            restricted,
        };
        let packager = Arc::clone(&self.packager);
        let loopback = self.loopback.clone();
        self.tasks.push(Box::pin(async move {
            let file_name = job.file_name.clone();
            let success = match packager.package(job).await {
                Ok(()) => {
                    tracing::info!(target: "pagekeep::session", %tab, %file_name, "saved");
                    true
                }
                Err(error) => {
                    tracing::warn!(target: "pagekeep::session", %tab, %file_name, %error, "packaging failed");
                    false
                }
            };
            send_event(&loopback, PlatformEvent::PackageFinished { tab, success });
            TaskDone::Idle
        }));
    }
}

fn send_event(loopback: &SignalSender<PlatformEvent>, event: PlatformEvent) {
    if let Err(error) = loopback.send(event) {
        tracing::warn!(target: "pagekeep::session", %error, "dropping platform event");
    }
}

/// One capture run for one tab.
struct CaptureJob {
    tab: TabId,
    params: CaptureParams,
    url: String,
    title: String,
    config: Arc<SaveConfig>,
    fetcher: ResourceFetcher,
    platform: Arc<dyn PagePlatform>,
    loopback: SignalSender<PlatformEvent>,
    outbound: SignalSender<CoreSignal>,
    restricted: Arc<Mutex<HashSet<TabId>>>,
    cancel: CancelFlag,
}

impl CaptureJob {
    async fn run(self) {
        let tab = self.tab;
        let outcome = match self.capture().await {
            Ok(()) => CaptureOutcome::Completed,
            Err(error) if error.code == CANCELLED => CaptureOutcome::Terminated,
            Err(error) => {
                tracing::warn!(target: "pagekeep::session", %tab, %error, "capture failed");
                CaptureOutcome::Failed {
                    reason: error.message,
                }
            }
        };
        send_event(&self.loopback, PlatformEvent::CaptureFinished { tab, outcome });
    }

    async fn capture(&self) -> CaptureResult<()> {
        let tab = self.tab;
        if !page_allows_downloads(self.fetcher.transport().as_ref(), &self.url).await {
            tracing::debug!(target: "pagekeep::session", %tab, "page policy restricts downloads");
            self.restricted
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(tab);
        }
        self.cancel.check()?;

        if self.params.action == SaveAction::Save && self.config.lazy_load_for(&self.params) {
            send_event(
                &self.loopback,
                PlatformEvent::PhaseReport {
                    tab,
                    phase: SavePhase::LazyLoad,
                },
            );
            if let Err(error) = self.platform.load_lazy_content(tab).await {
                tracing::warn!(target: "pagekeep::session", %tab, %error, "lazy content not loaded");
            }
            self.cancel.check()?;
        }

        let document = self.platform.snapshot(tab).await.map_err(|error| {
            tracing::warn!(target: "pagekeep::session", %tab, %error, "snapshot failed");
            CaptureError::new("session.page.unavailable", "Cannot access page")
        })?;
        self.cancel.check()?;

        let page_info = PageInfo {
            url: self.url.clone(),
            title: self.title.clone(),
            date: Local::now().format("%a %b %d %Y %H:%M:%S GMT%z").to_string(),
        };
        let options = self.config.capture_options(&self.params, Some(page_info));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let capture = PageCapture::new(self.fetcher.clone(), options)
            .with_cancel(self.cancel.clone())
            .with_events(event_tx);
        let (result, ()) = tokio::join!(capture.run(document), self.forward_events(event_rx));
        let page = result?;

        if self.config.debug {
            for frame in &page.frames {
                for (url, code) in &frame.failures {
                    tracing::debug!(target: "pagekeep::fetch", %tab, frame = %frame.key, %url, %code, "resource not embedded");
                }
            }
        }
        for (index, html) in chunk_markup(&page.html, DEFAULT_MAX_MESSAGE_BYTES)
            .into_iter()
            .enumerate()
        {
            send_event(&self.loopback, PlatformEvent::FragmentReady { tab, index, html });
        }
        Ok(())
    }

    async fn forward_events(&self, mut events: mpsc::UnboundedReceiver<CaptureEvent>) {
        let tab = self.tab;
        while let Some(event) = events.recv().await {
            match event {
                CaptureEvent::Phase(phase) => {
                    send_event(&self.loopback, PlatformEvent::PhaseReport { tab, phase });
                }
                CaptureEvent::ResourceResolved { index, reason } => {
                    if let Err(error) = self.outbound.send(CoreSignal::ResourceResolved { tab, index, reason }) {
                        tracing::debug!(target: "pagekeep::session", %error, "progress dropped");
                    }
                }
                CaptureEvent::FrameReplied { key } => {
                    if let Err(error) = self.outbound.send(CoreSignal::FrameReplied { tab, key }) {
                        tracing::debug!(target: "pagekeep::session", %error, "progress dropped");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PackageJob;
    use super::Packager;
    use super::PagePlatform;
    use super::SaveService;
    use crate::config::SaveConfig;
    use async_trait::async_trait;
    use pk_core::CaptureError;
    use pk_core::CaptureResult;
    use pk_core::TabId;
    use pk_dom::Document;
    use pk_html::HtmlParser;
    use pk_ipc::ChannelConfig;
    use pk_ipc::CoreSignal;
    use pk_ipc::Endpoint;
    use pk_ipc::PlatformEvent;
    use pk_ipc::SaveAction;
    use pk_ipc::SavedItems;
    use pk_ipc::SignalReceiver;
    use pk_ipc::SignalSender;
    use pk_ipc::UiCommand;
    use pk_ipc::signal_channel;
    use pk_net::Header;
    use pk_net::HttpResponse;
    use pk_net::ResourceTransport;
    use pk_net::ResponseHead;
    use pk_net::TransportRequest;
    use pk_net::http::HttpVersion;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::PoisonError;
    use std::time::Duration;

    const TAB: TabId = TabId(1);
    const PAGE: &str = "http://x/gallery.html";

    #[derive(Default)]
    struct SlowTransport {
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl ResourceTransport for SlowTransport {
        async fn send(&self, request: TransportRequest) -> CaptureResult<HttpResponse> {
            if let Some(delay) = self.delays.get(&request.url) {
                tokio::time::sleep(*delay).await;
            }
            let (content_type, body): (&str, &[u8]) = if request.url.ends_with(".png") {
                ("image/png", b"png")
            } else if request.url == PAGE {
                ("text/html", b"")
            } else {
                return Err(CaptureError::new("net.tcp.connect_failed", "no route"));
            };
            let head = ResponseHead {
                version: HttpVersion::Http11,
                status: 200,
                headers: vec![Header::new("Content-Type", content_type)?],
            };
            let body_read = (request.body_gate)(&head);
            Ok(HttpResponse {
                head,
                body: if body_read { body.to_vec() } else { Vec::new() },
                body_read,
            })
        }
    }

    struct StaticPage {
        html: String,
    }

    #[async_trait]
    impl PagePlatform for StaticPage {
        async fn inject_capture(&self, _tab: TabId) -> CaptureResult<()> {
            Ok(())
        }

        async fn load_lazy_content(&self, _tab: TabId) -> CaptureResult<()> {
            Ok(())
        }

        async fn snapshot(&self, _tab: TabId) -> CaptureResult<Arc<Document>> {
            Ok(Arc::new(HtmlParser.parse(&self.html, PAGE)))
        }
    }

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<PackageJob>>,
    }

    impl Recorder {
        fn jobs(&self) -> Vec<PackageJob> {
            self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    #[async_trait]
    impl Packager for Recorder {
        async fn package(&self, job: PackageJob) -> CaptureResult<()> {
            self.jobs.lock().unwrap_or_else(PoisonError::into_inner).push(job);
            Ok(())
        }
    }

    struct Harness {
        service: SaveService,
        commands: SignalSender<UiCommand>,
        command_rx: SignalReceiver<UiCommand>,
        outbound: SignalReceiver<CoreSignal>,
        packager: Arc<Recorder>,
    }

    fn harness(transport: SlowTransport) -> Harness {
        let platform = Arc::new(StaticPage {
            html: "<html><head><title>Gallery</title></head><body><img src=\"a.png\"></body></html>".to_owned(),
        });
        let packager = Arc::new(Recorder::default());
        let config = ChannelConfig::new(Endpoint::Core).unwrap_or_else(|_| unreachable!());
        let (outbound_tx, outbound) = signal_channel(config).unwrap_or_else(|_| unreachable!());
        let config = ChannelConfig::new(Endpoint::Ui).unwrap_or_else(|_| unreachable!());
        let (commands, command_rx) = signal_channel(config).unwrap_or_else(|_| unreachable!());
        let service = match SaveService::new(
            SaveConfig::default(),
            Arc::new(transport),
            platform,
            packager.clone(),
            outbound_tx,
        ) {
            Ok(service) => service,
            Err(error) => panic!("{error}"),
        };
        Harness {
            service,
            commands,
            command_rx,
            outbound,
            packager,
        }
    }

    fn open_page(service: &SaveService, loaded: bool) {
        let events = service.event_sender();
        let committed = events.send(PlatformEvent::Committed {
            tab: TAB,
            url: PAGE.to_owned(),
        });
        assert!(committed.is_ok());
        if loaded {
            let loaded = events.send(PlatformEvent::PageLoaded {
                tab: TAB,
                url: PAGE.to_owned(),
                title: "Gallery".to_owned(),
                saved_page: false,
            });
            assert!(loaded.is_ok());
        }
    }

    fn save() -> UiCommand {
        UiCommand::StartSave {
            tab: TAB,
            action: SaveAction::Save,
            items: SavedItems::Standard,
            toggle_lazy: false,
            extract_url: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn save_runs_to_packaging() {
        let Harness {
            service,
            commands,
            command_rx,
            mut outbound,
            packager,
        } = harness(SlowTransport::default());
        open_page(&service, true);
        assert!(commands.send(save()).is_ok());
        drop(commands);

        service.run(command_rx).await;

        let jobs = packager.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_name, "Gallery.html");
        assert!(!jobs[0].restricted);
        let html = jobs[0].fragments.concat();
        assert!(html.contains("src=\"data:image/png;base64,cG5n\""));
        assert!(html.contains("savepage-url"));

        let signals = outbound.drain();
        assert!(signals.iter().any(|signal| matches!(signal, CoreSignal::ResourceResolved { reason: None, .. })));
        assert!(signals.iter().any(
            |signal| matches!(signal, CoreSignal::Badge { badge, .. } if badge.text == "Sav" && badge.color == "#A0A0A0")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_in_second_pass_returns_to_idle() {
        let transport = SlowTransport {
            delays: HashMap::from([("http://x/a.png".to_owned(), Duration::from_secs(5))]),
        };
        let Harness {
            service,
            commands,
            command_rx,
            mut outbound,
            packager,
        } = harness(transport);
        open_page(&service, true);
        assert!(commands.send(save()).is_ok());

        let mut seen = Vec::new();
        let driver = async {
            while let Some(signal) = outbound.recv().await {
                let second_pass =
                    matches!(&signal, CoreSignal::Badge { badge, .. } if badge.color == "#A000D0");
                seen.push(signal);
                if second_pass {
                    assert!(commands.send(UiCommand::Cancel { tab: TAB }).is_ok());
                    break;
                }
            }
            drop(commands);
        };
        tokio::join!(service.run(command_rx), driver);
        seen.extend(outbound.drain());

        assert!(packager.jobs().is_empty());
        assert!(seen.contains(&CoreSignal::CancelCapture { tab: TAB }));
        let last_badge = seen.iter().rev().find_map(|signal| match signal {
            CoreSignal::Badge { badge, .. } => Some(badge.text),
            _ => None,
        });
        assert_eq!(last_badge, Some(""));
        assert!(!seen.iter().any(|signal| matches!(signal, CoreSignal::Notify { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unloaded_page_is_saved_after_the_wait() {
        let Harness {
            service,
            commands,
            command_rx,
            outbound: _outbound,
            packager,
        } = harness(SlowTransport::default());
        open_page(&service, false);
        assert!(commands.send(save()).is_ok());
        drop(commands);

        let started = tokio::time::Instant::now();
        service.run(command_rx).await;

        assert!(started.elapsed() >= Duration::from_secs(10));
        let jobs = packager.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_name, "x.html");
    }

    #[tokio::test]
    async fn special_pages_only_notify() {
        let Harness {
            service,
            commands,
            command_rx,
            mut outbound,
            packager,
        } = harness(SlowTransport::default());
        let sent = service.event_sender().send(PlatformEvent::Committed {
            tab: TAB,
            url: "about:addons".to_owned(),
        });
        assert!(sent.is_ok());
        assert!(commands.send(save()).is_ok());
        drop(commands);

        service.run(command_rx).await;

        assert!(packager.jobs().is_empty());
        assert!(outbound.drain().iter().any(
            |signal| matches!(signal, CoreSignal::Notify { message } if message.starts_with("Cannot save special page"))
        ));
    }
}
