//! Per-frame three-pass pipeline and the page-level driver.
//!
//! Every accessible frame runs its passes concurrently with the others on
//! the caller's task. A parent only blocks on a sub-frame when it emits the
//! `<frame>`/`<iframe>` element, and then for at most the frame wait.

use crate::frames::FrameContentReply;
use crate::frames::FrameRecord;
use crate::frames::FrameRouter;
use crate::frames::FrameTree;
use crate::frames::discover_frames;
use crate::options::CaptureOptions;
use crate::resources::ResourceReference;
use crate::resources::ResourceTable;
use crate::resources::SequenceAllocator;
use futures::future::join_all;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_core::FrameKey;
use pk_core::SequenceIndex;
use pk_dom::Document;
use pk_dom::NodeId;
use pk_encode::binary_data_url;
use pk_encode::parse_data_url;
use pk_ipc::SaveAction;
use pk_ipc::SavePhase;
use pk_net::FetchMode;
use pk_net::FetchOutcome;
use pk_net::FetchRequest;
use pk_net::ReferrerPolicy;
use pk_net::ResourceFetcher;
use pk_net::url::same_origin;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

pub const CANCELLED: &str = "capture.cancelled";

/// Cooperative cancellation, checked between passes and before each fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> CaptureResult<()> {
        if self.is_cancelled() {
            return Err(CaptureError::new(CANCELLED, "capture cancelled"));
        }
        Ok(())
    }
}

/// Progress reported while a capture runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Top-level frame entered a pass.
    Phase(SavePhase),
    ResourceResolved {
        index: SequenceIndex,
        reason: Option<String>,
    },
    FrameReplied {
        key: FrameKey,
    },
}

/// Counters of one pass of one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub discovered: usize,
    pub dispatched: usize,
    pub resolved: usize,
}

impl PassStats {
    fn absorb(&mut self, other: PassStats) {
        self.discovered += other.discovered;
        self.dispatched += other.dispatched;
        self.resolved += other.resolved;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub key: FrameKey,
    pub style_pass: PassStats,
    pub media_pass: PassStats,
    /// Reason codes of failed references, in discovery order.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPage {
    /// Assembled markup of the top-level frame, or the data URL of an
    /// extracted resource.
    pub html: String,
    pub frames: Vec<FrameReport>,
}

/// Shared state of one save operation.
pub(crate) struct CaptureContext {
    pub(crate) fetcher: ResourceFetcher,
    pub(crate) options: CaptureOptions,
    pub(crate) allocator: SequenceAllocator,
    pub(crate) router: FrameRouter,
    pub(crate) tree: FrameTree,
    pub(crate) cancel: CancelFlag,
    pub(crate) events: Option<UnboundedSender<CaptureEvent>>,
}

impl CaptureContext {
    pub(crate) fn report(&self, event: CaptureEvent) {
        if let Some(events) = &self.events {
            // The listener going away does not stop the capture.
            let _ = events.send(event);
        }
    }
}

/// Capture state of one frame across its three passes.
pub(crate) struct FrameCapture<'a> {
    pub(crate) ctx: &'a CaptureContext,
    pub(crate) frame: &'a FrameRecord,
    pub(crate) document: Arc<Document>,
    pub(crate) table: ResourceTable,
    /// Comment-free text of loaded external sheets by fetch URL.
    pub(crate) sheets: HashMap<String, String>,
    /// Loaded sheet URLs in discovery order.
    pub(crate) sheet_order: Vec<String>,
    /// `@import` nesting level by sheet fetch URL. Linked sheets are level 0.
    pub(crate) sheet_levels: HashMap<String, usize>,
    /// Comment-free text of `<style>` elements.
    pub(crate) inline_styles: Vec<(NodeId, String)>,
    pub(crate) referrer_policy: ReferrerPolicy,
    pub(crate) encoded: HashMap<SequenceIndex, String>,
}

impl<'a> FrameCapture<'a> {
    pub(crate) fn new(ctx: &'a CaptureContext, frame: &'a FrameRecord, document: Arc<Document>) -> Self {
        let referrer_policy = document
            .elements()
            .find(|(_, element)| {
                element.is_html("meta")
                    && element
                        .attr("name")
                        .is_some_and(|name| name.eq_ignore_ascii_case("referrer"))
            })
            .and_then(|(_, element)| element.attr("content"))
            .map(ReferrerPolicy::parse)
            .unwrap_or_default();

        Self {
            ctx,
            frame,
            document,
            table: ResourceTable::new(),
            sheets: HashMap::new(),
            sheet_order: Vec::new(),
            sheet_levels: HashMap::new(),
            inline_styles: Vec::new(),
            referrer_policy,
            encoded: HashMap::new(),
        }
    }

    pub(crate) fn is_top(&self) -> bool {
        self.frame.key.is_root()
    }

    fn report_phase(&self, phase: SavePhase) {
        if self.is_top() {
            self.ctx.report(CaptureEvent::Phase(phase));
        }
    }

    /// Fetches every reference without an outcome, concurrently, and
    /// buffers the outcomes by sequence index.
    pub(crate) async fn fetch_pending(&mut self) -> CaptureResult<PassStats> {
        let pending = self.table.pending();
        let discovered = pending.len();

        let mut requests = Vec::with_capacity(pending.len());
        for reference in &pending {
            self.ctx.cancel.check()?;
            requests.push(self.fetch_request(reference));
        }

        let fetcher = &self.ctx.fetcher;
        let outcomes = join_all(requests.iter().map(|request| fetcher.fetch(request))).await;
        let dispatched = requests.len();

        let mut resolved = 0;
        for (request, outcome) in requests.iter().zip(outcomes) {
            self.ctx.report(CaptureEvent::ResourceResolved {
                index: request.index,
                reason: outcome.failure().map(|reason| reason.code()),
            });
            self.table.resolve(request.index, outcome);
            resolved += 1;
        }

        Ok(PassStats {
            discovered,
            dispatched,
            resolved,
        })
    }

    fn fetch_request(&self, reference: &ResourceReference) -> FetchRequest {
        let document_url = Url::parse(&self.document.url).ok();
        let target = Url::parse(&reference.resolved_url).ok();
        let mode = match (&document_url, &target) {
            (Some(document_url), Some(target)) if same_origin(document_url, target) => FetchMode::Page,
            _ => FetchMode::Privileged,
        };

        FetchRequest {
            index: reference.index,
            url: reference.resolved_url.clone(),
            category: reference.category,
            referrer: Some(reference.referrer.clone()),
            referrer_policy: reference.referrer_policy,
            mode,
            document_secure: document_url.is_some_and(|url| url.scheme() == "https"),
            verified_sender: self.frame.same_origin_with_top,
        }
    }

    /// Waits for the markup of every sub-frame hosted by this document.
    pub(crate) async fn collect_frame_replies(&self) -> HashMap<NodeId, FrameContentReply> {
        let mut replies = HashMap::new();
        let hosts: Vec<NodeId> = self
            .document
            .elements()
            .filter(|(_, element)| element.is_html("iframe") || element.is_html("frame"))
            .map(|(id, _)| id)
            .collect();

        for node in hosts {
            let Some(child_key) = self.ctx.tree.child_key(&self.frame.key, node) else {
                continue;
            };
            let reply = match self.ctx.tree.get(child_key).and_then(|child| child.access.reason()) {
                Some(reason) => FrameContentReply::Unavailable(reason),
                None => {
                    self.ctx
                        .router
                        .request_frame_content(child_key, self.ctx.options.frame_wait)
                        .await
                }
            };
            if let FrameContentReply::Unavailable(reason) = &reply {
                tracing::debug!(target: "pagekeep::frames", key = %child_key, %reason, "frame replaced by placeholder");
            }
            replies.insert(node, reply);
        }
        replies
    }

    async fn run(mut self) -> CaptureResult<(String, FrameReport)> {
        let ctx = self.ctx;
        let cancel = &ctx.cancel;

        cancel.check()?;
        self.report_phase(SavePhase::FirstPass);
        let style_pass = self.style_pass().await?;

        cancel.check()?;
        self.report_phase(SavePhase::SecondPass);
        self.discover_media();
        let media_pass = self.fetch_pending().await?;

        cancel.check()?;
        self.report_phase(SavePhase::ThirdPass);
        let replies = self.collect_frame_replies().await;
        cancel.check()?;
        let html = self.emit(&replies);

        let failures = self
            .table
            .references()
            .iter()
            .filter_map(|reference| {
                let reason = self.table.outcome(reference.index)?.failure()?;
                Some((reference.resolved_url.clone(), reason.code()))
            })
            .collect();

        Ok((
            html,
            FrameReport {
                key: self.frame.key.clone(),
                style_pass,
                media_pass,
                failures,
            },
        ))
    }

    /// Pass 1: style sheets, then `@import` rounds.
    async fn style_pass(&mut self) -> CaptureResult<PassStats> {
        let mut stats = PassStats::default();
        self.discover_styles();
        // Each round fetches one more level of imports.
        for round in 0..=crate::styles::MAX_IMPORT_DEPTH {
            if self.table.pending().is_empty() {
                break;
            }
            let fetched = self.fetch_pending().await?;
            stats.absorb(fetched);
            let loaded = self.absorb_loaded_sheets();
            let added = self.discover_imports(&loaded);
            tracing::trace!(target: "pagekeep::css", frame = %self.frame.key, round, added, "import round");
        }
        Ok(stats)
    }
}

/// Drives one save operation over a page snapshot.
pub struct PageCapture {
    fetcher: ResourceFetcher,
    options: CaptureOptions,
    cancel: CancelFlag,
    events: Option<UnboundedSender<CaptureEvent>>,
}

impl PageCapture {
    pub fn new(fetcher: ResourceFetcher, options: CaptureOptions) -> Self {
        Self {
            fetcher,
            options,
            cancel: CancelFlag::new(),
            events: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<CaptureEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(self, root: Arc<Document>) -> CaptureResult<CapturedPage> {
        if self.options.action == SaveAction::Extract {
            let html = self.extract(&root).await?;
            return Ok(CapturedPage {
                html,
                frames: Vec::new(),
            });
        }

        let tree = discover_frames(root, self.options.max_frame_depth);
        let ctx = CaptureContext {
            fetcher: self.fetcher,
            options: self.options,
            allocator: SequenceAllocator::new(),
            router: FrameRouter::new(),
            tree,
            cancel: self.cancel,
            events: self.events,
        };
        ctx.report(CaptureEvent::Phase(SavePhase::OperationStarted));

        let mut jobs = Vec::new();
        for frame in ctx.tree.accessible() {
            let Some(document) = frame.document.clone() else {
                continue;
            };
            let sender = (!frame.key.is_root()).then(|| ctx.router.expect(frame.key.clone()));
            jobs.push((frame, document, sender));
        }

        let ctx_ref = &ctx;
        let results = join_all(jobs.into_iter().map(|(frame, document, sender)| async move {
            let result = FrameCapture::new(ctx_ref, frame, document).run().await;
            if let (Ok((html, _)), Some(sender)) = (&result, sender) {
                if sender.send(html.clone()) {
                    ctx_ref.report(CaptureEvent::FrameReplied {
                        key: frame.key.clone(),
                    });
                }
            }
            result
        }))
        .await;

        ctx.cancel.check()?;

        let mut page = None;
        let mut frames = Vec::new();
        for result in results {
            match result {
                Ok((html, report)) => {
                    if report.key.is_root() {
                        page = Some(html);
                    }
                    frames.push(report);
                }
                Err(error) if error.code == CANCELLED => return Err(error),
                Err(error) => {
                    tracing::warn!(target: "pagekeep::capture", %error, "frame capture failed");
                }
            }
        }

        let html = page.ok_or_else(|| CaptureError::new("capture.frame.root_missing", "top-level frame produced no markup"))?;
        Ok(CapturedPage { html, frames })
    }

    /// Single-resource extraction: the result is the resource as a data URL.
    async fn extract(&self, root: &Document) -> CaptureResult<String> {
        let Some(raw) = self.options.extract_url.as_deref() else {
            return Err(CaptureError::new("capture.extract.no_target", "no resource selected for extraction"));
        };
        if raw.starts_with("data:") {
            parse_data_url(raw)?;
            return Ok(raw.to_owned());
        }

        let url = pk_net::url::resolve(&root.base_url, raw)
            .ok_or_else(|| CaptureError::new("capture.extract.bad_url", format!("cannot resolve `{raw}`")))?;
        let request = FetchRequest {
            index: SequenceIndex(0),
            url: url.to_string(),
            category: pk_core::ResourceCategory::Other,
            referrer: Some(root.url.clone()),
            referrer_policy: ReferrerPolicy::default(),
            mode: FetchMode::Page,
            document_secure: root.url.starts_with("https:"),
            verified_sender: true,
        };
        match self.fetcher.fetch(&request).await {
            FetchOutcome::Loaded(content) => {
                let mime = (!content.mime_type.is_empty()).then_some(content.mime_type.as_str());
                Ok(binary_data_url(&content.bytes, mime))
            }
            FetchOutcome::Failed(reason) => Err(CaptureError::new(
                "capture.extract.failed",
                format!("could not load `{url}`: {reason}"),
            )),
        }
    }
}
