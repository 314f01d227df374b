//! Resource fetch policy: referrer, mixed content, size, type and time limits.
//!
//! A fetch never fails the save. Every refusal or transport problem is folded
//! into a [`FailureReason`] whose code ends up next to the reference in the
//! saved page.

use crate::client::BODY_TOO_LARGE;
use crate::http::HttpResponse;
use crate::http::ResponseHead;
use crate::resource::ResourceTransport;
use crate::resource::TransportRequest;
use crate::url::origin_of;
use crate::url::same_origin;
use pk_core::CaptureError;
use pk_core::ResourceCategory;
use pk_core::SequenceIndex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const FETCH_TARGET: &str = "pagekeep::fetch";

/// Referrer policies a page can declare (`<meta name=referrer>`,
/// `referrerpolicy` attributes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferrerPolicy {
    NoReferrer,
    NoReferrerWhenDowngrade,
    Origin,
    OriginWhenCrossOrigin,
    SameOrigin,
    StrictOrigin,
    #[default]
    StrictOriginWhenCrossOrigin,
    UnsafeUrl,
}

impl ReferrerPolicy {
    /// Parses a policy token; empty or unknown tokens give the default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "no-referrer" => Self::NoReferrer,
            "no-referrer-when-downgrade" => Self::NoReferrerWhenDowngrade,
            "origin" => Self::Origin,
            "origin-when-cross-origin" => Self::OriginWhenCrossOrigin,
            "same-origin" => Self::SameOrigin,
            "strict-origin" => Self::StrictOrigin,
            "unsafe-url" => Self::UnsafeUrl,
            _ => Self::StrictOriginWhenCrossOrigin,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoReferrer => "no-referrer",
            Self::NoReferrerWhenDowngrade => "no-referrer-when-downgrade",
            Self::Origin => "origin",
            Self::OriginWhenCrossOrigin => "origin-when-cross-origin",
            Self::SameOrigin => "same-origin",
            Self::StrictOrigin => "strict-origin",
            Self::StrictOriginWhenCrossOrigin => "strict-origin-when-cross-origin",
            Self::UnsafeUrl => "unsafe-url",
        }
    }
}

/// How much of the referrer cross-origin requests reveal (`cross_origin`
/// option: 0 keeps the page policy, 1 sends the full URL where the page
/// policy would have cut it down to the origin).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossOriginReferrer {
    #[default]
    OriginOnly,
    FullUrl,
}

impl CrossOriginReferrer {
    pub fn from_option(value: u8) -> Self {
        if value == 1 { Self::FullUrl } else { Self::OriginOnly }
    }

    fn effective(self, policy: ReferrerPolicy) -> ReferrerPolicy {
        match (self, policy) {
            (Self::FullUrl, ReferrerPolicy::StrictOriginWhenCrossOrigin) => {
                ReferrerPolicy::NoReferrerWhenDowngrade
            }
            (Self::FullUrl, ReferrerPolicy::OriginWhenCrossOrigin) => ReferrerPolicy::UnsafeUrl,
            (_, policy) => policy,
        }
    }
}

/// `Referer` header value for a request to `target` made by a document at
/// `referrer`, or `None` when the policy withholds it.
pub fn referrer_header(policy: ReferrerPolicy, referrer: &Url, target: &Url) -> Option<String> {
    if !matches!(referrer.scheme(), "http" | "https") {
        return None;
    }

    let mut full = referrer.clone();
    full.set_fragment(None);
    let _ = full.set_username("");
    let _ = full.set_password(None);
    let full = full.to_string();
    let origin = format!("{}/", origin_of(referrer));
    let downgrade = referrer.scheme() == "https" && target.scheme() == "http";
    let same = same_origin(referrer, target);

    match policy {
        ReferrerPolicy::NoReferrer => None,
        ReferrerPolicy::NoReferrerWhenDowngrade => (!downgrade).then_some(full),
        ReferrerPolicy::Origin => Some(origin),
        ReferrerPolicy::OriginWhenCrossOrigin => Some(if same { full } else { origin }),
        ReferrerPolicy::SameOrigin => same.then_some(full),
        ReferrerPolicy::StrictOrigin => (!downgrade).then_some(origin),
        ReferrerPolicy::StrictOriginWhenCrossOrigin => {
            if same {
                Some(full)
            } else if downgrade {
                None
            } else {
                Some(origin)
            }
        }
        ReferrerPolicy::UnsafeUrl => Some(full),
    }
}

/// Who performs the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Same-origin with the frame, as the page itself would fetch it.
    Page,
    /// Elevated cross-origin fetch; only known-safe content types are kept.
    Privileged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub index: SequenceIndex,
    pub url: String,
    pub category: ResourceCategory,
    pub referrer: Option<String>,
    pub referrer_policy: ReferrerPolicy,
    pub mode: FetchMode,
    /// The requesting document was served over https.
    pub document_secure: bool,
    /// The request comes from a document same-origin with the top-level
    /// page. Privileged fetches for anything else are ignored.
    pub verified_sender: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchLimits {
    pub max_resource_bytes: u64,
    pub timeout: Duration,
    pub allow_passive: bool,
    pub cross_origin: CrossOriginReferrer,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_resource_bytes: 50 * 1024 * 1024,
            timeout: Duration::from_secs(10),
            allow_passive: false,
            cross_origin: CrossOriginReferrer::OriginOnly,
        }
    }
}

/// Why a resource was not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MaxSize,
    Blocked,
    Load(u16),
    MaxTime,
    FetchError,
    Ignored,
    Mixed,
}

impl FailureReason {
    /// Reason code recorded in the saved page (`load:404*`, `maxsize*`, ...).
    pub fn code(self) -> String {
        match self {
            Self::MaxSize => "maxsize*".to_owned(),
            Self::Blocked => "blocked*".to_owned(),
            Self::Load(status) => format!("load:{status}*"),
            Self::MaxTime => "maxtime*".to_owned(),
            Self::FetchError => "fetcherr*".to_owned(),
            Self::Ignored => "ignored*".to_owned(),
            Self::Mixed => "mixed*".to_owned(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Loaded bytes plus the lower-cased `Content-Type` parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceContent {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub charset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Loaded(ResourceContent),
    Failed(FailureReason),
}

impl FetchOutcome {
    pub fn content(&self) -> Option<&ResourceContent> {
        match self {
            Self::Loaded(content) => Some(content),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            Self::Loaded(_) => None,
            Self::Failed(reason) => Some(*reason),
        }
    }
}

/// Content types a privileged fetch may keep.
pub fn is_allowed_content_type(mime_type: &str) -> bool {
    mime_type == "text/css"
        || mime_type == "image/vnd.microsoft.icon"
        || mime_type.starts_with("image/")
        || mime_type.starts_with("audio/")
        || mime_type.starts_with("video/")
}

#[derive(Clone)]
pub struct ResourceFetcher {
    transport: Arc<dyn ResourceTransport>,
    limits: FetchLimits,
}

impl ResourceFetcher {
    pub fn new(transport: Arc<dyn ResourceTransport>, limits: FetchLimits) -> Self {
        Self { transport, limits }
    }

    pub fn limits(&self) -> &FetchLimits {
        &self.limits
    }

    pub fn transport(&self) -> &Arc<dyn ResourceTransport> {
        &self.transport
    }

    pub async fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        match self.try_fetch(request).await {
            Ok(content) => {
                tracing::trace!(
                    target: FETCH_TARGET,
                    index = %request.index,
                    url = %request.url,
                    bytes = content.bytes.len(),
                    "resource loaded"
                );
                FetchOutcome::Loaded(content)
            }
            Err(reason) => {
                tracing::debug!(
                    target: FETCH_TARGET,
                    index = %request.index,
                    url = %request.url,
                    category = %request.category,
                    reason = %reason,
                    "resource not loaded"
                );
                FetchOutcome::Failed(reason)
            }
        }
    }

    async fn try_fetch(&self, request: &FetchRequest) -> Result<ResourceContent, FailureReason> {
        let target = Url::parse(&request.url).map_err(|_| FailureReason::FetchError)?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(FailureReason::Ignored);
        }
        if request.mode == FetchMode::Privileged && !request.verified_sender {
            return Err(FailureReason::Ignored);
        }

        if request.document_secure && target.scheme() == "http" {
            let passive_allowed = self.limits.allow_passive && request.category.is_passive();
            if !passive_allowed {
                return Err(FailureReason::Mixed);
            }
        }

        let mut transport_request = TransportRequest::get(target.as_str())
            .with_header("Cache-Control", "no-cache")
            .with_header("Pragma", "no-cache")
            .with_body_limit(Some(self.limits.max_resource_bytes))
            .with_body_gate(self.body_gate(request.mode));
        if let Some(referer) = self.referer_for(request, &target) {
            transport_request = transport_request.with_header("Referer", &referer);
        }

        let deadline = tokio::time::sleep(self.limits.timeout);
        tokio::pin!(deadline);
        let response = tokio::select! {
            biased;
            () = &mut deadline => return Err(FailureReason::MaxTime),
            result = self.transport.send(transport_request) => result,
        };

        let response = response.map_err(|error| transport_failure(&error))?;
        self.accept(request.mode, response)
    }

    fn referer_for(&self, request: &FetchRequest, target: &Url) -> Option<String> {
        let referrer = Url::parse(request.referrer.as_deref()?).ok()?;
        let policy = if same_origin(&referrer, target) {
            request.referrer_policy
        } else {
            self.limits.cross_origin.effective(request.referrer_policy)
        };
        referrer_header(policy, &referrer, target)
    }

    fn body_gate(&self, mode: FetchMode) -> crate::resource::BodyGate {
        let max = self.limits.max_resource_bytes;
        Arc::new(move |head: &ResponseHead| {
            head.status == 200
                && head.content_length().is_none_or(|length| length <= max)
                && (mode == FetchMode::Page || is_allowed_content_type(&head.mime_type()))
        })
    }

    fn accept(&self, mode: FetchMode, response: HttpResponse) -> Result<ResourceContent, FailureReason> {
        let head = &response.head;
        if head.status != 200 {
            return Err(FailureReason::Load(head.status));
        }
        if head
            .content_length()
            .is_some_and(|length| length > self.limits.max_resource_bytes)
        {
            return Err(FailureReason::MaxSize);
        }
        let mime_type = head.mime_type();
        if mode == FetchMode::Privileged && !is_allowed_content_type(&mime_type) {
            return Err(FailureReason::Blocked);
        }
        if !response.body_read {
            return Err(FailureReason::FetchError);
        }
        if response.body.len() as u64 > self.limits.max_resource_bytes {
            return Err(FailureReason::MaxSize);
        }

        let charset = head.charset();
        Ok(ResourceContent {
            bytes: response.body,
            mime_type,
            charset,
        })
    }
}

fn transport_failure(error: &CaptureError) -> FailureReason {
    if error.code == BODY_TOO_LARGE {
        FailureReason::MaxSize
    } else {
        FailureReason::FetchError
    }
}
