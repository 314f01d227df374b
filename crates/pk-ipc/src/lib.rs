//! Typed signal channels between the UI, the save core and the platform.

pub mod messages;

use pk_core::CaptureError;
use pk_core::CaptureResult;
use std::time::Duration;
use tokio::sync::mpsc;

pub use messages::BadgeUpdate;
pub use messages::CaptureOutcome;
pub use messages::CaptureParams;
pub use messages::CoreSignal;
pub use messages::PayloadSize;
pub use messages::PlatformEvent;
pub use messages::SaveAction;
pub use messages::SavePhase;
pub use messages::SavedItems;
pub use messages::UiCommand;

/// Default limit for one message payload; assembled pages travel as
/// several `FragmentReady` chunks of at most this size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
const HARD_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Parties exchanging signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Ui,
    Core,
    Platform,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Core => "core",
            Self::Platform => "platform",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub endpoint: Endpoint,
    pub max_message_bytes: usize,
}

impl ChannelConfig {
    pub fn new(endpoint: Endpoint) -> CaptureResult<Self> {
        Self::with_limit(endpoint, DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(endpoint: Endpoint, max_message_bytes: usize) -> CaptureResult<Self> {
        let config = Self {
            endpoint,
            max_message_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.max_message_bytes == 0 {
            return Err(CaptureError::new(
                "ipc.max_message_bytes_invalid",
                "channel max_message_bytes must be greater than zero",
            ));
        }

        if self.max_message_bytes > HARD_MAX_MESSAGE_BYTES {
            return Err(CaptureError::new(
                "ipc.max_message_bytes_too_large",
                "channel max_message_bytes exceeds hard limit (64 MiB)",
            ));
        }

        Ok(())
    }
}

/// Sending half; rejects payloads over the configured limit.
pub struct SignalSender<T> {
    tx: mpsc::UnboundedSender<T>,
    config: ChannelConfig,
}

impl<T> Clone for SignalSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: PayloadSize> SignalSender<T> {
    pub fn endpoint(&self) -> Endpoint {
        self.config.endpoint
    }

    pub fn send(&self, message: T) -> CaptureResult<()> {
        let size = message.payload_bytes();
        if size > self.config.max_message_bytes {
            return Err(CaptureError::new(
                "ipc.message_too_large",
                format!(
                    "payload exceeds max_message_bytes ({size} > {})",
                    self.config.max_message_bytes
                ),
            ));
        }

        self.tx.send(message).map_err(|_| {
            CaptureError::new(
                "ipc.send_failed",
                format!(
                    "receiver of {} endpoint is gone",
                    self.config.endpoint.as_str()
                ),
            )
        })
    }
}

pub struct SignalReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    endpoint: Endpoint,
}

impl<T> SignalReceiver<T> {
    /// `None` once every sender is dropped and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> CaptureResult<T> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(CaptureError::new(
                "ipc.recv_failed",
                format!("all senders to {} endpoint are gone", self.endpoint.as_str()),
            )),
            Err(_) => Err(CaptureError::new(
                "ipc.recv_timeout",
                format!("no message for {} endpoint within {timeout:?}", self.endpoint.as_str()),
            )),
        }
    }

    /// Drains what is already queued without waiting.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }
}

pub fn signal_channel<T>(config: ChannelConfig) -> CaptureResult<(SignalSender<T>, SignalReceiver<T>)> {
    config.validate()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let endpoint = config.endpoint;
    Ok((SignalSender { tx, config }, SignalReceiver { rx, endpoint }))
}

/// Core side of the core/platform link.
pub struct CoreLink {
    pub signals: SignalSender<CoreSignal>,
    pub events: SignalReceiver<PlatformEvent>,
}

/// Platform side of the core/platform link.
pub struct PlatformLink {
    pub events: SignalSender<PlatformEvent>,
    pub signals: SignalReceiver<CoreSignal>,
}

/// Creates the paired core/platform endpoints.
pub fn core_platform_pair(
    core: ChannelConfig,
    platform: ChannelConfig,
) -> CaptureResult<(CoreLink, PlatformLink)> {
    let (signal_tx, signal_rx) = signal_channel(core)?;
    let (event_tx, event_rx) = signal_channel(platform)?;
    Ok((
        CoreLink {
            signals: signal_tx,
            events: event_rx,
        },
        PlatformLink {
            events: event_tx,
            signals: signal_rx,
        },
    ))
}

/// Splits markup into chunks of at most `max_bytes`, never inside a UTF-8
/// sequence. Empty input gives one empty chunk.
pub fn chunk_markup(html: &str, max_bytes: usize) -> Vec<String> {
    if html.is_empty() || max_bytes == 0 {
        return vec![html.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < html.len() {
        let mut end = (start + max_bytes).min(html.len());
        while !html.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // A single character wider than the limit still has to travel.
            end = start + html[start..].chars().next().map_or(1, char::len_utf8);
        }
        chunks.push(html[start..end].to_owned());
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::ChannelConfig;
    use super::CoreSignal;
    use super::Endpoint;
    use super::PlatformEvent;
    use super::chunk_markup;
    use super::core_platform_pair;
    use super::signal_channel;
    use pk_core::TabId;
    use std::time::Duration;

    #[test]
    fn rejects_zero_and_oversized_limits() {
        assert!(ChannelConfig::with_limit(Endpoint::Core, 0).is_err());
        assert!(ChannelConfig::with_limit(Endpoint::Core, usize::MAX).is_err());
        assert!(ChannelConfig::new(Endpoint::Platform).is_ok());
    }

    #[tokio::test]
    async fn link_carries_signals_both_ways() {
        let core_config = ChannelConfig::new(Endpoint::Core).unwrap_or_else(|_| unreachable!());
        let platform_config = ChannelConfig::new(Endpoint::Platform).unwrap_or_else(|_| unreachable!());
        let (mut core, mut platform) =
            core_platform_pair(core_config, platform_config).unwrap_or_else(|_| unreachable!());

        let sent = core.signals.send(CoreSignal::InjectCapture { tab: TabId(3) });
        assert!(sent.is_ok());
        assert_eq!(
            platform.signals.recv().await,
            Some(CoreSignal::InjectCapture { tab: TabId(3) })
        );

        let sent = platform.events.send(PlatformEvent::ScriptLoaded { tab: TabId(3) });
        assert!(sent.is_ok());
        assert_eq!(core.events.drain(), vec![PlatformEvent::ScriptLoaded { tab: TabId(3) }]);
    }

    #[test]
    fn oversized_fragment_is_rejected() {
        let config = ChannelConfig::with_limit(Endpoint::Platform, 4).unwrap_or_else(|_| unreachable!());
        let (tx, _rx) = signal_channel::<PlatformEvent>(config).unwrap_or_else(|_| unreachable!());
        let result = tx.send(PlatformEvent::FragmentReady {
            tab: TabId(1),
            index: 0,
            html: "<html>".to_owned(),
        });
        assert!(matches!(result, Err(ref error) if error.code == "ipc.message_too_large"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_times_out() {
        let config = ChannelConfig::new(Endpoint::Core).unwrap_or_else(|_| unreachable!());
        let (_tx, mut rx) = signal_channel::<PlatformEvent>(config).unwrap_or_else(|_| unreachable!());
        let result = rx.recv_timeout(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ref error) if error.code == "ipc.recv_timeout"));
    }

    #[test]
    fn chunks_respect_char_boundaries() {
        let chunks = chunk_markup("aé€b", 2);
        assert_eq!(chunks.concat(), "aé€b");
        assert!(chunks.iter().all(|chunk| !chunk.is_empty()));
        assert_eq!(chunk_markup("", 8), vec![String::new()]);
        assert_eq!(chunk_markup("€", 1), vec!["€".to_owned()]);
    }
}
