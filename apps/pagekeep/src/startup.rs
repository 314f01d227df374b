use crate::cli::Cli;
use crate::cli::Command;
use crate::cli::PageTarget;
use crate::logging;
use crate::packager::FilePackager;
use crate::platform::FileSnapshot;
use clap::Parser;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_core::TabId;
use pk_ipc::ChannelConfig;
use pk_ipc::CoreSignal;
use pk_ipc::Endpoint;
use pk_ipc::PlatformEvent;
use pk_ipc::UiCommand;
use pk_ipc::signal_channel;
use pk_net::HttpTransport;
use pk_net::ResourceTransport;
use pk_net::TlsPolicy;
use pk_session::DEFAULT_CONFIG_FILE;
use pk_session::SaveConfig;
use pk_session::SaveService;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

pub(crate) fn run() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("pagekeep: {error}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    if config.debug && !config.logging.level.contains("pagekeep::fetch") {
        config.logging.level.push_str(",pagekeep::fetch=debug");
    }
    if let Err(error) = logging::init_logging(&config.logging) {
        eprintln!("pagekeep: {error}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("pagekeep: cannot start runtime: {error}");
            return ExitCode::FAILURE;
        }
    };
    let results = match runtime.block_on(save_pages(&cli, config)) {
        Ok(results) => results,
        Err(error) => {
            tracing::error!(target: "pagekeep::app", %error, "save failed");
            eprintln!("pagekeep: {}", error.message);
            return ExitCode::FAILURE;
        }
    };
    let mut status = ExitCode::SUCCESS;
    for result in results {
        match result {
            Ok(path) => println!("{}", path.display()),
            Err(error) => {
                tracing::error!(target: "pagekeep::app", %error, "save failed");
                eprintln!("pagekeep: {}", error.message);
                status = ExitCode::FAILURE;
            }
        }
    }
    status
}

fn load_config(path: Option<&Path>) -> CaptureResult<SaveConfig> {
    match path {
        Some(path) => SaveConfig::load(path),
        None => SaveConfig::load_or_default(Path::new(DEFAULT_CONFIG_FILE)),
    }
}

async fn save_pages(cli: &Cli, config: SaveConfig) -> CaptureResult<Vec<CaptureResult<PathBuf>>> {
    let targets = cli.command.targets()?;
    let transport: Arc<dyn ResourceTransport> =
        Arc::new(HttpTransport::new(TlsPolicy::default(), config.fetch_limits().timeout)?);
    Ok(save_batch(&cli.command, &targets, &config, transport).await)
}

/// Saves every page one after another, each in its own tab. A page that
/// fails does not stop the ones after it.
async fn save_batch(
    command: &Command,
    targets: &[PageTarget],
    config: &SaveConfig,
    transport: Arc<dyn ResourceTransport>,
) -> Vec<CaptureResult<PathBuf>> {
    let output = &command.page().output;
    let batch = targets.len();
    let mut results = Vec::with_capacity(batch);
    for (target, tab) in targets.iter().zip((1..).map(TabId)) {
        tracing::info!(target: "pagekeep::app", %tab, page = %target.input.display(), batch, "saving page");
        let saved = match FileSnapshot::load(&target.input, target.url.as_deref()) {
            Ok(snapshot) => {
                save_with(
                    tab,
                    command.start(tab, config),
                    config.clone(),
                    Arc::clone(&transport),
                    Arc::new(snapshot),
                    Arc::new(FilePackager::new(output.clone())),
                )
                .await
            }
            Err(error) => Err(error),
        };
        results.push(saved);
    }
    results
}

/// Runs one operation through the save service and returns the written path.
async fn save_with(
    tab: TabId,
    command: UiCommand,
    config: SaveConfig,
    transport: Arc<dyn ResourceTransport>,
    snapshot: Arc<FileSnapshot>,
    packager: Arc<FilePackager>,
) -> CaptureResult<PathBuf> {
    let (outbound_tx, mut outbound) = signal_channel(ChannelConfig::new(Endpoint::Ui)?)?;
    let (commands, command_rx) = signal_channel(ChannelConfig::new(Endpoint::Core)?)?;
    let service = SaveService::new(config, transport, snapshot.clone(), packager.clone(), outbound_tx)?;

    let events = service.event_sender();
    events.send(PlatformEvent::Committed {
        tab,
        url: snapshot.url().to_owned(),
    })?;
    events.send(PlatformEvent::PageLoaded {
        tab,
        url: snapshot.url().to_owned(),
        title: snapshot.title(),
        saved_page: snapshot.is_saved_page(),
    })?;
    commands.send(command)?;
    drop(commands);

    service.run(command_rx).await;

    let mut failure = None;
    let mut missing = 0_usize;
    for signal in outbound.drain() {
        match signal {
            CoreSignal::Notify { message } => failure = Some(message),
            CoreSignal::ResourceResolved {
                index,
                reason: Some(reason),
                ..
            } => {
                missing += 1;
                tracing::debug!(target: "pagekeep::app", %index, %reason, "resource not embedded");
            }
            _ => {}
        }
    }
    if missing > 0 {
        tracing::info!(target: "pagekeep::app", missing, "some resources could not be embedded");
    }

    match (packager.written(), failure) {
        (Some(path), _) => Ok(path),
        (None, Some(message)) => Err(CaptureError::new("app.save.failed", message)),
        (None, None) => Err(CaptureError::new("app.save.failed", "nothing was saved")),
    }
}

#[cfg(test)]
mod tests {
    use super::save_batch;
    use super::save_with;
    use crate::cli::Cli;
    use crate::cli::PageTarget;
    use crate::packager::FilePackager;
    use crate::platform::FileSnapshot;
    use async_trait::async_trait;
    use clap::Parser;
    use pk_core::CaptureError;
    use pk_core::CaptureResult;
    use pk_core::TabId;
    use pk_ipc::SaveAction;
    use pk_ipc::SavedItems;
    use pk_ipc::UiCommand;
    use pk_net::Header;
    use pk_net::HttpResponse;
    use pk_net::ResourceTransport;
    use pk_net::ResponseHead;
    use pk_net::TransportRequest;
    use pk_net::http::HttpVersion;
    use pk_session::SaveConfig;
    use std::sync::Arc;

    const TAB: TabId = TabId(1);

    /// Serves one stylesheet and one image; everything else is unreachable.
    struct SiteTransport;

    #[async_trait]
    impl ResourceTransport for SiteTransport {
        async fn send(&self, request: TransportRequest) -> CaptureResult<HttpResponse> {
            let (content_type, body): (&str, &[u8]) = match request.url.as_str() {
                "http://site.test/" => ("text/html", b""),
                "http://site.test/style.css" => ("text/css", b"body { background: url(bg.png) }"),
                "http://site.test/bg.png" | "http://site.test/logo.png" => ("image/png", b"png"),
                _ => return Err(CaptureError::new("net.tcp.connect_failed", "no route")),
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

    fn start(action: SaveAction, extract_url: Option<&str>) -> UiCommand {
        UiCommand::StartSave {
            tab: TAB,
            action,
            items: SavedItems::Standard,
            toggle_lazy: false,
            extract_url: extract_url.map(str::to_owned),
        }
    }

    const PAGE: &[u8] = b"<html><head><title>Site home</title><link rel=\"stylesheet\" href=\"style.css\"></head>\
<body><img src=\"logo.png\"><img src=\"missing.png\"></body></html>";

    #[tokio::test]
    async fn saves_a_snapshot_into_the_output_directory() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let snapshot = Arc::new(FileSnapshot::from_bytes(PAGE, "http://site.test/"));
        let packager = Arc::new(FilePackager::new(dir.path().to_path_buf()));

        let path = match save_with(
            TAB,
            start(SaveAction::Save, None),
            SaveConfig::default(),
            Arc::new(SiteTransport),
            snapshot,
            packager,
        )
        .await
        {
            Ok(path) => path,
            Err(error) => panic!("{error}"),
        };

        assert_eq!(path, dir.path().join("Site home.html"));
        let saved = std::fs::read_to_string(&path).unwrap_or_default();
        assert!(saved.contains("<style>"));
        assert!(saved.contains("data:image/png;base64,cG5n"));
        assert!(saved.contains("src=\"http://site.test/missing.png\""));
        assert!(saved.contains("<meta name=\"savepage-url\" content=\"http://site.test/\">"));
        assert!(!saved.contains("href=\"style.css\""));
    }

    #[tokio::test]
    async fn removal_of_an_unsaved_page_reports_the_reason() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let result = save_with(
            TAB,
            start(SaveAction::Remove, None),
            SaveConfig::default(),
            Arc::new(SiteTransport),
            Arc::new(FileSnapshot::from_bytes(PAGE, "http://site.test/")),
            Arc::new(FilePackager::new(dir.path().to_path_buf())),
        )
        .await;
        match result {
            Err(error) => {
                assert_eq!(error.code, "app.save.failed");
                assert!(error.message.ends_with("> Site home"));
            }
            Ok(path) => panic!("unexpected file {}", path.display()),
        }
    }

    #[tokio::test]
    async fn extracts_one_resource_as_its_own_file() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let path = save_with(
            TAB,
            start(SaveAction::Extract, Some("logo.png")),
            SaveConfig::default(),
            Arc::new(SiteTransport),
            Arc::new(FileSnapshot::from_bytes(PAGE, "http://site.test/")),
            Arc::new(FilePackager::new(dir.path().to_path_buf())),
        )
        .await
        .unwrap_or_default();
        assert_eq!(path, dir.path().join("logo.png"));
        assert_eq!(std::fs::read(&path).unwrap_or_default(), b"png");
    }

    #[tokio::test]
    async fn batches_save_each_page_and_continue_past_failures() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let second = dir.path().join("second.html");
        let written = std::fs::write(&second, b"<html><head><title>Second</title></head><body><img src=\"logo.png\"></body></html>");
        assert!(written.is_ok());
        let first = dir.path().join("first.html");
        assert!(std::fs::write(&first, PAGE).is_ok());
        let out = dir.path().join("out");

        let out_arg = out.display().to_string();
        let cli = match Cli::try_parse_from(["pagekeep", "save", "first.html", "-o", out_arg.as_str()]) {
            Ok(cli) => cli,
            Err(error) => panic!("{error}"),
        };
        let targets = vec![
            PageTarget {
                input: first,
                url: Some("http://site.test/".to_owned()),
            },
            PageTarget {
                input: dir.path().join("gone.html"),
                url: None,
            },
            PageTarget {
                input: second,
                url: Some("http://site.test/second".to_owned()),
            },
        ];

        let results = save_batch(&cli.command, &targets, &SaveConfig::default(), Arc::new(SiteTransport)).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&out.join("Site home.html")));
        assert!(matches!(&results[1], Err(error) if error.code == "app.input.read_failed"));
        assert_eq!(results[2].as_ref().ok(), Some(&out.join("Second.html")));
        let saved = std::fs::read_to_string(out.join("Second.html")).unwrap_or_default();
        assert!(saved.contains("data:image/png;base64,cG5n"));
    }

}
