use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_core::TabId;
use pk_ipc::SaveAction;
use pk_ipc::SavedItems;
use pk_ipc::UiCommand;
use pk_session::SaveConfig;
use std::path::PathBuf;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "pagekeep", version, about = "Save a rendered page as one self-contained HTML file")]
pub(crate) struct Cli {
    /// Configuration file; `pagekeep.toml` in the working directory by default.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Log at debug level and report every resource that was not embedded.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Save the page with its resources embedded. Several pages are saved
    /// one after another.
    Save {
        #[command(flatten)]
        page: PageArgs,

        /// Further snapshots.
        more: Vec<PathBuf>,

        /// File listing further snapshots, one per line, each optionally
        /// followed by the page URL.
        #[arg(long)]
        list: Option<PathBuf>,

        #[arg(long, value_enum)]
        items: Option<ItemsArg>,

        /// Invert the configured lazy-content loading for this run.
        #[arg(long)]
        toggle_lazy: bool,
    },
    /// Re-save a saved page without its page-info metadata.
    Remove {
        #[command(flatten)]
        page: PageArgs,
    },
    /// Save one media resource referenced by the page as its own file.
    Extract {
        #[command(flatten)]
        page: PageArgs,

        /// Resource URL, absolute or relative to the page.
        #[arg(long)]
        resource: String,
    },
}

#[derive(Debug, Args)]
pub(crate) struct PageArgs {
    /// Snapshot of the rendered page.
    pub(crate) input: PathBuf,

    /// Address the first page was loaded from; the input file otherwise.
    #[arg(long)]
    pub(crate) url: Option<String>,

    /// Directory the saved file is written to.
    #[arg(short, long, default_value = ".")]
    pub(crate) output: PathBuf,

    /// Allow passive mixed content (http images on https pages).
    #[arg(long)]
    pub(crate) allow_passive: bool,

    #[arg(long)]
    pub(crate) max_frame_depth: Option<usize>,
}

/// One page of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageTarget {
    pub(crate) input: PathBuf,
    pub(crate) url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum ItemsArg {
    Basic,
    Standard,
    Custom,
}

impl Command {
    pub(crate) fn page(&self) -> &PageArgs {
        match self {
            Self::Save { page, .. } | Self::Remove { page } | Self::Extract { page, .. } => page,
        }
    }

    /// Pages in the order they are saved.
    pub(crate) fn targets(&self) -> CaptureResult<Vec<PageTarget>> {
        let page = self.page();
        let mut targets = vec![PageTarget {
            input: page.input.clone(),
            url: page.url.clone(),
        }];
        if let Self::Save { more, list, .. } = self {
            targets.extend(more.iter().map(|input| PageTarget {
                input: input.clone(),
                url: None,
            }));
            if let Some(list) = list {
                let text = std::fs::read_to_string(list).map_err(|error| {
                    CaptureError::new(
                        "app.list.read_failed",
                        format!("cannot read {}: {error}", list.display()),
                    )
                })?;
                targets.extend(parse_page_list(&text));
            }
        }
        Ok(targets)
    }

    pub(crate) fn start(&self, tab: TabId, config: &SaveConfig) -> UiCommand {
        let (action, items, toggle_lazy, extract_url) = match self {
            Self::Save {
                items, toggle_lazy, ..
            } => (
                SaveAction::Save,
                items.map_or_else(|| config.saved_items.into(), SavedItems::from),
                *toggle_lazy,
                None,
            ),
            Self::Remove { .. } => (SaveAction::Remove, config.saved_items.into(), false, None),
            Self::Extract { resource, .. } => (
                SaveAction::Extract,
                config.saved_items.into(),
                false,
                Some(resource.clone()),
            ),
        };
        UiCommand::StartSave {
            tab,
            action,
            items,
            toggle_lazy,
            extract_url,
        }
    }
}

/// `path [url]` per line. Blank lines and `#` comments are skipped.
fn parse_page_list(text: &str) -> Vec<PageTarget> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.rsplit_once(char::is_whitespace) {
            Some((input, url)) if is_page_url(url) => PageTarget {
                input: PathBuf::from(input.trim_end()),
                url: Some(url.to_owned()),
            },
            _ => PageTarget {
                input: PathBuf::from(line),
                url: None,
            },
        })
        .collect()
}

fn is_page_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|url| url.scheme().len() > 1)
}

impl From<ItemsArg> for SavedItems {
    fn from(value: ItemsArg) -> Self {
        match value {
            ItemsArg::Basic => Self::Basic,
            ItemsArg::Standard => Self::Standard,
            ItemsArg::Custom => Self::Custom,
        }
    }
}

impl Cli {
    /// Flags override the configuration file.
    pub(crate) fn apply(&self, config: &mut SaveConfig) {
        let page = self.command.page();
        if page.allow_passive {
            config.allow_passive = true;
        }
        if let Some(depth) = page.max_frame_depth {
            config.max_frame_depth = depth;
        }
        if self.verbose {
            config.debug = true;
            config.logging.level = "debug".to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use super::PageTarget;
    use super::parse_page_list;
    use clap::Parser;
    use pk_core::TabId;
    use pk_ipc::SaveAction;
    use pk_ipc::SavedItems;
    use pk_ipc::UiCommand;
    use pk_session::SaveConfig;

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn save_flags_override_config() {
        let cli = parse(&[
            "pagekeep",
            "save",
            "page.html",
            "--items",
            "basic",
            "--allow-passive",
            "--max-frame-depth",
            "2",
            "-v",
        ]);
        let mut config = SaveConfig::default();
        cli.apply(&mut config);
        assert!(config.allow_passive);
        assert_eq!(config.max_frame_depth, 2);
        assert!(config.debug);

        match cli.command.start(TabId(1), &config) {
            UiCommand::StartSave { action, items, .. } => {
                assert_eq!(action, SaveAction::Save);
                assert_eq!(items, SavedItems::Basic);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn extract_carries_the_resource() {
        let cli = parse(&["pagekeep", "extract", "saved.html", "--resource", "clip.mp4", "-o", "out"]);
        assert_eq!(cli.command.page().output.to_str(), Some("out"));
        match cli.command.start(TabId(1), &SaveConfig::default()) {
            UiCommand::StartSave {
                action, extract_url, ..
            } => {
                assert_eq!(action, SaveAction::Extract);
                assert_eq!(extract_url.as_deref(), Some("clip.mp4"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn extract_requires_a_resource() {
        assert!(Cli::try_parse_from(["pagekeep", "extract", "saved.html"]).is_err());
    }

    #[test]
    fn save_collects_every_page_in_order() {
        let cli = parse(&["pagekeep", "save", "a.html", "b.html", "--url", "https://a.example/"]);
        let targets = cli.command.targets().unwrap_or_default();
        assert_eq!(
            targets,
            vec![
                PageTarget {
                    input: "a.html".into(),
                    url: Some("https://a.example/".to_owned()),
                },
                PageTarget {
                    input: "b.html".into(),
                    url: None,
                },
            ]
        );
    }

    #[test]
    fn page_lists_skip_comments_and_carry_urls() {
        let targets = parse_page_list("# saved tabs\n\nnews.html https://news.example/today\n  my page.html  \n");
        assert_eq!(
            targets,
            vec![
                PageTarget {
                    input: "news.html".into(),
                    url: Some("https://news.example/today".to_owned()),
                },
                PageTarget {
                    input: "my page.html".into(),
                    url: None,
                },
            ]
        );
    }

    #[test]
    fn missing_list_file_is_an_error() {
        let cli = parse(&["pagekeep", "save", "a.html", "--list", "/nonexistent/pagekeep-list.txt"]);
        let error = cli.command.targets().err();
        assert_eq!(error.map(|error| error.code), Some("app.list.read_failed"));
    }

    #[test]
    fn only_save_takes_several_pages() {
        assert!(Cli::try_parse_from(["pagekeep", "remove", "a.html", "b.html"]).is_err());
    }

}
