//! Save configuration (`pagekeep.toml`).

use pk_capture::CaptureOptions;
use pk_capture::CssImageMode;
use pk_capture::FontSelection;
use pk_capture::ItemToggles;
use pk_capture::PageInfo;
use pk_core::CaptureError;
use pk_core::CaptureResult;
use pk_ipc::CaptureParams;
use pk_ipc::SavedItems;
use pk_net::CrossOriginReferrer;
use pk_net::FetchLimits;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "pagekeep.toml";
const MAX_FRAME_DEPTH_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemsSetting {
    Basic,
    #[default]
    Standard,
    Custom,
}

impl From<ItemsSetting> for SavedItems {
    fn from(value: ItemsSetting) -> Self {
        match value {
            ItemsSetting::Basic => Self::Basic,
            ItemsSetting::Standard => Self::Standard,
            ItemsSetting::Custom => Self::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CssImagesSetting {
    #[default]
    Rendered,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FontsSetting {
    None,
    #[default]
    Woff,
    All,
}

/// Category toggles for the custom item set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomItems {
    pub images: bool,
    pub audio_video: bool,
    pub objects: bool,
    pub scripts: bool,
    pub fonts: bool,
}

impl Default for CustomItems {
    fn default() -> Self {
        Self {
            images: true,
            audio_video: false,
            objects: false,
            scripts: false,
            fonts: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `PAGEKEEP_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
            color: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    pub max_page_time_secs: u64,
    pub max_resource_size_mb: u64,
    pub max_resource_time_secs: u64,
    pub max_frame_depth: usize,
    pub frame_wait_secs: u64,
    pub allow_passive: bool,
    /// 0 sends only the origin cross-origin, 1 the full URL.
    pub cross_origin: u8,
    pub load_lazy_content: bool,
    pub saved_items: ItemsSetting,
    pub custom: CustomItems,
    pub css_images: CssImagesSetting,
    pub fonts: FontsSetting,
    pub file_name_template: String,
    pub replace_spaces: bool,
    pub replace_char: String,
    pub max_file_name_length: usize,
    /// Log every refused or failed resource with its reason code.
    pub debug: bool,
    pub logging: LoggingConfig,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            max_page_time_secs: 10,
            max_resource_size_mb: 50,
            max_resource_time_secs: 10,
            max_frame_depth: 5,
            frame_wait_secs: 10,
            allow_passive: false,
            cross_origin: 0,
            load_lazy_content: false,
            saved_items: ItemsSetting::Standard,
            custom: CustomItems::default(),
            css_images: CssImagesSetting::Rendered,
            fonts: FontsSetting::Woff,
            file_name_template: "%TITLE%".to_owned(),
            replace_spaces: false,
            replace_char: "-".to_owned(),
            max_file_name_length: 150,
            debug: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl SaveConfig {
    pub fn from_toml_str(text: &str) -> CaptureResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|error| CaptureError::new("session.config.parse_failed", error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> CaptureResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            CaptureError::new(
                "session.config.read_failed",
                format!("cannot read {}: {error}", path.display()),
            )
        })?;
        Self::from_toml_str(&text)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> CaptureResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.max_resource_size_mb == 0 {
            return Err(CaptureError::new(
                "session.config.max_resource_size_invalid",
                "max_resource_size_mb must be at least 1",
            ));
        }
        if self.max_resource_time_secs == 0 {
            return Err(CaptureError::new(
                "session.config.max_resource_time_invalid",
                "max_resource_time_secs must be at least 1",
            ));
        }
        if self.max_frame_depth > MAX_FRAME_DEPTH_LIMIT {
            return Err(CaptureError::new(
                "session.config.max_frame_depth_invalid",
                format!("max_frame_depth must be at most {MAX_FRAME_DEPTH_LIMIT}"),
            ));
        }
        if self.cross_origin > 1 {
            return Err(CaptureError::new(
                "session.config.cross_origin_invalid",
                "cross_origin must be 0 or 1",
            ));
        }
        if self.max_file_name_length == 0 {
            return Err(CaptureError::new(
                "session.config.file_name_length_invalid",
                "max_file_name_length must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn max_page_time(&self) -> Duration {
        Duration::from_secs(self.max_page_time_secs)
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            max_resource_bytes: self.max_resource_size_mb * 1024 * 1024,
            timeout: Duration::from_secs(self.max_resource_time_secs),
            allow_passive: self.allow_passive,
            cross_origin: CrossOriginReferrer::from_option(self.cross_origin),
        }
    }

    /// Lazy loading for one run: the configured choice, inverted on request.
    pub fn lazy_load_for(&self, params: &CaptureParams) -> bool {
        self.load_lazy_content != params.toggle_lazy
    }

    pub fn capture_options(&self, params: &CaptureParams, page_info: Option<PageInfo>) -> CaptureOptions {
        let (items, css_images, fonts) = match params.items {
            SavedItems::Basic => (ItemToggles::basic(), CssImageMode::Rendered, FontSelection::None),
            SavedItems::Standard => (ItemToggles::standard(), CssImageMode::Rendered, FontSelection::Woff),
            SavedItems::Custom => (
                ItemToggles {
                    images: self.custom.images,
                    audio_video: self.custom.audio_video,
                    objects: self.custom.objects,
                    scripts: self.custom.scripts,
                    fonts: self.custom.fonts,
                },
                match self.css_images {
                    CssImagesSetting::Rendered => CssImageMode::Rendered,
                    CssImagesSetting::All => CssImageMode::All,
                },
                match self.fonts {
                    FontsSetting::None => FontSelection::None,
                    FontsSetting::Woff => FontSelection::Woff,
                    FontsSetting::All => FontSelection::All,
                },
            ),
        };

        let options = CaptureOptions {
            action: params.action,
            items,
            css_images,
            fonts,
            max_frame_depth: self.max_frame_depth,
            frame_wait: Duration::from_secs(self.frame_wait_secs),
            page_info,
            extract_url: params.extract_url.clone(),
        };
        match params.action {
            pk_ipc::SaveAction::Remove => CaptureOptions {
                page_info: None,
                ..CaptureOptions::for_removal()
            },
            _ => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FontsSetting;
    use super::ItemsSetting;
    use super::LogFormat;
    use super::SaveConfig;
    use pk_capture::CssImageMode;
    use pk_capture::FontSelection;
    use pk_ipc::CaptureParams;
    use pk_ipc::SaveAction;
    use pk_ipc::SavedItems;
    use std::time::Duration;

    #[test]
    fn defaults_match_the_extension() {
        let config = SaveConfig::default();
        assert_eq!(config.max_page_time(), Duration::from_secs(10));
        let limits = config.fetch_limits();
        assert_eq!(limits.max_resource_bytes, 50 * 1024 * 1024);
        assert_eq!(limits.timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_depth, 5);
        assert_eq!(config.file_name_template, "%TITLE%");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_files_keep_defaults() {
        let config = match SaveConfig::from_toml_str(
            "saved_items = \"custom\"\nfonts = \"all\"\n[custom]\nscripts = true\n[logging]\nformat = \"json\"\n",
        ) {
            Ok(config) => config,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(config.saved_items, ItemsSetting::Custom);
        assert_eq!(config.fonts, FontsSetting::All);
        assert!(config.custom.scripts);
        assert!(config.custom.images);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.max_resource_size_mb, 50);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let error = SaveConfig::from_toml_str("cross_origin = 3").err();
        assert_eq!(error.map(|error| error.code), Some("session.config.cross_origin_invalid"));
        let error = SaveConfig::from_toml_str("max_resource_size_mb = \"big\"").err();
        assert_eq!(error.map(|error| error.code), Some("session.config.parse_failed"));
    }

    #[test]
    fn item_sets_pick_capture_options() {
        let mut config = SaveConfig {
            fonts: FontsSetting::All,
            ..SaveConfig::default()
        };
        config.css_images = super::CssImagesSetting::All;

        let basic = config.capture_options(
            &CaptureParams {
                items: SavedItems::Basic,
                ..CaptureParams::default()
            },
            None,
        );
        assert_eq!(basic.fonts, FontSelection::None);
        assert!(!basic.items.audio_video);

        let custom = config.capture_options(
            &CaptureParams {
                items: SavedItems::Custom,
                ..CaptureParams::default()
            },
            None,
        );
        assert_eq!(custom.css_images, CssImageMode::All);
        assert_eq!(custom.fonts, FontSelection::All);
        assert!(!custom.items.objects);

        let removal = config.capture_options(
            &CaptureParams {
                action: SaveAction::Remove,
                ..CaptureParams::default()
            },
            None,
        );
        assert_eq!(removal.action, SaveAction::Remove);
        assert!(!removal.items.images);
    }

    #[test]
    fn loads_from_file() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(error) => panic!("{error}"),
        };
        let path = dir.path().join("pagekeep.toml");
        assert!(std::fs::write(&path, "max_frame_depth = 2\n").is_ok());
        let config = SaveConfig::load(&path).unwrap_or_default();
        assert_eq!(config.max_frame_depth, 2);
        let missing = SaveConfig::load_or_default(&dir.path().join("absent.toml")).unwrap_or_else(|_| unreachable!());
        assert_eq!(missing, SaveConfig::default());
    }
}
