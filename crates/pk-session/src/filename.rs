//! Suggested file names for saved pages.

use chrono::DateTime;
use chrono::TimeZone;
use url::Url;

const ILLEGAL: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const FALLBACK_NAME: &str = "page";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameRules {
    pub template: String,
    pub replace_spaces: bool,
    pub replace_char: String,
    pub max_length: usize,
}

impl Default for FileNameRules {
    fn default() -> Self {
        Self {
            template: "%TITLE%".to_owned(),
            replace_spaces: false,
            replace_char: "-".to_owned(),
            max_length: 150,
        }
    }
}

/// Expands `%TITLE%`, `%DOMAIN%`, `%DATE%` and `%TIME%`, removes characters
/// file systems reject, caps the length and appends `extension`.
pub fn suggest_file_name<Tz: TimeZone>(
    rules: &FileNameRules,
    title: &str,
    page_url: &str,
    now: &DateTime<Tz>,
    extension: &str,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let domain = Url::parse(page_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_default();

    let expanded = rules
        .template
        .replace("%TITLE%", title)
        .replace("%DOMAIN%", &domain)
        .replace("%DATE%", &now.format("%Y-%m-%d").to_string())
        .replace("%TIME%", &now.format("%H-%M-%S").to_string());

    let mut name: String = expanded
        .chars()
        .filter(|ch| !ILLEGAL.contains(ch) && !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if rules.replace_spaces {
        name = name.replace(' ', &rules.replace_char);
    }

    let mut name: String = name.chars().take(rules.max_length).collect();
    name = name.trim_end_matches(['.', ' ']).to_owned();
    if name.is_empty() {
        name = if domain.is_empty() {
            FALLBACK_NAME.to_owned()
        } else {
            domain
        };
    }
    format!("{name}.{extension}")
}

/// Last path segment of a resource URL, used when extracting media.
pub fn resource_file_name(resource_url: &str) -> Option<String> {
    let url = Url::parse(resource_url).ok()?;
    let segment = url.path_segments()?.next_back()?.to_owned();
    let cleaned: String = segment
        .chars()
        .filter(|ch| !ILLEGAL.contains(ch) && !ch.is_control())
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}
