//! Embedded-data encoding: `data:` URLs, base64, percent-escaping and the
//! character-encoding cascade for text resources.

mod charset;
mod data_url;
mod escape;

pub use charset::TextHints;
pub use charset::charset_from_content_type;
pub use charset::decode_text;
pub use charset::resolve_encoding;
pub use data_url::DEFAULT_BINARY_TYPE;
pub use data_url::DataUrl;
pub use data_url::EMPTY_DOCUMENT_DATA_URL;
pub use data_url::binary_data_url;
pub use data_url::document_data_url;
pub use data_url::parse_data_url;
pub use data_url::text_data_url;
pub use escape::escape_srcdoc;
pub use escape::percent_decode;
pub use escape::percent_escape;
