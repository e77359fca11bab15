//! Utility functions shared by the cache layer and the CLI.
//!
//! - **URL validation**: the news API base URL must be HTTPS
//! - **Text processing**: control-character stripping and width-aware truncation

mod text;
mod url_validator;

pub use text::{strip_control_chars, truncate_to_width};
pub use url_validator::{validate_base_url, UrlValidationError};

/// Maximum accepted search query length, in characters
pub const MAX_SEARCH_QUERY_LENGTH: usize = 256;
