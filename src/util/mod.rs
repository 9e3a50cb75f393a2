//! Utility functions for common operations.
//!
//! - **Text**: one-pass HTML entity decoding and terminal control stripping
//! - **URL validation**: SSRF guard for feed URLs

mod text;
mod url_validator;

pub use text::{strip_control_chars, unescape_html};
pub use url_validator::{validate_url, UrlValidationError};
