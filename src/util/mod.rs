//! Small helpers shared by the import, sync and organization paths.
//!
//! - **URL validation**: scheme and host policy for feed addresses
//! - **Text cleaning**: control-character stripping for untrusted titles

mod text;
mod url_validator;

pub use text::strip_control_chars;
pub use url_validator::{validate_url, validate_url_with, UrlValidationError};
