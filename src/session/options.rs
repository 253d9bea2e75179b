//! Provider option-string parsing.
//!
//! Option strings come from agent profiles and end up on a tmux
//! command line, so they parse as a POSIX-like argv and must not carry
//! control characters or newlines.

use crate::error::{OrchestratorError, Result};

/// Parse a profile's option string into an argv list.
pub fn parse_provider_options(raw: &str) -> Result<Vec<String>> {
    if raw.chars().any(|c| c.is_control()) {
        return Err(OrchestratorError::validation_field(
            "provider options must not contain control characters or newlines",
            "options",
        ));
    }
    shell_words::split(raw).map_err(|err| {
        OrchestratorError::validation_field(
            format!("provider options are not a valid argv list: {err}"),
            "options",
        )
    })
}
