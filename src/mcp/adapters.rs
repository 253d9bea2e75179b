//! Provider CLI adapters for MCP registration.
//!
//! Each provider (claude / codex / gemini, keyed case-insensitively)
//! has its own command shapes for add/list/remove and its own list
//! output format. Parsers skip header noise and tolerate unknown lines.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpEntry {
    pub alias: String,
    pub endpoint: String,
    pub transport: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Codex,
    Gemini,
}

/// `claude mcp list` lines look like:
/// `devchain: http://127.0.0.1:3000/mcp (HTTP) - ✓ Connected`
static CLAUDE_LIST_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+):\s+(\S+)\s+\(([^)]+)\)").unwrap());

impl ProviderKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn add_args(&self, alias: &str, endpoint: &str) -> Vec<String> {
        match self {
            Self::Claude | Self::Gemini => vec![
                "mcp".into(),
                "add".into(),
                "--transport".into(),
                "http".into(),
                alias.into(),
                endpoint.into(),
            ],
            Self::Codex => vec![
                "mcp".into(),
                "add".into(),
                "--url".into(),
                endpoint.into(),
                alias.into(),
            ],
        }
    }

    pub fn list_args(&self) -> Vec<String> {
        vec!["mcp".into(), "list".into()]
    }

    pub fn remove_args(&self, alias: &str) -> Vec<String> {
        vec!["mcp".into(), "remove".into(), alias.into()]
    }

    pub fn parse_list_output(&self, output: &str) -> Vec<McpEntry> {
        match self {
            Self::Claude => output
                .lines()
                .filter_map(|line| {
                    let captures = CLAUDE_LIST_LINE.captures(line.trim())?;
                    Some(McpEntry {
                        alias: captures[1].trim_end_matches(':').to_string(),
                        endpoint: captures[2].to_string(),
                        transport: Some(captures[3].to_lowercase()),
                    })
                })
                .collect(),
            // Codex and Gemini print a header row, then
            // whitespace-separated columns: alias, endpoint, rest.
            Self::Codex | Self::Gemini => output
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let alias = fields.next()?;
                    let endpoint = fields.next()?;
                    Some(McpEntry {
                        alias: alias.to_string(),
                        endpoint: endpoint.to_string(),
                        transport: None,
                    })
                })
                .collect(),
        }
    }

    /// Binary used when the provider row has no explicit path.
    pub fn default_binary(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        assert_eq!(ProviderKind::from_name("Claude"), Some(ProviderKind::Claude));
        assert_eq!(ProviderKind::from_name("CODEX"), Some(ProviderKind::Codex));
        assert_eq!(ProviderKind::from_name(" gemini "), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::from_name("cursor"), None);
    }

    #[test]
    fn claude_list_parse_skips_headers() {
        let output = "Checking MCP server health...\n\n\
            devchain: http://127.0.0.1:3000/mcp (HTTP) - ✓ Connected\n\
            other: http://localhost:9999/sse (SSE) - ✗ Failed\n";
        let entries = ProviderKind::Claude.parse_list_output(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].alias, "devchain");
        assert_eq!(entries[0].endpoint, "http://127.0.0.1:3000/mcp");
        assert_eq!(entries[0].transport.as_deref(), Some("http"));
    }

    #[test]
    fn codex_list_parse_skips_header_and_splits() {
        let output = "NAME     URL                             STATUS\n\
            devchain http://127.0.0.1:3000/mcp ok\n\
            extra    http://example.com/mcp    ok\n";
        let entries = ProviderKind::Codex.parse_list_output(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].alias, "devchain");
        assert_eq!(entries[0].endpoint, "http://127.0.0.1:3000/mcp");
        assert!(entries[0].transport.is_none());
    }

    #[test]
    fn empty_list_output_parses_to_nothing() {
        assert!(ProviderKind::Claude.parse_list_output("").is_empty());
        assert!(ProviderKind::Codex.parse_list_output("NAME URL\n").is_empty());
    }

    #[test]
    fn add_command_shapes() {
        let claude = ProviderKind::Claude.add_args("devchain", "http://127.0.0.1:3000/mcp");
        assert_eq!(
            claude,
            vec!["mcp", "add", "--transport", "http", "devchain", "http://127.0.0.1:3000/mcp"]
        );
        let codex = ProviderKind::Codex.add_args("devchain", "http://127.0.0.1:3000/mcp");
        assert_eq!(
            codex,
            vec!["mcp", "add", "--url", "http://127.0.0.1:3000/mcp", "devchain"]
        );
    }
}
