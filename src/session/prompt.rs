//! Initial-prompt rendering and the session-name slug.

/// Rendered prompts beyond this length fall back to the minimal
/// default; a runaway template must not flood the provider's line
/// editor.
const MAX_RENDERED_PROMPT: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    pub agent_name: String,
    pub project_name: String,
    pub epic_title: Option<String>,
    pub session_id: String,
}

/// Substitute `{agent_name}`, `{project_name}`, `{epic_title}` and
/// `{session_id}` in the project's initial prompt template. Unknown
/// placeholders are left untouched.
pub fn render_initial_prompt(template: &str, vars: &PromptVars) -> String {
    let rendered = template
        .replace("{agent_name}", &vars.agent_name)
        .replace("{project_name}", &vars.project_name)
        .replace(
            "{epic_title}",
            vars.epic_title.as_deref().unwrap_or("independent work"),
        )
        .replace("{session_id}", &vars.session_id);

    if rendered.len() > MAX_RENDERED_PROMPT {
        fallback_prompt(vars)
    } else {
        rendered
    }
}

pub fn fallback_prompt(vars: &PromptVars) -> String {
    format!("Session {} started for {}", vars.session_id, vars.agent_name)
}

/// Filesystem- and tmux-safe slug: lowercase alphanumerics with single
/// dashes, bounded length.
pub fn slugify(raw: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Deterministic tmux session name for one launch.
pub fn session_name(
    project_name: &str,
    epic_title: Option<&str>,
    agent_id: &str,
    session_id: &str,
) -> String {
    let project = slugify(project_name, 24);
    let epic = epic_title
        .map(|t| slugify(t, 24))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "independent".to_string());
    let agent = agent_id.chars().take(8).collect::<String>();
    let session = session_id.chars().take(8).collect::<String>();
    format!("devchain-{project}-{epic}-{agent}-{session}")
}
