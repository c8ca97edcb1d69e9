//! Branch and ticket identity helpers.
//!
//! Branch names are rendered from a configurable format with `${ticketId}`
//! and `${slug}` placeholders, and ticket ids are recovered from branch
//! names by compiling the same format into a regex.

use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;

const MAX_SLUG_LEN: usize = 50;

/// Lowercase a title into a branch-safe slug: non-alphanumeric runs become
/// single dashes, leading/trailing dashes are trimmed, 50 chars max.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    if slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Render a branch name from the configured format.
pub fn render_branch(format: &str, ticket_id: &str, title: &str) -> String {
    format
        .replace("${ticketId}", ticket_id)
        .replace("${slug}", &slugify(title))
}

/// Try to extract a ticket id from a branch name using the configured
/// format, e.g. format `${ticketId}-${slug}` and branch `ENG-123-fix-login`
/// yield `ENG-123`.
pub fn parse_ticket_id(branch: &str, format: &str) -> Option<String> {
    let mut pattern = regex::escape(format);
    pattern = pattern.replace(&regex::escape("${ticketId}"), r"(?P<ticket>[A-Z]+-\d+)");
    pattern = pattern.replace(&regex::escape("${slug}"), ".+");
    let re = Regex::new(&format!("^{pattern}$")).ok()?;
    re.captures(branch)?
        .name("ticket")
        .map(|m| m.as_str().to_string())
}

fn bad_branch_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)] // pattern is a literal
    RE.get_or_init(|| Regex::new(r#"[<>:"|?*\x00-\x1f\s~^\\]"#).unwrap())
}

/// Reject names git (or the filesystem under it) would choke on.
pub fn validate_branch(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("branch name is required");
    }
    if bad_branch_chars().is_match(name) {
        bail!("branch name contains invalid characters");
    }
    Ok(())
}

/// A branch name flattened into a single filesystem path component.
pub fn sanitize_for_path(branch: &str) -> String {
    branch.replace('/', "-")
}
