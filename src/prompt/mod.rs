//! Playbook block rendering and extraction
//!
//! The embedded block is the contract between the prompt an agent receives
//! and the trajectory it later reports back:
//!
//! ```text
//! **PLAYBOOK_BEGIN**
//! - [<bullet id>] helpful=<n> harmful=<n> :: <content>
//! **PLAYBOOK_END**
//!
//! <original prompt>
//! ```
//!
//! Anything that parses trajectories depends on the exact marker strings.

use crate::types::Bullet;

/// Opening marker of the embedded playbook block
pub const PLAYBOOK_BEGIN: &str = "**PLAYBOOK_BEGIN**";
/// Closing marker of the embedded playbook block
pub const PLAYBOOK_END: &str = "**PLAYBOOK_END**";

/// Shown to the reflector when the agent saw no playbook
pub const EMPTY_PLAYBOOK: &str = "(None)";

/// Render one bullet as a playbook line
pub fn render_bullet(bullet: &Bullet) -> String {
    let content = bullet
        .content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "- [{}] helpful={} harmful={} :: {}",
        bullet.id, bullet.metadata.helpful_count, bullet.metadata.harmful_count, content
    )
}

/// Render bullets as newline-separated playbook lines
pub fn render_bullets(bullets: &[Bullet]) -> String {
    bullets.iter().map(render_bullet).collect::<Vec<_>>().join("\n")
}

/// Place the rendered bullets in a marker block ahead of `prompt`.
///
/// The prompt itself is carried through unchanged. With no bullets there is
/// nothing to embed and the prompt is returned as is.
pub fn embed(prompt: &str, bullets: &[Bullet]) -> String {
    if bullets.is_empty() {
        return prompt.to_string();
    }
    format!(
        "{}\n{}\n{}\n\n{}",
        PLAYBOOK_BEGIN,
        render_bullets(bullets),
        PLAYBOOK_END,
        prompt
    )
}

/// Find the interior of the first complete marker span in `text`.
///
/// The line break right after the begin marker and the one right before the
/// end marker belong to the markers; everything else is returned verbatim.
pub fn extract_playbook_block(text: &str) -> Option<&str> {
    let start = text.find(PLAYBOOK_BEGIN)? + PLAYBOOK_BEGIN.len();
    let len = text[start..].find(PLAYBOOK_END)?;
    let mut inner = &text[start..start + len];

    inner = inner
        .strip_prefix("\r\n")
        .or_else(|| inner.strip_prefix('\n'))
        .unwrap_or(inner);
    inner = inner
        .strip_suffix("\r\n")
        .or_else(|| inner.strip_suffix('\n'))
        .unwrap_or(inner);

    Some(inner)
}

/// True if `text` contains either marker
pub fn contains_marker(text: &str) -> bool {
    text.contains(PLAYBOOK_BEGIN) || text.contains(PLAYBOOK_END)
}
