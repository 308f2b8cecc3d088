//! Prompt templates for the reflector and curator

use super::capability::{CuratorInput, ReflectorInput};
use crate::types::Reflection;

pub const SYSTEM_PROMPT: &str = "You maintain a playbook of short, reusable lessons for an AI agent. \
You always answer with a single JSON object and nothing else.";

const REFLECTOR_TEMPLATE: &str = r#"You are the reflector. Analyze one run of an agent and explain what went right or wrong.

The agent was shown the playbook below before it acted. Each line is
`- [bullet id] helpful=N harmful=N :: lesson`.

## Playbook the agent saw
{retrieved_playbook}

## Trajectory
{trajectory}
{optional_sections}
## Task
1. Work out what the agent did and whether it succeeded.
2. Identify the specific error, if any, and its root cause.
3. Describe the approach the agent should have taken.
4. Distill one key insight that would prevent the mistake next time.
5. For each playbook bullet that influenced the run, tag it "helpful", "harmful" or "neutral".
   Only use bullet ids that appear in the playbook above. Leave the list empty if there are none.

Respond with a JSON object of this shape:
{
  "reasoning": "step by step analysis",
  "error_identification": "what went wrong",
  "root_cause_analysis": "why it went wrong",
  "correct_approach": "what should have been done",
  "key_insight": "lesson to remember",
  "bullet_tags": [{"id": "<bullet id>", "tag": "helpful" | "harmful" | "neutral"}]
}"#;

const CURATOR_TEMPLATE: &str = r#"You are the curator. Turn a reflection on an agent run into edits to the playbook.

## User message that started the run
{user_message}

## Current playbook
{global_playbook}

## Trajectory
{trajectory}

## Reflection
{reflection}
{optional_sections}
## Task
Propose the smallest set of operations that captures what was learned:
- ADD a new bullet for a genuinely new, reusable lesson. Do not duplicate existing bullets.
- UPDATE a bullet whose lesson should be corrected or sharpened.
- TAG a bullet as "helpful", "harmful" or "neutral" to record how it influenced this run.
- REMOVE a bullet that is wrong or redundant.
UPDATE, TAG and REMOVE must use bullet ids from the current playbook. Bullet content must be
self-contained, actionable and must not be empty. Return no operations if nothing should change.

Respond with a JSON object of this shape:
{
  "reasoning": "why these edits",
  "operations": [
    {"type": "ADD", "content": "..."},
    {"type": "UPDATE", "bullet_id": "...", "content": "..."},
    {"type": "TAG", "bullet_id": "...", "tag": "helpful"},
    {"type": "REMOVE", "bullet_id": "..."}
  ]
}"#;

/// Substitute `{name}` placeholders in one pass, so inserted text is never rescanned
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let matched = values
            .iter()
            .find(|(name, _)| tail.starts_with(name) && tail[name.len()..].starts_with('}'));
        match matched {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }

    out.push_str(rest);
    out
}

fn optional_section(title: &str, value: Option<&str>) -> String {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => format!("\n## {}\n{}\n", title, value),
        None => String::new(),
    }
}

pub fn render_reflector_prompt(input: &ReflectorInput) -> String {
    let optional_sections = [
        optional_section("Ground truth", input.ground_truth.as_deref()),
        optional_section("Evaluation", input.evaluation.as_deref()),
        optional_section(
            "Additional instructions",
            input.additional_instructions.as_deref(),
        ),
    ]
    .concat();

    fill(
        REFLECTOR_TEMPLATE,
        &[
            ("retrieved_playbook", input.retrieved_playbook.as_str()),
            ("trajectory", input.trajectory.as_str()),
            ("optional_sections", optional_sections.as_str()),
        ],
    )
}

pub fn render_curator_prompt(input: &CuratorInput) -> String {
    let global_playbook = if input.global_playbook.trim().is_empty() {
        "(empty)"
    } else {
        input.global_playbook.as_str()
    };
    let optional_sections = optional_section(
        "Additional instructions",
        input.additional_instructions.as_deref(),
    );

    let reflection = format_reflection(&input.reflection);

    fill(
        CURATOR_TEMPLATE,
        &[
            ("user_message", input.user_message.as_str()),
            ("global_playbook", global_playbook),
            ("trajectory", input.trajectory.as_str()),
            ("reflection", reflection.as_str()),
            ("optional_sections", optional_sections.as_str()),
        ],
    )
}

/// Readable rendition of a reflection for the curator
pub fn format_reflection(reflection: &Reflection) -> String {
    let tags = if reflection.bullet_tags.is_empty() {
        "(none)".to_string()
    } else {
        reflection
            .bullet_tags
            .iter()
            .map(|t| format!("[{}] {}", t.id, t.tag))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "Reasoning: {}\nError identification: {}\nRoot cause analysis: {}\nCorrect approach: {}\nKey insight: {}\nBullet tags: {}",
        reflection.reasoning,
        reflection.error_identification,
        reflection.root_cause_analysis,
        reflection.correct_approach,
        reflection.key_insight,
        tags
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BulletTag, Tag};

    fn reflector_input() -> ReflectorInput {
        ReflectorInput {
            playbook_id: "pb".into(),
            retrieved_playbook: "- [b1] helpful=0 harmful=0 :: dedupe leads".into(),
            trajectory: "called create_lead twice".into(),
            ground_truth: None,
            evaluation: Some("duplicate lead created".into()),
            additional_instructions: Some("  ".into()),
        }
    }

    #[test]
    fn test_reflector_prompt_sections() {
        let prompt = render_reflector_prompt(&reflector_input());
        assert!(prompt.contains("- [b1] helpful=0 harmful=0 :: dedupe leads"));
        assert!(prompt.contains("called create_lead twice"));
        assert!(prompt.contains("## Evaluation\nduplicate lead created"));
        assert!(!prompt.contains("## Ground truth"));
        assert!(!prompt.contains("## Additional instructions"));
        assert!(!prompt.contains("{trajectory}"));
    }

    #[test]
    fn test_placeholders_in_values_are_not_expanded() {
        let mut input = reflector_input();
        input.retrieved_playbook = "uses {trajectory} literally".into();
        let prompt = render_reflector_prompt(&input);
        assert!(prompt.contains("uses {trajectory} literally"));
        assert_eq!(fill("{a}-{b}-{c}", &[("a", "1"), ("b", "{a}")]), "1-{a}-{c}");
    }

    #[test]
    fn test_curator_prompt_with_empty_playbook() {
        let input = CuratorInput {
            playbook_id: "pb".into(),
            user_message: "add ACME as a lead".into(),
            global_playbook: String::new(),
            trajectory: "trace".into(),
            reflection: Reflection {
                reasoning: "r".into(),
                error_identification: "e".into(),
                root_cause_analysis: "rc".into(),
                correct_approach: "c".into(),
                key_insight: "always search first".into(),
                bullet_tags: vec![BulletTag {
                    id: "b1".into(),
                    tag: Tag::Helpful,
                }],
            },
            additional_instructions: Some("Keep bullets under 20 words".into()),
        };

        let prompt = render_curator_prompt(&input);
        assert!(prompt.contains("## Current playbook\n(empty)"));
        assert!(prompt.contains("Key insight: always search first"));
        assert!(prompt.contains("Bullet tags: [b1] helpful"));
        assert!(prompt.contains("## Additional instructions\nKeep bullets under 20 words"));
    }
}
