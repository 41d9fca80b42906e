//! Conversation formatting.
//!
//! The worker is stateless between invocations, so every turn replays the
//! whole history as a plain-text transcript ahead of the new prompt.

use promptdock_protocol::{Role, Turn};

const CONTINUE_INSTRUCTION: &str =
    "Continue the following conversation. Here is the transcript so far:";
const RESPOND_INSTRUCTION: &str = "Respond only to the latest user message above. \
Do not repeat, summarize, or restate the earlier conversation.";

/// Build the single prompt handed to the worker for this turn.
pub fn format_prompt(prompt: &str, history: &[Turn]) -> String {
    if history.is_empty() {
        return prompt.to_string();
    }

    let mut sections = Vec::with_capacity(history.len() + 3);
    sections.push(CONTINUE_INSTRUCTION.to_string());
    sections.extend(history.iter().map(render_turn));
    sections.push(format!("{}: {}", Role::User.label(), prompt));
    sections.push(RESPOND_INSTRUCTION.to_string());
    sections.join("\n\n")
}

fn render_turn(turn: &Turn) -> String {
    format!("{}: {}", turn.role.label(), turn.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_history() -> Vec<Turn> {
        vec![Turn::user("Hi"), Turn::assistant("Hello!")]
    }

    #[test]
    fn empty_history_passes_prompt_through() {
        assert_eq!(format_prompt("Hello", &[]), "Hello");
    }

    #[test]
    fn history_is_rendered_in_order_before_new_prompt() {
        let formatted = format_prompt("How are you?", &sample_history());

        assert!(formatted.starts_with(CONTINUE_INSTRUCTION));
        let hi = formatted.find("User: Hi").expect("user turn rendered");
        let hello = formatted
            .find("Assistant: Hello!")
            .expect("assistant turn rendered");
        let latest = formatted
            .find("User: How are you?")
            .expect("new prompt rendered");
        assert!(hi < hello && hello < latest);
        assert!(formatted.ends_with(&format!("User: How are you?\n\n{RESPOND_INSTRUCTION}")));
    }

    #[test]
    fn turns_are_separated_by_blank_lines() {
        let formatted = format_prompt("Next", &sample_history());
        assert!(formatted.contains("User: Hi\n\nAssistant: Hello!\n\nUser: Next"));
    }

    #[test]
    fn formatting_is_deterministic() {
        let history = sample_history();
        assert_eq!(
            format_prompt("How are you?", &history),
            format_prompt("How are you?", &history)
        );
    }
}
