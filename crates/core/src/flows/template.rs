//! Placeholder rendering for prompts and stored values.
//!
//! `{name}` and `{name.sub}` resolve against, in order: the caller's extra bindings, the
//! computed values (`last_user_message`, `conversation_history`, `current_state`), then the
//! conversation's business fields. `{{` and `}}` produce literal braces. Unresolved
//! placeholders are kept verbatim.

use crate::flows::state::ConversationState;

pub fn render(template: &str, state: &ConversationState, extras: &[(&str, &str)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(index) = rest.find(['{', '}']) {
        output.push_str(&rest[..index]);
        let tail = &rest[index..];

        if tail.starts_with("{{") {
            output.push('{');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            output.push('}');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            output.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find('}') {
            Some(end) if is_placeholder(&tail[1..=end]) => {
                let name = &tail[1..=end];
                match resolve(name, state, extras) {
                    Some(value) => output.push_str(&value),
                    None => output.push_str(&tail[..end + 2]),
                }
                rest = &tail[end + 2..];
            }
            _ => {
                output.push('{');
                rest = &tail[1..];
            }
        }
    }

    output.push_str(rest);
    output
}

fn is_placeholder(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        })
}

fn resolve(name: &str, state: &ConversationState, extras: &[(&str, &str)]) -> Option<String> {
    if let Some((_, value)) = extras.iter().find(|(key, _)| *key == name) {
        return Some((*value).to_string());
    }
    match name {
        "last_user_message" => Some(state.last_user_message().unwrap_or_default().to_string()),
        "conversation_history" => Some(state.conversation_history()),
        "current_state" => Some(state.current_state.clone()),
        _ => state.lookup(name).map(|value| value.render()),
    }
}

#[cfg(test)]
mod tests {
    use super::render;
    use crate::flows::state::{ChatMessage, ConversationState};

    fn state() -> ConversationState {
        let mut state = ConversationState::new("collect");
        state.set_field("field", "X".into());
        state.set_field("employee.name", "Pat".into());
        state
    }

    #[test]
    fn doubled_braces_become_literals_and_fields_substitute() {
        assert_eq!(render("{{literal}} and {field}", &state(), &[]), "{literal} and X");
    }

    #[test]
    fn unknown_placeholders_are_left_unchanged() {
        assert_eq!(
            render("Hello {employee.name}, your {missing.field} is ready", &state(), &[]),
            "Hello Pat, your {missing.field} is ready"
        );
    }

    #[test]
    fn computed_values_and_extras_resolve() {
        let mut state = state();
        state.push_user("I need a new laptop");
        state.push(ChatMessage::assistant("Sure"));

        let rendered = render(
            "{last_user_message} | {llm_response} | {current_state}\n{conversation_history}",
            &state,
            &[("llm_response", "VALID")],
        );
        assert_eq!(
            rendered,
            "I need a new laptop | VALID | collect\nUser: I need a new laptop\nAssistant: Sure"
        );
    }

    #[test]
    fn stray_braces_and_json_examples_pass_through() {
        assert_eq!(
            render("Return {\"choice\": 1} or }", &state(), &[]),
            "Return {\"choice\": 1} or }"
        );
        assert_eq!(render("unterminated {field", &state(), &[]), "unterminated {field");
    }
}
