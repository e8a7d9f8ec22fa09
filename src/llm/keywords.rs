//! Deterministic command matcher used when inference is unavailable.

use crate::llm::{CommandAction, CommandIntent};
use crate::pipeline::channel_gate::{ToggleTarget, parse_toggle_utterance};

/// Case-insensitive prefix strip that keeps the original casing of the rest.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| text[prefix.len()..].trim())
}

fn strip_any<'a>(text: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| strip_prefix_ci(text, p))
}

/// Map an operator utterance onto a command using fixed phrasings.
pub fn keyword_intent(text: &str) -> CommandIntent {
    let text = text.trim().trim_end_matches(['.', '!', '?']);
    let lower = text.to_lowercase();

    match lower.as_str() {
        "help" | "commands" => return CommandIntent::new(CommandAction::Help),
        "status" | "what's on" | "whats on" => return CommandIntent::new(CommandAction::Status),
        "rules" | "list rules" | "show rules" => {
            return CommandIntent::new(CommandAction::ListRules);
        }
        "clear rules" | "delete all rules" | "remove all rules" => {
            return CommandIntent::new(CommandAction::ClearRules);
        }
        _ => {}
    }

    if let Some(sender) = strip_any(
        text,
        &[
            "trash all mail from ",
            "trash mail from ",
            "trash all emails from ",
            "trash emails from ",
            "delete all mail from ",
            "delete all emails from ",
            "delete emails from ",
        ],
    ) {
        return CommandIntent::new(CommandAction::TrashMail).with_target(sender);
    }

    if let Some(rest) = strip_any(text, &["add rule ", "add rule: ", "new rule "]) {
        let rest = rest.trim_start_matches(':').trim();
        if let Some((scope, spec)) = rest.split_once(char::is_whitespace) {
            return CommandIntent::new(CommandAction::AddRule)
                .with_target(scope)
                .with_content(spec.trim());
        }
    }

    for (prefix, policy) in [
        ("never reply to ", "never"),
        ("always reply to ", "always"),
        ("auto reply to ", "automatic"),
        ("ask me about ", "manual_review"),
        ("ask me before replying to ", "manual_review"),
    ] {
        if let Some(who) = strip_prefix_ci(text, prefix) {
            return CommandIntent::new(CommandAction::SetPolicy)
                .with_target(who)
                .with_content(policy);
        }
    }
    if let Some(rest) = strip_any(text, &["set policy for ", "policy for "])
        && let Some((who, policy)) = rest.rsplit_once(" to ")
    {
        return CommandIntent::new(CommandAction::SetPolicy)
            .with_target(who.trim())
            .with_content(policy.trim());
    }

    if let Some(query) = strip_any(text, &["find ", "who is ", "look up ", "lookup "]) {
        return CommandIntent::new(CommandAction::FindContact).with_target(query);
    }

    if let Some(rest) = strip_any(text, &["text ", "send ", "tell ", "message "]) {
        let split = rest
            .split_once(':')
            .or_else(|| rest.split_once(char::is_whitespace));
        if let Some((who, body)) = split {
            return CommandIntent::new(CommandAction::SendMessage)
                .with_target(who.trim())
                .with_content(body.trim());
        }
    }

    if let Some(toggle) = parse_toggle_utterance(text) {
        let target = match toggle.target {
            ToggleTarget::One(ch) => ch.as_str().to_string(),
            ToggleTarget::All => "all".to_string(),
        };
        return CommandIntent::new(CommandAction::ToggleChannel)
            .with_target(target)
            .with_content(if toggle.enable { "on" } else { "off" });
    }

    CommandIntent::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_phrases() {
        assert_eq!(keyword_intent("Help").action, CommandAction::Help);
        assert_eq!(keyword_intent("status?").action, CommandAction::Status);
        assert_eq!(keyword_intent("list rules").action, CommandAction::ListRules);
        assert_eq!(keyword_intent("clear rules").action, CommandAction::ClearRules);
    }

    #[test]
    fn trash_keeps_sender_case() {
        let intent = keyword_intent("Trash all mail from Promo@Shop.com");
        assert_eq!(intent.action, CommandAction::TrashMail);
        assert_eq!(intent.target.as_deref(), Some("Promo@Shop.com"));
        assert!(intent.action.is_destructive());
    }

    #[test]
    fn toggles() {
        let intent = keyword_intent("turn off email");
        assert_eq!(intent.action, CommandAction::ToggleChannel);
        assert_eq!(intent.target.as_deref(), Some("mail"));
        assert_eq!(intent.content.as_deref(), Some("off"));

        let intent = keyword_intent("resume everything");
        assert_eq!(intent.target.as_deref(), Some("all"));
        assert_eq!(intent.content.as_deref(), Some("on"));
    }

    #[test]
    fn policies() {
        let intent = keyword_intent("never reply to Bob");
        assert_eq!(intent.action, CommandAction::SetPolicy);
        assert_eq!(intent.target.as_deref(), Some("Bob"));
        assert_eq!(intent.content.as_deref(), Some("never"));

        let intent = keyword_intent("set policy for my sister to manual review");
        assert_eq!(intent.target.as_deref(), Some("my sister"));
        assert_eq!(intent.content.as_deref(), Some("manual review"));
    }

    #[test]
    fn send_message_with_colon() {
        let intent = keyword_intent("text Ann: running late, 10 min");
        assert_eq!(intent.action, CommandAction::SendMessage);
        assert_eq!(intent.target.as_deref(), Some("Ann"));
        assert_eq!(intent.content.as_deref(), Some("running late, 10 min"));
    }

    #[test]
    fn add_rule() {
        let intent = keyword_intent("add rule mail domain example.com -> discard");
        assert_eq!(intent.action, CommandAction::AddRule);
        assert_eq!(intent.target.as_deref(), Some("mail"));
        assert_eq!(intent.content.as_deref(), Some("domain example.com -> discard"));
    }

    #[test]
    fn find_contact() {
        let intent = keyword_intent("who is +1 555 123 4567");
        assert_eq!(intent.action, CommandAction::FindContact);
        assert_eq!(intent.target.as_deref(), Some("+1 555 123 4567"));
    }

    #[test]
    fn chatter_is_unknown() {
        assert_eq!(keyword_intent("lovely weather").action, CommandAction::Unknown);
    }
}
