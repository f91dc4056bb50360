use shared_event_bus::{DecisionKind, EventType};

/// Cache key for the decision taken on `(event_type, file_path)`.
#[must_use]
pub fn cache_key(event_type: EventType, file_path: &str) -> String {
    format!("decision:{event_type}:{file_path}")
}

/// Builds the decision prompt for one file event.
#[must_use]
pub fn build_prompt(event_type: EventType, file_path: &str) -> String {
    format!(
        "You are a proactive AI assistant that makes decisions based on file system events.\n\
         \n\
         Current event:\n\
         - Type: {event_type}\n\
         - File: {file_path}\n\
         \n\
         Available decisions:\n\
         1. monitor: Simply monitor the event without taking action\n\
         2. analyze: Analyze the file content to understand its importance\n\
         3. notify: Send a notification about the event\n\
         4. execute: Execute a specific action related to the event\n\
         5. ignore: Ignore the event completely\n\
         \n\
         Based on the event type and file path, what is the most appropriate decision?\n\
         \n\
         Please respond with only the decision keyword (e.g., \"monitor\", \"analyze\", etc.)."
    )
}

/// Extracts a decision from a model reply.
///
/// A bare keyword (any case, optional quotes or punctuation) is accepted
/// directly; otherwise the first keyword appearing as a word wins.
#[must_use]
pub fn parse_decision(reply: &str) -> Option<DecisionKind> {
    let normalized = reply.trim().to_lowercase();
    let bare = normalized.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    if let Ok(kind) = bare.parse() {
        return Some(kind);
    }
    normalized
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|word| word.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_names_event_and_every_option() {
        let prompt = build_prompt(EventType::Write, "/data/report.txt");
        assert!(prompt.contains("- Type: write"));
        assert!(prompt.contains("- File: /data/report.txt"));
        for kind in DecisionKind::ALL {
            assert!(prompt.contains(&format!("{kind}:")), "{kind}");
        }
    }

    #[test]
    fn parses_keywords_loosely() {
        assert_eq!(parse_decision("analyze"), Some(DecisionKind::Analyze));
        assert_eq!(parse_decision("  \"Execute\".\n"), Some(DecisionKind::Execute));
        assert_eq!(
            parse_decision("Decision: notify the owner"),
            Some(DecisionKind::Notify)
        );
        assert_eq!(parse_decision("no idea"), None);
        assert_eq!(parse_decision(""), None);
    }

    #[test]
    fn cache_key_layout() {
        assert_eq!(
            cache_key(EventType::Chmod, "/tmp/x.md"),
            "decision:chmod:/tmp/x.md"
        );
    }
}
