//! Keyword routing of follow-up messages.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    AddPoi,
    RemovePoi,
    AskQuestion,
    ReplacePoi,
    ModifyItinerary,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddPoi => "add_poi",
            Self::RemovePoi => "remove_poi",
            Self::AskQuestion => "ask_question",
            Self::ReplacePoi => "replace_poi",
            Self::ModifyItinerary => "modify_itinerary",
        }
    }
}

const REMOVE_WORDS: &[&str] = &["remove", "delete", "drop", "skip", "exclude"];
const ADD_WORDS: &[&str] = &["add", "include", "insert", "append"];
const QUESTION_WORDS: &[&str] = &[
    "what", "when", "where", "which", "who", "why", "how", "is", "are", "can", "could", "does", "do", "should",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "to", "from", "of", "in", "into", "on", "at", "my", "our", "your", "me", "us", "i", "we",
    "please", "also", "too", "it", "itinerary", "trip", "plan", "list", "route", "stop", "stops", "place",
    "visit", "want", "would", "like", "could", "can", "you", "let's", "lets", "and", "out", "get", "rid",
    "take", "put",
];

fn words(message: &str) -> Vec<String> {
    message
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'' && c != '-').to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn replace_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\b(?:replace|swap)\s+(.+?)\s+(?:with|for)\s+(.+)$").ok())
        .as_ref()
}

/// Exactly one intent per message; an add/remove tie falls to `ModifyItinerary`.
pub fn classify(message: &str) -> Intent {
    if parse_replace(message).is_some() {
        return Intent::ReplacePoi;
    }
    let words = words(message);
    let has = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));
    let (remove, add) = (has(REMOVE_WORDS), has(ADD_WORDS) || message.to_lowercase().contains("take me to"));
    match (remove, add) {
        (true, true) => Intent::ModifyItinerary,
        (true, false) => Intent::RemovePoi,
        (false, true) => Intent::AddPoi,
        (false, false) => {
            let asks = message.trim_end().ends_with('?')
                || words.first().is_some_and(|w| QUESTION_WORDS.contains(&w.as_str()));
            if asks { Intent::AskQuestion } else { Intent::ModifyItinerary }
        }
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn clean_name(fragment: &str, drop: &[&str]) -> Option<String> {
    let kept: Vec<String> = words(fragment)
        .into_iter()
        .filter(|w| !STOP_WORDS.contains(&w.as_str()) && !drop.contains(&w.as_str()))
        .map(|w| title_case(&w))
        .collect();
    (!kept.is_empty()).then(|| kept.join(" "))
}

/// The place named in an add/remove request, title-cased.
pub fn extract_poi_name(message: &str) -> Option<String> {
    let verbs: Vec<&str> = REMOVE_WORDS.iter().chain(ADD_WORDS).copied().collect();
    clean_name(message, &verbs)
}

/// `replace X with Y` or `swap X for Y`, as (X, Y).
pub fn parse_replace(message: &str) -> Option<(String, String)> {
    let caps = replace_pattern()?.captures(message.trim())?;
    let from = clean_name(caps.get(1)?.as_str(), &[])?;
    let to = clean_name(caps.get(2)?.as_str(), &[])?;
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_phrasings() {
        let cases = [
            ("replace Castle with Aquarium", Intent::ReplacePoi),
            ("Could you swap the castle for the aquarium?", Intent::ReplacePoi),
            ("remove the Castle please", Intent::RemovePoi),
            ("add Oceanário to my itinerary", Intent::AddPoi),
            ("What time does the castle open?", Intent::AskQuestion),
            ("how far is Sintra", Intent::AskQuestion),
            ("make it more relaxed", Intent::ModifyItinerary),
            ("add the castle and remove the museum", Intent::ModifyItinerary),
        ];
        for (message, expected) in cases {
            assert_eq!(classify(message), expected, "{message}");
        }
    }

    #[test]
    fn address_is_not_an_add() {
        assert_eq!(classify("The address was wrong."), Intent::ModifyItinerary);
    }

    #[test]
    fn names_drop_stop_words_and_title_case() {
        assert_eq!(extract_poi_name("please add the oceanário to my itinerary").as_deref(), Some("Oceanário"));
        assert_eq!(extract_poi_name("remove são jorge castle").as_deref(), Some("São Jorge Castle"));
        assert_eq!(extract_poi_name("add it"), None);
    }

    #[test]
    fn replace_pattern_captures_both_sides() {
        assert_eq!(
            parse_replace("Replace the Castle with Lisbon Aquarium."),
            Some(("Castle".to_string(), "Lisbon Aquarium".to_string()))
        );
        assert_eq!(parse_replace("swap castle for aquarium"), Some(("Castle".into(), "Aquarium".into())));
        assert_eq!(parse_replace("replace everything"), None);
    }
}
