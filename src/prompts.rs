//! Prompt builders, one per generation task.
//!
//! Each prompt opens with a fixed task line so a response can be traced back
//! to the task that asked for it.

use crate::recommendation::{Itinerary, UserPreferences};
use crate::session::{Message, Role};

pub const CITY_TASK: &str = "Describe the city";
pub const GENERAL_POIS_TASK: &str = "List the best-known points of interest";
pub const ITINERARY_TASK: &str = "Plan a personalized itinerary";
pub const POI_DETAILS_TASK: &str = "Describe the point of interest";
pub const ANSWER_TASK: &str = "Answer the traveller's question";

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

pub fn city(city: &str) -> String {
    format!(
        "{CITY_TASK} {city}.\n{JSON_ONLY}\n\
         Fields: city, country, state_province, description, center_latitude, center_longitude, \
         population, area, timezone, language, weather, attractions, history."
    )
}

pub fn general_pois(city: &str) -> String {
    format!(
        "{GENERAL_POIS_TASK} in {city}.\n{JSON_ONLY}\n\
         Shape: {{\"points_of_interest\": [{{\"name\", \"category\", \"latitude\", \"longitude\", \"description_poi\"}}]}}"
    )
}

pub fn itinerary(city: &str, prefs: &UserPreferences, max_pois: u32) -> String {
    let max_pois = prefs.max_pois.unwrap_or(max_pois).max(1);
    let mut out = format!("{ITINERARY_TASK} in {city} with at most {max_pois} stops.\n");
    if !prefs.interests.is_empty() {
        out.push_str(&format!("Interests: {}.\n", prefs.interests.join(", ")));
    }
    let extras = [
        ("Travel style", &prefs.travel_style),
        ("Budget", &prefs.budget),
        ("Pace", &prefs.pace),
        ("Accessibility needs", &prefs.accessibility_needs),
    ];
    for (label, value) in extras {
        if let Some(v) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            out.push_str(&format!("{label}: {v}.\n"));
        }
    }
    out.push_str(JSON_ONLY);
    out.push_str(
        "\nShape: {\"itinerary_name\", \"overall_description\", \"points_of_interest\": \
         [{\"name\", \"category\", \"latitude\", \"longitude\", \"description_poi\"}]}",
    );
    out
}

pub fn poi_details(name: &str, city: &str) -> String {
    format!(
        "{POI_DETAILS_TASK} \"{name}\" in {city}.\n{JSON_ONLY}\n\
         Fields: name, category, latitude, longitude, description_poi, address, website, \
         opening_hours, rating, price_level, tags."
    )
}

pub fn answer(question: &str, city: Option<&str>, itinerary: Option<&Itinerary>, history: &[Message]) -> String {
    let mut out = format!("{ANSWER_TASK} in plain text.\n");
    if let Some(city) = city {
        out.push_str(&format!("They are visiting {city}.\n"));
    }
    if let Some(itinerary) = itinerary.filter(|i| !i.pois.is_empty()) {
        let names: Vec<&str> = itinerary.pois.iter().map(|p| p.name.as_str()).collect();
        out.push_str(&format!("Current itinerary: {}.\n", names.join(", ")));
    }
    if !history.is_empty() {
        out.push_str("Recent conversation:\n");
        for msg in history {
            let who = match msg.role {
                Role::User => "traveller",
                Role::Assistant => "assistant",
            };
            out.push_str(&format!("- {who}: {}\n", msg.content));
        }
    }
    out.push_str(&format!("Question: {question}"));
    out
}
