use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CityDetail {
    #[serde(alias = "city", alias = "city_name")]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state_province: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "center_latitude")]
    pub latitude: f64,
    #[serde(default, alias = "center_longitude")]
    pub longitude: f64,
    #[serde(default)]
    pub population: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub weather: Option<String>,
    #[serde(default)]
    pub attractions: Option<String>,
    #[serde(default)]
    pub history: Option<String>,
}

impl CityDetail {
    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PoiDetail {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, alias = "description_poi")]
    pub description: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub opening_hours: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub price_level: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Meters from the reference location; zero until a rerank pass runs.
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub interaction_id: Option<Uuid>,
}

impl PoiDetail {
    /// `None` when either coordinate is missing or out of range.
    pub fn location(&self) -> Option<GeoPoint> {
        GeoPoint::new(self.latitude?, self.longitude?)
    }

    /// Case-insensitive containment match used by every itinerary lookup.
    pub fn matches_name(&self, query: &str) -> bool {
        let query = normalize_name(query);
        !query.is_empty() && normalize_name(&self.name).contains(&query)
    }
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Itinerary {
    #[serde(default, alias = "itinerary_name")]
    pub name: String,
    #[serde(default, alias = "overall_description")]
    pub description: String,
    #[serde(default, alias = "points_of_interest")]
    pub pois: Vec<PoiDetail>,
}

impl Itinerary {
    pub fn position_of(&self, query: &str) -> Option<usize> {
        self.pois.iter().position(|p| p.matches_name(query))
    }

    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty() && self.pois.is_empty()
    }
}

/// City summary, general POIs and the personalized itinerary of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CompositeResult {
    pub city: Option<CityDetail>,
    #[serde(default)]
    pub general_pois: Vec<PoiDetail>,
    pub itinerary: Option<Itinerary>,
}

impl CompositeResult {
    pub fn poi_count(&self) -> usize {
        self.general_pois.len() + self.itinerary.as_ref().map_or(0, |i| i.pois.len())
    }

    pub fn itinerary_mut(&mut self) -> &mut Itinerary {
        self.itinerary.get_or_insert_with(Itinerary::default)
    }
}

/// Preference profile supplied with a first-turn request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserPreferences {
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub travel_style: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub pace: Option<String>,
    #[serde(default)]
    pub accessibility_needs: Option<String>,
    #[serde(default)]
    pub max_pois: Option<u32>,
}
