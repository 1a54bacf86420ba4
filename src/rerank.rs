use std::cmp::Ordering;

use crate::geo::{DistanceCalculator, GeoPoint};
use crate::recommendation::{CompositeResult, PoiDetail};

/// Recompute distances from `reference` and stable-sort ascending.
/// POIs without usable coordinates sort last and keep a distance of zero.
pub fn rerank(
    pois: Vec<PoiDetail>,
    reference: Option<GeoPoint>,
    calc: &dyn DistanceCalculator,
) -> Vec<PoiDetail> {
    let Some(reference) = reference else { return pois };
    if pois.is_empty() {
        return pois;
    }
    let mut keyed: Vec<(Option<f64>, PoiDetail)> = pois
        .into_iter()
        .map(|mut poi| {
            let meters = poi.location().map(|at| calc.distance(reference, at));
            poi.distance = meters.unwrap_or_default();
            (meters, poi)
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    keyed.into_iter().map(|(_, poi)| poi).collect()
}

/// Rerank the general list and the itinerary of a composite in place.
pub fn rerank_composite(
    result: &mut CompositeResult,
    reference: Option<GeoPoint>,
    calc: &dyn DistanceCalculator,
) {
    if reference.is_none() {
        return;
    }
    result.general_pois = rerank(std::mem::take(&mut result.general_pois), reference, calc);
    if let Some(itinerary) = result.itinerary.as_mut() {
        itinerary.pois = rerank(std::mem::take(&mut itinerary.pois), reference, calc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Haversine;
    use crate::recommendation::Itinerary;

    fn poi(name: &str, lat: f64, lon: f64) -> PoiDetail {
        PoiDetail { name: name.into(), latitude: Some(lat), longitude: Some(lon), ..Default::default() }
    }

    fn names(pois: &[PoiDetail]) -> Vec<&str> {
        pois.iter().map(|p| p.name.as_str()).collect()
    }

    /// Distance is the absolute latitude difference, for predictable ties.
    struct LatitudeOnly;

    impl DistanceCalculator for LatitudeOnly {
        fn distance(&self, a: GeoPoint, b: GeoPoint) -> f64 {
            (a.latitude - b.latitude).abs()
        }
    }

    #[test]
    fn sorts_ascending_by_distance() {
        let origin = GeoPoint::new(38.70, -9.14);
        let pois = vec![poi("far", 38.80, -9.14), poi("near", 38.71, -9.14), poi("mid", 38.75, -9.14)];
        let sorted = rerank(pois, origin, &Haversine);
        assert_eq!(names(&sorted), vec!["near", "mid", "far"]);
        assert!(sorted[0].distance > 0.0);
        assert!(sorted[0].distance < sorted[1].distance);
    }

    #[test]
    fn ties_keep_prior_order() {
        let origin = GeoPoint::new(10.0, 0.0);
        let pois = vec![poi("b", 11.0, 5.0), poi("a", 9.0, -5.0), poi("c", 10.5, 0.0)];
        let sorted = rerank(pois, origin, &LatitudeOnly);
        assert_eq!(names(&sorted), vec!["c", "b", "a"]);
    }

    #[test]
    fn none_reference_is_a_no_op() {
        let pois = vec![poi("z", 1.0, 1.0), poi("a", 2.0, 2.0)];
        let same = rerank(pois.clone(), None, &Haversine);
        assert_eq!(same, pois);
        assert!(same.iter().all(|p| p.distance == 0.0));
    }

    #[test]
    fn reranking_is_idempotent() {
        let origin = GeoPoint::new(38.70, -9.14);
        let pois = vec![poi("c", 38.9, -9.1), poi("a", 38.71, -9.1), poi("b", 38.8, -9.1)];
        let once = rerank(pois, origin, &Haversine);
        let twice = rerank(once.clone(), origin, &Haversine);
        assert_eq!(once, twice);
    }

    #[test]
    fn invalid_coordinates_sort_last() {
        let origin = GeoPoint::new(0.5, 0.5);
        let pois = vec![poi("broken", 123.0, 0.0), poi("ok", 1.0, 1.0)];
        let sorted = rerank(pois, origin, &Haversine);
        assert_eq!(names(&sorted), vec!["ok", "broken"]);
    }

    #[test]
    fn missing_coordinates_sort_last_even_near_origin() {
        let origin = GeoPoint::new(0.1, 0.1);
        let unknown: PoiDetail = serde_json::from_str(r#"{"name":"No Coords"}"#).unwrap();
        assert!(unknown.location().is_none());
        let sorted = rerank(vec![unknown, poi("Real", 1.0, 1.0)], origin, &Haversine);
        assert_eq!(names(&sorted), vec!["Real", "No Coords"]);
        assert_eq!(sorted[1].distance, 0.0);
        let stored: Vec<PoiDetail> = serde_json::from_str(&serde_json::to_string(&sorted).unwrap()).unwrap();
        assert_eq!(stored, sorted);
    }

    #[test]
    fn composite_reranks_both_lists() {
        let origin = GeoPoint::new(0.0, 0.0);
        let mut result = CompositeResult {
            city: None,
            general_pois: vec![poi("g2", 2.0, 0.0), poi("g1", 1.0, 0.0)],
            itinerary: Some(Itinerary {
                pois: vec![poi("i2", 0.2, 0.0), poi("i1", 0.1, 0.0)],
                ..Default::default()
            }),
        };
        rerank_composite(&mut result, origin, &Haversine);
        assert_eq!(names(&result.general_pois), vec!["g1", "g2"]);
        assert_eq!(names(&result.itinerary.unwrap().pois), vec!["i1", "i2"]);
    }
}
