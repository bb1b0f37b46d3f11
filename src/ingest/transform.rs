// Line formats of the supplier's bulk exports. Each line is one JSON object;
// these map a line to a store record or say why it cannot be used.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::model::{
    normalize_key, HotelContent, HotelPolicy, PoiRecord, PointOfInterest, ReviewRecord,
};

#[derive(Debug, Deserialize)]
struct HotelLine {
    hotel_id: String,
    name: String,
    #[serde(default)]
    names: BTreeMap<String, String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    amenities: Vec<String>,
    #[serde(default)]
    policy: HotelPolicy,
    #[serde(default)]
    city: String,
    #[serde(default)]
    country_code: String,
    #[serde(default)]
    stars: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct PoiLine {
    hotel_id: String,
    language: String,
    #[serde(default)]
    pois: Vec<PoiEntry>,
}

#[derive(Debug, Deserialize)]
struct PoiEntry {
    name: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    distance: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReviewLine {
    hotel_id: String,
    language: String,
    rating: f32,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    ratings: BTreeMap<String, f32>,
    #[serde(default)]
    highlights: Vec<String>,
}

fn parse<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, String> {
    serde_json::from_str(line).map_err(|e| e.to_string())
}

fn require_id(hotel_id: &str) -> Result<String, String> {
    let id = hotel_id.trim();
    if id.is_empty() {
        return Err("empty hotel_id".to_string());
    }
    Ok(id.to_string())
}

pub fn hotel_content_line(line: &str) -> Result<Option<HotelContent>, String> {
    let raw: HotelLine = parse(line)?;
    let hotel_id = require_id(&raw.hotel_id)?;

    // Half stars round down, zero means unclassified
    let star_rating = match raw.stars {
        Some(s) if !(0.0..=5.0).contains(&s) => {
            return Err(format!("star rating {} out of range", s));
        }
        Some(s) if s >= 1.0 => Some(s.floor() as u8),
        _ => None,
    };

    Ok(Some(HotelContent {
        hotel_id,
        canonical_name: raw.name.trim().to_string(),
        translated_names: raw.names,
        images: raw.images,
        amenities: raw.amenities,
        policy: raw.policy,
        city_normalized: normalize_key(&raw.city),
        country_code: raw.country_code.trim().to_ascii_uppercase(),
        star_rating,
    }))
}

// Lines in other languages are skipped, not errors
pub fn poi_line(language: &str) -> impl Fn(&str) -> Result<Option<PoiRecord>, String> + Send + 'static {
    let language = language.to_ascii_lowercase();
    move |line| {
        let raw: PoiLine = parse(line)?;
        if !raw.language.eq_ignore_ascii_case(&language) {
            return Ok(None);
        }
        Ok(Some(PoiRecord {
            hotel_id: require_id(&raw.hotel_id)?,
            language: language.clone(),
            points: raw
                .pois
                .into_iter()
                .map(|p| PointOfInterest {
                    name: p.name,
                    kind: p.kind,
                    distance_m: p.distance,
                })
                .collect(),
        }))
    }
}

pub fn review_line(
    language: &str,
) -> impl Fn(&str) -> Result<Option<ReviewRecord>, String> + Send + 'static {
    let language = language.to_ascii_lowercase();
    move |line| {
        let raw: ReviewLine = parse(line)?;
        if !raw.language.eq_ignore_ascii_case(&language) {
            return Ok(None);
        }
        if !(0.0..=10.0).contains(&raw.rating) {
            return Err(format!("rating {} out of range", raw.rating));
        }
        Ok(Some(ReviewRecord {
            hotel_id: require_id(&raw.hotel_id)?,
            language: language.clone(),
            rating: raw.rating,
            review_count: raw.count,
            detailed_ratings: raw.ratings,
            highlights: raw.highlights,
        }))
    }
}
