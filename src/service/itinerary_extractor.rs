use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{Category, Itinerary, ItineraryPoint};

/// Fence the model wraps its machine-readable itinerary in.
pub const ITINERARY_FENCE: &str = "```json_itinerary";

static ITINERARY_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(r"(?s){}\s*(.*?)\s*```", regex::escape(ITINERARY_FENCE));
    Regex::new(&pattern).expect("Invalid itinerary block regex")
});

/// Result of scanning a finished reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub cleaned_text: String,
    /// `None` is the plain-chat case: no block, or a block that did not parse.
    pub itinerary: Option<Itinerary>,
}

impl Extracted {
    fn plain(text: &str) -> Self {
        Self { cleaned_text: text.to_string(), itinerary: None }
    }
}

/// Pulls the first fenced itinerary block out of `full_text`.
///
/// A malformed block leaves the text untouched, block included. Only the first
/// block is recognised; any later one stays in the prose.
pub fn extract(full_text: &str) -> Extracted {
    let Some(caps) = ITINERARY_BLOCK.captures(full_text) else {
        return Extracted::plain(full_text);
    };
    let (Some(block), Some(body)) = (caps.get(0), caps.get(1)) else {
        return Extracted::plain(full_text);
    };

    let parsed: Value = match serde_json::from_str(body.as_str()) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to parse itinerary JSON from model reply: {e}");
            return Extracted::plain(full_text);
        }
    };

    let Some(itinerary) = itinerary_from_value(&parsed) else {
        warn!("Itinerary block has no `points` list; keeping reply as plain text");
        return Extracted::plain(full_text);
    };

    let mut cleaned = String::with_capacity(full_text.len() - block.len());
    cleaned.push_str(&full_text[..block.start()]);
    cleaned.push_str(&full_text[block.end()..]);

    debug!("Extracted itinerary with {} points", itinerary.points.len());
    Extracted { cleaned_text: cleaned.trim().to_string(), itinerary: Some(itinerary) }
}

fn itinerary_from_value(value: &Value) -> Option<Itinerary> {
    let points = value.get("points")?.as_array()?;

    let center = value.get("center").and_then(Value::as_array).and_then(|c| match c.as_slice() {
        [a, b] => Some([a.as_f64()?, b.as_f64()?]),
        _ => None,
    });

    Some(Itinerary {
        points: points.iter().map(point_from_value).collect(),
        center,
        zoom: value.get("zoom").and_then(Value::as_f64),
    })
}

/// Every element keeps its slot; fields with the wrong shape fall back to defaults.
fn point_from_value(value: &Value) -> ItineraryPoint {
    let text = |key: &str| value.get(key).and_then(Value::as_str);
    let non_empty = |key: &str| {
        text(key).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
    };
    let number = |key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0);

    ItineraryPoint {
        name: text("name").unwrap_or_default().trim().to_string(),
        city: non_empty("city"),
        address: non_empty("address"),
        description: text("description").unwrap_or_default().to_string(),
        lat: number("lat"),
        lng: number("lng"),
        day: value
            .get("day")
            .and_then(Value::as_u64)
            .filter(|d| *d >= 1)
            .and_then(|d| u32::try_from(d).ok()),
        category: text("category").and_then(Category::parse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_without_block_is_returned_unchanged() {
        let text = "  杭州三日游建议：\n先去西湖。  ";
        let out = extract(text);
        assert_eq!(out.cleaned_text, text);
        assert!(out.itinerary.is_none());
    }

    #[test]
    fn empty_text_has_no_itinerary() {
        let out = extract("");
        assert_eq!(out.cleaned_text, "");
        assert!(out.itinerary.is_none());
    }

    #[test]
    fn well_formed_block_is_removed_and_parsed() {
        let text = "您好\n```json_itinerary\n{\"points\":[{\"name\":\"雷峰塔\",\"city\":\"杭州市\",\"lat\":0,\"lng\":0,\"description\":\"d\",\"day\":1,\"category\":\"sightseeing\"}]}\n```";
        let out = extract(text);
        assert_eq!(out.cleaned_text, "您好");
        let itinerary = out.itinerary.expect("itinerary");
        assert_eq!(itinerary.points.len(), 1);
        let point = &itinerary.points[0];
        assert_eq!(point.name, "雷峰塔");
        assert_eq!(point.city.as_deref(), Some("杭州市"));
        assert_eq!(point.category, Some(Category::Sightseeing));
        assert_eq!(point.day(), 1);
    }

    #[test]
    fn prose_on_both_sides_of_block_is_kept() {
        let text = "第一天\n```json_itinerary\n{\"points\":[{\"name\":\"A\"},{\"name\":\"B\"}]}\n```\n祝旅途愉快";
        let out = extract(text);
        assert_eq!(out.cleaned_text, "第一天\n\n祝旅途愉快");
        assert_eq!(out.itinerary.map(|i| i.points.len()), Some(2));
    }

    #[test]
    fn invalid_json_keeps_original_text_including_block() {
        let text = "行程如下\n```json_itinerary\n{\"points\": [ {\"name\": }\n```";
        let out = extract(text);
        assert_eq!(out.cleaned_text, text);
        assert!(out.itinerary.is_none());
    }

    #[test]
    fn missing_points_list_is_treated_as_plain_text() {
        for body in [r#"{"spots": []}"#, r#"{"points": {"name": "A"}}"#, "[1, 2]"] {
            let text = format!("hi\n```json_itinerary\n{body}\n```");
            let out = extract(&text);
            assert_eq!(out.cleaned_text, text);
            assert!(out.itinerary.is_none());
        }
    }

    #[test]
    fn only_first_block_is_recognised() {
        let text = "a\n```json_itinerary\n{\"points\":[]}\n```\nb\n```json_itinerary\n{\"points\":[{\"name\":\"X\"}]}\n```";
        let out = extract(text);
        let itinerary = out.itinerary.expect("itinerary");
        assert!(itinerary.points.is_empty());
        assert!(out.cleaned_text.starts_with("a\n\nb"));
        assert!(out.cleaned_text.contains(ITINERARY_FENCE));
    }

    #[test]
    fn plain_code_fences_are_ignored() {
        let text = "```json\n{\"points\":[]}\n```";
        let out = extract(text);
        assert_eq!(out.cleaned_text, text);
        assert!(out.itinerary.is_none());
    }

    #[test]
    fn malformed_points_keep_their_slot_with_defaults() {
        let text = "```json_itinerary\n{\"points\":[{\"name\":\"A\",\"day\":0,\"category\":\"museum\",\"lat\":\"x\"}, 42, {\"name\":\"B\",\"address\":\"  \"}],\"center\":[30.2,120.1],\"zoom\":11}\n```";
        let itinerary = extract(text).itinerary.expect("itinerary");
        assert_eq!(itinerary.points.len(), 3);
        let a = &itinerary.points[0];
        assert_eq!(a.day, None);
        assert_eq!(a.category, None);
        assert_eq!(a.lat, 0.0);
        assert_eq!(itinerary.points[1].name, "");
        assert_eq!(itinerary.points[2].address, None);
        assert_eq!(itinerary.center, Some([30.2, 120.1]));
        assert_eq!(itinerary.zoom, Some(11.0));
    }
}
