//! Input validation for incoming job requests
//!
//! The HTTP front door already schema-checks requests; these checks guard the
//! orchestrator's own assumptions (positive frame size, finite timing, media
//! sources present) and bound the metadata blob. Failures surface as
//! `VALIDATION_ERROR` before anything is allocated.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{OrchestratorError, Result};
use crate::models::VideoJobRequest;

/// Largest accepted frame edge, in pixels (8K)
pub const MAX_DIMENSION: u32 = 8_192;

pub const MAX_ELEMENTS: usize = 500;

pub const MAX_TRACK: u32 = 64;

/// Longest accepted element, in seconds
pub const MAX_ELEMENT_DURATION_SECS: f64 = 4.0 * 60.0 * 60.0;

const MAX_JSON_SIZE_BYTES: usize = 64 * 1024;

const MAX_JSON_DEPTH: usize = 10;

const MAX_JSON_KEYS: usize = 1000;

const MAX_JSON_STRING_LENGTH: usize = 10_000;

/// Validate a job request before analysis
pub fn validate_job_request(request: &VideoJobRequest) -> Result<()> {
    if request.id.trim().is_empty() {
        return Err(OrchestratorError::validation("id", "job id must not be empty"));
    }

    for (field, value) in [("width", request.width), ("height", request.height)] {
        if value == 0 || value > MAX_DIMENSION {
            return Err(OrchestratorError::validation(
                field,
                format!("must be between 1 and {MAX_DIMENSION}, got {value}"),
            ));
        }
    }

    if request.elements.is_empty() {
        return Err(OrchestratorError::validation(
            "elements",
            "at least one element is required",
        ));
    }
    if request.elements.len() > MAX_ELEMENTS {
        return Err(OrchestratorError::validation(
            "elements",
            format!(
                "too many elements: {} (max: {MAX_ELEMENTS})",
                request.elements.len()
            ),
        ));
    }

    let mut ids = HashSet::new();
    for (index, element) in request.elements.iter().enumerate() {
        let field = |name: &str| format!("elements[{index}].{name}");

        if !ids.insert(element.id.as_str()) {
            return Err(OrchestratorError::validation(
                field("id"),
                format!("duplicate element id '{}'", element.id),
            ));
        }
        if element.element_type.requires_source()
            && element.source.as_deref().map_or(true, |s| s.trim().is_empty())
        {
            return Err(OrchestratorError::validation(
                field("source"),
                format!("{:?} elements require a source", element.element_type),
            ));
        }
        if !element.start_time.is_finite() || element.start_time < 0.0 {
            return Err(OrchestratorError::validation(
                field("start_time"),
                "must be a finite, non-negative number of seconds",
            ));
        }
        if let Some(duration) = element.duration {
            if !duration.is_finite() || duration <= 0.0 || duration > MAX_ELEMENT_DURATION_SECS {
                return Err(OrchestratorError::validation(
                    field("duration"),
                    format!("must be within (0, {MAX_ELEMENT_DURATION_SECS}] seconds"),
                ));
            }
        }
        if element.track > MAX_TRACK {
            return Err(OrchestratorError::validation(
                field("track"),
                format!("track {} exceeds maximum {MAX_TRACK}", element.track),
            ));
        }
    }

    if request.timeout_seconds == Some(0) {
        return Err(OrchestratorError::validation(
            "timeout_seconds",
            "must be greater than zero when present",
        ));
    }

    if let Some(webhook) = &request.webhook_url {
        if !(webhook.starts_with("https://") || webhook.starts_with("http://")) {
            return Err(OrchestratorError::validation(
                "webhook_url",
                "must be an http(s) URL",
            ));
        }
    }

    let metadata = serde_json::to_value(&request.metadata)
        .map_err(|e| OrchestratorError::validation("metadata", e.to_string()))?;
    validate_json_input("metadata", &metadata)
}

/// Size and shape limits for free-form JSON carried on a request
pub fn validate_json_input(field: &str, value: &Value) -> Result<()> {
    let serialized = serde_json::to_string(value)
        .map_err(|e| OrchestratorError::validation(field, format!("invalid JSON: {e}")))?;

    if serialized.len() > MAX_JSON_SIZE_BYTES {
        return Err(OrchestratorError::validation(
            field,
            format!(
                "payload too large: {} bytes (max: {MAX_JSON_SIZE_BYTES})",
                serialized.len()
            ),
        ));
    }

    validate_json_depth(field, value, 0)
}

fn validate_json_depth(field: &str, value: &Value, current_depth: usize) -> Result<()> {
    if current_depth > MAX_JSON_DEPTH {
        return Err(OrchestratorError::validation(
            field,
            format!("nesting too deep: {current_depth} (max: {MAX_JSON_DEPTH})"),
        ));
    }

    match value {
        Value::Object(map) => {
            if map.len() > MAX_JSON_KEYS {
                return Err(OrchestratorError::validation(
                    field,
                    format!("too many keys: {} (max: {MAX_JSON_KEYS})", map.len()),
                ));
            }
            for (key, val) in map {
                if key.len() > MAX_JSON_STRING_LENGTH {
                    return Err(OrchestratorError::validation(field, "key too long"));
                }
                validate_json_depth(field, val, current_depth + 1)?;
            }
        }
        Value::Array(items) => {
            if items.len() > MAX_JSON_KEYS {
                return Err(OrchestratorError::validation(
                    field,
                    format!("array too large: {} items (max: {MAX_JSON_KEYS})", items.len()),
                ));
            }
            for item in items {
                validate_json_depth(field, item, current_depth + 1)?;
            }
        }
        Value::String(s) if s.len() > MAX_JSON_STRING_LENGTH => {
            return Err(OrchestratorError::validation(
                field,
                format!("string too long: {} chars", s.len()),
            ));
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ElementType, OutputFormat, VideoElement};
    use serde_json::json;

    fn valid_request() -> VideoJobRequest {
        VideoJobRequest::new("job-1", OutputFormat::Mp4, 1280, 720).with_element(
            VideoElement::new("clip", ElementType::Video)
                .with_source("https://cdn.example.com/clip.mp4")
                .with_timing(0.0, 10.0),
        )
    }

    fn field_of(result: Result<()>) -> String {
        match result {
            Err(OrchestratorError::Validation { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_job_request(&valid_request()).is_ok());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let mut request = valid_request();
        request.height = 0;
        assert_eq!(field_of(validate_job_request(&request)), "height");
    }

    #[test]
    fn test_media_without_source_rejected() {
        let request = VideoJobRequest::new("job-2", OutputFormat::Mp4, 1280, 720)
            .with_element(VideoElement::new("clip", ElementType::Video).with_timing(0.0, 5.0));
        assert_eq!(
            field_of(validate_job_request(&request)),
            "elements[0].source"
        );
    }

    #[test]
    fn test_text_needs_no_source() {
        let request = VideoJobRequest::new("job-3", OutputFormat::Mp4, 1280, 720)
            .with_element(VideoElement::new("title", ElementType::Text).with_timing(0.0, 3.0));
        assert!(validate_job_request(&request).is_ok());
    }

    #[test]
    fn test_non_finite_timing_rejected() {
        let mut request = valid_request();
        request.elements[0].duration = Some(f64::NAN);
        assert_eq!(
            field_of(validate_job_request(&request)),
            "elements[0].duration"
        );
    }

    #[test]
    fn test_duplicate_element_ids_rejected() {
        let request = valid_request().with_element(
            VideoElement::new("clip", ElementType::Audio)
                .with_source("https://cdn.example.com/a.mp3"),
        );
        assert_eq!(field_of(validate_job_request(&request)), "elements[1].id");
    }

    #[test]
    fn test_deep_metadata_rejected() {
        let mut nested = json!("leaf");
        for _ in 0..12 {
            nested = json!({ "inner": nested });
        }
        let request = valid_request().with_metadata("deep", nested);
        assert_eq!(field_of(validate_job_request(&request)), "metadata");
    }
}
