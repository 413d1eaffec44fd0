//! Request builders for the scenario tests

#![allow(dead_code)]

use reelflow_core::models::{EffectType, ElementType, OutputFormat, VideoElement, VideoJobRequest};

/// One 10s clip at 720p: analyzed as simple and run inline
pub fn simple_request(id: &str) -> VideoJobRequest {
    VideoJobRequest::new(id, OutputFormat::Mp4, 1280, 720).with_element(
        VideoElement::new("clip", ElementType::Video)
            .with_source("s3://media/clip.mp4")
            .with_timing(0.0, 10.0),
    )
}

/// Two 40s clips at 720p without effects: queued on the balanced template
pub fn balanced_request(id: &str) -> VideoJobRequest {
    (0..2).fold(
        VideoJobRequest::new(id, OutputFormat::Mp4, 1280, 720),
        |request, n| {
            request.with_element(
                VideoElement::new(format!("clip-{n}"), ElementType::Video)
                    .with_source(format!("s3://media/clip-{n}.mp4"))
                    .with_timing(f64::from(n) * 40.0, 40.0)
                    .with_track(n),
            )
        },
    )
}

/// Eight 50s clips at 4K with GPU upscaling: 400s of source material,
/// distributed, two GPU units
pub fn distributed_request(id: &str) -> VideoJobRequest {
    (0..8).fold(
        VideoJobRequest::new(id, OutputFormat::Mp4, 3840, 2160),
        |request, n| {
            request.with_element(
                VideoElement::new(format!("shot-{n}"), ElementType::Video)
                    .with_source(format!("s3://media/shot-{n}.mov"))
                    .with_timing(f64::from(n) * 50.0, 50.0)
                    .with_track(n % 2)
                    .with_effect(EffectType::Upscale),
            )
        },
    )
}
