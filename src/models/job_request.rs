//! # Video Job Requests
//!
//! The already-parsed, schema-checked composition request handed to the core
//! by the HTTP layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::analysis::JobPriority;

/// Container/output format requested for the rendered video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Mov,
    Gif,
    Mkv,
}

impl OutputFormat {
    /// Relative encoding cost of the container/codec pairing
    pub fn encode_cost_factor(&self) -> f64 {
        match self {
            OutputFormat::Mp4 => 1.0,
            OutputFormat::Webm => 1.4,
            OutputFormat::Mov => 1.1,
            OutputFormat::Gif => 0.6,
            OutputFormat::Mkv => 1.0,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OutputFormat::Mp4 => "mp4",
            OutputFormat::Webm => "webm",
            OutputFormat::Mov => "mov",
            OutputFormat::Gif => "gif",
            OutputFormat::Mkv => "mkv",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Video,
    Audio,
    Image,
    Text,
    Subtitle,
}

impl ElementType {
    /// Whether the element pulls a remote asset that must be downloaded
    pub fn requires_source(&self) -> bool {
        matches!(
            self,
            ElementType::Video | ElementType::Audio | ElementType::Image
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectType {
    Fade,
    Blur,
    ColorGrade,
    ChromaKey,
    Stabilization,
    Upscale,
    Transition,
    Overlay,
    Speed,
}

impl EffectType {
    /// Effects the render farm runs on GPUs
    pub fn is_gpu_accelerated(&self) -> bool {
        matches!(
            self,
            EffectType::ColorGrade
                | EffectType::ChromaKey
                | EffectType::Stabilization
                | EffectType::Upscale
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementEffect {
    pub effect_type: EffectType,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl ElementEffect {
    pub fn new(effect_type: EffectType) -> Self {
        Self {
            effect_type,
            parameters: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

/// One element on the composition timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoElement {
    pub id: String,
    pub element_type: ElementType,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub track: u32,
    #[serde(default)]
    pub position: Option<ElementPosition>,
    /// Start offset on the output timeline, seconds
    #[serde(default)]
    pub start_time: f64,
    /// Duration on the output timeline, seconds. `None` means "natural length"
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub effects: Vec<ElementEffect>,
}

impl VideoElement {
    pub fn new(id: impl Into<String>, element_type: ElementType) -> Self {
        Self {
            id: id.into(),
            element_type,
            source: None,
            track: 0,
            position: None,
            start_time: 0.0,
            duration: None,
            effects: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_timing(mut self, start_time: f64, duration: f64) -> Self {
        self.start_time = start_time;
        self.duration = Some(duration);
        self
    }

    pub fn with_track(mut self, track: u32) -> Self {
        self.track = track;
        self
    }

    pub fn with_effect(mut self, effect_type: EffectType) -> Self {
        self.effects.push(ElementEffect::new(effect_type));
        self
    }
}

/// Validated composition request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJobRequest {
    pub id: String,
    pub output_format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub elements: Vec<VideoElement>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl VideoJobRequest {
    pub fn new(id: impl Into<String>, output_format: OutputFormat, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            output_format,
            width,
            height,
            elements: Vec::new(),
            priority: None,
            metadata: HashMap::new(),
            webhook_url: None,
            timeout_seconds: None,
        }
    }

    pub fn with_element(mut self, element: VideoElement) -> Self {
        self.elements.push(element);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn effect_count(&self) -> usize {
        self.elements.iter().map(|e| e.effects.len()).sum()
    }

    pub fn has_gpu_effects(&self) -> bool {
        self.elements
            .iter()
            .flat_map(|e| e.effects.iter())
            .any(|effect| effect.effect_type.is_gpu_accelerated())
    }

    /// End of the last element on the output timeline, seconds
    pub fn timeline_end(&self) -> f64 {
        self.elements
            .iter()
            .map(|e| e.start_time + e.duration.unwrap_or(0.0))
            .fold(0.0, f64::max)
    }
}
