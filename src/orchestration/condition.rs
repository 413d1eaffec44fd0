//! Step condition evaluation against the workflow context.

use crate::models::{StepCondition, WorkflowContext};

pub fn evaluate(condition: &StepCondition, context: &WorkflowContext) -> bool {
    match condition {
        StepCondition::Always => true,
        StepCondition::StepCompleted(step) => context.step_data.contains_key(step),
        StepCondition::StepSkipped(step) => context.skipped_steps.contains(step),
        StepCondition::ElementCountAtLeast(count) => context.request.elements.len() >= *count,
        StepCondition::HasEffects => context.request.effect_count() > 0,
        StepCondition::HasGpuEffects => context.request.has_gpu_effects(),
        StepCondition::ComplexityAtLeast(complexity) => context.analysis.complexity >= *complexity,
        StepCondition::MetadataEquals { key, value } => {
            context.request.metadata.get(key) == Some(value)
        }
        StepCondition::Not(inner) => !evaluate(inner, context),
        StepCondition::All(conditions) => conditions.iter().all(|c| evaluate(c, context)),
        StepCondition::Any(conditions) => conditions.iter().any(|c| evaluate(c, context)),
    }
}
