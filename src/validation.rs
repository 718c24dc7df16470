use serde::Serialize;

use crate::hw::{Codec, PixelFormat};
use crate::pipeline::{StageRegistry, StageSpec};
use crate::recipe::Recipe;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Static checks that need neither the input file nor a device.
pub fn validate_recipe(recipe: &Recipe, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    report.merge(validate_input(recipe));

    if recipe.output.path.as_os_str().is_empty() {
        report.errors.push("Output path cannot be empty".into());
    }

    if recipe.pipeline.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
        return report;
    }

    for (idx, stage) in recipe.pipeline.iter().enumerate() {
        if !registry.contains(&stage.stage) {
            report.errors.push(format!(
                "Stage {} ('{}') is unknown. Available stages: {}",
                idx + 1,
                stage.stage,
                registry.known_stages().join(", ")
            ));
        }
        report.merge(validate_stage_order(idx, stage, &recipe.pipeline));
    }

    if recipe.retry.surface_wait_iterations == 0 {
        report
            .warnings
            .push("retry.surface_wait_iterations is 0; pools are scanned once".into());
    }

    report
}

fn validate_input(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let input = &recipe.input;
    if input.path.as_os_str().is_empty() {
        report.errors.push("Input path cannot be empty".into());
    }
    if input.width == 0 || input.height == 0 {
        report.errors.push(format!(
            "Input dimensions must be non-zero, got {}x{}",
            input.width, input.height
        ));
    }
    if input.format == PixelFormat::Unknown {
        report.errors.push("Input pixel format must be known".into());
    }
    if !input.fps.is_valid() || input.fps.num < 0 || input.fps.den < 0 {
        report
            .errors
            .push(format!("Input frame rate {} is not valid", input.fps));
    }
    if let Some(tb) = input.timebase
        && !tb.is_valid()
    {
        report
            .errors
            .push(format!("Input timebase {tb} is not valid"));
    }
    if input.codec != Codec::Raw {
        report.warnings.push(format!(
            "Input codec {:?} needs a hardware decoder; the software device only reads raw frames",
            input.codec
        ));
    }
    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let earlier = |name: &str| pipeline[..idx].iter().any(|prev| prev.stage == name);
    match stage.stage.as_str() {
        "input" | "decode" if idx != 0 => report.errors.push(format!(
            "Stage {} ('{}') must be the first stage",
            idx + 1,
            stage.stage
        )),
        "encode" => {
            if idx == 0 {
                report.errors.push("Encode stage cannot be first".into());
            }
            if idx + 1 != pipeline.len() {
                report
                    .errors
                    .push("Encode stage must be the last stage; nothing consumes bitstreams".into());
            }
            if !earlier("check_pts") {
                report.warnings.push(
                    "Encode stage without an earlier check_pts stage: frames that lose their timestamp cannot be repaired".into(),
                );
            }
        }
        _ => {}
    }
    if idx == 0 && !matches!(stage.stage.as_str(), "input" | "decode") {
        report.errors.push(format!(
            "Pipeline must start with an input or decode stage, not '{}'",
            stage.stage
        ));
    }
    report
}
