use std::fs;
use std::path::Path;

use bunker_transcode::hw::Codec;
use bunker_transcode::pipeline::StageRegistry;
use bunker_transcode::recipe::Recipe;
use bunker_transcode::validation::validate_recipe;
use tempfile::tempdir;

fn write_recipe(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("recipe.yaml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn valid_recipe_loads_and_resolves_relative_paths() -> anyhow::Result<()> {
    let temp = tempdir()?;
    let path = write_recipe(
        temp.path(),
        r#"
version: 1
input:
  path: media/in.yuv
  width: 16
  height: 8
  fps: [25, 1]
  timebase: [1, 90000]
pipeline:
  - stage: decode
  - stage: check_pts
    params: {avsync: vfr}
  - stage: encode
output:
  path: out/stream.bin
  timecode: out/timecode.txt
retry:
  encode_hang_ceiling: 10
"#,
    );

    let mut recipe = Recipe::load(&path)?;
    let report = validate_recipe(&recipe, &StageRegistry::with_defaults());
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    assert_eq!(recipe.retry.encode_hang_ceiling, 10);
    assert_eq!(recipe.retry.sync_timeout_ms, 20_000);
    assert_eq!(recipe.input.source_timebase().den, 90_000);

    recipe.resolve_paths(temp.path());
    assert_eq!(recipe.input.path, temp.path().join("media/in.yuv"));
    assert_eq!(recipe.output.path, temp.path().join("out/stream.bin"));
    assert_eq!(
        recipe.output.timecode.as_deref(),
        Some(temp.path().join("out/timecode.txt").as_path())
    );
    Ok(())
}

#[test]
fn unknown_stage_lists_the_registry() {
    let recipe = Recipe::parse(
        r#"
version: 1
input: {path: in.yuv, width: 4, height: 4}
pipeline:
  - stage: input
  - stage: denoise
output: {path: out.yuv}
"#,
    )
    .unwrap();

    let report = validate_recipe(&recipe, &StageRegistry::with_defaults());
    assert!(!report.is_ok());
    let message = &report.errors[0];
    assert!(message.contains("Stage 2 ('denoise') is unknown"), "{message}");
    assert!(message.contains("check_pts"));
    assert!(message.contains("trim"));
}

#[test]
fn broken_input_description_reports_every_problem() {
    let recipe = Recipe::parse(
        r#"
version: 2
input: {path: "", width: 0, height: 4, fps: [0, 1], timebase: [1, 0], codec: hevc}
pipeline:
  - stage: input
output: {path: ""}
retry: {surface_wait_iterations: 0}
"#,
    )
    .unwrap();
    assert_eq!(recipe.input.codec, Codec::Hevc);

    let report = validate_recipe(&recipe, &StageRegistry::with_defaults());
    let expected = [
        "Unsupported recipe version: 2",
        "Input path cannot be empty",
        "Input dimensions must be non-zero",
        "frame rate",
        "timebase",
        "Output path cannot be empty",
    ];
    for needle in expected {
        assert!(
            report.errors.iter().any(|e| e.contains(needle)),
            "missing '{needle}' in {:?}",
            report.errors
        );
    }
    assert_eq!(report.errors.len(), expected.len());
    assert_eq!(report.warnings.len(), 2);
}

#[test]
fn empty_pipeline_is_rejected() {
    let recipe = Recipe::parse(
        "version: 1\ninput: {path: in.yuv, width: 4, height: 4}\npipeline: []\noutput: {path: out.yuv}\n",
    )
    .unwrap();
    let report = validate_recipe(&recipe, &StageRegistry::with_defaults());
    assert_eq!(report.errors, vec!["Pipeline must contain at least one stage".to_string()]);
}

#[test]
fn encode_without_check_pts_only_warns() {
    let recipe = Recipe::parse(
        "version: 1\ninput: {path: in.yuv, width: 4, height: 4}\npipeline:\n  - stage: decode\n  - stage: encode\noutput: {path: out.bin}\n",
    )
    .unwrap();
    let report = validate_recipe(&recipe, &StageRegistry::with_defaults());
    assert!(report.is_ok());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("check_pts"));
}

#[test]
fn missing_recipe_file_names_the_path() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("absent.yaml");
    let err = Recipe::load(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("absent.yaml"));
}

#[test]
fn malformed_yaml_is_a_parse_error() {
    let temp = tempdir().unwrap();
    let path = write_recipe(temp.path(), "version: 1\ninput: [not, a, map]\n");
    let err = Recipe::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse recipe YAML"));
}
