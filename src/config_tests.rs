use super::*;

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, contents.as_bytes()).expect("write file");
}

#[test]
fn default_config_validates_for_every_profile() {
    for profile in PROFILE_NAMES {
        let config = default_config(profile).expect("default config");
        validate_config(&config).expect("default config is valid");
        assert_eq!(config.naming_profile.as_deref(), Some(profile));
    }
    assert!(default_config("nope").is_err());
}

#[test]
fn written_default_round_trips_through_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("cordprep.json");
    write_config(&path, &default_config("manual_labels").expect("default")).expect("write");

    let config = load_config(&path).expect("load stub");
    assert_eq!(
        config.naming().expect("naming").derivatives_root,
        PathBuf::from("derivatives/manual_labels")
    );
    assert_eq!(config.steps.len(), 8);
}

#[test]
fn explicit_naming_section_overrides_profile() {
    let text = r#"{
        "schema_version": 1,
        "naming_profile": "manual_labels",
        "naming": {
            "derivatives_root": "derivatives/curated",
            "strip": ["_RPI_r"],
            "segmentation": {"override_suffix": "seg-manual", "local_suffix": "seg"},
            "disc_labels": {"override_suffix": "labels-manual", "local_suffix": "labels"}
        },
        "producers": {
            "segmentation": {"commands": ["sct_deepseg_sc -i {image} -c {contrast}"]},
            "disc_labels": {"commands": [["sct_label_vertebrae", "-i", "{image}"]]}
        }
    }"#;
    let config: PipelineConfig = serde_json::from_str(text).expect("parse config");
    validate_config(&config).expect("valid config");
    let naming = config.naming().expect("naming");
    assert_eq!(naming.derivatives_root, PathBuf::from("derivatives/curated"));
    assert_eq!(naming.extension, "nii.gz");
    assert_eq!(naming.disc_labels.override_suffix, "labels-manual");
    assert!(config.steps.is_empty());
}

#[test]
fn rejects_unknown_schema_profile_and_placeholders() {
    let mut config = default_config("labels").expect("default");
    config.schema_version = 2;
    assert!(validate_config(&config).is_err());

    let mut config = default_config("labels").expect("default");
    config.naming_profile = Some("derivatives/other".to_string());
    assert!(validate_config(&config).is_err());

    let mut config = default_config("labels").expect("default");
    config.steps.push(PipelineStep::Run {
        name: "bad".to_string(),
        command: CommandTemplate::Line("sct_image -i {image}".to_string()),
        outputs: Vec::new(),
    });
    let err = validate_config(&config).expect_err("unknown step placeholder");
    assert!(format!("{err:#}").contains("run:bad"), "{err:#}");
}

#[test]
fn rejects_escaping_destination_paths() {
    let mut config = default_config("labels").expect("default");
    config.steps.insert(
        0,
        PipelineStep::CopyInput {
            source: "{subject}/anat/{subject}_T1w.{ext}".to_string(),
            dest: "../{subject}_T1w.{ext}".to_string(),
        },
    );
    assert!(validate_config(&config).is_err());

    let mut config = default_config("labels").expect("default");
    config.expected_outputs.push("/abs/file.nii.gz".to_string());
    assert!(validate_config(&config).is_err());
}

#[test]
fn resolve_step_defaults_contrast_to_t2() {
    let step: PipelineStep = serde_json::from_str(
        r#"{"kind": "resolve", "artifact": "disc_labels", "image": "{subject}_T2w"}"#,
    )
    .expect("parse step");
    assert_eq!(
        step,
        PipelineStep::Resolve {
            artifact: ArtifactKind::DiscLabels,
            image: "{subject}_T2w".to_string(),
            contrast: "t2".to_string(),
        }
    );
    assert_eq!(step.label(), "resolve:disc_labels");
}

#[test]
fn locate_config_requires_explicit_path_to_exist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing.json");
    assert!(locate_config(Some(&missing)).is_err());

    let present = dir.path().join("present.json");
    write_file(&present, "{}");
    assert_eq!(
        locate_config(Some(&present)).expect("locate"),
        Some(present.clone())
    );
}

#[test]
fn programs_are_deduplicated() {
    let config = default_config("labels").expect("default");
    let programs = config.programs().expect("programs");
    assert!(programs.contains(&"sct_deepseg_sc".to_string()));
    assert!(programs.contains(&"sct_register_to_template".to_string()));
    let mut sorted = programs.clone();
    sorted.dedup();
    assert_eq!(sorted, programs);
}
