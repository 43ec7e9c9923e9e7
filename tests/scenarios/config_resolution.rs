//! Test: Config resolution - loading, checksum lookup and validation

use ovfbuild::core::{BuildConfig, ConfigError};
use ovfbuild::execution::Builder;
use ovfbuild::steps::BuildStep;
use std::io::Write;
use url::Url;

fn invalid(err: ConfigError) -> Vec<String> {
    match err {
        ConfigError::Invalid(invalid) => invalid.errors,
        other => panic!("expected validation errors, got {}", other),
    }
}

/// A config is loaded from a YAML file on disk
#[tokio::test]
async fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "build_name: base\nsource_path: http://example.com/base.ova\nchecksum_type: none").unwrap();

    let config = BuildConfig::from_file(file.path()).unwrap();
    assert_eq!(config.build_name, "base");
    assert_eq!(config.checksum_type, "none");
}

/// A missing file is an I/O error, not a parse error
#[test]
fn test_missing_file() {
    let err = BuildConfig::from_file("/nonexistent/build.yaml").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

/// The checksum is looked up in a manifest next to the appliance
#[tokio::test]
async fn test_checksum_from_manifest() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("SHA256SUMS");
    std::fs::write(
        &manifest,
        "0000  other.ova\nSHA256 (the-OS.ova) = ABCDEF0123\n",
    )
    .unwrap();
    let manifest_url = Url::from_file_path(&manifest).unwrap();

    let yaml = format!(
        "source_path: http://example.com/images/the-OS.ova\nchecksum_type: SHA256\n\
         checksum_url: \"{}\"\ncommunicator: none\noutput_directory: \"{}\"\n",
        manifest_url,
        temp.path().join("output").display()
    );
    let (builder, _) = Builder::prepare(BuildConfig::from_yaml(&yaml).unwrap())
        .await
        .unwrap();

    assert_eq!(builder.config().checksum_type, "sha256");
    assert_eq!(builder.config().checksum, "abcdef0123");
    let download = builder
        .steps()
        .into_iter()
        .find_map(|step| match step {
            BuildStep::Download(download) => Some(download),
            _ => None,
        })
        .unwrap();
    assert_eq!(download.checksum.map(|c| c.value), Some("abcdef0123".to_string()));
}

/// A manifest without the appliance is a config error
#[tokio::test]
async fn test_checksum_missing_from_manifest() {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("SHA256SUMS");
    std::fs::write(&manifest, "0000  other.ova\n").unwrap();

    let yaml = format!(
        "source_path: http://example.com/the-OS.ova\nchecksum_type: sha256\nchecksum_url: \"{}\"\n\
         communicator: none\noutput_directory: \"{}\"\n",
        Url::from_file_path(&manifest).unwrap(),
        temp.path().join("output").display()
    );
    let mut config = BuildConfig::from_yaml(&yaml).unwrap();
    let errors = invalid(config.prepare().await.unwrap_err());

    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("checksum not found for file \"the-OS.ova\""));
}

/// Every problem is reported at once
#[tokio::test]
async fn test_errors_are_collected() {
    let mut config = BuildConfig::from_yaml(
        "format: vmdk\nvrdp_port_min: 6000\nvrdp_port_max: 5900\nguest_additions_mode: sometimes\n\
         output_directory: /nonexistent/output\nssh_username: vagrant\n",
    )
    .unwrap();

    let errors = invalid(config.prepare().await.unwrap_err());

    assert!(errors.contains(&"The source_path must be specified.".to_string()));
    assert!(errors.contains(&"The checksum_type must be specified.".to_string()));
    assert!(errors.contains(&"format must be one of: ovf, ova".to_string()));
    assert!(errors
        .iter()
        .any(|e| e.contains("guest_additions_mode is invalid")));
    assert!(errors.len() >= 5);
}

/// An existing output directory is only accepted with force
#[tokio::test]
async fn test_existing_output_needs_force() {
    let temp = tempfile::tempdir().unwrap();
    let yaml = format!(
        "source_path: http://example.com/the-OS.ova\nchecksum_type: none\ncommunicator: none\n\
         output_directory: \"{}\"\n",
        temp.path().display()
    );

    let mut config = BuildConfig::from_yaml(&yaml).unwrap();
    let errors = invalid(config.prepare().await.unwrap_err());
    assert!(errors[0].contains("already exists"));

    let mut forced = BuildConfig::from_yaml(&format!("{}force: true\n", yaml)).unwrap();
    let warnings = forced.prepare().await.unwrap();
    assert!(warnings.iter().any(|w| w.contains("checksum type of 'none'")));
}

/// Unknown keys are rejected when parsing
#[test]
fn test_unknown_key_rejected() {
    let err = BuildConfig::from_yaml("source_path: a.ova\nhttp_directory: www\n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
