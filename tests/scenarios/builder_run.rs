//! Test: Builder runs - a full build against a mock VirtualBox

use crate::helpers::*;
use ovfbuild::core::{BuildConfig, ExportFormat, MemoryUi, Ui};
use ovfbuild::driver::Driver;
use ovfbuild::execution::{BuildError, Builder};
use std::path::Path;
use std::sync::Arc;

/// sha256 of "abc"
const ABC_SHA256: &str = "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD";

/// A prepared builder for a local appliance written into `dir`
async fn local_build(dir: &Path, extra: &str) -> Builder {
    let source = dir.join("the-OS.ova");
    std::fs::write(&source, b"abc").unwrap();

    let yaml = format!(
        r#"
build_name: local
source_path: "{}"
checksum_type: sha256
checksum: "{}"
communicator: none
guest_additions_mode: disable
output_directory: "{}"
boot_wait_secs: 0
vm_name: packer-test
{}
"#,
        source.display(),
        ABC_SHA256,
        dir.join("output").display(),
        extra
    );

    let config = BuildConfig::from_yaml(&yaml).unwrap();
    let (builder, warnings) = Builder::prepare(config).await.unwrap();
    assert!(warnings.iter().any(|w| w.contains("shutdown_command")));
    builder
}

fn handles(driver: &Arc<MockDriver>) -> (Arc<dyn Driver>, Arc<MemoryUi>) {
    (driver.clone() as Arc<dyn Driver>, Arc::new(MemoryUi::new()))
}

/// A build with no communicator imports, boots, stops and exports the VM
#[tokio::test]
async fn test_full_build_produces_artifact() {
    let temp = tempfile::tempdir().unwrap();
    let builder = local_build(temp.path(), "").await;
    let mock = Arc::new(MockDriver::default());
    let (driver, ui) = handles(&mock);

    let artifact = builder
        .run_with_driver(driver, ui.clone() as Arc<dyn Ui>)
        .await
        .unwrap();

    let output = temp.path().join("output");
    assert_eq!(artifact.dir, output);
    assert_eq!(artifact.format, ExportFormat::Ovf);
    assert_eq!(artifact.files, vec![output.join("packer-test.ovf")]);

    let commands = mock.commands();
    let position = |name: &str| commands.iter().position(|c| c == name).unwrap();
    assert!(position("import") < position("startvm"));
    assert!(position("startvm") < position("export"));
    // The VM is unregistered once it has been exported
    assert_eq!(commands.last().map(String::as_str), Some("unregistervm"));

    let import = &mock.calls()[position("import")];
    assert_eq!(import[1], temp.path().join("the-OS.ova").display().to_string());
    assert!(import.contains(&"packer-test".to_string()));
    assert!(ui.lines().iter().all(|line| !line.starts_with("error:")));
}

/// The format picks the exported file's extension
#[tokio::test]
async fn test_ova_export() {
    let temp = tempfile::tempdir().unwrap();
    let builder = local_build(temp.path(), "format: ova").await;
    let mock = Arc::new(MockDriver::default());
    let (driver, ui) = handles(&mock);

    let artifact = builder.run_with_driver(driver, ui).await.unwrap();

    assert_eq!(artifact.format, ExportFormat::Ova);
    assert_eq!(artifact.files, vec![temp.path().join("output").join("packer-test.ova")]);
}

/// Extra VBoxManage commands are rendered with the VM name
#[tokio::test]
async fn test_vboxmanage_commands_rendered() {
    let temp = tempfile::tempdir().unwrap();
    let builder = local_build(
        temp.path(),
        r#"vboxmanage:
  - ["modifyvm", "{{ name }}", "--memory", "1024"]
vboxmanage_post:
  - ["modifyvm", "{{name}}", "--cpus", "2"]"#,
    )
    .await;
    let mock = Arc::new(MockDriver::default());
    let (driver, ui) = handles(&mock);

    builder.run_with_driver(driver, ui).await.unwrap();

    let calls = mock.calls();
    assert!(calls.contains(&vec![
        "modifyvm".to_string(),
        "packer-test".to_string(),
        "--memory".to_string(),
        "1024".to_string()
    ]));
    assert!(calls.contains(&vec![
        "modifyvm".to_string(),
        "packer-test".to_string(),
        "--cpus".to_string(),
        "2".to_string()
    ]));
}

/// A failing step is reported and the output directory is removed
#[tokio::test]
async fn test_failed_import_cleans_output() {
    let temp = tempfile::tempdir().unwrap();
    let builder = local_build(temp.path(), "").await;
    let mock = Arc::new(MockDriver::failing_on("import"));
    let (driver, ui) = handles(&mock);

    let err = builder
        .run_with_driver(driver, ui.clone() as Arc<dyn Ui>)
        .await
        .unwrap_err();

    match err {
        BuildError::Step(step) => assert_eq!(step.step, "import"),
        other => panic!("expected a step error, got {:?}", other),
    }
    assert!(!temp.path().join("output").exists());
    assert!(!mock.commands().contains(&"startvm".to_string()));
    assert!(ui.lines().iter().any(|line| line.starts_with("error:")));
}

/// A wrong checksum stops the build before anything is imported
#[tokio::test]
async fn test_checksum_mismatch() {
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("the-OS.ova");
    std::fs::write(&source, b"not abc").unwrap();

    let yaml = format!(
        "source_path: \"{}\"\nchecksum_type: sha256\nchecksum: \"{}\"\ncommunicator: none\n\
         guest_additions_mode: disable\noutput_directory: \"{}\"\nboot_wait_secs: 0\n",
        source.display(),
        ABC_SHA256,
        temp.path().join("output").display()
    );
    let (builder, _) = Builder::prepare(BuildConfig::from_yaml(&yaml).unwrap())
        .await
        .unwrap();
    let mock = Arc::new(MockDriver::default());
    let (driver, ui) = handles(&mock);

    let err = builder.run_with_driver(driver, ui).await.unwrap_err();

    assert!(matches!(err, BuildError::Step(ref step) if step.step == "download"));
    assert!(!mock.commands().contains(&"import".to_string()));
}

/// A build cancelled up front never touches VirtualBox
#[tokio::test]
async fn test_cancelled_build() {
    let temp = tempfile::tempdir().unwrap();
    let builder = local_build(temp.path(), "").await;
    builder.cancel();
    let mock = Arc::new(MockDriver::default());
    let (driver, ui) = handles(&mock);

    let err = builder.run_with_driver(driver, ui).await.unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert!(mock.calls().is_empty());
    assert!(!temp.path().join("output").exists());
}
