//! Source appliance download

use crate::core::state::{keys, StateBag};
use crate::core::step::StepAction;
use crate::download::{cache_path, downloadable_url, fetch, ExpectedChecksum};
use crate::steps::{cancel_signal, cancelled, ui};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Makes the source appliance available locally and verifies it
#[derive(Debug, Clone)]
pub struct Download {
    /// Source URL or path
    pub url: String,

    /// `None` when the checksum type is `none`
    pub checksum: Option<ExpectedChecksum>,

    /// Download location for remote sources; the cache is used otherwise
    pub target_path: Option<PathBuf>,
}

impl Download {
    pub async fn run(&self, state: &mut StateBag) -> Result<StepAction> {
        let ui = ui(state);
        let url = downloadable_url(&self.url)
            .with_context(|| format!("Invalid source_path {}", self.url))?;

        ui.say(&format!("Retrieving source appliance {}", url));
        if self.checksum.is_none() {
            warn!("Source {} will not be verified", url);
        }

        let extension = Path::new(url.path())
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("ova")
            .to_string();
        let target = self
            .target_path
            .clone()
            .unwrap_or_else(|| cache_path(&url, &extension));

        let progress = ui.progress(0);
        let signal = cancel_signal(state);
        let path = tokio::select! {
            result = fetch(&url, &target, self.checksum.as_ref(), &progress) => {
                result.with_context(|| format!("Failed to retrieve {}", url))?
            }
            _ = cancelled(&signal) => {
                progress.abandon();
                ui.message("Download interrupted");
                return Ok(StepAction::Halt);
            }
        };

        info!("Source appliance available at {}", path.display());
        state.put::<keys::VmPath>(path);
        Ok(StepAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::HashType;
    use crate::core::state::CancelSignal;

    #[tokio::test]
    async fn test_local_source_verified_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("the-OS.ova");
        std::fs::write(&source, b"abc").unwrap();

        let step = Download {
            url: source.display().to_string(),
            checksum: Some(ExpectedChecksum::new(
                HashType::Sha256,
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            )),
            target_path: None,
        };
        let mut state = StateBag::new();

        assert_eq!(step.run(&mut state).await.unwrap(), StepAction::Continue);
        assert_eq!(state.get::<keys::VmPath>(), Some(&source));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("the-OS.ova");
        std::fs::write(&source, b"abc").unwrap();

        let step = Download {
            url: source.display().to_string(),
            checksum: Some(ExpectedChecksum::new(HashType::Md5, "00")),
            target_path: None,
        };
        let mut state = StateBag::new();

        let err = step.run(&mut state).await.unwrap_err();
        assert!(format!("{:#}", err).contains("checksum mismatch"));
        assert!(!state.contains::<keys::VmPath>());
    }

    #[tokio::test]
    async fn test_cancelled_download_halts() {
        let step = Download {
            url: "http://127.0.0.1:9/the-OS.ova".to_string(),
            checksum: None,
            target_path: Some(PathBuf::from("unused.ova")),
        };
        let signal = CancelSignal::new();
        signal.cancel();
        let mut state = StateBag::new();
        state.put::<keys::CancelSignal>(signal);

        // Either branch may win; a refused connection is also acceptable
        match step.run(&mut state).await {
            Ok(action) => assert_eq!(action, StepAction::Halt),
            Err(e) => assert!(format!("{:#}", e).contains("Failed to retrieve")),
        }
    }
}
