//! The exported build result

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Ovf,
    Ova,
}

impl ExportFormat {
    /// File extension passed to `VBoxManage export`
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Ovf => "ovf",
            ExportFormat::Ova => "ova",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Files produced by a successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// The output directory
    pub dir: PathBuf,

    pub format: ExportFormat,

    /// Every regular file under `dir`, sorted
    pub files: Vec<PathBuf>,
}

impl Artifact {
    /// Collect the files currently in `dir`
    pub fn from_dir(dir: impl Into<PathBuf>, format: ExportFormat) -> std::io::Result<Self> {
        let dir = dir.into();
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();

        Ok(Self { dir, format, files })
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VM files in directory: {}", self.dir.display())
    }
}
