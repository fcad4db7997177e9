//! Firmware script metadata and per-node script state.

pub mod entity;

pub use entity::{ScriptEntity, ScriptEntityCollection};

use crate::error::{ensure_not_blank, TspError, TspResult};
use bitflags::bitflags;
use std::path::{Path, PathBuf};

/// Extension of the debug copy written next to a loaded source file.
pub const TRIMMED_EXTENSION: &str = "trimmed.tsp";

bitflags! {
    /// How a script file is deployed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeployFileFormat: u8 {
        /// File holds byte code rather than source.
        const BINARY = 0b0001;
        /// File is compressed for distribution.
        const COMPRESSED = 0b0010;
        /// File is encrypted for distribution.
        const ENCRYPTED = 0b0100;
    }
}

impl DeployFileFormat {
    /// Builds flags from lowercase names; unknown names are ignored.
    pub fn from_names(names: &[String]) -> Self {
        names
            .iter()
            .fold(Self::empty(), |flags, name| match name.trim().to_ascii_lowercase().as_str() {
                "binary" | "byte_code" => flags | Self::BINARY,
                "compressed" => flags | Self::COMPRESSED,
                "encrypted" => flags | Self::ENCRYPTED,
                _ => flags,
            })
    }
}

/// A named script and where its source lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareScript {
    /// Name of the script object on the instrument.
    pub name: String,
    /// Source file name.
    pub file_name: String,
    /// Folder holding the source file.
    pub folder_path: PathBuf,
    /// Resource the file was built from.
    pub resource_file_name: String,
    /// Runs at power up.
    pub is_boot_script: bool,
    /// Converted to byte code before saving.
    pub convert_to_byte_code: bool,
    /// Deploy format flags.
    pub deploy_file_format: DeployFileFormat,
    /// Source was exported from the instrument to `file_path()`.
    pub exported_to_file: bool,
    /// Namespace the script defines when run; empty if none.
    pub top_namespace: String,
}

impl FirmwareScript {
    /// Creates a plain source script.
    pub fn new(name: &str, file_name: &str, folder_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            file_name: file_name.to_string(),
            folder_path: folder_path.into(),
            resource_file_name: file_name.to_string(),
            is_boot_script: false,
            convert_to_byte_code: false,
            deploy_file_format: DeployFileFormat::empty(),
            exported_to_file: false,
            top_namespace: String::new(),
        }
    }

    /// Full path of the source file.
    pub fn file_path(&self) -> PathBuf {
        self.folder_path.join(&self.file_name)
    }

    /// Path of the trimmed debug copy, `<stem>.trimmed.tsp`.
    pub fn trimmed_file_path(&self) -> PathBuf {
        trimmed_path(&self.file_path())
    }

    /// True when the file holds byte code.
    pub fn is_binary(&self) -> bool {
        self.deploy_file_format.contains(DeployFileFormat::BINARY)
    }

    /// True when the script declares a namespace.
    pub fn has_top_namespace(&self) -> bool {
        !self.top_namespace.trim().is_empty()
    }

    /// Checks the fields every protocol needs.
    pub fn validate(&self) -> TspResult<()> {
        ensure_not_blank("name", &self.name)?;
        ensure_not_blank("file_name", &self.file_name)?;
        ensure_not_blank("resource_file_name", &self.resource_file_name)?;
        if self.folder_path.as_os_str().is_empty() {
            return Err(TspError::blank("folder_path"));
        }
        Ok(())
    }
}

/// `dir/name.tsp` becomes `dir/name.trimmed.tsp`.
pub fn trimmed_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}.{TRIMMED_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let script = FirmwareScript::new("foo", "foo.tsp", "/fw");
        assert_eq!(script.file_path(), PathBuf::from("/fw/foo.tsp"));
        assert_eq!(script.trimmed_file_path(), PathBuf::from("/fw/foo.trimmed.tsp"));
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        assert!(FirmwareScript::new("foo", "foo.tsp", "/fw").validate().is_ok());
        assert!(matches!(
            FirmwareScript::new(" ", "foo.tsp", "/fw").validate(),
            Err(TspError::InvalidArgument(_))
        ));
        assert!(FirmwareScript::new("foo", "foo.tsp", "").validate().is_err());
    }

    #[test]
    fn test_deploy_format_names() {
        let flags = DeployFileFormat::from_names(&["Binary".to_string(), "bogus".to_string()]);
        assert_eq!(flags, DeployFileFormat::BINARY);
        assert!(DeployFileFormat::from_names(&[]).is_empty());
    }
}
