//! Scratch-directory handling with path traversal protection.

use std::path::{Component, Path, PathBuf};

use tokio::fs;

use crate::{OcitarError, OcitarResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A directory all writes of one image pull are confined to.
///
/// Every name handed to [`Workspace::path`] is validated to stay under the
/// workspace root, so a hostile manifest cannot escape the scratch directory
/// through crafted layer identifiers.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Workspace {
    /// Creates the workspace directory (and its parents) if needed.
    pub async fn create(root: impl Into<PathBuf>) -> OcitarResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Returns the workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative name inside the workspace.
    pub fn path(&self, name: &str) -> OcitarResult<PathBuf> {
        let relative = Path::new(name);
        if relative.is_absolute() {
            return Err(OcitarError::PathValidation(format!(
                "absolute path not allowed: {}",
                name
            )));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(OcitarError::PathValidation(format!(
                        "path escapes the workspace: {}",
                        name
                    )));
                }
            }
        }

        Ok(self.root.join(relative))
    }

    /// Creates a child directory and returns it as a nested workspace.
    pub async fn subdir(&self, name: &str) -> OcitarResult<Workspace> {
        let path = self.path(name)?;
        fs::create_dir_all(&path).await?;
        Ok(Workspace { root: path })
    }

    /// Writes a file inside the workspace.
    pub async fn write(&self, name: &str, data: impl AsRef<[u8]>) -> OcitarResult<()> {
        let path = self.path(name)?;
        fs::write(path, data).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspace_write_and_subdir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::create(dir.path().join("scratch")).await?;

        ws.write("manifest.json", b"[]\n").await?;
        let layer = ws.subdir("abc123").await?;
        layer.write("VERSION", "1.0").await?;

        assert_eq!(
            tokio::fs::read_to_string(ws.root().join("manifest.json")).await?,
            "[]\n"
        );
        assert_eq!(
            tokio::fs::read_to_string(ws.root().join("abc123/VERSION")).await?,
            "1.0"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_workspace_rejects_escaping_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::create(dir.path().join("scratch")).await?;

        assert!(matches!(
            ws.path("../outside"),
            Err(OcitarError::PathValidation(_))
        ));
        assert!(matches!(
            ws.path("/etc/passwd"),
            Err(OcitarError::PathValidation(_))
        ));
        assert!(ws.path("layer/json").is_ok());

        Ok(())
    }
}
