use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::ToolImplementation;
use llmserve_common::{Parameters, Property, Tool};

/// Reads a whole file, confined to a root directory.
///
/// Relative paths resolve against the root. Non-UTF-8 bytes are replaced, so
/// binary files still produce output.
#[derive(Debug, Clone)]
pub struct CatFileTool {
    root_directory: PathBuf,
}

impl Default for CatFileTool {
    fn default() -> Self {
        Self::new()
    }
}

impl CatFileTool {
    /// Confines reads to the current working directory.
    #[must_use]
    pub fn new() -> Self {
        Self::within(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn within(root_directory: impl Into<PathBuf>) -> Self {
        let root_directory = root_directory.into();
        Self {
            root_directory: root_directory.canonicalize().unwrap_or(root_directory),
        }
    }

    async fn resolve(&self, file_path: &Path) -> Result<PathBuf> {
        let resolved = if file_path.is_absolute() {
            file_path.to_path_buf()
        } else {
            self.root_directory.join(file_path)
        };

        let canonical = tokio::fs::canonicalize(&resolved)
            .await
            .with_context(|| format!("cannot resolve {}", resolved.display()))?;

        if !canonical.starts_with(&self.root_directory) {
            bail!(
                "path must be within {}: {}",
                self.root_directory.display(),
                canonical.display()
            );
        }
        Ok(canonical)
    }

    async fn read(&self, file_path: &str) -> Result<String> {
        let path = self.resolve(Path::new(file_path)).await?;
        if !tokio::fs::metadata(&path).await?.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl ToolImplementation for CatFileTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "cat_file",
            "Read and display the contents of a file using the cat shell command",
            Parameters::from_fields([(
                "file_path",
                Property::string("Path to the file to read"),
                true,
            )]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let file_path = args
            .get("file_path")
            .and_then(Value::as_str)
            .context("Missing 'file_path' parameter")?;

        let content = self
            .read(file_path)
            .await
            .with_context(|| format!("Error reading file {file_path}"))?;
        Ok(json!(content))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_text_file() {
        let temp_dir = TempDir::new().unwrap();
        let test_file = temp_dir.path().join("test.txt");
        fs::write(&test_file, "Hello, this is a test file!\nIt has multiple lines.").unwrap();

        let tool = CatFileTool::within(temp_dir.path());
        let result = tool
            .execute(&json!({"file_path": test_file.to_str().unwrap()}))
            .await
            .unwrap();
        assert_eq!(result, json!("Hello, this is a test file!\nIt has multiple lines."));
    }

    #[tokio::test]
    async fn test_read_relative_and_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("empty.txt"), "").unwrap();

        let tool = CatFileTool::within(temp_dir.path());
        let result = tool.execute(&json!({"file_path": "empty.txt"})).await.unwrap();
        assert_eq!(result, json!(""));
    }

    #[tokio::test]
    async fn test_read_binary_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("blob.bin"), [0u8, 1, 2, 0xff]).unwrap();

        let tool = CatFileTool::within(temp_dir.path());
        let result = tool.execute(&json!({"file_path": "blob.bin"})).await.unwrap();
        assert!(!result.as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_missing_directory_and_outside_paths() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        let tool = CatFileTool::within(temp_dir.path());

        for path in ["does/not/exist.txt", "sub", "/etc/hostname", "../"] {
            let err = tool.execute(&json!({"file_path": path})).await.unwrap_err();
            assert!(
                err.to_string().starts_with("Error reading file"),
                "{path}: {err:#}"
            );
        }
    }
}
