//! Demonstration tools for the `agent` command: read-only access to a workspace directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use codepilot::tools::{Tool, ToolError, ToolRegistry};
use serde_json::{json, Value};

/// Largest file handed back to the model, in bytes.
const MAX_READ_BYTES: u64 = 64 * 1024;

/// Registry with `read_file` and `list_directory`, both confined to `root`.
pub fn workspace_tools(root: PathBuf) -> Result<ToolRegistry, ToolError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFile { root: root.clone() }))?;
    registry.register(Arc::new(ListDirectory { root }))?;
    Ok(registry)
}

/// Resolve a model-supplied relative path under `root`. Absolute paths and `..` are refused.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let rel = Path::new(relative.trim());
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ToolError::InvalidArguments(format!(
                    "path must stay inside the workspace: {}",
                    relative
                )))
            }
        }
    }
    Ok(out)
}

fn path_arg(args: &Value) -> &str {
    args.get("path").and_then(Value::as_str).unwrap_or(".")
}

struct ReadFile {
    root: PathBuf,
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> Option<&str> {
        Some("Read a UTF-8 text file from the workspace.")
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" }
            },
            "required": ["path"]
        }))
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let path = resolve(&self.root, path_arg(&args))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {}", path.display(), e)))?;
        if !meta.is_file() {
            return Err(ToolError::Failed(format!("{} is not a file", path.display())));
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(ToolError::Failed(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                meta.len(),
                MAX_READ_BYTES
            )));
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {}", path.display(), e)))?;
        Ok(json!({ "path": path_arg(&args), "content": text }).to_string())
    }
}

struct ListDirectory {
    root: PathBuf,
}

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> Option<&str> {
        Some("List entries of a workspace directory. Directories end with '/'.")
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the workspace root (default '.')" }
            }
        }))
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        let dir = resolve(&self.root, path_arg(&args))?;
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {}", dir.display(), e)))?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(json!({ "path": path_arg(&args), "entries": entries }).to_string())
    }
}
