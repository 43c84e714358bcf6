//! 本地文件工作区
//!
//! 所有文件都落在 root 之下；FileId 是相对 root 的路径，含 `..` 或绝对路径的 ID 一律拒绝。
//! 脚本放在 scripts/<scope>/，上传的文件放在 uploads/<scope>/；scope 由调用方按次运行分配，
//! cleanup 只删除该 scope 的目录。

use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Workspace};

/// 工作区内文件的不透明标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 以本地目录为根的工作区
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    /// 创建工作区（目录不存在时自动创建）
    pub fn new(root: impl AsRef<Path>) -> Result<Self, BackendError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize().unwrap_or(root);
        Ok(Self { root })
    }

    fn validate_id(&self, id: &FileId) -> Result<PathBuf, BackendError> {
        let path = Path::new(id.as_str());
        if id.as_str().is_empty() {
            return Err(BackendError::PathEscape("empty file id".to_string()));
        }
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(BackendError::PathEscape(format!(
                "'{}' is outside workspace root",
                id
            )));
        }
        Ok(self.root.join(path))
    }

    async fn ensure_parent_dir(path: &Path) -> Result<(), BackendError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn persist_script(
        &self,
        scope: &str,
        name: &str,
        content: &str,
    ) -> Result<FileId, BackendError> {
        let id = FileId::new(format!("scripts/{}/{}", scope, name));
        self.write(&id, content).await?;
        tracing::debug!(file = %id, bytes = content.len(), "script persisted");
        Ok(id)
    }

    async fn upload(&self, scope: &str, local: &Path) -> Result<FileId, BackendError> {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BackendError::Io(format!("invalid upload path: {}", local.display())))?;
        let id = FileId::new(format!("uploads/{}/{}", scope, name));
        let target = self.validate_id(&id)?;
        Self::ensure_parent_dir(&target).await?;
        tokio::fs::copy(local, &target).await?;
        tracing::debug!(file = %id, "file uploaded");
        Ok(id)
    }

    async fn download(&self, id: &FileId, dest: &Path) -> Result<PathBuf, BackendError> {
        let source = self.validate_id(id)?;
        Self::ensure_parent_dir(dest).await?;
        tokio::fs::copy(&source, dest).await?;
        Ok(dest.to_path_buf())
    }

    async fn read(&self, id: &FileId) -> Result<String, BackendError> {
        let path = self.validate_id(id)?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write(&self, id: &FileId, content: &str) -> Result<(), BackendError> {
        let path = self.validate_id(id)?;
        Self::ensure_parent_dir(&path).await?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    fn resolve(&self, id: &FileId) -> Result<PathBuf, BackendError> {
        self.validate_id(id)
    }

    fn root(&self) -> &Path {
        &self.root
    }

    async fn cleanup(&self, scope: &str) -> Result<(), BackendError> {
        for dir in ["scripts", "uploads"] {
            let path = self.validate_id(&FileId::new(format!("{}/{}", dir, scope)))?;
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&path).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path()).unwrap();
        let id = FileId::new("out/result.txt");
        ws.write(&id, "42").await.unwrap();
        assert_eq!(ws.read(&id).await.unwrap(), "42");
    }

    #[tokio::test]
    async fn test_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path()).unwrap();
        for bad in ["../secret", "/etc/passwd", "a/../../b", ""] {
            let err = ws.read(&FileId::new(bad)).await.unwrap_err();
            assert!(matches!(err, BackendError::PathEscape(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_upload_download_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path().join("ws")).unwrap();

        let local = dir.path().join("input.csv");
        std::fs::write(&local, "a,b\n1,2\n").unwrap();
        let id = ws.upload("run1", &local).await.unwrap();
        assert_eq!(id.as_str(), "uploads/run1/input.csv");

        let script = ws.persist_script("run1", "step_1.py", "print(1)").await.unwrap();
        assert_eq!(script.as_str(), "scripts/run1/step_1.py");
        assert!(ws.resolve(&script).unwrap().exists());

        let dest = dir.path().join("back").join("input.csv");
        ws.download(&id, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "a,b\n1,2\n");

        ws.cleanup("run1").await.unwrap();
        assert!(!ws.root().join("uploads/run1").exists());
        assert!(!ws.root().join("scripts/run1").exists());
    }

    #[tokio::test]
    async fn test_cleanup_leaves_other_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(dir.path()).unwrap();
        let kept = ws.persist_script("a", "step_1.sh", "echo a").await.unwrap();
        ws.persist_script("b", "step_1.sh", "echo b").await.unwrap();

        ws.cleanup("b").await.unwrap();
        assert_eq!(ws.read(&kept).await.unwrap(), "echo a");
        assert!(!ws.root().join("scripts/b").exists());

        ws.cleanup("never-used").await.unwrap();
        assert!(matches!(
            ws.cleanup("..").await.unwrap_err(),
            BackendError::PathEscape(_)
        ));
    }
}
