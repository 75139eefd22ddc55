use std::path::{Path, PathBuf};

use base64::Engine as _;

use crate::error::KernelError;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    /// 1-based, restarts with every request.
    pub sequence_index: usize,
    pub local_path: PathBuf,
    /// What the rendered result links to: the local path or a static URL.
    pub reference: String,
}

impl ImageArtifact {
    pub fn render(&self) -> String {
        format!("![fig-{:03}]({})", self.sequence_index, self.reference)
    }
}

/// Persists figures for one request and numbers them in creation order.
pub struct ArtifactStore<'a> {
    workspace: &'a Path,
    static_url: Option<&'a str>,
    next_index: usize,
}

impl<'a> ArtifactStore<'a> {
    pub fn new(workspace: &'a Path, static_url: Option<&'a str>) -> Self {
        Self {
            workspace,
            static_url,
            next_index: 1,
        }
    }

    pub async fn extract(&mut self, image_base64: &str) -> Result<ImageArtifact, KernelError> {
        let bytes = decode_png(image_base64)?;
        let file_name = format!("{}.png", uuid::Uuid::new_v4());
        let local_path = self.workspace.join(&file_name);
        tokio::fs::write(&local_path, &bytes).await?;

        let reference = match self.static_url {
            Some(url) => format!("{url}/{file_name}"),
            None => local_path.to_string_lossy().to_string(),
        };
        let artifact = ImageArtifact {
            sequence_index: self.next_index,
            local_path,
            reference,
        };
        self.next_index += 1;
        Ok(artifact)
    }
}

/// Kernels may wrap base64 payloads across lines, so whitespace is dropped before decoding.
fn decode_png(image_base64: &str) -> Result<Vec<u8>, KernelError> {
    let compact: String = image_base64
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| KernelError::Artifact(format!("invalid base64 image payload: {err}")))?;
    if !bytes.starts_with(PNG_SIGNATURE) {
        return Err(KernelError::Artifact(
            "image payload is not a PNG".to_string(),
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A 1x1 transparent PNG.
    pub(crate) const TINY_PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

    #[tokio::test]
    async fn numbers_artifacts_from_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = ArtifactStore::new(temp.path(), None);

        let first = store.extract(TINY_PNG_BASE64).await.expect("first image");
        let second = store.extract(TINY_PNG_BASE64).await.expect("second image");

        assert_eq!(first.sequence_index, 1);
        assert_eq!(second.sequence_index, 2);
        assert_ne!(first.local_path, second.local_path);
        let written = std::fs::read(&first.local_path).expect("read png");
        assert!(written.starts_with(PNG_SIGNATURE));
        assert_eq!(
            first.render(),
            format!("![fig-001]({})", first.local_path.display())
        );
    }

    #[tokio::test]
    async fn static_url_replaces_local_path_in_reference() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = ArtifactStore::new(temp.path(), Some("http://figures.local/static"));

        let artifact = store.extract(TINY_PNG_BASE64).await.expect("image");
        let file_name = artifact
            .local_path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("file name");
        assert_eq!(
            artifact.reference,
            format!("http://figures.local/static/{file_name}")
        );
        assert!(artifact.local_path.exists());
    }

    #[tokio::test]
    async fn tolerates_wrapped_base64() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = ArtifactStore::new(temp.path(), None);
        let (head, tail) = TINY_PNG_BASE64.split_at(40);
        let wrapped = format!("{head}\n{tail}\n");

        let artifact = store.extract(&wrapped).await.expect("image");
        assert_eq!(artifact.sequence_index, 1);
    }

    #[tokio::test]
    async fn rejects_non_png_payloads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = ArtifactStore::new(temp.path(), None);

        let not_png = base64::engine::general_purpose::STANDARD.encode(b"GIF89a....");
        assert!(matches!(
            store.extract(&not_png).await,
            Err(KernelError::Artifact(_))
        ));
        assert!(matches!(
            store.extract("%%%").await,
            Err(KernelError::Artifact(_))
        ));
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 0);
    }
}
