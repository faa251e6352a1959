//! Image importer
//!
//! Stages an assembled archive in a temporary file and hands it to the
//! engine. The staging file is removed on every path, success or failure.

use crate::deploy::DeployStage;
use crate::engine::{with_deadline, EngineError, SharedEngine};
use crate::error::DeployError;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ImageImporter {
    engine: SharedEngine,
    staging_dir: PathBuf,
    call_timeout: Duration,
}

impl ImageImporter {
    pub fn new(engine: SharedEngine, staging_dir: PathBuf, call_timeout: Duration) -> Self {
        Self {
            engine,
            staging_dir,
            call_timeout,
        }
    }

    /// Import an image archive and return the engine's image ID
    pub async fn import(&self, archive: Vec<u8>) -> Result<String, DeployError> {
        let size = archive.len();
        let staging_dir = self.staging_dir.clone();

        let staged = tokio::task::spawn_blocking(move || -> std::io::Result<tempfile::NamedTempFile> {
            std::fs::create_dir_all(&staging_dir)?;
            let mut file = tempfile::Builder::new()
                .prefix("deploygate-image-")
                .suffix(".tar")
                .tempfile_in(&staging_dir)?;
            file.write_all(&archive)?;
            file.flush()?;
            Ok(file)
        })
        .await
        .map_err(|e| DeployError::Internal(format!("staging task failed: {}", e)))?
        .map_err(|e| {
            DeployError::engine(
                DeployStage::Import,
                EngineError::Api(format!("cannot stage image archive: {}", e)),
            )
        })?;

        debug!(path = %staged.path().display(), size, "Staged image archive");

        let result = with_deadline(
            "image import",
            self.call_timeout,
            self.engine.import_image(staged.path()),
        )
        .await;

        let path = staged.path().to_path_buf();
        if let Err(e) = staged.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove staged image archive");
        }

        let image_id = result.map_err(|e| DeployError::engine(DeployStage::Import, e))?;
        if image_id.trim().is_empty() {
            return Err(DeployError::engine(
                DeployStage::Import,
                EngineError::InvalidResponse("engine returned an empty image ID".to_string()),
            ));
        }

        info!(image_id = %image_id, size, "Image imported");
        Ok(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContainerInfo, ContainerParams, Engine};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;

    /// Records the staged file it was given and answers with a fixed result
    struct ImportOnly {
        answer: Result<String, EngineError>,
        seen: Mutex<Option<(PathBuf, Vec<u8>)>>,
    }

    #[async_trait]
    impl Engine for ImportOnly {
        async fn import_image(&self, archive: &Path) -> Result<String, EngineError> {
            let contents = std::fs::read(archive).unwrap();
            *self.seen.lock() = Some((archive.to_path_buf(), contents));
            self.answer.clone()
        }
        async fn create_container(&self, _: &ContainerParams) -> Result<String, EngineError> {
            unimplemented!()
        }
        async fn start_container(&self, _: &str) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn stop_container(&self, _: &str) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn remove_container(&self, _: &str) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn container_info(&self, _: &str) -> Result<ContainerInfo, EngineError> {
            unimplemented!()
        }
        async fn container_logs(&self, _: &str, _: usize) -> Result<String, EngineError> {
            unimplemented!()
        }
        async fn find_container(&self, _: &str) -> Result<Option<ContainerInfo>, EngineError> {
            unimplemented!()
        }
        async fn network_ip(&self, _: &str, _: &str) -> Result<String, EngineError> {
            unimplemented!()
        }
    }

    fn importer(answer: Result<String, EngineError>, dir: &Path) -> (ImageImporter, Arc<ImportOnly>) {
        let engine = Arc::new(ImportOnly {
            answer,
            seen: Mutex::new(None),
        });
        let importer = ImageImporter::new(engine.clone(), dir.to_path_buf(), Duration::from_secs(5));
        (importer, engine)
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_import_passes_archive_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (importer, engine) = importer(Ok("sha256:abc".to_string()), dir.path());

        let id = importer.import(b"tar bytes".to_vec()).await.unwrap();
        assert_eq!(id, "sha256:abc");

        let (path, contents) = engine.seen.lock().clone().unwrap();
        assert_eq!(contents, b"tar bytes");
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("deploygate-image-"));
        assert!(!path.exists());
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_import_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (importer, _) = importer(Err(EngineError::Api("bad archive".to_string())), dir.path());

        let err = importer.import(b"junk".to_vec()).await.unwrap_err();
        match err {
            DeployError::Engine { stage, source } => {
                assert_eq!(stage, DeployStage::Import);
                assert!(source.to_string().contains("bad archive"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_empty_image_id_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (importer, _) = importer(Ok("  ".to_string()), dir.path());

        let err = importer.import(b"tar".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Engine {
                source: EngineError::InvalidResponse(_),
                ..
            }
        ));
        assert!(dir_is_empty(dir.path()));
    }
}
