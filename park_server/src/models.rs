//! YOLO model files: catalog, lookup and download.
use std::{
    ffi::OsString,
    fs::{self, File},
    io::{Cursor, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use reqwest::Client;

use crate::config::YoloConfig;

pub struct ModelInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub recommended_for: &'static str,
}

pub const AVAILABLE_MODELS: [ModelInfo; 5] = [
    ModelInfo {
        name: "yolov8n.onnx",
        description: "YOLOv8 Nano, fastest and least accurate",
        recommended_for: "edge devices and real-time processing",
    },
    ModelInfo {
        name: "yolov8s.onnx",
        description: "YOLOv8 Small, balanced speed and accuracy",
        recommended_for: "general use",
    },
    ModelInfo {
        name: "yolov8m.onnx",
        description: "YOLOv8 Medium, more accurate",
        recommended_for: "servers with spare CPU",
    },
    ModelInfo {
        name: "yolov8l.onnx",
        description: "YOLOv8 Large, high accuracy",
        recommended_for: "offline analysis",
    },
    ModelInfo {
        name: "yolov8x.onnx",
        description: "YOLOv8 Extra Large, highest accuracy and slowest",
        recommended_for: "offline analysis where accuracy matters most",
    },
];

pub fn model_info(name: &str) -> Option<&'static ModelInfo> {
    AVAILABLE_MODELS.iter().find(|info| info.name == name)
}

/// Find a model file, first inside `models_dir`, then as given.
pub fn resolve_model_path(models_dir: impl AsRef<Path>, model: &str) -> Option<PathBuf> {
    let in_models_dir = models_dir.as_ref().join(model);
    if in_models_dir.is_file() {
        return Some(in_models_dir);
    }

    let as_given = PathBuf::from(model);
    if as_given.is_file() {
        return Some(as_given);
    }

    None
}

fn partial_path(filepath: &Path) -> PathBuf {
    let mut name = filepath
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".part");
    filepath.with_file_name(name)
}

fn write_file(filepath: &Path, content: &[u8]) -> Result<()> {
    let mut file = File::create(filepath)?;
    std::io::copy(&mut Cursor::new(content), &mut file)?;
    file.flush()?;
    Ok(())
}

/// Download a file from a URL to a given filepath.
///
/// The content lands in a `.part` file first and only replaces `filepath` once it is complete, so
/// an interrupted transfer never leaves a truncated file behind.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<Path>,
) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client.get(url).send().await?.error_for_status()?;
    let content = resp.bytes().await?;

    if let Some(parent) = filepath.parent() {
        fs::create_dir_all(parent)?;
    }

    let partial = partial_path(filepath);
    let written = write_file(&partial, &content)
        .and_then(|()| fs::rename(&partial, filepath).map_err(Into::into));
    if written.is_err() {
        fs::remove_file(&partial).ok();
    }

    written
}

/// Download `model` from `base_url` into `models_dir`.
///
/// An existing file is kept unless `force` is set.
pub async fn download_model(
    base_url: &str,
    model: &str,
    models_dir: impl AsRef<Path>,
    force: bool,
) -> Result<PathBuf> {
    let target = models_dir.as_ref().join(model);
    if target.is_file() && !force {
        log::info!("Model {} already present", target.display());
        return Ok(target);
    }

    let url = format!("{}/{}", base_url.trim_end_matches('/'), model);
    log::info!("Downloading {url} to {}", target.display());

    let client = Client::new();
    download_file(&client, &url, &target)
        .await
        .with_context(|| format!("failed to download model from {url}"))?;

    Ok(target)
}

/// Resolve the configured model, downloading it if it is missing and a URL is configured.
pub async fn ensure_model(params: &YoloConfig) -> Result<PathBuf> {
    if let Some(path) = resolve_model_path(&params.models_dir, &params.model) {
        return Ok(path);
    }

    match &params.download_url {
        Some(url) => download_model(url, &params.model, &params.models_dir, false).await,
        None => bail!(
            "model {} not found in {} and no download URL configured",
            params.model,
            params.models_dir.display()
        ),
    }
}

#[cfg(test)]
mod test {
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;

    /// Answer one HTTP request with `response` and hang up.
    async fn serve_once(response: &'static [u8]) -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut request).await;
                let _ = stream.write_all(response).await;
            }
        });

        Ok(format!("http://{addr}"))
    }

    #[test]
    fn test_catalog() {
        assert_eq!(AVAILABLE_MODELS.len(), 5);
        assert!(model_info("yolov8s.onnx").is_some());
        assert!(model_info("yolov5s.onnx").is_none());
    }

    #[test]
    fn test_resolve_model_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(resolve_model_path(dir.path(), "yolov8n.onnx").is_none());

        let model = dir.path().join("yolov8n.onnx");
        fs::write(&model, b"onnx")?;
        assert_eq!(resolve_model_path(dir.path(), "yolov8n.onnx"), Some(model.clone()));

        let model_str = model.display().to_string();
        assert_eq!(
            resolve_model_path("/nonexistent", &model_str),
            Some(PathBuf::from(&model_str))
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_ensure_model_without_url() {
        let params = YoloConfig {
            models_dir: PathBuf::from("/nonexistent/models"),
            ..Default::default()
        };
        assert!(ensure_model(&params).await.is_err());
    }

    #[tokio::test]
    async fn test_existing_model_is_not_downloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("yolov8n.onnx"), b"onnx")?;

        // The URL is never contacted
        let path = download_model("http://127.0.0.1:9", "yolov8n.onnx", dir.path(), false).await?;
        assert_eq!(fs::read(path)?, b"onnx");

        Ok(())
    }

    #[tokio::test]
    async fn test_download_replaces_file_when_complete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let url =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nonnx")
                .await?;

        let path = download_model(&url, "yolov8n.onnx", dir.path().join("models"), false).await?;
        assert_eq!(fs::read(&path)?, b"onnx");
        assert!(!partial_path(&path).exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_download_leaves_no_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // Promises more bytes than it sends
        let url = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\nConnection: close\r\n\r\ntruncated",
        )
        .await?;

        assert!(download_model(&url, "yolov8n.onnx", dir.path(), false)
            .await
            .is_err());
        assert!(resolve_model_path(dir.path(), "yolov8n.onnx").is_none());
        assert!(!dir.path().join("yolov8n.onnx.part").exists());

        let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await?;
        assert!(download_model(&url, "yolov8n.onnx", dir.path(), false)
            .await
            .is_err());
        assert!(resolve_model_path(dir.path(), "yolov8n.onnx").is_none());

        Ok(())
    }
}
