use crate::config::AppSettings;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Log download progress every this many bytes
const PROGRESS_STEP: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Download request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Download of {url} failed with HTTP {status}")]
    Status { url: String, status: StatusCode },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Download of {url} returned an empty body")]
    EmptyBody { url: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProvisioningError + '_ {
    move |source| ProvisioningError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Ensure the configured embedding model is present, downloading it if needed.
pub async fn ensure_model(settings: &AppSettings) -> Result<PathBuf, ProvisioningError> {
    let target = settings.model_path();
    ensure_model_file(&target, &settings.model_url).await?;
    Ok(target)
}

/// Make sure `target` exists.
///
/// An existing non-empty file is left untouched and no request is made.
/// Otherwise the file is fetched from `url` into `<target>.part` and renamed
/// into place once complete; on failure the partial file is removed, so the
/// target path never holds a truncated model.
#[instrument(skip_all, fields(target = %target.display()))]
pub async fn ensure_model_file(target: &Path, url: &str) -> Result<(), ProvisioningError> {
    if let Some(model_dir) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(model_dir)
            .await
            .map_err(io_error(model_dir))?;
    }

    match fs::metadata(target).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            info!("Model already present at {}", target.display());
            return Ok(());
        }
        Ok(_) => warn!(
            "Model file {} is empty or not a file, downloading again",
            target.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(target)(e)),
    }

    let part = PathBuf::from(format!("{}.part", target.display()));
    info!("Downloading model from {} to {}", url, target.display());

    match download_and_install(url, &part, target).await {
        Ok(bytes) => {
            info!("Model downloaded ({} bytes) to {}", bytes, target.display());
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&part).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial download {}: {}", part.display(), cleanup);
                }
            }
            Err(e)
        }
    }
}

async fn download_and_install(url: &str, part: &Path, target: &Path) -> Result<u64, ProvisioningError> {
    let bytes = download_to(url, part).await?;
    fs::rename(part, target).await.map_err(io_error(target))?;
    Ok(bytes)
}

async fn download_to(url: &str, part: &Path) -> Result<u64, ProvisioningError> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;

    let mut response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProvisioningError::Status {
            url: url.to_string(),
            status,
        });
    }

    let mut file = fs::File::create(part).await.map_err(io_error(part))?;
    let mut written: u64 = 0;
    let mut next_report = PROGRESS_STEP;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await.map_err(io_error(part))?;
        written += chunk.len() as u64;
        if written >= next_report {
            debug!("Downloaded {} MiB", written / (1024 * 1024));
            next_report += PROGRESS_STEP;
        }
    }
    file.flush().await.map_err(io_error(part))?;
    file.sync_all().await.map_err(io_error(part))?;

    if written == 0 {
        return Err(ProvisioningError::EmptyBody {
            url: url.to_string(),
        });
    }
    Ok(written)
}
