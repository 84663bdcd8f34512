//! Audio download with SSRF validation. YouTube-like URLs route through
//! `yt-dlp` for video-audio extraction instead of a raw HTTP GET.

use std::path::PathBuf;
use std::time::Duration;

use podpipe_common::security::UrlValidator;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

const YT_DLP_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("url rejected by SSRF policy: {0}")]
    Security(#[from] podpipe_common::security::SecurityError),

    #[error("download request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to write audio file: {0}")]
    Io(#[from] std::io::Error),

    #[error("yt-dlp timed out extracting audio")]
    YtDlpTimeout,

    #[error("yt-dlp exited with an error: {0}")]
    YtDlpFailed(String),
}

fn is_youtube_url(url: &str) -> bool {
    url.contains("youtube.com") || url.contains("youtu.be")
}

/// Validate `url` (including DNS-rebinding defense) then either extract
/// audio via `yt-dlp` (YouTube-like URLs) or stream it directly to a
/// fresh file under `temp_dir`. The caller owns cleanup of the returned
/// path.
pub async fn download_audio(
    http: &reqwest::Client,
    validator: &UrlValidator,
    url: &str,
    temp_dir: &str,
) -> Result<PathBuf, DownloadError> {
    validator.validate_with_dns(url).await?;
    tokio::fs::create_dir_all(temp_dir).await?;

    if is_youtube_url(url) {
        return download_youtube_audio(url, temp_dir).await;
    }

    let response = http.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;

    let path = PathBuf::from(temp_dir).join(format!("{}.audio", Uuid::new_v4()));
    tokio::fs::write(&path, &bytes).await?;

    Ok(path)
}

/// Shell out to `yt-dlp` to pull the best available audio track and
/// transcode it to mp3. The binary is expected on `PATH`.
async fn download_youtube_audio(url: &str, temp_dir: &str) -> Result<PathBuf, DownloadError> {
    let out_base = PathBuf::from(temp_dir).join(Uuid::new_v4().to_string());
    let out_template = format!("{}.%(ext)s", out_base.display());

    let result = tokio::time::timeout(
        YT_DLP_TIMEOUT,
        Command::new("yt-dlp")
            .args([
                "-f",
                "bestaudio/best",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "0",
                "--quiet",
                "--no-warnings",
                "-o",
                &out_template,
                url,
            ])
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            let path = out_base.with_extension("mp3");
            Ok(path)
        }
        Ok(Ok(output)) => Err(DownloadError::YtDlpFailed(String::from_utf8_lossy(&output.stderr).into_owned())),
        Ok(Err(e)) => Err(DownloadError::YtDlpFailed(e.to_string())),
        Err(_) => Err(DownloadError::YtDlpTimeout),
    }
}
