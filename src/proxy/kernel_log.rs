use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::domain::{EngineKind, ProxyConfig};
use crate::engine::singbox::log_output;

/// Largest slice returned per poll
pub const LOG_WINDOW_BYTES: u64 = 512 * 1024;

/// Byte window of the kernel log starting at a caller cursor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogWindow {
    pub from: u64,
    pub to: u64,
    pub end: u64,
    pub lost: bool,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read at most [`LOG_WINDOW_BYTES`] from `since`.
///
/// A negative cursor reads from the start. A cursor past the end means the
/// file was truncated; reading restarts at 0 with `lost` set.
pub async fn read_window(path: &Path, since: i64) -> LogWindow {
    let mut from = since.max(0) as u64;

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LogWindow::default(),
        Err(e) => {
            return LogWindow {
                from,
                to: from,
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };

    let end = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            return LogWindow {
                from,
                to: from,
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    };

    let mut lost = false;
    if from > end {
        from = 0;
        lost = true;
    }
    let len = (end - from).min(LOG_WINDOW_BYTES);

    let mut buf = vec![0u8; len as usize];
    let read = async {
        file.seek(SeekFrom::Start(from)).await?;
        file.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(())
    };
    if let Err(e) = read.await {
        return LogWindow {
            from,
            to: from,
            end,
            lost,
            error: Some(e.to_string()),
            ..Default::default()
        };
    }

    let (start, stop) = char_aligned(&buf, from > 0);
    LogWindow {
        from: from + start as u64,
        to: from + stop as u64,
        end,
        lost,
        text: String::from_utf8_lossy(&buf[start..stop]).into_owned(),
        error: None,
    }
}

/// Sub-range of `buf` that neither begins inside a UTF-8 sequence (when
/// `mid_file`) nor ends with a partial one. Trimmed tail bytes are returned
/// by the next read.
fn char_aligned(buf: &[u8], mid_file: bool) -> (usize, usize) {
    let is_continuation = |b: u8| b & 0xC0 == 0x80;
    let start = if mid_file {
        buf.iter().take(3).take_while(|b| is_continuation(**b)).count()
    } else {
        0
    };

    let mut stop = buf.len();
    let lead = (start..buf.len()).rev().take(4).find(|&i| !is_continuation(buf[i]));
    if let Some(lead) = lead {
        let width = match buf[lead] {
            b if b >= 0xF0 => 4,
            b if b >= 0xE0 => 3,
            b if b >= 0xC0 => 2,
            _ => 1,
        };
        if lead + width > buf.len() {
            stop = lead;
        }
    }
    (start, stop)
}

/// Truncate `<engine_dir>/kernel.log` and write the session header.
///
/// Falls back to appending to `<artifacts>/runtime/kernel.log` when the engine
/// directory is not writable.
pub async fn prepare_kernel_log(
    engine_dir: &Path,
    artifacts_dir: &Path,
    engine: EngineKind,
) -> Result<PathBuf> {
    let header = format!(
        "----- kernel start {} engine={} -----\n",
        Utc::now().to_rfc3339(),
        engine
    );

    let primary = engine_dir.join("kernel.log");
    match tokio::fs::write(&primary, header.as_bytes()).await {
        Ok(()) => return Ok(primary),
        Err(e) => tracing::warn!(path = %primary.display(), "kernel log not writable: {}", e),
    }

    let runtime_dir = artifacts_dir.join("runtime");
    tokio::fs::create_dir_all(&runtime_dir)
        .await
        .with_context(|| format!("Failed to create {}", runtime_dir.display()))?;
    let fallback = runtime_dir.join("kernel.log");
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&fallback)
        .await
        .with_context(|| format!("Failed to open {}", fallback.display()))?;
    file.write_all(header.as_bytes()).await?;
    Ok(fallback)
}

/// File the operator should poll: sing-box's own `log.output` when set, else the captured stdout.
pub fn resolve_log_path(
    engine: EngineKind,
    config: &ProxyConfig,
    config_dir: &Path,
    captured: &Path,
) -> PathBuf {
    if engine != EngineKind::SingBox {
        return captured.to_path_buf();
    }
    match config.log_config.as_ref().and_then(log_output) {
        Some(output) => {
            let path = PathBuf::from(output);
            if path.is_absolute() {
                path
            } else {
                config_dir.join(path)
            }
        }
        None => captured.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogConfig;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vea-klog-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_window() {
        let dir = temp_dir();
        let window = read_window(&dir.join("nope.log"), 10).await;
        assert_eq!(window, LogWindow::default());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_window_from_cursor() {
        let dir = temp_dir();
        let path = dir.join("kernel.log");
        std::fs::write(&path, b"hello world").unwrap();

        let window = read_window(&path, -5).await;
        assert_eq!((window.from, window.to, window.end), (0, 11, 11));
        assert_eq!(window.text, "hello world");
        assert!(!window.lost);

        let window = read_window(&path, 6).await;
        assert_eq!(window.text, "world");
        assert_eq!(window.to, 11);

        let window = read_window(&path, 11).await;
        assert_eq!(window.text, "");
        assert_eq!((window.from, window.to), (11, 11));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_truncated_file_marks_lost() {
        let dir = temp_dir();
        let path = dir.join("kernel.log");
        std::fs::write(&path, b"abc").unwrap();

        let window = read_window(&path, 100).await;
        assert!(window.lost);
        assert_eq!(window.from, 0);
        assert_eq!(window.text, "abc");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let dir = temp_dir();
        let path = dir.join("kernel.log");
        std::fs::write(&path, vec![b'x'; LOG_WINDOW_BYTES as usize + 10]).unwrap();

        let window = read_window(&path, 0).await;
        assert_eq!(window.to, LOG_WINDOW_BYTES);
        assert_eq!(window.end, LOG_WINDOW_BYTES + 10);
        let next = read_window(&path, window.to as i64).await;
        assert_eq!(next.text.len(), 10);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_window_skips_partial_characters() {
        let dir = temp_dir();
        let path = dir.join("kernel.log");
        std::fs::write(&path, "héllo".as_bytes()).unwrap();

        // Cursor inside the two-byte é.
        let window = read_window(&path, 2).await;
        assert_eq!(window.from, 3);
        assert_eq!(window.text, "llo");

        let mut data = vec![b'x'; LOG_WINDOW_BYTES as usize - 1];
        data.extend_from_slice("éz".as_bytes());
        std::fs::write(&path, &data).unwrap();

        let window = read_window(&path, 0).await;
        assert_eq!(window.to, LOG_WINDOW_BYTES - 1);
        assert!(!window.text.contains('\u{FFFD}'));
        let next = read_window(&path, window.to as i64).await;
        assert_eq!(next.from, LOG_WINDOW_BYTES - 1);
        assert_eq!(next.text, "éz");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_char_aligned_keeps_complete_text() {
        let text = "a€b".as_bytes();
        assert_eq!(char_aligned(text, true), (0, text.len()));
        assert_eq!(char_aligned(&text[..3], false), (0, 1));
        assert_eq!(char_aligned(&text[2..], true), (2, 3));
    }

    #[tokio::test]
    async fn test_prepare_truncates_and_writes_header() {
        let dir = temp_dir();
        std::fs::write(dir.join("kernel.log"), b"old session\n").unwrap();
        let path = prepare_kernel_log(&dir, &dir, EngineKind::Clash).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("----- kernel start "));
        assert!(text.trim_end().ends_with("engine=clash -----"));
        assert!(!text.contains("old session"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_prepare_falls_back_to_runtime_dir() {
        let dir = temp_dir();
        let missing = dir.join("core").join("sing-box");
        let path = prepare_kernel_log(&missing, &dir, EngineKind::SingBox).await.unwrap();
        assert_eq!(path, dir.join("runtime").join("kernel.log"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resolve_log_path_prefers_singbox_output() {
        let captured = Path::new("/a/core/sing-box/kernel.log");
        let mut config = ProxyConfig {
            log_config: Some(LogConfig {
                output: "box.log".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve_log_path(EngineKind::SingBox, &config, Path::new("/a/core/sing-box"), captured),
            PathBuf::from("/a/core/sing-box/box.log")
        );
        assert_eq!(
            resolve_log_path(EngineKind::Clash, &config, Path::new("/a"), captured),
            captured
        );
        config.log_config.as_mut().unwrap().output = "stdout".to_string();
        assert_eq!(
            resolve_log_path(EngineKind::SingBox, &config, Path::new("/a"), captured),
            captured
        );
    }
}
