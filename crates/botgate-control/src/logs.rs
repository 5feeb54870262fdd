use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Component, Path, PathBuf},
};

use botgate_model::LogFileInfo;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::LogError;

pub const DEFAULT_MAX_LINES: usize = 100;
pub const DEFAULT_LATEST_LINES: usize = 10;
const MAX_MAX_LINES: usize = 10_000;
/// Upper bound on how much of the log file a single request reads.
const TAIL_WINDOW_BYTES: u64 = 1024 * 1024;

/// `0` falls back to the default; anything else is capped.
pub fn clamp_lines(requested: Option<usize>, default: usize) -> usize {
    match requested {
        None | Some(0) => default,
        Some(v) => v.min(MAX_MAX_LINES),
    }
}

/// Reads at most `limit_bytes` from the end of `path`. When the window starts
/// mid-file the first (partial) line is dropped.
async fn read_tail_window(path: &Path, limit_bytes: u64) -> io::Result<Vec<u8>> {
    let mut f = tokio::fs::File::open(path).await?;
    let size = f.metadata().await?.len();
    let start = size.saturating_sub(limit_bytes);

    f.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (size - start) as usize];
    f.read_exact(&mut buf).await?;

    if start > 0 {
        match buf.iter().position(|b| *b == b'\n') {
            Some(nl) => {
                buf.drain(..=nl);
            }
            None => buf.clear(),
        }
    }
    Ok(buf)
}

fn last_lines(buf: &[u8], max_lines: usize) -> Vec<String> {
    // Best-effort UTF-8: replace invalid sequences.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Reads the last `max_lines` lines of `path`.
///
/// Never fails: a missing, unreadable or empty file yields a placeholder
/// message instead. The file is opened read-only, so a writer holding it
/// open is not disturbed. Only the last [`TAIL_WINDOW_BYTES`] are read.
pub async fn tail(path: &Path, max_lines: usize) -> Vec<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let buf = match read_tail_window(path, TAIL_WINDOW_BYTES).await {
        Ok(buf) => buf,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "log file not found");
            return vec![format!("No logs available. Log file not found: {name}")];
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read log file");
            return vec![
                format!("Log file {name} cannot be read (in use by another process)."),
                "Please try again later.".to_string(),
            ];
        }
    };

    let lines = last_lines(&buf, max_lines);
    if lines.is_empty() {
        return vec![format!("Log file {name} is empty.")];
    }
    lines
}

/// Directory holding the designated log file.
pub fn log_dir(log_path: &Path) -> &Path {
    match log_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Joins `name` onto `dir`, accepting a bare file name only.
fn scoped_file(dir: &Path, name: &str) -> Result<PathBuf, LogError> {
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(file)), None) => Ok(dir.join(file)),
        _ => Err(LogError::InvalidName),
    }
}

/// `.txt` files in `dir`, newest first.
pub async fn list_files(dir: &Path) -> Result<Vec<LogFileInfo>, LogError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(LogError::DirNotFound),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("txt") {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        files.push(LogFileInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            last_modified,
        });
    }
    files.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    Ok(files)
}

/// Last `max_lines` lines of `name` inside `dir`. Unlike [`tail`], a missing
/// file is an error.
pub async fn read_file(dir: &Path, name: &str, max_lines: usize) -> Result<Vec<String>, LogError> {
    let path = scoped_file(dir, name)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(LogError::NotFound(name.to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(LogError::NotFound(name.to_string()));
        }
        Err(e) => return Err(e.into()),
    }
    let buf = read_tail_window(&path, TAIL_WINDOW_BYTES).await?;
    Ok(last_lines(&buf, max_lines))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn clamp_defaults_and_caps() {
        assert_eq!(clamp_lines(None, 100), 100);
        assert_eq!(clamp_lines(Some(0), 100), 100);
        assert_eq!(clamp_lines(Some(5), 100), 5);
        assert_eq!(clamp_lines(Some(1_000_000), 100), MAX_MAX_LINES);
    }

    #[test]
    fn keeps_only_the_tail() {
        let lines = last_lines(b"a\nb\nc\n", 2);
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn missing_file_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let out = tail(&dir.path().join("SysBotLog.txt"), 10).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("not found: SysBotLog.txt"));
    }

    #[tokio::test]
    async fn empty_file_yields_placeholder() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let out = tail(file.path(), 10).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].ends_with("is empty."));
    }

    #[tokio::test]
    async fn reads_while_writer_holds_file_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..5 {
            writeln!(file, "line {i}").unwrap();
        }
        file.flush().unwrap();

        let out = tail(file.path(), 3).await;
        assert_eq!(out, vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn window_drops_partial_first_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "first line\nsecond\nthird\n").unwrap();
        file.flush().unwrap();

        let buf = read_tail_window(file.path(), 10).await.unwrap();
        assert_eq!(buf, b"third\n");
        let whole = read_tail_window(file.path(), 1024).await.unwrap();
        assert_eq!(whole, b"first line\nsecond\nthird\n");
    }

    #[tokio::test]
    async fn large_file_is_read_through_a_bounded_window() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let filler = "x".repeat(1023);
        for _ in 0..(TAIL_WINDOW_BYTES / 1024 + 64) {
            writeln!(file, "{filler}").unwrap();
        }
        writeln!(file, "last").unwrap();
        file.flush().unwrap();

        let buf = read_tail_window(file.path(), TAIL_WINDOW_BYTES).await.unwrap();
        assert!(buf.len() as u64 <= TAIL_WINDOW_BYTES);
        assert_eq!(tail(file.path(), 1).await, vec!["last"]);
    }

    #[test]
    fn scoped_file_rejects_anything_but_a_bare_name() {
        let dir = Path::new("/var/log/botgate");
        assert_eq!(
            scoped_file(dir, "SysBotLog.txt").unwrap(),
            dir.join("SysBotLog.txt")
        );
        for bad in ["../secret.txt", "sub/a.txt", "/etc/passwd", "..", ".", ""] {
            assert!(
                matches!(scoped_file(dir, bad), Err(LogError::InvalidName)),
                "{bad}"
            );
        }
    }

    #[test]
    fn log_dir_of_bare_file_is_cwd() {
        assert_eq!(log_dir(Path::new("SysBotLog.txt")), Path::new("."));
        assert_eq!(log_dir(Path::new("logs/SysBotLog.txt")), Path::new("logs"));
    }

    #[tokio::test]
    async fn lists_only_txt_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SysBotLog.txt"), "a\nb\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "x").unwrap();
        std::fs::create_dir(dir.path().join("old.txt")).unwrap();

        let files = list_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "SysBotLog.txt");
        assert_eq!(files[0].size, 4);
    }

    #[tokio::test]
    async fn missing_dir_and_file_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_files(&dir.path().join("nope")).await,
            Err(LogError::DirNotFound)
        ));
        assert!(matches!(
            read_file(dir.path(), "absent.txt", 10).await,
            Err(LogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_file_tails_named_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "1\n2\n3\n").unwrap();
        let lines = read_file(dir.path(), "old.txt", 2).await.unwrap();
        assert_eq!(lines, vec!["2", "3"]);
    }
}
