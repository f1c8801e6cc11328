use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Periodically removes `code-*.go` files left behind in the temp dir, e.g.
/// by a crash between materializing a source file and its unlink.
pub fn spawn(temp_dir: PathBuf, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep_once(&temp_dir, period).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, dir = %temp_dir.display(), "removed stale source files");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(dir = %temp_dir.display(), error = %err, "temp sweep failed");
                }
            }
        }
    });
}

pub async fn sweep_once(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with("code-") && name.ends_with(".go")) {
            continue;
        }

        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let stale = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age > max_age)
            .unwrap_or(false);

        if stale && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}
