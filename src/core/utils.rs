use std::collections::HashSet;
use std::sync::OnceLock;

use camino::Utf8Path;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;

use crate::error::{Error, Result};

static PROGRESS: OnceLock<MultiProgress> = OnceLock::new();

fn progress() -> &'static MultiProgress {
    PROGRESS.get_or_init(MultiProgress::new)
}

/// Install env_logger behind the progress bars so log lines don't tear them.
pub fn init_logging() -> Result<()> {
    use env_logger::Env;

    let logger = env_logger::Builder::from_env(Env::default().default_filter_or("info")).build();
    let level = logger.filter();
    LogWrapper::new(progress().clone(), logger)
        .try_init()
        .map_err(|e| Error::configuration(format!("Failed to initialize logging: {e}")))?;
    log::set_max_level(level);
    Ok(())
}

// Helper to create a consistent spinner
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = progress().add(ProgressBar::new_spinner());
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Helper to create a consistent progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let pb = progress().add(ProgressBar::new(total as u64));
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} regions ({per_sec}, {eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Chromosome set from an inline list or a file with one name per line.
pub fn read_chromosome_set(
    list: Option<&[String]>,
    file: Option<&Utf8Path>,
) -> Result<Option<HashSet<String>>> {
    if let Some(list) = list {
        return Ok(Some(list.iter().cloned().collect()));
    }

    if let Some(file) = file {
        let content = std::fs::read_to_string(file).map_err(|e| {
            Error::configuration(format!("Failed to read chromosome list {file}: {e}"))
        })?;
        let chroms = content
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        return Ok(Some(chroms));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_chromosome_set_from_file_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("chroms.txt")).unwrap();
        std::fs::write(&path, "chr1\n\n  chr2 \n").unwrap();

        let set = read_chromosome_set(None, Some(&path)).unwrap().unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("chr1"));
        assert!(set.contains("chr2"));
    }

    #[test]
    fn test_chromosome_set_list_wins() {
        let list = vec!["chrX".to_string()];
        let set = read_chromosome_set(Some(&list), None).unwrap().unwrap();
        assert!(set.contains("chrX"));
        assert!(read_chromosome_set(None, None).unwrap().is_none());
    }
}
