use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter for a numeric minimum level: 0 trace .. 4 error, 5 critical, 6 off.
pub fn level_filter(level: u8) -> &'static str {
    match level {
        0 => "trace",
        1 => "debug",
        2 => "info",
        3 => "warn",
        4 | 5 => "error",
        _ => "off",
    }
}

/// Size-based rotation of the file log: `path`, then `path.1` .. `path.<keep>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub max_bytes: usize,
    pub keep: usize,
    /// Start every run with an empty file, moving the previous one to `path.1`.
    pub rotate_on_open: bool,
}

pub fn open_rotating(path: &Path, rotation: Rotation) -> io::Result<FileRotate<AppendCount>> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let had_content = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
    let mut file = FileRotate::new(
        path,
        AppendCount::new(rotation.keep),
        ContentLimit::Bytes(rotation.max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    if rotation.rotate_on_open && had_content {
        file.rotate()?;
    }
    Ok(file)
}

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`; with
/// `log_file` set, a second plain-text layer writes to that rotating file.
pub fn init_tracing(default_filter: &str, log_file: Option<(&Path, Rotation)>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let file_layer = match log_file {
        Some((path, rotation)) => {
            let file = open_rotating(path, rotation)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .with(file_layer)
        .try_init()?;
    Ok(())
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics() {
    use metrics_exporter_prometheus::PrometheusBuilder;

    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], 9000))
        .install()
    {
        tracing::warn!(error = %e, "Prometheus exporter not installed");
        return;
    }

    tracing::info!("Prometheus exporter listening on http://0.0.0.0:9000/metrics");
    metrics::gauge!("md_session_up").set(1.0);
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics() { /* no-op */ }

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("md-session-{name}-{}", std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn test_file_log_rotates_by_size() {
        let dir = scratch("rotate");
        let path = dir.join("md.log");
        let mut log = open_rotating(&path, Rotation { max_bytes: 64, keep: 2, rotate_on_open: false }).unwrap();
        for i in 0..20 {
            writeln!(log, "line {i:02} of the rotating log sink test").unwrap();
        }
        log.flush().unwrap();

        assert!(path.exists());
        assert!(dir.join("md.log.1").exists());
        assert!(!dir.join("md.log.3").exists());
        assert!(fs::metadata(&path).unwrap().len() <= 64);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rotate_on_open_moves_previous_run_aside() {
        let dir = scratch("reopen");
        let path = dir.join("md.log");
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, "previous run\n").unwrap();

        let mut log = open_rotating(&path, Rotation { max_bytes: 1 << 20, keep: 3, rotate_on_open: true }).unwrap();
        writeln!(log, "this run").unwrap();
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(dir.join("md.log.1")).unwrap(), "previous run\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "this run\n");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(0), "trace");
        assert_eq!(level_filter(2), "info");
        assert_eq!(level_filter(5), "error");
        assert_eq!(level_filter(6), "off");
    }
}
