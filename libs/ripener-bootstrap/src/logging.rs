//! Subscriber setup: console plus optional rotating JSON files, per-subsystem levels.

use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// The non-blocking console worker lives as long as the process.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// `None` means the sink is off for that subsystem.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" | "" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// `target` is `prefix` itself or one of its `::` children.
fn target_under(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

/// Writes into a rotating file, or swallows output when no file applies.
struct FileHandle(Option<SharedRotate>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Picks the file for a record by target: the longest matching subsystem
/// prefix, else the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<SharedRotate>,
    subsystems: Vec<(String, SharedRotate)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = Self::default();
        for (name, section) in cfg {
            let Some(file) = open_rotating(name, section, base_dir) else {
                continue;
            };
            if name == DEFAULT_SECTION {
                router.default = Some(file);
            } else {
                router.subsystems.push((name.clone(), file));
            }
        }
        router
            .subsystems
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        router
    }

    fn route(&self, target: &str) -> Option<SharedRotate> {
        self.subsystems
            .iter()
            .find(|(prefix, _)| target_under(target, prefix))
            .map(|(_, file)| Arc::clone(file))
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.subsystems.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.route(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_rotating(name: &str, section: &Section, base_dir: &Path) -> Option<SharedRotate> {
    if section.file.trim().is_empty() {
        return None;
    }
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            // The subscriber is not installed yet, so report on stderr.
            eprintln!("Failed to create log directory for '{name}': {} ({e})", parent.display());
            return None;
        }
    }

    // Keep a fixed number of files if asked, else prune by age.
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(i64::from(
            section.max_age_days.unwrap_or(1),
        ))),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

    let rotate = FileRotate::new(
        &path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Some(Arc::new(Mutex::new(rotate)))
}

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

/// Per-target levels for one sink. A subsystem without a file inherits the
/// default file sink, so it gets no file rule of its own.
fn build_targets(cfg: &LoggingConfig, sink: Sink, has_default_file: bool) -> Targets {
    let level_of = |s: &Section| match sink {
        Sink::Console => parse_level(&s.console_level),
        Sink::File => parse_level(&s.file_level),
    };

    let default_level = match (sink, has_default_file) {
        (Sink::File, false) => LevelFilter::OFF,
        _ => cfg
            .get(DEFAULT_SECTION)
            .map_or(LevelFilter::INFO, |s| level_of(s).unwrap_or(LevelFilter::OFF)),
    };

    let mut targets = Targets::new().with_default(default_level);
    for (name, section) in cfg.iter().filter(|(k, _)| k.as_str() != DEFAULT_SECTION) {
        if matches!(sink, Sink::File) && section.file.trim().is_empty() {
            continue;
        }
        targets = targets.with_target(name.clone(), level_of(section).unwrap_or(LevelFilter::OFF));
    }
    targets
}

/// Install the global subscriber. Relative log files resolve against `base_dir`.
///
/// `RUST_LOG`, when set, caps both sinks. A second call is a no-op.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` before installing the subscriber.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal();
        return;
    }

    let router = FileRouter::build(cfg, base_dir);
    let console_targets = build_targets(cfg, Sink::Console, router.default.is_some());
    let file_targets = build_targets(cfg, Sink::File, router.default.is_some());

    let env = EnvFilter::try_from_default_env().ok();

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let files = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = Registry::default()
        .with(env)
        .with(console)
        .with(files)
        .try_init();
}

/// INFO to stderr, honouring `RUST_LOG`.
fn init_minimal() {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = Registry::default()
        .with(env)
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339()),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_logging_config;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.into(),
            file: file.into(),
            file_level: file_level.into(),
            max_age_days: None,
            max_backups: Some(2),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("warning"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("off"), None);
        assert_eq!(parse_level("bogus"), Some(LevelFilter::INFO));
    }

    #[test]
    fn target_prefix_matching() {
        assert!(target_under("ripener", "ripener"));
        assert!(target_under("ripener::services::registry", "ripener"));
        assert!(!target_under("ripener_bootstrap", "ripener"));
        assert!(!target_under("rip", "ripener"));
    }

    #[test]
    fn router_prefers_longest_subsystem() {
        let tmp = tempdir().unwrap();
        let mut cfg: LoggingConfig = HashMap::new();
        cfg.insert("default".into(), section("info", "logs/all.log", "debug"));
        cfg.insert("ripener".into(), section("info", "logs/core.log", "debug"));
        cfg.insert("ripener::services".into(), section("off", "logs/svc.log", "trace"));
        cfg.insert("quiet".into(), section("warn", "", ""));

        let router = FileRouter::build(&cfg, tmp.path());
        assert_eq!(router.subsystems.len(), 2);
        assert_eq!(router.subsystems[0].0, "ripener::services");

        let svc = router.route("ripener::services::registry").unwrap();
        assert!(Arc::ptr_eq(&svc, &router.subsystems[0].1));
        let core = router.route("ripener::registry").unwrap();
        assert!(Arc::ptr_eq(&core, &router.subsystems[1].1));
        let fallback = router.route("quiet").unwrap();
        assert!(Arc::ptr_eq(&fallback, router.default.as_ref().unwrap()));
        assert!(tmp.path().join("logs").is_dir());
    }

    #[test]
    fn file_sink_is_off_without_default_file() {
        let mut cfg = default_logging_config();
        cfg.get_mut("default").unwrap().file.clear();
        let targets = build_targets(&cfg, Sink::File, false);
        assert!(!targets.would_enable("anything", &tracing::Level::ERROR));

        let console = build_targets(&cfg, Sink::Console, false);
        assert!(console.would_enable("anything", &tracing::Level::INFO));
        assert!(!console.would_enable("anything", &tracing::Level::DEBUG));
    }

    #[test]
    fn subsystem_levels_override_default() {
        let mut cfg: LoggingConfig = HashMap::new();
        cfg.insert("default".into(), section("warn", "", ""));
        cfg.insert("ripener".into(), section("trace", "", ""));
        let console = build_targets(&cfg, Sink::Console, false);
        assert!(console.would_enable("ripener::runtime", &tracing::Level::TRACE));
        assert!(!console.would_enable("other", &tracing::Level::INFO));
    }
}
