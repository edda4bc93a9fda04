//! Console tracing plus an optional rolling file that records operation
//! lifecycle events.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target written to the rolling file.
pub const OPS_TARGET: &str = "conduit::ops";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollEvery {
    Minute,
    Hour,
    Day,
}

impl RollEvery {
    /// Unknown values fall back to daily rotation.
    pub fn from_slug(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "minutely" => Self::Minute,
            "hourly" => Self::Hour,
            _ => Self::Day,
        }
    }

    fn rotation(self) -> Rotation {
        match self {
            Self::Minute => Rotation::MINUTELY,
            Self::Hour => Rotation::HOURLY,
            Self::Day => Rotation::DAILY,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLog {
    pub dir: PathBuf,
    pub prefix: String,
    pub every: RollEvery,
}

impl FileLog {
    /// Reads `CONDUIT_LOG_ROLL`, `CONDUIT_LOG_DIR` and `CONDUIT_LOG_ROTATION`.
    /// `None` unless rolling is switched on.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if lookup("CONDUIT_LOG_ROLL").as_deref().map(str::trim) != Some("1") {
            return None;
        }
        let dir = lookup("CONDUIT_LOG_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| "logs".to_string());
        let every = lookup("CONDUIT_LOG_ROTATION")
            .map(|value| RollEvery::from_slug(&value))
            .unwrap_or(RollEvery::Day);
        Some(Self {
            dir: PathBuf::from(dir),
            prefix: "conduit-ops".to_string(),
            every,
        })
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    let Some(file) = FileLog::from_env() else {
        let _ = registry.try_init();
        return;
    };
    let appender = std::fs::create_dir_all(&file.dir)
        .map_err(|err| err.to_string())
        .and_then(|()| {
            RollingFileAppender::builder()
                .rotation(file.every.rotation())
                .filename_prefix(&file.prefix)
                .build(&file.dir)
                .map_err(|err| err.to_string())
        });
    let appender = match appender {
        Ok(appender) => appender,
        Err(err) => {
            let _ = registry.try_init();
            tracing::warn!(
                directory = %file.dir.display(),
                error = %err,
                "log directory unavailable; file logging disabled"
            );
            return;
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(Targets::new().with_target(OPS_TARGET, tracing::Level::DEBUG));
    if registry.with(file_layer).try_init().is_ok() {
        let _ = FILE_GUARD.set(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_log_is_opt_in() {
        assert_eq!(FileLog::from_lookup(lookup(&[])), None);
        assert_eq!(
            FileLog::from_lookup(lookup(&[("CONDUIT_LOG_ROLL", "0")])),
            None
        );
    }

    #[test]
    fn file_log_reads_dir_and_rotation() {
        let file = FileLog::from_lookup(lookup(&[
            ("CONDUIT_LOG_ROLL", "1"),
            ("CONDUIT_LOG_DIR", "/var/log/conduit"),
            ("CONDUIT_LOG_ROTATION", "Hourly"),
        ]))
        .unwrap();
        assert_eq!(file.dir, PathBuf::from("/var/log/conduit"));
        assert_eq!(file.every, RollEvery::Hour);
    }

    #[test]
    fn unknown_rotation_rolls_daily() {
        assert_eq!(RollEvery::from_slug("weekly"), RollEvery::Day);
        assert_eq!(RollEvery::from_slug("minutely"), RollEvery::Minute);
    }

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
        tracing::info!(target: "conduit::ops", "still logging");
    }
}
