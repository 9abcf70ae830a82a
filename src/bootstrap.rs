//! Bootstrap helpers for botkeeper.
//!
//! Environment files are read before configuration is resolved, and the
//! tracing subscriber is installed before anything logs.
//!
//! File: `~/.botkeeper/.env` (standard dotenvy format)

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILTER: &str = "botkeeper=debug,info";

/// Base directory for botkeeper state: `~/.botkeeper`.
pub fn botkeeper_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".botkeeper")
}

/// Path to the botkeeper-specific `.env` file: `~/.botkeeper/.env`.
pub fn botkeeper_env_path() -> PathBuf {
    botkeeper_dir().join(".env")
}

/// Load `./.env` and then `~/.botkeeper/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.botkeeper/.env`
pub fn load_env_files() {
    let _ = dotenvy::dotenv();
    load_env_file(&botkeeper_env_path());
}

fn load_env_file(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = dotenvy::from_path(path) {
        eprintln!("Warning: failed to load {}: {}", path.display(), e);
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` selects the filter; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Warning: tracing subscriber already installed: {}", e);
    }
}

thread_local! {
    static PANIC_BACKTRACE: Cell<Option<Backtrace>> = const { Cell::new(None) };
}

/// Chain a panic hook that keeps the backtrace of the panic site for
/// [`take_panic_backtrace`] on the panicking thread. Installs once.
pub fn install_panic_hook() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_BACKTRACE.try_with(|slot| slot.set(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

/// Backtrace of the latest panic on this thread, if the hook recorded one.
pub fn take_panic_backtrace() -> Option<Backtrace> {
    PANIC_BACKTRACE.with(Cell::take)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn env_file_values_keep_quoted_hashes() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");

        // Passwords with # are common; without quoting dotenvy treats # as a comment.
        std::fs::write(&env_path, "BOT_PASSWORD=\"hunter#2\"\n").unwrap();

        let parsed: Vec<(String, String)> = dotenvy::from_path_iter(&env_path)
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(parsed, vec![("BOT_PASSWORD".to_string(), "hunter#2".to_string())]);
    }

    #[test]
    fn missing_env_file_is_ignored() {
        let dir = tempdir().unwrap();
        load_env_file(&dir.path().join("absent.env"));
    }

    #[test]
    fn env_path_lives_under_state_dir() {
        assert!(botkeeper_env_path().starts_with(botkeeper_dir()));
        assert!(botkeeper_env_path().ends_with(".botkeeper/.env"));
    }

    #[test]
    fn panic_hook_records_backtrace_per_thread() {
        install_panic_hook();
        install_panic_hook();
        let _ = take_panic_backtrace();

        let caught = std::panic::catch_unwind(|| panic!("handler blew up"));
        assert!(caught.is_err());
        assert!(take_panic_backtrace().is_some());
        assert!(take_panic_backtrace().is_none());

        let other = std::thread::spawn(take_panic_backtrace).join().unwrap();
        assert!(other.is_none());
    }
}
