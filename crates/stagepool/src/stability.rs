//! Fatal-failure inspection and the process-termination collaborators.
//!
//! Certain task failures mean the process is no longer trustworthy: memory
//! exhaustion, or the file-handle pool running dry. Those are not recovered
//! from; the installed [`FatalHooks`] collaborator captures diagnostics and
//! terminates the process with [`FATAL_EXIT_CODE`]. The collaborators are
//! contracts only: diagnostic capture and shutdown-hook bookkeeping live
//! outside this crate.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

/// Exit code used when a fatal condition forces termination.
pub const FATAL_EXIT_CODE: i32 = 100;

const FILE_HANDLE_EXHAUSTION: &str = "Too many open files";
const OUT_OF_MEMORY_MARKERS: &[&str] = &["out of memory", "allocation failed", "memory allocation"];

/// Process-level collaborators invoked on fatal failures.
///
/// The defaults skip the heap diagnostic and shutdown-hook removal and exit
/// the process. Tests install a recording implementation instead.
pub trait FatalHooks: Send + Sync {
    /// Invoked on out-of-memory class failures before termination; may be a
    /// no-op when no dump facility is wired up.
    fn trigger_heap_diagnostic(&self) {}

    fn remove_all_shutdown_hooks(&self) {}

    fn exit_process(&self, code: i32) {
        std::process::exit(code);
    }
}

struct DefaultHooks;

impl FatalHooks for DefaultHooks {}

fn hooks() -> &'static RwLock<Arc<dyn FatalHooks>> {
    static HOOKS: std::sync::OnceLock<RwLock<Arc<dyn FatalHooks>>> = std::sync::OnceLock::new();
    HOOKS.get_or_init(|| RwLock::new(Arc::new(DefaultHooks)))
}

/// Replaces the fatal-failure collaborators process-wide.
pub fn install_fatal_hooks(replacement: Arc<dyn FatalHooks>) {
    *hooks().write() = replacement;
}

fn is_out_of_memory(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    OUT_OF_MEMORY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn is_file_handle_exhaustion(message: &str) -> bool {
    message.contains(FILE_HANDLE_EXHAUSTION)
}

/// Checks a task-failure message for conditions the process cannot survive.
///
/// Out-of-memory failures additionally trigger the heap diagnostic before
/// termination. Non-fatal failures return without side effects.
pub fn inspect_failure(message: &str) {
    let out_of_memory = is_out_of_memory(message);
    if !out_of_memory && !is_file_handle_exhaustion(message) {
        return;
    }

    let installed = hooks().read().clone();
    if out_of_memory {
        installed.trigger_heap_diagnostic();
    }
    error!(
        failure = message,
        "process state determined to be unstable, exiting forcefully"
    );
    installed.remove_all_shutdown_hooks();
    installed.exit_process(FATAL_EXIT_CODE);
}
