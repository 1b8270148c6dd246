// This file is part of the usvfs-rs project.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Process-wide shared state (component C5): the redirection tables, the
//! logical current directory, per-handle bookkeeping for open search
//! handles, and the in-memory log ring consulted by `GetLogMessages`.
//!
//! Exactly one [`Context`] exists per attached process, reached through
//! [`Context::get`] after [`Context::create`] or [`Context::connect`] has
//! run - mirroring the original's `HookContext::get()` singleton accessor.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::tree::Tree;

/// Mirrors the original's `LogLevel` enum (an `spdlog`-shaped ladder); kept
/// even though `usvfs-core` itself never filters on it; `usvfs-ffi` does the
/// filtering comparison at the injection boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// `CrashDumpsType`, carried through from `InitParameters` unchanged even
/// though this port has no minidump writer of its own - `usvfs-ffi` passes
/// it straight to the diagnostic CLI's `--dumps` flag for documentation
/// purposes only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CrashDumpsType {
    #[default]
    None,
    Mini,
    Data,
    Full,
}

/// Everything `CreateVFS` needs up front. Field names mirror the original's
/// `USVFSParameters` so a caller porting a mapping file finds the same
/// knobs.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub instance_name: String,
    pub log_level: LogLevel,
    pub crash_dumps_type: CrashDumpsType,
    pub crash_dumps_path: String,
    pub process_blacklist: Vec<String>,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            instance_name: "usvfs".to_string(),
            log_level: LogLevel::default(),
            crash_dumps_type: CrashDumpsType::default(),
            crash_dumps_path: String::new(),
            process_blacklist: Vec::new(),
        }
    }
}

/// A bounded, thread-safe log ring, drained by `GetLogMessages`. Mirrors the
/// original's "queue of formatted log lines" without pulling in a logging
/// framework dependency - `usvfs-core` has no `log`/`tracing` crate in its
/// dependency table (see `SPEC_FULL.md`'s ambient logging section).
pub struct TraceRing {
    capacity: usize,
    lines: Mutex<std::collections::VecDeque<String>>,
    not_empty: Condvar,
}

impl TraceRing {
    fn new(capacity: usize) -> Self {
        TraceRing {
            capacity,
            lines: Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
        self.not_empty.notify_one();
    }

    /// `GetLogMessages(block)`: pop the oldest line, optionally waiting
    /// (capped, so a disconnected host never hangs a caller forever) until
    /// one arrives.
    pub fn pop(&self, block: bool) -> Option<String> {
        let mut lines = self.lines.lock().unwrap();
        if block {
            while lines.is_empty() {
                let (guard, timeout) = self
                    .not_empty
                    .wait_timeout(lines, Duration::from_millis(200))
                    .unwrap();
                lines = guard;
                if timeout.timed_out() && lines.is_empty() {
                    return None;
                }
            }
        }
        lines.pop_front()
    }
}

/// Sharded handle -> original-path map, used to remember the virtual query
/// string a `FindFirstFileEx`/`NtQueryDirectoryFile` search handle was
/// opened with, so the hook dispatcher can re-merge virtual entries on each
/// `FindNextFile` call. Sharded (rather than one global map behind one
/// lock) because search handles are issued and retired at a much higher
/// rate, under far more threads, than tree edits are.
const HANDLE_MAP_SHARDS: usize = 16;

pub struct HandleMap {
    shards: Vec<Mutex<HashMap<usize, String>>>,
}

impl HandleMap {
    fn new() -> Self {
        HandleMap {
            shards: (0..HANDLE_MAP_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, handle: usize) -> &Mutex<HashMap<usize, String>> {
        &self.shards[handle % HANDLE_MAP_SHARDS]
    }

    pub fn insert(&self, handle: usize, original_query: String) {
        self.shard_for(handle).lock().unwrap().insert(handle, original_query);
    }

    pub fn get(&self, handle: usize) -> Option<String> {
        self.shard_for(handle).lock().unwrap().get(&handle).cloned()
    }

    pub fn remove(&self, handle: usize) -> Option<String> {
        self.shard_for(handle).lock().unwrap().remove(&handle)
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Main + inverse redirection tables, always created and torn down as a
/// pair. `inverse` maps a physical path back to the virtual name a caller
/// expects to see (`GetModuleFileName`'s use case); every [`Tree`]
/// mutation that has a meaningful inverse gets mirrored into it at the
/// call site (`Context::link_file`/`link_directory_static`), rather than
/// `Tree` itself knowing about inversion.
pub struct RedirectionTables {
    pub main: Tree,
    pub inverse: Tree,
}

impl RedirectionTables {
    fn new() -> Result<Self> {
        Ok(RedirectionTables {
            main: Tree::new()?,
            inverse: Tree::new()?,
        })
    }

    fn open_named(instance_name: &str, create: bool) -> Result<Self> {
        Ok(RedirectionTables {
            main: Tree::open_named(
                &format!("{instance_name}-main"),
                crate::tree::DEFAULT_TREE_CAPACITY,
                create,
            )?,
            inverse: Tree::open_named(
                &format!("{instance_name}-inverse"),
                crate::tree::DEFAULT_TREE_CAPACITY,
                create,
            )?,
        })
    }

    /// Select which table `reroute`/`reroute_new` should consult, per
    /// spec §4.3's `inverse` parameter.
    pub fn select(&self, inverse: bool) -> &Tree {
        if inverse {
            &self.inverse
        } else {
            &self.main
        }
    }
}

/// The process-wide shared state singleton.
pub struct Context {
    pub parameters: Parameters,
    pub tables: RedirectionTables,
    cwd: Mutex<Option<String>>,
    pub search_handles: HandleMap,
    pub log: TraceRing,
    deferred: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

const LOG_RING_CAPACITY: usize = 4096;

static CONTEXT: OnceCell<Context> = OnceCell::new();

impl Context {
    fn build(parameters: Parameters, tables: RedirectionTables) -> Context {
        Context {
            parameters,
            tables,
            cwd: Mutex::new(None),
            search_handles: HandleMap::default(),
            log: TraceRing::new(LOG_RING_CAPACITY),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// `CreateVFS`: build a fresh, process-local pair of tables.
    pub fn create(parameters: Parameters) -> Result<&'static Context> {
        let tables = RedirectionTables::new()?;
        Ok(CONTEXT.get_or_init(|| Context::build(parameters, tables)))
    }

    /// `ConnectVFS`: attach to tables created by a controller process under
    /// the same `instance_name`, rather than starting empty.
    pub fn connect(parameters: Parameters) -> Result<&'static Context> {
        let tables = RedirectionTables::open_named(&parameters.instance_name, false)?;
        Ok(CONTEXT.get_or_init(|| Context::build(parameters, tables)))
    }

    /// An owned, non-singleton `Context` with its own anonymous tables,
    /// independent of [`Context::create`]'s process-wide slot. Every unit
    /// test across this workspace that exercises dispatcher/mapping logic
    /// goes through this instead of `create`, since a real host process
    /// only ever calls `create`/`connect` once and the `'static` singleton
    /// would otherwise make every test after the first see leftover state
    /// from whichever test happened to initialize it.
    pub fn isolated(parameters: Parameters) -> Result<Context> {
        let tables = RedirectionTables::new()?;
        Ok(Context::build(parameters, tables))
    }

    /// `HookContext::get()`. Panics if neither `create` nor `connect` has
    /// run yet - a hook firing before `DllMain` finished attaching would be
    /// an engine bug, not a recoverable condition.
    pub fn get() -> &'static Context {
        CONTEXT.get().expect("usvfs context not initialized")
    }

    pub fn try_get() -> Option<&'static Context> {
        CONTEXT.get()
    }

    /// The "actual" current directory a caller last set through a hooked
    /// `SetCurrentDirectory`, distinct from the OS's own idea of it once a
    /// virtualized `SetCurrentDirectory` target does not exist physically.
    pub fn current_directory(&self) -> Option<String> {
        self.cwd.lock().unwrap().clone()
    }

    pub fn set_current_directory(&self, path: Option<String>) {
        *self.cwd.lock().unwrap() = path;
    }

    /// Link a file into both tables: the main table for forward lookups,
    /// the inverse table keyed by the physical path for `GetModuleFileName`
    /// and friends.
    pub fn link_file(&self, source_real: &str, dest_virtual: &str) -> Result<()> {
        self.tables.main.link_file(source_real, dest_virtual)?;
        self.tables.inverse.add_file(source_real, dest_virtual)?;
        Ok(())
    }

    pub fn link_directory_static(&self, source_real: &str, dest_virtual: &str, flags: u32) -> Result<()> {
        self.tables
            .main
            .link_directory_static(source_real, dest_virtual, flags)?;
        self.tables.inverse.add_file(source_real, dest_virtual)?;
        Ok(())
    }

    pub fn clear_mappings(&self) {
        self.tables.main.clear();
        self.tables.inverse.clear();
    }

    /// `log(...)` call sites throughout the hook dispatcher funnel here
    /// instead of calling `TraceRing::push` directly, so the level gate
    /// lives in one place.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if level >= self.parameters.log_level {
            self.log.push(message.into());
        }
    }

    /// Park a background task (e.g. the injected process's resume-after-DLL
    /// handshake) to be joined at `ExitProcess`/`DisconnectVFS` rather than
    /// detached, matching the original's "deferred completion tasks" list.
    pub fn defer(&self, handle: std::thread::JoinHandle<()>) {
        self.deferred.lock().unwrap().push(handle);
    }

    pub fn join_deferred(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.deferred.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ring_evicts_oldest_past_capacity() {
        let ring = TraceRing::new(2);
        ring.push("a".into());
        ring.push("b".into());
        ring.push("c".into());
        assert_eq!(ring.pop(false), Some("b".to_string()));
        assert_eq!(ring.pop(false), Some("c".to_string()));
        assert_eq!(ring.pop(false), None);
    }

    #[test]
    fn trace_ring_nonblocking_pop_on_empty_returns_none() {
        let ring = TraceRing::new(4);
        assert_eq!(ring.pop(false), None);
    }

    #[test]
    fn handle_map_round_trips_across_shards() {
        let map = HandleMap::new();
        map.insert(1, "C:\\mount".to_string());
        map.insert(17, "C:\\mount\\sub".to_string());
        assert_eq!(map.get(1).as_deref(), Some("C:\\mount"));
        assert_eq!(map.get(17).as_deref(), Some("C:\\mount\\sub"));
        assert_eq!(map.remove(1).as_deref(), Some("C:\\mount"));
        assert_eq!(map.get(1), None);
    }

    #[test]
    fn redirection_tables_select_chooses_main_or_inverse() {
        let tables = RedirectionTables::new().unwrap();
        tables.main.add_file(r"C:\np.exe", r"C:\real\np.exe").unwrap();
        tables.inverse.add_file(r"C:\real\np.exe", r"C:\np.exe").unwrap();
        assert!(tables.select(false).find_node(r"C:\np.exe").is_some());
        assert!(tables.select(true).find_node(r"C:\real\np.exe").is_some());
    }
}
