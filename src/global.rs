//! A process-wide file system, for programs that want a single one.
//!
//! [`init`] creates it and [`deinit`] drops it. Every failing call records its
//! [`ErrorCode`] as the calling thread's last error, which [`last_error_code`]
//! returns and clears.

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;

use crate::core::{ErrorCode, Result};
use crate::vfs::Vfs;

static STATE: Mutex<Option<Vfs>> = Mutex::new(None);

thread_local! {
    static LAST_ERROR: Cell<Option<ErrorCode>> = const { Cell::new(None) };
    // Set while this thread runs a `with_vfs` closure and so holds the lock.
    static IN_WITH_VFS: Cell<bool> = const { Cell::new(false) };
}

fn state() -> Result<MutexGuard<'static, Option<Vfs>>> {
    if IN_WITH_VFS.with(Cell::get) {
        return Err(ErrorCode::OtherError)
            .context("the process-wide file system is already in use by with_vfs on this thread");
    }
    // A panic while holding the lock leaves the Vfs itself consistent.
    Ok(STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
}

/// Clears `IN_WITH_VFS` when the closure returns or unwinds.
struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> ReentryGuard {
        IN_WITH_VFS.with(|flag| flag.set(true));
        ReentryGuard
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_WITH_VFS.with(|flag| flag.set(false));
    }
}

fn record<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        LAST_ERROR.with(|last| last.set(Some(ErrorCode::of(err))));
    }
    result
}

/// Initializes the process-wide file system. `argv0` should be the program's `argv[0]`.
pub fn init(argv0: &str) -> Result<()> {
    record(try_init(argv0))
}

fn try_init(argv0: &str) -> Result<()> {
    let mut state = state()?;
    if state.is_some() {
        return Err(ErrorCode::IsInitialized.into());
    }
    let argv0 = (!argv0.is_empty()).then_some(argv0);
    *state = Some(Vfs::init(argv0)?);
    tracing::debug!("process-wide file system initialized");
    Ok(())
}

/// Shuts the process-wide file system down. Mounts and the write dir are released.
pub fn deinit() -> Result<()> {
    record(try_deinit())
}

fn try_deinit() -> Result<()> {
    let vfs = state()?.take().ok_or(ErrorCode::NotInitialized)?;
    drop(vfs);
    tracing::debug!("process-wide file system deinitialized");
    Ok(())
}

pub fn is_init() -> bool {
    // Only a `with_vfs` closure can be refused, and it runs on an initialized state.
    state().map_or(true, |state| state.is_some())
}

/// Runs `f` on the process-wide file system.
///
/// The state stays locked while `f` runs: `f` must work on the `Vfs` it is given.
/// Calling back into this module from `f` fails instead of deadlocking.
pub fn with_vfs<T>(f: impl FnOnce(&mut Vfs) -> Result<T>) -> Result<T> {
    record(try_with_vfs(f))
}

fn try_with_vfs<T>(f: impl FnOnce(&mut Vfs) -> Result<T>) -> Result<T> {
    let mut state = state()?;
    let Some(vfs) = state.as_mut() else {
        return Err(ErrorCode::NotInitialized).context("the file system is not initialized");
    };
    let _guard = ReentryGuard::enter();
    f(vfs)
}

/// See [`Vfs::user_dir`].
pub fn user_dir() -> Result<String> {
    with_vfs(|vfs| Ok(vfs.user_dir().to_string()))
}

/// See [`Vfs::base_dir`].
pub fn base_dir() -> Result<String> {
    with_vfs(|vfs| Ok(vfs.base_dir().to_string()))
}

/// See [`Vfs::pref_dir`].
pub fn pref_dir(org: &str, app: &str) -> Result<String> {
    with_vfs(|vfs| vfs.pref_dir(org, app))
}

/// Returns and clears the calling thread's last error.
pub fn last_error_code() -> Option<ErrorCode> {
    LAST_ERROR.with(|last| last.take())
}

/// Message of the calling thread's last error, which is cleared.
pub fn last_error() -> Option<String> {
    last_error_code().map(|code| code.to_string())
}
