//! Process-wide sync handle for applications that want a single instance.
//!
//! Install once at startup, after the runtime and engine exist.

use once_cell::sync::OnceCell;

use tideline_common::{Error, Result};

use crate::handle::SyncHandle;

static SHARED: OnceCell<SyncHandle> = OnceCell::new();

/// Install the process-wide handle.
///
/// # Errors
/// - A handle is already installed
pub fn install(handle: SyncHandle) -> Result<()> {
    SHARED
        .set(handle)
        .map_err(|_| Error::InvalidInput("Sync handle already installed".to_string()))
}

/// Get the process-wide handle, if one was installed.
pub fn handle() -> Option<&'static SyncHandle> {
    SHARED.get()
}
