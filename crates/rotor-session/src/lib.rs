//! Durable engine state (versioned compare-and-swap records) and browser
//! session snapshots.

mod fs_util;
pub mod session_store;
pub mod state_store;

use std::path::Path;
use std::sync::Arc;

use rotor_config::{SessionBackend, SessionStoreConfig};

pub use session_store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use state_store::{
    FileStateStore, MemoryStateStore, StateStore, VersionedRecord, load_typed, update_typed,
};

/// Build the state store selected by `[session_store].backend`.
pub fn open_state_store(config: &SessionStoreConfig, state_dir: &Path) -> Arc<dyn StateStore> {
    match config.backend {
        SessionBackend::File => Arc::new(FileStateStore::new(state_dir.join("state"))),
        SessionBackend::Memory => Arc::new(MemoryStateStore::new()),
    }
}

/// Build the session snapshot store selected by `[session_store]`.
pub fn open_session_store(config: &SessionStoreConfig, state_dir: &Path) -> Arc<dyn SessionStore> {
    match config.backend {
        SessionBackend::File => Arc::new(FileSessionStore::new(
            state_dir.join("sessions"),
            config.ttl(),
        )),
        SessionBackend::Memory => Arc::new(MemorySessionStore::new(config.ttl())),
    }
}
