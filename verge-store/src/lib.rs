//! SQLite persistence for the verge pipeline.
//!
//! The embedded database has a single-writer constraint, so all writes go
//! through one dedicated OS thread fed by a bounded channel. Readers open
//! their own read-only connections.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use verge_types::{
    BackgroundSnapshotRow, ForegroundClusterRow, SensorFrameRow, TrackObservationRow, TrackRow,
};

pub mod queries;
mod schema;
mod writer;

pub use schema::{ensure_schema, SCHEMA_VERSION};
pub use writer::writer_thread_main;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("database at {path} has a dirty schema (version {version}); refusing to touch it")]
    DirtySchema { path: PathBuf, version: i64 },
    #[error(
        "database schema version {actual} is newer than this binary supports ({supported})"
    )]
    SchemaTooNew { actual: i64, supported: i64 },
    #[error("store writer thread failed to start: {source}")]
    ThreadSpawn { source: std::io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One unit of work for the writer thread.
#[derive(Debug, Clone)]
pub enum StoreMsg {
    Frame(SensorFrameRow),
    Clusters(Vec<ForegroundClusterRow>),
    Observation(TrackObservationRow),
    UpsertTrack(TrackRow),
    Snapshot(BackgroundSnapshotRow),
    /// Finish pending work and exit the writer thread.
    QuitNow,
}

/// Open (and if necessary bootstrap) the database for writing.
///
/// Fails with [`Error::DirtySchema`] when a migration left the database in
/// a non-recoverable state; startup must abort in that case rather than
/// mutate anything.
pub fn open_store<P: AsRef<Path>>(path: P) -> Result<rusqlite::Connection> {
    let path = path.as_ref();
    let conn = rusqlite::Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::ensure_schema(&conn, path)?;
    Ok(conn)
}

/// Open a read-only connection for queries.
pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    Ok(conn)
}

/// Handle through which the pipeline feeds the writer thread.
///
/// The channel is bounded; when the writer falls behind, `send` blocks the
/// caller, which is how back-pressure reaches the processor.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: crossbeam_channel::Sender<StoreMsg>,
}

impl StoreHandle {
    pub fn send(&self, msg: StoreMsg) {
        if self.tx.send(msg).is_err() {
            // Writer already exited; during shutdown this is expected.
            error!("store writer is gone; dropping write");
        }
    }

    pub fn quit(&self) {
        let _ = self.tx.send(StoreMsg::QuitNow);
    }
}

/// Open the database and start the single writer thread.
pub fn spawn_store_writer<P: AsRef<Path>>(
    path: P,
    queue_capacity: usize,
) -> Result<(StoreHandle, std::thread::JoinHandle<Result<()>>)> {
    let conn = open_store(&path)?;
    info!("store open at {}", path.as_ref().display());

    let (tx, rx) = crossbeam_channel::bounded(queue_capacity);
    let join = std::thread::Builder::new()
        .name("verge-store-writer".to_string())
        .spawn(move || writer::writer_thread_main(conn, rx))
        .map_err(|source| Error::ThreadSpawn { source })?;

    Ok((StoreHandle { tx }, join))
}
