//! Recording tap: raw datagrams appended to a segment file by a dedicated
//! thread. The feed queue is bounded; overflow drops the datagram and
//! counts it, never blocking the receive path.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use verge_types::segment::SegmentWriter;

pub const TAP_QUEUE_CAPACITY: usize = 100;
const TAP_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct TapHandle {
    tx: crossbeam_channel::Sender<Vec<u8>>,
    dropped: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl TapHandle {
    /// Forward one datagram copy. Never blocks.
    pub fn offer(&self, datagram: &[u8]) {
        match self.tx.try_send(datagram.to_vec()) {
            Ok(()) => {}
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                let total = self
                    .dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                if total % 100 == 1 {
                    warn!("tap queue full, {total} datagrams dropped so far");
                }
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Open a fresh segment file and start the writer thread. The thread exits
/// when every `TapHandle` is gone.
pub fn spawn_tap_writer<P: AsRef<Path>>(
    path: P,
) -> std::io::Result<(TapHandle, std::thread::JoinHandle<()>)> {
    let fd = std::io::BufWriter::new(std::fs::File::create(path.as_ref())?);
    let mut writer = SegmentWriter::new(fd).map_err(std::io::Error::other)?;
    info!("packet tap recording to {}", path.as_ref().display());

    let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(TAP_QUEUE_CAPACITY);
    let join = std::thread::Builder::new()
        .name("verge-tap-writer".to_string())
        .spawn(move || {
            let mut last_flush = Instant::now();
            let mut written: u64 = 0;
            loop {
                match rx.recv_timeout(TAP_FLUSH_INTERVAL) {
                    Ok(datagram) => {
                        if let Err(e) = writer.write_datagram(&datagram) {
                            error!("tap write failed, stopping tap: {e}");
                            break;
                        }
                        written += 1;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
                if last_flush.elapsed() >= TAP_FLUSH_INTERVAL {
                    if let Err(e) = writer.flush() {
                        error!("tap flush failed: {e}");
                    }
                    last_flush = Instant::now();
                }
            }
            let _ = writer.flush();
            info!("tap writer exiting after {written} datagrams");
        })?;

    Ok((
        TapHandle {
            tx,
            dropped: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        },
        join,
    ))
}
