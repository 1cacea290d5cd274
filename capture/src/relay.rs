//! Broadcast relay – drains the transcoder's output and fans every chunk
//! out to the connected viewers, unmodified and in order.
//!
//! ```text
//! [transcoder stdout] --read(CHUNK_SIZE)--> [relay thread] --try_send--> [viewer queues]
//! ```
//!
//! The relay never blocks on a viewer: a full queue evicts that viewer and
//! a closed queue is skipped, so one bad client cannot stall the others.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::viewers::ViewerRegistry;

/// Totals reported when the relay loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: u64,
    pub bytes: u64,
    pub evictions: u64,
}

/// Start the relay on its own thread.
///
/// `finished` is cancelled when the loop ends so the lifecycle controller
/// notices a transcoder that died mid-run.
pub fn spawn<R>(
    source: R,
    registry: Arc<ViewerRegistry>,
    chunk_size: usize,
    finished: CancellationToken,
) -> std::io::Result<JoinHandle<RelayStats>>
where
    R: Read + Send + 'static,
{
    std::thread::Builder::new()
        .name("broadcast".into())
        .spawn(move || {
            let stats = run(source, &registry, chunk_size);
            finished.cancel();
            stats
        })
}

/// Relay until the source reaches end-of-stream. Consumes and closes `source`.
pub fn run<R: Read>(mut source: R, registry: &ViewerRegistry, chunk_size: usize) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        match source.read(&mut buf) {
            // The transcoder only closes stdout when it exits.
            Ok(0) => {
                info!("Transcoder output ended");
                break;
            }
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let report = registry.broadcast(&chunk);
                stats.chunks += 1;
                stats.bytes += n as u64;
                if report.evicted > 0 {
                    stats.evictions += report.evicted as u64;
                    warn!("{} viewer(s) evicted for falling behind", report.evicted);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Cannot read transcoder output: {e}");
                break;
            }
        }
    }

    drop(source);
    info!(
        "Broadcast relay finished ({} chunks, {} bytes)",
        stats.chunks, stats.bytes
    );
    stats
}
