//! Follow mode: tail a capture file while it is being written.
//!
//! A reader task ingests records into a shared [`Db`] as they appear; the
//! calling task flushes updated snapshots on a fixed interval. Following
//! stops once the capture is exhausted and its root span has completed, or
//! on Ctrl-C.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use huginn_trace::{CaptureRecord, Db, SnapshotWriter, ingest_records};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FollowOptions {
    pub flush_interval: Duration,
    pub batch_size: usize,
}

impl Default for FollowOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            batch_size: 64,
        }
    }
}

/// Follow `path`, returning the number of snapshot batches written.
pub async fn follow_capture<W: Write>(
    path: &Path,
    db: Arc<Mutex<Db>>,
    mut writer: Option<SnapshotWriter<W>>,
    opts: FollowOptions,
) -> Result<usize> {
    let reader = tokio::spawn(read_into(
        path.to_path_buf(),
        Arc::clone(&db),
        opts.clone(),
    ));
    let mut ticker = tokio::time::interval(opts.flush_interval);
    let mut written = 0;

    let outcome = loop {
        tokio::select! {
            _ = ticker.tick() => {
                written += flush(&db, writer.as_mut()).await?;
                if reader.is_finished() {
                    break reader.await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, flushing remaining snapshots");
                reader.abort();
                break Ok(Ok(()));
            }
        }
    };
    outcome.context("Capture reader task failed")??;

    written += flush(&db, writer.as_mut()).await?;
    if let Some(writer) = writer {
        writer.into_inner()?;
    }
    Ok(written)
}

async fn flush<W: Write>(db: &Mutex<Db>, writer: Option<&mut SnapshotWriter<W>>) -> Result<usize> {
    let batch = db.lock().await.updated_snapshots(None);
    let Some(writer) = writer else {
        return Ok(0);
    };
    if !batch.is_empty() {
        debug!(spans = batch.len(), "Flushing snapshots");
    }
    Ok(usize::from(writer.write_batch(&batch)?))
}

async fn read_into(path: PathBuf, db: Arc<Mutex<Db>>, opts: FollowOptions) -> Result<()> {
    let file = File::open(&path)
        .await
        .with_context(|| format!("Failed to open capture: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    // bytes of a record whose newline has not been written yet
    let mut pending = Vec::new();
    let mut batch = Vec::with_capacity(opts.batch_size);
    let mut stalled = false;

    loop {
        let read = reader.read_until(b'\n', &mut pending).await?;
        if pending.ends_with(b"\n") {
            parse_record(&pending, &mut batch);
            pending.clear();
            stalled = false;
            if batch.len() >= opts.batch_size {
                ingest_records(&mut *db.lock().await, batch.drain(..));
            }
            continue;
        }
        if read > 0 {
            stalled = false;
        }

        if !batch.is_empty() {
            ingest_records(&mut *db.lock().await, batch.drain(..));
        }
        if root_finished(&*db.lock().await) {
            if pending.is_empty() {
                debug!(path = %path.display(), "Capture complete");
                return Ok(());
            }
            if stalled {
                // nothing more arrived; take the unterminated tail as it is
                parse_record(&pending, &mut batch);
                ingest_records(&mut *db.lock().await, batch.drain(..));
                debug!(path = %path.display(), "Capture complete without trailing newline");
                return Ok(());
            }
            stalled = true;
        }
        tokio::time::sleep(opts.flush_interval).await;
    }
}

fn parse_record(line: &[u8], batch: &mut Vec<CaptureRecord>) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match serde_json::from_slice::<CaptureRecord>(line) {
        Ok(record) => batch.push(record),
        Err(e) => warn!(error = %e, "Skipping malformed capture line"),
    }
}

fn root_finished(db: &Db) -> bool {
    db.root_span
        .and_then(|id| db.span(&id))
        .is_some_and(|root| !root.is_running())
}
