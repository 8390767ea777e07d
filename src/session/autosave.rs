//! Debounced session writer.
//!
//! Approvals arrive in bursts (keyboard-driven review goes fast), and each
//! one schedules a save. The writer thread coalesces snapshots that land
//! within the debounce window and writes only the newest, so the control
//! thread never blocks on disk and a burst costs one write. Snapshots are
//! fully serialized documents; the thread never touches live session state.

use std::{
    path::PathBuf,
    sync::mpsc::{RecvTimeoutError, Sender, channel},
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, error};

use super::document::{SessionDocument, write_document};

/// Quiet period required before a scheduled snapshot hits the disk.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

struct WriteRequest {
    document: SessionDocument,
    path: PathBuf,
}

/// Fire-and-forget writer owning a dedicated thread. Dropping it flushes any
/// pending snapshot.
pub(crate) struct DebouncedWriter {
    tx: Option<Sender<WriteRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl DebouncedWriter {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = channel::<WriteRequest>();
        let handle = std::thread::spawn(move || {
            while let Ok(mut request) = rx.recv() {
                // Keep absorbing newer snapshots until the window stays quiet.
                loop {
                    match rx.recv_timeout(DEBOUNCE_WINDOW) {
                        Ok(newer) => request = newer,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            write(request);
                            return;
                        }
                    }
                }
                write(request);
            }
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue `document` to be written to `path` after the debounce window.
    pub(crate) fn schedule(&self, document: SessionDocument, path: PathBuf) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WriteRequest { document, path });
        }
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write(request: WriteRequest) {
    match write_document(&request.path, &request.document) {
        Ok(()) => debug!("Session autosaved to {}", request.path.display()),
        Err(err) => error!("Session autosave failed: {err}"),
    }
}
