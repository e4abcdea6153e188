//! Request worker (C9): a single FIFO consumer of post-save side effects.

use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use crate::command;

const QUEUE_CAPACITY: usize = 100;

/// A post-save side effect, enqueued by `Editor::save` and consumed strictly
/// FIFO by the worker thread.
#[derive(Debug, Clone)]
pub enum Request {
    Sleep { delay_ms: u64 },
    Sync { path: PathBuf },
    Restart { service: String },
}

/// Owns the post-save request queue and the thread draining it. The queue is
/// bounded; enqueueing blocks (applying back-pressure to `Save`) rather than
/// silently dropping a restart request.
pub struct RequestWorker {
    sender: Option<SyncSender<Request>>,
    handle: Option<JoinHandle<()>>,
}

impl RequestWorker {
    pub fn start() -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Request>(QUEUE_CAPACITY);
        let handle = std::thread::spawn(move || {
            while let Ok(request) = receiver.recv() {
                process(request);
            }
        });
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Enqueues `request`. Blocks if the queue is full.
    pub fn enqueue(&self, request: Request) {
        match self.sender.as_ref() {
            Some(sender) if sender.send(request).is_ok() => {}
            _ => warn!("post-save request worker is no longer running"),
        }
    }

    /// Closes the queue and waits for the worker to drain remaining items.
    pub fn stop(&mut self) {
        self.sender = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RequestWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process(request: Request) {
    match request {
        Request::Sleep { delay_ms } => {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }
        Request::Sync { path } => {
            let argv = vec!["sync".to_string(), path.display().to_string()];
            if let Err(e) = command::run_command(false, &[], &argv) {
                warn!(path = %path.display(), error = %e, "sync failed");
            }
        }
        Request::Restart { service } => {
            let argv = vec![
                "systemctl".to_string(),
                "reload-or-restart".to_string(),
                service.clone(),
            ];
            if let Err(e) = command::run_command(false, &[], &argv) {
                warn!(service = service, error = %e, "service restart failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_request_blocks_for_the_given_duration() {
        let start = std::time::Instant::now();
        process(Request::Sleep { delay_ms: 20 });
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn worker_drains_queue_on_stop() {
        let mut worker = RequestWorker::start();
        worker.enqueue(Request::Sleep { delay_ms: 1 });
        worker.stop();
    }
}
