//! Copy stream
//!
//! Device → pinned host copies on a dedicated thread, decoupled from the
//! caller's compute thread. Finished copies are handed back over a channel
//! and submitted to disk by the writer on the caller's thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::error::{OffloadError, Result};
use crate::memory::{DeviceBuffer, PinnedBuffer};

/// One device payload headed for `offset`
pub(crate) struct CopyJob {
    pub source: Arc<dyn DeviceBuffer>,
    pub staging: PinnedBuffer,
    pub offset: u64,
}

/// A copy that has run; `result` tells whether `staging` holds the payload
pub(crate) struct StagedCopy {
    pub source: Arc<dyn DeviceBuffer>,
    pub staging: PinnedBuffer,
    pub offset: u64,
    pub result: io::Result<()>,
}

impl StagedCopy {
    pub fn len(&self) -> usize {
        self.source.nbytes()
    }
}

/// Worker thread running device → host copies in submission order
pub(crate) struct CopyStream {
    jobs: Option<Sender<CopyJob>>,
    finished: Receiver<StagedCopy>,
    worker: Option<JoinHandle<()>>,

    /// Jobs sent whose result has not been received yet
    pending: usize,
}

impl CopyStream {
    const THREAD_NAME: &'static str = "offload-copy";

    pub fn spawn() -> Result<Self> {
        let (job_tx, job_rx) = channel::unbounded::<CopyJob>();
        let (done_tx, done_rx) = channel::unbounded::<StagedCopy>();

        let worker = thread::Builder::new()
            .name(Self::THREAD_NAME.to_string())
            .spawn(move || run_copies(job_rx, done_tx))?;

        tracing::debug!("copy stream started");

        Ok(Self {
            jobs: Some(job_tx),
            finished: done_rx,
            worker: Some(worker),
            pending: 0,
        })
    }

    pub fn enqueue(&mut self, job: CopyJob) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| OffloadError::Staging("copy stream is shut down".to_string()))?;
        jobs.send(job)
            .map_err(|_| OffloadError::Staging("copy stream worker exited".to_string()))?;
        self.pending += 1;
        Ok(())
    }

    /// Copies that have already finished
    pub fn try_finished(&mut self) -> Vec<StagedCopy> {
        let mut done = Vec::new();
        while self.pending > 0 {
            match self.finished.try_recv() {
                Ok(copy) => {
                    self.pending -= 1;
                    done.push(copy);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        done
    }

    /// Block until every queued copy has finished
    pub fn wait_finished(&mut self) -> Result<Vec<StagedCopy>> {
        let mut done = Vec::with_capacity(self.pending);
        while self.pending > 0 {
            let copy = self
                .finished
                .recv()
                .map_err(|_| OffloadError::Staging("copy stream worker exited".to_string()))?;
            self.pending -= 1;
            done.push(copy);
        }
        Ok(done)
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}

impl Drop for CopyStream {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("copy stream worker panicked");
            }
        }
    }
}

fn run_copies(jobs: Receiver<CopyJob>, finished: Sender<StagedCopy>) {
    for mut job in jobs.iter() {
        let len = job.source.nbytes();
        let result = job.source.copy_to_host(&mut job.staging.as_mut_slice()[..len]);
        let copy = StagedCopy {
            source: job.source,
            staging: job.staging,
            offset: job.offset,
            result,
        };
        if finished.send(copy).is_err() {
            break;
        }
    }
}
