use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};

use crate::error::WorkerError;
use crate::queue::attempt::{self, AttemptContext, AttemptReport};
use crate::queue::job::Job;

pub struct WorkerPool {
    job_sender: Sender<Job>,
    report_receiver: Receiver<AttemptReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` attempt workers sharing one context.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(ctx: Arc<AttemptContext>, worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (job_sender, job_receiver) = bounded::<Job>(worker_count * 2);
        let (report_sender, report_receiver) = bounded::<AttemptReport>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let report_tx = report_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_ctx = Arc::clone(&ctx);

            let handle = thread::spawn(move || {
                run_worker(worker_id, job_rx, report_tx, shutdown_flag, worker_ctx);
            });
            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            job_sender,
            report_receiver,
            workers,
            shutdown,
        }
    }

    pub fn submit(&self, job: Job) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }
        self.job_sender
            .send(job)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    pub fn recv_report(&self) -> Option<AttemptReport> {
        self.report_receiver.recv().ok()
    }

    pub fn try_recv_report(&self) -> Option<AttemptReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn wait(self) {
        // Dropping the sender lets idle workers exit immediately.
        drop(self.job_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<Job>,
    report_sender: Sender<AttemptReport>,
    shutdown: Arc<AtomicBool>,
    ctx: Arc<AttemptContext>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(job) => {
                debug!(
                    "Worker {} attempting job {} (attempt {})",
                    worker_id, job.id, job.attempt_count
                );
                let report = attempt::run_attempt(&ctx, &job);
                if let Err(e) = report_sender.send(report) {
                    error!("Worker {} failed to send report: {}", worker_id, e);
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
