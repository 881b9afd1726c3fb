use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::BridgeError;

/// A request for the worker to process `len` frames of one half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Job {
    half: usize,
    len: usize,
}

#[derive(Debug, Default)]
struct Handoff {
    // At most one job per half, so this never grows past 2.
    pending: VecDeque<Job>,
    busy: bool,
    shutdown: bool,
}

impl Handoff {
    /// Queue `job`, replacing a job already queued for the same half.
    fn queue(&mut self, job: Job) {
        if let Some(queued) = self.pending.iter_mut().find(|j| j.half == job.half) {
            queued.len = job.len;
        } else {
            self.pending.push_back(job);
        }
    }
}

/// Two halves of channel-major sample data shared by the render side and a
/// worker thread.
pub(crate) struct DoubleBuffer {
    channels: usize,
    half_len: usize,
    halves: [Mutex<Box<[f32]>>; 2],
    handoff: Mutex<Handoff>,
    cond: Condvar,
    /// Full halves the render side could not hand off without waiting.
    deferred: [AtomicBool; 2],
    /// Render-side position in `0..2 * half_len`.
    pub(crate) cursor: AtomicUsize,
}

impl DoubleBuffer {
    fn new(channels: usize, half_len: usize) -> Self {
        assert!(channels > 0);
        assert!(half_len > 0);

        let half = || Mutex::new(vec![0.0; channels * half_len].into_boxed_slice());

        Self {
            channels,
            half_len,
            halves: [half(), half()],
            handoff: Mutex::new(Handoff {
                pending: VecDeque::with_capacity(2),
                ..Default::default()
            }),
            cond: Condvar::new(),
            deferred: [AtomicBool::new(false), AtomicBool::new(false)],
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels
    }

    pub(crate) fn half_len(&self) -> usize {
        self.half_len
    }

    /// Locks one half without blocking. Returns `None` while the worker holds it.
    pub(crate) fn try_half(&self, half: usize) -> Option<MutexGuard<'_, Box<[f32]>>> {
        self.halves[half].try_lock()
    }

    /// Asks the worker to process the first `len` frames of `half`.
    ///
    /// A job already queued for the same half is replaced. This may wait
    /// for the handoff lock, so the render side uses
    /// [`DoubleBuffer::submit_full`] instead.
    pub(crate) fn submit(&self, half: usize, len: usize) {
        let mut handoff = self.handoff.lock();
        self.take_deferred(&mut handoff);
        handoff.queue(Job { half, len });
        self.cond.notify_all();
    }

    /// Hands a full half to the worker without waiting.
    ///
    /// If the handoff lock is contended, the half is marked as deferred and
    /// picked up by the next [`DoubleBuffer::retry_deferred`] or by the
    /// control side.
    pub(crate) fn submit_full(&self, half: usize) {
        self.deferred[half].store(true, Ordering::Release);
        self.retry_deferred();
    }

    /// Queues deferred halves if the handoff lock is free right now.
    pub(crate) fn retry_deferred(&self) {
        if !self.deferred.iter().any(|d| d.load(Ordering::Acquire)) {
            return;
        }
        if let Some(mut handoff) = self.handoff.try_lock() {
            self.take_deferred(&mut handoff);
            self.cond.notify_all();
        }
    }

    fn take_deferred(&self, handoff: &mut Handoff) {
        for (half, deferred) in self.deferred.iter().enumerate() {
            if deferred.swap(false, Ordering::AcqRel) {
                handoff.queue(Job {
                    half,
                    len: self.half_len,
                });
            }
        }
    }

    /// Blocks until the worker has nothing queued and is not running a job.
    pub(crate) fn wait_idle(&self) {
        let mut handoff = self.handoff.lock();
        self.take_deferred(&mut handoff);
        self.cond.notify_all();
        while (handoff.busy || !handoff.pending.is_empty()) && !handoff.shutdown {
            self.cond.wait(&mut handoff);
        }
    }

    fn shutdown(&self) {
        self.handoff.lock().shutdown = true;
        self.cond.notify_all();
    }

    fn run<F>(&self, mut work: F)
    where
        F: FnMut(&mut [&mut [f32]], usize),
    {
        let mut handoff = self.handoff.lock();

        loop {
            if handoff.shutdown {
                return;
            }

            let Some(job) = handoff.pending.pop_front() else {
                self.cond.wait(&mut handoff);
                continue;
            };

            handoff.busy = true;
            MutexGuard::unlocked(&mut handoff, || {
                let mut data = self.halves[job.half].lock();
                let mut channels: Vec<&mut [f32]> = data
                    .chunks_mut(self.half_len)
                    .map(|ch| &mut ch[..job.len])
                    .collect();

                work(&mut channels, job.len);
            });
            handoff.busy = false;

            self.cond.notify_all();
        }
    }
}

/// Owns the worker thread of a bridge. Dropping it stops and joins the worker.
pub(crate) struct Worker {
    shared: Arc<DoubleBuffer>,
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(
        name: &'static str,
        channels: usize,
        half_len: usize,
        work: F,
    ) -> Result<Self, BridgeError>
    where
        F: FnMut(&mut [&mut [f32]], usize) + Send + 'static,
    {
        let shared = Arc::new(DoubleBuffer::new(channels, half_len));

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || thread_shared.run(work))?;

        log::debug!("{name} worker started ({channels} channels, {half_len} frames per half)");

        Ok(Self {
            shared,
            name,
            handle: Some(handle),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<DoubleBuffer> {
        &self.shared
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shared.shutdown();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }

        log::debug!("{} worker stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_for_the_same_half_are_merged() {
        let buf = DoubleBuffer::new(1, 4);
        buf.submit(0, 4);
        buf.submit(1, 4);
        buf.submit(0, 2);

        let handoff = buf.handoff.lock();
        assert_eq!(
            handoff.pending.iter().copied().collect::<Vec<_>>(),
            vec![Job { half: 0, len: 2 }, Job { half: 1, len: 4 }]
        );
    }

    #[test]
    fn contended_handoffs_are_deferred_not_waited_on() {
        let buf = DoubleBuffer::new(1, 4);

        {
            let _held = buf.handoff.lock();
            buf.submit_full(1);
        }
        assert!(buf.deferred[1].load(Ordering::Relaxed));
        assert!(buf.handoff.lock().pending.is_empty());

        buf.retry_deferred();
        assert!(!buf.deferred[1].load(Ordering::Relaxed));
        assert_eq!(
            buf.handoff.lock().pending.iter().copied().collect::<Vec<_>>(),
            vec![Job { half: 1, len: 4 }]
        );
    }

    #[test]
    fn control_side_collects_deferred_halves_first() {
        let buf = DoubleBuffer::new(1, 4);
        buf.deferred[0].store(true, Ordering::Relaxed);
        buf.submit(1, 2);

        assert_eq!(
            buf.handoff.lock().pending.iter().copied().collect::<Vec<_>>(),
            vec![Job { half: 0, len: 4 }, Job { half: 1, len: 2 }]
        );
    }

    #[test]
    fn worker_sees_channel_slices_of_the_requested_length() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_worker = Arc::clone(&seen);

        let worker = Worker::spawn("test", 3, 8, move |channels, len| {
            seen_in_worker
                .lock()
                .push((channels.len(), channels[0].len(), len));
            for (i, ch) in channels.iter_mut().enumerate() {
                ch.fill(i as f32);
            }
        })
        .unwrap();

        worker.shared().submit(1, 5);
        worker.shared().wait_idle();

        assert_eq!(*seen.lock(), vec![(3, 5, 5)]);

        let half = worker.shared().try_half(1).unwrap();
        assert_eq!(&half[..5], &[0.0; 5]);
        assert_eq!(&half[5..8], &[0.0; 3]);
        assert_eq!(&half[8..13], &[1.0; 5]);
        assert_eq!(&half[16..21], &[2.0; 5]);
    }

    #[test]
    fn dropping_the_worker_joins_it() {
        let worker = Worker::spawn("test", 1, 4, |_, _| {}).unwrap();
        let shared = Arc::clone(worker.shared());
        drop(worker);

        assert!(shared.handoff.lock().shutdown);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
