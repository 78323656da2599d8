//! Per-disk helper thread
//!
//! Runs the anticipation timer of one BFQ disk context. The thread only
//! holds a weak reference to its target and exits on `kill` or once the
//! target is gone.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Receiver of anticipation timeouts
pub(crate) trait TimerTarget: Send + Sync + 'static {
    /// The timer armed with `epoch` expired
    fn as_timeout(&self, epoch: u64);
}

#[derive(Debug)]
enum HelperMsg {
    Arm { epoch: u64, after: Duration },
    Disarm,
    Kill,
}

pub(crate) struct Helper {
    tx: Sender<HelperMsg>,
    rx: Receiver<HelperMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Helper {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the thread serving `target`
    pub(crate) fn start<T: TimerTarget>(&self, name: &str, target: Weak<T>) -> io::Result<()> {
        let rx = self.rx.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&rx, &target))?;
        *self.handle.lock() = Some(handle);
        debug!(thread = name, "bfq helper thread started");
        Ok(())
    }

    /// (Re)arm the timer; a pending one is replaced
    pub(crate) fn arm(&self, epoch: u64, after: Duration) {
        let _ = self.tx.send(HelperMsg::Arm { epoch, after });
    }

    pub(crate) fn disarm(&self) {
        let _ = self.tx.send(HelperMsg::Disarm);
    }

    /// Stop the thread and wait for it
    pub(crate) fn kill(&self) {
        let _ = self.tx.send(HelperMsg::Kill);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        // The helper may drop the last reference to its target itself
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("bfq helper thread panicked");
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        self.kill();
    }
}

fn run<T: TimerTarget>(rx: &Receiver<HelperMsg>, target: &Weak<T>) {
    let mut armed: Option<(u64, Instant)> = None;
    loop {
        let msg = match armed {
            Some((_, deadline)) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(HelperMsg::Arm { epoch, after }) => {
                trace!(epoch, ?after, "anticipation timer armed");
                armed = Some((epoch, Instant::now() + after));
            }
            Ok(HelperMsg::Disarm) => armed = None,
            Ok(HelperMsg::Kill) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let Some((epoch, _)) = armed.take() else {
                    continue;
                };
                let Some(target) = target.upgrade() else {
                    break;
                };
                target.as_timeout(epoch);
            }
        }
    }
    trace!("bfq helper thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Fired(Mutex<Vec<u64>>);

    impl TimerTarget for Fired {
        fn as_timeout(&self, epoch: u64) {
            self.0.lock().push(epoch);
        }
    }

    fn wait_for(target: &Fired, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while target.0.lock().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_timer_fires_with_epoch() {
        let target = Arc::new(Fired::default());
        let helper = Helper::new();
        helper.start("bfq-test", Arc::downgrade(&target)).unwrap();

        helper.arm(7, Duration::from_millis(5));
        wait_for(&target, 1);
        assert_eq!(*target.0.lock(), vec![7]);

        // Rearming replaces the pending timer
        helper.arm(8, Duration::from_secs(60));
        helper.arm(9, Duration::from_millis(5));
        wait_for(&target, 2);
        assert_eq!(*target.0.lock(), vec![7, 9]);
        helper.kill();
    }

    #[test]
    fn test_disarm_and_kill() {
        let target = Arc::new(Fired::default());
        let helper = Helper::new();
        helper.start("bfq-test", Arc::downgrade(&target)).unwrap();

        helper.arm(1, Duration::from_millis(20));
        helper.disarm();
        thread::sleep(Duration::from_millis(60));
        assert!(target.0.lock().is_empty());

        helper.kill();
        assert!(helper.handle.lock().is_none());
        // Killing twice is harmless
        helper.kill();
    }
}
