//! Block I/O requests
//!
//! A [`Bio`] is consumed by [`Bio::complete`], so its completion callback can
//! fire at most once. A bio that is dropped without being completed is
//! completed with [`BioStatus::Cancelled`] on drop, so the issuer always
//! hears back exactly once.
//!
//! Layers between the issuer and the device push completion hooks
//! ([`Bio::push_hook`]). Hooks run in reverse push order, before the
//! issuer's callback.

use crate::context::ThreadCtx;
use dsched_common::{BioCmd, BioId, BioStatus, IoOwner, TdioId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

static NEXT_BIO_ID: AtomicU64 = AtomicU64::new(1);

/// Hook run when a bio completes, before the issuer's callback
pub type CompletionHook = Box<dyn FnOnce(&BioCompletion) + Send>;

/// The issuer's completion callback
pub type CompletionCallback = Box<dyn FnOnce(BioCompletion) + Send>;

/// Correlation record routing one bio through the framework
#[derive(Debug, Clone)]
pub struct DschedObject {
    /// Disk the bio was queued on
    pub disk: Arc<str>,
    /// The bio this record belongs to
    pub bio: BioId,
    /// Process or thread that issued the bio
    pub owner: IoOwner,
    /// Per-disk context of the issuer
    pub tdio: TdioId,
    /// Admission time
    pub queued_at: Instant,
}

/// Outcome of a bio as seen by hooks and the issuer
#[derive(Debug, Clone)]
pub struct BioCompletion {
    pub id: BioId,
    pub cmd: BioCmd,
    pub offset: u64,
    pub size: u64,
    pub status: BioStatus,
    /// Bytes not transferred
    pub resid: u64,
    pub dsched: Option<DschedObject>,
}

/// A block I/O request
pub struct Bio {
    id: BioId,
    cmd: BioCmd,
    offset: u64,
    size: u64,
    owner: Option<Arc<ThreadCtx>>,
    dsched: Option<DschedObject>,
    hooks: Vec<CompletionHook>,
    done: Option<CompletionCallback>,
}

impl Bio {
    #[must_use]
    pub fn new(cmd: BioCmd, offset: u64, size: u64) -> Self {
        Self {
            id: BioId(NEXT_BIO_ID.fetch_add(1, Ordering::Relaxed)),
            cmd,
            offset,
            size,
            owner: None,
            dsched: None,
            hooks: Vec::new(),
            done: None,
        }
    }

    #[must_use]
    pub fn read(offset: u64, size: u64) -> Self {
        Self::new(BioCmd::Read, offset, size)
    }

    #[must_use]
    pub fn write(offset: u64, size: u64) -> Self {
        Self::new(BioCmd::Write, offset, size)
    }

    #[must_use]
    pub fn flush() -> Self {
        Self::new(BioCmd::Flush, 0, 0)
    }

    /// Set the issuer's completion callback
    #[must_use]
    pub fn on_complete(mut self, done: impl FnOnce(BioCompletion) + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    #[must_use]
    pub const fn id(&self) -> BioId {
        self.id
    }

    #[must_use]
    pub const fn cmd(&self) -> BioCmd {
        self.cmd
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// I/O context the bio is charged to
    #[must_use]
    pub const fn owner(&self) -> Option<&Arc<ThreadCtx>> {
        self.owner.as_ref()
    }

    pub(crate) fn set_owner(&mut self, owner: Arc<ThreadCtx>) {
        self.owner = Some(owner);
    }

    #[must_use]
    pub const fn dsched(&self) -> Option<&DschedObject> {
        self.dsched.as_ref()
    }

    pub(crate) fn set_dsched(&mut self, object: DschedObject) {
        self.dsched = Some(object);
    }

    pub(crate) fn clear_dsched(&mut self) -> Option<DschedObject> {
        self.dsched.take()
    }

    /// Register a hook to run on completion
    pub fn push_hook(&mut self, hook: impl FnOnce(&BioCompletion) + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Complete the bio
    pub fn complete(mut self, status: BioStatus) {
        self.finish(status);
    }

    /// Complete the bio without it reaching the device
    pub fn cancel(self) {
        self.complete(BioStatus::Cancelled);
    }

    fn finish(&mut self, status: BioStatus) {
        let completion = BioCompletion {
            id: self.id,
            cmd: self.cmd,
            offset: self.offset,
            size: self.size,
            status,
            resid: if status.is_success() { 0 } else { self.size },
            dsched: self.dsched.take(),
        };
        self.owner = None;

        while let Some(hook) = self.hooks.pop() {
            hook(&completion);
        }
        if let Some(done) = self.done.take() {
            done(completion);
        }
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        if self.done.is_some() || !self.hooks.is_empty() {
            warn!(bio = %self.id, "bio dropped without completion, cancelling");
            self.finish(BioStatus::Cancelled);
        }
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("id", &self.id)
            .field("cmd", &self.cmd)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("owner", &self.owner.as_ref().map(|ctx| ctx.owner()))
            .field("dsched", &self.dsched)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_complete_runs_hooks_then_callback() {
        let events = Arc::new(Mutex::new(Vec::new()));

        let e = events.clone();
        let mut bio = Bio::read(4096, 512).on_complete(move |c| e.lock().push(format!("done {:?}", c.status)));
        let e = events.clone();
        bio.push_hook(move |_| e.lock().push("outer".to_string()));
        let e = events.clone();
        bio.push_hook(move |c| e.lock().push(format!("inner resid={}", c.resid)));

        bio.complete(BioStatus::Success);
        assert_eq!(
            *events.lock(),
            vec!["inner resid=0", "outer", "done Success"]
        );
    }

    #[test]
    fn test_cancel_reports_full_resid() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let bio = Bio::write(0, 8192).on_complete(move |c| *s.lock() = Some(c));
        bio.cancel();

        let completion = seen.lock().take().unwrap();
        assert_eq!(completion.status, BioStatus::Cancelled);
        assert_eq!(completion.resid, 8192);
    }

    #[test]
    fn test_drop_completes_once() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let bio = Bio::read(0, 1).on_complete(move |completion| {
            assert_eq!(completion.status, BioStatus::Cancelled);
            c.fetch_add(1, Ordering::SeqCst);
        });
        drop(bio);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        let bio = Bio::read(0, 1).on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bio.complete(BioStatus::Success);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Bio::flush();
        let b = Bio::flush();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.cmd(), BioCmd::Flush);
    }
}
