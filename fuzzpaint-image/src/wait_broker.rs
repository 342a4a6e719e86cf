//! # Wait broker
//!
//! Process-wide record of which documents the owning (UI) thread is currently blocked on.
//! Workers may poll [`WaitBroker::gui_is_waiting`] - while the owner is parked inside a lock or a
//! `wait_for_done`, it cannot touch owner-only structures, so workers are free to.
//!
//! Unlike most globals, the broker has an explicit lifetime: [`WaitBroker::init`] at startup on
//! the owning thread, [`WaitBroker::shutdown`] at exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::document::DocumentID;

/// The document about to be waited on.
#[derive(Copy, Clone, Debug)]
pub struct WaitSubject {
    pub document: DocumentID,
    /// False when the wait happens during the document's own teardown.
    pub alive: bool,
}

pub type FeedbackCallback = Arc<dyn Fn(DocumentID) + Send + Sync>;

static INSTANCE: parking_lot::RwLock<Option<Arc<WaitBroker>>> = parking_lot::const_rwlock(None);

pub struct WaitBroker {
    owner: std::thread::ThreadId,
    owner_waits: AtomicUsize,
    waiting: parking_lot::Mutex<hashbrown::HashMap<DocumentID, usize>>,
    feedback: parking_lot::RwLock<Option<FeedbackCallback>>,
}
impl WaitBroker {
    /// Create a standalone broker, with `owner` as the owning thread.
    /// Most code wants the shared [`WaitBroker::instance`] instead.
    #[must_use]
    pub fn new(owner: std::thread::ThreadId) -> Self {
        Self {
            owner,
            owner_waits: AtomicUsize::new(0),
            waiting: parking_lot::Mutex::default(),
            feedback: parking_lot::RwLock::new(None),
        }
    }
    /// Install the process-wide broker, with the calling thread as the owner.
    /// Re-initializing replaces the previous instance.
    pub fn init() -> Arc<Self> {
        let broker = Arc::new(Self::new(std::thread::current().id()));
        if INSTANCE.write().replace(broker.clone()).is_some() {
            log::warn!("Wait broker re-initialized, previous instance dropped");
        }
        broker
    }
    /// The process-wide broker, if [`WaitBroker::init`] has been called.
    #[must_use]
    pub fn instance() -> Option<Arc<Self>> {
        INSTANCE.read().clone()
    }
    /// Tear down the process-wide broker. Handles already given out keep working.
    pub fn shutdown() {
        if let Some(broker) = INSTANCE.write().take() {
            let waits = broker.owner_waits.load(Ordering::Acquire);
            if waits != 0 {
                log::error!("Wait broker shut down while the owner is blocked {waits} times");
            }
        }
    }
    fn on_owner(&self) -> bool {
        std::thread::current().id() == self.owner
    }
    /// The owning thread is about to block on `subject`. Calls from other threads are ignored.
    pub fn notify_wait_started(&self, subject: WaitSubject) {
        if !self.on_owner() {
            return;
        }
        self.owner_waits.fetch_add(1, Ordering::AcqRel);
        *self.waiting.lock().entry(subject.document).or_insert(0) += 1;

        // A document mid-teardown has no-one left to show feedback to.
        if subject.alive {
            // Cloned out, the callback may well replace itself.
            let feedback = self.feedback.read().clone();
            if let Some(feedback) = feedback {
                feedback(subject.document);
            }
        }
    }
    /// The owning thread stopped blocking on `document`. Calls from other threads are ignored.
    pub fn notify_wait_ended(&self, document: DocumentID) {
        if !self.on_owner() {
            return;
        }
        {
            let mut waiting = self.waiting.lock();
            match waiting.get_mut(&document) {
                Some(1) => {
                    waiting.remove(&document);
                }
                Some(count) => *count -= 1,
                None => {
                    debug_assert!(false, "wait on {document} ended but never started");
                    log::error!("Wait on {document} ended but never started");
                    return;
                }
            }
        }
        self.owner_waits.fetch_sub(1, Ordering::AcqRel);
    }
    /// Is the owning thread currently blocked on any document? Callable from anywhere.
    #[must_use]
    pub fn gui_is_waiting(&self) -> bool {
        self.owner_waits.load(Ordering::Acquire) != 0
    }
    /// Is the owning thread currently blocked on this document?
    #[must_use]
    pub fn document_is_waited(&self, document: DocumentID) -> bool {
        self.waiting.lock().contains_key(&document)
    }
    /// Install a hook called on the owner right before it blocks, e.g. to show a busy cursor.
    pub fn set_feedback_callback(&self, callback: Option<FeedbackCallback>) {
        *self.feedback.write() = callback;
    }
}

/// RAII bracket around an owner-thread wait.
pub(crate) struct WaitGuard<'a> {
    broker: Option<&'a WaitBroker>,
    document: DocumentID,
}
impl<'a> WaitGuard<'a> {
    pub(crate) fn new(broker: Option<&'a WaitBroker>, subject: WaitSubject) -> Self {
        if let Some(broker) = broker {
            broker.notify_wait_started(subject);
        }
        Self {
            broker,
            document: subject.document,
        }
    }
}
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some(broker) = self.broker {
            broker.notify_wait_ended(self.document);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{WaitBroker, WaitSubject};
    use crate::document::DocumentID;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn brackets_nest() {
        let broker = WaitBroker::new(std::thread::current().id());
        let document = DocumentID::next();
        let subject = WaitSubject {
            document,
            alive: true,
        };
        assert!(!broker.gui_is_waiting());
        broker.notify_wait_started(subject);
        broker.notify_wait_started(subject);
        assert!(broker.gui_is_waiting());
        assert!(broker.document_is_waited(document));
        broker.notify_wait_ended(document);
        assert!(broker.document_is_waited(document));
        broker.notify_wait_ended(document);
        assert!(!broker.gui_is_waiting());
        assert!(!broker.document_is_waited(document));
    }
    #[test]
    fn other_threads_are_ignored() {
        let broker = Arc::new(WaitBroker::new(std::thread::current().id()));
        let document = DocumentID::next();
        {
            let broker = broker.clone();
            std::thread::spawn(move || {
                broker.notify_wait_started(WaitSubject {
                    document,
                    alive: true,
                });
                // ...but they may look.
                broker.gui_is_waiting()
            })
            .join()
            .unwrap();
        }
        assert!(!broker.gui_is_waiting());
    }
    #[test]
    fn feedback_only_for_live_documents() {
        let broker = WaitBroker::new(std::thread::current().id());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            broker.set_feedback_callback(Some(Arc::new(move |_| {
                calls.fetch_add(1, Ordering::Relaxed);
            })));
        }
        let document = DocumentID::next();
        broker.notify_wait_started(WaitSubject {
            document,
            alive: false,
        });
        broker.notify_wait_ended(document);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        broker.notify_wait_started(WaitSubject {
            document,
            alive: true,
        });
        broker.notify_wait_ended(document);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
    #[test]
    fn feedback_may_replace_itself() {
        let broker = Arc::new(WaitBroker::new(std::thread::current().id()));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let weak = Arc::downgrade(&broker);
            let calls = calls.clone();
            broker.set_feedback_callback(Some(Arc::new(move |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                if let Some(broker) = weak.upgrade() {
                    broker.set_feedback_callback(None);
                }
            })));
        }
        let document = DocumentID::next();
        for _ in 0..2 {
            broker.notify_wait_started(WaitSubject {
                document,
                alive: true,
            });
            broker.notify_wait_ended(document);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(broker.feedback.read().is_none());
    }
    #[test]
    fn global_lifecycle() {
        let broker = WaitBroker::init();
        assert!(WaitBroker::instance().is_some_and(|instance| Arc::ptr_eq(&instance, &broker)));
        WaitBroker::shutdown();
        assert!(WaitBroker::instance().is_none());
        // Outstanding handles still function.
        assert!(!broker.gui_is_waiting());
    }
}
