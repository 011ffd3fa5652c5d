//! Runtime scope - ordered teardown registry for long-lived GPU resources.

use glint_core::log;

use crate::alloc::DeviceAllocator;
use crate::device::DeviceBundle;
use crate::queue::QueueHandle;

/// A long-lived object that wants a callback when the owning scope closes.
pub trait ScopeChild {
    /// Called exactly once while the scope's device and allocator are still
    /// reachable through the accessors.
    fn scope_closing(&mut self, scope: &RuntimeScope);
}

/// One teardown entry: either a registered child object or a bare cleanup
/// function.
enum ChildEntry {
    Object(Box<dyn ScopeChild>),
    Cleanup(fn(&RuntimeScope)),
}

/// Registry of long-lived GPU resources with deterministic teardown.
///
/// Children are invoked in **registration order** when the scope closes.
/// An object that must clean up before one of its dependencies should
/// register that dependency's cleanup after its own. The scope is passed
/// explicitly to whatever needs device access; there is no global instance.
#[derive(Default)]
pub struct RuntimeScope {
    children: Vec<ChildEntry>,

    graphics_queue: Option<QueueHandle>,
    compute_queue: Option<QueueHandle>,
    transfer_queue: Option<QueueHandle>,
    present_queue: Option<QueueHandle>,
    allocator: Option<DeviceAllocator>,
    device: Option<DeviceBundle>,
}

impl RuntimeScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a child to the teardown list. No validation, no deduplication.
    pub fn register_child(&mut self, child: impl ScopeChild + 'static) {
        self.children.push(ChildEntry::Object(Box::new(child)));
    }

    /// Append a bare cleanup function to the teardown list.
    pub fn register_cleanup(&mut self, cleanup: fn(&RuntimeScope)) {
        self.children.push(ChildEntry::Cleanup(cleanup));
    }

    /// Run every registered teardown entry once, in registration order, then
    /// release the installed device, allocator, and queues. Calling this
    /// again is a no-op.
    pub fn close(&mut self) {
        if !self.children.is_empty() {
            log::debug!("closing runtime scope ({} children)", self.children.len());
        }

        let entries = std::mem::take(&mut self.children);
        for entry in entries {
            match entry {
                ChildEntry::Object(mut child) => child.scope_closing(self),
                ChildEntry::Cleanup(cleanup) => cleanup(self),
            }
        }

        // Queues wait idle on drop and need the device alive.
        self.graphics_queue = None;
        self.compute_queue = None;
        self.transfer_queue = None;
        self.present_queue = None;
        self.allocator = None;
        self.device = None;
    }

    pub fn set_device(&mut self, device: DeviceBundle) {
        self.device = Some(device);
    }

    pub fn set_allocator(&mut self, allocator: DeviceAllocator) {
        self.allocator = Some(allocator);
    }

    pub fn set_graphics_queue(&mut self, queue: QueueHandle) {
        self.graphics_queue = Some(queue);
    }

    pub fn set_compute_queue(&mut self, queue: QueueHandle) {
        self.compute_queue = Some(queue);
    }

    pub fn set_transfer_queue(&mut self, queue: QueueHandle) {
        self.transfer_queue = Some(queue);
    }

    pub fn set_present_queue(&mut self, queue: QueueHandle) {
        self.present_queue = Some(queue);
    }

    /// `None` when nothing was installed; callers check-then-use.
    pub fn device(&self) -> Option<&DeviceBundle> {
        self.device.as_ref()
    }

    pub fn allocator(&self) -> Option<&DeviceAllocator> {
        self.allocator.as_ref()
    }

    pub fn graphics_queue(&self) -> Option<&QueueHandle> {
        self.graphics_queue.as_ref()
    }

    pub fn compute_queue(&self) -> Option<&QueueHandle> {
        self.compute_queue.as_ref()
    }

    pub fn transfer_queue(&self) -> Option<&QueueHandle> {
        self.transfer_queue.as_ref()
    }

    pub fn present_queue(&self) -> Option<&QueueHandle> {
        self.present_queue.as_ref()
    }
}

impl Drop for RuntimeScope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        id: u32,
        record: Rc<RefCell<Vec<u32>>>,
    }

    impl ScopeChild for Recorder {
        fn scope_closing(&mut self, _scope: &RuntimeScope) {
            self.record.borrow_mut().push(self.id);
        }
    }

    #[test]
    fn children_run_in_registration_order() {
        let record = Rc::new(RefCell::new(Vec::new()));
        let mut scope = RuntimeScope::new();

        for id in 0..4 {
            scope.register_child(Recorder {
                id,
                record: record.clone(),
            });
        }

        scope.close();
        assert_eq!(*record.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn close_is_idempotent() {
        let record = Rc::new(RefCell::new(Vec::new()));
        let mut scope = RuntimeScope::new();
        scope.register_child(Recorder {
            id: 7,
            record: record.clone(),
        });

        scope.close();
        scope.close();
        assert_eq!(*record.borrow(), vec![7]);
    }

    static CLEANUP_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn count_cleanup(_scope: &RuntimeScope) {
        CLEANUP_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn cleanup_functions_run_once_even_through_drop() {
        {
            let mut scope = RuntimeScope::new();
            scope.register_cleanup(count_cleanup);
            scope.close();
            // Drop closes again; the list is already empty.
        }
        assert_eq!(CLEANUP_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn accessors_default_to_none() {
        let scope = RuntimeScope::new();
        assert!(scope.device().is_none());
        assert!(scope.allocator().is_none());
        assert!(scope.graphics_queue().is_none());
        assert!(scope.compute_queue().is_none());
        assert!(scope.transfer_queue().is_none());
        assert!(scope.present_queue().is_none());
    }
}
