//! The bounded, lock-free request queue between the session and the request
//! processors.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::execution::request_handler::RequestHandler;

/// Multi-producer multi-consumer queue of pending requests.
///
/// Producers are application tasks calling `execute`; consumers are the
/// request processors draining during a flush. Capacity is fixed at session
/// configuration time; a full queue is the caller's backpressure signal.
pub(crate) struct RequestQueue {
    queue: ArrayQueue<Arc<RequestHandler>>,
}

impl RequestQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        RequestQueue {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Enqueues a handler, handing a reference to the queue. Fails when the
    /// queue is at capacity, returning the handler to the caller.
    pub(crate) fn enqueue(
        &self,
        handler: Arc<RequestHandler>,
    ) -> Result<(), Arc<RequestHandler>> {
        self.queue.push(handler)
    }

    pub(crate) fn dequeue(&self) -> Option<Arc<RequestHandler>> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::Request;

    fn handler() -> Arc<RequestHandler> {
        let (handler, _rx) = RequestHandler::new(Request::SchemaVersions, None, false);
        handler
    }

    #[test]
    fn fifo_order() {
        let queue = RequestQueue::with_capacity(4);
        let handlers: Vec<_> = (0..3).map(|_| handler()).collect();
        for h in &handlers {
            queue.enqueue(Arc::clone(h)).unwrap();
        }

        for expected in &handlers {
            let got = queue.dequeue().unwrap();
            assert!(Arc::ptr_eq(&got, expected));
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn full_queue_rejects_and_returns_the_handler() {
        let queue = RequestQueue::with_capacity(2);
        queue.enqueue(handler()).unwrap();
        queue.enqueue(handler()).unwrap();

        let rejected = handler();
        let returned = queue.enqueue(Arc::clone(&rejected)).unwrap_err();
        assert!(Arc::ptr_eq(&returned, &rejected));
        assert_eq!(queue.len(), 2);

        // Dequeueing frees a slot again.
        queue.dequeue().unwrap();
        queue.enqueue(handler()).unwrap();
    }
}
