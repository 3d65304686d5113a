//! Work items
//!
//! TigerStyle: Closed set of kinds, exhaustively matched.
//!
//! A [`WorkItem`] is consumed exactly once: either executed by a worker or
//! ignored. Ignoring an item resolves whatever completion path it carries,
//! so callers never wait forever on work that was discarded.

use crate::group::WorkItemGroup;
use crate::task_scheduler::LaneTask;
use crate::turn::TurnContext;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use turnstile_core::error::{Error, Result};
use turnstile_core::SchedulingContext;

/// Kind tag for a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItemKind {
    /// A plain closure
    Closure,
    /// A poll of a lane-bound future
    Continuation,
    /// An inbound request dispatched to a handler
    Request,
    /// An outbound response delivered to a callback
    Response,
    /// A lane's turn, published on the run queue
    GroupTurn,
}

impl fmt::Display for WorkItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemKind::Closure => write!(f, "closure"),
            WorkItemKind::Continuation => write!(f, "continuation"),
            WorkItemKind::Request => write!(f, "request"),
            WorkItemKind::Response => write!(f, "response"),
            WorkItemKind::GroupTurn => write!(f, "group_turn"),
        }
    }
}

/// Closure body of a work item
pub type ClosureFn = Box<dyn FnOnce(&TurnContext) + Send + 'static>;

/// Callback receiving an outbound response
pub type ResponseCallback = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Target of an inbound request, typically an activation
pub trait RequestHandler: Send + Sync {
    /// Handle one request on the lane that owns this handler
    fn handle(&self, turn: &TurnContext, operation: &str, payload: Bytes) -> Result<Bytes>;
}

/// An inbound request awaiting dispatch
pub struct Request {
    handler: Arc<dyn RequestHandler>,
    operation: String,
    payload: Bytes,
    reply_tx: oneshot::Sender<Result<Bytes>>,
}

/// An outbound response awaiting delivery
pub struct Response {
    result: Result<Bytes>,
    callback: ResponseCallback,
}

enum WorkBody {
    Closure(ClosureFn),
    Continuation(Arc<LaneTask>),
    Request(Request),
    Response(Response),
    GroupTurn(Arc<WorkItemGroup>),
}

/// A unit of executable work
pub struct WorkItem {
    name: String,
    context: Option<SchedulingContext>,
    enqueued_at_ms: u64,
    body: WorkBody,
}

impl WorkItem {
    fn with_body(name: impl Into<String>, body: WorkBody) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "work item name must not be empty");
        Self {
            name,
            context: None,
            enqueued_at_ms: 0,
            body,
        }
    }

    /// Create a closure work item
    pub fn closure<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(&TurnContext) + Send + 'static,
    {
        Self::with_body(name, WorkBody::Closure(Box::new(f)))
    }

    /// Create a request work item and the receiver for its reply
    ///
    /// The receiver yields the handler's result, or `WorkItemDropped` if the
    /// request is discarded before it runs.
    pub fn request(
        handler: Arc<dyn RequestHandler>,
        operation: impl Into<String>,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<Result<Bytes>>) {
        let operation = operation.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let item = Self::with_body(
            format!("request:{}", operation),
            WorkBody::Request(Request {
                handler,
                operation,
                payload,
                reply_tx,
            }),
        );
        (item, reply_rx)
    }

    /// Create a response work item delivering `result` to `callback`
    pub fn response<F>(name: impl Into<String>, result: Result<Bytes>, callback: F) -> Self
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        Self::with_body(
            name,
            WorkBody::Response(Response {
                result,
                callback: Box::new(callback),
            }),
        )
    }

    pub(crate) fn continuation(task: Arc<LaneTask>) -> Self {
        let name = task.name().to_string();
        Self::with_body(name, WorkBody::Continuation(task))
    }

    pub(crate) fn group_turn(group: Arc<WorkItemGroup>) -> Self {
        let context = group.context().clone();
        let mut item = Self::with_body(group.name().to_string(), WorkBody::GroupTurn(group));
        item.context = Some(context);
        item
    }

    /// Work item name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind tag
    pub fn kind(&self) -> WorkItemKind {
        match &self.body {
            WorkBody::Closure(_) => WorkItemKind::Closure,
            WorkBody::Continuation(_) => WorkItemKind::Continuation,
            WorkBody::Request(_) => WorkItemKind::Request,
            WorkBody::Response(_) => WorkItemKind::Response,
            WorkBody::GroupTurn(_) => WorkItemKind::GroupTurn,
        }
    }

    /// Owning lane, `None` for bare top-level work
    pub fn context(&self) -> Option<&SchedulingContext> {
        self.context.as_ref()
    }

    /// Monotonic timestamp at which the item was last enqueued
    pub fn enqueued_at_ms(&self) -> u64 {
        self.enqueued_at_ms
    }

    /// Whether this item is dispatched on the system-priority lane
    ///
    /// Bare work with no lane belongs to the runtime and is system priority.
    pub fn is_system_priority(&self) -> bool {
        self.context
            .as_ref()
            .map_or(true, SchedulingContext::is_system_priority)
    }

    pub(crate) fn set_context(&mut self, context: Option<SchedulingContext>) {
        self.context = context;
    }

    pub(crate) fn stamp_enqueued(&mut self, now_ms: u64) {
        self.enqueued_at_ms = now_ms;
    }

    /// Execute this item on the current thread
    ///
    /// Handler panics are caught and returned as `HandlerPanicked`; they never
    /// unwind into the caller. Request failures are delivered on the reply
    /// channel and are not reported here.
    pub fn execute(self, turn: &TurnContext) -> Result<()> {
        trace!(item = %self.name, kind = %self.kind(), worker_id = turn.worker_id(), "Executing work item");
        let name = self.name;
        match self.body {
            WorkBody::Closure(f) => execute_closure(&name, f, turn),
            WorkBody::Continuation(task) => task.poll(turn),
            WorkBody::Request(request) => execute_request(&name, request, turn),
            WorkBody::Response(response) => execute_response(&name, response),
            WorkBody::GroupTurn(group) => {
                group.execute_turn(turn);
                Ok(())
            }
        }
    }

    /// Discard this item without executing it
    ///
    /// Requests are answered with `WorkItemDropped`, and response callbacks
    /// are invoked with it on the calling thread. Continuation futures are
    /// dropped so their join handles resolve to `TaskCancelled`.
    pub fn ignore(self, reason: &str) {
        debug!(item = %self.name, kind = %self.kind(), reason, "Ignoring work item");
        let name = self.name;
        match self.body {
            WorkBody::Closure(_) | WorkBody::GroupTurn(_) => {}
            WorkBody::Continuation(task) => task.cancel(),
            WorkBody::Request(request) => {
                let _ = request.reply_tx.send(Err(Error::dropped(name, reason)));
            }
            WorkBody::Response(response) => {
                let dropped = Response {
                    result: Err(Error::dropped(name.as_str(), reason)),
                    callback: response.callback,
                };
                if let Err(e) = execute_response(&name, dropped) {
                    warn!(item = %name, error = %e, "Response callback failed while dropping");
                }
            }
        }
    }
}

fn execute_closure(name: &str, f: ClosureFn, turn: &TurnContext) -> Result<()> {
    catch_unwind(AssertUnwindSafe(|| f(turn))).map_err(|panic| Error::HandlerPanicked {
        name: name.to_string(),
        message: panic_message(panic.as_ref()),
    })
}

fn execute_request(name: &str, request: Request, turn: &TurnContext) -> Result<()> {
    let Request {
        handler,
        operation,
        payload,
        reply_tx,
    } = request;

    match catch_unwind(AssertUnwindSafe(|| handler.handle(turn, &operation, payload))) {
        Ok(result) => {
            if let Err(e) = &result {
                debug!(item = %name, error = %e, "Request handler returned an error");
            }
            // Caller may have stopped waiting; that is not a scheduling failure.
            let _ = reply_tx.send(result);
            Ok(())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            let _ = reply_tx.send(Err(Error::HandlerPanicked {
                name: name.to_string(),
                message: message.clone(),
            }));
            Err(Error::HandlerPanicked {
                name: name.to_string(),
                message,
            })
        }
    }
}

fn execute_response(name: &str, response: Response) -> Result<()> {
    let Response { result, callback } = response;
    catch_unwind(AssertUnwindSafe(|| callback(result))).map_err(|panic| Error::HandlerPanicked {
        name: name.to_string(),
        message: panic_message(panic.as_ref()),
    })
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("context", &self.context)
            .field("enqueued_at_ms", &self.enqueued_at_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    impl RequestHandler for EchoHandler {
        fn handle(&self, _turn: &TurnContext, operation: &str, payload: Bytes) -> Result<Bytes> {
            match operation {
                "echo" => Ok(payload),
                "fail" => Err(Error::handler_failed("echo", "asked to fail")),
                _ => panic!("unknown operation {}", operation),
            }
        }
    }

    #[test]
    fn test_closure_executes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let item = WorkItem::closure("inc", move |_turn| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(item.kind(), WorkItemKind::Closure);
        item.execute(&TurnContext::detached()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closure_panic_is_caught() {
        let item = WorkItem::closure("boom", |_turn| panic!("kaboom"));
        let err = item.execute(&TurnContext::detached()).unwrap_err();
        match err {
            Error::HandlerPanicked { name, message } => {
                assert_eq!(name, "boom");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_request_replies() {
        let (item, mut rx) = WorkItem::request(Arc::new(EchoHandler), "echo", Bytes::from("hi"));
        assert_eq!(item.kind(), WorkItemKind::Request);
        assert_eq!(item.name(), "request:echo");
        item.execute(&TurnContext::detached()).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from("hi"));
    }

    #[test]
    fn test_request_error_delivered_to_caller() {
        let (item, mut rx) = WorkItem::request(Arc::new(EchoHandler), "fail", Bytes::new());
        item.execute(&TurnContext::detached()).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::HandlerFailed { .. })
        ));
    }

    #[test]
    fn test_request_panic_replies_and_reports() {
        let (item, mut rx) = WorkItem::request(Arc::new(EchoHandler), "nope", Bytes::new());
        assert!(item.execute(&TurnContext::detached()).is_err());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::HandlerPanicked { .. })
        ));
    }

    #[test]
    fn test_ignored_request_resolves_as_dropped() {
        let (item, mut rx) = WorkItem::request(Arc::new(EchoHandler), "echo", Bytes::new());
        item.ignore("lane stopped");
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.is_dropped());
    }

    #[test]
    fn test_ignored_response_calls_back_with_dropped() {
        let (tx, rx) = std::sync::mpsc::channel();
        let item = WorkItem::response("reply-8", Ok(Bytes::from("late")), move |result| {
            tx.send(result).unwrap();
        });
        item.ignore("lane stopped");
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(err.is_dropped());
        assert!(err.to_string().contains("reply-8"));
    }

    #[test]
    fn test_ignored_response_callback_panic_is_contained() {
        let item = WorkItem::response("reply-9", Ok(Bytes::new()), |_result| {
            panic!("callback bug");
        });
        item.ignore("lane stopped");
    }

    #[test]
    fn test_response_delivers_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let item = WorkItem::response("reply-7", Ok(Bytes::from("42")), move |result| {
            tx.send(result.unwrap()).unwrap();
        });
        assert_eq!(item.kind(), WorkItemKind::Response);
        item.execute(&TurnContext::detached()).unwrap();
        assert_eq!(rx.recv().unwrap(), Bytes::from("42"));
    }

    #[test]
    fn test_bare_item_is_system_priority() {
        let mut item = WorkItem::closure("bare", |_turn| {});
        assert!(item.is_system_priority());

        item.set_context(Some(SchedulingContext::activation("grain").unwrap()));
        assert!(!item.is_system_priority());
    }
}
