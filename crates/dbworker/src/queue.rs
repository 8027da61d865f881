//! FIFO correlation of responses to outstanding requests.
//!
//! Frames carry no request id: the worker answers strictly in order, so the
//! n-th response belongs to the n-th request still pending.

use std::collections::VecDeque;
use std::panic::Location;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::{Request, Response};
use crate::error::DbError;

/// Call site that submitted a request; reported with its failure.
pub type Origin = &'static Location<'static>;

pub(crate) type Completion = oneshot::Sender<Result<Vec<Value>, DbError>>;

/// A request sent to the worker and waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    op: &'static str,
    origin: Origin,
    fatal: bool,
    opens: bool,
    completion: Option<Completion>,
}

impl PendingRequest {
    pub(crate) fn new(request: &Request, origin: Origin, completion: Option<Completion>) -> Self {
        Self {
            op: request.tag(),
            origin,
            fatal: request.is_fatal(),
            opens: matches!(request, Request::Open(_)),
            completion,
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Resolve the request. Each pending request is resolved exactly once.
    pub(crate) fn complete(mut self, result: Result<Vec<Value>, DbError>) {
        if let Some(completion) = self.completion.take()
            && completion.send(result).is_err()
        {
            tracing::trace!(op = self.op, "Reply dropped before completion");
        }
    }
}

/// What a response frame resolved.
#[derive(Debug)]
pub struct Correlation {
    pub origin: Origin,
    pub fatal: bool,
    /// The request was the connection's initial open.
    pub opens: bool,
    /// Set when the worker reported a failure.
    pub failure: Option<DbError>,
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Origin of the oldest outstanding request.
    pub fn head_origin(&self) -> Option<Origin> {
        self.pending.front().map(|p| p.origin)
    }

    /// Resolve the head request with a decoded response frame.
    ///
    /// A frame with nothing pending means the stream is out of sync; the
    /// returned error is fatal for the connection.
    pub fn on_frame(&mut self, payload: Vec<Value>) -> Result<Correlation, DbError> {
        let Some(head) = self.pending.pop_front() else {
            return Err(DbError::Protocol(
                "response received with no request pending".to_string(),
            ));
        };

        let mut correlation = Correlation {
            origin: head.origin,
            fatal: head.fatal,
            opens: head.opens,
            failure: None,
        };
        match Response::from_payload(payload) {
            Response::Ok(results) => {
                tracing::trace!(op = head.op, "Request completed");
                head.complete(Ok(results));
            }
            Response::Err(message) => {
                tracing::debug!(op = head.op, error = %message, "Request failed");
                let error = DbError::Backend(message);
                correlation.failure = Some(error.clone());
                head.complete(Err(error));
            }
        }
        Ok(correlation)
    }

    /// Fail every outstanding request, oldest first. Returns how many failed.
    pub fn fail_all(&mut self, error: &DbError) -> usize {
        let count = self.pending.len();
        for pending in self.pending.drain(..) {
            pending.complete(Err(error.clone()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::OpenParams;
    use serde_json::json;

    #[track_caller]
    fn pending(request: Request) -> (PendingRequest, oneshot::Receiver<Result<Vec<Value>, DbError>>) {
        let (tx, rx) = oneshot::channel();
        (PendingRequest::new(&request, Location::caller(), Some(tx)), rx)
    }

    #[test]
    fn responses_resolve_in_submission_order() {
        let mut queue = RequestQueue::new();
        let (a, mut rx_a) = pending(Request::Attr { name: "a".into() });
        let (b, mut rx_b) = pending(Request::Attr { name: "b".into() });
        queue.push(a);
        queue.push(b);

        queue.on_frame(vec![json!(true), json!("first")]).unwrap();
        assert_eq!(rx_a.try_recv().unwrap(), Ok(vec![json!("first")]));
        assert!(rx_b.try_recv().is_err());

        queue.on_frame(vec![json!(true), json!("second")]).unwrap();
        assert_eq!(rx_b.try_recv().unwrap(), Ok(vec![json!("second")]));
        assert!(queue.is_empty());
    }

    #[test]
    fn failure_reports_origin_and_fatality() {
        let mut queue = RequestQueue::new();
        let (exec, mut rx) = pending(Request::Exec {
            sql: "selec".into(),
            args: vec![],
        });
        let line = exec.origin().line();
        queue.push(exec);

        let correlation = queue
            .on_frame(vec![json!(null), json!("syntax error")])
            .unwrap();
        assert_eq!(correlation.origin.line(), line);
        assert_eq!(correlation.origin.file(), file!());
        assert!(!correlation.fatal);
        assert_eq!(
            correlation.failure,
            Some(DbError::Backend("syntax error".into()))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(DbError::Backend("syntax error".into()))
        );
    }

    #[test]
    fn open_is_fatal() {
        let mut queue = RequestQueue::new();
        let (open, _rx) = pending(Request::Open(OpenParams::default()));
        queue.push(open);
        let correlation = queue.on_frame(vec![json!(false)]).unwrap();
        assert!(correlation.fatal);
        assert!(correlation.opens);
        assert_eq!(
            correlation.failure,
            Some(DbError::Backend("unknown error".into()))
        );
    }

    #[test]
    fn unexpected_frame_is_a_protocol_error() {
        let mut queue = RequestQueue::new();
        let err = queue.on_frame(vec![json!(true)]).unwrap_err();
        assert!(matches!(err, DbError::Protocol(_)));
    }

    #[test]
    fn fail_all_drains_in_order() {
        let mut queue = RequestQueue::new();
        let (a, mut rx_a) = pending(Request::Begin);
        let (b, mut rx_b) = pending(Request::Commit);
        queue.push(a);
        queue.push(b);

        assert_eq!(queue.fail_all(&DbError::Timeout), 2);
        assert!(queue.is_empty());
        assert_eq!(rx_a.try_recv().unwrap(), Err(DbError::Timeout));
        assert_eq!(rx_b.try_recv().unwrap(), Err(DbError::Timeout));
    }

    #[test]
    fn dropped_reply_is_tolerated() {
        let mut queue = RequestQueue::new();
        let (a, rx) = pending(Request::Rollback);
        drop(rx);
        queue.push(a);
        assert!(queue.on_frame(vec![json!(true)]).is_ok());
    }
}
