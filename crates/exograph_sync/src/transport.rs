//! Transport provider abstraction.
//!
//! Every provider call is asynchronous: it returns immediately and
//! reports the outcome exactly once through the supplied callback,
//! possibly on another thread and possibly before the call returns.

use crate::error::{SyncError, SyncResult};
use exograph_protocol::{
    EventRequest, ListRequest, ObjectRequest, QueryRequest, RoundtripRequest, SaveRequest,
    ServerResult, TypeInfo,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Completion callback of an asynchronous operation.
pub type Callback<T> = Box<dyn FnOnce(SyncResult<T>) + Send>;

/// The set of provider functions the host application supplies.
pub trait SyncTransport: Send + Sync {
    /// Fetches instance state of entities of one type.
    fn fetch_objects(&self, request: ObjectRequest, done: Callback<ServerResult>);

    /// Runs a batch of queries.
    fn query(&self, request: QueryRequest, done: Callback<ServerResult>);

    /// Fetches metadata of a type, preceded by any base types the client
    /// may not know yet.
    fn fetch_type(&self, type_name: &str, done: Callback<Vec<TypeInfo>>);

    /// Fetches the contents of list properties of one entity.
    fn fetch_list(&self, request: ListRequest, done: Callback<ServerResult>);

    /// Sends pending changes and pulls server-side state changes.
    fn roundtrip(&self, request: RoundtripRequest, done: Callback<ServerResult>);

    /// Persists pending changes.
    fn save(&self, request: SaveRequest, done: Callback<ServerResult>);

    /// Raises a server event on an entity.
    fn raise_event(&self, request: EventRequest, done: Callback<ServerResult>);
}

/// A request observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `fetch_objects`.
    Objects(ObjectRequest),
    /// `query`.
    Query(QueryRequest),
    /// `fetch_type`.
    Type(String),
    /// `fetch_list`.
    List(ListRequest),
    /// `roundtrip`.
    Roundtrip(RoundtripRequest),
    /// `save`.
    Save(SaveRequest),
    /// `raise_event`.
    Event(EventRequest),
}

/// Provider operations that return a [`ServerResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `fetch_objects`.
    Objects,
    /// `query`.
    Query,
    /// `fetch_list`.
    List,
    /// `roundtrip`.
    Roundtrip,
    /// `save`.
    Save,
    /// `raise_event`.
    Event,
}

type Delivery = Box<dyn FnOnce() + Send>;

/// A scripted transport for testing.
///
/// Responses are queued per operation; an operation with nothing queued
/// succeeds with an empty result. Types are served from a registry. In
/// deferred mode callbacks are held until [`deliver_next`](Self::deliver_next)
/// or [`deliver_all`](Self::deliver_all), which lets tests interleave
/// in-flight requests with local mutations.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    responses: Mutex<HashMap<Operation, VecDeque<SyncResult<ServerResult>>>>,
    types: Mutex<HashMap<String, Vec<TypeInfo>>>,
    deferred: Mutex<bool>,
    held: Mutex<VecDeque<Delivery>>,
}

impl MockTransport {
    /// Creates a mock transport that delivers immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock transport that holds callbacks until delivered.
    pub fn deferred() -> Self {
        let transport = Self::default();
        transport.set_deferred(true);
        transport
    }

    /// Switches between immediate and deferred delivery.
    pub fn set_deferred(&self, deferred: bool) {
        *self.deferred.lock() = deferred;
    }

    /// Queues the next response of `operation`.
    pub fn respond(&self, operation: Operation, response: SyncResult<ServerResult>) {
        self.responses
            .lock()
            .entry(operation)
            .or_default()
            .push_back(response);
    }

    /// Serves `info` for `fetch_type`.
    pub fn add_type(&self, info: TypeInfo) {
        self.types.lock().insert(info.name.clone(), vec![info]);
    }

    /// Serves a type together with base types the client may lack.
    pub fn add_type_chain(&self, name: impl Into<String>, chain: Vec<TypeInfo>) {
        self.types.lock().insert(name.into(), chain);
    }

    /// Returns every request seen so far.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Returns the save requests seen so far.
    pub fn saves(&self) -> Vec<SaveRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::Save(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the number of held deliveries.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Runs the oldest held delivery. Returns false if none was held.
    pub fn deliver_next(&self) -> bool {
        let next = self.held.lock().pop_front();
        match next {
            Some(delivery) => {
                delivery();
                true
            }
            None => false,
        }
    }

    /// Runs held deliveries, including ones queued while delivering, until
    /// none remain. Returns how many ran.
    pub fn deliver_all(&self) -> usize {
        let mut count = 0;
        while self.deliver_next() {
            count += 1;
        }
        count
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn next_response(&self, operation: Operation) -> SyncResult<ServerResult> {
        self.responses
            .lock()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(ServerResult::default()))
    }

    fn deliver<T: Send + 'static>(&self, result: SyncResult<T>, done: Callback<T>) {
        if *self.deferred.lock() {
            self.held.lock().push_back(Box::new(move || done(result)));
        } else {
            done(result);
        }
    }

    fn serve(&self, call: TransportCall, operation: Operation, done: Callback<ServerResult>) {
        self.record(call);
        let response = self.next_response(operation);
        self.deliver(response, done);
    }
}

impl SyncTransport for MockTransport {
    fn fetch_objects(&self, request: ObjectRequest, done: Callback<ServerResult>) {
        self.serve(TransportCall::Objects(request), Operation::Objects, done);
    }

    fn query(&self, request: QueryRequest, done: Callback<ServerResult>) {
        self.serve(TransportCall::Query(request), Operation::Query, done);
    }

    fn fetch_type(&self, type_name: &str, done: Callback<Vec<TypeInfo>>) {
        self.record(TransportCall::Type(type_name.to_string()));
        let result = self
            .types
            .lock()
            .get(type_name)
            .cloned()
            .ok_or_else(|| SyncError::ServerError(format!("no such type: {type_name}")));
        self.deliver(result, done);
    }

    fn fetch_list(&self, request: ListRequest, done: Callback<ServerResult>) {
        self.serve(TransportCall::List(request), Operation::List, done);
    }

    fn roundtrip(&self, request: RoundtripRequest, done: Callback<ServerResult>) {
        self.serve(TransportCall::Roundtrip(request), Operation::Roundtrip, done);
    }

    fn save(&self, request: SaveRequest, done: Callback<ServerResult>) {
        self.serve(TransportCall::Save(request), Operation::Save, done);
    }

    fn raise_event(&self, request: EventRequest, done: Callback<ServerResult>) {
        self.serve(TransportCall::Event(request), Operation::Event, done);
    }
}

impl<T: SyncTransport + ?Sized> SyncTransport for std::sync::Arc<T> {
    fn fetch_objects(&self, request: ObjectRequest, done: Callback<ServerResult>) {
        (**self).fetch_objects(request, done)
    }

    fn query(&self, request: QueryRequest, done: Callback<ServerResult>) {
        (**self).query(request, done)
    }

    fn fetch_type(&self, type_name: &str, done: Callback<Vec<TypeInfo>>) {
        (**self).fetch_type(type_name, done)
    }

    fn fetch_list(&self, request: ListRequest, done: Callback<ServerResult>) {
        (**self).fetch_list(request, done)
    }

    fn roundtrip(&self, request: RoundtripRequest, done: Callback<ServerResult>) {
        (**self).roundtrip(request, done)
    }

    fn save(&self, request: SaveRequest, done: Callback<ServerResult>) {
        (**self).save(request, done)
    }

    fn raise_event(&self, request: EventRequest, done: Callback<ServerResult>) {
        (**self).raise_event(request, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exograph_protocol::EntityRef;
    use std::sync::Arc;

    fn capture() -> (Arc<Mutex<Option<SyncResult<ServerResult>>>>, Callback<ServerResult>) {
        let slot = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        (slot, Box::new(move |r| *s.lock() = Some(r)))
    }

    #[test]
    fn unscripted_operations_succeed_empty() {
        let transport = MockTransport::new();
        let (slot, done) = capture();
        transport.roundtrip(RoundtripRequest { changes: vec![] }, done);
        assert_eq!(slot.lock().clone(), Some(Ok(ServerResult::default())));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn scripted_responses_are_served_in_order() {
        let transport = MockTransport::new();
        transport.respond(Operation::Save, Err(SyncError::Timeout));
        let save = SaveRequest {
            root: EntityRef::new("Driver", "1"),
            changes: vec![],
        };

        let (slot, done) = capture();
        transport.save(save.clone(), done);
        assert_eq!(slot.lock().clone(), Some(Err(SyncError::Timeout)));

        let (slot, done) = capture();
        transport.save(save, done);
        assert!(matches!(slot.lock().clone(), Some(Ok(_))));
        assert_eq!(transport.saves().len(), 2);
    }

    #[test]
    fn deferred_delivery_waits() {
        let transport = MockTransport::deferred();
        let (slot, done) = capture();
        transport.roundtrip(RoundtripRequest { changes: vec![] }, done);
        assert!(slot.lock().is_none());
        assert_eq!(transport.held_count(), 1);
        assert_eq!(transport.deliver_all(), 1);
        assert!(slot.lock().is_some());
        assert!(!transport.deliver_next());
    }

    #[test]
    fn unknown_type_fails() {
        let transport = MockTransport::new();
        let slot = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        transport.fetch_type("Car", Box::new(move |r| *s.lock() = Some(r.is_err())));
        assert_eq!(*slot.lock(), Some(true));
    }
}
