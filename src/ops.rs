use crate::errors::OpError;
use anyhow::Error;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::ops::DerefMut;
use std::rc::Rc;

/// Dense, stable identifier assigned to an op at registration time.
pub type OpId = u32;

/// Correlates an async op call with its eventual completion.
pub type PromiseId = u32;

/// A byte range borrowed by a native handler for the duration of a single
/// op call. Backed by the `v8::BackingStore` of the `ArrayBuffer` or
/// `ArrayBufferView` the JS side passed in, so no copy is made on the way
/// in. Handlers that must retain the bytes beyond the call (or beyond the
/// first `.await` point of an async handler) have to clone out of it.
pub struct ZeroCopyBuf {
    backing_store: v8::SharedRef<v8::BackingStore>,
    byte_offset: usize,
    byte_length: usize,
}

impl ZeroCopyBuf {
    pub fn new(
        backing_store: v8::SharedRef<v8::BackingStore>,
        byte_offset: usize,
        byte_length: usize,
    ) -> Self {
        ZeroCopyBuf {
            backing_store,
            byte_offset,
            byte_length,
        }
    }
}

impl Deref for ZeroCopyBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: the backing store outlives this borrow and the byte range
        // was validated against the buffer's length when the view was taken.
        unsafe {
            let ptr = self.backing_store.data().unwrap().as_ptr() as *const u8;
            std::slice::from_raw_parts(ptr.add(self.byte_offset), self.byte_length)
        }
    }
}

impl DerefMut for ZeroCopyBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe {
            let ptr = self.backing_store.data().unwrap().as_ptr() as *mut u8;
            std::slice::from_raw_parts_mut(ptr.add(self.byte_offset), self.byte_length)
        }
    }
}

impl AsRef<[u8]> for ZeroCopyBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for ZeroCopyBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

// SAFETY: `ZeroCopyBuf` is moved into a future that the single-threaded
// event-loop polls on the isolate thread; the backing store itself is
// thread-safely ref-counted by V8. We never touch it concurrently.
unsafe impl Send for ZeroCopyBuf {}

/// The control payload a `send()` call carries: either a structured JSON
/// value (ergonomic ops) or a raw byte buffer (hot-path ops that prefer to
/// decode on the native side). The dispatcher is agnostic to which one an
/// op expects; each `OpDecl` declares it.
pub enum OpPayload {
    Value(Value),
    Bytes(Vec<u8>),
}

impl OpPayload {
    pub fn as_value(&self) -> Result<&Value, Error> {
        match self {
            OpPayload::Value(v) => Ok(v),
            OpPayload::Bytes(_) => Err(Error::msg("op expected a structured control value")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            OpPayload::Bytes(b) => Ok(b),
            OpPayload::Value(_) => Err(Error::msg("op expected a raw byte control payload")),
        }
    }
}

use anyhow::Result;

pub type OpResult = std::result::Result<Value, OpError>;

/// The result of dispatching a call into a registered handler.
pub enum Op {
    /// Settled inline; returned as `send`'s return value.
    Sync(OpResult),
    /// Still running; the driver polls `PendingOpFuture` to completion and
    /// reports `(promise_id, result)` in a later batch.
    Async(PendingOpFuture),
}

pub type PendingOpFuture = LocalBoxFuture<'static, (PromiseId, OpResult)>;

pub type SyncOpFn = fn(&mut OpState, OpPayload, Option<ZeroCopyBuf>) -> OpResult;
pub type AsyncOpFn =
    fn(Rc<RefCell<OpState>>, PromiseId, OpPayload, Option<ZeroCopyBuf>) -> PendingOpFuture;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Sync,
    Async,
}

/// A single native operation, assigned a dense id the moment it is pushed
/// into an `OpRegistry`. The id is stable for the remainder of the process.
pub struct OpDecl {
    pub name: &'static str,
    pub kind: OpKind,
    sync_fn: Option<SyncOpFn>,
    async_fn: Option<AsyncOpFn>,
}

impl OpDecl {
    pub fn sync(name: &'static str, handler: SyncOpFn) -> OpDecl {
        OpDecl {
            name,
            kind: OpKind::Sync,
            sync_fn: Some(handler),
            async_fn: None,
        }
    }

    pub fn async_op(name: &'static str, handler: AsyncOpFn) -> OpDecl {
        OpDecl {
            name,
            kind: OpKind::Async,
            sync_fn: None,
            async_fn: Some(handler),
        }
    }
}

/// Opaque bag of state threaded through every op call. Ops that need to
/// reach the resource table or timer queue go through here rather than
/// reaching back into `JsRuntimeState` directly, so op handlers stay
/// testable without a V8 isolate.
#[derive(Default)]
pub struct OpState {
    pub resources: crate::resources::ResourceTable,
}

/// Registers native operations and routes calls to them by dense id.
///
/// Op id 0 is never assigned to a user op: it is reserved so that `send(0,
/// null, null)` always returns the full name→id mapping (see
/// [`OpRegistry::op_table_json`]), matching the "dynamic opcache populated
/// from a single op" contract.
pub struct OpRegistry {
    ops: Vec<OpDecl>,
    name_to_id: HashMap<&'static str, OpId>,
}

impl OpRegistry {
    pub fn new() -> Self {
        OpRegistry {
            ops: Vec::new(),
            name_to_id: HashMap::new(),
        }
    }

    /// Registers a batch of ops, assigning dense, increasing ids starting
    /// right after whatever has already been registered. Ids are never
    /// reused even if a later call registers ops of the same name (the new
    /// registration simply shadows the name lookup; the old id still
    /// resolves to the old handler).
    pub fn register(&mut self, decls: Vec<OpDecl>) {
        for decl in decls {
            let id = (self.ops.len() + 1) as OpId;
            self.name_to_id.insert(decl.name, id);
            self.ops.push(decl);
        }
    }

    pub fn id_for(&self, name: &str) -> Option<OpId> {
        self.name_to_id.get(name).copied()
    }

    fn get(&self, id: OpId) -> Option<&OpDecl> {
        if id == 0 {
            return None;
        }
        self.ops.get((id - 1) as usize)
    }

    /// `{ name: id, ... }`, the payload of the reserved op id 0.
    pub fn op_table_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .name_to_id
            .iter()
            .map(|(name, id)| (name.to_string(), Value::from(*id)))
            .collect();
        Value::Object(map)
    }

    pub fn dispatch_sync(
        &self,
        state: &mut OpState,
        id: OpId,
        payload: OpPayload,
        buf: Option<ZeroCopyBuf>,
    ) -> OpResult {
        // Op id 0 is reserved: it never reaches a registered handler, it
        // always answers with the current name -> id mapping.
        if id == 0 {
            return Ok(self.op_table_json());
        }
        let decl = match self.get(id) {
            Some(decl) if decl.kind == OpKind::Sync => decl,
            Some(_) => return Err(OpError::type_error(format!("op {id} is not sync"))),
            None => return Err(OpError::bad_resource(format!("unknown op id: {id}"))),
        };
        (decl.sync_fn.unwrap())(state, payload, buf)
    }

    pub fn dispatch_async(
        &self,
        state: Rc<RefCell<OpState>>,
        id: OpId,
        promise_id: PromiseId,
        payload: OpPayload,
        buf: Option<ZeroCopyBuf>,
    ) -> Result<PendingOpFuture, OpError> {
        let decl = match self.get(id) {
            Some(decl) if decl.kind == OpKind::Async => decl,
            Some(_) => return Err(OpError::type_error(format!("op {id} is not async"))),
            None => return Err(OpError::bad_resource(format!("unknown op id: {id}"))),
        };
        Ok((decl.async_fn.unwrap())(state, promise_id, payload, buf))
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn op_close(state: &mut OpState, payload: OpPayload, _: Option<ZeroCopyBuf>) -> OpResult {
    let rid = payload.as_value()?.as_u64().ok_or_else(|| OpError::type_error("rid must be a number"))? as u32;
    state.resources.close(rid)?;
    Ok(Value::Null)
}

fn op_resources(state: &mut OpState, _: OpPayload, _: Option<ZeroCopyBuf>) -> OpResult {
    let entries: serde_json::Map<String, Value> = state
        .resources
        .entries()
        .into_iter()
        .map(|(rid, name)| (rid.to_string(), Value::from(name)))
        .collect();
    Ok(Value::Object(entries))
}

/// `op_delay(millis)` — resolves with `null` once `millis` have elapsed.
/// The one concrete async op every host gets for free: exercises the full
/// `sendAsync` -> `PendingOpFuture` -> `recv` round trip without reaching
/// into any op-specific resource (fs/network ops are a host's job, not
/// this layer's), so op dispatch itself stays testable end to end.
fn op_delay(
    _state: Rc<RefCell<OpState>>,
    promise_id: PromiseId,
    payload: OpPayload,
    _buf: Option<ZeroCopyBuf>,
) -> PendingOpFuture {
    let millis = match payload.as_value().ok().and_then(|v| v.as_u64()) {
        Some(millis) => millis,
        None => {
            let err = OpError::type_error("op_delay expects a millisecond count");
            return Box::pin(async move { (promise_id, Err(err)) });
        }
    };

    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(millis);

    Box::pin(async move {
        futures::future::poll_fn(move |cx| {
            if std::time::Instant::now() >= deadline {
                std::task::Poll::Ready(())
            } else {
                // No timer wheel backs this future; it's cooperatively
                // repolled every tick, so just ask for another one.
                cx.waker().wake_by_ref();
                std::task::Poll::Pending
            }
        })
        .await;

        (promise_id, Ok(Value::Null))
    })
}

/// Ops that exist regardless of which concrete async ops a host registers:
/// resource-table bookkeeping plus the one generic async op every op-using
/// script can reach for.
pub fn builtin_ops() -> Vec<OpDecl> {
    vec![
        OpDecl::sync("op_close", op_close),
        OpDecl::sync("op_resources", op_resources),
        OpDecl::async_op("op_delay", op_delay),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_sync(_: &mut OpState, payload: OpPayload, _: Option<ZeroCopyBuf>) -> OpResult {
        Ok(payload.as_value().unwrap().clone())
    }

    #[test]
    fn op_zero_is_reserved() {
        let mut registry = OpRegistry::new();
        registry.register(vec![OpDecl::sync("echo", echo_sync)]);
        assert_eq!(registry.id_for("echo"), Some(1));
        assert!(registry.get(0).is_none());
    }

    #[test]
    fn ids_are_dense_and_stable() {
        let mut registry = OpRegistry::new();
        registry.register(vec![
            OpDecl::sync("a", echo_sync),
            OpDecl::sync("b", echo_sync),
        ]);
        assert_eq!(registry.id_for("a"), Some(1));
        assert_eq!(registry.id_for("b"), Some(2));
    }

    #[test]
    fn sync_dispatch_round_trips() {
        let mut registry = OpRegistry::new();
        registry.register(vec![OpDecl::sync("echo", echo_sync)]);
        let mut state = OpState::default();
        let id = registry.id_for("echo").unwrap();
        let result = registry.dispatch_sync(&mut state, id, OpPayload::Value(Value::from(42)), None);
        assert_eq!(result.unwrap(), Value::from(42));
    }

    #[test]
    fn unknown_op_id_is_bad_resource() {
        let registry = OpRegistry::new();
        let mut state = OpState::default();
        let result = registry.dispatch_sync(&mut state, 99, OpPayload::Value(Value::Null), None);
        assert!(result.is_err());
    }

    #[test]
    fn async_dispatch_resolves_op_delay() {
        let mut registry = OpRegistry::new();
        registry.register(builtin_ops());
        let id = registry.id_for("op_delay").unwrap();
        let state = Rc::new(RefCell::new(OpState::default()));

        let future = registry
            .dispatch_async(state, id, 7, OpPayload::Value(Value::from(0)), None)
            .unwrap();

        let (promise_id, result) = futures::executor::block_on(future);
        assert_eq!(promise_id, 7);
        assert_eq!(result.unwrap(), Value::Null);
    }

    #[test]
    fn async_dispatch_rejects_non_numeric_control() {
        let mut registry = OpRegistry::new();
        registry.register(builtin_ops());
        let id = registry.id_for("op_delay").unwrap();
        let state = Rc::new(RefCell::new(OpState::default()));

        let future = registry
            .dispatch_async(state, id, 1, OpPayload::Value(Value::String("x".into())), None)
            .unwrap();

        let (_, result) = futures::executor::block_on(future);
        assert!(result.is_err());
    }
}
