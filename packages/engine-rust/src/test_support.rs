//! Test doubles shared by the engine's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use metafetch_core::{ItemResponse, WireRequest};

use crate::transport::{TransportClient, TransportError};

/// What the scripted transport does for one call.
pub(crate) enum Script {
    /// Answer every request with [`echo`].
    Echo,
    Fail(TransportError),
    Respond(Vec<ItemResponse>),
    /// Wait for the abort token, then report `Aborted`.
    Hang,
    /// Wait for the notification, then echo.
    Wait(Arc<Notify>),
}

/// Transport that records every batch and follows a script, echoing once the
/// script runs out.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    calls: Mutex<Vec<Vec<WireRequest>>>,
    script: Mutex<VecDeque<Script>>,
    aborted: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, step: Script) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> Vec<Vec<WireRequest>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls that observed their abort token.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportClient for ScriptedTransport {
    async fn submit_batch(
        &self,
        requests: &[WireRequest],
        abort: CancellationToken,
    ) -> Result<Vec<ItemResponse>, TransportError> {
        self.calls.lock().push(requests.to_vec());
        let step = self.script.lock().pop_front().unwrap_or(Script::Echo);
        match step {
            Script::Echo => Ok(requests.iter().map(echo).collect()),
            Script::Fail(err) => Err(err),
            Script::Respond(items) => Ok(items),
            Script::Hang => {
                abort.cancelled().await;
                self.aborted.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Aborted)
            }
            Script::Wait(notify) => {
                notify.notified().await;
                Ok(requests.iter().map(echo).collect())
            }
        }
    }
}

/// `{"index": <target>, "body": <parsed body>}`.
pub(crate) fn echo(request: &WireRequest) -> ItemResponse {
    let body: Value = serde_json::from_str(&request.body).unwrap_or(Value::Null);
    Ok(json!({ "index": request.target_resource, "body": body }))
}

/// Yields until `done` holds, panicking if it never does.
pub(crate) async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
