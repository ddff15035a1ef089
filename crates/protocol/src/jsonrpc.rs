//! Duplex JSON-RPC 2.0 channel
//!
//! One JSON object per transport message. Both sides may issue requests,
//! responses and notifications at any time; request ids are positive on the
//! connecting side and negative on the accepting side so the two id spaces
//! never collide. There is no per-request cancellation frame: an in-flight
//! call is cancelled by closing the channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{ErrorObject, RpcError};

/// Send a ping when the channel has been idle this long.
pub const T_IDLE: Duration = Duration::from_secs(20);

/// Consider the channel dead when nothing was received for this long.
pub const T_DEAD: Duration = Duration::from_secs(60);

/// Which end of the channel this is; decides the request id sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The peer that opened the connection; uses ids 1, 2, 3, ...
    Initiator,
    /// The peer that accepted the connection; uses ids -1, -2, -3, ...
    Acceptor,
}

/// An inbound method call. `id` is `None` for notifications.
#[derive(Debug)]
pub struct Incoming {
    pub id: Option<i64>,
    pub method: String,
    pub params: Value,
}

/// Handles inbound calls on one channel.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject>;
}

type PendingMap = HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>;

struct Inner {
    outgoing: mpsc::Sender<String>,
    /// `None` once the channel closed; every later call fails fast.
    pending: Mutex<Option<PendingMap>>,
    next_id: AtomicI64,
    id_step: i64,
}

/// One side of a duplex JSON-RPC connection.
///
/// The channel itself is transport-agnostic: outbound frames go into an
/// `mpsc` queue drained by the transport pump, inbound frames are fed to
/// [`Channel::handle_frame`] (usually through [`serve`]).
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(outgoing: mpsc::Sender<String>, side: Side) -> Self {
        let (start, step) = match side {
            Side::Initiator => (1, 1),
            Side::Acceptor => (-1, -1),
        };
        Self {
            inner: Arc::new(Inner {
                outgoing,
                pending: Mutex::new(Some(HashMap::new())),
                next_id: AtomicI64::new(start),
                id_step: step,
            }),
        }
    }

    /// Call a remote method and wait for its response.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = self
            .inner
            .next_id
            .fetch_add(self.inner.id_step, Ordering::Relaxed);

        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?,
        }))?;

        let rx = {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            let map = pending.as_mut().ok_or(RpcError::ChannelClosed)?;
            let (tx, rx) = oneshot::channel();
            map.insert(id, tx);
            rx
        };

        if self.inner.outgoing.send(frame).await.is_err() {
            self.remove_pending(id);
            return Err(RpcError::ChannelClosed);
        }

        let result = match rx.await {
            Ok(result) => result?,
            Err(_) => return Err(RpcError::ChannelClosed),
        };
        Ok(serde_json::from_value(result)?)
    }

    /// Send a notification (no response expected).
    pub async fn notify<P>(&self, method: &str, params: &P) -> Result<(), RpcError>
    where
        P: Serialize + ?Sized,
    {
        let frame = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": serde_json::to_value(params)?,
        }))?;
        self.inner
            .outgoing
            .send(frame)
            .await
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// Send the response for an inbound request.
    pub async fn respond(&self, id: i64, result: Result<Value, ErrorObject>) {
        let body = match result {
            Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        let frame = match serde_json::to_string(&body) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to serialize response: {err}");
                return;
            }
        };
        let _ = self.inner.outgoing.send(frame).await;
    }

    /// Process one inbound frame.
    ///
    /// Responses and errors resolve pending calls and return `None`;
    /// requests and notifications are handed back to the caller. A frame
    /// that is not valid JSON-RPC is fatal to the channel.
    pub fn handle_frame(&self, raw: &str) -> Result<Option<Incoming>, RpcError> {
        let data: Value =
            serde_json::from_str(raw).map_err(|e| RpcError::Protocol(format!("bad JSON: {e}")))?;

        let id = match data.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| RpcError::Protocol("\"id\" must be an integer".into()))?,
            ),
            Some(_) => return Err(RpcError::Protocol("\"id\" must be an integer".into())),
        };

        if let Some(method) = data.get("method") {
            let method = method
                .as_str()
                .ok_or_else(|| RpcError::Protocol("\"method\" must be a string".into()))?
                .to_owned();
            let params = data.get("params").cloned().unwrap_or(Value::Null);
            if !matches!(params, Value::Null | Value::Object(_) | Value::Array(_)) {
                return Err(RpcError::Protocol(
                    "\"params\" must be a structured value".into(),
                ));
            }
            return Ok(Some(Incoming { id, method, params }));
        }

        let id = id.ok_or_else(|| RpcError::Protocol("response without \"id\"".into()))?;

        let outcome = if let Some(error) = data.get("error") {
            let error: ErrorObject = serde_json::from_value(error.clone())
                .map_err(|e| RpcError::Protocol(format!("bad error object: {e}")))?;
            Err(RpcError::Remote(error))
        } else if let Some(result) = data.get("result") {
            Ok(result.clone())
        } else {
            return Err(RpcError::Protocol(
                "message is neither request nor response".into(),
            ));
        };

        match self.remove_pending(id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!("dropping response for unknown request id {id}"),
        }
        Ok(None)
    }

    /// Fail every pending call; later calls fail with `ChannelClosed`.
    pub fn close(&self) {
        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
        if let Some(map) = pending.take() {
            for (_, tx) in map {
                let _ = tx.send(Err(RpcError::ChannelClosed));
            }
        }
    }

    fn remove_pending(&self, id: i64) -> Option<oneshot::Sender<Result<Value, RpcError>>> {
        let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
        pending.as_mut().and_then(|map| map.remove(&id))
    }
}

/// Drive a channel: dispatch inbound frames until the transport ends.
///
/// Requests run as concurrent tasks; they are aborted when the loop exits,
/// so tearing down the transport cancels in-flight handlers. Returns an
/// error only for frames that are fatal to the channel.
pub async fn serve(
    channel: &Channel,
    incoming: &mut mpsc::Receiver<String>,
    service: Arc<dyn RpcService>,
) -> Result<(), RpcError> {
    let mut tasks = JoinSet::new();

    let result = loop {
        tokio::select! {
            raw = incoming.recv() => {
                let raw = match raw {
                    Some(raw) => raw,
                    None => break Ok(()),
                };
                match channel.handle_frame(&raw) {
                    Ok(Some(incoming)) => {
                        let channel = channel.clone();
                        let service = service.clone();
                        tasks.spawn(async move {
                            dispatch(&channel, &*service, incoming).await;
                        });
                    }
                    Ok(None) => {}
                    Err(err) => break Err(err),
                }
            }
            // Drain finished handler tasks so the set doesn't grow.
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = res {
                    if !err.is_cancelled() {
                        warn!("request handler panicked: {err}");
                    }
                }
            }
        }
    };

    channel.close();
    tasks.abort_all();
    result
}

async fn dispatch(channel: &Channel, service: &dyn RpcService, incoming: Incoming) {
    debug!("method call: {}", incoming.method);
    let result = service.handle(&incoming.method, incoming.params).await;
    match incoming.id {
        Some(id) => channel.respond(id, result).await,
        None => {
            if let Err(err) = result {
                warn!(
                    "notification handler for {:?} failed: {}",
                    incoming.method, err.message
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CODE_METHOD_NOT_FOUND;

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn handle(&self, method: &str, params: Value) -> Result<Value, ErrorObject> {
            match method {
                "echo" => Ok(params),
                "fail" => Err(ErrorObject::auth("permission denied")),
                _ => Err(ErrorObject::method_not_found(method)),
            }
        }
    }

    struct NullService;

    #[async_trait]
    impl RpcService for NullService {
        async fn handle(&self, method: &str, _params: Value) -> Result<Value, ErrorObject> {
            Err(ErrorObject::method_not_found(method))
        }
    }

    /// Wire two channels back to back and drive both serve loops.
    fn connect(
        svc_a: Arc<dyn RpcService>,
        svc_b: Arc<dyn RpcService>,
    ) -> (Channel, Channel, Vec<tokio::task::JoinHandle<()>>) {
        let (tx_ab, mut rx_ab) = mpsc::channel::<String>(16);
        let (tx_ba, mut rx_ba) = mpsc::channel::<String>(16);

        let chan_a = Channel::new(tx_ab, Side::Initiator);
        let chan_b = Channel::new(tx_ba, Side::Acceptor);

        let a = chan_a.clone();
        let b = chan_b.clone();
        let handles = vec![
            tokio::spawn(async move {
                let _ = serve(&b, &mut rx_ab, svc_b).await;
            }),
            tokio::spawn(async move {
                let _ = serve(&a, &mut rx_ba, svc_a).await;
            }),
        ];
        (chan_a, chan_b, handles)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (chan_a, _chan_b, _handles) = connect(Arc::new(NullService), Arc::new(EchoService));

        let result: Value = chan_a
            .call("echo", &json!({"hello": "world"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn test_call_both_directions() {
        let (chan_a, chan_b, _handles) = connect(Arc::new(EchoService), Arc::new(EchoService));

        let from_a: Value = chan_a.call("echo", &json!([1])).await.unwrap();
        let from_b: Value = chan_b.call("echo", &json!([2])).await.unwrap();
        assert_eq!(from_a, json!([1]));
        assert_eq!(from_b, json!([2]));
    }

    #[tokio::test]
    async fn test_remote_error_is_mapped() {
        let (chan_a, _chan_b, _handles) = connect(Arc::new(NullService), Arc::new(EchoService));

        let err = chan_a
            .call::<_, Value>("fail", &json!({}))
            .await
            .unwrap_err();
        match err {
            RpcError::Remote(obj) => {
                assert_eq!(obj.kind(), Some(crate::error::ErrorKind::Auth));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (chan_a, _chan_b, _handles) = connect(Arc::new(NullService), Arc::new(EchoService));

        let err = chan_a
            .call::<_, Value>("no_such_method", &json!({}))
            .await
            .unwrap_err();
        match err {
            RpcError::Remote(obj) => assert_eq!(obj.code, CODE_METHOD_NOT_FOUND),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_id_signs() {
        let (tx, mut rx) = mpsc::channel::<String>(4);
        let initiator = Channel::new(tx, Side::Initiator);
        tokio::spawn(async move {
            let _ = initiator.call::<_, Value>("m", &json!({})).await;
        });
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], 1);

        let (tx, mut rx) = mpsc::channel::<String>(4);
        let acceptor = Channel::new(tx, Side::Acceptor);
        tokio::spawn(async move {
            let _ = acceptor.call::<_, Value>("m", &json!({})).await;
        });
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], -1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (tx, _rx) = mpsc::channel::<String>(4);
        let channel = Channel::new(tx, Side::Initiator);

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call::<_, Value>("m", &json!({})).await })
        };
        tokio::task::yield_now().await;
        channel.close();

        match pending.await.unwrap() {
            Err(RpcError::ChannelClosed) => {}
            other => panic!("expected ChannelClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (tx, _rx) = mpsc::channel::<String>(4);
        let channel = Channel::new(tx, Side::Acceptor);
        assert!(channel.handle_frame("not json").is_err());
        assert!(channel.handle_frame("{\"jsonrpc\":\"2.0\"}").is_err());
        assert!(channel
            .handle_frame("{\"jsonrpc\":\"2.0\",\"id\":\"abc\",\"result\":1}")
            .is_err());
    }

    #[tokio::test]
    async fn test_notification_dispatch() {
        struct Recorder(mpsc::Sender<String>);

        #[async_trait]
        impl RpcService for Recorder {
            async fn handle(&self, method: &str, _params: Value) -> Result<Value, ErrorObject> {
                let _ = self.0.send(method.to_owned()).await;
                Ok(Value::Null)
            }
        }

        let (seen_tx, mut seen_rx) = mpsc::channel(4);
        let (chan_a, _chan_b, _handles) =
            connect(Arc::new(NullService), Arc::new(Recorder(seen_tx)));

        chan_a.notify("ping_me", &json!({})).await.unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), "ping_me");
    }
}
