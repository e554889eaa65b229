//! The session half of the client: one connection, one writer task, one
//! reader task, any number of concurrent callers.
//!
//! Callers are admitted through a counting semaphore, allocate an id from
//! a shared counter and park on a per-call channel. The writer drains the
//! send queue, records the waiter in the response table and puts the
//! envelope on the wire; the reader routes incoming envelopes back to the
//! waiters by id. The response table is touched by the writer and reader
//! tasks only.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::{mpsc, oneshot, watch, Semaphore},
    time::{timeout_at, Instant},
};
use tracing::{error, trace, warn};

use crate::{
    codec,
    error::Error,
    Request, Response, JSONRPC_VERSION,
};

/// Upper bound on concurrently admitted calls per session.
pub const DEFAULT_CONCURRENT_LIMIT: usize = 1024;

/// Deadline for ordinary calls.
pub const DEFAULT_SHORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for background data movement calls; a full copy can run for
/// hours.
pub const DEFAULT_LONG_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// One queued call: the envelope fields plus the channel the response is
/// delivered on.
struct MessageWrapper {
    id: u32,
    method: String,
    params: Option<serde_json::Value>,
    response_chan: oneshot::Sender<Result<Response, Error>>,
}

type ResponseTable = Mutex<HashMap<u32, oneshot::Sender<Result<Response, Error>>>>;

struct Shared {
    /// id -> waiter. Inserted by the writer task, removed by the reader
    /// task; callers only ever hold the receiving end of their own entry.
    response_chans: ResponseTable,
}

impl Shared {
    fn deliver(&self, response: Response) {
        let waiter = self
            .response_chans
            .lock()
            .expect("response table poisoned")
            .remove(&response.id);
        match waiter {
            None => {
                warn!(
                    "no outstanding request with id {}, discarding response",
                    response.id
                );
            }
            Some(waiter) => {
                // The waiter may have timed out already; a late response
                // is dropped on the floor.
                let _ = waiter.send(Ok(response));
            }
        }
    }

    fn drain_waiters(&self) {
        let waiters: Vec<_> = self
            .response_chans
            .lock()
            .expect("response table poisoned")
            .drain()
            .collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::Shutdown));
        }
    }
}

/// A json-rpc client session over one unix socket connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Dropping the
/// session closes it and fails every outstanding call.
pub struct Client {
    id_counter: AtomicU32,
    sem: Semaphore,
    msg_queue: mpsc::Sender<MessageWrapper>,
    shared: Arc<Shared>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Client {
    /// Connect to the target's control socket.
    pub async fn connect(sock_path: &str) -> Result<Client, Error> {
        let stream = UnixStream::connect(sock_path)
            .await
            .map_err(|err| Error::ConnectError {
                sock: sock_path.to_string(),
                err,
            })?;
        Ok(Self::new(stream))
    }

    /// Build a session over an already connected stream.
    pub fn new(stream: UnixStream) -> Client {
        Self::with_limit(stream, DEFAULT_CONCURRENT_LIMIT)
    }

    /// Like `new` but with a custom admission limit for callers that want
    /// tighter flow control against a slow target.
    pub fn with_limit(stream: UnixStream, limit: usize) -> Client {
        let (read_half, write_half) = stream.into_split();
        let (msg_tx, msg_rx) = mpsc::channel(limit);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let shared = Arc::new(Shared {
            response_chans: Mutex::new(HashMap::new()),
        });

        tokio::spawn(write_loop(
            write_half,
            msg_rx,
            shared.clone(),
            shutdown_rx.clone(),
            shutdown_tx.clone(),
        ));
        tokio::spawn(read_loop(
            read_half,
            shared.clone(),
            shutdown_rx,
            shutdown_tx.clone(),
        ));

        Client {
            // The target may have other live clients; starting from 1
            // would collide with them, so seed with a small random offset.
            // Collisions remain possible, just unlikely.
            id_counter: AtomicU32::new(rand::thread_rng().gen_range(0 .. 10_000)),
            sem: Semaphore::new(limit),
            msg_queue: msg_tx,
            shared,
            shutdown: shutdown_tx,
        }
    }

    /// Make a json-rpc call with the ordinary deadline and decode the
    /// result into `R`.
    pub async fn call<A, R>(&self, method: &str, args: Option<A>) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let params = args
            .map(serde_json::to_value)
            .transpose()
            .map_err(Error::EncodeError)?;
        let reply = self
            .send_msg_with_timeout(method, params, DEFAULT_SHORT_TIMEOUT)
            .await?;
        serde_json::from_slice(&reply).map_err(Error::ParseError)
    }

    /// Make a json-rpc call with the ordinary deadline and return the raw
    /// result bytes.
    pub async fn send_command<A: Serialize>(
        &self,
        method: &str,
        args: Option<A>,
    ) -> Result<Vec<u8>, Error> {
        let params = args
            .map(serde_json::to_value)
            .transpose()
            .map_err(Error::EncodeError)?;
        self.send_msg_with_timeout(method, params, DEFAULT_SHORT_TIMEOUT)
            .await
    }

    /// Like `send_command` but with the long deadline, for background data
    /// movement operations.
    pub async fn send_command_with_long_timeout<A: Serialize>(
        &self,
        method: &str,
        args: Option<A>,
    ) -> Result<Vec<u8>, Error> {
        let params = args
            .map(serde_json::to_value)
            .transpose()
            .map_err(Error::EncodeError)?;
        self.send_msg_with_timeout(method, params, DEFAULT_LONG_TIMEOUT)
            .await
    }

    /// Submit one call and wait for its response, its deadline or the
    /// session shutdown, whichever comes first. The returned bytes are the
    /// JSON encoded `result` value of the response envelope.
    pub async fn send_msg_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + timeout;

        // An empty params object is elided from the wire.
        let params = match params {
            Some(value) if value.as_object().map_or(false, |map| map.is_empty()) => None,
            other => other,
        };

        let mut id = 0;
        let result = async {
            // Admission bounds the number of in-flight calls and provides
            // flow control against a slow target. No id is consumed for a
            // call that never gets admitted.
            let _permit = match timeout_at(deadline, self.sem.acquire()).await {
                Err(_) => return Err(Error::Timeout { stage: "admission", timeout }),
                Ok(Err(_)) => return Err(Error::Shutdown),
                Ok(Ok(permit)) => permit,
            };

            id = self.id_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

            let (tx, rx) = oneshot::channel();
            let msg = MessageWrapper {
                id,
                method: method.to_string(),
                params: params.clone(),
                response_chan: tx,
            };

            match timeout_at(deadline, self.msg_queue.send(msg)).await {
                Err(_) => return Err(Error::Timeout { stage: "send queue", timeout }),
                Ok(Err(_)) => return Err(Error::Shutdown),
                Ok(Ok(())) => {}
            }

            // On expiry the id stays in the response table; the reader
            // discards whatever arrives for it later.
            let response = match timeout_at(deadline, rx).await {
                Err(_) => return Err(Error::Timeout { stage: "response", timeout }),
                Ok(Err(_)) => return Err(Error::Shutdown),
                Ok(Ok(delivery)) => delivery?,
            };

            if let Some(version) = &response.jsonrpc {
                if version != JSONRPC_VERSION {
                    return Err(Error::InvalidVersion {
                        version: version.clone(),
                    });
                }
            }
            if let Some(error) = response.error {
                return Err(Error::RpcError {
                    code: error.code,
                    msg: error.message,
                });
            }

            serde_json::to_vec(&response.result.unwrap_or(serde_json::Value::Null))
                .map_err(Error::EncodeError)
        }
        .await;

        result.map_err(|source| Error::Call {
            id,
            method: method.to_string(),
            params,
            source: Box::new(source),
        })
    }

    /// Initiate orderly shutdown: wake the writer and reader tasks, close
    /// the transport and fail every outstanding waiter.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.shared.drain_waiters();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Single task draining the send queue onto the transport.
async fn write_loop(
    mut conn: OwnedWriteHalf,
    mut queue: mpsc::Receiver<MessageWrapper>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            msg = queue.recv() => match msg {
                None => break,
                Some(msg) => msg,
            },
        };

        let request = Request::new(msg.id, &msg.method, msg.params);
        let buf = match codec::encode_request(&request) {
            Ok(buf) => buf,
            Err(err) => {
                // The serializer is built afresh per request so there is
                // nothing to rebuild; only the call in flight fails.
                warn!("failed to encode request {} ({}): {}", msg.id, msg.method, err);
                let _ = msg.response_chan.send(Err(Error::EncodeError(err)));
                continue;
            }
        };

        shared
            .response_chans
            .lock()
            .expect("response table poisoned")
            .insert(msg.id, msg.response_chan);

        trace!("JSON request: {}", String::from_utf8_lossy(&buf));

        if let Err(err) = conn.write_all(&buf).await {
            error!("write on control socket failed: {}", err);
            break;
        }
    }
    shutdown_tx.send_replace(true);
    shared.drain_waiters();
}

/// Single task routing incoming envelopes to their waiters.
async fn read_loop(
    mut conn: OwnedReadHalf,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let mut decoder = codec::ResponseDecoder::default();
    let mut chunk = [0u8; 8192];
    loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = conn.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&chunk[.. n]);
                loop {
                    match decoder.next() {
                        Ok(Some(response)) => {
                            trace!("JSON response: {:?}", response);
                            shared.deliver(response);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            // One malformed value must not poison the
                            // session; restart decoding at the next read.
                            let dropped = decoder.rebuild();
                            warn!(
                                "failed to decode response, discarding {} buffered bytes: {}",
                                dropped, err
                            );
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                error!("read on control socket failed: {}", err);
                break;
            }
        }
    }
    shutdown_tx.send_replace(true);
    shared.drain_waiters();
}
