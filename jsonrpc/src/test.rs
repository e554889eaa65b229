//! Unit tests for the json-rpc client session, run against an in-process
//! stub target on a unix socket.

use std::{
    collections::HashSet,
    fs,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

use super::*;
use crate::error::Error;

/// Socket path prefix for the stub targets.
const SOCK_PATH: &str = "/tmp/blkbridge-jsonrpc-ut";

/// Take one complete request off the front of the stub's read buffer.
fn take_request(buf: &mut Vec<u8>) -> Option<Request> {
    let (request, consumed) = {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Request>();
        match stream.next() {
            Some(Ok(request)) => (request, stream.byte_offset()),
            _ => return None,
        }
    };
    buf.drain(.. consumed);
    Some(request)
}

/// Serve a single client connection. The handler produces zero or more
/// response envelopes per request; each is written back in order. Zero
/// responses leaves the request unanswered.
async fn serve<H>(listener: UnixListener, mut handler: H)
where
    H: FnMut(Request) -> Vec<Response> + Send + 'static,
{
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[.. n]);
        while let Some(request) = take_request(&mut buf) {
            for response in handler(request) {
                let payload = serde_json::to_vec(&response).unwrap();
                sock.write_all(&payload).await.unwrap();
            }
        }
    }
}

/// Start a stub target and a client session connected to it.
async fn start_stub<H>(name: &str, handler: H) -> Client
where
    H: FnMut(Request) -> Vec<Response> + Send + 'static,
{
    let path = format!("{}-{}.sock", SOCK_PATH, name);
    let _ = fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(serve(listener, handler));
    Client::connect(&path).await.unwrap()
}

/// Answer with the request's own params as the result.
fn echo(request: Request) -> Vec<Response> {
    vec![Response {
        id: request.id,
        jsonrpc: Some(JSONRPC_VERSION.to_string()),
        result: Some(request.params.unwrap_or(serde_json::Value::Null)),
        error: None,
    }]
}

#[tokio::test]
async fn call_roundtrip() {
    let client = start_stub("roundtrip", echo).await;

    let reply = client
        .send_command("echo", Some(json!({ "x": 1 })))
        .await
        .unwrap();
    assert_eq!(reply, br#"{"x":1}"#.to_vec());
}

#[tokio::test]
async fn typed_call_roundtrip() {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Args {
        msg: String,
        code: i32,
        flag: bool,
    }

    let client = start_stub("typed", echo).await;

    let args = Args {
        msg: "some message".to_owned(),
        code: -123,
        flag: true,
    };
    let reply: Args = client.call("echo_method", Some(args)).await.unwrap();
    assert_eq!(&reply.msg, "some message");
    assert_eq!(reply.code, -123);
    assert!(reply.flag);
}

#[tokio::test]
async fn concurrent_fanout() {
    let seen_ids = Arc::new(Mutex::new(HashSet::new()));
    let stub_ids = seen_ids.clone();
    let client = Arc::new(
        start_stub("fanout", move |request| {
            stub_ids.lock().unwrap().insert(request.id);
            echo(request)
        })
        .await,
    );

    let mut tasks = Vec::new();
    for task in 0 .. 100 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for seq in 0 .. 10 {
                let params = json!({ "task": task, "seq": seq });
                let reply = client
                    .send_command("echo", Some(params.clone()))
                    .await
                    .unwrap();
                let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
                assert_eq!(reply, params);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every call got its own id.
    assert_eq!(seen_ids.lock().unwrap().len(), 1000);
}

#[tokio::test]
async fn no_such_device_error() {
    let client = start_stub("enodev", |request| {
        vec![Response {
            id: request.id,
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            result: None,
            error: Some(RpcError {
                code: -19,
                message: "no such device".into(),
            }),
        }]
    })
    .await;

    let err = client
        .send_command("bdev_get_bdevs", Some(json!({ "name": "gone" })))
        .await
        .unwrap_err();
    assert!(err.is_no_such_device());
    match err {
        Error::Call { method, source, .. } => {
            assert_eq!(method, "bdev_get_bdevs");
            match *source {
                Error::RpcError { code, ref msg } => {
                    assert_eq!(code, -19);
                    assert_eq!(msg, "no such device");
                }
                other => panic!("wrong error type: {}", other),
            }
        }
        other => panic!("wrong error type: {}", other),
    }
}

#[tokio::test]
async fn timeout_isolation() {
    let client = Arc::new(
        start_stub("timeouts", |request| {
            if request.method == "slow" {
                vec![]
            } else {
                echo(request)
            }
        })
        .await,
    );

    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client
            .send_msg_with_timeout("slow", None, Duration::from_millis(200))
            .await
    });
    let fast = client
        .send_msg_with_timeout("fast", Some(json!({ "ok": true })), Duration::from_secs(5))
        .await;

    let err = slow.await.unwrap().unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert_eq!(fast.unwrap(), br#"{"ok":true}"#.to_vec());
}

#[tokio::test]
async fn empty_params_elided() {
    let client = start_stub("elide", |request| {
        vec![Response {
            id: request.id,
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            result: Some(json!(request.params.is_none())),
            error: None,
        }]
    })
    .await;

    // An empty params object never reaches the wire...
    let reply = client
        .send_command("probe", Some(json!({})))
        .await
        .unwrap();
    assert_eq!(reply, b"true".to_vec());

    // ...a populated one does.
    let reply = client
        .send_command("probe", Some(json!({ "k": "v" })))
        .await
        .unwrap();
    assert_eq!(reply, b"false".to_vec());
}

#[tokio::test]
async fn unknown_response_id_discarded() {
    let client = start_stub("unknown-id", |request| {
        vec![
            Response {
                id: request.id.wrapping_add(1_000_000),
                jsonrpc: Some(JSONRPC_VERSION.to_string()),
                result: Some(json!("nobody asked for this")),
                error: None,
            },
            Response {
                id: request.id,
                jsonrpc: Some(JSONRPC_VERSION.to_string()),
                result: Some(json!("the real one")),
                error: None,
            },
        ]
    })
    .await;

    let reply = client.send_command::<()>("echo", None).await.unwrap();
    assert_eq!(reply, br#""the real one""#.to_vec());
}

#[tokio::test]
async fn shutdown_fails_outstanding_calls() {
    let client = Arc::new(start_stub("shutdown", |_| vec![]).await);

    let caller = client.clone();
    let pending = tokio::spawn(async move {
        caller
            .send_msg_with_timeout("never-answered", None, Duration::from_secs(30))
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close();

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_shutdown(), "unexpected error: {}", err);
}

#[tokio::test]
async fn admission_limit_saturates() {
    let path = format!("{}-admission.sock", SOCK_PATH);
    let _ = fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(serve(listener, |_| vec![]));

    let stream = UnixStream::connect(&path).await.unwrap();
    let client = Arc::new(Client::with_limit(stream, 1));

    // Park the only slot on a call that is never answered.
    let holder = client.clone();
    let held = tokio::spawn(async move {
        holder
            .send_msg_with_timeout("hold", None, Duration::from_secs(10))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The second call cannot get admitted within its own deadline.
    let err = client
        .send_msg_with_timeout("starved", None, Duration::from_millis(200))
        .await
        .unwrap_err();
    match err {
        Error::Call { ref source, .. } => match **source {
            Error::Timeout { stage, .. } => assert_eq!(stage, "admission"),
            ref other => panic!("wrong error type: {}", other),
        },
        other => panic!("wrong error type: {}", other),
    }

    client.close();
    assert!(held.await.unwrap().unwrap_err().is_shutdown());
}

#[tokio::test]
async fn malformed_value_does_not_poison_session() {
    let path = format!("{}-malformed.sock", SOCK_PATH);
    let _ = fs::remove_file(&path);
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut first = true;
        loop {
            let n = match sock.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[.. n]);
            while let Some(request) = take_request(&mut buf) {
                if first {
                    // Garbage instead of an envelope; the decoder must
                    // recover and the call time out in isolation.
                    sock.write_all(b"this is not json").await.unwrap();
                    first = false;
                } else {
                    let payload = serde_json::to_vec(&echo(request).remove(0)).unwrap();
                    sock.write_all(&payload).await.unwrap();
                }
            }
        }
    });

    let client = Client::connect(&path).await.unwrap();
    let err = client
        .send_msg_with_timeout("first", None, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {}", err);

    let reply = client
        .send_command("second", Some(json!({ "alive": true })))
        .await
        .unwrap();
    assert_eq!(reply, br#"{"alive":true}"#.to_vec());
}
