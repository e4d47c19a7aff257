//! Control plane over a real Unix socket.

use std::sync::Arc;

use muninn_nat64_lib::ctrl::{
    read_frame, run_server, write_frame, CtrlHandler, Request, RequestHeader, RequestOp, Response,
    ResponsePayload,
};
use muninn_nat64_lib::hooks::{RecordingEgress, StaticRouter};
use muninn_nat64_lib::instance::{InstanceRegistry, XlatorKind};
use muninn_nat64_lib::pool4::Pool4Sample;
use muninn_nat64_lib::types::{L4Proto, PortRange};
use serial_test::serial;
use tokio::net::UnixStream;

async fn start_server(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let socket = dir.path().join("ctrl.sock");
    let handler = Arc::new(CtrlHandler::new(
        Arc::new(InstanceRegistry::new()),
        Arc::new(RecordingEgress::new()),
        Arc::new(StaticRouter::default()),
    ));
    let path = socket.clone();
    tokio::spawn(async move {
        let _ = run_server(&path, handler).await;
    });

    // Wait for the socket file to appear.
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    socket
}

async fn roundtrip(stream: &mut UnixStream, name: &str, op: RequestOp) -> Response {
    let request = Request { header: RequestHeader::new(XlatorKind::Nat64, name), op };
    write_frame(stream, &request).await.unwrap();
    read_frame(stream).await.unwrap().expect("response")
}

#[tokio::test]
#[serial]
async fn full_administrative_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_server(&dir).await;
    let mut stream = UnixStream::connect(&socket).await.unwrap();

    // Create an instance and say hello to it.
    let response = roundtrip(&mut stream, "default", RequestOp::InstanceAdd {
        pool6: "64:ff9b::/96".parse().unwrap(),
    })
    .await;
    assert!(response.is_ok(), "{:?}", response.error);

    let response = roundtrip(&mut stream, "default", RequestOp::InstanceHello).await;
    assert!(matches!(response.payload, ResponsePayload::Hello { exists: true }));

    // Feed it a pool4 slice and list it back.
    let sample = Pool4Sample {
        mark: 0,
        proto: L4Proto::Udp,
        prefix: "198.51.100.1/32".parse().unwrap(),
        ports: PortRange::new(40000, 40001),
    };
    let response = roundtrip(&mut stream, "default", RequestOp::Pool4Add { sample }).await;
    assert!(response.is_ok());

    let response =
        roundtrip(&mut stream, "default", RequestOp::Pool4Foreach { offset: None }).await;
    assert!(response.is_done());
    match response.payload {
        ResponsePayload::Pool4 { samples } => assert_eq!(samples, vec![sample]),
        other => panic!("unexpected payload: {other:?}"),
    }

    // The stateless table stays somebody else's department.
    let response = roundtrip(&mut stream, "default", RequestOp::EamtForeach).await;
    assert_eq!(response.status, 95);
    assert!(response.error.is_some());

    // And listing sessions on an empty instance terminates cleanly.
    let response = roundtrip(&mut stream, "default", RequestOp::SessionForeach {
        proto: L4Proto::Udp,
        offset: None,
    })
    .await;
    assert!(response.is_done());
    match response.payload {
        ResponsePayload::Sessions { sessions } => assert!(sessions.is_empty()),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn unknown_instance_errors_do_not_kill_the_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket = start_server(&dir).await;
    let mut stream = UnixStream::connect(&socket).await.unwrap();

    let response = roundtrip(&mut stream, "ghost", RequestOp::GlobalGet).await;
    assert!(!response.is_ok());

    // The stream is still usable afterwards.
    let response = roundtrip(&mut stream, "ghost", RequestOp::InstanceHello).await;
    assert!(matches!(response.payload, ResponsePayload::Hello { exists: false }));
}
