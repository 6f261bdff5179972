//! Integration tests for the keepalived notify channel

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vip_controller::notify::{NotifyListener, send_transition};
use vip_controller::{RoleTransition, VrrpState};

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("vipc-notify-{}", std::process::id()))
        .join(format!("{}.sock", name))
}

fn transition(state: VrrpState) -> RoleTransition {
    RoleTransition {
        kind: "INSTANCE".into(),
        instance: "vips".into(),
        state,
        priority: Some(100),
    }
}

#[tokio::test]
async fn test_transitions_reach_the_worker_channel_in_order() {
    let path = socket_path("order");
    let (tx, mut rx) = mpsc::channel(8);
    let listener = NotifyListener::new(&path, tx);
    let socket = listener.bind().unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(listener.serve(socket, cancel.clone()));

    send_transition(&path, &transition(VrrpState::Backup)).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, transition(VrrpState::Backup));

    send_transition(&path, &transition(VrrpState::Master)).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.state, VrrpState::Master);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let path = socket_path("stale");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"").unwrap();

    let (tx, _rx) = mpsc::channel(1);
    let listener = NotifyListener::new(&path, tx);
    tokio_test::assert_ok!(listener.bind());
}

#[tokio::test]
async fn test_send_without_listener_fails() {
    let path = socket_path("absent");
    tokio_test::assert_err!(send_transition(&path, &transition(VrrpState::Fault)).await);
}
