//! Transport back-pressure on the mailbox backend: with an outbox depth
//! of one, the second of two rapid sends is refused until the receiver
//! drains, and a retry then succeeds. The kernel queue is the bounded
//! buffer, so the behaviour is exact, not timing-dependent.

#![cfg(target_os = "linux")]

use par_runtime::mp::mailbox::MailboxTransport;
use par_runtime::mp::{MpTransport, OpCode, TransportConfig};

fn config() -> TransportConfig {
    TransportConfig {
        send_buffer_size: 1,
        max_msg_bytes: 2048,
        ..TransportConfig::default()
    }
}

async fn boot_pair(key: &str) -> (MailboxTransport, MailboxTransport) {
    let mut main = MailboxTransport::launched(config(), 1, 2, key);
    let mut child = MailboxTransport::launched(config(), 2, 2, key);

    let mut main_args = vec!["test".to_string(), "2".to_string()];
    let mut child_args = vec!["test".to_string(), "2".to_string()];
    main.start(&mut main_args).await.unwrap();
    child.start(&mut child_args).await.unwrap();

    let (main_sync, child_sync) =
        tokio::join!(async { main.sync().await }, async { child.sync().await });
    main_sync.unwrap();
    child_sync.unwrap();
    (main, child)
}

#[tokio::test]
async fn depth_one_outbox_refuses_the_second_send() {
    let key = format!("bp{:06}", std::process::id() % 1_000_000);
    let (main, child) = boot_pair(&key).await;

    // Two rapid sends without the receiver draining: the first fits the
    // depth-1 mailbox, the second is refused.
    assert!(main.send(2, OpCode::Data, b"first").await.unwrap());
    assert!(!main.send(2, OpCode::Data, b"second").await.unwrap());

    // Once the receiver drains one message, the retry goes through.
    let mut buf = vec![0u8; 256];
    let (len, tag, sender) = child.recv(&mut buf).await.unwrap();
    assert_eq!((tag, sender), (OpCode::Data, 1));
    assert_eq!(&buf[..len], b"first");

    assert!(main.send(2, OpCode::Data, b"second").await.unwrap());
    let (len, _, _) = child.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"second");

    main.disconnect().await.unwrap();
    child.disconnect().await.unwrap();
}

#[tokio::test]
async fn backpressure_applies_per_destination() {
    let key = format!("pd{:06}", std::process::id() % 1_000_000);
    let (main, child) = boot_pair(&key).await;

    // A full mailbox towards the child does not affect the loopback to
    // the own PE.
    assert!(main.send(2, OpCode::Data, b"fill").await.unwrap());
    assert!(!main.send(2, OpCode::Data, b"refused").await.unwrap());
    assert!(main.send(1, OpCode::Data, b"loopback").await.unwrap());

    let mut buf = vec![0u8; 256];
    let (len, tag, sender) = main.recv(&mut buf).await.unwrap();
    assert_eq!((tag, sender), (OpCode::Data, 1));
    assert_eq!(&buf[..len], b"loopback");

    let (len, _, _) = child.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..len], b"fill");

    main.disconnect().await.unwrap();
    child.disconnect().await.unwrap();
}
