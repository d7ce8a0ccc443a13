//! Two PEs, one channel, one final DATA message: the receiver's
//! placeholder is replaced, blocked consumers wake with the value, and
//! the inport disappears.

use par_runtime::datacomms::{SendMode, SendStatus};
use par_runtime::heap;
use par_runtime::mp::tcp_mesh::TcpMeshTransport;
use par_runtime::runtime::{ParRuntime, RtsConfig, RtsMessage};
use std::sync::Arc;
use std::time::Duration;

async fn boot_pair(base_port: u16) -> (Arc<ParRuntime>, Arc<ParRuntime>) {
    let config = RtsConfig {
        base_port,
        pack_buffer_size: 64 * 1024,
        ..RtsConfig::default()
    };
    let main_transport = TcpMeshTransport::launched(config.transport_config(), 1, 2);
    let child_transport = TcpMeshTransport::launched(config.transport_config(), 2, 2);

    let mut main_args = vec!["test".to_string(), "2".to_string()];
    let mut child_args = vec!["test".to_string(), "2".to_string()];
    let (main, child) = tokio::join!(
        ParRuntime::startup_with(config.clone(), Box::new(main_transport), &mut main_args),
        ParRuntime::startup_with(config.clone(), Box::new(child_transport), &mut child_args),
    );
    (Arc::new(main.unwrap()), Arc::new(child.unwrap()))
}

/// Drive the counted shutdown from both ends.
async fn shut_down_pair(main: &ParRuntime, child: &ParRuntime) {
    let (main_code, child_code) = tokio::join!(main.shutdown(0), async {
        match child.recv_message().await.unwrap() {
            RtsMessage::Finish { .. } => child.shutdown(0).await,
            other => panic!("child expected FINISH, got {:?}", other),
        }
    });
    assert_eq!(main_code.unwrap(), 0);
    assert_eq!(child_code.unwrap(), 0);
    assert_eq!(main.npes(), 0);
    assert_eq!(child.npes(), 0);
}

#[tokio::test]
async fn single_data_message_fills_the_placeholder() {
    let (main, child) = boot_pair(47301).await;

    // Receiver side: a fresh inport with a placeholder a consumer
    // suspends on.
    let (main_process, _main_thread) = main.rtt().new_process();
    let (inport, placeholder) = main.rtt().new_inport(main_process.process).unwrap();
    assert!(heap::is_blackhole(&placeholder));

    let consumer = {
        let placeholder = placeholder.clone();
        tokio::spawn(async move { heap::demand_int(&placeholder).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!consumer.is_finished(), "consumer must block on the placeholder");

    // Sender side: connect the outport, then ship the value 42.
    let (_child_process, thread) = child.rtt().new_process();
    thread.set_receiver(inport);
    assert!(matches!(
        child.send_wrapper(&thread, SendMode::Connect, None).await,
        SendStatus::Ok
    ));
    let value = heap::create_int(42);
    assert!(matches!(
        child.send_wrapper(&thread, SendMode::Data, Some(&value)).await,
        SendStatus::Ok
    ));

    // Receiver's message loop: CONNECT first, then the DATA.
    for _ in 0..2 {
        match main.recv_message().await.unwrap() {
            RtsMessage::Data { tag, buffer } => main.process_data_msg(tag, buffer).await,
            other => panic!("expected a data-layer message, got {:?}", other),
        }
    }

    assert_eq!(consumer.await.unwrap(), Some(42));
    assert!(
        main.rtt().find_inport(inport).is_none(),
        "final data removes the inport"
    );

    shut_down_pair(&main, &child).await;
}
