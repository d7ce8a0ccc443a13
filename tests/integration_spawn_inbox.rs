//! Runtime-level round trip over the spawn backend's Unix-socket
//! inboxes: connect, final data, placeholder update.

use par_runtime::datacomms::{SendMode, SendStatus};
use par_runtime::heap;
use par_runtime::mp::proc_spawn::ProcSpawnTransport;
use par_runtime::runtime::{ParRuntime, RtsConfig, RtsMessage};
use std::sync::Arc;

#[tokio::test]
async fn data_crosses_unix_socket_inboxes() {
    let key = format!("ib{:06}", std::process::id() % 1_000_000);
    let config = RtsConfig {
        pack_buffer_size: 16 * 1024,
        ..RtsConfig::default()
    };

    let main_transport = ProcSpawnTransport::launched(config.transport_config(), 1, 2, &key);
    let child_transport = ProcSpawnTransport::launched(config.transport_config(), 2, 2, &key);

    let mut main_args = vec!["test".to_string(), "2".to_string()];
    let mut child_args = vec!["test".to_string(), "2".to_string()];
    let (main, child) = tokio::join!(
        ParRuntime::startup_with(config.clone(), Box::new(main_transport), &mut main_args),
        ParRuntime::startup_with(config.clone(), Box::new(child_transport), &mut child_args),
    );
    let (main, child) = (Arc::new(main.unwrap()), Arc::new(child.unwrap()));

    let (main_process, _main_thread) = main.rtt().new_process();
    let (inport, placeholder) = main.rtt().new_inport(main_process.process).unwrap();

    let (_child_process, thread) = child.rtt().new_process();
    thread.set_receiver(inport);
    assert!(matches!(
        child.send_wrapper(&thread, SendMode::Connect, None).await,
        SendStatus::Ok
    ));
    let value = heap::create_int(1234);
    assert!(matches!(
        child.send_wrapper(&thread, SendMode::Data, Some(&value)).await,
        SendStatus::Ok
    ));

    for _ in 0..2 {
        match main.recv_message().await.unwrap() {
            RtsMessage::Data { tag, buffer } => main.process_data_msg(tag, buffer).await,
            other => panic!("expected a data-layer message, got {:?}", other),
        }
    }

    assert_eq!(heap::demand_int(&placeholder).await, Some(1234));
    assert!(main.rtt().find_inport(inport).is_none());

    let (main_code, child_code) = tokio::join!(main.shutdown(0), async {
        match child.recv_message().await.unwrap() {
            RtsMessage::Finish { .. } => child.shutdown(0).await,
            other => panic!("child expected FINISH, got {:?}", other),
        }
    });
    assert_eq!(main_code.unwrap(), 0);
    assert_eq!(child_code.unwrap(), 0);
}
