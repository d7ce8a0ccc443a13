//! A stream of three HEAD messages closed by a DATA: the receiver's
//! reachable value forces to the whole list, and the inport is gone once
//! the final element arrived.

use par_runtime::datacomms::{SendMode, SendStatus};
use par_runtime::heap::{self, ClosureRef, Node};
use par_runtime::mp::tcp_mesh::TcpMeshTransport;
use par_runtime::runtime::{ParRuntime, RtsConfig, RtsMessage};
use std::sync::Arc;

/// List terminator of the demonstration stream.
const NIL_TAG: u32 = 0;

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

/// Force a cons-cell stream to its element list.
async fn force_list(root: &ClosureRef) -> Vec<i64> {
    let mut items = Vec::new();
    let mut current = root.clone();
    loop {
        let node = heap::demand(&current).await;
        enum Step {
            Element(ClosureRef, ClosureRef),
            Nil,
        }
        let step = node.with_node(|n| match n {
            Node::Cons { head, tail } => Step::Element(head.clone(), tail.clone()),
            Node::Con { tag, .. } if *tag == NIL_TAG => Step::Nil,
            other => panic!("unexpected stream node: {:?}", other),
        });
        match step {
            Step::Element(head, tail) => {
                items.push(heap::demand_int(&head).await.expect("integer element"));
                current = tail;
            }
            Step::Nil => return items,
        }
    }
}

#[tokio::test]
async fn stream_of_heads_closed_by_data_forces_to_the_full_list() {
    let (main, child) = boot_pair(47311).await;

    let (main_process, _main_thread) = main.rtt().new_process();
    let (inport, placeholder) = main.rtt().new_inport(main_process.process).unwrap();

    let (_child_process, thread) = child.rtt().new_process();
    thread.set_receiver(inport);
    assert!(matches!(
        child.send_wrapper(&thread, SendMode::Connect, None).await,
        SendStatus::Ok
    ));

    // HEAD(1), HEAD(2), HEAD(3), then DATA carrying the closing [4].
    for element in 1..=3i64 {
        let graph = heap::create_int(element);
        assert!(matches!(
            child.send_wrapper(&thread, SendMode::Head, Some(&graph)).await,
            SendStatus::Ok
        ));
    }
    let closing = heap::create_list_node(heap::create_int(4), heap::create_con(NIL_TAG, vec![]));
    assert!(matches!(
        child.send_wrapper(&thread, SendMode::Data, Some(&closing)).await,
        SendStatus::Ok
    ));

    // Receiver loop: CONNECT + three HEADs + one DATA, in send order.
    for _ in 0..5 {
        match main.recv_message().await.unwrap() {
            RtsMessage::Data { tag, buffer } => main.process_data_msg(tag, buffer).await,
            other => panic!("expected a data-layer message, got {:?}", other),
        }
    }

    assert_eq!(force_list(&placeholder).await, vec![1, 2, 3, 4]);
    assert!(
        main.rtt().find_inport(inport).is_none(),
        "the closing DATA removes the inport"
    );

    let (main_code, child_code) = tokio::join!(main.shutdown(0), async {
        match child.recv_message().await.unwrap() {
            RtsMessage::Finish { .. } => child.shutdown(0).await,
            other => panic!("child expected FINISH, got {:?}", other),
        }
    });
    assert_eq!(main_code.unwrap(), 0);
    assert_eq!(child_code.unwrap(), 0);
}
