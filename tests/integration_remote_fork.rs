//! Remote fork round trip: the main PE ships a task graph to a peer,
//! the peer creates a process evaluating it and answers on the reply
//! channel carried inside the graph.

use par_runtime::datacomms::{SendMode, SendStatus};
use par_runtime::heap::{self, Node};
use par_runtime::mp::tcp_mesh::TcpMeshTransport;
use par_runtime::rtt::Port;
use par_runtime::runtime::{ParRuntime, RtsConfig, RtsMessage};
use std::sync::Arc;

const TASK_TAG: u32 = 1;

#[tokio::test]
async fn forked_task_answers_on_its_reply_channel() {
    let config = RtsConfig {
        base_port: 47331,
        pack_buffer_size: 16 * 1024,
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
    let (main, child) = (Arc::new(main.unwrap()), Arc::new(child.unwrap()));

    // Reply channel on the main PE, carried inside the task graph.
    let (main_process, main_thread) = main.rtt().new_process();
    let (reply_port, placeholder) = main.rtt().new_inport(main_process.process).unwrap();
    let graph = heap::create_con(
        TASK_TAG,
        vec![
            heap::create_int(6),
            heap::create_int(reply_port.machine as i64),
            heap::create_int(reply_port.process as i64),
            heap::create_int(reply_port.id as i64),
        ],
    );

    assert!(matches!(
        main.send_wrapper(&main_thread, SendMode::RFork { target: Some(2) }, Some(&graph))
            .await,
        SendStatus::Ok
    ));

    // Child: accept the fork, evaluate, answer with the square.
    {
        let buffer = match child.recv_message().await.unwrap() {
            RtsMessage::RFork { buffer } => buffer,
            other => panic!("child expected RFORK, got {:?}", other),
        };
        // The fork travels between process ports: the sender is the main
        // process port, the receiver the child's rendezvous port.
        assert_eq!(buffer.sender, Port::process_port(1, main_process.process));
        assert_eq!(buffer.receiver, Port::rts_port(2));

        let (_task_process, task_thread, task_graph) = child.process_rfork(buffer).await;
        let fields = heap::demand(&task_graph).await.with_node(|n| match n {
            Node::Con { tag, fields } if *tag == TASK_TAG => fields.clone(),
            other => panic!("unexpected task graph: {:?}", other),
        });
        let input = heap::demand_int(&fields[0]).await.unwrap();
        let reply_to = Port {
            machine: heap::demand_int(&fields[1]).await.unwrap() as u32,
            process: heap::demand_int(&fields[2]).await.unwrap() as u64,
            id: heap::demand_int(&fields[3]).await.unwrap() as u64,
        };
        assert_eq!(reply_to, reply_port);

        task_thread.set_receiver(reply_to);
        assert!(matches!(
            child.send_wrapper(&task_thread, SendMode::Connect, None).await,
            SendStatus::Ok
        ));
        let answer = heap::create_int(input * input);
        assert!(matches!(
            child
                .send_wrapper(&task_thread, SendMode::Data, Some(&answer))
                .await,
            SendStatus::Ok
        ));
        child.rtt().release_thread(&task_thread);
    }

    // Main: CONNECT then DATA fill the reply placeholder with 36.
    for _ in 0..2 {
        match main.recv_message().await.unwrap() {
            RtsMessage::Data { tag, buffer } => main.process_data_msg(tag, buffer).await,
            other => panic!("expected a data-layer message, got {:?}", other),
        }
    }
    assert_eq!(heap::demand_int(&placeholder).await, Some(36));

    let (main_code, child_code) = tokio::join!(main.shutdown(0), async {
        match child.recv_message().await.unwrap() {
            RtsMessage::Finish { .. } => child.shutdown(0).await,
            other => panic!("child expected FINISH, got {:?}", other),
        }
    });
    assert_eq!(main_code.unwrap(), 0);
    assert_eq!(child_code.unwrap(), 0);
}
