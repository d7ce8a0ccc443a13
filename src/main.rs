//! # Cohort Driver
//!
//! Entry point for running a demonstration cohort. The main PE forks one
//! task per PE (or `--tasks`) across the cohort, each carrying a reply
//! port; every fork's host evaluates its task graph and answers with a
//! single `DATA` message on a channel back to the main PE. When all
//! answers are in, the main PE drives the counted global shutdown, and
//! its process exit code reflects the first fatal condition observed
//! anywhere in the cohort.
//!
//! Every PE — main or spawned child — runs this same program image; the
//! transport decides the role during startup from the environment.

use anyhow::Result;
use clap::Parser;
use par_runtime::{
    cli::Args,
    datacomms::{SendMode, SendStatus},
    heap::{self, ClosureRef, Node},
    logging::PePrefixFormatter,
    rtt::{Port, SendThread},
    runtime::{exit_code, ParRuntime, RtsMessage},
};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*};

/// Constructor tag of the demonstration task graph:
/// `Task(input, reply_machine, reply_process, reply_id)`.
const TASK_TAG: u32 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Optional detailed log file next to the colored console output. The
    // guard must stay alive for the duration of the program, or the
    // non-blocking file writer stops flushing.
    let guard;
    let file_layer = match args.log_file.as_deref() {
        Some(path) => {
            let log_path = std::path::Path::new(path);
            let log_dir = log_path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let log_name = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("par-runtime.log"));
            let appender = tracing_appender::rolling::daily(log_dir, log_name);
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(EnvFilter::new(args.filter_directives())),
            )
        }
        None => {
            guard = None;
            None
        }
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(PePrefixFormatter)
                .with_filter(EnvFilter::new(args.filter_directives())),
        )
        .init();
    let _log_guard = guard;

    // The transport strips the PE count from the raw argument vector
    // itself, exactly as it was handed to this process.
    let mut argv: Vec<String> = std::env::args().collect();
    let runtime = Arc::new(ParRuntime::startup(args.to_config(), &mut argv).await?);

    let code = if runtime.i_am_main() {
        run_main(&runtime, &args).await
    } else {
        run_child(&runtime).await
    };

    std::process::exit(code);
}

/// Retry a send primitive through back-pressure and blocking holes until
/// it is out.
async fn send_until_ok(
    runtime: &ParRuntime,
    thread: &SendThread,
    mode: SendMode,
    data: Option<&ClosureRef>,
) {
    loop {
        match runtime.send_wrapper(thread, mode, data).await {
            SendStatus::Ok => return,
            SendStatus::Failed => {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            SendStatus::Blocked(hole) => {
                // Suspend on the unevaluated node, retry once it holds a
                // value.
                heap::demand(&hole).await;
            }
        }
    }
}

/// The main PE: fork tasks across the cohort, collect the answers, shut
/// the cohort down.
async fn run_main(runtime: &Arc<ParRuntime>, args: &Args) -> i32 {
    let tasks = args.tasks.unwrap_or(runtime.npes());
    let (process_port, thread) = runtime.rtt().new_process();

    // One reply channel per task; consumers suspend on the placeholders.
    let mut replies = Vec::new();
    for k in 0..tasks {
        let (reply_port, placeholder) = match runtime.rtt().new_inport(process_port.process) {
            Some(created) => created,
            None => {
                error!("reply inport allocation failed");
                return exit_code::INTERNAL_ERROR;
            }
        };
        let graph = task_graph(3 + k as i64, reply_port);
        send_until_ok(runtime, &thread, SendMode::RFork { target: None }, Some(&graph)).await;
        replies.push((3 + k as i64, placeholder));
    }

    // Collector: forces every reply placeholder as it fills.
    let mut collector = tokio::spawn(async move {
        let mut sum = 0i64;
        for (input, placeholder) in replies {
            match heap::demand_int(&placeholder).await {
                Some(value) => {
                    info!("task({}) answered {}", input, value);
                    sum += value;
                }
                None => error!("task({}) answered a non-integer", input),
            }
        }
        sum
    });

    // Message loop until every answer is in or the cohort fails.
    let failure = loop {
        tokio::select! {
            done = &mut collector => {
                match done {
                    Ok(sum) => info!("all tasks answered, total {}", sum),
                    Err(e) => error!("collector failed: {}", e),
                }
                break None;
            }
            msg = runtime.recv_message() => match msg {
                Ok(RtsMessage::Data { tag, buffer }) => {
                    runtime.process_data_msg(tag, buffer).await;
                }
                Ok(RtsMessage::RFork { buffer }) => {
                    // Placement may pick the main PE itself.
                    spawn_task(runtime.clone(), buffer).await;
                }
                Ok(RtsMessage::Finish { code, from }) => {
                    // A child shutting down unprompted means it failed.
                    error!("PE {} finished early (code {})", from, code);
                    break Some(if code != 0 { code } else { exit_code::INTERNAL_ERROR });
                }
                Ok(RtsMessage::Fail { pe }) => {
                    error!("remote PE failure on node {}, aborting execution", pe);
                    break Some(exit_code::INTERNAL_ERROR);
                }
                Err(e) => {
                    error!("message loop failed: {}", e);
                    break Some(exit_code::INTERNAL_ERROR);
                }
            }
        }
    };

    runtime.rtt().release_thread(&thread);
    match runtime.shutdown(failure.unwrap_or(exit_code::SUCCESS)).await {
        Ok(code) => code,
        Err(e) => {
            error!("shutdown failed: {}", e);
            exit_code::INTERNAL_ERROR
        }
    }
}

/// A child PE: serve remote forks and data messages until the main PE
/// says finish.
async fn run_child(runtime: &Arc<ParRuntime>) -> i32 {
    loop {
        match runtime.recv_message().await {
            Ok(RtsMessage::Data { tag, buffer }) => {
                runtime.process_data_msg(tag, buffer).await;
            }
            Ok(RtsMessage::RFork { buffer }) => {
                spawn_task(runtime.clone(), buffer).await;
            }
            Ok(RtsMessage::Finish { .. }) => {
                // Global stop; reply inside the counted protocol.
                return match runtime.shutdown(exit_code::SUCCESS).await {
                    Ok(code) => code,
                    Err(_) => exit_code::INTERNAL_ERROR,
                };
            }
            Ok(RtsMessage::Fail { pe }) => {
                error!("remote PE failure on node {}, aborting execution", pe);
                return match runtime.shutdown(exit_code::INTERNAL_ERROR).await {
                    Ok(code) => code,
                    Err(_) => exit_code::INTERNAL_ERROR,
                };
            }
            Err(e) => {
                error!("message loop failed: {}", e);
                return exit_code::INTERNAL_ERROR;
            }
        }
    }
}

/// Build the demonstration task graph carried by a remote fork.
fn task_graph(input: i64, reply_port: Port) -> ClosureRef {
    heap::create_con(
        TASK_TAG,
        vec![
            heap::create_int(input),
            heap::create_int(reply_port.machine as i64),
            heap::create_int(reply_port.process as i64),
            heap::create_int(reply_port.id as i64),
        ],
    )
}

/// Accept a remote fork: create its process and run the task thread.
async fn spawn_task(runtime: Arc<ParRuntime>, buffer: par_runtime::MsgBuffer) {
    let (process_port, thread, graph) = runtime.process_rfork(buffer).await;
    tokio::spawn(async move {
        if let Err(what) = run_task(&runtime, &thread, graph).await {
            error!("task on process {} failed: {}", process_port.process, what);
        }
        runtime.rtt().release_thread(&thread);
    });
}

/// Evaluate one task graph and answer on its reply channel.
async fn run_task(
    runtime: &ParRuntime,
    thread: &SendThread,
    graph: ClosureRef,
) -> Result<(), String> {
    let forced = heap::demand(&graph).await;
    let fields = forced.with_node(|n| match n {
        Node::Con { tag, fields } if *tag == TASK_TAG && fields.len() == 4 => Ok(fields.clone()),
        _ => Err("unexpected task graph shape".to_string()),
    })?;

    let input = heap::demand_int(&fields[0]).await.ok_or("bad input")?;
    let machine = heap::demand_int(&fields[1]).await.ok_or("bad machine")? as u32;
    let process = heap::demand_int(&fields[2]).await.ok_or("bad process")? as u64;
    let id = heap::demand_int(&fields[3]).await.ok_or("bad id")? as u64;
    let reply_to = Port {
        machine,
        process,
        id,
    };

    debug!("task({}) running, answering to {}", input, reply_to);

    // Connect the outport, then answer with the final channel element.
    thread.set_receiver(reply_to);
    send_until_ok(runtime, thread, SendMode::Connect, None).await;
    let answer = heap::create_int(input * input);
    send_until_ok(runtime, thread, SendMode::Data, Some(&answer)).await;
    Ok(())
}
