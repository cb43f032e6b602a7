//! Operator client for a running tof-daemon.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tof_common::{Command, CommandRequest, CommandResponse, PublishMessage};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control and inspect a running ToF daemon")]
struct Args {
    /// Command endpoint of the daemon
    #[arg(long, default_value = "ipc:///tmp/tof_command")]
    endpoint: String,

    /// Publish endpoint of the daemon, used by `listen`
    #[arg(long, default_value = "ipc:///tmp/tof_stream_data")]
    data_endpoint: String,

    /// Reply timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: i32,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Ask the daemon to start streaming
    Start,
    /// Ask the daemon to stop streaming
    Stop,
    /// Print published messages
    Listen {
        /// Exit after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let context = zmq::Context::new();

    match args.action {
        Action::Start => send_command(&context, &args, Command::StreamStart),
        Action::Stop => send_command(&context, &args, Command::StreamStop),
        Action::Listen { count } => listen(&context, &args.data_endpoint, count),
    }
}

fn send_command(context: &zmq::Context, args: &Args, command: Command) -> Result<()> {
    let socket = context.socket(zmq::REQ)?;
    socket.set_rcvtimeo(args.timeout_ms)?;
    socket.set_linger(0)?;
    socket
        .connect(&args.endpoint)
        .with_context(|| format!("connecting to {}", args.endpoint))?;

    socket.send(CommandRequest::new(command).encode()?, 0)?;
    let reply = socket
        .recv_bytes(0)
        .with_context(|| format!("no reply from {}", args.endpoint))?;
    let response = CommandResponse::decode(&reply)?;

    println!("{:?}: {:?}", command, response.status());
    if !response.is_ack() {
        bail!("daemon rejected {:?}", command);
    }
    Ok(())
}

fn listen(context: &zmq::Context, endpoint: &str, count: Option<usize>) -> Result<()> {
    let socket = context.socket(zmq::SUB)?;
    socket.set_subscribe(b"")?;
    socket
        .connect(endpoint)
        .with_context(|| format!("connecting to {}", endpoint))?;

    let mut received = 0;
    while count.map_or(true, |n| received < n) {
        let bytes = socket.recv_bytes(0)?;
        match PublishMessage::decode(&bytes) {
            Ok(message) => {
                println!(
                    "t={:.1} status={:?} points={} objects={}",
                    message.timestamp,
                    message.status(),
                    message.points.len(),
                    message.objects.len()
                );
                for object in &message.objects {
                    println!("  class {} ends at point {}", object.class_id, object.last_index);
                }
            }
            Err(e) => eprintln!("undecodable message ({} bytes): {}", bytes.len(), e),
        }
        received += 1;
    }
    Ok(())
}
