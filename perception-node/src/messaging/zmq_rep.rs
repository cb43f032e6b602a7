use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tof_common::{
    Command, CommandRequest, CommandResponse, Status, COMMAND_HEADER, PROTOCOL_VERSION,
};
use tracing::{debug, error, info, warn};
use zmq::{Context, Socket, REP};

use super::StreamingState;
use crate::config::MessagingConfig;
use crate::error::{PerceptionError, Result};

/// Pause after a socket error before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// Errors in a row before the socket is closed and bound again.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Applies one request to the streaming flag and builds the reply.
///
/// Malformed requests are NAKed with `RawCommand`; unsupported commands are
/// NAKed without touching the flag.
pub fn handle_request(bytes: &[u8], streaming: &StreamingState) -> CommandResponse {
    let request = match CommandRequest::decode(bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting malformed command: {}", e);
            return CommandResponse::nak(Command::RawCommand.code());
        }
    };

    match request.command() {
        Some(Command::StreamStart) => {
            if !streaming.set(true) {
                info!("Streaming started");
            }
            CommandResponse::ack(request.command)
        }
        Some(Command::StreamStop) => {
            if streaming.set(false) {
                info!("Streaming stopped");
            }
            CommandResponse::ack(request.command)
        }
        other => {
            warn!("Unsupported command {} ({:?})", request.command, other);
            CommandResponse::nak(request.command)
        }
    }
}

/// REP loop on its own thread. Each receive times out after the configured
/// poll interval so the loop notices the running flag going false.
pub struct CommandServer {
    handle: Option<JoinHandle<()>>,
}

impl CommandServer {
    /// Binds before spawning so bind failures surface to the caller.
    pub fn spawn(
        context: &Context,
        config: &MessagingConfig,
        streaming: StreamingState,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = bind_command_socket(context, config)?;
        let context = context.clone();
        let config = config.clone();

        let handle = thread::Builder::new()
            .name("tof-command".to_string())
            .spawn(move || serve(&context, &config, socket, streaming, running))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PerceptionError::MessagingError("command thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        if let Err(e) = self.join_inner() {
            error!("{}", e);
        }
    }
}

fn bind_command_socket(context: &Context, config: &MessagingConfig) -> Result<Socket> {
    info!("Binding command socket on {}", config.command_endpoint);
    let socket = context.socket(REP)?;
    socket.set_rcvtimeo(config.command_poll_ms)?;
    socket.set_linger(0)?;
    socket.bind(&config.command_endpoint)?;
    Ok(socket)
}

/// Encodes a reply, falling back to a NAK for the same command.
///
/// A REP socket must answer before it can receive again, so something is
/// always sent.
fn encode_reply(response: &CommandResponse) -> Vec<u8> {
    match response.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode command reply {:?}: {}", response, e);
            fallback_nak(response.command)
        }
    }
}

/// NAK laid out by hand: header, version, command, status, little-endian.
fn fallback_nak(command: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CommandResponse::WIRE_SIZE);
    bytes.extend_from_slice(&COMMAND_HEADER.to_le_bytes());
    bytes.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    bytes.extend_from_slice(&command.to_le_bytes());
    bytes.extend_from_slice(&Status::Nak.code().to_le_bytes());
    bytes
}

fn serve(
    context: &Context,
    config: &MessagingConfig,
    socket: Socket,
    streaming: StreamingState,
    running: Arc<AtomicBool>,
) {
    let mut socket = Some(socket);
    let mut consecutive_errors = 0u32;
    while running.load(Ordering::SeqCst) {
        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            // A REP socket stuck in the wrong state never recovers on its own.
            warn!("Recreating command socket after {} errors", consecutive_errors);
            drop(socket.take());
            match bind_command_socket(context, config) {
                Ok(fresh) => {
                    socket = Some(fresh);
                    consecutive_errors = 0;
                }
                Err(e) => {
                    error!("Failed to recreate command socket: {}", e);
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            }
        }

        // Only reached with a live socket: a failed rebind `continue`s above.
        let socket = socket.as_ref().expect("command socket present");
        let bytes = match socket.recv_bytes(0) {
            Ok(bytes) => bytes,
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => continue,
            Err(e) => {
                error!("Command receive failed: {}", e);
                consecutive_errors += 1;
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        };

        let response = handle_request(&bytes, &streaming);
        debug!("Command reply: {:?}", response);
        match socket.send(encode_reply(&response), 0) {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                error!("Command reply failed: {}", e);
                consecutive_errors += 1;
            }
        }
    }
    debug!("Command thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&COMMAND_HEADER.to_le_bytes());
        bytes.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        bytes.extend_from_slice(&command.to_le_bytes());
        bytes
    }

    #[test]
    fn test_start_and_stop_toggle_streaming() {
        let streaming = StreamingState::new();
        assert!(!streaming.is_streaming());

        let reply = handle_request(&request(2), &streaming);
        assert!(reply.is_ack());
        assert_eq!(reply.command, 2);
        assert!(streaming.is_streaming());

        // Idempotent.
        assert!(handle_request(&request(2), &streaming).is_ack());
        assert!(streaming.is_streaming());

        assert!(handle_request(&request(1), &streaming).is_ack());
        assert!(!streaming.is_streaming());
        assert!(handle_request(&request(1), &streaming).is_ack());
        assert!(!streaming.is_streaming());
    }

    #[test]
    fn test_unsupported_commands_are_nacked() {
        let streaming = StreamingState::new();
        streaming.set(true);
        for code in [0, 3, 4, 99] {
            let reply = handle_request(&request(code), &streaming);
            assert_eq!(reply.status(), Status::Nak);
            assert_eq!(reply.command, code);
            assert!(streaming.is_streaming());
        }
    }

    #[test]
    fn test_malformed_request_is_nacked() {
        let streaming = StreamingState::new();
        let reply = handle_request(&[1, 2, 3], &streaming);
        assert_eq!(reply.status(), Status::Nak);
        assert_eq!(reply.command, Command::RawCommand.code());

        let mut wrong_header = request(2);
        wrong_header[0] = 9;
        assert!(!handle_request(&wrong_header, &streaming).is_ack());
        assert!(!streaming.is_streaming());
    }

    #[test]
    fn test_server_round_trip_over_inproc() {
        let context = Context::new();
        let config = MessagingConfig {
            command_endpoint: "inproc://tof-command-test".to_string(),
            command_poll_ms: 20,
            ..Default::default()
        };
        let streaming = StreamingState::new();
        let running = Arc::new(AtomicBool::new(true));
        let server =
            CommandServer::spawn(&context, &config, streaming.clone(), running.clone()).unwrap();

        let client = context.socket(zmq::REQ).unwrap();
        client.set_rcvtimeo(2000).unwrap();
        client.connect(&config.command_endpoint).unwrap();

        let bytes = CommandRequest::new(Command::StreamStart).encode().unwrap();
        client.send(bytes, 0).unwrap();
        let reply = CommandResponse::decode(&client.recv_bytes(0).unwrap()).unwrap();
        assert!(reply.is_ack());
        assert!(streaming.is_streaming());

        let bytes = CommandRequest::new(Command::PowerOff).encode().unwrap();
        client.send(bytes, 0).unwrap();
        let reply = CommandResponse::decode(&client.recv_bytes(0).unwrap()).unwrap();
        assert_eq!(reply.status(), Status::Nak);
        assert!(streaming.is_streaming());

        running.store(false, Ordering::SeqCst);
        server.join().unwrap();
    }

    #[test]
    fn test_reply_encoding_matches_wire_layout() {
        let reply = encode_reply(&CommandResponse::ack(2));
        assert_eq!(reply.len(), CommandResponse::WIRE_SIZE);
        assert!(CommandResponse::decode(&reply).unwrap().is_ack());

        let fallback = fallback_nak(7);
        assert_eq!(fallback.len(), CommandResponse::WIRE_SIZE);
        assert_eq!(fallback, CommandResponse::nak(7).encode().unwrap());
        let decoded = CommandResponse::decode(&fallback).unwrap();
        assert_eq!(decoded.status(), Status::Nak);
        assert_eq!(decoded.command, 7);
    }

    #[test]
    fn test_server_recovers_after_abandoned_request() {
        let context = Context::new();
        let config = MessagingConfig {
            command_endpoint: "inproc://tof-command-abandoned".to_string(),
            command_poll_ms: 20,
            ..Default::default()
        };
        let streaming = StreamingState::new();
        let running = Arc::new(AtomicBool::new(true));
        let server =
            CommandServer::spawn(&context, &config, streaming.clone(), running.clone()).unwrap();

        // A client that leaves before reading its reply must not wedge the server.
        {
            let gone = context.socket(zmq::REQ).unwrap();
            gone.set_linger(0).unwrap();
            gone.connect(&config.command_endpoint).unwrap();
            gone.send(request(2), 0).unwrap();
        }

        let client = context.socket(zmq::REQ).unwrap();
        client.set_rcvtimeo(2000).unwrap();
        client.connect(&config.command_endpoint).unwrap();
        client.send(request(1), 0).unwrap();
        let reply = CommandResponse::decode(&client.recv_bytes(0).unwrap()).unwrap();
        assert!(reply.is_ack());
        assert_eq!(reply.command, 1);

        running.store(false, Ordering::SeqCst);
        server.join().unwrap();
    }
}
