//! RPC surface: a process-local Unix domain socket server re-exposing the
//! engine's public methods.
//!
//! One reader thread per accepted connection, a writer half joined to it
//! by an internal channel so a slow request never blocks the read loop,
//! and each request dispatched onto its own thread so one slow action
//! never stalls another connection's replies.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use serde_json::json;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::error::EngineResult;
use crate::registry::Registry;

mod dispatch;

/// Shared state every connection's request handlers read from.
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub cache: Arc<dyn Cache>,
}

/// Binds `socket_path` and serves forever, one thread per accepted
/// connection. Removes a stale socket file from a previous run first.
pub fn serve(socket_path: &Path, state: ServerState) -> EngineResult<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "rpc server listening");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = state.clone();
                thread::spawn(move || handle_client(stream, state));
            }
            Err(e) => warn!(error = %e, "failed to accept rpc connection"),
        }
    }
    Ok(())
}

/// One frame out: `[4-byte big-endian length][JSON payload]`.
fn send_frame(stream: &mut UnixStream, payload: &[u8]) -> std::io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    stream.write_all(&len)?;
    stream.write_all(payload)?;
    stream.flush()
}

/// Reads newline-delimited JSON requests, offloads each to its own thread,
/// and serializes responses back out through a writer thread fed by an
/// mpsc channel — requests may complete out of order, but `requestId`
/// lets the client re-associate them (same multiplexing contract as the
/// teacher's `handle_client`).
fn handle_client(stream: UnixStream, state: ServerState) {
    let peer_write = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to clone rpc connection for writing");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Vec<u8>>();

    let writer_handle = thread::spawn(move || {
        let mut peer_write = peer_write;
        for frame in rx {
            if send_frame(&mut peer_write, &frame).is_err() {
                break;
            }
        }
    });

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if !l.trim().is_empty() => l,
            Ok(_) => continue,
            Err(_) => break,
        };

        let tx = tx.clone();
        let state = state.clone();
        thread::spawn(move || {
            let response = dispatch::handle_request(&line, &state);
            let bytes = serde_json::to_vec(&response).unwrap_or_else(|_| {
                serde_json::to_vec(&json!({"success": false, "error": "failed to serialize response"}))
                    .expect("literal json! value always serializes")
            });
            let _ = tx.send(bytes);
        });
    }

    drop(tx);
    let _ = writer_handle.join();
}
