//! Daemon mode: a long-lived process holding the store open.
//!
//! Serves newline-delimited JSON requests over a unix socket in the
//! workspace (`.beads/bd.sock`). Each connection is serviced on its own
//! thread whose lifetime is bounded by the connection; the store sits
//! behind a mutex, so requests serialize exactly as the direct mode's file
//! lock would serialize separate processes. The lock discipline itself is
//! unchanged: flush and sync still take `.sync.lock`.
//!
//! A background thread debounces auto-flush: dirty records sit for one
//! quiet interval before being written, so bursts of edits coalesce into
//! one journal write. With `daemon-auto-sync` configured, a sync follows
//! the debounced flush.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BeadsError, Result};
use crate::session::WorkspaceSession;
use crate::{compact, flush, sync};

/// The socket filename inside a workspace.
pub const SOCKET_FILE: &str = "bd.sock";

/// Auto-flush debounce interval.
const DEBOUNCE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// One request line.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Flush,
    Sync,
    Compact,
    Shutdown,
}

/// One response line.
#[derive(Debug, Serialize)]
pub struct Response {
    pub ok: bool,
    pub detail: String,
}

impl Response {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    fn err(e: &BeadsError) -> Self {
        Self {
            ok: false,
            detail: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serve requests until a shutdown request arrives.
///
/// # Errors
/// Socket binding failures; request-level errors are reported to the
/// client, never fatal to the daemon.
#[cfg(unix)]
pub fn serve(session: WorkspaceSession, socket: Option<PathBuf>) -> Result<()> {
    use std::os::unix::net::{UnixListener, UnixStream};

    let socket_path = socket.unwrap_or_else(|| session.workspace.dir.join(SOCKET_FILE));
    // A previous daemon's socket file blocks bind; it is dead by
    // definition if we got the store open.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(socket = %socket_path.display(), "daemon listening");

    let auto_sync = session.yaml.daemon_auto_sync;
    let stop = Arc::new(AtomicBool::new(false));
    let shared = Arc::new(Mutex::new(session));

    // Debounced auto-flush.
    let flush_stop = Arc::clone(&stop);
    let flush_shared = Arc::clone(&shared);
    let flusher = std::thread::spawn(move || {
        let mut pending_since: Option<std::time::Instant> = None;
        while !flush_stop.load(Ordering::SeqCst) {
            std::thread::sleep(DEBOUNCE);
            let Ok(mut session) = flush_shared.lock() else {
                break;
            };
            let dirty = session.store.has_dirty().unwrap_or(false);
            match (dirty, pending_since) {
                (false, _) => pending_since = None,
                (true, None) => pending_since = Some(std::time::Instant::now()),
                (true, Some(since)) if since.elapsed() >= DEBOUNCE => {
                    let ws = session.workspace.clone();
                    let cancel = session.cancel.clone();
                    if let Err(e) = flush::flush(&mut session.store, &ws, &cancel) {
                        warn!(error = %e, "debounced auto-flush failed");
                    } else if auto_sync {
                        let yaml = session.yaml.clone();
                        if let Err(e) = sync::sync(&mut session.store, &ws, &yaml, &cancel) {
                            warn!(error = %e, "daemon auto-sync failed");
                        }
                    }
                    pending_since = None;
                }
                (true, Some(_)) => {}
            }
        }
    });

    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else { continue };
        let conn_shared = Arc::clone(&shared);
        let conn_stop = Arc::clone(&stop);
        let socket_path = socket_path.clone();
        std::thread::spawn(move || {
            handle_connection(&stream, &conn_shared, &conn_stop);
            // A shutdown request must unblock the acceptor, which sits in
            // accept(); poke it with a throwaway connection.
            if conn_stop.load(Ordering::SeqCst) {
                let _ = UnixStream::connect(&socket_path);
            }
        });
    }

    stop.store(true, Ordering::SeqCst);
    let _ = flusher.join();
    let _ = std::fs::remove_file(&socket_path);
    info!("daemon stopped");
    Ok(())
}

#[cfg(unix)]
fn handle_connection(
    stream: &std::os::unix::net::UnixStream,
    shared: &Arc<Mutex<WorkspaceSession>>,
    stop: &Arc<AtomicBool>,
) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let reader = BufReader::new(read_half);
    let mut writer = stream;

    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&request, shared, stop),
            Err(e) => Response {
                ok: false,
                detail: format!("bad request: {e}"),
            },
        };
        let Ok(mut bytes) = serde_json::to_vec(&response) else {
            break;
        };
        bytes.push(b'\n');
        if writer.write_all(&bytes).is_err() {
            break;
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
}

#[cfg(unix)]
fn dispatch(
    request: &Request,
    shared: &Arc<Mutex<WorkspaceSession>>,
    stop: &Arc<AtomicBool>,
) -> Response {
    let Ok(mut session) = shared.lock() else {
        return Response {
            ok: false,
            detail: "daemon state poisoned".to_owned(),
        };
    };
    let ws = session.workspace.clone();
    let cancel = session.cancel.clone();
    match request {
        Request::Ping => Response::ok("pong"),
        Request::Flush => match flush::flush(&mut session.store, &ws, &cancel) {
            Ok(outcome) => Response::ok(format!("flushed {} records", outcome.records)),
            Err(e) => Response::err(&e),
        },
        Request::Sync => {
            let yaml = session.yaml.clone();
            match sync::sync(&mut session.store, &ws, &yaml, &cancel) {
                Ok(report) => Response::ok(format!(
                    "synced: pulled={} committed={} pushed={}",
                    report.pulled, report.committed, report.pushed
                )),
                Err(e) => Response::err(&e),
            }
        }
        Request::Compact => match compact::compact(&mut session.store, &ws, &cancel) {
            Ok(outcome) => Response::ok(format!("purged {} tombstones", outcome.purged.len())),
            Err(e) => Response::err(&e),
        },
        Request::Shutdown => {
            stop.store(true, Ordering::SeqCst);
            Response::ok("shutting down")
        }
    }
}

/// Daemon mode needs unix sockets.
///
/// # Errors
/// Always, on non-unix platforms.
#[cfg(not(unix))]
pub fn serve(_session: WorkspaceSession, _socket: Option<PathBuf>) -> Result<()> {
    Err(BeadsError::Fatal {
        detail: "daemon mode requires unix domain sockets".to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
