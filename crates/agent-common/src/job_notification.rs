// Socket-based job lifecycle notifications for an external monitor process.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use uuid::Uuid;

/// Sends `Start`/`End` lines to a local monitor listening on a TCP socket
/// (a systemd supervisor, a hosted-pool health probe). Unconfigured or
/// unreachable monitors make every notification a no-op; the job never
/// depends on the monitor being alive.
#[derive(Default)]
pub struct JobNotification {
    monitor_socket: Mutex<Option<TcpStream>>,
}

impl JobNotification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to the monitor at `address` ("host:port"). Failures are
    /// logged and leave the sink unconfigured.
    pub fn start_client(&self, address: &str) {
        if address.is_empty() {
            return;
        }

        let socket_addr: SocketAddr = match address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!("Invalid monitor socket address '{address}': {e}");
                return;
            }
        };

        match TcpStream::connect(socket_addr) {
            Ok(stream) => {
                tracing::info!("Connected to monitor at {socket_addr}");
                *self.monitor_socket.lock().unwrap() = Some(stream);
            }
            Err(e) => {
                tracing::error!("Connection to monitor at {socket_addr} failed: {e}");
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.monitor_socket.lock().unwrap().is_some()
    }

    /// Tell the monitor a job is starting.
    pub fn job_started(&self, job_id: Uuid, access_token: &str, server_url: &str) {
        if access_token.is_empty() {
            tracing::debug!("No access token available for the monitor; skipping Start message.");
            return;
        }
        self.send_message(&format!(
            "Start {job_id} {access_token} {server_url} {}",
            std::process::id()
        ));
    }

    /// Tell the monitor a job has finished.
    pub fn job_completed(&self, job_id: Uuid) {
        let _ = job_id;
        self.send_message(&format!("End {}", std::process::id()));
    }

    fn send_message(&self, message: &str) {
        let mut guard = self.monitor_socket.lock().unwrap();
        if let Some(ref mut stream) = *guard {
            if let Err(e) = stream.write_all(message.as_bytes()) {
                tracing::error!("Failed sending message to monitor: {e}");
            }
        }
    }
}

impl Drop for JobNotification {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.monitor_socket.lock() {
            if let Some(ref mut stream) = *guard {
                let _ = stream.write_all(b"<EOF>");
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            *guard = None;
        }
    }
}
