//! Device transport abstraction.
//!
//! The core never talks to `adb` directly; it drives a [`DeviceTransport`]
//! that can push the server binary, spawn the server process, and open the
//! tunnel carrying the protocol sockets. [`AdbTransport`] is the production
//! implementation over the `adb` CLI; tests plug in loopback transports.
//!
//! ## Tunnel discipline
//!
//! One forwarded TCP port carries up to three streams, accepted or
//! connected in fixed order: video, audio, control, each conditional on its
//! enable flag. `tunnel_forward = true` means the host connects to the
//! device; the default reverse mode has the device connect to a listener on
//! the host.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ScryError;

/// Java entry point of the server binary.
const SERVER_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";

// ── Traits ───────────────────────────────────────────────────────

/// Handle over a spawned server process.
#[async_trait]
pub trait ServerProcess: Send + 'static {
    /// Resolves when the server process exits.
    async fn wait(&mut self) -> Result<(), ScryError>;

    /// Terminate the process if it is still alive.
    async fn terminate(&mut self);
}

/// Minimal surface of the device tunnel.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    type Server: ServerProcess;

    /// Push a local file to the device.
    async fn push(&self, local_path: &Path, remote_path: &str) -> Result<(), ScryError>;

    /// Spawn the server with `remote_path` as its classpath and `args` as
    /// its argv (version first, then `key=value` options).
    async fn spawn_server(
        &self,
        remote_path: &str,
        args: &[String],
    ) -> Result<Self::Server, ScryError>;

    /// Install the tunnel on `port` and return the stream factory.
    ///
    /// In reverse mode this must bind the local listener before the server
    /// is spawned, so the device's connection attempts have somewhere to go.
    async fn open_tunnel(&self, port: u16, forward: bool) -> Result<Tunnel, ScryError>;
}

// ── Tunnel ───────────────────────────────────────────────────────

/// Factory producing the ordered TCP streams of one session.
pub struct Tunnel {
    mode: TunnelMode,
    streams_opened: u32,
}

enum TunnelMode {
    /// Host connects to the forwarded port, retrying until it is live.
    Forward {
        addr: SocketAddr,
        attempts: u32,
        retry_delay: Duration,
    },
    /// Device connects to a listener on the host.
    Reverse { listener: TcpListener },
}

impl Tunnel {
    /// Connect-mode tunnel targeting `addr`. No I/O happens until
    /// [`next_stream`](Self::next_stream).
    pub fn forward(addr: SocketAddr) -> Self {
        Self {
            mode: TunnelMode::Forward {
                addr,
                attempts: 100,
                retry_delay: Duration::from_millis(100),
            },
            streams_opened: 0,
        }
    }

    /// Accept-mode tunnel listening on `addr`. Binds immediately.
    pub async fn reverse(addr: SocketAddr) -> Result<Self, ScryError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::reverse_with(listener))
    }

    /// Accept-mode tunnel over an already-bound listener.
    pub fn reverse_with(listener: TcpListener) -> Self {
        Self {
            mode: TunnelMode::Reverse { listener },
            streams_opened: 0,
        }
    }

    /// The local address of a reverse-mode listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            TunnelMode::Reverse { listener } => listener.local_addr().ok(),
            TunnelMode::Forward { .. } => None,
        }
    }

    /// Produce the next stream in protocol order.
    pub async fn next_stream(&mut self) -> Result<TcpStream, ScryError> {
        let stream = match &mut self.mode {
            TunnelMode::Forward {
                addr,
                attempts,
                retry_delay,
            } => {
                // The forwarded port exists before the server listens on the
                // device side, so the first connects may be refused.
                let mut last_err = None;
                let mut connected = None;
                for attempt in 0..*attempts {
                    match TcpStream::connect(*addr).await {
                        Ok(s) => {
                            connected = Some(s);
                            break;
                        }
                        Err(e) => {
                            debug!(attempt, error = %e, "tunnel connect failed, retrying");
                            last_err = Some(e);
                            tokio::time::sleep(*retry_delay).await;
                        }
                    }
                }
                connected.ok_or_else(|| {
                    ScryError::Transport(format!(
                        "tunnel connect to {addr} failed after {attempts} attempts: {}",
                        last_err
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "no attempts made".to_string())
                    ))
                })?
            }
            TunnelMode::Reverse { listener } => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "tunnel stream accepted");
                stream
            }
        };
        let _ = stream.set_nodelay(true);
        self.streams_opened += 1;
        Ok(stream)
    }

    /// How many streams this tunnel has produced so far.
    pub fn streams_opened(&self) -> u32 {
        self.streams_opened
    }
}

// ── AdbTransport ─────────────────────────────────────────────────

/// Production transport driving the `adb` CLI.
pub struct AdbTransport {
    adb_path: PathBuf,
    serial: String,
    /// Abstract socket name the tunnel binds on the device
    /// (`scrcpy_<scid8hex>`).
    socket_name: String,
}

impl AdbTransport {
    pub fn new(serial: impl Into<String>, socket_name: impl Into<String>) -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            serial: serial.into(),
            socket_name: socket_name.into(),
        }
    }

    pub fn with_adb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.adb_path = path.into();
        self
    }

    async fn run_adb(&self, args: &[&str]) -> Result<(), ScryError> {
        let output = Command::new(&self.adb_path)
            .arg("-s")
            .arg(&self.serial)
            .args(args)
            .output()
            .await
            .map_err(|e| ScryError::Transport(format!("failed to run adb: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScryError::Transport(format!(
                "adb {} failed ({}): {}",
                args.first().copied().unwrap_or(""),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceTransport for AdbTransport {
    type Server = AdbServer;

    async fn push(&self, local_path: &Path, remote_path: &str) -> Result<(), ScryError> {
        let local = local_path.to_string_lossy();
        info!(%local, remote = remote_path, "pushing server binary");
        self.run_adb(&["push", &local, remote_path]).await
    }

    async fn spawn_server(
        &self,
        remote_path: &str,
        args: &[String],
    ) -> Result<AdbServer, ScryError> {
        debug!(?args, "spawning server");
        let child = Command::new(&self.adb_path)
            .arg("-s")
            .arg(&self.serial)
            .arg("shell")
            .arg(format!("CLASSPATH={remote_path}"))
            .arg("app_process")
            .arg("/")
            .arg(SERVER_MAIN_CLASS)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScryError::Transport(format!("failed to spawn server: {e}")))?;
        Ok(AdbServer { child })
    }

    async fn open_tunnel(&self, port: u16, forward: bool) -> Result<Tunnel, ScryError> {
        let abstract_name = format!("localabstract:{}", self.socket_name);
        if forward {
            self.run_adb(&["forward", &format!("tcp:{port}"), &abstract_name])
                .await?;
            Ok(Tunnel::forward(([127, 0, 0, 1], port).into()))
        } else {
            // Bind before installing the reverse so device-side connects land.
            let tunnel = Tunnel::reverse(([127, 0, 0, 1], port).into()).await?;
            self.run_adb(&["reverse", &abstract_name, &format!("tcp:{port}")])
                .await?;
            Ok(tunnel)
        }
    }
}

/// Server process spawned through `adb shell app_process`.
pub struct AdbServer {
    child: Child,
}

#[async_trait]
impl ServerProcess for AdbServer {
    async fn wait(&mut self) -> Result<(), ScryError> {
        let status = self.child.wait().await?;
        if status.success() {
            info!("server process exited cleanly");
        } else {
            warn!(%status, "server process exited");
        }
        Ok(())
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "server already gone");
        }
        let _ = self.child.wait().await;
    }
}
