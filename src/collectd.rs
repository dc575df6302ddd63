//! Datagram collector daemon
//!
//! Listens on a unix datagram socket for per-session TLSRPT datagrams from
//! the MTA and feeds them to the configured storage backends. Datagrams are
//! never acknowledged; malformed input is dumped to a file and processing
//! continues.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::CollectdConfig;
use crate::store::PluginRegistry;
use crate::traits::{CollectdBackend, StoreError};

#[derive(Debug, Error)]
pub enum CollectdError {
    #[error("No collectd storage configured")]
    NoStorage,
    #[error("No collectd socketname configured")]
    NoSocketName,
    #[error("Socket error: {0}")]
    Socket(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CollectdError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectdError::NoStorage | CollectdError::NoSocketName => crate::exit::EXIT_USAGE,
            CollectdError::Socket(_) => crate::exit::EXIT_SOCKET,
            CollectdError::Store(e) => e.exit_code(),
        }
    }
}

/// A store failure that must terminate the daemon instead of being retried.
fn is_fatal(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::WrongPurpose { .. } | StoreError::WrongVersion(_) | StoreError::SetupFailed(_)
    )
}

/// Remove the unix domain socket file, e.g. from an earlier unclean shutdown.
fn remove_datagram_socket(server_address: &str, when: &str) {
    let path = Path::new(server_address);
    if path.exists() {
        if let Err(err) = std::fs::remove_file(path) {
            tracing::error!("Failed to remove existing socket {} during {}: {}", server_address, when, err);
        }
    }
}

/// Construct one backend per configured storage URL.
pub fn create_backends(
    cfg: &CollectdConfig,
    registry: &PluginRegistry,
) -> Result<Vec<Box<dyn CollectdBackend>>, CollectdError> {
    let mut backends = Vec::new();
    for url in cfg.storage.split(',') {
        if !url.is_empty() {
            backends.push(registry.collectd_backend(url, cfg)?);
        }
    }
    if backends.is_empty() {
        return Err(CollectdError::NoStorage);
    }
    Ok(backends)
}

/// Resolve the configured user and group names and apply them to the socket.
fn chown_socket(cfg: &CollectdConfig, server_address: &str) {
    if cfg.socketuser.is_empty() && cfg.socketgroup.is_empty() {
        return;
    }
    let uid = if cfg.socketuser.is_empty() {
        None
    } else {
        match nix::unistd::User::from_name(&cfg.socketuser) {
            Ok(Some(user)) => Some(user.uid.as_raw()),
            Ok(None) => {
                tracing::error!("Could not chown socket: unknown user {}", cfg.socketuser);
                return;
            }
            Err(e) => {
                tracing::error!("Could not chown socket: {}", e);
                return;
            }
        }
    };
    let gid = if cfg.socketgroup.is_empty() {
        None
    } else {
        match nix::unistd::Group::from_name(&cfg.socketgroup) {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            Ok(None) => {
                tracing::error!("Could not chown socket: unknown group {}", cfg.socketgroup);
                return;
            }
            Err(e) => {
                tracing::error!("Could not chown socket: {}", e);
                return;
            }
        }
    };
    tracing::info!("Chowning socket {} to {:?}:{:?}", server_address, cfg.socketuser, cfg.socketgroup);
    if let Err(e) = std::os::unix::fs::chown(server_address, uid, gid) {
        tracing::error!("Could not chown socket {}: {}", server_address, e);
    }
}

/// Apply the configured octal permissions to the socket.
fn chmod_socket(cfg: &CollectdConfig, server_address: &str) {
    if cfg.socketmode.is_empty() {
        return;
    }
    if !cfg.socketmode.starts_with('0') {
        tracing::warn!("Config option socketmode '{}' does not look like octal", cfg.socketmode);
    }
    match u32::from_str_radix(&cfg.socketmode, 8) {
        Ok(mode) => {
            tracing::info!("Chmoding socket {} to permissions 0{:o} (decimal {})", server_address, mode, mode);
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(server_address, std::fs::Permissions::from_mode(mode))
            {
                tracing::error!("Could not chmod socket {} to mode {}: {}", server_address, cfg.socketmode, e);
            }
        }
        Err(e) => {
            tracing::error!("Could not chmod socket {} to mode {}: {}", server_address, cfg.socketmode, e);
        }
    }
}

/// Bind the receiving socket and apply ownership and permissions.
fn bind_socket(cfg: &CollectdConfig) -> Result<UnixDatagram, CollectdError> {
    let server_address = cfg.socketname.as_str();
    if server_address.is_empty() {
        return Err(CollectdError::NoSocketName);
    }
    remove_datagram_socket(server_address, "startup");
    tracing::info!("Listening on socket '{}'", server_address);
    let sock = UnixDatagram::bind(server_address)
        .map_err(|e| CollectdError::Socket(e.to_string()))?;
    chown_socket(cfg, server_address);
    chmod_socket(cfg, server_address);
    Ok(sock)
}

/// Persist the raw bytes of a datagram that could not be processed.
fn dump_invalid_datagram(cfg: &CollectdConfig, data: &[u8]) {
    if cfg.dump_path_for_invalid_datagram.is_empty() {
        return;
    }
    if let Err(e) = std::fs::write(&cfg.dump_path_for_invalid_datagram, data) {
        tracing::error!(
            "Could not dump invalid datagram to {}: {}",
            cfg.dump_path_for_invalid_datagram,
            e
        );
    }
}

/// Decode one datagram and dispatch it to every backend.
///
/// Returns a fatal store error when a backend can no longer continue, e.g.
/// when re-creating its store after rollover failed.
pub fn process_datagram(
    cfg: &CollectdConfig,
    backends: &mut [Box<dyn CollectdBackend>],
    data: &[u8],
) -> Result<(), StoreError> {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!("Malformed utf8 data received: {}", err);
            dump_invalid_datagram(cfg, data);
            return Ok(());
        }
    };
    let datagram: serde_json::Value = match serde_json::from_str(text) {
        Ok(datagram) => datagram,
        Err(err) => {
            tracing::error!("JSON decode error: {}", err);
            dump_invalid_datagram(cfg, data);
            return Ok(());
        }
    };
    for backend in backends.iter_mut() {
        if let Err(err) = backend.add_datagram(&datagram) {
            if is_fatal(&err) {
                return Err(err);
            }
            match err {
                StoreError::MissingKey(key) => {
                    tracing::error!("Missing key '{}' during processing datagram: {}", key, datagram);
                }
                other => tracing::error!("Database error: {}", other),
            }
        }
    }
    Ok(())
}

async fn run_inner(cfg: &CollectdConfig, registry: &PluginRegistry) -> Result<i32, CollectdError> {
    tracing::info!("TLSRPT collectd starting");
    let mut backends = create_backends(cfg, registry)?;
    let sock = bind_socket(cfg)?;
    let server_address = cfg.socketname.clone();

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| CollectdError::Socket(e.to_string()))?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| CollectdError::Socket(e.to_string()))?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(|e| CollectdError::Socket(e.to_string()))?;

    let mut buf = vec![0u8; crate::MAX_READ_COLLECTD];
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                return Ok(shutdown(sock, &server_address, &mut backends));
            }
            _ = sigterm.recv() => {
                return Ok(shutdown(sock, &server_address, &mut backends));
            }
            _ = sigusr2.recv() => {
                tracing::info!("Caught SIGUSR2, enforce debug day roll-over for development");
                for backend in backends.iter_mut() {
                    if let Err(e) = backend.switch_to_next_day(true) {
                        if is_fatal(&e) {
                            return Err(e.into());
                        }
                        tracing::error!("Database error: {}", e);
                    }
                }
            }
            received = tokio::time::timeout(Duration::from_secs(cfg.sockettimeout), sock.recv(&mut buf)) => {
                match received {
                    Err(_elapsed) => {
                        for backend in backends.iter_mut() {
                            if let Err(e) = backend.socket_timeout() {
                                if is_fatal(&e) {
                                    return Err(e.into());
                                }
                                tracing::error!("Database error: {}", e);
                            }
                        }
                    }
                    Ok(Ok(n)) => {
                        process_datagram(cfg, &mut backends, &buf[..n])?;
                    }
                    Ok(Err(err)) => {
                        tracing::error!("OS-Error: {}", err);
                        return Err(CollectdError::Socket(err.to_string()));
                    }
                }
            }
        }
    }
}

/// Close the socket and flush every backend.
fn shutdown(
    sock: UnixDatagram,
    server_address: &str,
    backends: &mut [Box<dyn CollectdBackend>],
) -> i32 {
    tracing::info!("Caught signal, cleaning up");
    let mut exitcode = 0;
    drop(sock);
    let path = Path::new(server_address);
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::error!("Exception during shutdown: {}", e);
            exitcode = crate::exit::EXIT_SHUTDOWN_SOCKETCLOSE;
        }
    }
    for backend in backends.iter_mut() {
        tracing::info!("Triggering socket timeout on collectd");
        if let Err(e) = backend.socket_timeout() {
            tracing::error!("Exception during shutdown: {}", e);
            exitcode = crate::exit::EXIT_SHUTDOWN_COLLECTDPLUGIN;
        }
    }
    tracing::info!("Done");
    exitcode
}

/// Daemon entry point, mapping all failures to their process exit code.
pub async fn run(cfg: &CollectdConfig, registry: &PluginRegistry) -> i32 {
    match run_inner(cfg, registry).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    }
}
