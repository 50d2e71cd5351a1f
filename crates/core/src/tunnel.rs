// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 BTP Tunnel Contributors

// BTP Tunnel - Tunnel Module
// Opens the gateway SSH session and relays local listeners over it using russh

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use russh::client::{self, AuthResult, Config, Handle, KeyboardInteractiveAuthResponse};
use russh::{MethodKind, MethodSet};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use btp_tunnel_common::{
    format_host_port, AuthFailure, Error, ForwardSpec, Result, Secret, TunnelEvent, TunnelOptions,
    TunnelState,
};

use crate::host_key::{Fingerprint, HostKeyPolicy};

/// How long `close` waits for relays to wind down
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Keyboard-interactive rounds answered before giving up
const MAX_KBD_ROUNDS: usize = 3;
/// How often a listening tunnel checks that its gateway session is alive
const SESSION_CHECK_INTERVAL: Duration = Duration::from_millis(250);
/// Error state of a tunnel whose gateway connection dropped
const SESSION_LOST: &str = "Gateway session lost";

/// Everything needed to open one tunnel
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub gateway_host: String,
    pub gateway_port: u16,
    pub username: String,
    /// One-time password; also the keyboard-interactive answer
    pub password: Secret,
    pub forwards: Vec<ForwardSpec>,
    pub host_key: HostKeyPolicy,
}

impl TunnelRequest {
    pub fn validate(&self) -> Result<()> {
        if self.gateway_host.trim().is_empty() {
            return Err(Error::Config("Gateway host cannot be empty".to_string()));
        }
        if self.gateway_port == 0 {
            return Err(Error::Config("Gateway port must be greater than 0".to_string()));
        }
        if self.username.is_empty() {
            return Err(Error::Config("SSH username cannot be empty".to_string()));
        }
        if self.forwards.is_empty() {
            return Err(Error::Config("At least one forward is required".to_string()));
        }

        let mut seen = HashSet::new();
        for forward in &self.forwards {
            forward.validate()?;
            if forward.local_port != 0 && !seen.insert((forward.bind_address, forward.local_port)) {
                return Err(Error::Config(format!(
                    "Local port {} is forwarded twice",
                    forward.local_port
                )));
            }
        }
        Ok(())
    }

    fn gateway(&self) -> String {
        format_host_port(&self.gateway_host, self.gateway_port)
    }
}

/// Registry of tunnel handles plus the event broadcaster they share
#[derive(Clone)]
pub struct TunnelManager {
    options: Arc<TunnelOptions>,
    tunnels: Arc<RwLock<HashMap<Uuid, TunnelHandle>>>,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelManager {
    pub fn new(options: TunnelOptions) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            options: Arc::new(options),
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Subscribe to tunnel events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    /// Register a fresh, unopened handle.
    ///
    /// Useful when another task may need to close the tunnel while it opens.
    pub async fn create_handle(&self) -> TunnelHandle {
        let handle = TunnelHandle::new(self.options.clone(), self.event_tx.clone());
        let mut tunnels = self.tunnels.write().await;
        tunnels.retain(|_, existing| !existing.is_finished());
        tunnels.insert(handle.id(), handle.clone());
        handle
    }

    /// Create and open a tunnel
    pub async fn open(&self, request: TunnelRequest) -> Result<TunnelHandle> {
        let handle = self.create_handle().await;
        match handle.open(request).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.tunnels.write().await.remove(&handle.id());
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<TunnelHandle> {
        self.tunnels.read().await.get(id).cloned()
    }

    /// Get all listening tunnel IDs and their local addresses
    pub async fn list_active(&self) -> Vec<(Uuid, Vec<SocketAddr>)> {
        let tunnels = self.tunnels.read().await;
        tunnels
            .values()
            .filter(|t| t.state().is_listening())
            .map(|t| (t.id(), t.local_addrs()))
            .collect()
    }

    /// Close one tunnel. Unknown ids are ignored.
    pub async fn close(&self, id: &Uuid) -> Result<()> {
        let handle = self.tunnels.write().await.remove(id);
        match handle {
            Some(handle) => handle.close().await,
            None => {
                debug!("Tunnel {} not registered, nothing to close", id);
                Ok(())
            }
        }
    }

    /// Close every tunnel (best-effort)
    pub async fn close_all(&self) {
        let handles: Vec<TunnelHandle> = {
            let mut tunnels = self.tunnels.write().await;
            tunnels.drain().map(|(_, handle)| handle).collect()
        };

        for handle in handles {
            if let Err(e) = handle.close().await {
                warn!("Failed to close tunnel {} during shutdown: {}", handle.id(), e);
            }
        }
    }
}

type Session = Arc<Handle<GatewayHandler>>;
type SessionSlot = Arc<Mutex<Option<Session>>>;

/// One SSH session and the listeners relayed over it.
///
/// Cheap to clone; all clones control the same tunnel. Once every clone is
/// gone (the manager keeps one until the tunnel is closed) the listeners and
/// relays stop.
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    id: Uuid,
    options: Arc<TunnelOptions>,
    event_tx: broadcast::Sender<TunnelEvent>,
    state: Arc<watch::Sender<TunnelState>>,
    started: AtomicBool,
    finished: AtomicBool,
    accept_cancel: CancellationToken,
    relay_cancel: CancellationToken,
    session: SessionSlot,
    listeners: Mutex<Vec<BoundListener>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    relays: TaskTracker,
}

/// A bound local address and the remote port it forwards to
#[derive(Debug, Clone, Copy)]
struct BoundListener {
    local: SocketAddr,
    remote_port: u16,
}

impl Drop for TunnelInner {
    fn drop(&mut self) {
        self.accept_cancel.cancel();
        self.relay_cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit(event_tx: &broadcast::Sender<TunnelEvent>, event: TunnelEvent) {
    // No subscribers is fine
    let _ = event_tx.send(event);
}

fn set_state(
    id: Uuid,
    state_tx: &watch::Sender<TunnelState>,
    event_tx: &broadcast::Sender<TunnelEvent>,
    state: TunnelState,
) {
    debug!("Tunnel {} is now {}", id, state);
    state_tx.send_replace(state.clone());
    emit(
        event_tx,
        TunnelEvent::StateChanged {
            id,
            state,
            timestamp: Utc::now(),
        },
    );
}

impl TunnelHandle {
    fn new(options: Arc<TunnelOptions>, event_tx: broadcast::Sender<TunnelEvent>) -> Self {
        let (state, _) = watch::channel(TunnelState::Closed);
        Self {
            inner: Arc::new(TunnelInner {
                id: Uuid::new_v4(),
                options,
                event_tx,
                state: Arc::new(state),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                accept_cancel: CancellationToken::new(),
                relay_cancel: CancellationToken::new(),
                session: Arc::new(Mutex::new(None)),
                listeners: Mutex::new(Vec::new()),
                accept_tasks: Mutex::new(Vec::new()),
                relays: TaskTracker::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> TunnelState {
        self.inner.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    /// Addresses the listeners are bound to
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.inner.listeners).iter().map(|l| l.local).collect()
    }

    /// First local address forwarding to `remote_port`
    pub fn local_addr_for(&self, remote_port: u16) -> Option<SocketAddr> {
        lock(&self.inner.listeners)
            .iter()
            .find(|l| l.remote_port == remote_port)
            .map(|l| l.local)
    }

    /// Relays currently moving bytes
    pub fn active_connections(&self) -> usize {
        self.inner.relays.len()
    }

    /// Closed for good, or failed
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TunnelState) {
        set_state(self.inner.id, &self.inner.state, &self.inner.event_tx, state);
    }

    /// Authenticate to the gateway, then bind every forward.
    ///
    /// On failure nothing stays open. A concurrent `close` makes this fail
    /// with a tunnel error.
    pub async fn open(&self, request: TunnelRequest) -> Result<()> {
        request.validate()?;

        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Tunnel("Tunnel handle was already opened".to_string()));
        }

        let cancel = self.inner.accept_cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Tunnel("Tunnel closed while opening".to_string())),
            result = self.establish(&request) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Failed to open tunnel {} to {}: {}", self.id(), request.gateway(), e);
                let closed_by_us = !self.inner.finished.swap(true, Ordering::SeqCst);
                self.teardown().await;
                if closed_by_us {
                    self.set_state(TunnelState::Error(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, request: &TunnelRequest) -> Result<()> {
        self.set_state(TunnelState::Authenticating);
        let session = connect_gateway(&self.inner.options, request).await?;
        *lock(&self.inner.session) = Some(Arc::new(session));

        if self.inner.accept_cancel.is_cancelled() {
            return Err(Error::Tunnel("Tunnel closed while opening".to_string()));
        }

        self.set_state(TunnelState::Connecting);
        for forward in &request.forwards {
            self.bind_forward(forward).await?;
        }

        self.set_state(TunnelState::Listening);
        self.spawn_session_watch();
        info!(
            "Tunnel {} via {} listening on {:?}",
            self.id(),
            request.gateway(),
            self.local_addrs()
        );
        Ok(())
    }

    async fn bind_forward(&self, forward: &ForwardSpec) -> Result<()> {
        let mut port = forward.local_port;

        for target in forward.bind_targets() {
            let addr = SocketAddr::new(target.ip, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    // Later targets share the port the first one got
                    port = local.port();
                    info!("Listening on {} -> {}", local, forward.remote());
                    self.spawn_accept_loop(listener, local, forward.clone());
                }
                Err(e) if target.required => {
                    error!("Failed to bind {}: {}", addr, e);
                    return Err(Error::Tunnel(bind_failure(addr, &e)));
                }
                Err(e) => {
                    warn!("Skipping optional listener {}: {}", addr, e);
                }
            }
        }
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener, local: SocketAddr, forward: ForwardSpec) {
        let inner = &self.inner;
        let relay = RelayContext {
            id: inner.id,
            forward: Arc::new(forward),
            tunnel: Arc::downgrade(inner),
            session: inner.session.clone(),
            relays: inner.relays.clone(),
            relay_cancel: inner.relay_cancel.clone(),
            event_tx: inner.event_tx.clone(),
        };
        let cancel = inner.accept_cancel.clone();
        let remote_port = relay.forward.remote_port;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Listener {} stopped", local);
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => relay.dispatch(stream, peer),
                        Err(e) => warn!("Failed to accept connection on {}: {}", local, e),
                    }
                }
            }
        });

        lock(&inner.listeners).push(BoundListener {
            local,
            remote_port,
        });
        lock(&inner.accept_tasks).push(task);
    }

    /// Release the tunnel once the gateway session has dropped
    fn spawn_session_watch(&self) {
        let tunnel = Arc::downgrade(&self.inner);
        let session = self.inner.session.clone();
        let cancel = self.inner.accept_cancel.clone();

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(SESSION_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                let closed = lock(&session).as_ref().map_or(true, |s| s.is_closed());
                if closed {
                    break;
                }
            }
            if let Some(inner) = tunnel.upgrade() {
                TunnelHandle { inner }.session_lost().await;
            }
        });
    }

    /// Tear down after the gateway dropped and leave the handle in `Error`.
    ///
    /// Does nothing when the handle is already finished.
    async fn session_lost(&self) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Tunnel {}: gateway session lost, releasing listeners", self.id());
        self.teardown().await;
        self.set_state(TunnelState::Error(SESSION_LOST.to_string()));
    }

    /// Stop listeners, disconnect the session, then drop the relays.
    ///
    /// Closing an unopened or already closed handle does nothing.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.started.load(Ordering::SeqCst) {
            debug!("Tunnel {} was never opened, nothing to close", self.id());
            return Ok(());
        }
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            debug!("Tunnel {} already closed", self.id());
            return Ok(());
        }

        info!("Closing tunnel {}", self.id());
        self.teardown().await;
        self.set_state(TunnelState::Closed);
        Ok(())
    }

    async fn teardown(&self) {
        let inner = &self.inner;

        inner.accept_cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&inner.accept_tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Listener task of tunnel {} ended abnormally: {}", inner.id, e);
            }
        }
        lock(&inner.listeners).clear();

        let session = lock(&inner.session).take();
        if let Some(session) = session {
            if let Err(e) = session
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("Failed to disconnect gracefully: {}", e);
            }
        }

        inner.relay_cancel.cancel();
        inner.relays.close();
        if tokio::time::timeout(RELAY_DRAIN_TIMEOUT, inner.relays.wait())
            .await
            .is_err()
        {
            warn!(
                "Tunnel {}: {} relays still running after {:?}",
                inner.id,
                inner.relays.len(),
                RELAY_DRAIN_TIMEOUT
            );
        }
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("listeners", &self.local_addrs())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// What an accept loop needs to relay one connection
struct RelayContext {
    id: Uuid,
    forward: Arc<ForwardSpec>,
    // Weak: an accept loop must not keep a dropped tunnel alive
    tunnel: Weak<TunnelInner>,
    session: SessionSlot,
    relays: TaskTracker,
    relay_cancel: CancellationToken,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl RelayContext {
    fn ready_session(&self) -> Option<Session> {
        let session = lock(&self.session).clone()?;
        if session.is_closed() {
            // Teardown joins this accept loop, so it runs on its own task
            if let Some(inner) = self.tunnel.upgrade() {
                tokio::spawn(async move { TunnelHandle { inner }.session_lost().await });
            }
            return None;
        }
        Some(session)
    }

    fn reject(&self, peer: SocketAddr, reason: &str) {
        emit(
            &self.event_tx,
            TunnelEvent::ConnectionRejected {
                id: self.id,
                peer,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Hand one accepted socket to its own relay task
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(session) = self.ready_session() else {
            debug!("Rejecting {}: no gateway session", peer);
            self.reject(peer, "no gateway session");
            return;
        };

        debug!("Accepted connection from {}", peer);
        let forward = self.forward.clone();
        let cancel = self.relay_cancel.clone();
        let event_tx = self.event_tx.clone();
        let id = self.id;

        self.relays.spawn(async move {
            let channel = match session
                .channel_open_direct_tcpip(
                    forward.remote_host.clone(),
                    u32::from(forward.remote_port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Failed to open channel to {} for {}: {}", forward.remote(), peer, e);
                    emit(
                        &event_tx,
                        TunnelEvent::ConnectionRejected {
                            id,
                            peer,
                            reason: format!("channel open failed: {}", e),
                            timestamp: Utc::now(),
                        },
                    );
                    return;
                }
            };

            emit(
                &event_tx,
                TunnelEvent::ConnectionOpened {
                    id,
                    peer,
                    remote: forward.remote(),
                    timestamp: Utc::now(),
                },
            );
            relay(stream, channel, cancel).await;
        });
    }
}

/// Copy bytes both ways until either side closes or the tunnel shuts down
async fn relay(mut stream: TcpStream, channel: russh::Channel<client::Msg>, cancel: CancellationToken) {
    let mut channel_stream = channel.into_stream();

    tokio::select! {
        _ = cancel.cancelled() => debug!("Relay stopped by tunnel shutdown"),
        result = copy_bidirectional(&mut stream, &mut channel_stream) => match result {
            Ok((to_gateway, from_gateway)) => debug!(
                "Forward connection closed: {} bytes sent, {} bytes received",
                to_gateway, from_gateway
            ),
            Err(e) => debug!("Forward connection ended: {}", e),
        },
    }
}

fn bind_failure(addr: SocketAddr, e: &std::io::Error) -> String {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => format!(
            "Permission denied binding to {}. Port {} is privileged and requires elevated permissions",
            addr,
            addr.port()
        ),
        std::io::ErrorKind::AddrInUse => format!("Local address {} is already in use", addr),
        _ => format!("Failed to bind to {}: {}", addr, e),
    }
}

/// SSH client handler checking the gateway host key
pub struct GatewayHandler {
    gateway: String,
    host_key: HostKeyPolicy,
}

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let actual = Fingerprint::of(server_public_key);
        match &self.host_key {
            HostKeyPolicy::AcceptAny => {
                warn!(
                    "Accepting host key {} of {} WITHOUT verification",
                    actual, self.gateway
                );
                Ok(true)
            }
            HostKeyPolicy::Fingerprint(expected) if expected.matches(server_public_key) => {
                info!("Host key verified for {}", self.gateway);
                Ok(true)
            }
            HostKeyPolicy::Fingerprint(expected) => {
                error!(
                    "Host key of {} does not match: expected {}, got {}",
                    self.gateway, expected, actual
                );
                Ok(false)
            }
        }
    }
}

async fn connect_gateway(options: &TunnelOptions, request: &TunnelRequest) -> Result<Handle<GatewayHandler>> {
    let mut cfg = Config::default();
    cfg.window_size = options.window_size;
    cfg.maximum_packet_size = options.max_packet_size;
    cfg.nodelay = options.nodelay;
    cfg.keepalive_interval = options.keepalive();
    cfg.keepalive_max = options.keepalive_max as usize;
    let config = Arc::new(cfg);

    let addr = request.gateway();
    if request.host_key == HostKeyPolicy::AcceptAny {
        warn!("Connecting to {} in insecure mode: host key is not verified", addr);
    }

    let handler = GatewayHandler {
        gateway: addr.clone(),
        host_key: request.host_key.clone(),
    };

    info!("Connecting to SSH gateway: {}", addr);
    let connect_timeout = options.connect_timeout();
    let mut session = match tokio::time::timeout(
        connect_timeout,
        client::connect(config, (request.gateway_host.as_str(), request.gateway_port), handler),
    )
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(russh::Error::UnknownKey)) => {
            return Err(Error::Tunnel(format!(
                "Host key of {} does not match the published fingerprint",
                addr
            )));
        }
        Ok(Err(russh::Error::IO(e))) => {
            error!("Failed to connect to {}: {}", addr, e);
            return Err(Error::Unavailable(format!("SSH gateway {} unreachable: {}", addr, e)));
        }
        Ok(Err(e)) => {
            error!("SSH handshake with {} failed: {}", addr, e);
            return Err(Error::Tunnel(format!("SSH handshake with {} failed: {}", addr, e)));
        }
        Err(_) => {
            error!("Connection to {} timed out after {:?}", addr, connect_timeout);
            return Err(Error::Unavailable(format!(
                "Connection to {} timed out after {:?}",
                addr, connect_timeout
            )));
        }
    };

    authenticate(&mut session, &request.username, &request.password).await?;
    info!("SSH authentication successful");
    Ok(session)
}

fn method_names(methods: &MethodSet) -> Vec<String> {
    methods
        .iter()
        .map(|m| {
            let s: &str = m.into();
            s.to_string()
        })
        .collect()
}

fn auth_rejected(kind: &str, methods: &[String], partial_success: bool) -> Error {
    let methods_str = if methods.is_empty() {
        "No authentication methods available".to_string()
    } else {
        format!("Server requires: {}", methods.join(", "))
    };
    let message = if partial_success {
        format!("{} authentication partially successful. {}", kind, methods_str)
    } else {
        format!("{} authentication rejected. {}", kind, methods_str)
    };
    error!("{}", message);
    Error::authentication(AuthFailure::InvalidCredentials, message)
}

async fn authenticate(session: &mut Handle<GatewayHandler>, user: &str, password: &Secret) -> Result<()> {
    let result = session
        .authenticate_password(user, password.expose())
        .await
        .map_err(|e| Error::Tunnel(format!("Password authentication failed: {}", e)))?;

    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            if remaining_methods
                .iter()
                .any(|m| *m == MethodKind::KeyboardInteractive)
            {
                info!("Password refused, trying keyboard-interactive");
                return authenticate_keyboard_interactive(session, user, password).await;
            }
            Err(auth_rejected(
                "Password",
                &method_names(&remaining_methods),
                partial_success,
            ))
        }
    }
}

/// Answer every keyboard-interactive prompt with the one-time password
async fn authenticate_keyboard_interactive(
    session: &mut Handle<GatewayHandler>,
    user: &str,
    password: &Secret,
) -> Result<()> {
    let mut response = session
        .authenticate_keyboard_interactive_start(user, None)
        .await
        .map_err(|e| Error::Tunnel(format!("Failed to start keyboard-interactive authentication: {}", e)))?;

    for _ in 0..MAX_KBD_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => {
                info!("Keyboard-interactive authentication successful");
                return Ok(());
            }
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                return Err(auth_rejected(
                    "Keyboard-interactive",
                    &method_names(&remaining_methods),
                    partial_success,
                ));
            }
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                debug!("Keyboard-interactive: answering {} prompts", prompts.len());
                let answers = prompts
                    .iter()
                    .map(|_| password.expose().to_string())
                    .collect();
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| {
                        Error::Tunnel(format!("Failed to send keyboard-interactive responses: {}", e))
                    })?;
            }
        }
    }

    Err(Error::authentication(
        AuthFailure::InvalidCredentials,
        format!(
            "Keyboard-interactive authentication did not finish after {} rounds",
            MAX_KBD_ROUNDS
        ),
    ))
}
