//! Slave registry and connection lifecycle
//!
//! Tracks every configured slave, its connection state, and the channel the
//! current agent connection bound to it. Local slaves additionally get a
//! supervised subprocess: the registry spawns the agent, captures its
//! output, and notices when it dies. All state changes go through the
//! validated [`ConnectionState`] transitions.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use gantry_core::collection::{Collection, Identifiable};
use gantry_core::domain::slave::{Applicability, ConnectionState, SlaveConfig, SlaveKind};
use gantry_core::envelope::{ErrorCode, ResponseEnvelope};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::notify::Notifier;
use crate::state::AppState;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum SlaveError {
    #[error("slave {0} is not configured")]
    Unknown(String),
    #[error("slave {0} already has a bound channel")]
    AlreadyRegistered(String),
    #[error("duplicate slave name {0}")]
    Duplicate(String),
    #[error("invalid slave: {0}")]
    Invalid(String),
    #[error("{0}")]
    Transition(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to spawn local agent: {0}")]
    Spawn(#[source] std::io::Error),
}

impl From<&SlaveError> for ResponseEnvelope {
    fn from(error: &SlaveError) -> Self {
        let code = match error {
            SlaveError::Unknown(_) => ErrorCode::NotFound,
            SlaveError::AlreadyRegistered(_) | SlaveError::Duplicate(_) => {
                ErrorCode::InvalidRequest
            }
            SlaveError::Invalid(_) => ErrorCode::InvalidData,
            SlaveError::Transition(_) | SlaveError::Channel(_) | SlaveError::Spawn(_) => {
                ErrorCode::ServerError
            }
        };
        ResponseEnvelope::error(code, error.to_string())
    }
}

/// Handle on a supervised local agent subprocess. Dropping or firing `kill`
/// makes the supervision task terminate and reap the child.
#[derive(Debug)]
struct LocalProcess {
    kill: oneshot::Sender<()>,
}

/// One configured slave plus its runtime connection state.
#[derive(Debug)]
pub struct Slave {
    pub config: SlaveConfig,
    state: ConnectionState,
    channel: Option<Arc<Channel>>,
    process: Option<LocalProcess>,
}

impl Slave {
    fn new(config: SlaveConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            channel: None,
            process: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.channel.as_ref()
    }

    pub fn is_general_purpose(&self) -> bool {
        self.config.applicability == Applicability::General
    }

    fn set_state(&mut self, target: ConnectionState) -> Result<(), SlaveError> {
        self.state = self
            .state
            .transition_to(target)
            .map_err(SlaveError::Transition)?;
        Ok(())
    }

    fn bind_channel(&mut self, channel: Arc<Channel>) -> Result<(), SlaveError> {
        channel.bind(&self.config.name)?;
        self.channel = Some(channel);
        Ok(())
    }

    fn unbind_channel(&mut self) -> Option<Arc<Channel>> {
        self.channel.take()
    }
}

impl Identifiable for Slave {
    fn id(&self) -> &str {
        &self.config.name
    }
}

pub struct SlaveRegistry {
    slaves: Collection<Slave>,
    store: Arc<dyn Store>,
    notifier: Notifier,
}

impl SlaveRegistry {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier) -> Self {
        Self {
            slaves: Collection::new(),
            store,
            notifier,
        }
    }

    /// Adopt the roster reloaded from the store. Everything starts
    /// disconnected; connections are runtime-only state.
    pub fn load(&mut self, configs: Vec<SlaveConfig>) {
        for config in configs {
            if let Err(e) = self.slaves.insert(Slave::new(config)) {
                warn!("skipping persisted slave: {e}");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Slave> {
        self.slaves.get(name)
    }

    pub fn slaves(&self) -> impl Iterator<Item = &Slave> {
        self.slaves.iter()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    pub async fn add_slave(&mut self, config: SlaveConfig) -> Result<(), SlaveError> {
        // Names become store file names and agent --name arguments.
        if !is_valid_name(&config.name) {
            return Err(SlaveError::Invalid(format!(
                "slave name {:?} must be non-empty alphanumeric with - _ .",
                config.name
            )));
        }
        let snapshot = config.clone();
        self.slaves
            .insert(Slave::new(config))
            .map_err(|e| SlaveError::Duplicate(e.0))?;

        if let Err(e) = self.store.save_slave(&snapshot).await {
            warn!(slave = %snapshot.name, "failed to persist slave: {e}");
        }
        self.notifier
            .slave_updated(&snapshot, ConnectionState::Disconnected);
        info!(slave = %snapshot.name, kind = ?snapshot.kind, "slave added");
        Ok(())
    }

    pub async fn remove_slave(&mut self, name: &str) -> Result<(), SlaveError> {
        if !self.slaves.contains(name) {
            return Err(SlaveError::Unknown(name.to_string()));
        }
        self.disconnect(name)?;
        self.slaves.remove(name);

        if let Err(e) = self.store.remove_slave(name).await {
            warn!(slave = name, "failed to remove slave from store: {e}");
        }
        info!(slave = name, "slave removed");
        Ok(())
    }

    /// Bind a fresh connection's channel to the slave that announced itself.
    ///
    /// Refused when the name is unknown or the slave already has a live
    /// channel; in the duplicate case the existing binding stays untouched
    /// and the newcomer is the one turned away.
    pub fn register(
        &mut self,
        name: &str,
        channel: Arc<Channel>,
    ) -> Result<SlaveConfig, SlaveError> {
        let Some(slave) = self.slaves.get_mut(name) else {
            return Err(SlaveError::Unknown(name.to_string()));
        };
        if slave.channel().is_some() {
            return Err(SlaveError::AlreadyRegistered(name.to_string()));
        }

        slave.bind_channel(channel)?;
        if let Err(e) = slave.set_state(ConnectionState::Connected) {
            slave.unbind_channel();
            return Err(e);
        }

        self.notifier.slave_updated(&slave.config, slave.state());
        info!(slave = name, "slave registered");
        Ok(slave.config.clone())
    }

    /// React to a connection ending. Only the channel that is actually bound
    /// may detach the slave; a late close of an already-replaced channel is
    /// ignored. Returns whether this channel was the bound one.
    pub fn handle_channel_closed(&mut self, name: &str, channel: &Arc<Channel>) -> bool {
        let Some(slave) = self.slaves.get_mut(name) else {
            return false;
        };
        if !slave.channel().is_some_and(|c| Arc::ptr_eq(c, channel)) {
            return false;
        }

        slave.unbind_channel();
        if slave.state() != ConnectionState::Disconnected {
            if let Err(e) = slave.set_state(ConnectionState::Disconnected) {
                warn!(slave = name, "{e}");
            }
            self.notifier.slave_updated(&slave.config, slave.state());
        }
        info!(slave = name, "slave channel lost");
        true
    }

    /// Bring a slave up. No-op unless currently disconnected. Remote slaves
    /// connect on their own; for local slaves this spawns the agent
    /// subprocess and starts supervising it.
    pub fn connect(&mut self, name: &str, state: &Arc<AppState>) -> Result<(), SlaveError> {
        let Some(slave) = self.slaves.get_mut(name) else {
            return Err(SlaveError::Unknown(name.to_string()));
        };
        if slave.state() != ConnectionState::Disconnected {
            debug!(slave = name, state = %slave.state(), "connect ignored");
            return Ok(());
        }

        match slave.config.kind {
            SlaveKind::Remote => {
                debug!(slave = name, "remote slave connects on its own");
                Ok(())
            }
            SlaveKind::Local => {
                slave.set_state(ConnectionState::Connecting)?;
                match spawn_local_agent(name, state) {
                    Ok(process) => {
                        slave.process = Some(process);
                        self.notifier.slave_updated(&slave.config, slave.state());
                        info!(slave = name, "local agent spawned");
                        Ok(())
                    }
                    Err(e) => {
                        let _ = slave.set_state(ConnectionState::Disconnected);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Take a slave down. No-op unless connecting or connected. The channel
    /// is closed before the local subprocess is terminated, so the agent
    /// sees an orderly close instead of dying mid-write.
    pub fn disconnect(&mut self, name: &str) -> Result<(), SlaveError> {
        let Some(slave) = self.slaves.get_mut(name) else {
            return Err(SlaveError::Unknown(name.to_string()));
        };
        if slave.state() == ConnectionState::Disconnected {
            debug!(slave = name, "disconnect ignored, already disconnected");
            return Ok(());
        }

        if let Some(channel) = slave.unbind_channel() {
            channel.close();
        }
        if let Some(process) = slave.process.take() {
            let _ = process.kill.send(());
        }
        slave.set_state(ConnectionState::Disconnected)?;

        self.notifier.slave_updated(&slave.config, slave.state());
        info!(slave = name, "slave disconnected");
        Ok(())
    }

    /// Spawn agents for every local slave still disconnected.
    pub fn connect_local(&mut self, state: &Arc<AppState>) {
        let names: Vec<String> = self
            .slaves
            .iter()
            .filter(|s| {
                s.config.kind == SlaveKind::Local && s.state() == ConnectionState::Disconnected
            })
            .map(|s| s.config.name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.connect(&name, state) {
                warn!(slave = %name, "failed to start local agent: {e}");
            }
        }
    }

    /// Clean up after a supervised subprocess is gone, whatever the reason.
    pub fn handle_local_exit(&mut self, name: &str) {
        let Some(slave) = self.slaves.get_mut(name) else {
            return;
        };
        slave.process = None;
        if let Some(channel) = slave.unbind_channel() {
            channel.close();
        }
        if slave.state() != ConnectionState::Disconnected {
            if let Err(e) = slave.set_state(ConnectionState::Disconnected) {
                warn!(slave = name, "{e}");
            }
            self.notifier.slave_updated(&slave.config, slave.state());
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn spawn_local_agent(name: &str, state: &Arc<AppState>) -> Result<LocalProcess, SlaveError> {
    let config = &state.config;
    let mut command = Command::new(&config.agent_command);
    command
        .arg("--name")
        .arg(name)
        .arg("--host")
        .arg(&config.advertise_host)
        .arg("--port")
        .arg(config.bind_addr.port().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(SlaveError::Spawn)?;

    let output = Arc::new(StdMutex::new(String::new()));
    if let Some(stdout) = child.stdout.take() {
        capture_output(stdout, output.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        capture_output(stderr, output.clone());
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(supervise(
        state.clone(),
        name.to_string(),
        child,
        kill_rx,
        output,
    ));
    Ok(LocalProcess { kill: kill_tx })
}

fn capture_output(
    stream: impl AsyncRead + Unpin + Send + 'static,
    buffer: Arc<StdMutex<String>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push_str(&line);
            buffer.push('\n');
        }
    });
}

/// Wait on a local agent subprocess until it exits or the registry asks for
/// it to be killed, then put the slave back into the disconnected state.
async fn supervise(
    state: Arc<AppState>,
    name: String,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    output: Arc<StdMutex<String>>,
) {
    let mut deliberate = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            deliberate = true;
            if let Err(e) = child.start_kill() {
                debug!(slave = %name, "failed to kill local agent: {e}");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) if deliberate => {
            info!(slave = %name, %status, "local agent terminated");
        }
        Ok(status) if status.success() => {
            info!(slave = %name, "local agent exited");
        }
        Ok(status) => {
            let captured = output
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            error!(
                slave = %name,
                %status,
                "local agent died unexpectedly, captured output:\n{captured}"
            );
        }
        Err(e) => warn!(slave = %name, "failed to reap local agent: {e}"),
    }

    state.slaves.lock().await.handle_local_exit(&name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::JsonStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn remote(name: &str) -> SlaveConfig {
        SlaveConfig {
            name: name.to_string(),
            kind: SlaveKind::Remote,
            applicability: Applicability::General,
        }
    }

    fn local(name: &str) -> SlaveConfig {
        SlaveConfig {
            name: name.to_string(),
            kind: SlaveKind::Local,
            applicability: Applicability::General,
        }
    }

    fn test_channel() -> (Arc<Channel>, mpsc::UnboundedReceiver<crate::channel::Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Channel::new(tx)), rx)
    }

    fn registry() -> (SlaveRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JsonStore::new(dir.path()));
        (SlaveRegistry::new(store, Notifier::new()), dir)
    }

    async fn test_state(agent_command: &str) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.agent_command = agent_command.to_string();
        let store = Arc::new(JsonStore::new(dir.path()));
        let state = AppState::initialize(config, store.clone(), store)
            .await
            .expect("state");
        (state, dir)
    }

    #[tokio::test]
    async fn test_add_slave_validates_name() {
        let (mut registry, _dir) = registry();
        assert!(matches!(
            registry.add_slave(remote("")).await,
            Err(SlaveError::Invalid(_))
        ));
        assert!(matches!(
            registry.add_slave(remote("bad name")).await,
            Err(SlaveError::Invalid(_))
        ));
        assert!(registry.add_slave(remote("node-1.a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_slave_rejects_duplicates() {
        let (mut registry, _dir) = registry();
        registry.add_slave(remote("node1")).await.expect("add");
        assert!(matches!(
            registry.add_slave(local("node1")).await,
            Err(SlaveError::Duplicate(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_register_unknown_slave_is_refused() {
        let (mut registry, _dir) = registry();
        let (channel, _rx) = test_channel();
        assert!(matches!(
            registry.register("ghost", channel),
            Err(SlaveError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn test_register_binds_channel_and_connects() {
        let (mut registry, _dir) = registry();
        registry.add_slave(remote("node1")).await.expect("add");

        let (channel, _rx) = test_channel();
        let config = registry.register("node1", channel.clone()).expect("register");
        assert_eq!(config.name, "node1");

        let slave = registry.get("node1").expect("slave");
        assert_eq!(slave.state(), ConnectionState::Connected);
        assert!(slave.channel().is_some_and(|c| Arc::ptr_eq(c, &channel)));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_original_binding() {
        let (mut registry, _dir) = registry();
        registry.add_slave(remote("node1")).await.expect("add");

        let (first, _rx1) = test_channel();
        registry.register("node1", first.clone()).expect("register");

        let (second, _rx2) = test_channel();
        assert!(matches!(
            registry.register("node1", second),
            Err(SlaveError::AlreadyRegistered(_))
        ));

        let slave = registry.get("node1").expect("slave");
        assert_eq!(slave.state(), ConnectionState::Connected);
        assert!(slave.channel().is_some_and(|c| Arc::ptr_eq(c, &first)));
    }

    #[tokio::test]
    async fn test_channel_close_only_detaches_bound_channel() {
        let (mut registry, _dir) = registry();
        registry.add_slave(remote("node1")).await.expect("add");

        let (bound, _rx1) = test_channel();
        registry.register("node1", bound.clone()).expect("register");

        let (stranger, _rx2) = test_channel();
        assert!(!registry.handle_channel_closed("node1", &stranger));
        assert_eq!(
            registry.get("node1").map(|s| s.state()),
            Some(ConnectionState::Connected)
        );

        assert!(registry.handle_channel_closed("node1", &bound));
        let slave = registry.get("node1").expect("slave");
        assert_eq!(slave.state(), ConnectionState::Disconnected);
        assert!(slave.channel().is_none());

        // The slave may register again on a fresh connection.
        let (fresh, _rx3) = test_channel();
        assert!(registry.register("node1", fresh).is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel_first() {
        let (mut registry, _dir) = registry();
        registry.add_slave(remote("node1")).await.expect("add");

        let (channel, mut rx) = test_channel();
        registry.register("node1", channel).expect("register");
        registry.disconnect("node1").expect("disconnect");

        assert!(matches!(
            rx.try_recv(),
            Ok(crate::channel::Outgoing::Shutdown)
        ));
        assert_eq!(
            registry.get("node1").map(|s| s.state()),
            Some(ConnectionState::Disconnected)
        );

        // Already disconnected: a second disconnect is a no-op.
        assert!(registry.disconnect("node1").is_ok());
    }

    #[tokio::test]
    async fn test_connect_remote_is_a_noop() {
        let (state, _dir) = test_state("gantry-agent").await;
        let mut slaves = state.slaves.lock().await;
        slaves.add_slave(remote("node1")).await.expect("add");

        assert!(slaves.connect("node1", &state).is_ok());
        assert_eq!(
            slaves.get("node1").map(|s| s.state()),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_connect_local_spawn_failure_reverts_state() {
        let (state, _dir) = test_state("/nonexistent/gantry-agent-for-tests").await;
        let mut slaves = state.slaves.lock().await;
        slaves.add_slave(local("worker")).await.expect("add");

        assert!(matches!(
            slaves.connect("worker", &state),
            Err(SlaveError::Spawn(_))
        ));
        assert_eq!(
            slaves.get("worker").map(|s| s.state()),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_supervision_notices_agent_death() {
        // `sleep` rejects the agent arguments and exits immediately, which
        // is exactly the unexpected-death path.
        let (state, _dir) = test_state("sleep").await;
        {
            let mut slaves = state.slaves.lock().await;
            slaves.add_slave(local("worker")).await.expect("add");
            slaves.connect("worker", &state).expect("spawn");
            assert_eq!(
                slaves.get("worker").map(|s| s.state()),
                Some(ConnectionState::Connecting)
            );
        }

        // The supervision task flips the slave back to disconnected.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let slaves = state.slaves.lock().await;
            if slaves.get("worker").map(|s| s.state()) == Some(ConnectionState::Disconnected) {
                return;
            }
        }
        panic!("local agent exit never detected");
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_already_up() {
        let (state, _dir) = test_state("gantry-agent").await;
        let mut slaves = state.slaves.lock().await;
        slaves.add_slave(remote("node1")).await.expect("add");
        let (channel, _rx) = test_channel();
        slaves.register("node1", channel).expect("register");

        assert!(slaves.connect("node1", &state).is_ok());
        assert_eq!(
            slaves.get("node1").map(|s| s.state()),
            Some(ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn test_remove_slave_disconnects_and_forgets() {
        let (mut registry, _dir) = registry();
        registry.add_slave(remote("node1")).await.expect("add");
        let (channel, mut rx) = test_channel();
        registry.register("node1", channel).expect("register");

        registry.remove_slave("node1").await.expect("remove");
        assert!(registry.get("node1").is_none());
        assert!(matches!(
            rx.try_recv(),
            Ok(crate::channel::Outgoing::Shutdown)
        ));

        assert!(matches!(
            registry.remove_slave("node1").await,
            Err(SlaveError::Unknown(_))
        ));
    }

    #[test]
    fn test_error_envelope_mapping() {
        let unknown = SlaveError::Unknown("node9".to_string());
        assert_eq!(ResponseEnvelope::from(&unknown).http_status, 404);

        let duplicate = SlaveError::AlreadyRegistered("node1".to_string());
        let envelope = ResponseEnvelope::from(&duplicate);
        assert_eq!(envelope.http_status, 400);
        assert!(!envelope.is_ok());
    }
}
