//! Dobles de prueba compartidos por los tests del crate.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use crate::{
    audio::manager::CreatePlayerOptions,
    config::{CoreOptions, CoreSettings, RestFactory, Structures},
    connector::{Connector, ServerUpdate, VoiceConnectionState, VoiceHandle, VoiceJoin},
    core::Core,
    error::{NodeError, OpenLinkError, Result},
    node::{driver::RestRequest, rest::RestTransport, NodeOptions},
    sources::{Track, TrackInfo},
};

pub const READY: &str = r#"{"op":"ready","resumed":false,"sessionId":"s1"}"#;

pub fn track(name: &str, length: u64) -> Track {
    Track::new(
        format!("enc:{}", name),
        TrackInfo {
            identifier: name.to_string(),
            is_seekable: true,
            author: "tester".to_string(),
            length,
            is_stream: false,
            position: 0,
            title: name.to_string(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
        },
    )
}

pub fn node_options(name: &str) -> NodeOptions {
    NodeOptions {
        name: name.to_string(),
        url: "localhost:2333".to_string(),
        auth: "youshallnotpass".to_string(),
        secure: false,
        driver: None,
    }
}

pub fn create_options(guild: u64) -> CreatePlayerOptions {
    CreatePlayerOptions::new(GuildId::new(guild), ChannelId::new(10), ChannelId::new(20))
}

/// Registra cada petición y responde con lo programado.
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<RestRequest>>,
    responses: Mutex<VecDeque<Value>>,
    fail_next: AtomicBool,
    fail_all: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self, method: &Method) -> usize {
        self.requests.lock().iter().filter(|r| &r.method == method).count()
    }

    pub fn reset(&self) {
        self.requests.lock().clear();
    }

    pub fn respond_with(&self, body: Value) {
        self.responses.lock().push_back(body);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl RestTransport for RecordingTransport {
    async fn execute(&self, request: RestRequest) -> std::result::Result<Value, NodeError> {
        self.requests.lock().push(request);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_next.swap(false, Ordering::SeqCst) || self.fail_all.load(Ordering::SeqCst) {
            return Err(NodeError::Http {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }

        Ok(self.responses.lock().pop_front().unwrap_or(Value::Null))
    }
}

pub struct FakeVoice {
    join: VoiceJoin,
    voice_id: Mutex<Option<ChannelId>>,
    state: Mutex<VoiceConnectionState>,
    server_update: Mutex<Option<ServerUpdate>>,
    voice_updates: AtomicUsize,
    disconnects: AtomicUsize,
    fail_voice_update: AtomicBool,
}

impl FakeVoice {
    fn new(join: VoiceJoin) -> Self {
        Self {
            voice_id: Mutex::new(Some(join.voice_id)),
            join,
            state: Mutex::new(VoiceConnectionState::Connected),
            server_update: Mutex::new(Some(ServerUpdate {
                token: "token".to_string(),
                endpoint: "voice.example.com".to_string(),
            })),
            voice_updates: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            fail_voice_update: AtomicBool::new(false),
        }
    }

    pub fn voice_updates(&self) -> usize {
        self.voice_updates.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// La próxima actualización de voz falla.
    pub fn fail_next_voice_update(&self) {
        self.fail_voice_update.store(true, Ordering::SeqCst);
    }

    pub fn set_server_update(&self, update: Option<ServerUpdate>) {
        *self.server_update.lock() = update;
    }
}

#[async_trait]
impl VoiceHandle for FakeVoice {
    fn guild_id(&self) -> GuildId {
        self.join.guild_id
    }

    fn voice_id(&self) -> Option<ChannelId> {
        *self.voice_id.lock()
    }

    fn text_id(&self) -> ChannelId {
        self.join.text_id
    }

    fn shard_id(&self) -> u32 {
        self.join.shard_id
    }

    fn mute(&self) -> bool {
        self.join.mute
    }

    fn deaf(&self) -> bool {
        self.join.deaf
    }

    fn volume(&self) -> Option<u16> {
        self.join.volume
    }

    fn state(&self) -> VoiceConnectionState {
        *self.state.lock()
    }

    fn server_update(&self) -> Option<ServerUpdate> {
        self.server_update.lock().clone()
    }

    fn session_id(&self) -> Option<String> {
        Some("voice-session".to_string())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = VoiceConnectionState::Disconnected;
        *self.voice_id.lock() = None;
        Ok(())
    }

    async fn send_voice_update(&self, _mute: bool, _deaf: bool) -> Result<()> {
        if self.fail_voice_update.swap(false, Ordering::SeqCst) {
            return Err(OpenLinkError::Voice("scripted failure".to_string()));
        }
        self.voice_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    owner: Mutex<Option<Weak<Core>>>,
    listened: Mutex<Vec<String>>,
    voices: DashMap<GuildId, Arc<FakeVoice>>,
    join_delay: Mutex<Option<Duration>>,
    joins: AtomicUsize,
    without_server_update: AtomicBool,
}

impl FakeConnector {
    pub fn voice(&self, guild_id: GuildId) -> Option<Arc<FakeVoice>> {
        self.voices.get(&guild_id).map(|voice| voice.clone())
    }

    pub fn owner(&self) -> Option<Arc<Core>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn listened(&self) -> Vec<String> {
        self.listened.lock().clone()
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock() = Some(delay);
    }

    /// Las próximas conexiones llegan sin datos del servidor de voz.
    pub fn withhold_server_update(&self) {
        self.without_server_update.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn bind_owner(&self, owner: Weak<Core>) {
        *self.owner.lock() = Some(owner);
    }

    async fn listen(&self, nodes: &[NodeOptions]) -> Result<()> {
        self.listened.lock().extend(nodes.iter().map(|node| node.name.clone()));
        Ok(())
    }

    async fn join(&self, options: VoiceJoin) -> Result<Arc<dyn VoiceHandle>> {
        self.joins.fetch_add(1, Ordering::SeqCst);

        let delay = *self.join_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let voice = Arc::new(FakeVoice::new(options));
        if self.without_server_update.load(Ordering::SeqCst) {
            voice.set_server_update(None);
        }
        self.voices.insert(voice.guild_id(), voice.clone());
        Ok(voice)
    }
}

pub fn settings() -> CoreSettings {
    CoreSettings {
        nodes: vec![node_options("main")],
        ..CoreSettings::default()
    }
}

pub fn factory_for(transport: Arc<RecordingTransport>) -> RestFactory {
    Arc::new(move |_: &NodeOptions| -> Arc<dyn RestTransport> { transport.clone() })
}

/// Core con un nodo `main` ya listo.
pub async fn ready_core(transport: Arc<RecordingTransport>) -> (Arc<Core>, Arc<FakeConnector>) {
    ready_core_with_factory(factory_for(transport)).await
}

pub async fn ready_core_with_factory(factory: RestFactory) -> (Arc<Core>, Arc<FakeConnector>) {
    core_with(settings(), factory).await
}

pub async fn core_with(settings: CoreSettings, factory: RestFactory) -> (Arc<Core>, Arc<FakeConnector>) {
    let connector = Arc::new(FakeConnector::default());
    let options = CoreOptions::new(connector.clone(), settings).with_structures(Structures {
        rest: Some(factory),
        ..Structures::default()
    });

    let core = Core::initialize(options).await.unwrap();
    core.handle_node_message("main", READY).await.unwrap();
    (core, connector)
}
