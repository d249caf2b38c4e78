use parking_lot::RwLock;
use serde_json::Value;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        effects::{EqualizerPreset, Filters},
        manager::PlayerManager,
        queue::{LoopMode, Queue},
    },
    config::{CoreSettings, Structures},
    connector::{VoiceConnectionState, VoiceHandle},
    error::{OpenLinkError, Result},
    events::{CoreEvent, EventBus},
    node::{
        driver::{PlayerUpdate, TrackUpdate, VoiceServer},
        message::{PlayerUpdateState, TrackEndReason, TrackEvent},
        Node,
    },
    sources::Track,
};

/// Código de cierre del socket de voz cuando el bot fue expulsado del canal.
const VOICE_CLOSE_DISCONNECTED: u16 = 4014;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Connecting,
    Connected,
    Playing,
    Paused,
    Disconnected,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Connecting,
    Connected,
    Disconnected,
    Destroyed,
}

#[derive(Debug, Clone, Default)]
pub struct PlayOptions {
    /// No reemplazar si el nodo ya está reproduciendo algo.
    pub no_replace: bool,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub paused: bool,
}

#[derive(Debug)]
struct Session {
    lifecycle: Lifecycle,
    voice_id: Option<ChannelId>,
    text_id: ChannelId,
    playing: bool,
    paused: bool,
    volume: u16,
    loop_mode: LoopMode,
    position: u64,
    ping: i64,
    mute: bool,
    deaf: bool,
    queue: Queue,
    filters: Filters,
}

/// Sesión de reproducción de un guild.
///
/// Remote commands are issued while holding `command_lock`, so the node sees
/// them in call order and nothing is sent after destruction. `session` is a
/// short synchronous lock that is never held across an `.await`.
pub struct Player {
    guild_id: GuildId,
    shard_id: u32,
    node: Arc<Node>,
    voice: Arc<dyn VoiceHandle>,
    events: EventBus,
    registry: Weak<PlayerManager>,
    default_volume: u16,
    command_lock: Mutex<()>,
    session: RwLock<Session>,
    data: RwLock<HashMap<String, Value>>,
    destroying: AtomicBool,
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("node", &self.node.name())
            .field("state", &self.state())
            .field("volume", &self.volume())
            .finish()
    }
}

impl Player {
    pub(crate) fn new(
        voice: Arc<dyn VoiceHandle>,
        node: Arc<Node>,
        events: EventBus,
        registry: Weak<PlayerManager>,
        settings: &CoreSettings,
        structures: &Structures,
    ) -> Self {
        let guild_id = voice.guild_id();
        let queue = match &structures.queue {
            Some(factory) => factory(guild_id),
            None => Queue::default(),
        };
        let filters = match &structures.filter {
            Some(factory) => factory(guild_id),
            None => Filters::default(),
        };

        let session = Session {
            lifecycle: Lifecycle::Connecting,
            voice_id: voice.voice_id(),
            text_id: voice.text_id(),
            playing: false,
            paused: false,
            volume: voice.volume().unwrap_or(settings.default_volume),
            loop_mode: LoopMode::None,
            position: 0,
            ping: -1,
            mute: voice.mute(),
            deaf: voice.deaf(),
            queue,
            filters,
        };

        debug!(
            "🎵 Player creado para guild {} en el nodo {} ({})",
            guild_id,
            node.name(),
            node.driver().id()
        );

        Self {
            guild_id,
            shard_id: voice.shard_id(),
            node,
            voice,
            events,
            registry,
            default_volume: settings.default_volume,
            command_lock: Mutex::new(()),
            session: RwLock::new(session),
            data: RwLock::new(HashMap::new()),
            destroying: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn voice(&self) -> &Arc<dyn VoiceHandle> {
        &self.voice
    }

    pub fn state(&self) -> PlayerState {
        let session = self.session.read();
        match session.lifecycle {
            Lifecycle::Connecting => PlayerState::Connecting,
            Lifecycle::Connected if session.paused => PlayerState::Paused,
            Lifecycle::Connected if session.playing => PlayerState::Playing,
            Lifecycle::Connected => PlayerState::Connected,
            Lifecycle::Disconnected => PlayerState::Disconnected,
            Lifecycle::Destroyed => PlayerState::Destroyed,
        }
    }

    pub fn voice_id(&self) -> Option<ChannelId> {
        self.session.read().voice_id
    }

    pub fn text_id(&self) -> ChannelId {
        self.session.read().text_id
    }

    pub fn is_playing(&self) -> bool {
        self.session.read().playing
    }

    pub fn is_paused(&self) -> bool {
        self.session.read().paused
    }

    pub fn volume(&self) -> u16 {
        self.session.read().volume
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.session.read().loop_mode
    }

    /// Posición en ms dentro del track actual.
    pub fn position(&self) -> u64 {
        self.session.read().position
    }

    pub fn ping(&self) -> i64 {
        self.session.read().ping
    }

    pub fn is_muted(&self) -> bool {
        self.session.read().mute
    }

    pub fn is_deafened(&self) -> bool {
        self.session.read().deaf
    }

    pub fn filters(&self) -> Filters {
        self.session.read().filters.clone()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.session.read().queue.current().cloned()
    }

    /// Lee la cola sin copiarla.
    pub fn queue<R>(&self, f: impl FnOnce(&Queue) -> R) -> R {
        f(&self.session.read().queue)
    }

    /// Modifica la cola (agregar, mezclar, mover...).
    ///
    /// Waits for any in-flight command, so edits never interleave with a
    /// track being sent to the node.
    pub async fn queue_mut<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> Result<R> {
        let _guard = self.command_lock.lock().await;
        let mut session = self.session.write();
        self.alive(&session)?;
        Ok(f(&mut session.queue))
    }

    pub fn data_get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn data_set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.ensure_alive()?;
        self.data.write().insert(key.into(), value);
        Ok(())
    }

    pub fn data_remove(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_alive()?;
        Ok(self.data.write().remove(key))
    }

    fn alive(&self, session: &Session) -> Result<()> {
        if session.lifecycle == Lifecycle::Destroyed {
            return Err(OpenLinkError::DestroyedPlayer(self.guild_id));
        }
        Ok(())
    }

    fn ensure_alive(&self) -> Result<()> {
        self.alive(&self.session.read())
    }

    async fn send(&self, update: PlayerUpdate) -> Result<()> {
        self.node.rest().update_player(self.guild_id, &update).await?;
        Ok(())
    }

    fn emit(&self, event: CoreEvent) {
        self.events.emit(event);
    }

    /// Reproduce el track dado, el actual, o el siguiente de la cola.
    pub async fn play(self: &Arc<Self>, track: Option<Track>, options: PlayOptions) -> Result<Track> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;

        enum Source {
            Given,
            Current,
            Next,
        }

        let (track, source) = {
            let session = self.session.read();
            match track {
                Some(track) => (track, Source::Given),
                None => match (session.queue.current(), session.queue.upcoming().next()) {
                    (Some(current), _) => (current.clone(), Source::Current),
                    (None, Some(next)) => (next.clone(), Source::Next),
                    (None, None) => return Err(OpenLinkError::NoCurrentTrack(self.guild_id)),
                },
            }
        };

        let position = self.send_track(&track, &options).await?;

        let mut session = self.session.write();
        match source {
            Source::Given => session.queue.set_current(track.clone()),
            Source::Current => {}
            Source::Next => {
                session.queue.advance(LoopMode::None);
            }
        }
        self.mark_started(&mut session, position, options.paused);
        Ok(track)
    }

    /// Envía el track al nodo; devuelve la posición inicial acotada.
    async fn send_track(&self, track: &Track, options: &PlayOptions) -> Result<u64> {
        let volume = self.session.read().volume;
        let position = options.start_time.unwrap_or(0).min(track.info.length);

        self.send(PlayerUpdate {
            track: Some(TrackUpdate::Encoded(track.encoded.clone())),
            position: Some(position),
            end_time: options.end_time,
            volume: Some(volume),
            paused: Some(options.paused),
            no_replace: options.no_replace,
            ..Default::default()
        })
        .await?;

        info!("🎵 Reproduciendo: {} en guild {}", track.title(), self.guild_id);
        Ok(position)
    }

    /// Marca la sesión como reproduciendo el track actual desde `position`.
    fn mark_started(&self, session: &mut Session, position: u64, paused: bool) {
        session.position = position;
        session.paused = paused;
        session.playing = !paused;
        if let Some(current) = session.queue.current_mut() {
            current.set_position(position);
        }
    }

    /// Envía el track ya fijado como actual y marca la sesión.
    async fn start(&self, track: &Track, options: &PlayOptions) -> Result<()> {
        let position = self.send_track(track, options).await?;
        self.mark_started(&mut self.session.write(), position, options.paused);
        Ok(())
    }

    /// Pausa la reproducción actual
    pub async fn pause(self: &Arc<Self>) -> Result<()> {
        self.set_pause(true).await
    }

    /// Reanuda la reproducción
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        self.set_pause(false).await
    }

    pub async fn set_pause(self: &Arc<Self>, pause: bool) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;
        self.set_pause_locked(pause).await
    }

    async fn set_pause_locked(self: &Arc<Self>, pause: bool) -> Result<()> {
        if self.session.read().paused == pause {
            return Ok(());
        }

        self.send(PlayerUpdate::paused(pause)).await?;

        let track = {
            let mut session = self.session.write();
            session.paused = pause;
            session.playing = !pause && session.queue.current().is_some();
            session.queue.current().cloned()
        };

        if pause {
            info!("⏸️ Reproducción pausada en guild {}", self.guild_id);
            self.emit(CoreEvent::PlayerPause {
                player: self.clone(),
                track,
            });
        } else {
            info!("▶️ Reproducción reanudada en guild {}", self.guild_id);
            self.emit(CoreEvent::PlayerResume {
                player: self.clone(),
                track,
            });
        }
        Ok(())
    }

    /// Configura el modo loop
    pub fn set_loop(&self, mode: LoopMode) -> Result<()> {
        let mut session = self.session.write();
        self.alive(&session)?;
        session.loop_mode = mode;
        match mode {
            LoopMode::None => debug!("➡️ Repetición desactivada"),
            LoopMode::Track => debug!("🔂 Repetir canción activado"),
            LoopMode::Queue => debug!("🔁 Repetir cola activado"),
        }
        Ok(())
    }

    /// Ajusta el volumen (0-1000).
    ///
    /// The local value changes only once the node has accepted the command.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        if volume > 1000 {
            return Err(OpenLinkError::InvalidArgument(format!(
                "volume must be between 0 and 1000, got: {}",
                volume
            )));
        }

        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;

        self.send(PlayerUpdate::volume(volume)).await?;
        self.session.write().volume = volume;
        info!("🔊 Volumen ajustado a {}% en guild {}", volume, self.guild_id);
        Ok(())
    }

    pub async fn set_mute(&self, enable: bool) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let deaf = {
            let session = self.session.read();
            self.alive(&session)?;
            if session.mute == enable {
                return Ok(());
            }
            session.deaf
        };

        self.voice.send_voice_update(enable, deaf).await?;
        self.session.write().mute = enable;
        Ok(())
    }

    pub async fn set_deaf(&self, enable: bool) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        let mute = {
            let session = self.session.read();
            self.alive(&session)?;
            if session.deaf == enable {
                return Ok(());
            }
            session.mute
        };

        self.voice.send_voice_update(mute, enable).await?;
        self.session.write().deaf = enable;
        Ok(())
    }

    /// Salta a una posición del track actual; la posición se acota a `[0, duración]`.
    pub async fn seek(&self, position: i64) -> Result<u64> {
        let _guard = self.command_lock.lock().await;

        let length = {
            let session = self.session.read();
            self.alive(&session)?;
            let track = session
                .queue
                .current()
                .ok_or(OpenLinkError::NoCurrentTrack(self.guild_id))?;
            if !track.is_seekable() {
                return Err(OpenLinkError::NotSeekable(track.title().to_string()));
            }
            track.info.length
        };

        let position = position.clamp(0, length as i64) as u64;
        self.send(PlayerUpdate::position(position)).await?;

        let mut session = self.session.write();
        session.position = position;
        if let Some(track) = session.queue.current_mut() {
            track.set_position(position);
        }
        debug!("⏩ Seek a {}ms en guild {}", position, self.guild_id);
        Ok(position)
    }

    /// Salta a la siguiente canción.
    ///
    /// Only stops the track on the node; the queue advances when the node
    /// reports the track end.
    pub async fn skip(&self) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;
        self.send(PlayerUpdate::clear_track()).await?;
        debug!("⏭️ Skip solicitado en guild {}", self.guild_id);
        Ok(())
    }

    /// Vuelve al track anterior; `None` si no hay nada que reproducir.
    ///
    /// The history entry is only taken once the node has accepted the track.
    pub async fn previous(&self) -> Result<Option<Track>> {
        let _guard = self.command_lock.lock().await;

        let (track, from_history) = {
            let session = self.session.read();
            self.alive(&session)?;
            match (session.queue.previous().last(), session.queue.current()) {
                (Some(previous), _) => (previous.clone(), true),
                (None, Some(current)) => (current.clone(), false),
                (None, None) => return Ok(None),
            }
        };

        self.send_track(&track, &PlayOptions::default()).await?;

        {
            let mut session = self.session.write();
            if from_history {
                session.queue.step_back();
            }
            self.mark_started(&mut session, 0, false);
        }

        info!("⏮️ Volviendo a: {}", track.title());
        Ok(Some(track))
    }

    /// Sale del canal de voz sin destruir la sesión.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;
        self.disconnect_locked().await
    }

    async fn disconnect_locked(self: &Arc<Self>) -> Result<()> {
        if self.voice.state() == VoiceConnectionState::Disconnected {
            return Ok(());
        }

        {
            let mut session = self.session.write();
            session.voice_id = None;
            session.mute = false;
            session.deaf = false;
        }

        self.voice.disconnect().await?;

        let has_track = self.session.read().queue.current().is_some();
        if has_track {
            self.set_pause_locked(true).await?;
        }

        self.session.write().lifecycle = Lifecycle::Disconnected;
        info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
        Ok(())
    }

    /// Detiene la reproducción y limpia la cola; con `destroy` destruye la sesión.
    pub async fn stop(self: &Arc<Self>, destroy: bool) -> Result<()> {
        if destroy {
            return self.destroy().await;
        }

        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;

        self.send(PlayerUpdate::clear_track()).await?;

        let track = {
            let mut session = self.session.write();
            session.queue.clear();
            session.playing = false;
            session.paused = false;
            session.position = 0;
            session.queue.take_current()
        };

        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
        self.emit(CoreEvent::TrackEnd {
            player: self.clone(),
            track: track.clone(),
            reason: TrackEndReason::Stopped,
        });
        self.emit(CoreEvent::PlayerStop {
            player: self.clone(),
            track,
        });
        Ok(())
    }

    /// Restablece la sesión a valores por defecto sin destruirla.
    pub async fn clean(self: &Arc<Self>, emit_empty: bool) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;
        self.clean_locked(emit_empty);
        Ok(())
    }

    fn clean_locked(self: &Arc<Self>, emit_empty: bool) {
        {
            let mut session = self.session.write();
            session.loop_mode = LoopMode::None;
            session.queue.reset();
            session.volume = self.default_volume;
            session.position = 0;
            session.playing = false;
            session.paused = false;
        }
        self.data.write().clear();

        if emit_empty {
            info!("📭 Cola vacía en guild {}", self.guild_id);
            self.emit(CoreEvent::QueueEmpty {
                player: self.clone(),
            });
        }
    }

    /// Destruye la sesión. Concurrent calls collapse into a single teardown.
    ///
    /// Remote failures are logged; the local teardown always completes.
    pub async fn destroy(self: &Arc<Self>) -> Result<()> {
        if self
            .destroying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Destrucción ya en curso para guild {}", self.guild_id);
            return Ok(());
        }

        self.destroy_latched().await;
        if let Some(registry) = self.registry.upgrade() {
            registry.release_guild(self.guild_id);
        }
        self.destroying.store(false, Ordering::Release);
        Ok(())
    }

    async fn destroy_latched(self: &Arc<Self>) {
        let registry = self.registry.upgrade();
        let _guild_guard = match &registry {
            Some(registry) => Some(registry.lock_guild(self.guild_id).await),
            None => None,
        };
        let _guard = self.command_lock.lock().await;

        let playing = {
            let session = self.session.read();
            if session.lifecycle == Lifecycle::Destroyed {
                return;
            }
            session.playing
        };

        if playing {
            if let Err(e) = self.send(PlayerUpdate::clear_track()).await {
                warn!("⚠️ No se pudo detener el track en guild {}: {}", self.guild_id, e);
            }
        }

        self.session.write().queue.reset();

        if let Err(e) = self.disconnect_locked().await {
            warn!("⚠️ Error al desconectar guild {}: {}", self.guild_id, e);
        }

        if let Err(e) = self.node.rest().destroy_player(self.guild_id).await {
            warn!("⚠️ El nodo {} no pudo destruir el player de {}: {}", self.node.name(), self.guild_id, e);
        }

        if let Some(registry) = &registry {
            registry.remove(self.guild_id, self);
        }
        self.node.detach_player();

        {
            let mut session = self.session.write();
            session.lifecycle = Lifecycle::Destroyed;
            session.playing = false;
            session.paused = false;
        }

        info!("🗑️ Player destruido en guild {}", self.guild_id);
        self.emit(CoreEvent::PlayerDestroy {
            player: self.clone(),
        });
    }

    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;

        self.send(PlayerUpdate::filters(filters.clone())).await?;
        self.session.write().filters = filters;
        Ok(())
    }

    pub async fn set_equalizer_preset(&self, preset: EqualizerPreset) -> Result<()> {
        let filters = self.filters().with_preset(preset);
        self.set_filters(filters).await?;
        info!("🎛️ Preset de ecualizador aplicado: {:?}", preset);
        Ok(())
    }

    pub async fn reset_filters(&self) -> Result<()> {
        self.set_filters(Filters::default()).await
    }

    pub fn set_text_channel(&self, text_id: ChannelId) -> Result<()> {
        let mut session = self.session.write();
        self.alive(&session)?;
        session.text_id = text_id;
        Ok(())
    }

    /// El conector informó que el bot fue movido de canal.
    pub fn set_voice_channel(&self, voice_id: ChannelId) -> Result<()> {
        let mut session = self.session.write();
        self.alive(&session)?;
        session.voice_id = Some(voice_id);
        Ok(())
    }

    /// Envía al nodo los datos del servidor de voz; `false` si aún no llegan.
    pub async fn sync_voice(&self) -> Result<bool> {
        let _guard = self.command_lock.lock().await;
        self.ensure_alive()?;

        let (Some(server), Some(session_id)) = (self.voice.server_update(), self.voice.session_id()) else {
            debug!("Esperando datos de voz para guild {}", self.guild_id);
            return Ok(false);
        };

        self.send(PlayerUpdate::voice(VoiceServer {
            token: server.token,
            endpoint: server.endpoint,
            session_id,
        }))
        .await?;

        let mut session = self.session.write();
        if matches!(session.lifecycle, Lifecycle::Connecting | Lifecycle::Disconnected) {
            session.lifecycle = Lifecycle::Connected;
            session.voice_id = self.voice.voice_id();
        }
        Ok(true)
    }

    pub(crate) fn handle_player_update(&self, state: PlayerUpdateState) {
        let mut session = self.session.write();
        if session.lifecycle == Lifecycle::Destroyed {
            return;
        }

        let length = session.queue.current().map(|track| track.info.length);
        let position = length.map_or(state.position, |length| state.position.min(length));
        session.position = position;
        session.ping = state.ping;
        if let Some(track) = session.queue.current_mut() {
            track.set_position(position);
        }
        if state.connected && session.lifecycle == Lifecycle::Connecting {
            session.lifecycle = Lifecycle::Connected;
        }
    }

    pub(crate) async fn handle_track_event(self: &Arc<Self>, event: TrackEvent) -> Result<()> {
        let _guard = self.command_lock.lock().await;
        if self.ensure_alive().is_err() {
            return Ok(());
        }

        match event {
            TrackEvent::TrackStart {} => {
                let track = {
                    let mut session = self.session.write();
                    session.playing = !session.paused;
                    if session.lifecycle == Lifecycle::Connecting {
                        session.lifecycle = Lifecycle::Connected;
                    }
                    session.queue.current().cloned()
                };
                self.emit(CoreEvent::TrackStart {
                    player: self.clone(),
                    track,
                });
            }
            TrackEvent::TrackEnd { encoded, reason } => self.handle_track_end(encoded, reason).await?,
            TrackEvent::TrackStuck { threshold_ms } => {
                warn!("⚠️ Track atascado en guild {} ({}ms)", self.guild_id, threshold_ms);
                self.emit(CoreEvent::TrackStuck {
                    player: self.clone(),
                    track: self.current_track(),
                    threshold_ms,
                });
            }
            TrackEvent::TrackException { exception } => {
                let message = exception.message.unwrap_or(exception.cause);
                warn!("❌ Error en track para guild {}: {}", self.guild_id, message);
                self.emit(CoreEvent::TrackException {
                    player: self.clone(),
                    track: self.current_track(),
                    message,
                });
            }
            TrackEvent::WebSocketClosed {
                code,
                reason,
                by_remote,
            } => {
                warn!("🔌 Voz cerrada en guild {}: {} {}", self.guild_id, code, reason);
                self.emit(CoreEvent::PlayerClosed {
                    player: self.clone(),
                    code,
                    reason,
                    by_remote,
                });
                if code == VOICE_CLOSE_DISCONNECTED {
                    self.disconnect_locked().await?;
                }
            }
        }
        Ok(())
    }

    /// Procesa el fin de un track.
    ///
    /// An end event for a track other than the current one (the node reports
    /// `replaced` after `play` already swapped it) never touches local state.
    async fn handle_track_end(self: &Arc<Self>, encoded: Option<String>, reason: TrackEndReason) -> Result<()> {
        if !reason.may_start_next() {
            let ended = {
                let session = self.session.read();
                match &encoded {
                    Some(encoded) => session
                        .queue
                        .current()
                        .into_iter()
                        .chain(session.queue.previous().iter().rev())
                        .find(|track| &track.encoded == encoded)
                        .cloned(),
                    None => session.queue.current().cloned(),
                }
            };
            debug!("Track terminado ({:?}) en guild {}", reason, self.guild_id);
            if ended.is_some() {
                self.emit(CoreEvent::TrackEnd {
                    player: self.clone(),
                    track: ended,
                    reason,
                });
            }
            return Ok(());
        }

        let (ended, loop_mode) = {
            let mut session = self.session.write();
            let Some(ended) = session.queue.current().cloned() else {
                return Ok(());
            };
            if encoded.as_ref().is_some_and(|encoded| encoded != &ended.encoded) {
                debug!("Fin de track obsoleto ignorado en guild {}", self.guild_id);
                return Ok(());
            }
            session.playing = false;
            session.position = 0;
            (ended, session.loop_mode)
        };

        debug!("Track terminado ({:?}) en guild {}", reason, self.guild_id);
        self.emit(CoreEvent::TrackEnd {
            player: self.clone(),
            track: Some(ended),
            reason,
        });

        let loop_mode = match (reason, loop_mode) {
            (TrackEndReason::Finished, mode) => mode,
            (_, LoopMode::Track) => LoopMode::None,
            (_, mode) => mode,
        };

        let next = self.session.write().queue.advance(loop_mode);
        match next {
            Some(track) => self.start(&track, &PlayOptions::default()).await,
            None => {
                self.clean_locked(true);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::{
            message::TrackException,
            rest::{MockRestTransport, RestTransport},
            NodeOptions,
        },
        testing::{self, track, FakeConnector, RecordingTransport},
    };
    use pretty_assertions::assert_eq;
    use reqwest::Method;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn setup() -> (Arc<crate::Core>, Arc<Player>, Arc<RecordingTransport>, Arc<FakeConnector>) {
        let transport = Arc::new(RecordingTransport::default());
        let (core, connector) = testing::ready_core(transport.clone()).await;
        let player = core.create(testing::create_options(1)).await.unwrap();
        transport.reset();
        (core, player, transport, connector)
    }

    fn drain(events: &mut crate::events::Receiver<CoreEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        loop {
            match events.try_recv() {
                Ok(event) => names.push(event.name()),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return names,
            }
        }
    }

    #[tokio::test]
    async fn test_construction_uses_voice_handle_and_defaults() {
        let (_core, player, _transport, _connector) = setup().await;

        assert_eq!(player.guild_id(), GuildId::new(1));
        assert_eq!(player.voice_id(), Some(ChannelId::new(10)));
        assert_eq!(player.text_id(), ChannelId::new(20));
        assert_eq!(player.volume(), 100);
        assert_eq!(player.state(), PlayerState::Connected);
        assert!(player.is_deafened());
        assert_eq!(player.loop_mode(), LoopMode::None);
    }

    #[tokio::test]
    async fn test_volume_override_from_voice_handle() {
        let transport = Arc::new(RecordingTransport::default());
        let (core, _connector) = testing::ready_core(transport).await;

        let mut options = testing::create_options(2);
        options.volume = Some(35);
        let player = core.create(options).await.unwrap();
        assert_eq!(player.volume(), 35);
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let (core, player, transport, _connector) = setup().await;
        let mut events = core.subscribe();

        player.pause().await.unwrap();
        player.pause().await.unwrap();

        assert_eq!(transport.count(&Method::PATCH), 1);
        assert_eq!(drain(&mut events), vec!["PlayerPause"]);
        assert!(player.is_paused());
        assert!(!player.is_playing());

        player.resume().await.unwrap();
        player.set_pause(false).await.unwrap();
        assert_eq!(transport.count(&Method::PATCH), 2);
        assert_eq!(drain(&mut events), vec!["PlayerResume"]);
    }

    #[tokio::test]
    async fn test_playing_and_paused_are_exclusive() {
        let (_core, player, _transport, _connector) = setup().await;
        player.play(Some(track("a", 200_000)), PlayOptions::default()).await.unwrap();
        assert!(player.is_playing());
        assert_eq!(player.state(), PlayerState::Playing);

        player.pause().await.unwrap();
        assert!(player.is_paused() && !player.is_playing());
        assert_eq!(player.state(), PlayerState::Paused);

        player.resume().await.unwrap();
        assert!(player.is_playing() && !player.is_paused());
    }

    #[tokio::test]
    async fn test_set_volume_updates_after_each_command() {
        let (_core, player, transport, _connector) = setup().await;

        player.set_volume(50).await.unwrap();
        player.set_volume(50).await.unwrap();

        assert_eq!(transport.count(&Method::PATCH), 2);
        assert_eq!(player.volume(), 50);
        assert!(matches!(
            player.set_volume(1001).await,
            Err(OpenLinkError::InvalidArgument(_))
        ));
        assert_eq!(transport.count(&Method::PATCH), 2);
    }

    #[tokio::test]
    async fn test_failed_command_keeps_local_state() {
        let (_core, player, transport, _connector) = setup().await;
        transport.fail_next();

        assert!(matches!(player.set_volume(10).await, Err(OpenLinkError::Node(_))));
        assert_eq!(player.volume(), 100);
    }

    #[tokio::test]
    async fn test_seek_clamps_position() {
        let (_core, player, transport, _connector) = setup().await;
        player.play(Some(track("a", 200_000)), PlayOptions::default()).await.unwrap();

        assert_eq!(player.seek(-10).await.unwrap(), 0);
        assert_eq!(player.position(), 0);
        assert_eq!(player.seek(999_999).await.unwrap(), 200_000);
        assert_eq!(player.current_track().unwrap().position(), 200_000);

        let last = transport.requests().pop().unwrap();
        assert_eq!(last.body.unwrap()["position"], 200_000);
    }

    #[tokio::test]
    async fn test_seek_preconditions() {
        let (_core, player, transport, _connector) = setup().await;
        assert!(matches!(player.seek(10).await, Err(OpenLinkError::NoCurrentTrack(_))));

        let mut stream = track("radio", 0);
        stream.info.is_stream = true;
        player.play(Some(stream), PlayOptions::default()).await.unwrap();
        transport.reset();

        assert!(matches!(player.seek(10).await, Err(OpenLinkError::NotSeekable(_))));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_previous_replays_history_once() {
        let (_core, player, transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        player.play(Some(track("b", 1000)), PlayOptions::default()).await.unwrap();
        transport.reset();

        let replayed = player.previous().await.unwrap().unwrap();
        assert_eq!(replayed.title(), "a");
        assert!(player.queue(|q| q.previous().is_empty()));
        assert_eq!(player.queue(|q| q.upcoming().next().unwrap().title().to_string()), "b");

        let body = transport.requests().pop().unwrap().body.unwrap();
        assert_eq!(body["track"]["encoded"], track("a", 1000).encoded);
    }

    #[tokio::test]
    async fn test_failed_previous_keeps_queue() {
        let (_core, player, transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        player.play(Some(track("b", 1000)), PlayOptions::default()).await.unwrap();
        transport.fail_next();

        assert!(matches!(player.previous().await, Err(OpenLinkError::Node(_))));
        assert_eq!(player.current_track().unwrap().title(), "b");
        assert_eq!(player.queue(|q| q.previous().len()), 1);
        assert_eq!(player.queue(|q| q.len()), 0);
    }

    #[tokio::test]
    async fn test_previous_after_queue_loop_keeps_single_copy() {
        let (_core, player, _transport, _connector) = setup().await;
        player.queue_mut(|q| q.add(track("b", 1000))).await.unwrap().unwrap();
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        player.set_loop(LoopMode::Queue).unwrap();

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: None,
                reason: TrackEndReason::Finished,
            })
            .await
            .unwrap();
        player.previous().await.unwrap();

        let current = player.current_track().unwrap().title().to_string();
        let upcoming: Vec<String> = player.queue(|q| q.upcoming().map(|t| t.title().to_string()).collect());
        assert_eq!(current, "b");
        assert_eq!(upcoming, vec!["a"]);
    }

    #[tokio::test]
    async fn test_previous_without_history_or_track_is_noop() {
        let (core, player, transport, _connector) = setup().await;
        let mut events = core.subscribe();

        assert!(player.previous().await.unwrap().is_none());
        assert!(transport.requests().is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_skip_only_clears_remote_track() {
        let (_core, player, transport, _connector) = setup().await;
        player.queue_mut(|q| q.add(track("b", 1000))).await.unwrap().unwrap();
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        transport.reset();

        player.skip().await.unwrap();

        assert_eq!(player.current_track().unwrap().title(), "a");
        let body = transport.requests().pop().unwrap().body.unwrap();
        assert_eq!(body["track"]["encoded"], Value::Null);
    }

    #[tokio::test]
    async fn test_track_end_advances_queue() {
        let (core, player, transport, _connector) = setup().await;
        player.queue_mut(|q| q.add(track("b", 1000))).await.unwrap().unwrap();
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        let mut events = core.subscribe();

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: None,
                reason: TrackEndReason::Finished,
            })
            .await
            .unwrap();
        assert_eq!(player.current_track().unwrap().title(), "b");
        assert_eq!(drain(&mut events), vec!["TrackEnd"]);

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: None,
                reason: TrackEndReason::Finished,
            })
            .await
            .unwrap();
        assert!(player.current_track().is_none());
        assert_eq!(drain(&mut events), vec!["TrackEnd", "QueueEmpty"]);

        let plays = transport
            .requests()
            .into_iter()
            .filter(|r| r.body.as_ref().is_some_and(|b| b["track"]["encoded"].is_string()))
            .count();
        assert_eq!(plays, 2);
    }

    #[tokio::test]
    async fn test_replaced_track_does_not_advance() {
        let (_core, player, _transport, _connector) = setup().await;
        player.queue_mut(|q| q.add(track("b", 1000))).await.unwrap().unwrap();
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: None,
                reason: TrackEndReason::Replaced,
            })
            .await
            .unwrap();
        assert_eq!(player.current_track().unwrap().title(), "a");
        assert_eq!(player.queue(|q| q.len()), 1);
    }

    #[tokio::test]
    async fn test_replaced_end_reports_the_old_track() {
        let (core, player, _transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        player.play(Some(track("b", 1000)), PlayOptions::default()).await.unwrap();
        let mut events = core.subscribe();

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: Some(track("a", 1000).encoded),
                reason: TrackEndReason::Replaced,
            })
            .await
            .unwrap();

        let Ok(CoreEvent::TrackEnd { track: ended, .. }) = events.try_recv() else {
            panic!("expected TrackEnd");
        };
        assert_eq!(ended.unwrap().title(), "a");
        assert_eq!(player.current_track().unwrap().title(), "b");
        assert!(player.is_playing());
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_stale_finished_end_is_ignored() {
        let (core, player, _transport, _connector) = setup().await;
        player.play(Some(track("b", 1000)), PlayOptions::default()).await.unwrap();
        let mut events = core.subscribe();

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: Some(track("a", 1000).encoded),
                reason: TrackEndReason::Finished,
            })
            .await
            .unwrap();

        assert!(drain(&mut events).is_empty());
        assert_eq!(player.current_track().unwrap().title(), "b");
        assert!(player.is_playing());
    }

    #[tokio::test]
    async fn test_queue_edit_waits_for_in_flight_play() {
        let (_core, player, transport, _connector) = setup().await;
        player
            .queue_mut(|q| q.add_many(vec![track("x", 1000), track("y", 1000)]))
            .await
            .unwrap();
        transport.set_delay(Duration::from_millis(30));

        let playing = {
            let player = player.clone();
            tokio::spawn(async move { player.play(None, PlayOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = player.queue_mut(|q| q.remove(0)).await.unwrap();

        let played = playing.await.unwrap().unwrap();
        assert_eq!(played.title(), "x");
        assert_eq!(player.current_track().unwrap().title(), "x");
        assert_eq!(removed.unwrap().title(), "y");
        assert_eq!(player.queue(|q| q.len()), 0);
    }

    #[tokio::test]
    async fn test_loop_track_repeats_on_finish() {
        let (_core, player, _transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        player.set_loop(LoopMode::Track).unwrap();

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: None,
                reason: TrackEndReason::Finished,
            })
            .await
            .unwrap();
        assert_eq!(player.current_track().unwrap().title(), "a");
        assert!(player.is_playing());
    }

    #[tokio::test]
    async fn test_player_update_and_exception_events() {
        let (core, player, _transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        let mut events = core.subscribe();

        player.handle_player_update(PlayerUpdateState {
            time: 0,
            position: 5000,
            connected: true,
            ping: 12,
        });
        assert_eq!(player.position(), 1000);
        assert_eq!(player.ping(), 12);

        player
            .handle_track_event(TrackEvent::TrackException {
                exception: TrackException {
                    message: Some("boom".into()),
                    severity: "common".into(),
                    cause: String::new(),
                },
            })
            .await
            .unwrap();
        assert_eq!(drain(&mut events), vec!["TrackException"]);
    }

    #[tokio::test]
    async fn test_set_mute_pushes_voice_state() {
        let (_core, player, transport, connector) = setup().await;
        let voice = connector.voice(GuildId::new(1)).unwrap();

        player.set_mute(true).await.unwrap();
        player.set_mute(true).await.unwrap();

        assert!(player.is_muted());
        assert_eq!(voice.voice_updates(), 1);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_failed_voice_update_keeps_flags() {
        let (_core, player, _transport, connector) = setup().await;
        let voice = connector.voice(GuildId::new(1)).unwrap();

        voice.fail_next_voice_update();
        assert!(matches!(player.set_mute(true).await, Err(OpenLinkError::Voice(_))));
        assert!(!player.is_muted());

        voice.fail_next_voice_update();
        assert!(matches!(player.set_deaf(false).await, Err(OpenLinkError::Voice(_))));
        assert!(player.is_deafened());

        player.set_deaf(false).await.unwrap();
        assert!(!player.is_deafened());
        assert_eq!(voice.voice_updates(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_pauses_and_is_idempotent() {
        let (_core, player, _transport, connector) = setup().await;
        let voice = connector.voice(GuildId::new(1)).unwrap();
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();

        player.disconnect().await.unwrap();
        assert_eq!(player.state(), PlayerState::Disconnected);
        assert!(player.is_paused());
        assert_eq!(player.voice_id(), None);
        assert!(!player.is_deafened());

        player.disconnect().await.unwrap();
        assert_eq!(voice.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_kicked_from_voice_disconnects() {
        let (core, player, _transport, _connector) = setup().await;
        let mut events = core.subscribe();

        player
            .handle_track_event(TrackEvent::WebSocketClosed {
                code: 4014,
                reason: "Disconnected".into(),
                by_remote: true,
            })
            .await
            .unwrap();

        assert_eq!(drain(&mut events), vec!["PlayerClosed"]);
        assert_eq!(player.state(), PlayerState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_keeps_session() {
        let (core, player, _transport, _connector) = setup().await;
        player.queue_mut(|q| q.add(track("b", 1000))).await.unwrap().unwrap();
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        let mut events = core.subscribe();

        player.stop(false).await.unwrap();

        assert!(player.current_track().is_none());
        assert_eq!(player.queue(|q| q.len()), 0);
        assert!(!player.is_playing());
        assert_eq!(drain(&mut events), vec!["TrackEnd", "PlayerStop"]);
        assert!(core.get_player(GuildId::new(1)).is_some());

        player
            .handle_track_event(TrackEvent::TrackEnd {
                encoded: None,
                reason: TrackEndReason::Stopped,
            })
            .await
            .unwrap();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_clean_resets_session() {
        let (core, player, _transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        player.set_volume(300).await.unwrap();
        player.set_loop(LoopMode::Queue).unwrap();
        player.data_set("requester_channel", serde_json::json!(99)).unwrap();
        let mut events = core.subscribe();

        player.clean(true).await.unwrap();

        assert_eq!(player.volume(), 100);
        assert_eq!(player.loop_mode(), LoopMode::None);
        assert!(player.current_track().is_none());
        assert!(player.data_get("requester_channel").is_none());
        assert_eq!(drain(&mut events), vec!["QueueEmpty"]);

        player.clean(false).await.unwrap();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_filters_are_sent_then_stored() {
        let (_core, player, transport, _connector) = setup().await;

        player.set_equalizer_preset(EqualizerPreset::Bass).await.unwrap();

        assert_eq!(player.filters().preset(), EqualizerPreset::Bass);
        let body = transport.requests().pop().unwrap().body.unwrap();
        assert_eq!(body["filters"]["equalizer"].as_array().unwrap().len(), 15);

        player.reset_filters().await.unwrap();
        assert!(player.filters().equalizer.is_none());
    }

    #[tokio::test]
    async fn test_destroy_twice_concurrently_emits_once() {
        let (core, player, transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        let mut events = core.subscribe();

        let (first, second) = tokio::join!(player.destroy(), player.destroy());
        first.unwrap();
        second.unwrap();

        assert_eq!(drain(&mut events), vec!["PlayerDestroy"]);
        assert!(core.get_player(GuildId::new(1)).is_none());
        assert_eq!(player.state(), PlayerState::Destroyed);
        assert_eq!(transport.count(&Method::DELETE), 1);
        assert_eq!(player.node().player_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_survives_remote_failure() {
        let (core, player, transport, _connector) = setup().await;
        transport.fail_all(true);

        player.destroy().await.unwrap();

        assert_eq!(player.state(), PlayerState::Destroyed);
        assert!(core.get_player(GuildId::new(1)).is_none());
    }

    #[tokio::test]
    async fn test_operations_after_destroy_fail_without_side_effects() {
        let (core, player, transport, connector) = setup().await;
        let voice = connector.voice(GuildId::new(1)).unwrap();
        player.destroy().await.unwrap();
        transport.reset();
        let mut events = core.subscribe();

        assert!(matches!(player.pause().await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.resume().await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.set_volume(5).await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.set_loop(LoopMode::Queue), Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.set_mute(true).await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.seek(0).await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.skip().await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.previous().await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.disconnect().await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.stop(false).await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(player.clean(true).await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(
            player.play(Some(track("a", 1)), PlayOptions::default()).await,
            Err(OpenLinkError::DestroyedPlayer(_))
        ));
        assert!(matches!(player.queue_mut(|q| q.len()).await, Err(OpenLinkError::DestroyedPlayer(_))));
        assert!(matches!(
            player.data_set("key", serde_json::json!(1)),
            Err(OpenLinkError::DestroyedPlayer(_))
        ));
        assert!(matches!(player.data_remove("key"), Err(OpenLinkError::DestroyedPlayer(_))));

        player.destroy().await.unwrap();

        assert!(transport.requests().is_empty());
        assert!(drain(&mut events).is_empty());
        assert_eq!(voice.voice_updates(), 0);
    }

    #[tokio::test]
    async fn test_pause_issues_single_command_with_strict_mock() {
        let mut mock = MockRestTransport::new();
        mock.expect_execute()
            .withf(|request| request.body.as_ref().is_some_and(|b| b.get("voice").is_some()))
            .times(1)
            .returning(|_| Ok(Value::Null));
        mock.expect_execute()
            .withf(|request| request.body.as_ref().is_some_and(|b| b["paused"] == true))
            .times(1)
            .returning(|_| Ok(Value::Null));

        let mock = Arc::new(mock);
        let factory = Arc::new(move |_: &NodeOptions| -> Arc<dyn RestTransport> { mock.clone() });
        let (core, _connector) = testing::ready_core_with_factory(factory).await;
        let player = core.create(testing::create_options(3)).await.unwrap();

        player.pause().await.unwrap();
        player.pause().await.unwrap();
        assert!(player.is_paused());
    }

    #[tokio::test]
    async fn test_pause_waits_for_in_flight_destroy() {
        let (_core, player, transport, _connector) = setup().await;
        player.play(Some(track("a", 1000)), PlayOptions::default()).await.unwrap();
        transport.set_delay(Duration::from_millis(20));

        let destroyer = {
            let player = player.clone();
            tokio::spawn(async move { player.destroy().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let paused = player.pause().await;
        destroyer.await.unwrap().unwrap();

        assert!(matches!(paused, Err(OpenLinkError::DestroyedPlayer(_))));
        let after_delete = transport
            .requests()
            .into_iter()
            .skip_while(|r| r.method != Method::DELETE)
            .count();
        assert_eq!(after_delete, 1);
    }
}
