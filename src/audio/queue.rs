use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{collections::VecDeque, time::Duration};
use tracing::{debug, info};

use crate::{
    error::{OpenLinkError, Result},
    sources::Track,
};

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_MAX_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    None,
    Track,
    Queue,
}

/// Cola de un player: próximos, historial y el track actual.
#[derive(Debug)]
pub struct Queue {
    upcoming: VecDeque<Track>,
    current: Option<Track>,
    previous: Vec<Track>,
    max_size: usize,
    max_history: usize,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl Queue {
    pub fn new(max_size: usize) -> Self {
        Self {
            upcoming: VecDeque::new(),
            current: None,
            previous: Vec::new(),
            max_size,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Agrega un track al final de la cola
    pub fn add(&mut self, track: Track) -> Result<()> {
        if self.upcoming.len() >= self.max_size {
            return Err(OpenLinkError::InvalidArgument(format!(
                "queue is full (max {} tracks)",
                self.max_size
            )));
        }

        debug!("➕ Agregado a la cola: {}", track.title());
        self.upcoming.push_back(track);
        Ok(())
    }

    /// Agrega múltiples tracks (playlist); devuelve cuántos entraron
    pub fn add_many(&mut self, tracks: Vec<Track>) -> usize {
        let available = self.max_size.saturating_sub(self.upcoming.len());
        let to_add = tracks.len().min(available);

        self.upcoming.extend(tracks.into_iter().take(to_add));
        info!("➕ Agregadas {} canciones a la cola", to_add);
        to_add
    }

    /// Avanza al siguiente track según el modo de loop.
    ///
    /// The outgoing track goes to history unless it is being repeated or
    /// re-queued by the queue loop; a track lives in one place at a time.
    pub fn advance(&mut self, loop_mode: LoopMode) -> Option<Track> {
        if let Some(mut current) = self.current.take() {
            current.set_position(0);

            match loop_mode {
                LoopMode::Track => {
                    debug!("🔂 Repitiendo track: {}", current.title());
                    self.current = Some(current.clone());
                    return Some(current);
                }
                LoopMode::Queue => {
                    debug!("🔁 Track agregado al final por loop de cola: {}", current.title());
                    self.upcoming.push_back(current);
                }
                LoopMode::None => self.push_history(current),
            }
        }

        self.current = self.upcoming.pop_front();
        self.current.clone()
    }

    /// Vuelve al track más reciente del historial.
    ///
    /// The history entry is moved, not copied; the displaced current track is
    /// put back at the front of the upcoming list.
    pub fn step_back(&mut self) -> Option<Track> {
        let previous = self.previous.pop()?;

        if let Some(mut current) = self.current.take() {
            current.set_position(0);
            self.upcoming.push_front(current);
        }

        self.current = Some(previous.clone());
        Some(previous)
    }

    /// Reemplaza el track actual, mandando el anterior al historial
    pub fn set_current(&mut self, track: Track) {
        if let Some(mut old) = self.current.replace(track) {
            old.set_position(0);
            self.push_history(old);
        }
    }

    pub fn take_current(&mut self) -> Option<Track> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Track> {
        self.current.as_mut()
    }

    pub fn previous(&self) -> &[Track] {
        &self.previous
    }

    pub fn upcoming(&self) -> impl Iterator<Item = &Track> {
        self.upcoming.iter()
    }

    /// Salta canciones de la cola sin reproducirlas
    pub fn skip(&mut self, amount: usize) -> usize {
        let skipped = amount.min(self.upcoming.len());

        for _ in 0..skipped {
            if let Some(track) = self.upcoming.pop_front() {
                self.push_history(track);
            }
        }

        skipped
    }

    /// Limpia los próximos tracks
    pub fn clear(&mut self) {
        self.upcoming.clear();
        debug!("🗑️ Cola limpiada");
    }

    /// Vacía todo: próximos, actual e historial
    pub fn reset(&mut self) {
        self.upcoming.clear();
        self.previous.clear();
        self.current = None;
    }

    /// Limpia duplicados
    pub fn clear_duplicates(&mut self) -> usize {
        let mut seen = std::collections::HashSet::new();
        let original_len = self.upcoming.len();

        self.upcoming.retain(|track| seen.insert(track.encoded.clone()));

        let removed = original_len - self.upcoming.len();
        if removed > 0 {
            info!("🗑️ Eliminados {} duplicados", removed);
        }
        removed
    }

    /// Limpia tracks de un usuario específico
    pub fn clear_user_tracks(&mut self, user_id: UserId) -> usize {
        let original_len = self.upcoming.len();
        self.upcoming.retain(|track| track.requester() != Some(user_id));
        original_len - self.upcoming.len()
    }

    /// Mezcla la cola
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.upcoming.make_contiguous().shuffle(&mut rng);
        info!("🔀 Cola mezclada");
    }

    /// Mueve un track a una nueva posición
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        if from >= self.upcoming.len() || to >= self.upcoming.len() {
            return Err(OpenLinkError::InvalidArgument(format!(
                "index out of range: {} -> {} (len {})",
                from,
                to,
                self.upcoming.len()
            )));
        }

        if from != to {
            if let Some(track) = self.upcoming.remove(from) {
                self.upcoming.insert(to, track);
                debug!("📍 Track movido de posición {} a {}", from, to);
            }
        }

        Ok(())
    }

    /// Elimina un track específico
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.upcoming.remove(index)
    }

    pub fn len(&self) -> usize {
        self.upcoming.len()
    }

    /// Cola vacía: sin próximos y sin track actual.
    pub fn is_empty(&self) -> bool {
        self.upcoming.is_empty() && self.current.is_none()
    }

    pub fn total_duration(&self) -> Duration {
        let upcoming: Duration = self.upcoming.iter().map(Track::duration).sum();
        upcoming + self.current.as_ref().map(Track::duration).unwrap_or_default()
    }

    /// Obtiene una página específica de los próximos tracks (base 1)
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let current_page = page.max(1);
        let total_items = self.upcoming.len();
        let total_pages = total_items.div_ceil(per_page).max(1);

        let items = self
            .upcoming
            .iter()
            .skip((current_page - 1) * per_page)
            .take(per_page)
            .cloned()
            .collect();

        QueuePage {
            items,
            current_page,
            total_pages,
            total_items,
        }
    }

    fn push_history(&mut self, track: Track) {
        self.previous.push(track);

        if self.previous.len() > self.max_history {
            self.previous.remove(0);
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<Track>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}
