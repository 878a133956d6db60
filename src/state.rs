use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessState {
    Cold = 0,
    Loading = 1,
    Ready = 2,
    Decoding = 3,
    Transcribing = 4,
}

impl From<u8> for ReadinessState {
    fn from(v: u8) -> Self {
        match v {
            0 => ReadinessState::Cold,
            1 => ReadinessState::Loading,
            2 => ReadinessState::Ready,
            3 => ReadinessState::Decoding,
            4 => ReadinessState::Transcribing,
            _ => ReadinessState::Cold,
        }
    }
}

#[derive(Clone)]
pub struct StateManager {
    state: Arc<AtomicU8>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ReadinessState::Cold as u8)),
        }
    }

    pub fn get(&self) -> ReadinessState {
        ReadinessState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ReadinessState) {
        self.state.store(state as u8, Ordering::SeqCst);
        log::info!("State transition -> {:?}", state);
    }

    /// Set by whoever holds the model manager's load lock, so there is
    /// never a second loader to race.
    pub fn transition_to_loading(&self) {
        self.set(ReadinessState::Loading);
    }

    /// Model resident and no job running. Always succeeds.
    pub fn transition_to_ready(&self) {
        self.set(ReadinessState::Ready);
    }

    pub fn transition_to_decoding(&self) {
        self.set(ReadinessState::Decoding);
    }

    pub fn transition_to_transcribing(&self) {
        self.set(ReadinessState::Transcribing);
    }

    pub fn transition_to_cold(&self) {
        self.set(ReadinessState::Cold);
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.get(),
            ReadinessState::Loading | ReadinessState::Decoding | ReadinessState::Transcribing
        )
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
