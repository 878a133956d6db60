use crate::config::{Config, MODEL_REPO};
use crate::state::StateManager;
use crate::transcriber::{SpeechModel, WhisperTranscriber};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Produces a ready-to-use speech model. Called at most once per residency.
pub trait ModelLoader: Send + Sync {
    /// Human-readable name for progress notes
    fn describe(&self) -> String;

    fn load(&self) -> Result<Arc<dyn SpeechModel>>;
}

/// Loads ggml whisper weights, fetching them from the hub when missing.
pub struct WhisperLoader {
    config: Config,
}

impl WhisperLoader {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ModelLoader for WhisperLoader {
    fn describe(&self) -> String {
        match &self.config.model_path {
            Some(path) => format!("whisper ({})", path.display()),
            None => format!("whisper {}", self.config.model.label()),
        }
    }

    fn load(&self) -> Result<Arc<dyn SpeechModel>> {
        let path = ensure_model_file(&self.config)?;
        let transcriber = WhisperTranscriber::new(&path, self.config.use_gpu)?;
        if let Err(e) = transcriber.warmup() {
            log::warn!("Warmup failed: {}", e);
        }
        Ok(Arc::new(transcriber))
    }
}

/// Resolve the weights file, downloading it when allowed.
pub fn ensure_model_file(config: &Config) -> Result<PathBuf> {
    let path = config.model_path();
    if path.exists() {
        log::debug!("Model file present at {:?}", path);
        return Ok(path);
    }

    if config.model_path.is_some() {
        return Err(anyhow!("Model not found at {:?}", path));
    }

    if !config.auto_download {
        return Err(anyhow!(
            "Model not found at {:?}. Download it from {} or enable auto_download.",
            path,
            config.model.download_url()
        ));
    }

    download_model(config.model.filename(), &config.models_dir())
}

fn download_model(filename: &str, models_dir: &Path) -> Result<PathBuf> {
    log::info!("Downloading {} from {}", filename, MODEL_REPO);
    fs::create_dir_all(models_dir)
        .with_context(|| format!("failed to create {}", models_dir.display()))?;

    let api = hf_hub::api::sync::Api::new().map_err(|e| anyhow!("HF API init: {}", e))?;
    let repo = api.model(MODEL_REPO.to_string());
    let cached = repo
        .get(filename)
        .map_err(|e| anyhow!("download failed for {}: {}", filename, e))?;

    let target = models_dir.join(filename);
    if cached != target {
        fs::copy(&cached, &target)
            .with_context(|| format!("failed to copy {} into {}", filename, models_dir.display()))?;
    }

    log::info!("Model ready at {:?}", target);
    Ok(target)
}

/// How a call to [`ModelManager::load`] was satisfied.
pub enum LoadOutcome {
    Cached(Arc<dyn SpeechModel>),
    Loaded(Arc<dyn SpeechModel>),
}

impl LoadOutcome {
    pub fn model(&self) -> &Arc<dyn SpeechModel> {
        match self {
            LoadOutcome::Cached(model) | LoadOutcome::Loaded(model) => model,
        }
    }

    pub fn into_model(self) -> Arc<dyn SpeechModel> {
        match self {
            LoadOutcome::Cached(model) | LoadOutcome::Loaded(model) => model,
        }
    }

    pub fn was_cached(&self) -> bool {
        matches!(self, LoadOutcome::Cached(_))
    }
}

/// Keeps at most one model resident and loads it on first use.
#[derive(Clone)]
pub struct ModelManager {
    model: Arc<Mutex<Option<Arc<dyn SpeechModel>>>>,
    /// Serializes loads; the slot lock is only held for swaps
    loading: Arc<Mutex<()>>,
    loader: Arc<dyn ModelLoader>,
    state: StateManager,
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>, state: StateManager) -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            loading: Arc::new(Mutex::new(())),
            loader,
            state,
        }
    }

    pub fn describe(&self) -> String {
        self.loader.describe()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    fn resident(&self) -> Option<Arc<dyn SpeechModel>> {
        self.model.lock().clone()
    }

    /// Blocks the calling thread while loading. A second caller waits for
    /// the first load and then gets the cached model.
    pub fn load(&self) -> Result<LoadOutcome> {
        if let Some(model) = self.resident() {
            return Ok(LoadOutcome::Cached(model));
        }

        let _guard = self.loading.lock();
        if let Some(model) = self.resident() {
            return Ok(LoadOutcome::Cached(model));
        }

        self.state.transition_to_loading();
        match self.loader.load() {
            Ok(model) => {
                log::info!("Model '{}' resident", model.name());
                *self.model.lock() = Some(model.clone());
                self.state.transition_to_ready();
                Ok(LoadOutcome::Loaded(model))
            }
            Err(e) => {
                log::error!("Failed to load model: {:#}", e);
                self.state.transition_to_cold();
                Err(e)
            }
        }
    }

    pub fn unload(&self) {
        if self.model.lock().take().is_some() {
            log::info!("Model unloaded");
        }
        self.state.transition_to_cold();
    }

    /// Never waits on an in-flight load.
    pub fn is_loaded(&self) -> bool {
        self.model.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ReadinessState;
    use crate::transcriber::{TranscribeOptions, Transcript};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoModel;

    impl SpeechModel for EchoModel {
        fn name(&self) -> &str {
            "echo"
        }

        fn transcribe(&self, samples: &[f32], _options: &TranscribeOptions) -> Result<Transcript> {
            Ok(Transcript {
                text: format!("{} samples", samples.len()),
                segments: Vec::new(),
                language: None,
                duration_secs: 0.0,
            })
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        fail: bool,
    }

    impl ModelLoader for CountingLoader {
        fn describe(&self) -> String {
            "counting".into()
        }

        fn load(&self) -> Result<Arc<dyn SpeechModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("weights corrupt"))
            } else {
                Ok(Arc::new(EchoModel))
            }
        }
    }

    fn manager(fail: bool) -> (ModelManager, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail,
        });
        (ModelManager::new(loader.clone(), StateManager::new()), loader)
    }

    #[test]
    fn test_loads_once_then_serves_cache() {
        let (manager, loader) = manager(false);

        let first = manager.load().unwrap();
        assert!(!first.was_cached());
        assert_eq!(manager.state().get(), ReadinessState::Ready);

        let second = manager.load().unwrap();
        assert!(second.was_cached());
        assert_eq!(second.model().name(), "echo");
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_returns_to_cold() {
        let (manager, loader) = manager(true);

        let err = manager.load().err().unwrap();
        assert!(err.to_string().contains("weights corrupt"));
        assert_eq!(manager.state().get(), ReadinessState::Cold);
        assert!(!manager.is_loaded());

        // the next call tries again
        assert!(manager.load().is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unload_forces_reload() {
        let (manager, loader) = manager(false);
        manager.load().unwrap();
        manager.unload();
        assert!(!manager.is_loaded());
        assert_eq!(manager.state().get(), ReadinessState::Cold);

        assert!(!manager.load().unwrap().was_cached());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    struct GatedLoader {
        gate: Mutex<crossbeam_channel::Receiver<()>>,
        started: crossbeam_channel::Sender<()>,
    }

    impl ModelLoader for GatedLoader {
        fn describe(&self) -> String {
            "gated".into()
        }

        fn load(&self) -> Result<Arc<dyn SpeechModel>> {
            let _ = self.started.send(());
            self.gate
                .lock()
                .recv_timeout(std::time::Duration::from_secs(10))
                .map_err(|_| anyhow!("gate never opened"))?;
            Ok(Arc::new(EchoModel))
        }
    }

    #[test]
    fn test_residency_check_does_not_wait_for_load() {
        let (gate_tx, gate_rx) = crossbeam_channel::bounded(1);
        let (started_tx, started_rx) = crossbeam_channel::unbounded();
        let manager = ModelManager::new(
            Arc::new(GatedLoader {
                gate: Mutex::new(gate_rx),
                started: started_tx,
            }),
            StateManager::new(),
        );

        let loading = manager.clone();
        let handle = std::thread::spawn(move || loading.load().map(|o| o.was_cached()));
        started_rx.recv_timeout(std::time::Duration::from_secs(10)).unwrap();

        let begin = std::time::Instant::now();
        assert!(!manager.is_loaded());
        assert!(begin.elapsed() < std::time::Duration::from_millis(500));
        assert_eq!(manager.state().get(), ReadinessState::Loading);

        gate_tx.send(()).unwrap();
        assert!(!handle.join().unwrap().unwrap());
        assert!(manager.is_loaded());
        assert!(manager.load().unwrap().was_cached());
    }

    #[test]
    fn test_existing_model_file_is_used_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.models_dir = Some(dir.path().to_path_buf());
        let expected = dir.path().join(config.model.filename());
        fs::write(&expected, b"weights").unwrap();

        assert_eq!(ensure_model_file(&config).unwrap(), expected);
    }

    #[test]
    fn test_missing_model_without_download_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.models_dir = Some(dir.path().to_path_buf());
        config.auto_download = false;

        let err = ensure_model_file(&config).unwrap_err();
        assert!(err.to_string().contains("auto_download"));
    }

    #[test]
    fn test_missing_explicit_model_path_fails() {
        let mut config = Config::default();
        config.model_path = Some(PathBuf::from("/nonexistent/ggml-custom.bin"));
        assert!(ensure_model_file(&config).is_err());
    }

    #[test]
    fn test_loader_description() {
        let mut config = Config::default();
        assert_eq!(WhisperLoader::new(config.clone()).describe(), "whisper base.en");
        config.model_path = Some(PathBuf::from("/m/custom.bin"));
        assert_eq!(WhisperLoader::new(config).describe(), "whisper (/m/custom.bin)");
    }
}
