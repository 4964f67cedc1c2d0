//! 模型生命周期 (Model readiness)
//!
//! ```text
//! Unloaded -> Downloading -> Loading -> Ready
//!                                   \-> Failed
//! ```
//!
//! [`ModelService`] owns the only copy of the loaded predictor and is shared
//! by reference with every classifier call. Loading walks an explicit
//! fallback chain ([`LoadStep`]); each step is tried only when the previous
//! one reported a [`LoadFailure::Structural`] error.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use tract_onnx::prelude::*;

use crate::config::ModelConfig;
use crate::error::{Result, ResultExt as _, VerifyError};
use crate::predictor::{OnnxPredictor, Predictor, ReferencePredictor};
use crate::util::with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelState {
    Unloaded,
    Downloading,
    Loading,
    Ready,
    Failed,
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStep {
    /// Load the serialized graph as-is.
    FullModel,
    /// Load the graph again but re-declare its input as `[1, S, S, 3]`,
    /// for artefacts whose stored input shape no longer matches.
    ReattachInput,
    /// Rebuild the reference architecture and load only numeric weights.
    ReferenceRebuild,
}

pub const LOAD_CHAIN: [LoadStep; 3] =
    [LoadStep::FullModel, LoadStep::ReattachInput, LoadStep::ReferenceRebuild];

/// Transition guard for the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// Shape/input incompatibility: the next step may succeed.
    Structural(String),
    /// Anything else: abort the chain.
    Unrecognized(String),
}

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub graph: PathBuf,
    pub weights: PathBuf,
    pub input_size: usize,
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, step: LoadStep, paths: &ModelPaths) -> std::result::Result<Arc<dyn Predictor>, LoadFailure>;
}

/// Walk [`LOAD_CHAIN`] and return the first predictor that materializes.
pub fn run_fallback_chain(
    loader: &dyn ModelLoader,
    paths: &ModelPaths,
) -> Result<(Arc<dyn Predictor>, LoadStep)> {
    let mut last = String::from("no load step attempted");
    for step in LOAD_CHAIN {
        match loader.load(step, paths) {
            Ok(predictor) => {
                info!(?step, kind = predictor.kind(), "model loaded");
                return Ok((predictor, step));
            }
            Err(LoadFailure::Structural(msg)) => {
                debug!(?step, %msg, "structural load error, falling back");
                last = msg;
            }
            Err(LoadFailure::Unrecognized(msg)) => {
                warn!(?step, %msg, "unrecognized load error, aborting chain");
                return Err(VerifyError::ModelUnavailable(msg));
            }
        }
    }
    Err(VerifyError::ModelUnavailable(format!("all load fallbacks exhausted: {last}")))
}

const STRUCTURAL_MARKERS: &[&str] = &[
    "shape",
    "fact",
    "rank",
    "dimension",
    "batch",
    "undetermined",
    "symbol",
    "broadcast",
    "unify",
    "failed analyse",
];

/// Classify a loader error message as structural or not.
pub fn classify_load_error(message: &str) -> LoadFailure {
    let lowered = message.to_lowercase();
    if STRUCTURAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        LoadFailure::Structural(message.to_string())
    } else {
        LoadFailure::Unrecognized(message.to_string())
    }
}

/// tract-backed loader used in production.
pub struct TractLoader;

impl TractLoader {
    fn onnx(paths: &ModelPaths, reattach: bool) -> TractResult<Arc<dyn Predictor>> {
        let mut model = tract_onnx::onnx().model_for_path(&paths.graph)?;
        if reattach {
            let s = paths.input_size;
            model = model.with_input_fact(0, f32::fact([1, s, s, 3]).into())?;
        }
        let plan = model.into_optimized()?.into_runnable()?;
        Ok(Arc::new(OnnxPredictor::new(plan)))
    }
}

impl ModelLoader for TractLoader {
    fn load(&self, step: LoadStep, paths: &ModelPaths) -> std::result::Result<Arc<dyn Predictor>, LoadFailure> {
        match step {
            LoadStep::FullModel | LoadStep::ReattachInput => {
                // no graph at all: only the weights-only rebuild can help
                if !paths.graph.exists() {
                    return Err(LoadFailure::Structural(format!(
                        "model graph {} missing",
                        paths.graph.display()
                    )));
                }
                Self::onnx(paths, step == LoadStep::ReattachInput)
                    .map_err(|e| classify_load_error(&format!("{e:#}")))
            }
            LoadStep::ReferenceRebuild => ReferencePredictor::from_safetensors(&paths.weights)
                .map(|p| Arc::new(p) as Arc<dyn Predictor>)
                .map_err(|e| LoadFailure::Unrecognized(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Weight acquisition
// ---------------------------------------------------------------------------

/// Fetches blobs from the model registry into the local cache.
pub struct WeightFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl WeightFetcher {
    pub fn new(timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .ctx_config("build model registry client")?;
        Ok(Self { client, timeout, max_retries })
    }

    /// Returns `Ok(false)` without touching the network when `dest` already
    /// exists.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<bool> {
        if dest.exists() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(%url, dest = %dest.display(), "downloading model blob");
        let client = &self.client;
        let bytes = with_retry("model download", self.timeout, self.max_retries, || async move {
            client.get(url).send().await?.error_for_status()?.bytes().await
        })
        .await
        .map_err(|e| VerifyError::ModelUnavailable(format!("download {url}: {e}")))?;

        // write-then-rename so a half-written blob is never mistaken for a cached one
        let part = dest.with_extension("part");
        tokio::fs::write(&part, &bytes).await?;
        tokio::fs::rename(&part, dest).await?;
        info!(bytes = bytes.len(), "model blob cached");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct Slot {
    state: ModelState,
    predictor: Option<Arc<dyn Predictor>>,
    step: Option<LoadStep>,
    failure: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub step: Option<LoadStep>,
    pub predictor: Option<&'static str>,
    pub failure: Option<String>,
}

pub struct ModelService {
    cfg: ModelConfig,
    loader: Arc<dyn ModelLoader>,
    fetcher: Option<WeightFetcher>,
    slot: RwLock<Slot>,
    // one readiness attempt at a time; never held during inference
    init_lock: tokio::sync::Mutex<()>,
}

impl ModelService {
    pub fn new(cfg: ModelConfig) -> Result<Self> {
        let fetcher = WeightFetcher::new(cfg.download_timeout(), cfg.max_retries)?;
        Ok(Self::build(cfg, Arc::new(TractLoader), Some(fetcher)))
    }

    /// Custom loader, no registry access: the weights must already be cached.
    pub fn with_loader(cfg: ModelConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self::build(cfg, loader, None)
    }

    /// Already `Ready` with the given predictor.
    pub fn preloaded(cfg: ModelConfig, predictor: Arc<dyn Predictor>) -> Self {
        let svc = Self::with_loader(cfg, Arc::new(TractLoader));
        svc.set(ModelState::Ready, Some(predictor), None, None);
        svc
    }

    fn build(cfg: ModelConfig, loader: Arc<dyn ModelLoader>, fetcher: Option<WeightFetcher>) -> Self {
        Self {
            cfg,
            loader,
            fetcher,
            slot: RwLock::new(Slot {
                state: ModelState::Unloaded,
                predictor: None,
                step: None,
                failure: None,
            }),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn input_size(&self) -> u32 {
        self.cfg.input_size
    }

    pub fn state(&self) -> ModelState {
        self.slot.read().map(|s| s.state).unwrap_or(ModelState::Failed)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ModelState::Ready
    }

    pub fn status(&self) -> ModelStatus {
        match self.slot.read() {
            Ok(s) => ModelStatus {
                state: s.state,
                step: s.step,
                predictor: s.predictor.as_ref().map(|p| p.kind()),
                failure: s.failure.clone(),
            },
            Err(_) => ModelStatus {
                state: ModelState::Failed,
                step: None,
                predictor: None,
                failure: Some("model slot poisoned".into()),
            },
        }
    }

    /// Explicit readiness attempt. Retries from `Failed`.
    pub async fn init(&self) -> Result<Arc<dyn Predictor>> {
        self.become_ready(true).await
    }

    /// Predictor for one inference call. Triggers loading on first use; a
    /// `Failed` model reports immediately until the next [`init`](Self::init).
    pub async fn ensure_ready(&self) -> Result<Arc<dyn Predictor>> {
        if let Some(p) = self.ready_predictor()? {
            return Ok(p);
        }
        self.become_ready(false).await
    }

    /// Drop the predictor and return to `Unloaded`.
    pub fn shutdown(&self) {
        self.set(ModelState::Unloaded, None, None, None);
        info!("model released");
    }

    fn ready_predictor(&self) -> Result<Option<Arc<dyn Predictor>>> {
        let slot = self
            .slot
            .read()
            .map_err(|_| VerifyError::ModelUnavailable("model slot poisoned".into()))?;
        match slot.state {
            ModelState::Ready => Ok(slot.predictor.clone()),
            ModelState::Failed => Err(VerifyError::ModelUnavailable(
                slot.failure.clone().unwrap_or_else(|| "model failed to load".into()),
            )),
            _ => Ok(None),
        }
    }

    async fn become_ready(&self, retry_failed: bool) -> Result<Arc<dyn Predictor>> {
        let _guard = self.init_lock.lock().await;

        // someone else may have finished while we waited
        match self.ready_predictor() {
            Ok(Some(p)) => return Ok(p),
            Ok(None) => {}
            Err(e) if !retry_failed => return Err(e),
            Err(_) => {}
        }

        match self.load().await {
            Ok((predictor, step)) => {
                self.set(ModelState::Ready, Some(predictor.clone()), Some(step), None);
                Ok(predictor)
            }
            Err(e) => {
                warn!(error = %e, "model failed to become ready");
                self.set(ModelState::Failed, None, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn load(&self) -> Result<(Arc<dyn Predictor>, LoadStep)> {
        let paths = ModelPaths {
            graph: self.cfg.model_path(),
            weights: self.cfg.weights_path(),
            input_size: self.cfg.input_size as usize,
        };

        self.set(ModelState::Downloading, None, None, None);
        if let Some(fetcher) = &self.fetcher {
            fetcher.fetch(&self.cfg.url, &paths.graph).await?;
            if let Some(url) = &self.cfg.weights_url {
                // only the last fallback needs these
                if let Err(e) = fetcher.fetch(url, &paths.weights).await {
                    warn!(error = %e, "reference weights unavailable");
                }
            }
        } else if !paths.graph.exists() && !paths.weights.exists() {
            return Err(VerifyError::ModelUnavailable(format!(
                "no cached model at {}",
                paths.graph.display()
            )));
        }

        self.set(ModelState::Loading, None, None, None);
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || run_fallback_chain(loader.as_ref(), &paths))
            .await
            .map_err(|e| VerifyError::ModelUnavailable(format!("load task: {e}")))?
    }

    fn set(
        &self,
        state: ModelState,
        predictor: Option<Arc<dyn Predictor>>,
        step: Option<LoadStep>,
        failure: Option<String>,
    ) {
        if let Ok(mut slot) = self.slot.write() {
            *slot = Slot { state, predictor, step, failure };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::ImageTensor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Constant(f32);

    impl Predictor for Constant {
        fn infer(&self, _: &ImageTensor) -> Result<Vec<f32>> {
            Ok(vec![self.0])
        }
        fn kind(&self) -> &'static str {
            "constant"
        }
    }

    /// Scripted outcome per step, records which steps ran.
    struct Scripted {
        outcomes: Vec<std::result::Result<f32, LoadFailure>>,
        seen: Mutex<Vec<LoadStep>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: Vec<std::result::Result<f32, LoadFailure>>) -> Self {
            Self { outcomes, seen: Mutex::new(Vec::new()), calls: AtomicUsize::new(0) }
        }
    }

    impl ModelLoader for Scripted {
        fn load(&self, step: LoadStep, _: &ModelPaths) -> std::result::Result<Arc<dyn Predictor>, LoadFailure> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(step);
            match &self.outcomes[i] {
                Ok(v) => Ok(Arc::new(Constant(*v))),
                Err(e) => Err(e.clone()),
            }
        }
    }

    fn paths() -> ModelPaths {
        ModelPaths { graph: "g.onnx".into(), weights: "w.safetensors".into(), input_size: 224 }
    }

    fn structural() -> LoadFailure {
        LoadFailure::Structural("input shape mismatch".into())
    }

    #[test]
    fn first_step_success_stops_chain() {
        let loader = Scripted::new(vec![Ok(0.1)]);
        let (_, step) = run_fallback_chain(&loader, &paths()).unwrap();
        assert_eq!(step, LoadStep::FullModel);
        assert_eq!(loader.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn structural_error_falls_back_to_reattach() {
        let loader = Scripted::new(vec![Err(structural()), Ok(0.1)]);
        let (_, step) = run_fallback_chain(&loader, &paths()).unwrap();
        assert_eq!(step, LoadStep::ReattachInput);
    }

    #[test]
    fn two_structural_errors_reach_reference_rebuild() {
        let loader = Scripted::new(vec![Err(structural()), Err(structural()), Ok(0.1)]);
        let (_, step) = run_fallback_chain(&loader, &paths()).unwrap();
        assert_eq!(step, LoadStep::ReferenceRebuild);
        assert_eq!(*loader.seen.lock().unwrap(), LOAD_CHAIN.to_vec());
    }

    #[test]
    fn unrecognized_error_aborts_chain() {
        let loader = Scripted::new(vec![Err(LoadFailure::Unrecognized("permission denied".into()))]);
        let err = run_fallback_chain(&loader, &paths()).err().unwrap();
        assert!(matches!(err, VerifyError::ModelUnavailable(_)));
        assert_eq!(loader.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn exhausted_chain_is_model_unavailable() {
        let loader = Scripted::new(vec![Err(structural()), Err(structural()), Err(structural())]);
        let err = run_fallback_chain(&loader, &paths()).err().unwrap();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn error_classification() {
        assert!(matches!(
            classify_load_error("Failed analyse for node #0 \"input\" Source: incompatible shape"),
            LoadFailure::Structural(_)
        ));
        assert!(matches!(
            classify_load_error("Translating batch_shape attribute"),
            LoadFailure::Structural(_)
        ));
        assert!(matches!(
            classify_load_error("failed to decode Protobuf message"),
            LoadFailure::Unrecognized(_)
        ));
    }

    // -- real graphs through tract ------------------------------------------

    /// Bare protobuf writer, enough to hand-build tiny ONNX graphs.
    #[derive(Default)]
    struct Pb(Vec<u8>);

    impl Pb {
        fn varint(&mut self, mut v: u64) {
            while v >= 0x80 {
                self.0.push((v as u8) | 0x80);
                v >>= 7;
            }
            self.0.push(v as u8);
        }

        fn int(mut self, field: u64, v: i64) -> Self {
            self.varint(field << 3);
            self.varint(v as u64);
            self
        }

        fn bytes(mut self, field: u64, b: &[u8]) -> Self {
            self.varint(field << 3 | 2);
            self.varint(b.len() as u64);
            self.0.extend_from_slice(b);
            self
        }

        fn str(self, field: u64, s: &str) -> Self {
            self.bytes(field, s.as_bytes())
        }

        fn msg(self, field: u64, m: Pb) -> Self {
            self.bytes(field, &m.0)
        }
    }

    const ONNX_FLOAT: i64 = 1;
    const ATTR_INTS: i64 = 7;

    fn value_info(name: &str, dims: &[i64]) -> Pb {
        let shape = dims.iter().fold(Pb::default(), |acc, d| acc.msg(1, Pb::default().int(1, *d)));
        let tensor = Pb::default().int(1, ONNX_FLOAT).msg(2, shape);
        Pb::default().str(1, name).msg(2, Pb::default().msg(1, tensor))
    }

    fn node(op: &str, inputs: &[&str], output: &str) -> Pb {
        inputs
            .iter()
            .fold(Pb::default(), |acc, i| acc.str(1, i))
            .str(2, output)
            .str(3, output)
            .str(4, op)
    }

    fn mean_over_pixels(input: &str) -> Pb {
        let axes = [1, 2, 3].iter().fold(Pb::default().str(1, "axes"), |acc, a| acc.int(8, *a));
        node("ReduceMean", &[input], "m").msg(5, axes.int(20, ATTR_INTS))
    }

    fn onnx_model(graph: Pb) -> Vec<u8> {
        Pb::default()
            .int(1, 7)
            .msg(7, graph)
            .msg(8, Pb::default().int(2, 13))
            .0
    }

    /// x[1,S,S,3] -> ReduceMean(1,2,3) -> Sigmoid
    fn mean_head(side: i64) -> Vec<u8> {
        onnx_model(
            Pb::default()
                .msg(1, mean_over_pixels("x"))
                .msg(1, node("Sigmoid", &["m"], "y"))
                .str(2, "mean_head")
                .msg(11, value_info("x", &[1, side, side, 3]))
                .msg(12, value_info("y", &[1, 1, 1, 1])),
        )
    }

    /// Same head behind an `Add` with a `[1,S,S,3]` constant, but the stored
    /// input says 8x8: only a re-declared input makes the shapes agree.
    fn stale_input_head(side: i64) -> Vec<u8> {
        let zeros = vec![0u8; (side * side * 3 * 4) as usize];
        let bias = Pb::default()
            .int(1, 1)
            .int(1, side)
            .int(1, side)
            .int(1, 3)
            .int(2, ONNX_FLOAT)
            .str(8, "bias")
            .bytes(9, &zeros);
        onnx_model(
            Pb::default()
                .msg(1, node("Add", &["x", "bias"], "a"))
                .msg(1, mean_over_pixels("a"))
                .msg(1, node("Sigmoid", &["m"], "y"))
                .str(2, "stale_head")
                .msg(5, bias)
                .msg(11, value_info("x", &[1, 8, 8, 3]))
                .msg(12, value_info("y", &[1, 1, 1, 1])),
        )
    }

    fn onnx_paths(dir: &Path, graph: &[u8]) -> ModelPaths {
        let path = dir.join("head.onnx");
        std::fs::write(&path, graph).unwrap();
        ModelPaths { graph: path, weights: dir.join("absent.safetensors"), input_size: 16 }
    }

    fn half_gray(side: usize) -> ImageTensor {
        ImageTensor { data: vec![0.5; side * side * 3], shape: [1, side, side, 3] }
    }

    #[test]
    fn tract_loads_full_graph_and_infers_one_scalar() {
        let dir = tempfile::tempdir().unwrap();
        let paths = onnx_paths(dir.path(), &mean_head(16));

        let predictor = TractLoader.load(LoadStep::FullModel, &paths).unwrap();
        assert_eq!(predictor.kind(), "onnx");
        let out = predictor.infer(&half_gray(16)).unwrap();
        assert_eq!(out.len(), 1);
        // sigmoid(0.5)
        assert!((out[0] - 0.622_459_3).abs() < 1e-5, "{out:?}");
    }

    #[test]
    fn stale_input_shape_is_structural_and_reattach_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = onnx_paths(dir.path(), &stale_input_head(16));

        assert!(matches!(
            TractLoader.load(LoadStep::FullModel, &paths),
            Err(LoadFailure::Structural(_))
        ));

        let (predictor, step) = run_fallback_chain(&TractLoader, &paths).unwrap();
        assert_eq!(step, LoadStep::ReattachInput);
        let out = predictor.infer(&half_gray(16)).unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0] - 0.622_459_3).abs() < 1e-5, "{out:?}");
    }

    #[test]
    fn unreadable_graph_never_yields_a_predictor() {
        let dir = tempfile::tempdir().unwrap();
        let paths = onnx_paths(dir.path(), b"this is not protobuf");
        assert!(matches!(
            run_fallback_chain(&TractLoader, &paths),
            Err(VerifyError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn cached_weights_alone_rebuild_reference_model() {
        use crate::predictor::{save_reference_weights, DenseLayer, REFERENCE_FEATURES};

        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig { cache_dir: dir.path().to_path_buf(), ..ModelConfig::default() };
        let head = vec![DenseLayer {
            weight: vec![0.0; REFERENCE_FEATURES],
            bias: vec![0.0],
            inputs: REFERENCE_FEATURES,
            outputs: 1,
        }];
        save_reference_weights(&cfg.weights_path(), &head).unwrap();
        assert!(!cfg.model_path().exists());

        let svc = ModelService::with_loader(cfg, Arc::new(TractLoader));
        let p = svc.init().await.unwrap();
        assert_eq!(p.kind(), "reference");
        assert_eq!(svc.status().step, Some(LoadStep::ReferenceRebuild));
        assert!((p.infer(&half_gray(32)).unwrap()[0] - 0.5).abs() < 1e-6);
    }

    fn cached_cfg(dir: &Path) -> ModelConfig {
        std::fs::write(dir.join("m.onnx"), b"cached").unwrap();
        ModelConfig {
            cache_dir: dir.to_path_buf(),
            file_name: "m.onnx".into(),
            ..ModelConfig::default()
        }
    }

    #[tokio::test]
    async fn lifecycle_init_ready_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let svc = ModelService::with_loader(cached_cfg(dir.path()), Arc::new(Scripted::new(vec![Ok(0.3)])));
        assert_eq!(svc.state(), ModelState::Unloaded);

        let p = svc.ensure_ready().await.unwrap();
        assert_eq!(p.kind(), "constant");
        assert!(svc.is_ready());
        assert_eq!(svc.status().step, Some(LoadStep::FullModel));

        // cached: no second load
        svc.ensure_ready().await.unwrap();

        svc.shutdown();
        assert_eq!(svc.state(), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn failed_model_reports_until_next_init() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(Scripted::new(vec![
            Err(LoadFailure::Unrecognized("corrupt".into())),
            Ok(0.7),
        ]));
        let svc = ModelService::with_loader(cached_cfg(dir.path()), loader.clone());

        assert!(svc.ensure_ready().await.is_err());
        assert_eq!(svc.state(), ModelState::Failed);

        // no reload attempt from the inference path
        assert!(svc.ensure_ready().await.is_err());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        // explicit readiness attempt recovers
        svc.init().await.unwrap();
        assert!(svc.is_ready());
    }

    #[tokio::test]
    async fn missing_cache_without_registry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig { cache_dir: dir.path().to_path_buf(), ..ModelConfig::default() };
        let svc = ModelService::with_loader(cfg, Arc::new(Scripted::new(vec![Ok(0.1)])));
        assert!(matches!(svc.init().await, Err(VerifyError::ModelUnavailable(_))));
        assert_eq!(svc.state(), ModelState::Failed);
    }

    #[tokio::test]
    async fn download_is_idempotent() {
        use axum::{routing::get, Router};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/m.onnx",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { "weights-blob" }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cache").join("m.onnx");
        let fetcher = WeightFetcher::new(Duration::from_secs(5), 1).unwrap();
        let url = format!("http://{addr}/m.onnx");

        assert!(fetcher.fetch(&url, &dest).await.unwrap());
        assert!(!fetcher.fetch(&url, &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"weights-blob");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_registry_is_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = WeightFetcher::new(Duration::from_secs(2), 1).unwrap();
        let err = fetcher
            .fetch("http://127.0.0.1:1/m.onnx", &dir.path().join("m.onnx"))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::ModelUnavailable(_)));
    }
}
