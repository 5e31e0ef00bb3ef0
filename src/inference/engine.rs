//! Inference engine implementation
//!
//! Host-facing chat session handle backed by llama-cpp.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, the model, its context and the
//! [`ChatSession`] driving them live on a dedicated worker thread. Each
//! [`LlamaEngine`] call sends a command over a channel and waits for the
//! reply, so calls on one handle are serialized by construction.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::inference::adapter::EngineAdapter;
use crate::inference::llama::{ContextSettings, LlamaAdapter};
use crate::inference::model::{read_gguf_metadata, GgufMetadata, ModelError};
use crate::inference::streaming::{StepOutput, StreamToken};
use crate::session::{ChatSession, SessionError, SessionOptions};
use crate::types::{Role, Turn};

/// Errors that can occur while creating or driving a session handle
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl EngineError {
    /// Whether this error means the session could not be configured at all:
    /// missing template, unreadable or unloadable model.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::ModelValidation(_)
                | EngineError::ModelLoad(_)
                | EngineError::Session(SessionError::Configuration(_))
        )
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Sampler chain settings: min-p filter, temperature, then a seeded draw
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Minimum probability relative to the most likely token
    pub min_p: f32,
    /// Temperature for sampling (higher = more random)
    pub temperature: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            min_p: 0.1,
            temperature: 0.8,
            seed: 0,
        }
    }
}

/// Parameters for [`LlamaEngine::create`]
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Path to the GGUF model file
    pub model_path: PathBuf,
    pub sampling: SamplingParams,
    /// Keep user and assistant turns between responses
    pub store_history: bool,
    /// Context window size; `None` uses the model's own context length
    pub context_size: Option<u32>,
    /// Chat template; `None` uses the template embedded in the model
    pub chat_template: Option<String>,
    /// Threads used for decoding (`None` = llama.cpp default)
    pub n_threads: Option<i32>,
    /// Memory-map the model file
    pub use_mmap: bool,
    /// Lock model memory to prevent swapping
    pub use_mlock: bool,
    /// Number of layers to offload to GPU (0 = CPU only)
    pub gpu_layers: u32,
}

impl SessionParams {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            sampling: SamplingParams::default(),
            store_history: true,
            context_size: None,
            chat_template: None,
            n_threads: None,
            use_mmap: true,
            use_mlock: false,
            gpu_layers: 0,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Architecture name from the model metadata
    pub architecture: Option<String>,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Training context length
    pub context_length: u32,
    /// Context window of the session
    pub context_size: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// Everything the worker needs to open a session
struct WorkerSetup {
    params: SessionParams,
    chat_template: String,
    context_size: Option<u32>,
    architecture: Option<String>,
}

type Reply<T> = Sender<Result<T, SessionError>>;

/// Commands sent to the worker thread
enum WorkerCommand {
    AddTurn {
        role: Role,
        content: String,
        reply: Reply<()>,
    },
    Start {
        query: String,
        reply: Reply<()>,
    },
    Step {
        reply: Reply<StepOutput>,
    },
    Stop {
        reply: Reply<()>,
    },
    Throughput {
        reply: Reply<f32>,
    },
    ContextUsed {
        reply: Reply<u32>,
    },
    Turns {
        reply: Reply<Vec<Turn>>,
    },
    Generate {
        query: String,
        token_tx: Sender<StreamToken>,
        stop_signal: Arc<AtomicBool>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// The llama.cpp backend can only be initialized once per process
static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn shared_backend() -> Result<&'static LlamaBackend, EngineError> {
    BACKEND.get_or_try_init(|| {
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("LlamaBackend initialized");
        Ok(backend)
    })
}

/// A chat session on a llama.cpp model.
///
/// Owns a dedicated worker thread holding the model, its context and the
/// session state. Dropping the handle closes the session.
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Model info reported by the worker after loading
    model_info: LoadedModelInfo,
}

impl LlamaEngine {
    /// Loads the model and opens a session on it.
    ///
    /// The model file is validated and the chat template resolved on the
    /// calling thread, so configuration errors surface before any model
    /// weights are read.
    pub fn create(params: SessionParams) -> Result<Self, EngineError> {
        let metadata = read_gguf_metadata(&params.model_path)?;
        tracing::debug!("GGUF validation passed for {:?}", params.model_path);

        let chat_template = resolve_chat_template(params.chat_template.as_deref(), &metadata)?;
        let context_size = resolve_context_size(params.context_size, &metadata);
        if !params.use_mmap {
            tracing::warn!("Disabling mmap is not supported by this backend; the model will be memory-mapped");
        }

        let setup = WorkerSetup {
            architecture: metadata.architecture().map(str::to_string),
            params,
            chat_template,
            context_size,
        };

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("llama-session".to_string())
            .spawn(move || worker_thread_main(setup, ready_tx, command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let model_info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(e) => {
                let _ = handle.join();
                return Err(EngineError::WorkerError(e.to_string()));
            }
        };

        tracing::info!("LlamaEngine worker thread started for {}", model_info.path);

        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
            model_info,
        })
    }

    /// Returns information about the loaded model
    pub fn model_info(&self) -> &LoadedModelInfo {
        &self.model_info
    }

    /// Returns true until [`LlamaEngine::close`] has been called
    pub fn is_open(&self) -> bool {
        self.command_tx.is_some()
    }

    /// Appends a turn without generating, e.g. a system prompt or a replayed message
    pub fn add_turn(&self, role: Role, text: &str) -> Result<(), EngineError> {
        self.request(|reply| WorkerCommand::AddTurn {
            role,
            content: text.to_string(),
            reply,
        })
    }

    /// Begins a response to `query`
    pub fn start(&self, query: &str) -> Result<(), EngineError> {
        self.request(|reply| WorkerCommand::Start {
            query: query.to_string(),
            reply,
        })
    }

    /// Runs one generation step, blocking for one forward pass
    pub fn step(&self) -> Result<StepOutput, EngineError> {
        self.request(|reply| WorkerCommand::Step { reply })
    }

    /// Ends the current response
    pub fn stop(&self) -> Result<(), EngineError> {
        self.request(|reply| WorkerCommand::Stop { reply })
    }

    /// Tokens per second of the current or last response
    pub fn throughput(&self) -> Result<f32, EngineError> {
        self.request(|reply| WorkerCommand::Throughput { reply })
    }

    /// Context cells currently in use
    pub fn context_used(&self) -> Result<u32, EngineError> {
        self.request(|reply| WorkerCommand::ContextUsed { reply })
    }

    /// Snapshot of the session's turns
    pub fn turns(&self) -> Result<Vec<Turn>, EngineError> {
        self.request(|reply| WorkerCommand::Turns { reply })
    }

    /// Generates a response with streaming output
    ///
    /// # Returns
    /// * `Ok((Receiver<StreamToken>, Arc<AtomicBool>))` - Receiver for streamed chunks and stop signal
    /// * `Err(EngineError)` - If the session is closed
    pub fn generate_stream(
        &self,
        query: &str,
    ) -> Result<(Receiver<StreamToken>, Arc<AtomicBool>), EngineError> {
        let command_tx = self.command_tx.as_ref().ok_or(SessionError::Closed)?;

        // Create channel for streaming tokens
        let (token_tx, token_rx) = mpsc::channel();

        // Create stop signal
        let stop_signal = Arc::new(AtomicBool::new(false));

        command_tx
            .send(WorkerCommand::Generate {
                query: query.to_string(),
                token_tx,
                stop_signal: stop_signal.clone(),
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok((token_rx, stop_signal))
    }

    /// Closes the session and releases the model.
    ///
    /// Every later call fails with [`SessionError::Closed`].
    pub fn close(&mut self) -> Result<(), EngineError> {
        let result = self.request(|reply| WorkerCommand::Close { reply });
        self.command_tx = None;
        if let Some(handle) = self.worker_handle.take() {
            handle
                .join()
                .map_err(|_| EngineError::WorkerError("worker thread panicked".to_string()))?;
        }
        result
    }

    fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> WorkerCommand,
    ) -> Result<T, EngineError> {
        let command_tx = self.command_tx.as_ref().ok_or(SessionError::Closed)?;
        let (reply_tx, reply_rx) = mpsc::channel();

        command_tx
            .send(command(reply_tx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let result = reply_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;
        Ok(result?)
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let (reply, _) = mpsc::channel();
            let _ = tx.send(WorkerCommand::Close { reply });
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Picks the explicit template if given, else the one embedded in the model.
fn resolve_chat_template(
    explicit: Option<&str>,
    metadata: &GgufMetadata,
) -> Result<String, EngineError> {
    explicit
        .filter(|t| !t.trim().is_empty())
        .or_else(|| metadata.chat_template())
        .map(str::to_string)
        .ok_or_else(|| {
            SessionError::Configuration(
                "no chat template given and the model does not embed one".to_string(),
            )
            .into()
        })
}

/// Explicit context size if non-zero, else the metadata context length.
fn resolve_context_size(explicit: Option<u32>, metadata: &GgufMetadata) -> Option<u32> {
    explicit
        .filter(|&n| n > 0)
        .or_else(|| metadata.context_length().and_then(|n| u32::try_from(n).ok()))
}

/// Worker thread main loop
///
/// Owns the model and the session, processes commands until closed.
fn worker_thread_main(
    setup: WorkerSetup,
    ready_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    command_rx: Receiver<WorkerCommand>,
) {
    let backend = match shared_backend() {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!("Failed to init backend: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let model = match load_model(backend, &setup.params) {
        Ok(model) => model,
        Err(e) => {
            tracing::error!("{}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut session = match open_session(backend, &model, &setup) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to open session: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let info = LoadedModelInfo {
        path: setup.params.model_path.to_string_lossy().to_string(),
        architecture: setup.architecture.clone(),
        vocab_size: model.n_vocab(),
        context_length: model.n_ctx_train(),
        context_size: session
            .engine()
            .map(|e| e.context_window_size())
            .unwrap_or_default(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };
    tracing::info!(
        "Model info extracted: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_size
    );
    if ready_tx.send(Ok(info)).is_err() {
        return;
    }

    serve(&mut session, command_rx);
    tracing::info!("Worker thread shutting down");
}

fn load_model(backend: &LlamaBackend, params: &SessionParams) -> Result<LlamaModel, EngineError> {
    let model_params = LlamaModelParams::default()
        .with_n_gpu_layers(params.gpu_layers)
        .with_use_mlock(params.use_mlock);

    let model = LlamaModel::load_from_file(backend, &params.model_path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
    tracing::info!("Model loaded: {}", params.model_path.display());
    Ok(model)
}

fn open_session<'m>(
    backend: &LlamaBackend,
    model: &'m LlamaModel,
    setup: &WorkerSetup,
) -> Result<ChatSession<LlamaAdapter<'m>>, EngineError> {
    let settings = ContextSettings {
        n_ctx: setup.context_size.unwrap_or_else(|| model.n_ctx_train()),
        n_threads: setup.params.n_threads,
    };
    let adapter = LlamaAdapter::new(backend, model, &settings, &setup.params.sampling)?;
    let session = ChatSession::new(
        adapter,
        SessionOptions {
            chat_template: setup.chat_template.clone(),
            store_history: setup.params.store_history,
        },
    )?;
    Ok(session)
}

/// Processes commands until the session is closed or the handle is dropped
fn serve<E: EngineAdapter>(session: &mut ChatSession<E>, command_rx: Receiver<WorkerCommand>) {
    for command in command_rx {
        match command {
            WorkerCommand::AddTurn {
                role,
                content,
                reply,
            } => {
                let _ = reply.send(session.add_turn(role, content));
            }
            WorkerCommand::Start { query, reply } => {
                let _ = reply.send(session.start(&query));
            }
            WorkerCommand::Step { reply } => {
                let _ = reply.send(session.step());
            }
            WorkerCommand::Stop { reply } => {
                let _ = reply.send(session.stop());
            }
            WorkerCommand::Throughput { reply } => {
                let _ = reply.send(session.throughput());
            }
            WorkerCommand::ContextUsed { reply } => {
                let _ = reply.send(session.context_used());
            }
            WorkerCommand::Turns { reply } => {
                let _ = reply.send(Ok(session.turns().to_vec()));
            }
            WorkerCommand::Generate {
                query,
                token_tx,
                stop_signal,
            } => {
                let result = session.respond(&query, |chunk| {
                    if stop_signal.load(Ordering::Relaxed) {
                        return ControlFlow::Break(());
                    }
                    match token_tx.send(StreamToken::Token(chunk.to_string())) {
                        Ok(()) => ControlFlow::Continue(()),
                        Err(_) => {
                            // Receiver dropped, stop generation
                            tracing::debug!("Receiver dropped, stopping generation");
                            ControlFlow::Break(())
                        }
                    }
                });
                let _ = match result {
                    Ok(summary) => token_tx.send(StreamToken::Done(summary)),
                    Err(e) => token_tx.send(StreamToken::Error(e.to_string())),
                };
            }
            WorkerCommand::Close { reply } => {
                let _ = reply.send(session.close());
                return;
            }
        }
    }
    // Handle dropped without an explicit close
    tracing::debug!("Command channel closed, worker exiting");
}

/// Checks that `path` can serve as a model before a handle is created.
pub fn check_model_file<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, EngineError> {
    Ok(read_gguf_metadata(path)?)
}
