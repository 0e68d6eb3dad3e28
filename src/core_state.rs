//! Application state shared by the HTTP layer.
//!
//! `CoreState` is the composition root: the run registry, progress
//! broadcaster, result store, and orchestrator are constructed here once and
//! injected, never reached through globals.

use std::sync::{Arc, Mutex};

use crate::config::AppConfig;
use crate::pipeline::analysis::{
    standard_handlers, AnalysisError, AnalysisService, CompletionNotifier, DependencyGraph,
    EngineParts, EngineSettings, GraphError, JsonFileSubjectSource, LogNotifier, Orchestrator,
    ProgressBroadcaster, ResultStore, RetryPolicy, RunRegistry, SqliteResultStore,
    StepHandler, SubjectSource, SweeperHandle,
};
use crate::pipeline::reasoning::{OllamaReasoningClient, ReasoningClient, ReasoningError};

/// Jitter applied to every retry backoff.
const BACKOFF_JITTER: f64 = 0.2;

/// Collaborators that vary between production and tests.
pub struct Components {
    pub handlers: Vec<Arc<dyn StepHandler>>,
    pub subjects: Arc<dyn SubjectSource>,
    pub store: Arc<dyn ResultStore>,
    pub notifier: Arc<dyn CompletionNotifier>,
}

pub struct CoreState {
    config: AppConfig,
    service: AnalysisService,
    /// Registry sweeper, started with the server.
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl CoreState {
    /// Production wiring: Ollama reasoning client, JSON patient files,
    /// SQLite report store.
    pub fn from_config(config: AppConfig) -> Result<Self, CoreError> {
        let client: Arc<dyn ReasoningClient> = Arc::new(OllamaReasoningClient::new(
            &config.ollama_url,
            &config.model_name,
            config.step_timeout,
        )?);
        let store = SqliteResultStore::open(&config.database_path)?;
        tracing::info!(
            database = %config.database_path.display(),
            patients = %config.patients_dir.display(),
            model = %config.model_name,
            "Analysis engine configured"
        );

        let components = Components {
            handlers: standard_handlers(client),
            subjects: Arc::new(JsonFileSubjectSource::new(config.patients_dir.clone())),
            store: Arc::new(store),
            notifier: Arc::new(LogNotifier),
        };
        Self::with_components(config, components)
    }

    /// Wire the engine around the given collaborators.
    pub fn with_components(config: AppConfig, components: Components) -> Result<Self, CoreError> {
        let parts = EngineParts {
            registry: Arc::new(RunRegistry::new(config.retention)),
            broadcaster: Arc::new(ProgressBroadcaster::new()),
            store: components.store,
            subjects: components.subjects,
            notifier: components.notifier,
        };
        let settings = EngineSettings {
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: config.backoff_base,
                max_delay: config.backoff_max,
                jitter: BACKOFF_JITTER,
            },
            step_timeout: config.step_timeout,
            run_timeout: config.run_timeout,
        };
        let orchestrator = Orchestrator::new(
            DependencyGraph::standard()?,
            components.handlers,
            settings,
            parts.clone(),
        )?;

        Ok(Self {
            config,
            service: AnalysisService::new(orchestrator, parts),
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn analysis(&self) -> &AnalysisService {
        &self.service
    }

    /// Start the registry sweeper once; later calls are no-ops.
    pub fn start_sweeper(&self) -> Result<(), CoreError> {
        let mut guard = self.sweeper.lock().map_err(|_| CoreError::LockPoisoned)?;
        if guard.is_none() {
            *guard = Some(self.service.spawn_sweeper(self.config.sweep_interval));
        }
        Ok(())
    }

    /// Stop the sweeper if it is running.
    pub fn stop_sweeper(&self) -> Result<(), CoreError> {
        let mut guard = self.sweeper.lock().map_err(|_| CoreError::LockPoisoned)?;
        if let Some(handle) = guard.take() {
            handle.shutdown();
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Internal lock error")]
    LockPoisoned,
    #[error("Invalid step graph: {0}")]
    Graph(#[from] GraphError),
    #[error("Analysis engine error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("Reasoning client error: {0}")]
    Reasoning(#[from] ReasoningError),
}

/// In-memory state for patient `p1` with scripted step handlers.
#[cfg(test)]
pub(crate) fn test_state(
    overrides: Vec<Arc<crate::pipeline::analysis::testing::ScriptedHandler>>,
) -> CoreState {
    use crate::pipeline::analysis::subjects::sample_subject;
    use crate::pipeline::analysis::testing::handlers_with;
    use crate::pipeline::analysis::{InMemorySubjectSource, RecordingNotifier};

    let components = Components {
        handlers: handlers_with(overrides),
        subjects: Arc::new(InMemorySubjectSource::new().with(sample_subject("p1"))),
        store: Arc::new(SqliteResultStore::in_memory().unwrap()),
        notifier: Arc::new(RecordingNotifier::new()),
    };
    let config = AppConfig {
        max_attempts: 1,
        backoff_base: std::time::Duration::from_millis(1),
        backoff_max: std::time::Duration::from_millis(1),
        ..AppConfig::default()
    };
    CoreState::with_components(config, components).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::InMemorySubjectSource;

    #[test]
    fn missing_handler_is_startup_error() {
        let components = Components {
            handlers: Vec::new(),
            subjects: Arc::new(InMemorySubjectSource::new()),
            store: Arc::new(SqliteResultStore::in_memory().unwrap()),
            notifier: Arc::new(LogNotifier),
        };
        let err = CoreState::with_components(AppConfig::default(), components)
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Graph(GraphError::MissingHandler(_))));
    }

    #[test]
    fn file_backed_state_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("db").join("analysis.db"),
            patients_dir: dir.path().join("patients"),
            ..AppConfig::default()
        };
        let state = CoreState::from_config(config).unwrap();
        assert!(state.config().database_path.exists());
    }

    #[tokio::test]
    async fn sweeper_starts_once_and_stops() {
        let state = test_state(vec![]);
        state.start_sweeper().unwrap();
        state.start_sweeper().unwrap();
        assert!(state.sweeper.lock().unwrap().is_some());
        state.stop_sweeper().unwrap();
        assert!(state.sweeper.lock().unwrap().is_none());
    }
}
