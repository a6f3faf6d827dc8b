//! The pull pipeline: parse, resolve, snapshot, report
//!
//! A [Puller] owns the cache, the source table, and the snapshot backend's
//! lifecycle. The mount server starts with the first active pull and stops
//! after the last one finishes, whether it succeeded or not. A shutdown
//! request stops it right away, tearing down every mount.

use crate::{
    cache::{CacheManager, ChainId, DiskUsage, GcReport},
    config::Config,
    errors::{PullError, SnapshotError},
    image::ImageName,
    session::Session,
    snapshot::{new_backend, Snapshotter},
    source::{Identifier, ImageIdentifier, ImageSource, SourceManager},
};
use std::{fmt, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};

/// Where a pull is in its pipeline
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PullState {
    Idle,
    ReferenceParsed,
    Resolving,
    Resolved,
    Snapshotting,
    Done,
    Interrupted,
    Failed,
}

impl PullState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PullState::Done | PullState::Interrupted | PullState::Failed
        )
    }

    /// Can a pull move from this state to `next`?
    pub fn can_advance_to(self, next: PullState) -> bool {
        use PullState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Interrupted) | (_, Failed) => true,
            (Idle, ReferenceParsed)
            | (ReferenceParsed, Resolving)
            | (Resolving, Resolved)
            | (Resolved, Snapshotting)
            | (Snapshotting, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PullState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks one pull's state, logging each transition
struct Progress<'a> {
    reference: &'a str,
    state: PullState,
}

impl<'a> Progress<'a> {
    fn new(reference: &'a str) -> Self {
        Progress {
            reference,
            state: PullState::Idle,
        }
    }

    fn advance(&mut self, next: PullState) {
        if self.state.can_advance_to(next) {
            log::debug!("pull {}: {} -> {}", self.reference, self.state, next);
            self.state = next;
        } else {
            log::warn!(
                "pull {}: ignoring transition {} -> {}",
                self.reference,
                self.state,
                next
            );
        }
    }

    fn fail(&mut self, err: &PullError) {
        match err {
            PullError::Interrupted => self.advance(PullState::Interrupted),
            _ => self.advance(PullState::Failed),
        }
    }
}

/// What a successful pull produced
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PullOutcome {
    /// The normalized reference that was pulled
    pub reference: ImageName,
    /// Top chain id of the snapshot
    pub snapshot_id: ChainId,
    /// Sum of the uncompressed layer sizes, in bytes
    pub size: u64,
}

pub struct Puller {
    config: Config,
    cache: Arc<CacheManager>,
    sources: SourceManager,
    active_pulls: Mutex<usize>,
}

impl Puller {
    /// Set up a puller with the backend named in the config
    pub fn new(config: Config) -> Result<Self, PullError> {
        let backend = new_backend(config.backend, &config);
        Puller::with_backend(config, backend)
    }

    /// Set up a puller around an existing snapshot backend
    pub fn with_backend(config: Config, backend: Arc<dyn Snapshotter>) -> Result<Self, PullError> {
        log::info!("using state directory {:?}", config.state_dir);
        let cache = Arc::new(CacheManager::new(&config.state_dir, backend));
        let mut sources = SourceManager::new();
        sources.register(Arc::new(
            ImageSource::new(&config, cache.clone()).map_err(PullError::Storage)?,
        ));
        Ok(Puller {
            config,
            cache,
            sources,
            active_pulls: Mutex::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    /// Parse and normalize a reference without any I/O
    pub fn parse_reference(&self, input: &str) -> Result<Identifier, PullError> {
        let invalid = |source| PullError::InvalidReference {
            input: input.to_owned(),
            source,
        };
        let name = ImageName::parse(input).map_err(invalid)?;
        let identifier =
            ImageIdentifier::new(&name, &self.config.default_registry).map_err(invalid)?;
        Ok(Identifier::Image(identifier))
    }

    /// Pull an image and report its snapshot id and size
    pub async fn pull(&self, session: &Session, reference: &str) -> Result<PullOutcome, PullError> {
        let mut progress = Progress::new(reference);
        let identifier = match self.parse_reference(reference) {
            Ok(identifier) => identifier,
            Err(err) => {
                progress.fail(&err);
                return Err(err);
            }
        };
        progress.advance(PullState::ReferenceParsed);
        if session.is_shutdown() {
            progress.advance(PullState::Interrupted);
            return Err(PullError::Interrupted);
        }

        if let Err(err) = self.acquire_backend().await {
            progress.fail(&err);
            return Err(err);
        }
        let watcher = self.watch_for_shutdown(session);
        let result = self.run(&mut progress, session, &identifier).await;
        if session.is_shutdown() {
            if let Err(err) = watcher.await {
                log::warn!("shutdown cleanup task failed, {}", err);
            }
        } else {
            watcher.abort();
        }
        let released = self.release_backend().await;

        let result = match (result, released) {
            (Err(err), Err(stop_err)) => {
                log::warn!("also failed to stop the mount server, {}", stop_err);
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(stop_err)) => Err(stop_err),
            (Ok(outcome), Ok(())) => Ok(outcome),
        };
        match &result {
            Ok(outcome) => {
                progress.advance(PullState::Done);
                log::info!(
                    "pulled {} as {}, {} bytes",
                    outcome.reference,
                    outcome.snapshot_id,
                    outcome.size
                );
            }
            Err(err) => progress.fail(err),
        }
        result
    }

    async fn run(
        &self,
        progress: &mut Progress<'_>,
        session: &Session,
        identifier: &Identifier,
    ) -> Result<PullOutcome, PullError> {
        progress.advance(PullState::Resolving);
        let instance = self.sources.resolve(session, identifier).await?;
        progress.advance(PullState::Resolved);

        progress.advance(PullState::Snapshotting);
        let snapshot = instance.snapshot(session).await?;
        let Identifier::Image(image) = instance.identifier();
        let outcome = PullOutcome {
            reference: image.reference().clone(),
            snapshot_id: snapshot.id().clone(),
            size: snapshot.size(),
        };
        let chain = snapshot.id().clone();
        snapshot
            .release()
            .await
            .map_err(|err| PullError::snapshotting(&chain, err))?;
        Ok(outcome)
    }

    /// Start the mount server unless it's already up
    async fn acquire_backend(&self) -> Result<(), PullError> {
        let mut active = self.active_pulls.lock().await;
        let backend = self.cache.backend();
        if !backend.is_running() {
            match backend.start().await {
                Ok(()) | Err(SnapshotError::AlreadyRunning) => (),
                Err(err) => return Err(PullError::BackendLifecycle(err)),
            }
        }
        *active += 1;
        Ok(())
    }

    /// Stop the mount server once no pulls are using it
    async fn release_backend(&self) -> Result<(), PullError> {
        let mut active = self.active_pulls.lock().await;
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.cache
                .backend()
                .stop()
                .await
                .map_err(PullError::BackendLifecycle)?;
        }
        Ok(())
    }

    fn watch_for_shutdown(&self, session: &Session) -> JoinHandle<()> {
        let session = session.clone();
        let backend = self.cache.backend().clone();
        tokio::spawn(async move {
            session.shutdown_requested().await;
            log::info!("shutdown requested, stopping the mount server");
            match backend.stop().await {
                Ok(true) => (),
                Ok(false) => log::debug!("mount server was already stopped"),
                Err(err) => log::warn!("failed to stop the mount server, {}", err),
            }
        })
    }

    pub async fn gc(&self) -> Result<GcReport, PullError> {
        self.cache.gc().await.map_err(PullError::Storage)
    }

    pub fn disk_usage(&self) -> Result<DiskUsage, PullError> {
        self.cache.disk_usage().map_err(PullError::Storage)
    }
}
