//! Provider and session lifecycle
//!
//! A [`Provider`] is built for exactly one [`OperationMode`] and is the only
//! place engine sessions come from. Each [`Session`] serves a single create,
//! query or delete operation. Sessions are shared through `Rc`, so they cannot
//! cross threads; run one provider per thread when orchestrating in parallel.

use crate::engine::{EngineSession, SessionFactory, ShadowCopyEngine};
use crate::error::{Error, Result};
use crate::snapshot_set::{BackupOptions, Resolution, SnapshotSet};
use crate::types::{OperationMode, SetId, SnapshotContext};
use crate::volume::{LocalPaths, PathProbe, VolumeDirectory};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// OS collaborators used to resolve volumes and check expose targets
#[derive(Clone)]
pub struct Host {
    pub volumes: Rc<dyn VolumeDirectory>,
    pub paths: Rc<dyn PathProbe>,
}

impl Host {
    pub fn new(volumes: impl VolumeDirectory + 'static, paths: impl PathProbe + 'static) -> Self {
        Self {
            volumes: Rc::new(volumes),
            paths: Rc::new(paths),
        }
    }

    /// The live volumes and filesystem of this machine
    #[cfg(windows)]
    pub fn local() -> Self {
        Self::new(crate::volume::FixedVolumes, LocalPaths)
    }

    /// The live volumes and filesystem of this machine
    #[cfg(not(windows))]
    pub fn local() -> Self {
        Self::new(crate::volume::StaticVolumes::new(), LocalPaths)
    }
}

/// The operation a session has been spent on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUse {
    Create,
    Query,
    Delete,
    Enumerate,
}

impl fmt::Display for SessionUse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionUse::Create => write!(f, "create"),
            SessionUse::Query => write!(f, "query"),
            SessionUse::Delete => write!(f, "delete"),
            SessionUse::Enumerate => write!(f, "enumerate"),
        }
    }
}

/// One engine session, good for a single operation
pub struct Session {
    engine: Box<dyn EngineSession>,
    initialized_for: Cell<Option<OperationMode>>,
    spent_on: Cell<Option<SessionUse>>,
}

impl Session {
    fn new(engine: Box<dyn EngineSession>) -> Self {
        Self {
            engine,
            initialized_for: Cell::new(None),
            spent_on: Cell::new(None),
        }
    }

    /// The mode this session was initialized for, if any
    pub fn initialized_for(&self) -> Option<OperationMode> {
        self.initialized_for.get()
    }

    /// The operation this session has already served, if any
    pub fn spent_on(&self) -> Option<SessionUse> {
        self.spent_on.get()
    }

    pub(crate) fn engine(&self) -> &dyn EngineSession {
        self.engine.as_ref()
    }

    /// Reserve the session for `operation`; fails if it already served one
    pub(crate) fn claim(&self, operation: SessionUse) -> Result<()> {
        if self.initialized_for.get().is_none() {
            return Err(Error::InvalidStateTransition {
                from: "uninitialized".to_string(),
                to: operation.to_string(),
            });
        }
        if let Some(previous) = self.spent_on.get() {
            return Err(Error::SessionReused(previous.to_string()));
        }
        self.spent_on.set(Some(operation));
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("initialized_for", &self.initialized_for.get())
            .field("spent_on", &self.spent_on.get())
            .finish()
    }
}

/// Owns the engine's default provider for one kind of operation
pub struct Provider {
    factory: Box<dyn SessionFactory>,
    mode: OperationMode,
    context: SnapshotContext,
    host: Host,
}

impl Provider {
    /// Obtain the engine's default provider
    ///
    /// Fails with [`Error::EngineUnavailable`] when the engine has none, and
    /// with [`Error::InvalidArgument`] before touching the engine when
    /// `context` is not a session context.
    pub fn new(
        engine: &dyn ShadowCopyEngine,
        mode: OperationMode,
        context: SnapshotContext,
        host: Host,
    ) -> Result<Self> {
        if !context.is_context() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a snapshot context; use one of {}",
                context,
                SnapshotContext::NAMED
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let factory = engine.default_provider().map_err(Error::from_factory)?;
        debug!(%mode, %context, "obtained default shadow copy provider");
        Ok(Self {
            factory,
            mode,
            context,
            host,
        })
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn context(&self) -> SnapshotContext {
        self.context
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Acquire a new, uninitialized engine session
    pub fn create_session(&self) -> Result<Session> {
        let engine = self.factory.create_session().map_err(Error::from_factory)?;
        Ok(Session::new(engine))
    }

    /// Initialize `session` for this provider's mode
    ///
    /// Re-initializing for the same mode is a no-op; a session already
    /// initialized for another mode is refused with
    /// [`Error::InvalidStateTransition`].
    pub fn initialize(&self, session: &Session) -> Result<()> {
        if let Some(current) = session.initialized_for() {
            if current == self.mode {
                return Ok(());
            }
            return Err(Error::InvalidStateTransition {
                from: current.to_string(),
                to: self.mode.to_string(),
            });
        }

        let engine = session.engine();
        match self.mode {
            OperationMode::Backup => {
                engine.initialize_for_backup()?;
                engine.set_context(self.context)?;
                engine.gather_writer_metadata()?;
            }
            // Deletion runs on a backup-initialized session, without writers
            OperationMode::Query | OperationMode::Delete => {
                engine.initialize_for_backup()?;
                engine.set_context(self.context)?;
            }
            OperationMode::Restore => {
                engine.initialize_for_restore()?;
            }
        }

        session.initialized_for.set(Some(self.mode));
        debug!(mode = %self.mode, "session initialized");
        Ok(())
    }

    /// Acquire and initialize a session in one step
    pub fn open_session(&self) -> Result<Session> {
        let session = self.create_session()?;
        self.initialize(&session)?;
        Ok(session)
    }

    /// List every snapshot set visible under this provider's context
    ///
    /// Sets come back in the order their first snapshot is reported.
    pub fn query_sets(&self, resolution: Resolution) -> Result<Vec<SnapshotSet>> {
        if self.mode != OperationMode::Query {
            return Err(Error::InvalidOperation {
                mode: self.mode,
                operation: "query sets".to_string(),
            });
        }

        let session = self.open_session()?;
        session.claim(SessionUse::Enumerate)?;
        let records = session.engine().query_snapshots()?;
        drop(session);

        let mut set_ids: Vec<SetId> = Vec::new();
        for record in &records {
            if !set_ids.contains(&record.set_id) {
                set_ids.push(record.set_id);
            }
        }
        debug!(
            snapshots = records.len(),
            sets = set_ids.len(),
            "enumerated snapshot sets"
        );

        let mut sets = Vec::with_capacity(set_ids.len());
        for set_id in set_ids {
            let mut set = SnapshotSet::new(self, BackupOptions::default())?;
            // A set can disappear between the enumeration and its own query
            if set.query(set_id, resolution)? {
                sets.push(set);
            }
        }
        Ok(sets)
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("mode", &self.mode)
            .field("context", &self.context)
            .finish()
    }
}
