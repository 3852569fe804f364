use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{Instrument, Level, event, info_span};

use crate::collect::{EntityClassifier, collect_scope};
use crate::core::{PersistError, Result};
use crate::engine::{StorageEngine, StorageSession};
use crate::entity::{DirectiveMap, EntityRef};
use crate::orchestrate::PersistOrchestrator;
use crate::state::{SlotCategory, StateValue, UnitScope};

/// Hook invoked once, after the unit's flush has committed.
pub type PostPersistHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Everything one unit of work carries: the forked session, the registered
/// type set, the state scope, the directive record, and the optional
/// post-persist hook.
///
/// The context is threaded explicitly through the collector and the
/// orchestrator; the ambient task-local accessors below are a convenience
/// layer at the boundary only.
pub struct UnitContext {
    engine: Arc<dyn StorageEngine>,
    session: Arc<dyn StorageSession>,
    classifier: EntityClassifier,
    scope: UnitScope,
    directives: DirectiveMap,
    hook: Mutex<Option<PostPersistHook>>,
}

impl UnitContext {
    fn open(engine: Arc<dyn StorageEngine>) -> Arc<Self> {
        let session = engine.fork_session();
        let classifier = EntityClassifier::from_types(engine.configured_types().iter());
        Arc::new(Self {
            engine,
            session,
            classifier,
            scope: UnitScope::new(),
            directives: DirectiveMap::new(),
            hook: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &Arc<dyn StorageSession> {
        &self.session
    }

    pub fn classifier(&self) -> &EntityClassifier {
        &self.classifier
    }

    pub fn scope(&self) -> &UnitScope {
        &self.scope
    }

    pub fn directives(&self) -> &DirectiveMap {
        &self.directives
    }

    /// Registers the post-persist hook for this unit; the last registration
    /// wins.
    pub fn set_post_persist_hook(&self, hook: PostPersistHook) -> Result<()> {
        *self.hook.lock()? = Some(hook);
        Ok(())
    }

    fn take_post_persist_hook(&self) -> Result<Option<PostPersistHook>> {
        Ok(self.hook.lock()?.take())
    }
}

tokio::task_local! {
    static CURRENT_UNIT: Arc<UnitContext>;
}

/// Runs `caller` inside a fresh unit of work.
///
/// On success, every persistable entity reachable from the unit's state
/// slots is reconciled against the forked session and flushed as one batch,
/// then the registered post-persist hook (if any) runs. On caller failure
/// nothing is collected, persisted, or flushed, and the error propagates
/// untouched. A hook failure propagates after the flush has already
/// committed. The caller's value is returned unchanged either way.
pub async fn run_unit_of_work<F, Fut, T>(engine: Arc<dyn StorageEngine>, caller: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let ctx = UnitContext::open(engine);
    let span = info_span!("unit_of_work");
    CURRENT_UNIT
        .scope(ctx.clone(), async move {
            let output = caller().await?;

            let entities = collect_scope(ctx.classifier(), ctx.directives(), ctx.scope())?;
            let orchestrator =
                PersistOrchestrator::new(ctx.engine.clone(), ctx.session.clone());
            orchestrator.run(&entities, ctx.directives()).await?;

            if let Some(hook) = ctx.take_post_persist_hook()? {
                event!(Level::DEBUG, "running post-persist hook");
                hook().await?;
            }
            Ok(output)
        })
        .instrument(span)
        .await
}

/// Returns the active unit's context, or `NoActiveUnit` outside one.
pub fn current_unit() -> Result<Arc<UnitContext>> {
    CURRENT_UNIT
        .try_with(Arc::clone)
        .map_err(|_| PersistError::NoActiveUnit)
}

/// Returns the active unit's storage session.
///
/// # Panics
///
/// Panics when called outside a unit of work; that is a programmer error,
/// not a recoverable condition. Use [`try_current_session`] where absence is
/// expected.
pub fn current_session() -> Arc<dyn StorageSession> {
    match current_unit() {
        Ok(ctx) => ctx.session.clone(),
        Err(_) => panic!("current_session() called outside an active unit of work"),
    }
}

pub fn try_current_session() -> Option<Arc<dyn StorageSession>> {
    current_unit().ok().map(|ctx| ctx.session.clone())
}

/// Classifies a value against the active unit's registered type set.
///
/// # Panics
///
/// Panics when called outside a unit of work.
pub fn is_persistable(value: &StateValue) -> bool {
    match current_unit() {
        Ok(ctx) => ctx.classifier.is_entity(value),
        Err(_) => panic!("is_persistable() called outside an active unit of work"),
    }
}

/// Registers the unit's post-persist hook; at most one per unit, last
/// registration wins. The hook runs after the flush has committed, so it
/// observes post-persist state such as engine-assigned keys.
pub fn register_post_persist_hook<F, Fut>(hook: F) -> Result<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    current_unit()?.set_post_persist_hook(Box::new(move || hook().boxed()))
}

/// Stores a value in a plain state slot of the active unit.
pub fn set_state(key: impl Into<String>, value: impl Into<StateValue>) -> Result<()> {
    current_unit()?.scope.set(key, SlotCategory::Plain, value)
}

/// Stores a value in a write-once state slot of the active unit.
pub fn set_once_state(key: impl Into<String>, value: impl Into<StateValue>) -> Result<()> {
    current_unit()?.scope.set(key, SlotCategory::Once, value)
}

/// Stores a derived value in the active unit's scope.
pub fn set_derived_state(key: impl Into<String>, value: impl Into<StateValue>) -> Result<()> {
    current_unit()?.scope.set(key, SlotCategory::Derived, value)
}

/// Reads a state slot of the active unit.
pub fn state(key: &str) -> Result<Option<StateValue>> {
    current_unit()?.scope.get(key)
}

pub fn has_state(key: &str) -> Result<bool> {
    current_unit()?.scope.has(key)
}

pub fn mark_skip_persist(entity: &EntityRef) -> Result<()> {
    current_unit()?.directives.mark_skip_persist(entity)
}

pub fn mark_force_update(entity: &EntityRef) -> Result<()> {
    current_unit()?.directives.mark_force_update(entity)
}

pub fn mark_for_upsert(entity: &EntityRef) -> Result<()> {
    current_unit()?.directives.mark_for_upsert(entity)
}

pub fn mark_for_delete(entity: &EntityRef) -> Result<()> {
    current_unit()?.directives.mark_for_delete(entity)
}

/// Copies every field present on `source` onto `target`.
///
/// Construction helper for building one entity from another; absent fields
/// on the source are not cleared on the target.
pub fn assign_fields(target: &EntityRef, source: &EntityRef) -> Result<()> {
    target.merge_fields(&source.fields()?)
}
