use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{Level, event};

use crate::core::Result;
use crate::engine::{StorageEngine, StorageSession, primary_key_of};
use crate::entity::{DirectiveAction, DirectiveMap, EntityId, EntityRef, EntitySet};

/// Drives one collected entity set through lookups, directive resolution, and
/// a single batched flush on a shared session.
pub struct PersistOrchestrator {
    engine: Arc<dyn StorageEngine>,
    session: Arc<dyn StorageSession>,
}

impl PersistOrchestrator {
    pub fn new(engine: Arc<dyn StorageEngine>, session: Arc<dyn StorageSession>) -> Self {
        Self { engine, session }
    }

    /// Persists or removes every entity in the set, then flushes once.
    ///
    /// Upsert lookups run first and concurrently, since the merge target for
    /// an upsert is the found record; the per-entity apply step then also
    /// runs concurrently against the shared session. Nothing reaches the
    /// store until the final flush.
    pub async fn run(&self, entities: &EntitySet, directives: &DirectiveMap) -> Result<()> {
        let mut upserts = Vec::new();
        for entity in entities.iter() {
            if directives.get(entity)?.action() == DirectiveAction::Upsert {
                upserts.push(entity.clone());
            }
        }
        event!(
            Level::DEBUG,
            entities = entities.len(),
            upserts = upserts.len(),
            "running persist orchestration"
        );

        let lookups = try_join_all(upserts.iter().map(|entity| async move {
            let key = primary_key_of(self.engine.as_ref(), entity)?;
            let found = self.session.find_one(entity.kind(), &key).await?;
            Ok::<_, crate::core::PersistError>((EntityId::of(entity), found))
        }))
        .await?;
        let found_by_id: HashMap<EntityId, Option<EntityRef>> = lookups.into_iter().collect();

        try_join_all(
            entities
                .iter()
                .map(|entity| self.apply(entity, directives, &found_by_id)),
        )
        .await?;

        self.session.flush().await
    }

    async fn apply(
        &self,
        entity: &EntityRef,
        directives: &DirectiveMap,
        found_by_id: &HashMap<EntityId, Option<EntityRef>>,
    ) -> Result<()> {
        match directives.get(entity)?.action() {
            DirectiveAction::Remove => self.session.remove(entity),
            DirectiveAction::UpdateByReference => {
                let key = primary_key_of(self.engine.as_ref(), entity)?;
                let reference = self.session.get_reference(entity.kind(), &key)?;
                reference.merge_fields(&entity.fields()?)?;
                self.session.persist(&reference)
            }
            DirectiveAction::Upsert => {
                match found_by_id.get(&EntityId::of(entity)).cloned().flatten() {
                    Some(found) => {
                        found.merge_fields(&entity.fields()?)?;
                        self.session.persist(&found)
                    }
                    None => self.session.persist(entity),
                }
            }
            DirectiveAction::PersistAsIs => self.session.persist(entity),
        }
    }
}
