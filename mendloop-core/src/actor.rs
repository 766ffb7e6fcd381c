//! Actor registry and the operation contract
//!
//! An actor is a named remediation subsystem. It builds [`Operation`]s from
//! [`OperationParams`]; the engine runs each operation inside a
//! [`Step`](crate::step::Step). Adding an actor means registering another
//! implementation with the [`ActorService`].
//!
//! The guard and the enrichment custom query are ordinary actors too, under
//! the reserved names [`GUARD_ACTOR`] and [`AAI_ACTOR`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{MendloopError, MendloopResult};
use crate::outcome::OperationOutcome;
use crate::types::TargetType;

pub const GUARD_ACTOR: &str = "GUARD";
pub const GUARD_OPERATION: &str = "Decision";
pub const AAI_ACTOR: &str = "AAI";
pub const CUSTOM_QUERY_OPERATION: &str = "CustomQuery";
pub const LOCK_ACTOR: &str = "LOCK";
pub const LOCK_OPERATION: &str = "Lock";
/// Actor tag carried by synthetic control-loop timeout outcomes
pub const CL_TIMEOUT_ACTOR: &str = "-CL-TIMEOUT-";

/// Everything an actor needs to build one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationParams {
    pub actor: String,
    pub operation: String,
    pub request_id: Uuid,
    pub closed_loop_control_name: String,
    pub target_entity: String,
    pub target_type: Option<TargetType>,
    pub payload: BTreeMap<String, String>,
    /// Enrichment data from the triggering event
    pub enrichment: BTreeMap<String, String>,
    pub retries: u32,
    pub timeout: Duration,
}

impl OperationParams {
    /// Start outcome for this operation.
    pub fn make_outcome(&self) -> OperationOutcome {
        OperationOutcome::new(&self.actor, &self.operation, &self.target_entity)
    }

    /// Same context, different actor and operation.
    pub fn for_actor(&self, actor: &str, operation: &str) -> Self {
        Self {
            actor: actor.to_string(),
            operation: operation.to_string(),
            payload: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Parameters for the guard decision gating this operation.
    pub fn guard_params(&self) -> Self {
        let mut params = self.for_actor(GUARD_ACTOR, GUARD_OPERATION);
        params.payload.insert("actor".into(), self.actor.clone());
        params.payload.insert("operation".into(), self.operation.clone());
        params.payload.insert("target".into(), self.target_entity.clone());
        params.payload.insert("requestId".into(), self.request_id.to_string());
        params
            .payload
            .insert("clname".into(), self.closed_loop_control_name.clone());
        params
    }
}

/// One remote operation, built for a single attempt.
#[async_trait]
pub trait Operation: Send + Sync {
    fn actor_name(&self) -> &str;

    fn name(&self) -> &str;

    fn target_entity(&self) -> &str;

    /// Performs the operation. An `Err` is reported as FAILURE_EXCEPTION.
    ///
    /// Must be cancellation safe: the engine drops the future on timeout
    /// or lock loss.
    async fn start(&self) -> MendloopResult<OperationOutcome>;
}

/// A remediation subsystem able to build operations.
pub trait Actor: Send + Sync {
    fn name(&self) -> &str;

    fn operation_names(&self) -> Vec<String>;

    fn build_operation(&self, params: OperationParams) -> MendloopResult<Arc<dyn Operation>>;
}

/// Registry mapping actor names to implementations.
#[derive(Default, Clone)]
pub struct ActorService {
    actors: HashMap<String, Arc<dyn Actor>>,
}

impl ActorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Actor + 'static>(&mut self, actor: A) -> MendloopResult<()> {
        self.register_arc(Arc::new(actor))
    }

    pub fn register_arc(&mut self, actor: Arc<dyn Actor>) -> MendloopResult<()> {
        let name = actor.name().to_string();
        if self.actors.contains_key(&name) {
            return Err(MendloopError::Internal {
                message: format!("Actor '{}' is already registered", name),
            });
        }
        self.actors.insert(name, actor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> MendloopResult<Arc<dyn Actor>> {
        self.actors
            .get(name)
            .cloned()
            .ok_or_else(|| MendloopError::ActorNotFound {
                actor: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actors.contains_key(name)
    }

    /// Builds an operation through the actor named in `params`.
    pub fn build_operation(&self, params: OperationParams) -> MendloopResult<Arc<dyn Operation>> {
        self.get(&params.actor)?.build_operation(params)
    }

    pub fn actor_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.actors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorService")
            .field("actors", &self.actor_names())
            .finish()
    }
}
