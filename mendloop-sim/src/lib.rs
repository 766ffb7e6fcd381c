//! Simulated actors for running control loops without real backends
//!
//! The binary registers these with the engine's [`ActorService`]; core
//! integration tests use them the same way.

pub mod actors;
pub mod scenario;

pub use actors::{SimulatedAai, SimulatedActor, SimulatedGuard};
pub use scenario::{ActorScript, AaiScript, Decision, GuardScript, Scenario, SimResult, SimStep};

use mendloop_core::actor::{ActorService, AAI_ACTOR, GUARD_ACTOR};
use mendloop_core::error::MendloopResult;
use tracing::info;

/// Registers every scripted actor, plus the guard and enrichment query
/// unless the scenario scripts actors under those names itself.
pub fn register_all(actors: &mut ActorService, scenario: &Scenario) -> MendloopResult<()> {
    scenario.validate()?;
    for script in &scenario.actors {
        actors.register(SimulatedActor::new(script))?;
    }
    if !actors.contains(GUARD_ACTOR) {
        actors.register(SimulatedGuard::new(&scenario.guard))?;
    }
    if !actors.contains(AAI_ACTOR) {
        actors.register(SimulatedAai::new(&scenario.aai))?;
    }
    info!(actors = ?actors.actor_names(), "Registered simulated actors");
    Ok(())
}
