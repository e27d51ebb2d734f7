//! Core engine for the triple-shot workflow: three worker agents attempt the
//! same task in parallel worktrees, an adversarial reviewer optionally gates
//! each attempt, and a judge agent evaluates the surviving results.
//!
//! The crate is organized leaves-first:
//!
//! - [`retry`] -- per-task attempt bookkeeping and retry eligibility.
//! - [`artifact`] -- sentinel JSON artifacts written by workers, reviewers,
//!   and the judge, with tolerant decoding of LLM-produced fields.
//! - [`session`] -- the authoritative data model of one triple-shot run.
//! - [`events`] -- the synchronous in-process event bus.
//! - [`team`] -- teams, hubs, and the per-team task queue.
//! - [`bridge`] -- the claim loop connecting a team's queue to real worker
//!   instances.
//! - [`host`] -- the host application's instance registry and UI groups.
//! - [`orchestrator`] -- the seam for spawning agent instances, plus a local
//!   subprocess implementation.
//! - [`worktree`] -- git worktree management for attempt isolation.
//! - [`coordinator`] -- the engine proper, composing all of the above.

pub mod artifact;
pub mod bridge;
pub mod coordinator;
pub mod events;
pub mod host;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod team;
pub mod worktree;
