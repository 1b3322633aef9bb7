pub mod pool;
pub mod session;

pub use pool::{
    Diagnostics, Lease, PoolError, PoolOptions, SessionOverride, SessionPool, render_messages,
};
pub use session::{
    AgentSession, HandshakeFailure, KillOutcome, PromptError, SessionEvents, SpawnFailure,
    SpawnOptions, SpawnOrHandshakeError, StopReason,
};
