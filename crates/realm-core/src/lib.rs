//! # realm-core
//!
//! Scheduling, dispatch and routing for Realm servers.
//!
//! - **Executor** - named lanes that recurring tasks declare affinity to
//! - **Task / Tick** - recurring work and pulse-driven countdowns
//! - **Dispatch** - per-connection inbound queues drained into opcode handlers
//! - **Hub** - world sessions, round-robin link transports and player presence
//! - **Pool** - bounded checkout of session handles for background sweeps
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Codec     │────▶│  Dispatcher │────▶│  Handlers   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Executor   │     │  Link Hub   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod dispatch;
pub mod executor;
pub mod hub;
pub mod pool;
pub mod registry;
pub mod session;
pub mod sweep;
pub mod task;
pub mod tick;

pub use dispatch::{
    idle_entities, Dispatcher, DrainStats, DrainTask, EntitySource, FrameHandler, HandlerRegistry,
    Inbound, InboundQueue,
};
pub use executor::{Affinity, Executor, ExecutorConfig, ExecutorError, LaneStats, DEFAULT_PULSE};
pub use hub::{HubConfig, HubError, HubStats, LinkHub};
pub use pool::{Pool, PoolError, Pooled};
pub use registry::{Registry, RegistryError};
pub use session::{LinkTransport, Membership, Reconciliation, TransportId, WorldServerSession};
pub use sweep::{Persist, PersistSweepStats, PersistenceSweep, RosterClient, RosterSweepStats, RosterSyncSweep};
pub use task::{task_fn, BoxError, Flow, RecurringTask, Task, TaskHandle, TaskState};
pub use tick::{Tick, TickError, TickHandle, TickPolicy, TickRegistry};
