//! Event Materializer
//!
//! The state-materialization core of an event-sourced system: turns an
//! append-only stream of domain events into versioned entity state and
//! queryable read models.
//!
//! # Features
//!
//! - **Per-aggregate ordering**: appends, reductions and projections for one
//!   entity are serialized; different entities run in parallel
//! - **Snapshots**: replay cost is bounded without changing any result
//! - **Lazy schema migration**: stored payloads are upgraded on read, history
//!   is never rewritten
//! - **Join projections**: one source change can update many read models,
//!   merged field by field with compare-and-set
//! - **Filter language**: one JSON filter, compiled per backend
//!
//! # Modules
//!
//! - `event_store`: append-only log of events and snapshots
//! - `reducer`: folds events into entity state
//! - `migration`: schema migration registry and resolver
//! - `projector`: read-model projections and stores
//! - `filter`: filter parsing and compilers
//! - `data_migration`: ordered, resumable background jobs
//! - `materializer`: the facade wiring it all together
//! - `notify`: change feed
//!
//! # Example
//!
//! ```no_run
//! use event_materializer::{
//!     Materializer, MaterializerConfig, NewEvent, Projection, ProjectionRegistry, ReducerRegistry,
//! };
//! use serde_json::json;
//!
//! fn main() -> event_materializer::Result<()> {
//!     let mut reducers = ReducerRegistry::new();
//!     reducers.register("Post", "PostCreated", |event, _| Ok(event.payload.clone()))?;
//!
//!     let mut projections = ProjectionRegistry::new();
//!     projections.register_by_id("post_titles", "Post", "PostView", |post, _, _| {
//!         Projection::update(json!({"title": post.state["title"]}))
//!     })?;
//!
//!     let materializer = Materializer::builder(MaterializerConfig::from_env()?)
//!         .with_file_stores()?
//!         .reducers(reducers)
//!         .projections(projections)
//!         .build()?;
//!
//!     materializer.append_events(
//!         "Post",
//!         "p-1",
//!         vec![NewEvent::new("PostCreated", json!({"title": "Hello"}))],
//!         Some(0),
//!     )?;
//!     let view = materializer.get_read_model("PostView", "p-1")?;
//!     println!("{:?}", view.get("title"));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data_migration;
pub mod error;
pub mod event_store;
pub mod filter;
pub mod materializer;
pub mod migration;
pub mod notify;
pub mod projector;
pub mod reducer;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::MaterializerConfig;
pub use data_migration::{DataMigration, DataMigrationRunner, FnMigration, MigrationContext, MigrationReport};
pub use error::{Error, HandlerError, Result};
pub use event_store::{EventLog, FileEventLog, InMemoryEventLog};
pub use filter::{ExpressionCompiler, FilterExpression, MatcherCompiler, Operation, PredicateCompiler};
pub use materializer::{Materializer, MaterializerBuilder};
pub use migration::{Migratable, MigrationRegistry, VersionedPayload};
pub use notify::{ChangeFeed, ChangeMessage, ChangeNotification};
pub use projector::{
    EventHandlerRegistry, FileReadModelStore, InMemoryReadModelStore, JoinKey, Projection,
    ProjectionRegistry, ReadModelChange, ReadModelProjector, ReadModelStore, SearchRequest,
};
pub use reducer::{EntityReducer, ReducerRegistry};
pub use types::{
    EntityKey, EntityState, Event, NewEvent, Page, ReadModelRecord, Snapshot, SortBy,
    SortDirection,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
