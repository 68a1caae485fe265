//! Reconciliation engine and ingestion loop for the Geode session reconciler.
//!
//! This crate turns a stream of normalized observations into durable
//! session records. It depends only on abstract collaborators (a session
//! store, a watermark store, and a telemetry source); concrete adapters live
//! in `geode-db` and `geode-ingest`.
//!
//! # Architecture
//!
//! ```text
//! ObservationSource --(GovernedSource)--> IngestCursor --> normalize
//!                                              |               |
//!                                       WatermarkStore    Reconciler --> SessionStore
//!                                              |
//!                                         StatusBoard
//! ```
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `geode-config.yaml` into
//!   strongly-typed structs.
//! - [`policy`] -- [`StreamPolicy`] values for the generic, lease, and info
//!   stream families.
//! - [`reconcile`] -- The `lookup -> decide -> act` orchestrator.
//! - [`cursor`] -- Watermark-driven paging and checkpointing per stream.
//! - [`source`] -- [`ObservationSource`] trait and the [`GovernedSource`]
//!   rate governor.
//! - [`store`] -- [`SessionStore`] trait and lookup/patch types.
//! - [`watermark`] -- [`WatermarkStore`] trait.
//! - [`locks`] -- Per-identity async locks shared across streams.
//! - [`memory`] -- In-memory store and watermark implementations.
//! - [`status`] -- Per-stream status board served by the observer.
//!
//! [`StreamPolicy`]: policy::StreamPolicy
//! [`ObservationSource`]: source::ObservationSource
//! [`GovernedSource`]: source::GovernedSource
//! [`SessionStore`]: store::SessionStore
//! [`WatermarkStore`]: watermark::WatermarkStore

pub mod config;
pub mod cursor;
pub mod locks;
pub mod memory;
pub mod policy;
pub mod reconcile;
pub mod source;
pub mod status;
pub mod store;
pub mod watermark;
