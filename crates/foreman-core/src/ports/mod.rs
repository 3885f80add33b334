//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。各 trait は外部システム（DB, proof
//! storage, planner など）へのインターフェースで、実装の詳細を隠蔽します。
//!
//! - TaskStore が task の正本（source of truth）
//! - RunStore が run の正本
//! - ProofSink は append-only の証跡
//! - Planner / Backlog / ProjectDirectory は外部コラボレーター

pub mod clock;
pub mod id_generator;
pub mod pipeline;
pub mod proof_sink;
pub mod run_store;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::pipeline::{Backlog, Planner, ProjectDirectory};
pub use self::proof_sink::{ProofSink, ProofSinkError};
pub use self::run_store::{RunStore, RunStoreError, RunStoreResult};
pub use self::task_store::{StoreError, StoreResult, TaskStore};
