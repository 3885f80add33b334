//! Impls - 実装（開発用・テスト用）
//!
//! ports の in-memory 実装。永続化が必要な環境では同じ trait を DB で実装し、
//! `AppBuilder` に差し込む。
//!
//! - **InMemoryRunStore**: Run の正本
//! - **InMemoryProofSink**: 証跡
//! - **InMemoryBacklog**: planner / backlog / project directory
//!
//! task の in-memory 実装は `queue::InMemoryTaskStore`。

pub mod backlog;
pub mod proof_sink;
pub mod run_store;

pub use self::backlog::InMemoryBacklog;
pub use self::proof_sink::InMemoryProofSink;
pub use self::run_store::InMemoryRunStore;
