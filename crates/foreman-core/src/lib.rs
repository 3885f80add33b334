//! foreman-core
//!
//! Lease-based task queue, worker pool and per-project run pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task type, run, outcome, proof, work item, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, TaskStore, RunStore, ProofSink, pipeline）
//! - **queue**: TaskQueue と task record, retry policy, in-memory store
//! - **app**: アプリケーションロジック（builder, runtime, worker pool, run machine, scheduler, status）
//! - **typed**: 型付き payload API（Payload trait, Handler trait）
//! - **impls**: 開発用の in-memory 実装
//! - **config / observability / error**: 設定, ログ, crate エラー

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;

pub use app::{App, AppBuilder, EnqueueRequest, RunningApp};
pub use config::ForemanConfig;
pub use error::ForemanError;
