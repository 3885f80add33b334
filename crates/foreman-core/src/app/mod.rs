//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: 構築とワイヤリング、外部インターフェース
//! - **Runtime**: TaskType ごとの handler registry と dispatch
//! - **WorkerPool**: reserve → handle → heartbeat → complete/fail
//! - **RunStateMachine**: project の Run をパイプラインに沿って進める
//! - **Scheduler**: active project ごとに run を tick
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **status**: ループ監視と health

pub mod builder;
pub mod reaper_loop;
pub mod run_machine;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError, EnqueueRequest, RunningApp};
pub use self::reaper_loop::ReaperLoop;
pub use self::run_machine::{RunError, RunSettings, RunStateMachine, TickOutcome};
pub use self::runtime::{HandlerRegistry, RegistryError, Runtime, TaskHandler};
pub use self::scheduler::Scheduler;
pub use self::status::{
    HealthCause, HealthProbe, HealthReport, HealthSettings, HealthStatus, LoopMonitor,
};
pub use self::worker_loop::{WorkerPool, WorkerSettings};
