//! Payload trait - 型付き payload と TaskType の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskType;

/// Payload は task の JSON payload を型に結び付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct BuildPayload {
///     target: String,
/// }
///
/// impl Payload for BuildPayload {
///     const TYPE: TaskType = TaskType::Build;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 側で payload を組み立てるため
/// - `DeserializeOwned`: worker 側で JSON から復元するため
/// - `Send + Sync + 'static`: handler を別 task で実行するため
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: TaskType;

    /// Encode for `NewTask::payload`.
    fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
