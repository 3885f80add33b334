//! Handler trait - 型付き payload を受け取る Handler
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Type erasure パターン (TypedHandler<T, H> → dyn TaskHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::payload::Payload;
use crate::app::runtime::TaskHandler;
use crate::domain::{HandlerError, Outcome, TaskEnvelope};

/// Handler は decode 済みの payload を処理して Outcome を返す
///
/// `Handler<BuildPayload>` は `BuildPayload` しか受け取れないので、payload と
/// handler の対応はコンパイル時に保証される。
#[async_trait]
pub trait Handler<T: Payload>: Send + Sync {
    async fn handle(&self, payload: T, envelope: &TaskEnvelope) -> Result<Outcome, HandlerError>;
}

/// Adapts a [`Handler<T>`] to the object-safe [`TaskHandler`] the registry
/// stores. A payload that does not decode as `T` is a permanent error.
pub struct TypedHandler<T: Payload, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Payload, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Payload, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    async fn handle(&self, envelope: &TaskEnvelope) -> Result<Outcome, HandlerError> {
        let payload: T = serde_json::from_value(envelope.payload().clone()).map_err(|e| {
            HandlerError::permanent(format!("invalid {} payload: {e}", T::TYPE))
        })?;
        self.handler.handle(payload, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProjectId, TaskId, TaskType};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use ulid::Ulid;

    #[derive(Debug, Serialize, Deserialize)]
    struct ScreenshotPayload {
        url: String,
    }

    impl Payload for ScreenshotPayload {
        const TYPE: TaskType = TaskType::Screenshot;
    }

    struct EchoUrl;

    #[async_trait]
    impl Handler<ScreenshotPayload> for EchoUrl {
        async fn handle(
            &self,
            payload: ScreenshotPayload,
            _envelope: &TaskEnvelope,
        ) -> Result<Outcome, HandlerError> {
            Ok(Outcome::success().with_output(json!({ "url": payload.url })))
        }
    }

    fn envelope(payload: serde_json::Value) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            ProjectId::new("p"),
            TaskType::Screenshot,
            payload,
            1,
        )
    }

    #[tokio::test]
    async fn decodes_payload_before_calling_handler() {
        let typed = TypedHandler::<ScreenshotPayload, _>::new(EchoUrl);

        let outcome = typed
            .handle(&envelope(json!({ "url": "https://preview.example" })))
            .await
            .unwrap();
        assert_eq!(
            outcome.output,
            Some(json!({ "url": "https://preview.example" }))
        );
    }

    #[tokio::test]
    async fn undecodable_payload_is_permanent() {
        let typed = TypedHandler::<ScreenshotPayload, _>::new(EchoUrl);

        let err = typed.handle(&envelope(json!({ "uri": 3 }))).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(err.message().starts_with("invalid screenshot payload"));
    }
}
