//! Typed - 型付き payload API
//!
//! payload の形を型で表し、TaskType との対応を静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Payload` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `TaskHandler` trait - object-safe, registry が保持

pub mod handler;
pub mod payload;

pub use self::handler::{Handler, TypedHandler};
pub use self::payload::Payload;
