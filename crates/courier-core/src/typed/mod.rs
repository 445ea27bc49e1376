//! Typed - 型付き Task API
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, bytes のまま扱う

pub mod codec;
pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::EnvelopeCodec;
pub use self::context::TaskContext;
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler, handler_fn};
pub use self::registry::HandlerRegistry;
pub use self::task::Task;
