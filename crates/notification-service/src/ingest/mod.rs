//! 事件摄取
//!
//! 消费四个上游事件 topic（安全、交易、风控、用户生命周期），
//! 把总线消息严格解码为结构化事件，经静态映射表转成通知请求后
//! 交给路由器。at-least-once 语义：位移只在单条消息处理完成后存储，
//! 无法处理且无法落死信的消息会停住分区而不是被丢弃。

mod consumer;
mod decoder;
mod mapping;

pub use consumer::EventIngestor;
pub use decoder::BusEvent;
pub use mapping::{TopicRole, map_event};
