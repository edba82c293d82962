//! # SmartArm Hub
//!
//! 状态同步与扇出核心：感知线程、控制器桥接、WebSocket 推送。
//!
//! ```text
//! 感知线程 ──┐
//!            ├─▶ StatusStore / DetectionBuffer ──notify──▶ EventRelay ──▶ Broadcaster ──▶ WebSocket 客户端
//! MQTT 线程 ─┘
//! ```

pub mod broadcaster;
pub mod config;
pub mod hub;
pub mod logging;
pub mod server;

pub use broadcaster::{Broadcaster, HubMessage};
pub use config::HubConfig;
pub use hub::Hub;
