//! 领域模型：时序点与标签/字段取值。

pub mod data;

pub use data::{FieldValue, Point, TagValue, now_epoch_ms};
