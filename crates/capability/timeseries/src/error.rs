//! 时序存储错误类型
//!
//! 存储写入与过滤不会失败；只有聚合区间字符串非法时才返回错误。

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeseriesError {
    /// 区间格式必须为 `<整数><s|m|h|d>`
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
}
