//! 按时间分桶聚合与到达间隔统计

use crate::models::LatencyStats;
use crate::query::Aggregation;
use domain::Point;
use std::collections::BTreeMap;

/// 分桶聚合。
///
/// 桶起点为 `floor(ts / width) * width`，输出按桶起点升序；
/// 桶内没有数值成员时整桶省略。输出点沿用桶内首个成员的标签。
pub(crate) fn aggregate_points(
    points: &[Point],
    aggregation: Aggregation,
    bucket_ms: i64,
    field: &str,
) -> Vec<Point> {
    let mut buckets: BTreeMap<i64, Vec<&Point>> = BTreeMap::new();
    for point in points {
        let bucket_start = bucket_start(point.timestamp_ms, bucket_ms);
        buckets.entry(bucket_start).or_default().push(point);
    }

    let mut items = Vec::with_capacity(buckets.len());
    for (bucket_start, members) in buckets {
        let values: Vec<f64> = members.iter().filter_map(|p| p.number(field)).collect();
        if values.is_empty() {
            continue;
        }
        let reduced = match aggregation {
            Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Count => values.len() as f64,
        };
        let mut point = Point::new(bucket_start).field(field, reduced);
        point.tags = members[0].tags.clone();
        items.push(point);
    }
    items
}

/// 桶起点；`i64::MIN` 附近向下取整溢出时取可表示的最小桶起点。
fn bucket_start(timestamp_ms: i64, bucket_ms: i64) -> i64 {
    timestamp_ms
        .div_euclid(bucket_ms)
        .checked_mul(bucket_ms)
        .unwrap_or((i64::MIN / bucket_ms) * bucket_ms)
}

/// 相邻点（按存储顺序）的到达间隔统计。
///
/// 乱序时间戳产生的负间隔按 0 计。百分位采用 nearest-rank。
pub(crate) fn latency_stats(points: &[&Point]) -> LatencyStats {
    if points.len() < 2 {
        return LatencyStats::default();
    }
    let mut intervals: Vec<f64> = points
        .windows(2)
        .map(|pair| pair[1].timestamp_ms.saturating_sub(pair[0].timestamp_ms).max(0) as f64)
        .collect();
    intervals.sort_by(|a, b| a.total_cmp(b));

    let count = intervals.len();
    let sum: f64 = intervals.iter().sum();
    LatencyStats {
        average_ms: sum / count as f64,
        min_ms: intervals[0],
        max_ms: intervals[count - 1],
        p50_ms: nearest_rank(&intervals, 50.0),
        p95_ms: nearest_rank(&intervals, 95.0),
        p99_ms: nearest_rank(&intervals, 99.0),
        sample_count: count,
    }
}

fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rank_picks_ceiling_index() {
        let sorted: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(nearest_rank(&sorted, 50.0), 5.0);
        assert_eq!(nearest_rank(&sorted, 95.0), 10.0);
        assert_eq!(nearest_rank(&sorted, 99.0), 10.0);
        assert_eq!(nearest_rank(&[42.0], 50.0), 42.0);
    }

    #[test]
    fn bucket_start_floors_negative_timestamps() {
        let points = vec![Point::new(-1).field("value", 1.0)];
        let out = aggregate_points(&points, Aggregation::Sum, 1000, "value");
        assert_eq!(out[0].timestamp_ms, -1000);
    }

    #[test]
    fn bucket_start_near_min_timestamp_saturates() {
        let points = vec![
            Point::new(i64::MIN).field("value", 1.0),
            Point::new(i64::MIN + 1).field("value", 2.0),
        ];
        let out = aggregate_points(&points, Aggregation::Sum, 1000, "value");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp_ms, (i64::MIN / 1000) * 1000);
        assert_eq!(out[0].number("value"), Some(3.0));
    }

    #[test]
    fn extreme_gaps_saturate() {
        let a = Point::new(i64::MIN);
        let b = Point::new(i64::MAX);
        let c = Point::new(i64::MIN);
        let stats = latency_stats(&[&a, &b, &c]);
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.max_ms, i64::MAX as f64);
        assert_eq!(stats.min_ms, 0.0);
    }

    #[test]
    fn out_of_order_intervals_clamp_to_zero() {
        let a = Point::new(1000);
        let b = Point::new(500);
        let c = Point::new(1500);
        let stats = latency_stats(&[&a, &b, &c]);
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.min_ms, 0.0);
        assert_eq!(stats.max_ms, 1000.0);
    }
}
