// src/db/monitoring.rs

use std::time::Instant;

use log::debug;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

/// Глобальные метрики ядра.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "db_query_duration_seconds",
        "Duration of DB operations in seconds",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to create DB_QUERY_DURATION")
});

/// Сколько раз вставка сообщения схлопнулась по сигнатуре.
pub static MESSAGES_DEDUPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "messages_deduped_total",
        "Messages dropped by the signature uniqueness constraint"
    )
    .expect("Failed to create MESSAGES_DEDUPED")
});

pub static CALL_HISTORY_WRITES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "call_history_writes_total",
        "Call history records written (insert or window-merge)"
    )
    .expect("Failed to create CALL_HISTORY_WRITES")
});

/// Проходы синхронизации по классам сущностей.
pub static SYNC_PASSES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "sync_passes_total",
        "Sync passes per entity class",
        &["entity", "result"]
    )
    .expect("Failed to create SYNC_PASSES")
});

/// Realtime-события, отброшенные классификатором (мусор, группы, неизвестные).
pub static REALTIME_EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "realtime_events_dropped_total",
        "Realtime events dropped before dispatch",
        &["reason"]
    )
    .expect("Failed to create REALTIME_EVENTS_DROPPED")
});

/// Обёртка для выполнения операции с базой и сбора метрик.
pub async fn measure_db_operation<F, T, E>(operation: &str, f: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = f.await;
    let secs = start.elapsed().as_secs_f64();

    DB_QUERY_DURATION.with_label_values(&[operation]).observe(secs);
    debug!("DB operation {} took {:.4} seconds", operation, secs);
    result
}

/// Экспорт метрик в текстовом формате Prometheus.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_measure_passes_result_through() {
        let ok: Result<i32, ()> = measure_db_operation("test_op", async { Ok(42) }).await;
        assert_eq!(ok, Ok(42));
        let err: Result<(), &str> = measure_db_operation("test_op", async { Err("x") }).await;
        assert_eq!(err, Err("x"));
    }

    #[test]
    fn test_gather_contains_registered_metrics() {
        MESSAGES_DEDUPED.inc();
        let text = gather_metrics();
        assert!(text.contains("messages_deduped_total"));
    }
}
