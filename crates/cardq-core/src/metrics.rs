use crate::request::Direction;
use core::time::Duration;
use metrics::{counter, gauge, histogram};

pub fn observe_issue(direction: Direction, bytes: usize, dur: Duration) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    match direction {
        Direction::Read => {
            counter!("cardq_read_count").increment(1);
            counter!("cardq_read_bytes").increment(bytes as u64);
            histogram!("cardq_read_latency_ns").record(ns as f64);
        }
        Direction::Write => {
            counter!("cardq_write_count").increment(1);
            counter!("cardq_write_bytes").increment(bytes as u64);
            histogram!("cardq_write_latency_ns").record(ns as f64);
        }
    }
}

pub fn record_request_error() {
    counter!("cardq_request_errors").increment(1);
}

pub fn record_status_failure() {
    counter!("cardq_status_failures").increment(1);
}

pub fn record_rejected() {
    counter!("cardq_rejected_requests").increment(1);
}

pub fn record_drained(count: usize) {
    counter!("cardq_drained_requests").increment(count as u64);
}

pub fn record_suspended(suspended: bool) {
    gauge!("cardq_suspended").set(if suspended { 1.0 } else { 0.0 });
}
