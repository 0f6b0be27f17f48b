//! The one place the wall clock is read as milliseconds, so connection
//! liveness bookkeeping (`lastActive`, §3/§4.7) doesn't scatter
//! `chrono::Utc::now()` calls across every module that touches it.

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
