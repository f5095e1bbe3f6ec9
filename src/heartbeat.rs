//! Builtin heartbeat service.
//!
//! Clients keep idle shared connections alive by periodically invoking this
//! service; the server answers with a timestamp echo. The exporter installs
//! it by default so every server can answer heartbeats out of the box.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::exporter::Exporter;
use crate::message::Request;

/// Service name of the builtin heartbeat.
pub const HEARTBEAT_SERVICE: &str = "heartbeat";

/// Method name of the builtin heartbeat.
pub const HEARTBEAT_METHOD: &str = "ping";

/// Build the request a client sends as a heartbeat.
#[must_use]
pub fn heartbeat_request() -> Request { Request::new(HEARTBEAT_SERVICE, HEARTBEAT_METHOD) }

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub(crate) fn install(exporter: &mut Exporter) {
    exporter
        .service(HEARTBEAT_SERVICE)
        .inline(HEARTBEAT_METHOD, |call| async move {
            Ok(json!({
                "timestamp_ms": unix_millis(),
                "args": call.args,
                "kwargs": call.kwargs,
            }))
        });
}
