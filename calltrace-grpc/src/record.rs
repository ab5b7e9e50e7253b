//! Configuration-gated capture of payloads and protocol metadata into span
//! labels.
//!
//! Every payload- or metadata-bearing label goes through this module, gated
//! on [`Config::enhanced_reporting`]. With the flag off (the default), none
//! of these functions serialize anything, so the instrumentation adds no
//! payload-proportional overhead and leaks no message content.

use crate::call_span::CallSpan;
use crate::transport::{Metadata, Payload, Status};
use crate::Config;
use serde_json::Value;

pub(crate) fn request(span: &CallSpan, config: &Config, payload: &Payload) {
    if config.enhanced_reporting {
        span.add_label("argument", payload.to_string());
    }
}

pub(crate) fn result(span: &CallSpan, config: &Config, payload: &Payload) {
    if config.enhanced_reporting {
        span.add_label("result", payload.to_string());
    }
}

pub(crate) fn error(span: &CallSpan, config: &Config, status: &Status) {
    if config.enhanced_reporting {
        span.add_label("error", status.to_string());
    }
}

pub(crate) fn status(span: &CallSpan, config: &Config, status: &Status) {
    if config.enhanced_reporting {
        span.add_label("status", status.code.to_string());
    }
}

pub(crate) fn metadata(span: &CallSpan, config: &Config, metadata: &Metadata) {
    if config.enhanced_reporting {
        span.add_label("metadata", metadata_json(metadata));
    }
}

pub(crate) fn trailer(span: &CallSpan, config: &Config, metadata: &Metadata) {
    if config.enhanced_reporting {
        span.add_label("trailer", metadata_json(metadata));
    }
}

pub(crate) fn response_metadata(span: &CallSpan, config: &Config, metadata: &Metadata) {
    if config.enhanced_reporting {
        span.add_label("response_metadata", metadata_json(metadata));
    }
}

fn metadata_json(metadata: &Metadata) -> String {
    let map: serde_json::Map<String, Value> = metadata
        .as_map()
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(map).to_string()
}
