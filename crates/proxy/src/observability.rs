//! Per-transaction observability: the tracing/event context and the
//! transaction recorder.

pub(crate) mod context;
pub(crate) mod recorder;
