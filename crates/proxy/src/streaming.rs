//! The streaming pipeline: block assembly, the policy-hook dispatcher with
//! its timeout monitor, and the client-side SSE formatters.

pub(crate) mod assembler;
pub(crate) mod blocks;
pub(crate) mod dispatcher;
pub(crate) mod sse;
pub(crate) mod timeout;

use futures::stream::BoxStream;

use crate::error::ProxyResult;
use crate::messages::openai::ChatChunk;

/// The upstream side of the pipeline: an ordered stream of normalized chunks.
pub type ChunkStream = BoxStream<'static, ProxyResult<ChatChunk>>;
