//! Converting operation results into documents.

use crate::endpoint::OperationResult;
use crate::error::ClientError;
use draftline_engine::Document;

/// Reads the recalculated document out of the root operation's result.
///
/// The only contract is that entity ids survive exactly.
pub trait DocumentCodec: Send + Sync + 'static {
    fn decode(&self, result: &OperationResult) -> Result<Document, ClientError>;

    fn encode(&self, document: &Document) -> Result<OperationResult, ClientError>;
}

/// Codec for servers that echo the engine's own document representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeCodec;

impl DocumentCodec for SerdeCodec {
    fn decode(&self, result: &OperationResult) -> Result<Document, ClientError> {
        let data = result
            .data
            .clone()
            .ok_or_else(|| ClientError::Decode("root result carries no data".into()))?;
        serde_json::from_value(data).map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn encode(&self, document: &Document) -> Result<OperationResult, ClientError> {
        let data = serde_json::to_value(document).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(OperationResult { data: Some(data) })
    }
}
