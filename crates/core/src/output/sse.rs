//! Server-sent-event framing of an output stream.

use futures::{Stream, StreamExt};

use crate::engine::{EngineError, OutputStream};
use crate::output::GenerationOutput;

/// Sentinel frame sent after the terminal output.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// `data: <json>\n\n` for one output.
pub fn frame(output: &GenerationOutput) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(output)?))
}

/// Frame every output of `outputs`; [`DONE_FRAME`] follows the terminal one.
///
/// An error from the engine ends the frame stream without the sentinel.
pub fn sse_stream(mut outputs: OutputStream) -> impl Stream<Item = Result<String, EngineError>> {
    async_stream::stream! {
        while let Some(item) = outputs.next().await {
            let output = match item {
                Ok(output) => output,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match frame(&output) {
                Ok(f) => yield Ok(f),
                Err(e) => {
                    yield Err(EngineError::execution("serialize output frame", e));
                    return;
                }
            }
            if output.finished {
                yield Ok(DONE_FRAME.to_string());
                return;
            }
        }
    }
}
