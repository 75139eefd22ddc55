use base64::Engine as _;
use rmcp::model::{AnnotateAble, CallToolResult, Content, Meta, RawContent, RawImageContent};
use serde_json::json;

use crate::artifacts::ImageArtifact;
use crate::execution_result::ExecutionResult;

pub(crate) const FINISHED_EXECUTION: &str = "Finished execution.";
const PNG_MIME_TYPE: &str = "image/png";

/// The formatted text first, then one image per figure in the order they were referenced.
pub(crate) async fn execution_result_to_contents(
    result: &ExecutionResult,
    blank_code: bool,
) -> Vec<Content> {
    let mut contents = vec![Content::text(result_text(result, blank_code))];
    for artifact in result.images() {
        match tokio::fs::read(&artifact.local_path).await {
            Ok(bytes) => contents.push(content_image_with_meta(artifact, &bytes)),
            Err(err) => tracing::warn!(
                path = %artifact.local_path.display(),
                "figure file unreadable; sending text reference only: {err}"
            ),
        }
    }
    contents
}

pub(crate) fn result_text(result: &ExecutionResult, blank_code: bool) -> String {
    let text = result.render();
    if text.trim().is_empty() && !blank_code {
        FINISHED_EXECUTION.to_string()
    } else {
        text
    }
}

pub(crate) fn finalize_contents(mut contents: Vec<Content>) -> CallToolResult {
    if contents.is_empty() {
        contents.push(Content::text(String::new()));
    }
    // Execution errors are part of the text, not MCP tool errors.
    CallToolResult::success(contents)
}

fn content_image_with_meta(artifact: &ImageArtifact, bytes: &[u8]) -> Content {
    let mut meta = Meta::new();
    meta.0.insert(
        "codeInterpreter".to_string(),
        json!({
            "figure": format!("fig-{:03}", artifact.sequence_index),
            "reference": artifact.reference,
        }),
    );
    RawContent::Image(RawImageContent {
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
        mime_type: PNG_MIME_TYPE.to_string(),
        meta: Some(meta),
    })
    .no_annotation()
}
