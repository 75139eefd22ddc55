use crate::artifacts::ImageArtifact;
use crate::kernel_protocol::StreamName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
    Error,
    ExecuteResult,
    DisplayData,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
            OutputKind::Error => "error",
            OutputKind::ExecuteResult => "execute_result",
            OutputKind::DisplayData => "display_data",
        }
    }
}

impl From<StreamName> for OutputKind {
    fn from(name: StreamName) -> Self {
        match name {
            StreamName::Stdout => OutputKind::Stdout,
            StreamName::Stderr => OutputKind::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBlock {
    pub kind: OutputKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultItem {
    Block(OutputBlock),
    Image(ImageArtifact),
}

/// Everything one execution produced, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub items: Vec<ResultItem>,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_text(&mut self, kind: OutputKind, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.items.push(ResultItem::Block(OutputBlock { kind, text }));
    }

    pub fn push_image(&mut self, artifact: ImageArtifact) {
        self.items.push(ResultItem::Image(artifact));
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageArtifact> {
        self.items.iter().filter_map(|item| match item {
            ResultItem::Image(artifact) => Some(artifact),
            ResultItem::Block(_) => None,
        })
    }

    /// The text contract handed back to the agent loop.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            match item {
                ResultItem::Block(block) => {
                    out.push_str(&format!(
                        "\n\n{}:\n\n```\n{}\n```",
                        block.kind.as_str(),
                        block.text
                    ));
                }
                ResultItem::Image(artifact) => {
                    out.push_str("\n\n");
                    out.push_str(&artifact.render());
                }
            }
        }
        out.trim_start_matches('\n').to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn artifact(index: usize, path: &str) -> ImageArtifact {
        ImageArtifact {
            sequence_index: index,
            local_path: PathBuf::from(path),
            reference: path.to_string(),
        }
    }

    #[test]
    fn empty_result_renders_empty_string() {
        assert_eq!(ExecutionResult::default().render(), "");
    }

    #[test]
    fn renders_blocks_and_images_in_emission_order() {
        let mut result = ExecutionResult::default();
        result.push_text(OutputKind::Stdout, "hello\n");
        result.push_image(artifact(1, "/ws/a.png"));
        result.push_text(OutputKind::ExecuteResult, "42");
        result.push_image(artifact(2, "/ws/b.png"));

        assert_eq!(
            result.render(),
            "stdout:\n\n```\nhello\n\n```\n\n![fig-001](/ws/a.png)\n\nexecute_result:\n\n```\n42\n```\n\n![fig-002](/ws/b.png)"
        );
    }

    #[test]
    fn image_only_result_has_no_leading_newlines() {
        let mut result = ExecutionResult::default();
        result.push_image(artifact(1, "/ws/a.png"));
        assert_eq!(result.render(), "![fig-001](/ws/a.png)");
    }

    #[test]
    fn empty_text_is_not_recorded() {
        let mut result = ExecutionResult::default();
        result.push_text(OutputKind::Stderr, "");
        assert!(result.is_empty());
    }
}
