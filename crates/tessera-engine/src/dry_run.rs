use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tessera_core::error::CapabilityError;
use tessera_core::stream::OutputSink;
use tessera_graph::NodeContent;

use crate::traits::{ExecutionCapability, InvocationRequest};

/// Local capability that performs no remote work.
///
/// Text-producing nodes render their `{{accessor}}` templates from the
/// context and stream the result word by word; other kinds echo their
/// configuration so a blueprint can be exercised end to end offline.
#[derive(Debug, Clone, Default)]
pub struct DryRunCapability {
    word_delay: Option<Duration>,
}

impl DryRunCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between streamed words, to make streaming observable.
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = Some(delay);
        self
    }

    async fn stream_words(
        &self,
        text: &str,
        output: &OutputSink,
        cancel: &CancellationToken,
    ) -> Result<(), CapabilityError> {
        for (i, word) in text.split_inclusive(char::is_whitespace).enumerate() {
            if cancel.is_cancelled() {
                return Err(CapabilityError::remote("cancelled"));
            }
            if i > 0 {
                if let Some(delay) = self.word_delay {
                    tokio::time::sleep(delay).await;
                }
            }
            output.emit(word);
        }
        Ok(())
    }
}

impl ExecutionCapability for DryRunCapability {
    fn invoke(
        &self,
        request: InvocationRequest,
        output: OutputSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Value, CapabilityError>> {
        Box::pin(async move {
            let ctx = &request.context;
            let result = match &request.node.content {
                NodeContent::TextGeneration { prompt, .. } => {
                    let text = ctx.render(prompt);
                    self.stream_words(&text, &output, &cancel).await?;
                    Value::String(text)
                }
                NodeContent::Text { text } => {
                    let text = ctx.render(text);
                    self.stream_words(&text, &output, &cancel).await?;
                    Value::String(text)
                }
                NodeContent::Query { query, max_results, .. } => json!({
                    "query": ctx.render(query),
                    "max_results": max_results,
                    "results": ctx.retrieval().unwrap_or_default(),
                }),
                NodeContent::Action {
                    provider,
                    action,
                    parameters,
                } => json!({
                    "provider": provider,
                    "action": action,
                    "parameters": parameters,
                    "context": ctx.to_value(),
                }),
                NodeContent::File { category, files } => json!({
                    "category": category,
                    "files": files,
                }),
                NodeContent::Trigger { provider, event } => json!({
                    "provider": provider,
                    "event": event,
                }),
            };
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::stream::OutputBuffer;
    use tessera_core::types::{GenerationId, InputContext};
    use tessera_graph::NodeTemplate;

    fn request(content: NodeContent, context: InputContext) -> InvocationRequest {
        InvocationRequest {
            generation_id: GenerationId::new(),
            node: NodeTemplate::new("N", content).instantiate(),
            context,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_renders_prompt_and_streams_words() {
        let mut ctx = InputContext::new();
        ctx.bind("doc", json!("the report"));
        let buffer = OutputBuffer::new();
        let req = request(
            NodeContent::TextGeneration {
                model: "local".into(),
                prompt: "Summarize {{doc}} now".into(),
            },
            ctx,
        );

        let out = DryRunCapability::new()
            .invoke(req, OutputSink::new(buffer.clone()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!("Summarize the report now"));
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.latest_text(), "Summarize the report now");
    }

    #[tokio::test]
    async fn test_action_echoes_configuration() {
        let req = request(
            NodeContent::Action {
                provider: "github".into(),
                action: "create_issue".into(),
                parameters: json!({ "repo": "a/b" }),
            },
            InputContext::new(),
        );
        let out = DryRunCapability::new()
            .invoke(req, OutputSink::discard(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["action"], "create_issue");
        assert_eq!(out["parameters"]["repo"], "a/b");
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let req = request(
            NodeContent::Text {
                text: "a b c".into(),
            },
            InputContext::new(),
        );
        let err = DryRunCapability::new()
            .invoke(req, OutputSink::discard(), cancel)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
