use async_trait::async_trait;

use super::{CompletionRequest, ExplainError, ReasoningService};

/// Offline reasoning service: answers with a deterministic summary built from
/// the prompt's first line. Used when no external service is wanted and as a
/// network-free stand-in in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalService;

#[async_trait]
impl ReasoningService for LocalService {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ExplainError> {
        let headline = request
            .prompt
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default();

        let summary = match headline.split_once("Unusual activity detected:") {
            Some((_, event)) => format!(
                "Offline analysis: flow outside the baseline traffic profile ({}). \
                 Review the source for scanning, bulk transfer or degraded links.",
                event.trim()
            ),
            None => {
                let context_rows = request.prompt.lines().filter(|l| l.contains(" | ")).count();
                format!(
                    "Offline mode: no reasoning service is configured. {context_rows} recent anomalies are available for review."
                )
            }
        };
        Ok(summary)
    }
}
