/// System prompt and user message handed to a generation engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedPrompt {
    pub system_prompt: String,
    pub user_message: String,
}

const SYSTEM_PROMPT: &str = "You answer questions about the user's documents. \
Use only the numbered context passages provided in the message. \
If the passages do not contain the answer, say that you do not know.";

impl GroundedPrompt {
    /// Number the retrieved passages and put the question after them
    pub fn build<S: AsRef<str>>(question: &str, passages: &[S]) -> Self {
        let context = if passages.is_empty() {
            "No relevant context was found in the documents.".to_string()
        } else {
            passages
                .iter()
                .enumerate()
                .map(|(i, passage)| format!("[{}] {}", i + 1, passage.as_ref()))
                .collect::<Vec<String>>()
                .join("\n\n")
        };

        GroundedPrompt {
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_message: format!("Context:\n{}\n\nQuestion: {}", context, question.trim()),
        }
    }
}
