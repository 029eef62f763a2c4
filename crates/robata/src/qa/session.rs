use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::conversation::{ContextPrompt, Conversation};
use crate::engine::{GenerationParams, InferenceEngine, TextStream};
use crate::error::EngineError;

const DEFAULT_TOP_K: usize = 3;

/// A retrieved passage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new<S: Into<String>>(page_content: S) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: Map::new(),
        }
    }
}

/// Semantic search over a document corpus.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Returns up to `top_k` documents most similar to `query`, best first.
    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Document>, EngineError>;
}

/// # QaSession
///
/// One user's question-answering conversation.
///
/// Contexts retrieved for a question are rendered into the conversation's system
/// prompt, and the whole transcript is sent to the engine as one prompt.
///
/// Generation parameters start from [`QaSession::default_params`] and can be
/// changed through [`QaSession::params_mut`], or replaced for a single call with
/// the `*_with` variants.
pub struct QaSession<E, R> {
    engine: E,
    retriever: R,
    conversation: Conversation,
    prompt: ContextPrompt,
    params: GenerationParams,
    results: Vec<Document>,
}

impl<E, R> QaSession<E, R>
where
    E: InferenceEngine,
    R: Retriever,
{
    pub fn new(engine: E, retriever: R, conversation: Conversation) -> Self {
        let params = Self::default_params(&conversation);
        Self {
            engine,
            retriever,
            conversation,
            prompt: ContextPrompt::default(),
            params,
            results: vec![],
        }
    }

    pub fn with_prompt(mut self, prompt: ContextPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Sampling defaults for chat, stopping at the conversation's stop sequences.
    pub fn default_params(conversation: &Conversation) -> GenerationParams {
        GenerationParams::default()
            .with_max_new_tokens(512)
            .with_echo_prompt(false)
            .with_stop(conversation.stop.clone())
            .with_param("temperature", 0.7)
            .with_param("top_p", 0.9)
            .with_param("repetition_penalty", 1.0)
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut GenerationParams {
        &mut self.params
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Documents behind the current context.
    pub fn results(&self) -> &[Document] {
        &self.results
    }

    /// Adds a user turn followed by an open assistant turn.
    pub fn append_question<S: Into<String>>(&mut self, question: S) {
        let (user, assistant) = self.conversation.roles.clone();
        self.conversation.append_message(user, Some(question.into()));
        self.conversation.append_message(assistant, None);
    }

    /// Retrieves contexts for `question` and makes them the system prompt.
    pub async fn update_context(
        &mut self,
        question: &str,
        top_k: Option<usize>,
    ) -> Result<(), EngineError> {
        let top_k = top_k.unwrap_or(DEFAULT_TOP_K);
        self.results = self.retriever.similarity_search(question, top_k).await?;
        debug!(top_k, retrieved = self.results.len(), "updated context");

        let contexts: Vec<&str> = self
            .results
            .iter()
            .map(|doc| doc.page_content.as_str())
            .collect();
        self.conversation.system = self.prompt.render(&contexts, &self.conversation.roles);
        Ok(())
    }

    pub fn set_context<S: AsRef<str>>(&mut self, contexts: &[S]) {
        self.conversation.system = self.prompt.render(contexts, &self.conversation.roles);
    }

    /// Streams the answer to the open assistant turn.
    pub async fn conversation_stream(&self) -> Result<TextStream, EngineError> {
        self.conversation_stream_with(&self.params).await
    }

    pub async fn conversation_stream_with(
        &self,
        params: &GenerationParams,
    ) -> Result<TextStream, EngineError> {
        let prompt = self.conversation.get_prompt();
        self.engine.generate_stream(&prompt, params).await
    }

    /// Generates the answer to the open assistant turn and records it.
    pub async fn complete(&mut self) -> Result<String, EngineError> {
        let params = self.params.clone();
        self.complete_with(&params).await
    }

    pub async fn complete_with(
        &mut self,
        params: &GenerationParams,
    ) -> Result<String, EngineError> {
        let prompt = self.conversation.get_prompt();
        let answer = self.engine.generate(&prompt, params).await?;
        self.record_answer(&answer);
        Ok(answer.trim().to_string())
    }

    /// Fills the open assistant turn, if there is one.
    pub fn record_answer(&mut self, answer: &str) {
        if let Some((_, message @ None)) = self.conversation.messages.last_mut() {
            *message = Some(answer.trim().to_string());
        }
    }

    /// The transcript as `role: message` blocks.
    pub fn history(&self) -> String {
        self.conversation
            .messages
            .iter()
            .map(|(role, message)| format!("{role}: {}", message.as_deref().unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn clear(&mut self, keep_results: bool) {
        self.conversation.messages.clear();
        self.conversation.system.clear();
        if !keep_results {
            self.results.clear();
        }
    }
}
