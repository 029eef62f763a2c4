use crate::engine::StopSequences;

const CONTEXT_PLACEHOLDER: &str = "{context}";
const USER_PLACEHOLDER: &str = "{user}";
const ASSISTANT_PLACEHOLDER: &str = "{assistant}";

/// A system-prompt template with slots for retrieved contexts.
///
/// `{context}` is replaced by the contexts joined with a blank line. `{user}` and
/// `{assistant}` are replaced by the conversation's role names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPrompt {
    template: String,
}

impl ContextPrompt {
    pub fn new<S: Into<String>>(template: S) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Answer from the retrieved contexts only.
    pub fn zero_shot() -> Self {
        Self::new(
            "Use the following pieces of context to answer the {user}'s question. \
             If the answer is not in the context, say that you don't know.\n\n{context}",
        )
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render<S: AsRef<str>>(&self, contexts: &[S], roles: &(String, String)) -> String {
        let context = contexts
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("\n\n");
        self.template
            .replace(USER_PLACEHOLDER, &roles.0)
            .replace(ASSISTANT_PLACEHOLDER, &roles.1)
            .replace(CONTEXT_PLACEHOLDER, &context)
    }
}

impl Default for ContextPrompt {
    fn default() -> Self {
        Self::zero_shot()
    }
}

/// A chat transcript rendered into a single generation prompt.
///
/// An unanswered turn is stored as `None` and rendered as a bare `"{role}:"`, which
/// is where the model picks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub system: String,

    /// (user, assistant)
    pub roles: (String, String),
    pub messages: Vec<(String, Option<String>)>,
    pub separator: String,

    /// Sequences that mark the end of the assistant's turn
    pub stop: StopSequences,
}

impl Conversation {
    pub fn new<U: Into<String>, A: Into<String>>(user: U, assistant: A) -> Self {
        Self {
            system: String::new(),
            roles: (user.into(), assistant.into()),
            messages: vec![],
            separator: "\n### ".into(),
            stop: StopSequences::from("###"),
        }
    }

    pub fn with_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_stop<S: Into<StopSequences>>(mut self, stop: S) -> Self {
        self.stop = stop.into();
        self
    }

    pub fn user(&self) -> &str {
        &self.roles.0
    }

    pub fn assistant(&self) -> &str {
        &self.roles.1
    }

    pub fn append_message<R: Into<String>>(&mut self, role: R, message: Option<String>) {
        self.messages.push((role.into(), message));
    }

    pub fn get_prompt(&self) -> String {
        let mut prompt = self.system.clone();
        prompt.push_str(&self.separator);
        for (role, message) in &self.messages {
            match message {
                Some(message) => {
                    prompt.push_str(role);
                    prompt.push_str(": ");
                    prompt.push_str(message);
                    prompt.push_str(&self.separator);
                }
                None => {
                    prompt.push_str(role);
                    prompt.push(':');
                }
            }
        }
        prompt
    }
}
