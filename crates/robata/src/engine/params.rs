use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_MAX_NEW_TOKENS: usize = 256;

fn default_max_new_tokens() -> usize {
    DEFAULT_MAX_NEW_TOKENS
}

/// # GenerationParams
///
/// Parameters accompanying a prompt through every engine.
///
/// The three fields every engine understands are named; anything else an engine
/// may care about (`temperature`, `top_p`, `repetition_penalty`, ...) lives in
/// `extra` and is forwarded untouched. When serialized, `extra` is flattened
/// next to the named fields.
///
/// ```rust
/// use robata::engine::GenerationParams;
///
/// let params = GenerationParams::default()
///     .with_max_new_tokens(64)
///     .with_stop(vec!["###", "</s>"])
///     .with_param("temperature", 0.7);
///
/// assert_eq!(params.stop.as_slice(), ["###", "</s>"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Upper bound on the number of generated tokens
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Whether the prompt is part of the visible output
    #[serde(default)]
    pub echo_prompt: bool,

    /// Sequences that end generation when produced
    #[serde(default)]
    pub stop: StopSequences,

    /// Engine-specific parameters, passed through unmodified
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            echo_prompt: false,
            stop: StopSequences::default(),
            extra: Map::new(),
        }
    }
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_echo_prompt(mut self, echo_prompt: bool) -> Self {
        self.echo_prompt = echo_prompt;
        self
    }

    pub fn with_stop<S: Into<StopSequences>>(mut self, stop: S) -> Self {
        self.stop = stop.into();
        self
    }

    /// Sets a free-form parameter, replacing any previous value under `key`.
    pub fn with_param<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Stop sequences, always held as a list.
///
/// A single string and a list of strings are both accepted on input. Empty
/// strings are discarded, since an empty stop sequence would match everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StopInput", into = "Vec<String>")]
pub struct StopSequences(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum StopInput {
    One(String),
    Many(Vec<String>),
}

impl From<StopInput> for StopSequences {
    fn from(input: StopInput) -> Self {
        match input {
            StopInput::One(stop) => Self::new(vec![stop]),
            StopInput::Many(stops) => Self::new(stops),
        }
    }
}

impl From<StopSequences> for Vec<String> {
    fn from(stops: StopSequences) -> Self {
        stops.0
    }
}

impl StopSequences {
    pub fn new<I, S>(stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            stops
                .into_iter()
                .map(Into::into)
                .filter(|stop: &String| !stop.is_empty())
                .collect(),
        )
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for StopSequences {
    fn from(stop: &str) -> Self {
        Self::new([stop])
    }
}

impl From<String> for StopSequences {
    fn from(stop: String) -> Self {
        Self::new([stop])
    }
}

impl From<Vec<String>> for StopSequences {
    fn from(stops: Vec<String>) -> Self {
        Self::new(stops)
    }
}

impl From<Vec<&str>> for StopSequences {
    fn from(stops: Vec<&str>) -> Self {
        Self::new(stops)
    }
}
