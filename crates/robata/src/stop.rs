//! # Stop sequences and echo trimming
//!
//! Rules shared by every engine for deciding which part of generated text is
//! visible to the caller.
//!
//! A backend that streams cumulative text can end a frame in the middle of a stop
//! sequence: with stop sequence `"END"`, a frame may end in `"...wEN"`. Emitting
//! such a frame would let the partial stop sequence flicker into view and then
//! vanish. [`StopFilter`] withholds those frames until the ambiguity resolves.

use crate::engine::StopSequences;

/// Result of matching text against a set of stop sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMatch {
    /// Neither a stop sequence nor the start of one is present.
    None,

    /// The text ends with a non-empty proper prefix of a stop sequence.
    Partial,

    /// A complete stop sequence starts at this byte index. The earliest
    /// occurrence across all stop sequences wins.
    Full(usize),
}

/// Matches `text` against `stops`. A full match takes precedence over a partial one.
pub fn check_stop(text: &str, stops: &StopSequences) -> StopMatch {
    let full = stops.iter().filter_map(|stop| text.find(stop)).min();
    if let Some(index) = full {
        return StopMatch::Full(index);
    }

    let partial = stops.iter().any(|stop| {
        stop.char_indices()
            .skip(1)
            .any(|(end, _)| text.ends_with(&stop[..end]))
    });
    if partial {
        StopMatch::Partial
    } else {
        StopMatch::None
    }
}

/// Strips an echoed `prompt` from the front of `text` unless the caller asked for echo.
///
/// Only an exact string prefix is removed.
pub fn trim_echo<'a>(prompt: &str, text: &'a str, echo_prompt: bool) -> &'a str {
    if echo_prompt {
        return text;
    }
    text.strip_prefix(prompt).unwrap_or(text)
}

/// What a [`StopFilter`] decided about one observed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visible {
    /// Show this text.
    Emit(String),

    /// Hold this frame back; it may be the start of a stop sequence.
    Withhold,

    /// A stop sequence completed. Show the optional text, then end the stream.
    Stop(Option<String>),
}

/// Per-request gate applying stop-sequence suppression to cumulative frames.
#[derive(Debug, Clone)]
pub struct StopFilter {
    stops: StopSequences,
    last_emitted: Option<String>,
    withheld: Option<String>,
    stopped: bool,
}

impl StopFilter {
    pub fn new(stops: StopSequences) -> Self {
        Self {
            stops,
            last_emitted: None,
            withheld: None,
            stopped: false,
        }
    }

    /// Observes the visible text of the next cumulative frame.
    pub fn observe(&mut self, text: &str) -> Visible {
        if self.stopped {
            return Visible::Stop(None);
        }

        match check_stop(text, &self.stops) {
            StopMatch::Full(index) => {
                self.stopped = true;
                self.withheld = None;
                let truncated = &text[..index];
                if self.last_emitted.as_deref() == Some(truncated) || truncated.is_empty() {
                    Visible::Stop(None)
                } else {
                    self.last_emitted = Some(truncated.to_string());
                    Visible::Stop(Some(truncated.to_string()))
                }
            }
            StopMatch::Partial => {
                self.withheld = Some(text.to_string());
                Visible::Withhold
            }
            StopMatch::None => {
                self.withheld = None;
                self.last_emitted = Some(text.to_string());
                Visible::Emit(text.to_string())
            }
        }
    }

    /// Called once the upstream ended. A frame still withheld at that point never
    /// became a stop sequence, so it is released.
    pub fn finish(&mut self) -> Option<String> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        let withheld = self.withheld.take()?;
        self.last_emitted = Some(withheld.clone());
        Some(withheld)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
