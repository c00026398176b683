//! Streaming inference support
//!
//! Handles token-by-token streaming output from the session worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::error::{InferenceError, Result};

/// Message sent from the worker for each step of a generation
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// A piece of generated text
    Token(String),
    /// Generation completed successfully
    Done,
    /// Generation failed
    Error(InferenceError),
}

/// Lazy, cancellable sequence of generated text.
///
/// Dropping the stream stops production after the current decode step.
pub struct TokenStream {
    rx: Receiver<StreamToken>,
    stop_signal: Arc<AtomicBool>,
    finished: bool,
}

impl TokenStream {
    pub(crate) fn new(rx: Receiver<StreamToken>, stop_signal: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            stop_signal,
            finished: false,
        }
    }

    /// Asks the worker to stop producing tokens
    pub fn cancel(&self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    /// Drains the stream into one string
    pub fn collect_text(self) -> Result<String> {
        self.collect()
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.rx.recv() {
            Ok(StreamToken::Token(s)) => Some(Ok(s)),
            Ok(StreamToken::Done) => {
                self.finished = true;
                None
            }
            Ok(StreamToken::Error(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            Err(_) => {
                self.finished = true;
                Some(Err(InferenceError::Worker(
                    "worker exited before finishing the stream".into(),
                )))
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Holds back bytes until they form complete UTF-8 characters
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    bytes: Vec<u8>,
}

impl Utf8Buffer {
    /// Adds bytes and returns whatever is now valid text
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.bytes.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.bytes) {
            Ok(_) => self.bytes.len(),
            // Truly invalid bytes are replaced; a truncated tail is kept
            Err(e) if e.error_len().is_some() => {
                let text = String::from_utf8_lossy(&self.bytes).into_owned();
                self.bytes.clear();
                return text;
            }
            Err(e) => e.valid_up_to(),
        };
        let rest = self.bytes.split_off(valid);
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes = rest;
        text
    }

    /// Returns any leftover bytes, lossily decoded
    pub fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes.clear();
        text
    }
}

/// Watches generated text for stop sequences.
///
/// Text that might be the start of a stop sequence is held back until it
/// either completes the sequence or is ruled out.
#[derive(Debug, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    held: String,
}

/// Result of feeding text to a [`StopMatcher`]
#[derive(Debug, PartialEq)]
pub enum StopCheck {
    /// Text safe to emit; generation continues
    Continue(String),
    /// A stop sequence was found; emit this text and end
    Stop(String),
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            held: String::new(),
        }
    }

    pub fn push(&mut self, text: &str) -> StopCheck {
        self.held.push_str(text);

        let first_stop = self
            .stops
            .iter()
            .filter_map(|stop| self.held.find(stop.as_str()))
            .min();
        if let Some(idx) = first_stop {
            let emit = self.held[..idx].to_string();
            self.held.clear();
            return StopCheck::Stop(emit);
        }

        let keep = self.partial_suffix_len();
        let split = self.held.len() - keep;
        let emit = self.held[..split].to_string();
        self.held.drain(..split);
        StopCheck::Continue(emit)
    }

    /// Releases held-back text at the end of generation
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    /// Length of the longest suffix of held text that starts some stop sequence
    fn partial_suffix_len(&self) -> usize {
        self.held
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.held[i..];
                self.stops.iter().any(|stop| stop.starts_with(tail))
            })
            .map_or(0, |i| self.held.len() - i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_token_stream_yields_until_done() {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        tx.send(StreamToken::Token("a".into())).unwrap();
        tx.send(StreamToken::Token("b".into())).unwrap();
        tx.send(StreamToken::Done).unwrap();
        tx.send(StreamToken::Token("ignored".into())).unwrap();

        let stream = TokenStream::new(rx, stop);
        assert_eq!(stream.collect_text().unwrap(), "ab");
    }

    #[test]
    fn test_token_stream_surfaces_error() {
        let (tx, rx) = mpsc::channel();
        tx.send(StreamToken::Token("a".into())).unwrap();
        tx.send(StreamToken::Error(InferenceError::VisionUnsupported)).unwrap();

        let mut stream = TokenStream::new(rx, Arc::new(AtomicBool::new(false)));
        assert_eq!(stream.next(), Some(Ok("a".into())));
        assert_eq!(stream.next(), Some(Err(InferenceError::VisionUnsupported)));
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn test_token_stream_reports_dead_worker() {
        let (tx, rx) = mpsc::channel::<StreamToken>();
        drop(tx);
        let mut stream = TokenStream::new(rx, Arc::new(AtomicBool::new(false)));
        assert!(matches!(stream.next(), Some(Err(InferenceError::Worker(_)))));
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn test_dropping_stream_raises_stop_signal() {
        let (_tx, rx) = mpsc::channel::<StreamToken>();
        let stop = Arc::new(AtomicBool::new(false));
        let stream = TokenStream::new(rx, stop.clone());
        drop(stream);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn test_utf8_buffer_joins_split_characters() {
        let mut buf = Utf8Buffer::default();
        let crab = "🦀".as_bytes();
        assert_eq!(buf.push(&crab[..2]), "");
        assert_eq!(buf.push(&crab[2..]), "🦀");
        assert_eq!(buf.push(b"ok"), "ok");
        assert_eq!(buf.flush(), "");
    }

    #[test]
    fn test_utf8_buffer_emits_valid_prefix() {
        let mut buf = Utf8Buffer::default();
        let e_acute = "é".as_bytes();
        let mut bytes = b"caf".to_vec();
        bytes.push(e_acute[0]);
        assert_eq!(buf.push(&bytes), "caf");
        assert_eq!(buf.push(&e_acute[1..]), "é");
    }

    #[test]
    fn test_stop_matcher_holds_partial_match() {
        let mut m = StopMatcher::new(&["</end>".to_string()]);
        assert_eq!(m.push("hello </"), StopCheck::Continue("hello ".into()));
        assert_eq!(m.push("en"), StopCheck::Continue(String::new()));
        assert_eq!(m.push("d> trailing"), StopCheck::Stop(String::new()));
    }

    #[test]
    fn test_stop_matcher_releases_false_alarm() {
        let mut m = StopMatcher::new(&["STOP".to_string()]);
        assert_eq!(m.push("ST"), StopCheck::Continue(String::new()));
        assert_eq!(m.push("ay"), StopCheck::Continue("STay".into()));
        assert_eq!(m.push("S"), StopCheck::Continue(String::new()));
        assert_eq!(m.finish(), "S");
    }

    #[test]
    fn test_stop_matcher_earliest_stop_wins() {
        let mut m = StopMatcher::new(&["b".to_string(), "a".to_string()]);
        assert_eq!(m.push("xxaxxb"), StopCheck::Stop("xx".into()));
    }

    #[test]
    fn test_stop_matcher_without_stops_passes_through() {
        let mut m = StopMatcher::new(&[]);
        assert_eq!(m.push("anything"), StopCheck::Continue("anything".into()));
    }
}
