//! Prompter that asks on the terminal.

use async_trait::async_trait;
use log::debug;
use supervisor::Prompter;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Stdin};
use tokio::sync::Mutex;

/// Prints the question and numbered choices to stderr and reads the answer
/// from stdin. An empty line, end of input or an out-of-range number
/// dismisses the prompt.
pub struct TerminalPrompter<R = Stdin> {
    // One question at a time; the reader keeps any input buffered past the
    // current answer for the next prompt.
    input: Mutex<BufReader<R>>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self::with_input(tokio::io::stdin())
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: AsyncRead + Unpin> TerminalPrompter<R> {
    /// Read answers from `input` instead of stdin.
    pub fn with_input(input: R) -> Self {
        Self {
            input: Mutex::new(BufReader::new(input)),
        }
    }
}

/// Map a typed answer to a choice index. Accepts the 1-based number or the
/// label itself, case-insensitively.
pub fn parse_answer(answer: &str, choices: &[&str]) -> Option<usize> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    if let Ok(n) = answer.parse::<usize>() {
        return n.checked_sub(1).filter(|i| *i < choices.len());
    }
    choices
        .iter()
        .position(|choice| choice.eq_ignore_ascii_case(answer))
}

#[async_trait]
impl<R> Prompter for TerminalPrompter<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn choose(&self, message: &str, choices: &[&str]) -> Option<usize> {
        let mut input = self.input.lock().await;
        eprintln!("{}", message);
        for (i, choice) in choices.iter().enumerate() {
            eprintln!("  {}) {}", i + 1, choice);
        }
        eprint!("Choice (enter to dismiss): ");

        let mut line = String::new();
        match input.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => parse_answer(&line, choices),
            Err(e) => {
                debug!("[prompt] Failed to read answer: {}", e);
                None
            }
        }
    }
}
