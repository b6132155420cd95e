//! Seam for asking the user to pick an action.
//!
//! The watchdog and the invalid-session flow never act on their own; they
//! ask through a [`Prompter`] owned by the UI layer.

use async_trait::async_trait;
use log::info;

/// Presents a message with labelled actions.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Returns the index of the chosen action, or `None` if dismissed.
    async fn choose(&self, message: &str, choices: &[&str]) -> Option<usize>;
}

/// Prompter for headless use: logs the question and dismisses it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DismissPrompter;

#[async_trait]
impl Prompter for DismissPrompter {
    async fn choose(&self, message: &str, choices: &[&str]) -> Option<usize> {
        info!("[prompt] {} ({}) -> dismissed", message, choices.join(" / "));
        None
    }
}

/// Prompter that always picks the same choice. Useful for unattended hosts
/// that should, for example, always restart.
#[derive(Debug, Clone)]
pub struct FixedPrompter {
    label: String,
}

impl FixedPrompter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Prompter for FixedPrompter {
    async fn choose(&self, message: &str, choices: &[&str]) -> Option<usize> {
        let choice = choices.iter().position(|c| *c == self.label);
        info!("[prompt] {} -> {:?}", message, choice.map(|i| choices[i]));
        choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dismiss() {
        assert_eq!(DismissPrompter.choose("q", &["a", "b"]).await, None);
    }

    #[tokio::test]
    async fn test_fixed_choice() {
        let prompter = FixedPrompter::new("Restart");
        assert_eq!(prompter.choose("q", &["Restart", "Ignore"]).await, Some(0));
        assert_eq!(prompter.choose("q", &["Reconnect"]).await, None);
    }
}
