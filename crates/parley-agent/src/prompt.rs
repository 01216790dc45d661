//! System prompt and context window for a persona.

use parley_core::session::{Message, Role};
use parley_core::types::BotConfig;
use parley_providers::ChatMessage;

/// Build the persona system prompt.
pub fn build_system_prompt(bot: &BotConfig) -> String {
    let mut parts = Vec::new();

    parts.push(format!(
        "You are {}, an AI voice assistant.",
        bot.display_name()
    ));

    if !bot.persona.trim().is_empty() {
        parts.push(format!("Personality: {}", bot.persona.trim()));
    }

    parts.push(
        "Your replies are spoken aloud. Keep them concise and natural, usually 1-3 sentences. \
         Do not use markdown, lists, emoji, or code formatting."
            .to_string(),
    );

    parts.join("\n\n")
}

/// Model context: the last `window` messages of `history`, then the new user text.
pub fn build_messages(history: &[Message], window: usize, user_text: &str) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(window);
    let mut messages: Vec<ChatMessage> = history[start..]
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    // A window can open on an assistant turn; providers expect the user first.
    while messages.first().is_some_and(|m| m.role == Role::Assistant) {
        messages.remove(0);
    }

    messages.push(ChatMessage::user(user_text));
    messages
}
