use super::events::{Message, MessageKind, Payload};

/// Action words that mark a message as a trading signal even when the
/// producer did not tag it. Matching is case-sensitive: "BUY" is a signal,
/// "buy" in ordinary prose is not. The last two are the localized nouns for
/// "buy" and "sell".
pub const SIGNAL_TOKENS: &[&str] = &["BUY", "SELL", "OPEN", "매수", "매도"];

/// Whether `message` should trigger an alert.
///
/// Tagged signals always qualify; otherwise the text is scanned for
/// [`SIGNAL_TOKENS`]. False positives are acceptable.
pub fn classify(message: &Message) -> bool {
    match (message.kind, &message.payload) {
        (MessageKind::Signal, _) => true,
        (_, Payload::Text(text)) => contains_signal_token(text),
        // Attachments carry no text; a file named "BUY.png" is not an
        // instruction.
        (_, Payload::Attachment(_)) => false,
    }
}

pub fn contains_signal_token(text: &str) -> bool {
    SIGNAL_TOKENS.iter().any(|token| text.contains(token))
}
