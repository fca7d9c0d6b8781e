//! Dialect translation. The Anthropic messages dialect is the pivot: every
//! upstream response shape converts into it, and every inbound dialect
//! renders from it, so each backend needs one converter pair instead of a
//! full matrix.

pub mod claude_gemini;
pub mod claude_openai;
