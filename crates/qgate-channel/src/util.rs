use qgate_relay::{RelayInfo, RelayMode};

use crate::streaming::InboundDialect;

pub(crate) fn inbound_dialect(info: &RelayInfo) -> InboundDialect {
    match info.relay_mode {
        RelayMode::ClaudeMessages => InboundDialect::Claude,
        _ => InboundDialect::OpenAiChat,
    }
}
