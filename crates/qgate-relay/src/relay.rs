use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use qgate_common::RelaySettings;

use crate::adapter::{AdapterRegistry, Usage};
use crate::channel::Channel;
use crate::error::{apply_status_code_remap, normalize_upstream_error, RelayError};
use crate::info::{InboundRequest, RelayInfo};
use crate::ledger::{QuotaLedger, Reservation, SharedUsageSink, UsageRecord};
use crate::pricing::{PriceData, PricingOracle};
use crate::sink::ClientSink;
use crate::thinking::{apply_thinking_transform, parse_thinking_suffix};
use crate::token::TokenCounter;

pub struct RelayDeps {
    pub settings: Arc<ArcSwap<RelaySettings>>,
    pub counter: Arc<dyn TokenCounter>,
    pub pricing: Arc<PricingOracle>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub registry: Arc<AdapterRegistry>,
    pub usage_sink: SharedUsageSink,
}

/// Drives one request through the pipeline:
/// validate → map model → count → price → reserve → adapter → convert →
/// upstream call → inspect status → respond → settle.
///
/// Every early return after the reservation releases it; the
/// [`Reservation`] drop backstop covers anything that slips through.
pub struct Relay {
    deps: RelayDeps,
}

impl Relay {
    pub fn new(deps: RelayDeps) -> Self {
        Self { deps }
    }

    pub async fn relay(
        &self,
        channel: &Channel,
        mut info: RelayInfo,
        mut inbound: InboundRequest,
        sink: &mut dyn ClientSink,
    ) -> Result<(), RelayError> {
        let settings = self.deps.settings.load_full();

        validate(&inbound)?;
        if inbound.wants_stream() {
            info.promote_stream();
        }
        info!(
            event = "relay_started",
            trace_id = %info.trace_id,
            user_id = info.user_id,
            channel_id = info.channel_id,
            model = %info.origin_model_name,
            messages = inbound.message_count(),
            is_stream = info.is_stream(),
        );

        self.map_model(channel, &settings, &mut info, &mut inbound)?;
        substitute_default_max_tokens(channel, &settings, &info, &mut inbound);
        if let InboundRequest::ClaudeMessages(request) = &mut inbound {
            apply_thinking_transform(
                request,
                info.thinking,
                settings.thinking_adapter_budget_tokens_percentage,
            );
        }

        let prompt_tokens = self
            .deps
            .counter
            .count(&inbound, &info.upstream_model_name)?;
        info.prompt_tokens = prompt_tokens;

        let price = self.deps.pricing.price(
            &info.upstream_model_name,
            &info.group,
            prompt_tokens,
            inbound.max_completion_tokens(),
        )?;

        let (reserved, prior_balance) = self
            .deps
            .ledger
            .reserve(info.user_id, price.should_pre_consume_quota)
            .await?;
        info!(
            event = "quota_reserved",
            trace_id = %info.trace_id,
            user_id = info.user_id,
            reserved,
            prior_balance,
        );
        let reservation = Reservation::new(
            self.deps.ledger.clone(),
            info.user_id,
            reserved,
            info.trace_id.clone(),
        );

        match self
            .run_upstream(channel, &settings, &mut info, &inbound, sink)
            .await
        {
            Ok(usage) => {
                self.settle(&info, &price, reservation, usage).await?;
                Ok(())
            }
            Err(mut error) => {
                apply_status_code_remap(&mut error, channel.status_mapping());
                // Partial streams that already reported usage are billed for
                // what was produced; everything else refunds in full. A
                // ledger failure here is logged, not surfaced: the original
                // error is the one the client must see.
                let released = if let RelayError::ResponseFailed {
                    usage_so_far: Some(usage),
                    ..
                } = &error
                {
                    self.settle(&info, &price, reservation, Some(*usage)).await
                } else {
                    reservation.refund().await
                };
                if let Err(ledger_error) = released {
                    warn!(
                        event = "reservation_release_failed",
                        trace_id = %info.trace_id,
                        error = %ledger_error,
                    );
                }
                warn!(
                    event = "relay_failed",
                    trace_id = %info.trace_id,
                    code = error.code(),
                    status = error.status_code(),
                    local = error.is_local(),
                    error = %error,
                );
                Err(error)
            }
        }
    }

    fn map_model(
        &self,
        channel: &Channel,
        settings: &RelaySettings,
        info: &mut RelayInfo,
        inbound: &mut InboundRequest,
    ) -> Result<(), RelayError> {
        let mapped = channel.map_model(&info.origin_model_name).to_string();
        let (upstream, variant) = if settings.thinking_adapter_enabled {
            parse_thinking_suffix(&mapped)
        } else {
            (mapped.as_str(), crate::info::ThinkingVariant::None)
        };
        if upstream.is_empty() {
            return Err(RelayError::ModelMappingFailed(format!(
                "model {mapped:?} maps to an empty upstream name"
            )));
        }
        info.upstream_model_name = upstream.to_string();
        info.thinking = variant;
        match inbound {
            InboundRequest::ClaudeMessages(request) => {
                request.model = info.upstream_model_name.clone();
            }
            InboundRequest::ChatCompletions(request) => {
                request.model = info.upstream_model_name.clone();
            }
        }
        Ok(())
    }

    async fn run_upstream(
        &self,
        channel: &Channel,
        settings: &RelaySettings,
        info: &mut RelayInfo,
        inbound: &InboundRequest,
        sink: &mut dyn ClientSink,
    ) -> Result<Option<Usage>, RelayError> {
        let mut adapter = self
            .deps
            .registry
            .create(info.api_type)
            .ok_or(RelayError::InvalidApiType)?;
        adapter.init(info)?;

        let payload = adapter.convert_request(info, inbound)?;
        info!(
            event = "upstream_request",
            trace_id = %info.trace_id,
            channel = adapter.channel_name(),
            model = %info.upstream_model_name,
            payload_bytes = payload.len(),
            is_stream = info.is_stream(),
        );

        let response = adapter.do_request(info, payload).await?;
        if response.is_event_stream() {
            info.promote_stream();
        }
        info!(
            event = "upstream_response",
            trace_id = %info.trace_id,
            status = response.status,
            content_type = %response.content_type(),
            elapsed_ms = info.started_at.elapsed().as_millis(),
        );

        if response.status != 200 {
            let status = response.status;
            let body = response
                .collect_body()
                .await
                .map_err(|err| RelayError::response_failed(err.to_string()))?;
            // Remap is applied by the caller on every error path.
            return Err(normalize_upstream_error(status, &body, false));
        }

        if info.is_stream() {
            let limit = Duration::from_secs(settings.streaming_timeout_secs);
            match tokio::time::timeout(limit, adapter.do_response(info, response, sink)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::UpstreamTransport(format!(
                    "streaming read exceeded {}s",
                    limit.as_secs()
                ))),
            }
        } else {
            adapter.do_response(info, response, sink).await
        }
    }

    async fn settle(
        &self,
        info: &RelayInfo,
        price: &PriceData,
        reservation: Reservation,
        usage: Option<Usage>,
    ) -> Result<(), RelayError> {
        // Billing is lower-bounded by the counted prompt: an absent or
        // zero-valued usage settles as {counted, 0}, and a reported prompt
        // smaller than the pre-flight count is raised to it.
        let mut billed = match usage {
            Some(usage) if !usage.is_zero() => usage,
            _ => Usage::new(info.prompt_tokens, 0),
        };
        if billed.prompt_tokens < info.prompt_tokens {
            let raise = info.prompt_tokens - billed.prompt_tokens;
            billed.prompt_tokens = info.prompt_tokens;
            billed.total_tokens += raise;
        }

        let actual = price.quota_for_usage(&billed);
        let reserved = reservation.reserved();
        reservation.settle(actual).await?;

        info!(
            event = "quota_settled",
            trace_id = %info.trace_id,
            user_id = info.user_id,
            reserved,
            actual,
            prompt_tokens = billed.prompt_tokens,
            completion_tokens = billed.completion_tokens,
            elapsed_ms = info.started_at.elapsed().as_millis(),
        );
        self.deps.usage_sink.record(UsageRecord {
            trace_id: info.trace_id.clone(),
            user_id: info.user_id,
            key_id: info.key_id,
            channel_id: info.channel_id,
            model: info.origin_model_name.clone(),
            usage: billed,
            quota: actual,
            is_stream: info.is_stream(),
            elapsed_ms: info.started_at.elapsed().as_millis(),
        });
        Ok(())
    }
}

fn validate(inbound: &InboundRequest) -> Result<(), RelayError> {
    if inbound.model().is_empty() {
        return Err(RelayError::InvalidRequest(
            "field model is required".to_string(),
        ));
    }
    if inbound.message_count() == 0 {
        return Err(RelayError::InvalidRequest(
            "field messages is required".to_string(),
        ));
    }
    Ok(())
}

fn substitute_default_max_tokens(
    channel: &Channel,
    settings: &RelaySettings,
    info: &RelayInfo,
    inbound: &mut InboundRequest,
) {
    let InboundRequest::ClaudeMessages(request) = inbound else {
        return;
    };
    if request.max_tokens != 0 {
        return;
    }
    request.max_tokens = channel
        .default_max_tokens
        .get(&info.upstream_model_name)
        .copied()
        .unwrap_or_else(|| settings.default_max_tokens_for(&info.upstream_model_name));
}
